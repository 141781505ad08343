use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use rusqlite::Connection;
use std::thread;
use std::time::{Duration, Instant};
use study_scheduler::{
    AuditAction, AuditLog, AuditQuery, NewAuditEntry, NewTask, PersistenceError, Policy,
    PolicySettings, PolicyStore, RescheduleError, Rescheduler, SqliteStore, TaskCategory,
    TaskLedger, TaskStatus,
};
use tempfile::TempDir;

fn d(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn temp_store() -> (TempDir, SqliteStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(dir.path().join("tasks.db")).unwrap();
    (dir, store)
}

#[test]
fn inserted_task_reads_back_with_defaults() {
    let (_dir, store) = temp_store();
    let id = store
        .write(|repo| repo.insert_task(&NewTask::subject(7, d(2025, 3, 3), "Chemistry", "Titration")))
        .unwrap();

    let task = store.read(|repo| repo.task(id)).unwrap().unwrap();
    assert_eq!(task.student_id, 7);
    assert_eq!(task.category, TaskCategory::subject("Chemistry"));
    assert_eq!(task.status, TaskStatus::Normal);
    assert_eq!(task.original_date, d(2025, 3, 3));
    assert!(!task.completed);
    assert_eq!(task.defer_reason, None);
}

#[test]
fn reopening_an_existing_database_keeps_its_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");
    let id = {
        let store = SqliteStore::open(&path).unwrap();
        store
            .write(|repo| repo.insert_task(&NewTask::rest_day(1, d(2025, 3, 9))))
            .unwrap()
    };

    let store = SqliteStore::open(&path).unwrap();
    let task = store.read(|repo| repo.task(id)).unwrap().unwrap();
    assert_eq!(task.category, TaskCategory::Rest);
}

#[test]
fn work_task_cannot_be_added_to_a_rest_day() {
    let (_dir, store) = temp_store();
    store
        .write(|repo| repo.insert_task(&NewTask::rest_day(1, d(2025, 3, 8))))
        .unwrap();

    let err = store
        .write(|repo| repo.insert_task(&NewTask::subject(1, d(2025, 3, 8), "Art", "Sketch")))
        .unwrap_err();
    assert!(matches!(err, PersistenceError::InvalidData(_)), "{err:?}");

    // Another student's rest day does not block this one.
    store
        .write(|repo| repo.insert_task(&NewTask::subject(2, d(2025, 3, 8), "Art", "Sketch")))
        .unwrap();
}

#[test]
fn reassigned_task_keeps_its_earlier_original_date() {
    let (_dir, store) = temp_store();
    let task = NewTask::subject(1, d(2025, 3, 5), "Maths", "Reassigned")
        .with_original_date(d(2025, 3, 1));
    let id = store.write(|repo| repo.insert_task(&task)).unwrap();

    let stored = store.read(|repo| repo.task(id)).unwrap().unwrap();
    assert_eq!(stored.original_date, d(2025, 3, 1));
    assert!(stored.has_moved());

    let backwards = NewTask::subject(1, d(2025, 3, 5), "Maths", "Future")
        .with_original_date(d(2025, 3, 9));
    let err = store.write(|repo| repo.insert_task(&backwards)).unwrap_err();
    assert!(matches!(err, PersistenceError::InvalidData(_)));
}

#[test]
fn blank_title_is_rejected() {
    let (_dir, store) = temp_store();
    let err = store
        .write(|repo| repo.insert_task(&NewTask::subject(1, d(2025, 3, 3), "Art", "   ")))
        .unwrap_err();
    assert!(matches!(err, PersistenceError::InvalidData(_)));
}

#[test]
fn subject_named_like_a_marker_is_rejected() {
    let (_dir, store) = temp_store();
    let day = d(2025, 3, 3);
    store
        .write(|repo| repo.insert_task(&NewTask::subject(1, day, "Maths", "Fractions")))
        .unwrap();

    for name in ["rest", " leave", "Rest"] {
        let err = store
            .write(|repo| repo.insert_task(&NewTask::subject(1, day, name, "notes")))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::InvalidData(_)), "{name:?}: {err:?}");
    }
    assert!(store.read(|repo| repo.non_work_dates(1, day, day)).unwrap().is_empty());

    let outcome = Rescheduler::new(store).reschedule(1, day).unwrap();
    assert_eq!(outcome.moved.len(), 1);
}

#[test]
fn subject_name_is_stored_trimmed() {
    let (_dir, store) = temp_store();
    let task = NewTask {
        category: TaskCategory::Subject("  Physics ".to_string()),
        ..NewTask::subject(2, d(2025, 3, 3), "Physics", "Optics")
    };
    let id = store.write(|repo| repo.insert_task(&task)).unwrap();

    let stored = store.read(|repo| repo.task(id)).unwrap().unwrap();
    assert_eq!(stored.category, TaskCategory::subject("Physics"));
}

#[test]
fn non_work_dates_cover_rest_and_leave_only() {
    let (_dir, store) = temp_store();
    store
        .write(|repo| {
            repo.insert_task(&NewTask::rest_day(1, d(2025, 3, 4)))?;
            repo.insert_task(&NewTask::leave_day(1, d(2025, 3, 6)))?;
            repo.insert_task(&NewTask::subject(1, d(2025, 3, 5), "Music", "Scales"))?;
            repo.insert_task(&NewTask::rest_day(2, d(2025, 3, 5)))?;
            repo.insert_task(&NewTask::rest_day(1, d(2025, 3, 10)))
        })
        .unwrap();

    let dates = store
        .read(|repo| repo.non_work_dates(1, d(2025, 3, 4), d(2025, 3, 8)))
        .unwrap();
    assert_eq!(
        dates.into_iter().collect::<Vec<_>>(),
        vec![d(2025, 3, 4), d(2025, 3, 6)]
    );
}

#[test]
fn move_refuses_completed_tasks() {
    let (_dir, store) = temp_store();
    let id = store
        .write(|repo| {
            repo.insert_task(&NewTask::subject(1, d(2025, 3, 3), "Latin", "Declensions").completed())
        })
        .unwrap();

    let err = store
        .write(|repo| repo.move_task(id, d(2025, 3, 4), TaskStatus::CarriedOver, "manual"))
        .unwrap_err();
    assert!(matches!(err, PersistenceError::NotFound(_)));
    assert_eq!(store.read(|repo| repo.task(id)).unwrap().unwrap().date, d(2025, 3, 3));
}

#[test]
fn students_with_open_tasks_ignores_markers_and_completed_work() {
    let (_dir, store) = temp_store();
    let day = d(2025, 3, 3);
    store
        .write(|repo| {
            repo.insert_task(&NewTask::subject(3, day, "Maths", "Algebra"))?;
            repo.insert_task(&NewTask::subject(1, day, "Maths", "Geometry"))?;
            repo.insert_task(&NewTask::subject(2, day, "Maths", "Calculus").completed())?;
            repo.insert_task(&NewTask::leave_day(4, day))?;
            repo.insert_task(&NewTask::subject(5, d(2025, 3, 4), "Maths", "Tomorrow"))
        })
        .unwrap();

    let students = store.read(|repo| repo.students_with_open_tasks(day)).unwrap();
    assert_eq!(students, vec![1, 3]);
}

#[test]
fn missing_policy_falls_back_to_defaults() {
    let (_dir, store) = temp_store();
    let defaults = PolicySettings::default();

    let found = store.read(|repo| repo.find_policy(42)).unwrap();
    let effective = store.read(|repo| repo.policy_or(42, defaults)).unwrap();

    assert_eq!(found, None);
    assert_eq!(effective, Policy::default_for(42));
    assert_eq!(effective.daily_task_cap, 4);
    assert_eq!(effective.threshold, 3);
    assert_eq!(effective.horizon_days, 5);
    assert_eq!(effective.cutoff_time, NaiveTime::MIN);
}

#[test]
fn policy_upsert_replaces_previous_values() {
    let (_dir, store) = temp_store();
    let mut policy = Policy::default_for(5);
    store.write(|repo| repo.upsert_policy(&policy)).unwrap();

    policy.daily_task_cap = 6;
    policy.horizon_days = 10;
    policy.cutoff_time = NaiveTime::from_hms_opt(23, 0, 0).unwrap();
    store.write(|repo| repo.upsert_policy(&policy)).unwrap();

    assert_eq!(store.read(|repo| repo.find_policy(5)).unwrap(), Some(policy));
}

#[test]
fn invalid_policy_is_not_stored() {
    let (_dir, store) = temp_store();
    let mut policy = Policy::default_for(5);
    policy.threshold = 0;

    let err = store.write(|repo| repo.upsert_policy(&policy)).unwrap_err();
    assert!(matches!(err, PersistenceError::InvalidPolicy(_)));
    assert_eq!(store.read(|repo| repo.find_policy(5)).unwrap(), None);
}

#[test]
fn audit_query_filters_by_range_and_action() {
    let (_dir, store) = temp_store();
    let at = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
    let id = store
        .write(|repo| repo.insert_task(&NewTask::subject(1, d(2025, 3, 1), "Geo", "Map")))
        .unwrap();
    let task = store.read(|repo| repo.task(id)).unwrap().unwrap();

    store
        .write(|repo| {
            for day in 1..=5 {
                let mut moved = task.clone();
                moved.date = d(2025, 3, day);
                let action = if day % 2 == 0 {
                    AuditAction::Defer
                } else {
                    AuditAction::CarryOver
                };
                repo.append_audit(&NewAuditEntry::task_moved(
                    &moved,
                    d(2025, 3, day + 1),
                    action,
                    "test",
                    at,
                ))?;
            }
            repo.append_audit(&NewAuditEntry::midnight_summary(
                2,
                d(2025, 3, 2),
                d(2025, 3, 3),
                3,
                at,
            ))
        })
        .unwrap();

    let ranged = store
        .read(|repo| repo.query_audit(&AuditQuery::for_student(1).between(d(2025, 3, 2), d(2025, 3, 4))))
        .unwrap();
    let froms: Vec<_> = ranged.iter().map(|e| e.moved_from).collect();
    assert_eq!(froms, vec![d(2025, 3, 2), d(2025, 3, 3), d(2025, 3, 4)]);

    let defers = store
        .read(|repo| repo.query_audit(&AuditQuery::for_student(1).with_action(AuditAction::Defer)))
        .unwrap();
    assert_eq!(defers.len(), 2);

    let mut limited = AuditQuery::for_student(1);
    limited.limit = Some(1);
    let first = store.read(|repo| repo.query_audit(&limited)).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].moved_from, d(2025, 3, 1));
    assert_eq!(first[0].title.as_deref(), Some("Map"));

    let other = store
        .read(|repo| repo.query_audit(&AuditQuery::for_student(2)))
        .unwrap();
    assert_eq!(other.len(), 1);
    assert_eq!(other[0].task_id, None);
    assert_eq!(other[0].action, AuditAction::MidnightProcess);
}

#[test]
fn audit_rows_cannot_be_rewritten_or_deleted() {
    let (_dir, store) = temp_store();
    let at = Utc.with_ymd_and_hms(2025, 3, 4, 0, 0, 0).unwrap();
    store
        .write(|repo| {
            repo.append_audit(&NewAuditEntry::midnight_summary(1, d(2025, 3, 3), d(2025, 3, 4), 3, at))
        })
        .unwrap();

    let conn = Connection::open(store.path()).unwrap();
    let update = conn.execute("UPDATE audit_log SET reason = 'edited'", []);
    let delete = conn.execute("DELETE FROM audit_log", []);
    assert!(update.is_err());
    assert!(delete.is_err());

    let entries = store
        .read(|repo| repo.query_audit(&AuditQuery::for_student(1)))
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_ne!(entries[0].reason, "edited");
}

#[test]
fn removing_a_task_leaves_a_delete_entry() {
    let (_dir, store) = temp_store();
    let id = store
        .write(|repo| repo.insert_task(&NewTask::subject(1, d(2025, 3, 3), "Drama", "Lines")))
        .unwrap();

    let removed = store.remove_task(id, "assigned by mistake").unwrap();
    assert_eq!(removed.id, id);
    assert_eq!(store.read(|repo| repo.task(id)).unwrap(), None);

    let entries = store
        .read(|repo| repo.query_audit(&AuditQuery::for_student(1)))
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, AuditAction::Delete);
    assert_eq!(entries[0].task_id, Some(id));
    assert_eq!(entries[0].moved_from, d(2025, 3, 3));
    assert_eq!(entries[0].moved_to, None);
    assert_eq!(entries[0].reason, "assigned by mistake");

    let missing = store.remove_task(id, "again").unwrap_err();
    assert!(matches!(missing, PersistenceError::NotFound(_)));
}

#[test]
fn failed_write_rolls_back_earlier_statements() {
    let (_dir, store) = temp_store();
    let result: Result<(), PersistenceError> = store.write(|repo| {
        repo.insert_task(&NewTask::subject(1, d(2025, 3, 3), "Maths", "Kept?"))?;
        Err(PersistenceError::InvalidData("abort".into()))
    });
    assert!(result.is_err());

    let tasks = store.read(|repo| repo.tasks_on(1, d(2025, 3, 3))).unwrap();
    assert!(tasks.is_empty());
}

#[test]
fn held_write_lock_surfaces_as_transaction_conflict() {
    let (_dir, store) = temp_store();
    store
        .write(|repo| repo.insert_task(&NewTask::subject(1, d(2025, 3, 3), "Maths", "Blocked")))
        .unwrap();
    let engine = Rescheduler::new(store.with_busy_timeout(Duration::from_millis(50)));

    let blocker = Connection::open(engine.store().path()).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();

    let err = engine.reschedule(1, d(2025, 3, 3)).unwrap_err();
    assert!(
        matches!(err, RescheduleError::TransactionConflict { student_id: 1, .. }),
        "{err:?}"
    );

    blocker.execute_batch("ROLLBACK;").unwrap();
    let outcome = engine.reschedule(1, d(2025, 3, 3)).unwrap();
    assert_eq!(outcome.moved.len(), 1);
}

#[test]
fn write_lock_released_during_first_attempt_is_retried() {
    let (_dir, store) = temp_store();
    store
        .write(|repo| repo.insert_task(&NewTask::subject(1, d(2025, 3, 3), "Maths", "Contended")))
        .unwrap();
    let busy_timeout = Duration::from_millis(300);
    let engine = Rescheduler::new(store.with_busy_timeout(busy_timeout));

    let blocker = Connection::open(engine.store().path()).unwrap();
    blocker.execute_batch("BEGIN IMMEDIATE;").unwrap();
    let started = Instant::now();
    // Released after the first attempt gives up, inside the second one's wait.
    let release = thread::spawn(move || {
        thread::sleep(Duration::from_millis(450));
        blocker.execute_batch("ROLLBACK;").unwrap();
    });

    let outcome = engine.reschedule(1, d(2025, 3, 3)).unwrap();
    release.join().unwrap();

    assert!(started.elapsed() >= busy_timeout);
    assert_eq!(outcome.moved.len(), 1);
    assert_eq!(outcome.destination, Some(d(2025, 3, 4)));
    let entries = engine
        .store()
        .read(|repo| repo.query_audit(&AuditQuery::for_student(1)))
        .unwrap();
    assert_eq!(entries.len(), 1);
}
