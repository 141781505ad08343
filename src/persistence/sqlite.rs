use super::{AuditLog, PersistenceError, PersistenceResult, PolicyStore, TaskLedger};
use crate::audit::{AuditAction, AuditEntry, AuditQuery, CloseoutRecord, NewAuditEntry};
use crate::policy::Policy;
use crate::task::{NewTask, StudentId, Task, TaskCategory, TaskId, TaskStatus};
use crate::task_validation;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const TASK_COLUMNS: &str =
    "id, student_id, date, category, title, completed, status, original_date, defer_reason";

const AUDIT_COLUMNS: &str = "id, student_id, task_id, category, title, original_date, \
     moved_from, moved_to, action, reason, created_at";

/// SQLite-backed store. Each unit of work opens its own connection, so
/// independent students can be processed from several threads; writers are
/// serialized by SQLite itself.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> PersistenceResult<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        };
        let connection = store.connect()?;
        Self::initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> PersistenceResult<Connection> {
        let connection = Connection::open(&self.path)?;
        connection.busy_timeout(self.busy_timeout)?;
        Ok(connection)
    }

    fn initialize_schema(connection: &Connection) -> PersistenceResult<()> {
        let mode: String =
            connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "initialized task store schema");

        let ddl = r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id INTEGER NOT NULL,
                date TEXT NOT NULL,
                category TEXT NOT NULL,
                title TEXT NOT NULL,
                completed INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'normal',
                original_date TEXT NOT NULL,
                defer_reason TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_student_date ON tasks (student_id, date);

            CREATE TABLE IF NOT EXISTS policies (
                student_id INTEGER PRIMARY KEY,
                daily_task_cap INTEGER NOT NULL CHECK (daily_task_cap >= 1),
                threshold INTEGER NOT NULL CHECK (threshold >= 1),
                horizon_days INTEGER NOT NULL CHECK (horizon_days >= 1),
                cutoff_time TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id INTEGER NOT NULL,
                task_id INTEGER,
                category TEXT,
                title TEXT,
                original_date TEXT,
                moved_from TEXT NOT NULL,
                moved_to TEXT,
                action TEXT NOT NULL,
                reason TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_student_from ON audit_log (student_id, moved_from);

            CREATE TRIGGER IF NOT EXISTS audit_log_no_update
            BEFORE UPDATE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit_log is append-only');
            END;
            CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
            BEFORE DELETE ON audit_log
            BEGIN
                SELECT RAISE(ABORT, 'audit_log is append-only');
            END;

            CREATE TABLE IF NOT EXISTS closeouts (
                student_id INTEGER NOT NULL,
                date TEXT NOT NULL,
                action TEXT NOT NULL,
                tasks_moved INTEGER NOT NULL,
                destination TEXT NOT NULL,
                processed_at TEXT NOT NULL,
                PRIMARY KEY (student_id, date)
            );
        "#;
        connection.execute_batch(ddl)?;
        Ok(())
    }

    /// Runs `f` outside an explicit transaction.
    pub fn read<T, F>(&self, f: F) -> PersistenceResult<T>
    where
        F: FnOnce(&SqliteRepo<'_>) -> PersistenceResult<T>,
    {
        let connection = self.connect()?;
        f(&SqliteRepo::new(&connection))
    }

    /// Runs `f` inside one `BEGIN IMMEDIATE` transaction. The write lock is
    /// taken up front, so a concurrent writer shows up as
    /// [`PersistenceError::Busy`] before anything is read. Any error rolls
    /// the whole unit back.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<PersistenceError>,
        F: FnOnce(&SqliteRepo<'_>) -> Result<T, E>,
    {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(PersistenceError::from)?;
        let value = f(&SqliteRepo::new(&tx))?;
        tx.commit().map_err(PersistenceError::from)?;
        Ok(value)
    }

    /// Administrative removal of a task, audited as `delete`.
    pub fn remove_task(&self, id: TaskId, reason: &str) -> PersistenceResult<Task> {
        self.write(|repo| {
            let task = repo
                .task(id)?
                .ok_or_else(|| PersistenceError::NotFound(format!("task {id}")))?;
            repo.delete_task(id)?;
            repo.append_audit(&NewAuditEntry::task_removed(&task, reason, Utc::now()))?;
            tracing::info!(
                task_id = id,
                student_id = task.student_id,
                date = %task.date,
                "task removed"
            );
            Ok(task)
        })
    }
}

/// Store operations bound to one connection or transaction.
pub struct SqliteRepo<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteRepo<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn query_tasks(&self, sql: &str, params: impl rusqlite::Params) -> PersistenceResult<Vec<Task>> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params, TaskRow::from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_task()?);
        }
        Ok(tasks)
    }
}

struct TaskRow {
    id: TaskId,
    student_id: StudentId,
    date: NaiveDate,
    category: String,
    title: String,
    completed: bool,
    status: String,
    original_date: NaiveDate,
    defer_reason: Option<String>,
}

impl TaskRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            student_id: row.get(1)?,
            date: row.get(2)?,
            category: row.get(3)?,
            title: row.get(4)?,
            completed: row.get(5)?,
            status: row.get(6)?,
            original_date: row.get(7)?,
            defer_reason: row.get(8)?,
        })
    }

    fn into_task(self) -> PersistenceResult<Task> {
        let category: TaskCategory = self.category.parse().map_err(|err| {
            PersistenceError::InvalidData(format!("task {}: {err}", self.id))
        })?;
        let status: TaskStatus = self.status.parse().map_err(|err| {
            PersistenceError::InvalidData(format!("task {}: {err}", self.id))
        })?;
        let task = Task {
            id: self.id,
            student_id: self.student_id,
            date: self.date,
            category,
            title: self.title,
            completed: self.completed,
            status,
            original_date: self.original_date,
            defer_reason: self.defer_reason,
        };
        task_validation::validate_task(&task)?;
        Ok(task)
    }
}

impl TaskLedger for SqliteRepo<'_> {
    fn insert_task(&self, task: &NewTask) -> PersistenceResult<TaskId> {
        task_validation::validate_new_task(task)?;
        let existing = self.tasks_on(task.student_id, task.date)?;
        task_validation::validate_day_placement(task, &existing)?;

        self.conn.execute(
            "INSERT INTO tasks (student_id, date, category, title, completed, status, original_date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                task.student_id,
                task.date,
                task.category.as_str().trim(),
                task.title,
                task.completed,
                TaskStatus::Normal.as_str(),
                task.effective_original_date(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn task(&self, id: TaskId) -> PersistenceResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
        let row = self
            .conn
            .query_row(&sql, params![id], TaskRow::from_row)
            .optional()?;
        row.map(TaskRow::into_task).transpose()
    }

    fn tasks_on(&self, student_id: StudentId, date: NaiveDate) -> PersistenceResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE student_id = ?1 AND date = ?2 ORDER BY id ASC"
        );
        self.query_tasks(&sql, params![student_id, date])
    }

    fn open_tasks(&self, student_id: StudentId, date: NaiveDate) -> PersistenceResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE student_id = ?1 AND date = ?2 AND completed = 0
               AND category NOT IN (?3, ?4)
             ORDER BY id ASC"
        );
        self.query_tasks(
            &sql,
            params![student_id, date, TaskCategory::REST, TaskCategory::LEAVE],
        )
    }

    fn non_work_dates(
        &self,
        student_id: StudentId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> PersistenceResult<BTreeSet<NaiveDate>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT date FROM tasks
             WHERE student_id = ?1 AND date BETWEEN ?2 AND ?3 AND category IN (?4, ?5)",
        )?;
        let rows = stmt.query_map(
            params![student_id, start, end, TaskCategory::REST, TaskCategory::LEAVE],
            |row| row.get::<_, NaiveDate>(0),
        )?;
        let mut dates = BTreeSet::new();
        for date in rows {
            dates.insert(date?);
        }
        Ok(dates)
    }

    fn move_task(
        &self,
        id: TaskId,
        to: NaiveDate,
        status: TaskStatus,
        reason: &str,
    ) -> PersistenceResult<()> {
        let changed = self.conn.execute(
            "UPDATE tasks SET date = ?2, status = ?3, defer_reason = ?4
             WHERE id = ?1 AND completed = 0 AND category NOT IN (?5, ?6)",
            params![
                id,
                to,
                status.as_str(),
                reason,
                TaskCategory::REST,
                TaskCategory::LEAVE
            ],
        )?;
        if changed == 0 {
            return Err(PersistenceError::NotFound(format!("movable task {id}")));
        }
        Ok(())
    }

    fn set_completed(&self, id: TaskId, completed: bool) -> PersistenceResult<()> {
        let changed = self.conn.execute(
            "UPDATE tasks SET completed = ?2 WHERE id = ?1",
            params![id, completed],
        )?;
        if changed == 0 {
            return Err(PersistenceError::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    fn delete_task(&self, id: TaskId) -> PersistenceResult<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    fn students_with_open_tasks(&self, date: NaiveDate) -> PersistenceResult<Vec<StudentId>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT student_id FROM tasks
             WHERE date = ?1 AND completed = 0 AND category NOT IN (?2, ?3)
             ORDER BY student_id ASC",
        )?;
        let rows = stmt.query_map(
            params![date, TaskCategory::REST, TaskCategory::LEAVE],
            |row| row.get::<_, StudentId>(0),
        )?;
        let mut students = Vec::new();
        for student in rows {
            students.push(student?);
        }
        Ok(students)
    }
}

impl PolicyStore for SqliteRepo<'_> {
    fn find_policy(&self, student_id: StudentId) -> PersistenceResult<Option<Policy>> {
        let policy = self
            .conn
            .query_row(
                "SELECT student_id, daily_task_cap, threshold, horizon_days, cutoff_time
                 FROM policies WHERE student_id = ?1",
                params![student_id],
                |row| {
                    Ok(Policy {
                        student_id: row.get(0)?,
                        daily_task_cap: row.get(1)?,
                        threshold: row.get(2)?,
                        horizon_days: row.get(3)?,
                        cutoff_time: row.get::<_, NaiveTime>(4)?,
                    })
                },
            )
            .optional()?;
        Ok(policy)
    }

    fn upsert_policy(&self, policy: &Policy) -> PersistenceResult<()> {
        policy.validate()?;
        self.conn.execute(
            "INSERT INTO policies (student_id, daily_task_cap, threshold, horizon_days, cutoff_time)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (student_id) DO UPDATE SET
                daily_task_cap = excluded.daily_task_cap,
                threshold = excluded.threshold,
                horizon_days = excluded.horizon_days,
                cutoff_time = excluded.cutoff_time",
            params![
                policy.student_id,
                policy.daily_task_cap,
                policy.threshold,
                policy.horizon_days,
                policy.cutoff_time,
            ],
        )?;
        Ok(())
    }
}

struct AuditRow {
    id: i64,
    student_id: StudentId,
    task_id: Option<TaskId>,
    category: Option<String>,
    title: Option<String>,
    original_date: Option<NaiveDate>,
    moved_from: NaiveDate,
    moved_to: Option<NaiveDate>,
    action: String,
    reason: String,
    created_at: DateTime<Utc>,
}

impl AuditRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            student_id: row.get(1)?,
            task_id: row.get(2)?,
            category: row.get(3)?,
            title: row.get(4)?,
            original_date: row.get(5)?,
            moved_from: row.get(6)?,
            moved_to: row.get(7)?,
            action: row.get(8)?,
            reason: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    fn into_entry(self) -> PersistenceResult<AuditEntry> {
        let invalid = |err: String| PersistenceError::InvalidData(format!("audit {}: {err}", self.id));
        let category = match self.category.as_deref() {
            Some(raw) => Some(raw.parse::<TaskCategory>().map_err(invalid)?),
            None => None,
        };
        let action: AuditAction = self.action.parse().map_err(invalid)?;
        Ok(AuditEntry {
            id: self.id,
            student_id: self.student_id,
            task_id: self.task_id,
            category,
            title: self.title,
            original_date: self.original_date,
            moved_from: self.moved_from,
            moved_to: self.moved_to,
            action,
            reason: self.reason,
            created_at: self.created_at,
        })
    }
}

impl AuditLog for SqliteRepo<'_> {
    fn append_audit(&self, entry: &NewAuditEntry) -> PersistenceResult<i64> {
        self.conn.execute(
            "INSERT INTO audit_log (student_id, task_id, category, title, original_date,
                                    moved_from, moved_to, action, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.student_id,
                entry.task_id,
                entry.category.as_ref().map(TaskCategory::as_str),
                entry.title,
                entry.original_date,
                entry.moved_from,
                entry.moved_to,
                entry.action.as_str(),
                entry.reason,
                entry.created_at,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn query_audit(&self, query: &AuditQuery) -> PersistenceResult<Vec<AuditEntry>> {
        let mut conditions = vec!["student_id = ?1".to_string()];
        let mut values: Vec<rusqlite::types::Value> = vec![query.student_id.into()];

        if let Some(from) = query.from {
            values.push(from.to_string().into());
            conditions.push(format!("moved_from >= ?{}", values.len()));
        }
        if let Some(to) = query.to {
            values.push(to.to_string().into());
            conditions.push(format!("moved_from <= ?{}", values.len()));
        }
        if let Some(action) = query.action {
            values.push(action.as_str().to_string().into());
            conditions.push(format!("action = ?{}", values.len()));
        }

        let limit = query.limit.unwrap_or(1000);
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE {} ORDER BY id ASC LIMIT {limit}",
            conditions.join(" AND ")
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), AuditRow::from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    fn closeout(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> PersistenceResult<Option<CloseoutRecord>> {
        let raw = self
            .conn
            .query_row(
                "SELECT action, tasks_moved, destination, processed_at
                 FROM closeouts WHERE student_id = ?1 AND date = ?2",
                params![student_id, date],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, NaiveDate>(2)?,
                        row.get::<_, DateTime<Utc>>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((action, tasks_moved, destination, processed_at)) = raw else {
            return Ok(None);
        };
        let action: AuditAction = action.parse().map_err(PersistenceError::InvalidData)?;
        Ok(Some(CloseoutRecord {
            student_id,
            date,
            action,
            tasks_moved,
            destination,
            processed_at,
        }))
    }

    fn record_closeout(&self, record: &CloseoutRecord) -> PersistenceResult<()> {
        self.conn.execute(
            "INSERT INTO closeouts (student_id, date, action, tasks_moved, destination, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.student_id,
                record.date,
                record.action.as_str(),
                record.tasks_moved,
                record.destination,
                record.processed_at,
            ],
        )?;
        Ok(())
    }

    fn reopen_closeout(&self, student_id: StudentId, date: NaiveDate) -> PersistenceResult<bool> {
        let removed = self.conn.execute(
            "DELETE FROM closeouts WHERE student_id = ?1 AND date = ?2",
            params![student_id, date],
        )?;
        Ok(removed > 0)
    }
}
