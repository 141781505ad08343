//! Daily closeout of a student's open tasks.
//!
//! One invocation handles one (student, date) pair:
//!
//! ```text
//! Evaluate ─┬─ NoAction             (rest/leave day, already closed out, nothing open)
//!           ├─ IndividualCarryOver  (open count below threshold)
//!           └─ BlockDefer           (open count at or above threshold)
//!                 └─ Committed      (moves + audit rows + closeout marker, one transaction)
//! ```
//!
//! Moves are a single hop: tasks land on the next work date and stay there
//! until that date is closed out by its own invocation.

use crate::audit::{AuditAction, CloseoutRecord, NewAuditEntry};
use crate::calendar::{HorizonExceeded, ResolveError, WorkCalendarResolver};
use crate::persistence::{AuditLog, PersistenceError, PolicyStore, SqliteStore, TaskLedger};
use crate::policy::PolicySettings;
use crate::task::{StudentId, TaskId, TaskStatus};
use crate::task_validation;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// How many times a conflicting transaction is attempted in total.
const MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Error)]
pub enum RescheduleError {
    #[error(transparent)]
    HorizonExceeded(#[from] HorizonExceeded),
    #[error("tasks of student {student_id} were modified concurrently while closing out {date}")]
    TransactionConflict {
        student_id: StudentId,
        date: NaiveDate,
    },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl From<ResolveError> for RescheduleError {
    fn from(value: ResolveError) -> Self {
        match value {
            ResolveError::HorizonExceeded(err) => Self::HorizonExceeded(err),
            ResolveError::Persistence(err) => Self::Persistence(err),
        }
    }
}

impl RescheduleError {
    fn is_busy(&self) -> bool {
        matches!(self, RescheduleError::Persistence(err) if err.is_busy())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RescheduleAction {
    NoAction,
    IndividualCarryOver,
    BlockDefer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoActionReason {
    NonWorkDay,
    AlreadyProcessed,
    NothingOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleOutcome {
    pub student_id: StudentId,
    pub date: NaiveDate,
    pub action: RescheduleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<NoActionReason>,
    pub moved: Vec<TaskId>,
    pub destination: Option<NaiveDate>,
    /// Destination holds more tasks than the student's daily cap.
    #[serde(default)]
    pub over_cap: bool,
}

impl RescheduleOutcome {
    fn no_action(student_id: StudentId, date: NaiveDate, reason: NoActionReason) -> Self {
        Self {
            student_id,
            date,
            action: RescheduleAction::NoAction,
            reason: Some(reason),
            moved: Vec::new(),
            destination: None,
            over_cap: false,
        }
    }

    pub fn tasks_moved(&self) -> usize {
        self.moved.len()
    }

    pub fn to_cli_summary(&self) -> String {
        let mut parts = vec![
            format!("student={}", self.student_id),
            format!("date={}", self.date),
        ];
        match self.action {
            RescheduleAction::NoAction => {
                parts.push("action=none".to_string());
                if let Some(reason) = self.reason {
                    parts.push(format!("reason={reason:?}"));
                }
            }
            RescheduleAction::IndividualCarryOver => parts.push("action=carry_over".to_string()),
            RescheduleAction::BlockDefer => parts.push("action=defer".to_string()),
        }
        if !self.moved.is_empty() {
            parts.push(format!("moved={}", self.moved.len()));
        }
        if let Some(dest) = self.destination {
            parts.push(format!("to={dest}"));
        }
        if self.over_cap {
            parts.push("over_cap".to_string());
        }
        parts.join(", ")
    }
}

/// Per-student mutual exclusion inside one process.
#[derive(Default)]
struct StudentLocks {
    locks: Mutex<HashMap<StudentId, Arc<Mutex<()>>>>,
}

impl StudentLocks {
    /// Runs `f` while holding the student's lock. The entry is dropped
    /// again once no other caller is waiting on it.
    fn with_lock<T>(&self, student_id: StudentId, f: impl FnOnce() -> T) -> T {
        let lock = self.locks.lock().entry(student_id).or_default().clone();
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);

        let mut locks = self.locks.lock();
        if locks
            .get(&student_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(&student_id);
        }
        result
    }
}

/// Entry point for closing out a student's day.
pub struct Rescheduler {
    store: SqliteStore,
    defaults: PolicySettings,
    locks: StudentLocks,
}

impl Rescheduler {
    pub fn new(store: SqliteStore) -> Self {
        Self {
            store,
            defaults: PolicySettings::default(),
            locks: StudentLocks::default(),
        }
    }

    /// Settings used for students without a stored policy.
    pub fn with_default_policy(mut self, defaults: PolicySettings) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn default_policy(&self) -> PolicySettings {
        self.defaults
    }

    pub fn reschedule(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> Result<RescheduleOutcome, RescheduleError> {
        self.reschedule_at(student_id, date, Utc::now())
    }

    /// Same as [`reschedule`](Self::reschedule) with an explicit audit timestamp.
    #[instrument(skip(self, now))]
    pub fn reschedule_at(
        &self,
        student_id: StudentId,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<RescheduleOutcome, RescheduleError> {
        self.locks.with_lock(student_id, || {
            let mut attempt = 1;
            loop {
                let result = self
                    .store
                    .write(|repo| close_out(repo, student_id, date, self.defaults, now));
                match result {
                    Err(err) if err.is_busy() => {
                        if attempt >= MAX_ATTEMPTS {
                            return Err(RescheduleError::TransactionConflict { student_id, date });
                        }
                        warn!(attempt, error = %err, "closeout transaction conflicted; retrying");
                        attempt += 1;
                    }
                    Err(RescheduleError::HorizonExceeded(err)) => {
                        warn!(
                            error = %err,
                            "no work date within horizon; widen the horizon or clear stale leave"
                        );
                        return Err(err.into());
                    }
                    other => return other,
                }
            }
        })
    }
}

/// Evaluates and applies one closeout against an open transaction.
pub fn close_out<R>(
    repo: &R,
    student_id: StudentId,
    date: NaiveDate,
    defaults: PolicySettings,
    now: DateTime<Utc>,
) -> Result<RescheduleOutcome, RescheduleError>
where
    R: TaskLedger + PolicyStore + AuditLog,
{
    let resolver = WorkCalendarResolver::new(repo);

    if resolver.is_non_work_day(student_id, date)? {
        let tasks = repo.tasks_on(student_id, date)?;
        if task_validation::is_mixed_day(&tasks) {
            warn!(student_id, %date, "rest/leave day also holds work tasks; leaving it untouched");
        }
        debug!(student_id, %date, "non-work day; nothing to close out");
        return Ok(RescheduleOutcome::no_action(
            student_id,
            date,
            NoActionReason::NonWorkDay,
        ));
    }

    if let Some(record) = repo.closeout(student_id, date)? {
        debug!(
            student_id,
            %date,
            processed_at = %record.processed_at,
            "date already closed out"
        );
        return Ok(RescheduleOutcome::no_action(
            student_id,
            date,
            NoActionReason::AlreadyProcessed,
        ));
    }

    let open = repo.open_tasks(student_id, date)?;
    if open.is_empty() {
        return Ok(RescheduleOutcome::no_action(
            student_id,
            date,
            NoActionReason::NothingOpen,
        ));
    }

    let policy = repo.policy_or(student_id, defaults)?;
    let destination = resolver.next_work_date(student_id, date, policy.horizon_days)?;

    let count = open.len();
    let block = policy.is_block_defer(count);
    let (action, status, audit_action) = if block {
        (
            RescheduleAction::BlockDefer,
            TaskStatus::Deferred,
            AuditAction::Defer,
        )
    } else {
        (
            RescheduleAction::IndividualCarryOver,
            TaskStatus::CarriedOver,
            AuditAction::CarryOver,
        )
    };
    let reason = if block {
        format!(
            "deferred from {date}: {count} open task(s) met threshold {}",
            policy.threshold
        )
    } else {
        format!(
            "carried over from {date}: {count} open task(s) below threshold {}",
            policy.threshold
        )
    };

    let mut moved = Vec::with_capacity(count);
    for task in &open {
        repo.move_task(task.id, destination, status, &reason)?;
        repo.append_audit(&NewAuditEntry::task_moved(
            task,
            destination,
            audit_action,
            reason.as_str(),
            now,
        ))?;
        moved.push(task.id);
    }

    if block {
        repo.append_audit(&NewAuditEntry::midnight_summary(
            student_id,
            date,
            destination,
            count,
            now,
        ))?;
    }

    if repo.reopen_closeout(student_id, destination)? {
        info!(
            student_id,
            %destination,
            "destination was already closed out; reopened for the moved tasks"
        );
    }

    let load = repo.tasks_on(student_id, destination)?.len();
    let over_cap = load > policy.daily_task_cap as usize;
    if over_cap {
        warn!(
            student_id,
            %destination,
            load,
            cap = policy.daily_task_cap,
            "destination date is over the daily task cap"
        );
    }

    repo.record_closeout(&CloseoutRecord {
        student_id,
        date,
        action: audit_action,
        tasks_moved: count as u32,
        destination,
        processed_at: now,
    })?;

    info!(
        student_id,
        %date,
        %destination,
        moved = count,
        action = audit_action.as_str(),
        "closed out day"
    );

    Ok(RescheduleOutcome {
        student_id,
        date,
        action,
        reason: None,
        moved,
        destination: Some(destination),
        over_cap,
    })
}
