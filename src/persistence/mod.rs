use crate::audit::{AuditEntry, AuditQuery, CloseoutRecord, NewAuditEntry};
use crate::policy::{Policy, PolicyError, PolicySettings};
use crate::task::{NewTask, StudentId, Task, TaskId, TaskStatus};
use crate::task_validation::TaskValidationError;
use chrono::NaiveDate;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    /// Another writer holds the database.
    #[error("database is busy: {0}")]
    Busy(rusqlite::Error),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    InvalidPolicy(#[from] PolicyError),
    #[error("{0} not found")]
    NotFound(String),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(value: rusqlite::Error) -> Self {
        match value.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Busy(value)
            }
            _ => Self::Sqlite(value),
        }
    }
}

impl From<TaskValidationError> for PersistenceError {
    fn from(value: TaskValidationError) -> Self {
        Self::InvalidData(value.to_string())
    }
}

impl PersistenceError {
    pub fn is_busy(&self) -> bool {
        matches!(self, PersistenceError::Busy(_))
    }
}

pub type PersistenceResult<T> = Result<T, PersistenceError>;

/// Durable task records.
pub trait TaskLedger {
    /// Stores a new task; `original_date` is fixed here and never written again.
    fn insert_task(&self, task: &NewTask) -> PersistenceResult<TaskId>;
    fn task(&self, id: TaskId) -> PersistenceResult<Option<Task>>;
    fn tasks_on(&self, student_id: StudentId, date: NaiveDate) -> PersistenceResult<Vec<Task>>;
    /// Incomplete tasks on the date that are not rest/leave markers.
    fn open_tasks(&self, student_id: StudentId, date: NaiveDate) -> PersistenceResult<Vec<Task>>;
    /// Dates in `[start, end]` that carry a rest or leave marker.
    fn non_work_dates(
        &self,
        student_id: StudentId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> PersistenceResult<BTreeSet<NaiveDate>>;
    fn move_task(
        &self,
        id: TaskId,
        to: NaiveDate,
        status: TaskStatus,
        reason: &str,
    ) -> PersistenceResult<()>;
    fn set_completed(&self, id: TaskId, completed: bool) -> PersistenceResult<()>;
    fn delete_task(&self, id: TaskId) -> PersistenceResult<bool>;
    fn students_with_open_tasks(&self, date: NaiveDate) -> PersistenceResult<Vec<StudentId>>;
}

pub trait PolicyStore {
    fn find_policy(&self, student_id: StudentId) -> PersistenceResult<Option<Policy>>;
    /// Rejects out-of-range values before writing.
    fn upsert_policy(&self, policy: &Policy) -> PersistenceResult<()>;

    fn policy_or(
        &self,
        student_id: StudentId,
        defaults: PolicySettings,
    ) -> PersistenceResult<Policy> {
        Ok(self
            .find_policy(student_id)?
            .unwrap_or_else(|| defaults.for_student(student_id)))
    }
}

pub trait AuditLog {
    fn append_audit(&self, entry: &NewAuditEntry) -> PersistenceResult<i64>;
    fn query_audit(&self, query: &AuditQuery) -> PersistenceResult<Vec<AuditEntry>>;
    fn closeout(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> PersistenceResult<Option<CloseoutRecord>>;
    fn record_closeout(&self, record: &CloseoutRecord) -> PersistenceResult<()>;
    /// Drops the closeout marker for a date that has received new open work.
    /// Returns whether a marker was present.
    fn reopen_closeout(&self, student_id: StudentId, date: NaiveDate) -> PersistenceResult<bool>;
}

pub mod sqlite;

pub use sqlite::{SqliteRepo, SqliteStore};
