//! Audit trail types.
//!
//! Entries are append-only: the engine writes one per task movement in the
//! same transaction as the move, and nothing in this crate updates or
//! deletes them.

use crate::task::{StudentId, Task, TaskCategory, TaskId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Defer,
    CarryOver,
    Delete,
    MidnightProcess,
}

impl AuditAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            AuditAction::Defer => "defer",
            AuditAction::CarryOver => "carry_over",
            AuditAction::Delete => "delete",
            AuditAction::MidnightProcess => "midnight_process",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "defer" => Ok(AuditAction::Defer),
            "carry_over" => Ok(AuditAction::CarryOver),
            "delete" => Ok(AuditAction::Delete),
            "midnight_process" => Ok(AuditAction::MidnightProcess),
            other => Err(format!("unknown audit action '{other}'")),
        }
    }
}

/// A stored audit row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub student_id: StudentId,
    pub task_id: Option<TaskId>,
    pub category: Option<TaskCategory>,
    pub title: Option<String>,
    pub original_date: Option<NaiveDate>,
    pub moved_from: NaiveDate,
    /// `None` when the task was removed rather than moved.
    pub moved_to: Option<NaiveDate>,
    pub action: AuditAction,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// An audit row before it is appended.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub student_id: StudentId,
    pub task_id: Option<TaskId>,
    pub category: Option<TaskCategory>,
    pub title: Option<String>,
    pub original_date: Option<NaiveDate>,
    pub moved_from: NaiveDate,
    pub moved_to: Option<NaiveDate>,
    pub action: AuditAction,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl NewAuditEntry {
    pub fn task_moved(
        task: &Task,
        to: NaiveDate,
        action: AuditAction,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            student_id: task.student_id,
            task_id: Some(task.id),
            category: Some(task.category.clone()),
            title: Some(task.title.clone()),
            original_date: Some(task.original_date),
            moved_from: task.date,
            moved_to: Some(to),
            action,
            reason: reason.into(),
            created_at: at,
        }
    }

    pub fn task_removed(task: &Task, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            student_id: task.student_id,
            task_id: Some(task.id),
            category: Some(task.category.clone()),
            title: Some(task.title.clone()),
            original_date: Some(task.original_date),
            moved_from: task.date,
            moved_to: None,
            action: AuditAction::Delete,
            reason: reason.into(),
            created_at: at,
        }
    }

    /// The per-day summary written alongside a block deferral.
    pub fn midnight_summary(
        student_id: StudentId,
        from: NaiveDate,
        to: NaiveDate,
        count: usize,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            student_id,
            task_id: None,
            category: None,
            title: None,
            original_date: None,
            moved_from: from,
            moved_to: Some(to),
            action: AuditAction::MidnightProcess,
            reason: format!("closed out {from}: deferred {count} open task(s) to {to}"),
            created_at: at,
        }
    }
}

/// Filter for audit reads. The date range applies to `moved_from` and is
/// inclusive on both ends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditQuery {
    pub student_id: StudentId,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
    #[serde(default)]
    pub action: Option<AuditAction>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl AuditQuery {
    pub fn for_student(student_id: StudentId) -> Self {
        Self {
            student_id,
            ..Self::default()
        }
    }

    pub fn between(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn with_action(mut self, action: AuditAction) -> Self {
        self.action = Some(action);
        self
    }
}

/// Marks a (student, date) closeout as fully processed so that a re-run of
/// the same date is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseoutRecord {
    pub student_id: StudentId,
    pub date: NaiveDate,
    pub action: AuditAction,
    pub tasks_moved: u32,
    pub destination: NaiveDate,
    pub processed_at: DateTime<Utc>,
}
