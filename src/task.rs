use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type StudentId = i64;
pub type TaskId = i64;

/// What a task is about. `Rest` and `Leave` are sentinels that mark the
/// whole date as a non-work day for the student.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Subject(String),
    Rest,
    Leave,
}

impl TaskCategory {
    pub const REST: &'static str = "rest";
    pub const LEAVE: &'static str = "leave";

    pub fn subject(name: impl Into<String>) -> Self {
        TaskCategory::Subject(name.into().trim().to_string())
    }

    /// Subject names that would read back as a rest/leave marker.
    pub fn is_reserved_name(name: &str) -> bool {
        let name = name.trim();
        name.eq_ignore_ascii_case(Self::REST) || name.eq_ignore_ascii_case(Self::LEAVE)
    }

    pub fn is_non_work(&self) -> bool {
        matches!(self, TaskCategory::Rest | TaskCategory::Leave)
    }

    pub fn as_str(&self) -> &str {
        match self {
            TaskCategory::Subject(name) => name.as_str(),
            TaskCategory::Rest => Self::REST,
            TaskCategory::Leave => Self::LEAVE,
        }
    }
}

impl fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err("task category must not be empty".to_string()),
            Self::REST => Ok(TaskCategory::Rest),
            Self::LEAVE => Ok(TaskCategory::Leave),
            other if Self::is_reserved_name(other) => Err(format!(
                "'{other}' is reserved for rest/leave markers and cannot name a subject"
            )),
            other => Ok(TaskCategory::Subject(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Normal,
    Deferred,
    CarriedOver,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Normal => "normal",
            TaskStatus::Deferred => "deferred",
            TaskStatus::CarriedOver => "carried_over",
        }
    }

    pub fn variants() -> &'static [(&'static str, &'static str)] {
        &[
            ("normal", "On the date it was assigned or placed"),
            ("deferred", "Moved with the rest of its day as a block"),
            ("carried_over", "Moved on its own to the next work date"),
        ]
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "normal" => Ok(TaskStatus::Normal),
            "deferred" => Ok(TaskStatus::Deferred),
            "carried_over" => Ok(TaskStatus::CarriedOver),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// A stored task. `original_date` is fixed when the task is first inserted;
/// the engine only ever changes `date`, `status` and `defer_reason`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub student_id: StudentId,
    pub date: NaiveDate,
    pub category: TaskCategory,
    pub title: String,
    pub completed: bool,
    pub status: TaskStatus,
    pub original_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defer_reason: Option<String>,
}

impl Task {
    pub fn is_open_work(&self) -> bool {
        !self.completed && !self.category.is_non_work()
    }

    pub fn has_moved(&self) -> bool {
        self.date != self.original_date
    }
}

/// A task as handed over by the assignment process, before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub student_id: StudentId,
    pub date: NaiveDate,
    pub category: TaskCategory,
    pub title: String,
    #[serde(default)]
    pub completed: bool,
    /// Defaults to `date` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_date: Option<NaiveDate>,
}

impl NewTask {
    pub fn new(
        student_id: StudentId,
        date: NaiveDate,
        category: TaskCategory,
        title: impl Into<String>,
    ) -> Self {
        Self {
            student_id,
            date,
            category,
            title: title.into(),
            completed: false,
            original_date: None,
        }
    }

    pub fn subject(
        student_id: StudentId,
        date: NaiveDate,
        subject: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self::new(student_id, date, TaskCategory::subject(subject), title)
    }

    pub fn rest_day(student_id: StudentId, date: NaiveDate) -> Self {
        Self::new(student_id, date, TaskCategory::Rest, "Rest day")
    }

    pub fn leave_day(student_id: StudentId, date: NaiveDate) -> Self {
        Self::new(student_id, date, TaskCategory::Leave, "Leave")
    }

    pub fn completed(mut self) -> Self {
        self.completed = true;
        self
    }

    pub fn with_original_date(mut self, original: NaiveDate) -> Self {
        self.original_date = Some(original);
        self
    }

    pub fn effective_original_date(&self) -> NaiveDate {
        self.original_date.unwrap_or(self.date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_categories_parse_from_their_names() {
        assert_eq!("rest".parse::<TaskCategory>(), Ok(TaskCategory::Rest));
        assert_eq!("leave".parse::<TaskCategory>(), Ok(TaskCategory::Leave));
        assert_eq!(
            "Mathematics".parse::<TaskCategory>(),
            Ok(TaskCategory::subject("Mathematics"))
        );
        assert!("  ".parse::<TaskCategory>().is_err());
    }

    #[test]
    fn sentinel_names_never_parse_as_subjects() {
        assert_eq!(" rest ".parse::<TaskCategory>(), Ok(TaskCategory::Rest));
        assert!("Rest".parse::<TaskCategory>().is_err());
        assert!("LEAVE".parse::<TaskCategory>().is_err());
        assert_eq!(TaskCategory::subject(" Art "), TaskCategory::Subject("Art".to_string()));
    }

    #[test]
    fn status_strings_match_storage_names() {
        for (name, _) in TaskStatus::variants() {
            let status: TaskStatus = name.parse().unwrap();
            assert_eq!(status.as_str(), *name);
        }
        assert!("done".parse::<TaskStatus>().is_err());
    }
}
