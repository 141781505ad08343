use crate::task::{NewTask, Task, TaskCategory, TaskStatus};
use std::fmt;

#[derive(Debug, Clone)]
pub struct TaskValidationError {
    message: String,
}

impl TaskValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for TaskValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskValidationError {}

pub fn validate_new_task(task: &NewTask) -> Result<(), TaskValidationError> {
    if task.title.trim().is_empty() {
        return Err(TaskValidationError::new(format!(
            "task for student {} on {} requires a non-empty title",
            task.student_id, task.date
        )));
    }

    if let TaskCategory::Subject(name) = &task.category {
        if name.trim().is_empty() {
            return Err(TaskValidationError::new(format!(
                "task '{}' requires a non-empty subject",
                task.title
            )));
        }
        if TaskCategory::is_reserved_name(name) {
            return Err(TaskValidationError::new(format!(
                "task '{}' cannot use the reserved subject name '{}'",
                task.title,
                name.trim()
            )));
        }
    }

    let original = task.effective_original_date();
    if original > task.date {
        return Err(TaskValidationError::new(format!(
            "task '{}' has original_date {} after its date {}",
            task.title, original, task.date
        )));
    }

    if task.category.is_non_work() && original != task.date {
        return Err(TaskValidationError::new(format!(
            "{} marker for {} cannot carry a different original_date {}",
            task.category, task.date, original
        )));
    }

    Ok(())
}

pub fn validate_task(task: &Task) -> Result<(), TaskValidationError> {
    if task.category.is_non_work() && task.status != TaskStatus::Normal {
        return Err(TaskValidationError::new(format!(
            "task {} is a {} marker and cannot have status {}",
            task.id, task.category, task.status
        )));
    }
    if task.original_date > task.date {
        return Err(TaskValidationError::new(format!(
            "task {} has original_date {} after its date {}",
            task.id, task.original_date, task.date
        )));
    }
    Ok(())
}

/// A date is either a rest/leave day or a work day; never both.
pub fn validate_day_placement(
    incoming: &NewTask,
    existing: &[Task],
) -> Result<(), TaskValidationError> {
    let incoming_marker = incoming.category.is_non_work();
    let clash = existing
        .iter()
        .find(|task| task.category.is_non_work() != incoming_marker);
    match clash {
        Some(task) => Err(TaskValidationError::new(format!(
            "student {} on {}: cannot place {} task '{}' next to {} task {}",
            incoming.student_id,
            incoming.date,
            incoming.category,
            incoming.title,
            task.category,
            task.id
        ))),
        None => Ok(()),
    }
}

pub fn is_mixed_day(tasks: &[Task]) -> bool {
    let markers = tasks.iter().filter(|t| t.category.is_non_work()).count();
    markers > 0 && markers < tasks.len()
}
