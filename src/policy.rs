use crate::task::StudentId;
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_DAILY_TASK_CAP: u32 = 4;
pub const DEFAULT_THRESHOLD: u32 = 3;
pub const DEFAULT_HORIZON_DAYS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("policy field '{field}' must be at least 1 (got {value})")]
    Invalid { field: &'static str, value: u32 },
}

/// Scheduling knobs for one student. A missing row means `Policy::default_for`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub student_id: StudentId,
    pub daily_task_cap: u32,
    /// Open-task count at which a day is deferred as a block.
    pub threshold: u32,
    pub horizon_days: u32,
    /// Informational only; the trigger owns the real run time.
    pub cutoff_time: NaiveTime,
}

/// The student-independent part of a policy, used for configured defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySettings {
    pub daily_task_cap: u32,
    pub threshold: u32,
    pub horizon_days: u32,
    pub cutoff_time: NaiveTime,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            daily_task_cap: DEFAULT_DAILY_TASK_CAP,
            threshold: DEFAULT_THRESHOLD,
            horizon_days: DEFAULT_HORIZON_DAYS,
            cutoff_time: NaiveTime::MIN,
        }
    }
}

impl PolicySettings {
    pub fn validate(&self) -> Result<(), PolicyError> {
        for (field, value) in [
            ("daily_task_cap", self.daily_task_cap),
            ("threshold", self.threshold),
            ("horizon_days", self.horizon_days),
        ] {
            if value < 1 {
                return Err(PolicyError::Invalid { field, value });
            }
        }
        Ok(())
    }

    pub fn for_student(self, student_id: StudentId) -> Policy {
        Policy {
            student_id,
            daily_task_cap: self.daily_task_cap,
            threshold: self.threshold,
            horizon_days: self.horizon_days,
            cutoff_time: self.cutoff_time,
        }
    }
}

impl Policy {
    pub fn default_for(student_id: StudentId) -> Self {
        PolicySettings::default().for_student(student_id)
    }

    pub fn settings(&self) -> PolicySettings {
        PolicySettings {
            daily_task_cap: self.daily_task_cap,
            threshold: self.threshold,
            horizon_days: self.horizon_days,
            cutoff_time: self.cutoff_time,
        }
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        self.settings().validate()
    }

    pub fn is_block_defer(&self, open_count: usize) -> bool {
        open_count >= self.threshold as usize
    }
}
