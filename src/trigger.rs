//! Batch closeout and the daily trigger schedule.
//!
//! The trigger owns cadence only. It picks the date to close and hands each
//! student to [`Rescheduler::reschedule`]; nothing here keeps clock state
//! between runs.

use crate::persistence::{PersistenceError, TaskLedger};
use crate::reschedule::{RescheduleAction, RescheduleError, RescheduleOutcome, Rescheduler};
use crate::task::StudentId;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, instrument};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("failed to start closeout workers: {0}")]
    Workers(#[from] rayon::ThreadPoolBuildError),
}

/// When the automatic closeout fires. A run at `run_at` on day D closes
/// out day D - 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSchedule {
    pub enabled: bool,
    pub run_at: NaiveTime,
}

impl Default for TriggerSchedule {
    fn default() -> Self {
        Self {
            enabled: true,
            run_at: NaiveTime::MIN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    pub is_enabled: bool,
    pub next_scheduled_run: Option<NaiveDateTime>,
}

impl TriggerSchedule {
    /// First run strictly after `now`, or `None` when disabled.
    pub fn next_run_after(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        if !self.enabled {
            return None;
        }
        let today = now.date().and_time(self.run_at);
        if today > now {
            Some(today)
        } else {
            Some(today + Duration::days(1))
        }
    }

    pub fn status(&self, now: NaiveDateTime) -> ScheduleStatus {
        ScheduleStatus {
            is_enabled: self.enabled,
            next_scheduled_run: self.next_run_after(now),
        }
    }

    pub fn closing_date(run: NaiveDateTime) -> NaiveDate {
        run.date() - Duration::days(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub student_id: StudentId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub date: NaiveDate,
    pub outcomes: Vec<RescheduleOutcome>,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn students_processed(&self) -> usize {
        self.outcomes.len() + self.failures.len()
    }

    pub fn tasks_moved(&self) -> usize {
        self.outcomes.iter().map(RescheduleOutcome::tasks_moved).sum()
    }

    pub fn to_cli_summary(&self) -> String {
        let deferred = self
            .outcomes
            .iter()
            .filter(|o| o.action == RescheduleAction::BlockDefer)
            .count();
        let carried = self
            .outcomes
            .iter()
            .filter(|o| o.action == RescheduleAction::IndividualCarryOver)
            .count();
        let mut parts = vec![
            format!("date={}", self.date),
            format!("students={}", self.students_processed()),
            format!("moved={}", self.tasks_moved()),
        ];
        if deferred > 0 {
            parts.push(format!("deferred_days={deferred}"));
        }
        if carried > 0 {
            parts.push(format!("carried_days={carried}"));
        }
        if !self.failures.is_empty() {
            let failed = self
                .failures
                .iter()
                .map(|f| f.student_id.to_string())
                .collect::<Vec<_>>()
                .join(",");
            parts.push(format!("failed={failed}"));
        }
        parts.join(", ")
    }
}

/// Closes out one date for every student with open tasks on it.
pub struct DailyCloseout<'a> {
    engine: &'a Rescheduler,
    workers: usize,
}

impl<'a> DailyCloseout<'a> {
    pub fn new(engine: &'a Rescheduler) -> Self {
        Self { engine, workers: 0 }
    }

    /// Worker threads for the batch; 0 uses rayon's global pool.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn run(&self, date: NaiveDate) -> Result<BatchReport, TriggerError> {
        self.run_at(date, Utc::now())
    }

    /// One student's failure is recorded in the report and never stops the
    /// others.
    #[instrument(skip(self, now))]
    pub fn run_at(&self, date: NaiveDate, now: DateTime<Utc>) -> Result<BatchReport, TriggerError> {
        let students = self
            .engine
            .store()
            .read(|repo| repo.students_with_open_tasks(date))?;
        info!(students = students.len(), "starting closeout batch");

        let results: Vec<_> = if self.workers == 0 {
            self.process(&students, date, now)
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.workers)
                .thread_name(|idx| format!("closeout-{idx}"))
                .build()?;
            pool.install(|| self.process(&students, date, now))
        };

        let mut report = BatchReport {
            date,
            outcomes: Vec::with_capacity(results.len()),
            failures: Vec::new(),
        };
        for (student_id, result) in results {
            match result {
                Ok(outcome) => report.outcomes.push(outcome),
                Err(err) => {
                    error!(student_id, error = %err, "closeout failed for student");
                    report.failures.push(BatchFailure {
                        student_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(summary = %report.to_cli_summary(), "closeout batch finished");
        Ok(report)
    }

    fn process(
        &self,
        students: &[StudentId],
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Vec<(StudentId, Result<RescheduleOutcome, RescheduleError>)> {
        students
            .par_iter()
            .map(|&student_id| (student_id, self.engine.reschedule_at(student_id, date, now)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn next_run_is_later_today_when_run_time_has_not_passed() {
        let schedule = TriggerSchedule {
            enabled: true,
            run_at: NaiveTime::from_hms_opt(23, 30, 0).unwrap(),
        };
        assert_eq!(
            schedule.next_run_after(at(2025, 3, 3, 10, 0)),
            Some(at(2025, 3, 3, 23, 30))
        );
    }

    #[test]
    fn next_run_rolls_to_tomorrow_at_or_after_run_time() {
        let schedule = TriggerSchedule::default();
        assert_eq!(
            schedule.next_run_after(at(2025, 3, 3, 0, 0)),
            Some(at(2025, 3, 4, 0, 0))
        );
        assert_eq!(
            schedule.next_run_after(at(2025, 12, 31, 8, 15)),
            Some(at(2026, 1, 1, 0, 0))
        );
    }

    #[test]
    fn disabled_schedule_reports_no_next_run() {
        let schedule = TriggerSchedule {
            enabled: false,
            ..TriggerSchedule::default()
        };
        let status = schedule.status(at(2025, 3, 3, 10, 0));
        assert!(!status.is_enabled);
        assert_eq!(status.next_scheduled_run, None);
    }

    #[test]
    fn midnight_run_closes_previous_day() {
        assert_eq!(
            TriggerSchedule::closing_date(at(2025, 3, 1, 0, 0)),
            NaiveDate::from_ymd_opt(2025, 2, 28).unwrap()
        );
    }
}
