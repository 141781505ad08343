use crate::persistence::{PersistenceError, TaskLedger};
use crate::task::StudentId;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no work date for student {student_id} within {horizon_days} day(s) after {from}")]
pub struct HorizonExceeded {
    pub student_id: StudentId,
    pub from: NaiveDate,
    pub horizon_days: u32,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    HorizonExceeded(#[from] HorizonExceeded),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// One student's rest/leave dates over a bounded window after an anchor
/// date. Every date in the window that is not listed is a work day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCalendar {
    student_id: StudentId,
    anchor: NaiveDate,
    horizon_days: u32,
    non_work_days: BTreeSet<NaiveDate>,
}

impl WorkCalendar {
    pub fn new<I>(
        student_id: StudentId,
        anchor: NaiveDate,
        horizon_days: u32,
        non_work_days: I,
    ) -> Self
    where
        I: IntoIterator<Item = NaiveDate>,
    {
        Self {
            student_id,
            anchor,
            horizon_days,
            non_work_days: non_work_days.into_iter().collect(),
        }
    }

    /// Last date the scan may return.
    pub fn window_end(&self) -> NaiveDate {
        self.anchor + Duration::days(i64::from(self.horizon_days))
    }

    pub fn is_non_work_day(&self, date: NaiveDate) -> bool {
        self.non_work_days.contains(&date)
    }

    pub fn is_available(&self, date: NaiveDate) -> bool {
        !self.is_non_work_day(date)
    }

    /// Earliest work date strictly after the anchor, at most `horizon_days`
    /// days out. The anchor itself is never a candidate, even when it is a
    /// work day.
    pub fn next_work_date(&self) -> Result<NaiveDate, HorizonExceeded> {
        let mut current = self.anchor;
        for _ in 0..self.horizon_days {
            current = current + Duration::days(1);
            if self.is_available(current) {
                return Ok(current);
            }
        }
        Err(HorizonExceeded {
            student_id: self.student_id,
            from: self.anchor,
            horizon_days: self.horizon_days,
        })
    }
}

/// Classifies dates for a student by reading rest/leave markers from the
/// task ledger.
pub struct WorkCalendarResolver<'a, L: ?Sized> {
    ledger: &'a L,
}

impl<'a, L: TaskLedger + ?Sized> WorkCalendarResolver<'a, L> {
    pub fn new(ledger: &'a L) -> Self {
        Self { ledger }
    }

    pub fn is_non_work_day(
        &self,
        student_id: StudentId,
        date: NaiveDate,
    ) -> Result<bool, PersistenceError> {
        let markers = self.ledger.non_work_dates(student_id, date, date)?;
        Ok(markers.contains(&date))
    }

    /// Loads the calendar window `(from, from + horizon_days]`.
    pub fn calendar(
        &self,
        student_id: StudentId,
        from: NaiveDate,
        horizon_days: u32,
    ) -> Result<WorkCalendar, PersistenceError> {
        let start = from + Duration::days(1);
        let end = from + Duration::days(i64::from(horizon_days));
        let markers = self.ledger.non_work_dates(student_id, start, end)?;
        Ok(WorkCalendar::new(student_id, from, horizon_days, markers))
    }

    pub fn next_work_date(
        &self,
        student_id: StudentId,
        from: NaiveDate,
        horizon_days: u32,
    ) -> Result<NaiveDate, ResolveError> {
        let calendar = self.calendar(student_id, from, horizon_days)?;
        Ok(calendar.next_work_date()?)
    }
}
