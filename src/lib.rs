pub mod audit;
pub mod calendar;
pub mod config;
#[cfg(feature = "http_api")]
pub mod http_api;
pub mod logging;
pub mod persistence;
pub mod policy;
pub mod reschedule;
pub mod task;
pub(crate) mod task_validation;
pub mod trigger;

pub use audit::{AuditAction, AuditEntry, AuditQuery, CloseoutRecord, NewAuditEntry};
pub use calendar::{HorizonExceeded, WorkCalendar, WorkCalendarResolver};
pub use config::{ConfigError, SchedulerConfig};
pub use persistence::{
    AuditLog, PersistenceError, PersistenceResult, PolicyStore, SqliteRepo, SqliteStore,
    TaskLedger,
};
pub use policy::{Policy, PolicyError, PolicySettings};
pub use reschedule::{
    NoActionReason, RescheduleAction, RescheduleError, RescheduleOutcome, Rescheduler,
};
pub use task::{NewTask, StudentId, Task, TaskCategory, TaskId, TaskStatus};
pub use trigger::{BatchReport, DailyCloseout, ScheduleStatus, TriggerError, TriggerSchedule};
