//! # Cadence Scheduler
//!
//! Persisted cron schedules driven by a single periodic tick.
//!
//! - [`CronExpr`]: 5-field cron parsing and next-fire computation (UTC)
//! - [`ScheduleStore`]: pluggable persistence, [`MemoryScheduleStore`] for tests
//! - [`Scheduler`]: CRUD, pause/resume/retry, the tick loop and startup
//!   recovery. Also a [`cadence_queue::JobObserver`], so terminal job
//!   failures count against the schedule that produced them.
//!
//! Missed occurrences are skipped: an overdue schedule fires once, then
//! its next run is computed from the current time.

pub mod cron;
pub mod schedule;
pub mod service;
pub mod store;

pub use cron::{next_run, CronError, CronExpr};
pub use schedule::{NewSchedule, Schedule, ScheduleId, SchedulePatch, ScheduleStatus};
pub use service::{Scheduler, SchedulerConfig, TickReport};
pub use store::{MemoryScheduleStore, ScheduleError, ScheduleStore};
