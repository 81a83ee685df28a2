//! CarbonPlane: Scheduler & Archival
//!
//! Cron-driven jobs running in the configured timezone: monthly
//! aggregation (summary row + raw-entry eviction, atomic per stream),
//! daily overdue detection, and monthly summary refresh. Jobs are
//! non-reentrant; a still-running job skips its next tick, and a job that
//! exceeds its window is aborted and retried at the next tick.

pub mod cronspec;
pub mod jobs;
pub mod monthly;
pub mod overdue;
pub mod refresh;

pub use cronspec::{CronSchedule, CronSpecError};
pub use jobs::{Job, JobError, JobReport, JobRunner};
pub use monthly::MonthlyAggregationJob;
pub use overdue::{
    CollectionConfig, CollectionConfigStore, InMemoryCollectionConfigStore, OverdueJob,
};
pub use refresh::SummaryRefreshJob;
