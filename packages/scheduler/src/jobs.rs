//! Non-reentrant cron job runner.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cronspec::CronSchedule;

/// Outcome of one job run.
#[derive(Debug, Clone, Default)]
pub struct JobReport {
    /// Units of work completed (streams archived, alerts raised, ...)
    pub items_processed: usize,
}

/// Job failures. A failed run is retried at the next tick.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job failed: {0}")]
    Failed(String),
}

/// A schedulable unit of work.
#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self) -> Result<JobReport, JobError>;
}

struct ScheduledJob {
    job: Arc<dyn Job>,
    schedule: CronSchedule,
    /// Non-reentrancy guard: a still-running job skips its next tick
    running: Arc<AtomicBool>,
    /// Abort window; an overrunning job is cancelled and retried later
    window: Duration,
}

/// Drives a set of jobs against wall-clock time.
pub struct JobRunner {
    jobs: Vec<ScheduledJob>,
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRunner {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    pub fn register(mut self, job: Arc<dyn Job>, schedule: CronSchedule, window: Duration) -> Self {
        tracing::info!(job = job.name(), cron = schedule.expr(), "Job registered");
        self.jobs.push(ScheduledJob {
            job,
            schedule,
            running: Arc::new(AtomicBool::new(false)),
            window,
        });
        self
    }

    /// Trigger one registered job immediately, bypassing its schedule but
    /// honouring non-reentrancy and the abort window.
    pub async fn trigger(&self, name: &str) -> Option<Result<JobReport, JobError>> {
        let entry = self.jobs.iter().find(|j| j.job.name() == name)?;
        Some(Self::execute(entry).await)
    }

    /// Run the scheduler loop until the task is dropped.
    pub async fn run(self) {
        if self.jobs.is_empty() {
            tracing::warn!("Job runner started with no jobs");
            return;
        }

        loop {
            let now = chrono::Utc::now();
            let next = self
                .jobs
                .iter()
                .filter_map(|j| j.schedule.next_after(now).map(|t| (t, j)))
                .min_by_key(|(t, _)| *t);

            let Some((fire_at, _)) = next else {
                tracing::warn!("No future fire time for any job; runner stopping");
                return;
            };

            let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            let now = chrono::Utc::now();
            for entry in &self.jobs {
                let due = entry
                    .schedule
                    .next_after(now - chrono::Duration::seconds(1))
                    .map(|t| t <= now)
                    .unwrap_or(false);
                if !due {
                    continue;
                }

                let job = Arc::clone(&entry.job);
                let running = Arc::clone(&entry.running);
                let window = entry.window;
                tokio::spawn(async move {
                    Self::execute_guarded(job, running, window).await;
                });
            }
        }
    }

    async fn execute(entry: &ScheduledJob) -> Result<JobReport, JobError> {
        if entry.running.swap(true, Ordering::SeqCst) {
            tracing::warn!(job = entry.job.name(), "Job still running; tick skipped");
            return Ok(JobReport::default());
        }

        let result = match tokio::time::timeout(entry.window, entry.job.run()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(
                    job = entry.job.name(),
                    window_secs = entry.window.as_secs(),
                    "Job exceeded its window; aborted, will retry next tick"
                );
                Err(JobError::Failed("window exceeded".to_string()))
            }
        };
        entry.running.store(false, Ordering::SeqCst);
        result
    }

    async fn execute_guarded(job: Arc<dyn Job>, running: Arc<AtomicBool>, window: Duration) {
        if running.swap(true, Ordering::SeqCst) {
            tracing::warn!(job = job.name(), "Job still running; tick skipped");
            return;
        }

        match tokio::time::timeout(window, job.run()).await {
            Ok(Ok(report)) => {
                tracing::info!(job = job.name(), items = report.items_processed, "Job finished")
            }
            Ok(Err(e)) => tracing::error!(job = job.name(), error = %e, "Job failed"),
            Err(_) => tracing::error!(
                job = job.name(),
                window_secs = window.as_secs(),
                "Job exceeded its window; aborted, will retry next tick"
            ),
        }
        running.store(false, Ordering::SeqCst);
    }
}
