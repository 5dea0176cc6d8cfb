//! Cron scheduler: owns the `jobs` table, installs a `cron::Schedule` per
//! enabled job to compute `nextRun`, and drives due jobs through an injected
//! task runner. Grounded on the teacher's `scheduler/daemon.rs` tick loop
//! (PID file, `sleep`-based polling, per-job error isolation) generalized
//! from the teacher's duration-string-only schedules to full cron.

pub mod cron_parse;
pub mod job;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, info, warn};

pub use cron_parse::ScheduleParser;
pub use job::{Job, JobStore, JobType, NewJob};

use crate::error::Result;
use crate::sandbox::audit::{AuditEntry, AuditStore};

const TICK_INTERVAL: StdDuration = StdDuration::from_secs(30);

/// Invokes an agent session for a job's task text. The composition root
/// wires this to the agent loop; the scheduler itself has no opinion on how
/// a task is executed.
pub type RunTask =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync>;

pub fn next_run_after(cron_expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = cron::Schedule::try_from(cron_parse::to_six_field(cron_expr).as_str()).ok()?;
    schedule.after(&after).next()
}

pub struct Scheduler {
    jobs: JobStore,
    parser: ScheduleParser,
    audit: Arc<AuditStore>,
    run_task: RunTask,
    stop: Arc<Notify>,
}

impl Scheduler {
    pub fn new(jobs: JobStore, parser: ScheduleParser, audit: Arc<AuditStore>, run_task: RunTask) -> Self {
        Self {
            jobs,
            parser,
            audit,
            run_task,
            stop: Arc::new(Notify::new()),
        }
    }

    pub async fn create_job(&self, name: Option<String>, schedule: impl AsRef<str>, task: String) -> Result<Job> {
        let expr = self.parser.parse(schedule.as_ref()).await?;
        let next_run = next_run_after(&expr, Utc::now());
        self.jobs
            .create(
                NewJob {
                    name,
                    schedule: expr,
                    task,
                    job_type: Some(JobType::Cron),
                },
                next_run,
            )
            .await
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.jobs.list().await
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.jobs.get(id).await
    }

    pub async fn enable_job(&self, id: &str) -> Result<()> {
        self.jobs.set_enabled(id, true).await
    }

    pub async fn disable_job(&self, id: &str) -> Result<()> {
        self.jobs.set_enabled(id, false).await
    }

    pub async fn delete_job(&self, id: &str) -> Result<()> {
        self.jobs.delete(id).await
    }

    /// Fetch the job, run its task, update bookkeeping, write the audit
    /// entry, regardless of whether the job was naturally due.
    pub async fn run_job_now(&self, id: &str) -> Result<String> {
        let Some(job) = self.jobs.get(id).await? else {
            return Err(crate::error::MamaError::NotFound {
                kind: "job".into(),
                id: id.to_string(),
            });
        };
        self.execute(&job).await
    }

    async fn execute(&self, job: &Job) -> Result<String> {
        let started = std::time::Instant::now();
        let result = (self.run_task)(job.task.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let next_run = next_run_after(&job.schedule, Utc::now());

        let (output, error) = match &result {
            Ok(output) => (Some(output.clone()), None),
            Err(e) => (None, Some(e.user_message())),
        };
        self.jobs
            .record_run(&job.id, next_run, output.as_deref().unwrap_or_default())
            .await?;

        self.audit
            .append(AuditEntry {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: Utc::now(),
                capability: "scheduler".into(),
                action: "run_job".into(),
                resource: job.name.clone(),
                params: job.task.clone(),
                decision: "auto-approved".into(),
                result: if result.is_ok() { "success".into() } else { "error".into() },
                output: output.map(|o| crate::redact::truncate_utf8(&o, 1024).0),
                error,
                duration_ms,
                requested_by: "scheduler".into(),
            })
            .await?;

        result
    }

    pub fn stop(&self) {
        self.stop.notify_waiters();
    }

    /// Poll loop: every `TICK_INTERVAL`, run any enabled job whose
    /// `next_run` has passed. Errors in one job never abort the tick.
    pub async fn start(self: Arc<Self>) {
        info!("scheduler started");
        loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    info!("scheduler stopped");
                    return;
                }
                _ = sleep(TICK_INTERVAL) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        for job in self.jobs.list_enabled().await? {
            let due = job.next_run.map(|next| now >= next).unwrap_or(true);
            if !due {
                continue;
            }
            if let Err(e) = self.execute(&job).await {
                warn!(job = %job.name, error = %e, "scheduled job failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn fake_runner(output: &'static str) -> RunTask {
        Arc::new(move |_task: String| Box::pin(async move { Ok(output.to_string()) }))
    }

    async fn scheduler(run_task: RunTask) -> Arc<Scheduler> {
        let store = Store::open_in_memory().await.unwrap();
        let jobs = JobStore::new(store);
        let parser = ScheduleParser::new(None);
        let audit = Arc::new(AuditStore::in_memory());
        Arc::new(Scheduler::new(jobs, parser, audit, run_task))
    }

    #[tokio::test]
    async fn create_job_computes_next_run() {
        let scheduler = scheduler(fake_runner("ok")).await;
        let job = scheduler.create_job(Some("nightly".into()), "0 2 * * *", "do backup".into()).await.unwrap();
        assert!(job.next_run.is_some());
    }

    #[tokio::test]
    async fn run_job_now_updates_bookkeeping_and_audits() {
        let scheduler = scheduler(fake_runner("done")).await;
        let job = scheduler.create_job(None, "* * * * *", "say hi".into()).await.unwrap();
        let output = scheduler.run_job_now(&job.id).await.unwrap();
        assert_eq!(output, "done");
        let updated = scheduler.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(updated.run_count, 1);
        assert!(updated.last_run.is_some());
    }

    #[tokio::test]
    async fn disabled_job_is_skipped_on_tick() {
        let scheduler = scheduler(fake_runner("x")).await;
        let job = scheduler.create_job(None, "* * * * *", "noop".into()).await.unwrap();
        scheduler.disable_job(&job.id).await.unwrap();
        scheduler.tick().await.unwrap();
        let updated = scheduler.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(updated.run_count, 0);
    }
}
