//! Job record: the persisted shape of a scheduled task, grounded on the
//! teacher's `scheduler/model.rs` `ScheduledJob` (id/name/schedule/enabled/
//! timestamps) but flattened to the store's `jobs` table columns instead of
//! a nested action enum — task execution is always "run an agent session
//! with this prompt", so there's only one action shape to model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Cron,
    Heartbeat,
    Trigger,
}

impl JobType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Heartbeat => "heartbeat",
            Self::Trigger => "trigger",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "heartbeat" => Self::Heartbeat,
            "trigger" => Self::Trigger,
            _ => Self::Cron,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub job_type: JobType,
    pub schedule: String,
    pub task: String,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub last_result: Option<String>,
}

pub struct NewJob {
    pub name: Option<String>,
    pub schedule: String,
    pub task: String,
    pub job_type: Option<JobType>,
}

pub struct JobStore {
    store: Store,
}

impl JobStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, new: NewJob, next_run: Option<DateTime<Utc>>) -> Result<Job> {
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name.unwrap_or_else(|| format!("job-{}", &uuid::Uuid::new_v4().to_string()[..8])),
            job_type: new.job_type.unwrap_or(JobType::Cron),
            schedule: new.schedule,
            task: new.task,
            enabled: true,
            last_run: None,
            next_run,
            run_count: 0,
            last_result: None,
        };
        self.store
            .run(
                "INSERT INTO jobs (id, name, job_type, schedule, task, enabled, last_run, next_run, run_count, last_result)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                vec![
                    Value::from(job.id.clone()),
                    Value::from(job.name.clone()),
                    Value::from(job.job_type.as_str()),
                    Value::from(job.schedule.clone()),
                    Value::from(job.task.clone()),
                    Value::from(job.enabled as i64),
                    Value::Null,
                    job.next_run.map(|t| Value::from(t.to_rfc3339())).unwrap_or(Value::Null),
                    Value::from(0i64),
                    Value::Null,
                ],
            )
            .await?;
        Ok(job)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = self
            .store
            .get("SELECT * FROM jobs WHERE id = ?1", vec![Value::from(id.to_string())])
            .await?;
        Ok(row.and_then(row_to_job))
    }

    pub async fn list(&self) -> Result<Vec<Job>> {
        let rows = self.store.all("SELECT * FROM jobs ORDER BY name ASC", vec![]).await?;
        Ok(rows.into_iter().filter_map(row_to_job).collect())
    }

    pub async fn list_enabled(&self) -> Result<Vec<Job>> {
        Ok(self.list().await?.into_iter().filter(|j| j.enabled).collect())
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        self.store
            .run(
                "UPDATE jobs SET enabled = ?2 WHERE id = ?1",
                vec![Value::from(id.to_string()), Value::from(enabled as i64)],
            )
            .await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.store
            .run("DELETE FROM jobs WHERE id = ?1", vec![Value::from(id.to_string())])
            .await?;
        Ok(())
    }

    pub async fn record_run(
        &self,
        id: &str,
        next_run: Option<DateTime<Utc>>,
        result: &str,
    ) -> Result<()> {
        self.store
            .run(
                "UPDATE jobs SET last_run = ?2, next_run = ?3, run_count = run_count + 1, last_result = ?4 WHERE id = ?1",
                vec![
                    Value::from(id.to_string()),
                    Value::from(Utc::now().to_rfc3339()),
                    next_run.map(|t| Value::from(t.to_rfc3339())).unwrap_or(Value::Null),
                    Value::from(result.to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}

fn row_to_job(row: crate::store::Row) -> Option<Job> {
    let get_str = |k: &str| row.get(k).and_then(|v| v.as_str()).map(str::to_string);
    Some(Job {
        id: get_str("id")?,
        name: get_str("name")?,
        job_type: JobType::parse(&get_str("job_type")?),
        schedule: get_str("schedule")?,
        task: get_str("task")?,
        enabled: row.get("enabled").and_then(|v| v.as_i64()).unwrap_or(0) != 0,
        last_run: get_str("last_run").and_then(|s| s.parse().ok()),
        next_run: get_str("next_run").and_then(|s| s.parse().ok()),
        run_count: row.get("run_count").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        last_result: get_str("last_result"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_list_delete_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        let jobs = JobStore::new(store);
        let job = jobs
            .create(
                NewJob {
                    name: Some("backup".into()),
                    schedule: "0 2 * * *".into(),
                    task: "run nightly backup".into(),
                    job_type: None,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(jobs.list().await.unwrap().len(), 1);
        jobs.delete(&job.id).await.unwrap();
        assert!(jobs.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_jobs_excluded_from_list_enabled() {
        let store = Store::open_in_memory().await.unwrap();
        let jobs = JobStore::new(store);
        let job = jobs
            .create(
                NewJob {
                    name: None,
                    schedule: "* * * * *".into(),
                    task: "noop".into(),
                    job_type: None,
                },
                None,
            )
            .await
            .unwrap();
        jobs.set_enabled(&job.id, false).await.unwrap();
        assert!(jobs.list_enabled().await.unwrap().is_empty());
    }
}
