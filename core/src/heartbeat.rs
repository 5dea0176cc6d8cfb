//! Heartbeat: a proactive periodic tick that reads a checklist file, gathers
//! coarse system state, and runs an agent session against the result.
//! Grounded on the teacher's `scheduler/daemon.rs` tick loop, but the task
//! body is a fixed checklist prompt rather than a configured job.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use sysinfo::System;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{error, info};

use crate::error::Result;
use crate::sandbox::audit::{AuditEntry, AuditStore};
use crate::scheduler::RunTask;

const NO_CHECKLIST_PLACEHOLDER: &str = "(no checklist configured)";
const MIN_INTERVAL_MINUTES: u32 = 1;

pub struct HeartbeatConfig {
    pub interval_minutes: u32,
    pub checklist_path: PathBuf,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 30,
            checklist_path: PathBuf::from("checklist.md"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemSnapshot {
    pub platform: String,
    pub uptime_secs: u64,
    pub load_average: (f64, f64, f64),
    pub free_memory_kb: u64,
    pub total_memory_kb: u64,
}

fn collect_system_snapshot() -> SystemSnapshot {
    // Each metric is read independently so one failing probe (e.g. load
    // average unsupported on the platform) doesn't blank out the others.
    let platform = System::name().unwrap_or_else(|| "unknown".to_string());
    let uptime_secs = System::uptime();
    let load = System::load_average();
    let mut sys = System::new();
    sys.refresh_memory();
    SystemSnapshot {
        platform,
        uptime_secs,
        load_average: (load.one, load.five, load.fifteen),
        free_memory_kb: sys.free_memory() / 1024,
        total_memory_kb: sys.total_memory() / 1024,
    }
}

pub type ReportCallback = Arc<dyn Fn(&str, bool, StdDuration) + Send + Sync>;

pub struct Heartbeat {
    config: HeartbeatConfig,
    audit: Arc<AuditStore>,
    run_task: RunTask,
    report: Option<ReportCallback>,
    stop: Arc<Notify>,
}

impl Heartbeat {
    pub fn new(config: HeartbeatConfig, audit: Arc<AuditStore>, run_task: RunTask) -> Self {
        Self {
            config,
            audit,
            run_task,
            report: None,
            stop: Arc::new(Notify::new()),
        }
    }

    pub fn with_report_callback(mut self, callback: ReportCallback) -> Self {
        self.report = Some(callback);
        self
    }

    pub fn stop(&self) {
        self.stop.notify_waiters();
    }

    pub async fn start(self: Arc<Self>) {
        let interval_minutes = self.config.interval_minutes.max(MIN_INTERVAL_MINUTES);
        info!(interval_minutes, "heartbeat started");
        loop {
            tokio::select! {
                _ = self.stop.notified() => {
                    info!("heartbeat stopped");
                    return;
                }
                _ = sleep(StdDuration::from_secs(interval_minutes as u64 * 60)) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "heartbeat tick failed");
                    }
                }
            }
        }
    }

    async fn tick(&self) -> Result<()> {
        let checklist = match tokio::fs::read_to_string(&self.config.checklist_path).await {
            Ok(content) => content,
            Err(_) => NO_CHECKLIST_PLACEHOLDER.to_string(),
        };
        let snapshot = collect_system_snapshot();
        let prompt = build_prompt(&checklist, &snapshot);

        let started = std::time::Instant::now();
        let result = (self.run_task)(prompt).await;
        let duration = started.elapsed();

        let (output, error) = match &result {
            Ok(output) => (Some(output.clone()), None),
            Err(e) => (None, Some(e.user_message())),
        };

        self.audit
            .append(AuditEntry {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: Utc::now(),
                capability: "heartbeat".into(),
                action: "tick".into(),
                resource: "checklist".into(),
                params: String::new(),
                decision: "auto-approved".into(),
                result: if result.is_ok() { "success".into() } else { "error".into() },
                output: output.as_ref().map(|o| crate::redact::truncate_utf8(o, 1024).0),
                error,
                duration_ms: duration.as_millis() as u64,
                requested_by: "heartbeat".into(),
            })
            .await?;

        if let Some(report) = &self.report {
            report(output.as_deref().unwrap_or_default(), result.is_ok(), duration);
        }

        result.map(|_| ())
    }
}

fn build_prompt(checklist: &str, snapshot: &SystemSnapshot) -> String {
    format!(
        "Heartbeat check-in. Review the checklist below and take any action needed.\n\n\
        Checklist:\n{checklist}\n\n\
        System state: platform={}, uptime={}s, load avg={:.2}/{:.2}/{:.2}, \
        memory free/total={}/{} KB",
        snapshot.platform,
        snapshot.uptime_secs,
        snapshot.load_average.0,
        snapshot.load_average.1,
        snapshot.load_average.2,
        snapshot.free_memory_kb,
        snapshot.total_memory_kb,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_checklist_substitutes_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let config = HeartbeatConfig {
            interval_minutes: 30,
            checklist_path: dir.path().join("missing.md"),
        };
        let audit = Arc::new(AuditStore::in_memory());
        let run_task: RunTask = Arc::new(|prompt: String| {
            Box::pin(async move {
                assert!(prompt.contains(NO_CHECKLIST_PLACEHOLDER));
                Ok("ok".to_string())
            })
        });
        let heartbeat = Heartbeat::new(config, audit.clone(), run_task);
        heartbeat.tick().await.unwrap();
        let recent = audit.get_recent(1).await.unwrap();
        assert_eq!(recent[0].capability, "heartbeat");
    }

    #[tokio::test]
    async fn tick_records_audit_entry_with_duration() {
        let dir = tempfile::tempdir().unwrap();
        let checklist_path = dir.path().join("checklist.md");
        tokio::fs::write(&checklist_path, "- check disk space").await.unwrap();
        let config = HeartbeatConfig {
            interval_minutes: 1,
            checklist_path,
        };
        let audit = Arc::new(AuditStore::in_memory());
        let run_task: RunTask = Arc::new(|_prompt: String| Box::pin(async move { Ok("done".to_string()) }));
        let heartbeat = Heartbeat::new(config, audit.clone(), run_task);
        heartbeat.tick().await.unwrap();
        let recent = audit.get_recent(1).await.unwrap();
        assert_eq!(recent[0].result, "success");
    }
}
