//! Daemon supervisor: starts/stops a list of managed services in order,
//! tracks a PID file, and restarts unhealthy services on an interval.
//! Grounded on the teacher's `scheduler/daemon.rs` PID-file pattern
//! (`write_pid`/`cleanup` via `std::fs` + `process::id()`), generalized
//! from a single scheduler loop to an ordered list of arbitrary services.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::{MamaError, Result};

const MIN_HEALTH_CHECK_INTERVAL: StdDuration = StdDuration::from_secs(5);
const DEFAULT_HEALTH_CHECK_INTERVAL: StdDuration = StdDuration::from_secs(30);

#[async_trait]
pub trait ManagedService: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    /// `None` means the service has no health check and is never restarted.
    async fn health_check(&self) -> Option<bool> {
        None
    }
}

pub struct Daemon {
    services: Vec<Arc<dyn ManagedService>>,
    pid_path: PathBuf,
    health_check_interval: StdDuration,
    running: Mutex<bool>,
    stop_health_loop: Arc<Notify>,
}

impl Daemon {
    pub fn new(services: Vec<Arc<dyn ManagedService>>, pid_path: impl Into<PathBuf>) -> Self {
        Self {
            services,
            pid_path: pid_path.into(),
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            running: Mutex::new(false),
            stop_health_loop: Arc::new(Notify::new()),
        }
    }

    pub fn with_health_check_interval(mut self, interval: StdDuration) -> Self {
        self.health_check_interval = interval.max(MIN_HEALTH_CHECK_INTERVAL);
        self
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if let Some(pid) = read_pid(&self.pid_path) {
            if process_alive(pid) {
                return Err(MamaError::AlreadyRunning { pid });
            }
        }
        write_pid(&self.pid_path, std::process::id())?;
        *self.running.lock().await = true;

        for service in &self.services {
            info!(service = service.name(), "starting managed service");
            service.start().await?;
        }

        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            daemon.health_loop().await;
        });

        Ok(())
    }

    async fn health_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.stop_health_loop.notified() => return,
                _ = sleep(self.health_check_interval) => {
                    for service in &self.services {
                        match service.health_check().await {
                            Some(false) => {
                                warn!(service = service.name(), "health check failed, restarting");
                                if let Err(e) = service.stop().await {
                                    warn!(service = service.name(), error = %e, "failed to stop unhealthy service");
                                }
                                if let Err(e) = service.start().await {
                                    warn!(service = service.name(), error = %e, "failed to restart service");
                                }
                            }
                            Some(true) | None => {}
                        }
                    }
                }
            }
        }
    }

    /// Idempotent: stopping an already-stopped daemon just clears a stale
    /// PID file, if any.
    pub async fn stop(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        self.stop_health_loop.notify_waiters();
        if *running {
            for service in self.services.iter().rev() {
                info!(service = service.name(), "stopping managed service");
                if let Err(e) = service.stop().await {
                    warn!(service = service.name(), error = %e, "error stopping service");
                }
            }
        }
        *running = false;
        remove_pid(&self.pid_path);
        Ok(())
    }
}

fn read_pid(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn write_pid(path: &Path, pid: u32) -> Result<()> {
    std::fs::write(path, pid.to_string()).map_err(|e| MamaError::Internal { message: e.to_string() })
}

fn remove_pid(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // A signal-0-style probe without needing libc: /proc/<pid> existing is
    // sufficient on Linux, which is the only daemon target.
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct RecordingService {
        name: String,
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ManagedService for RecordingService {
        fn name(&self) -> &str {
            &self.name
        }
        async fn start(&self) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn health_check(&self) -> Option<bool> {
            Some(self.healthy.load(Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn start_writes_pid_and_starts_services_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("mama.pid");
        let started = Arc::new(AtomicUsize::new(0));
        let service = Arc::new(RecordingService {
            name: "scheduler".into(),
            started: started.clone(),
            stopped: Arc::new(AtomicUsize::new(0)),
            healthy: Arc::new(AtomicBool::new(true)),
        });
        let daemon = Arc::new(Daemon::new(vec![service], &pid_path));
        daemon.start().await.unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(pid_path.exists());
        daemon.stop().await.unwrap();
        assert!(!pid_path.exists());
    }

    #[tokio::test]
    async fn stop_on_not_running_daemon_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("mama.pid");
        std::fs::write(&pid_path, "999999999").unwrap();
        let daemon = Arc::new(Daemon::new(vec![], &pid_path));
        daemon.stop().await.unwrap();
        assert!(!pid_path.exists());
    }

    #[tokio::test]
    async fn start_fails_when_already_running() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("mama.pid");
        write_pid(&pid_path, std::process::id()).unwrap();
        let daemon = Arc::new(Daemon::new(vec![], &pid_path));
        assert!(daemon.start().await.is_err());
    }
}
