//! Daemon lifecycle subcommands. Grounded directly on the teacher's
//! `cli/daemon.rs`: spawn a detached copy of this same binary for `start`,
//! signal it by PID for `stop`, and read the PID file for `status` — the
//! PID file itself lives where [`mama_core::daemon::Daemon`] writes it, so
//! this stays in sync with the supervisor without sharing private state.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use mama_core::daemon::{Daemon, ManagedService};

use crate::cli::DaemonCommand;
use crate::services::{HeartbeatService, HttpApiService, SchedulerService};

fn pid_path(home: &Path) -> PathBuf {
    home.join("mama.pid")
}

fn log_path(home: &Path) -> PathBuf {
    home.join("logs").join("mama.log")
}

pub async fn handle(command: DaemonCommand, home: &Path) -> Result<()> {
    match command {
        DaemonCommand::Start => start(home),
        DaemonCommand::Stop => stop(home),
        DaemonCommand::Status => status(home),
        DaemonCommand::Logs { lines } => show_logs(home, lines),
        DaemonCommand::Foreground => foreground(home).await,
    }
}

fn start(home: &Path) -> Result<()> {
    let pid_file = pid_path(home);
    if pid_file.exists() {
        let pid = fs::read_to_string(&pid_file).unwrap_or_default();
        println!("mama is already running (PID: {})", pid.trim());
        return Ok(());
    }

    let exe = std::env::current_exe().context("locating current executable")?;
    fs::create_dir_all(log_path(home).parent().unwrap())?;
    let log_file = fs::File::create(log_path(home))?;
    Command::new(exe)
        .arg("daemon")
        .arg("foreground")
        .stdout(log_file.try_clone()?)
        .stderr(log_file)
        .spawn()
        .context("spawning the daemon process")?;

    println!("mama started in the background.");
    Ok(())
}

fn stop(home: &Path) -> Result<()> {
    let pid_file = pid_path(home);
    let Ok(pid_str) = fs::read_to_string(&pid_file) else {
        println!("mama is not running.");
        return Ok(());
    };
    let pid: u32 = pid_str.trim().parse().context("invalid PID in mama.pid")?;
    println!("Stopping mama (PID: {pid})...");

    #[cfg(unix)]
    Command::new("kill").arg(pid.to_string()).status().context("sending stop signal")?;
    #[cfg(windows)]
    Command::new("taskkill").args(["/F", "/PID", &pid.to_string()]).status().context("sending stop signal")?;

    let _ = fs::remove_file(pid_file);
    Ok(())
}

fn status(home: &Path) -> Result<()> {
    let pid_file = pid_path(home);
    match fs::read_to_string(&pid_file) {
        Ok(pid) => println!("mama is running (PID: {})", pid.trim()),
        Err(_) => println!("mama is not running."),
    }
    Ok(())
}

fn show_logs(home: &Path, lines: usize) -> Result<()> {
    let content = fs::read_to_string(log_path(home)).unwrap_or_default();
    for line in content.lines().rev().take(lines).collect::<Vec<_>>().into_iter().rev() {
        println!("{line}");
    }
    Ok(())
}

/// Builds the full service graph and blocks until `stop` is requested or
/// the process receives SIGINT.
async fn foreground(home: &Path) -> Result<()> {
    let config_path = home.join("config.yaml");
    let config = mama_core::config::load(&config_path).await?;
    let app = crate::composition::build(config, home.to_path_buf()).await?;

    let http_addr = app
        .config
        .http_api
        .as_ref()
        .filter(|s| s.enabled)
        .map(|s| std::net::SocketAddr::from(([127, 0, 0, 1], s.port)));

    let mut services: Vec<Arc<dyn ManagedService>> = vec![
        Arc::new(SchedulerService::new(app.scheduler.clone())),
        Arc::new(HeartbeatService::new(app.heartbeat.clone())),
    ];
    if let Some(addr) = http_addr {
        let token = app
            .config
            .http_api
            .as_ref()
            .and_then(|s| s.token.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let state = Arc::new(mama_core::channels::HttpApiState {
            token,
            agent: app.agent.clone(),
            soul: tokio::sync::RwLock::new(app.soul),
            scheduler: app.scheduler.clone(),
            audit: app.audit.clone(),
            llm_router: app.llm_router.clone(),
            embeddings: app.embeddings.clone(),
            memories: app.memories.clone(),
        });
        services.push(Arc::new(HttpApiService::new(addr, state)));
    }

    let daemon = Arc::new(Daemon::new(services, pid_path(home)));
    daemon.start().await?;

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    println!("\nShutting down mama...");
    daemon.stop().await?;
    Ok(())
}
