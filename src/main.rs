//! `mama` — a personal-assistant daemon: a sandboxed agent loop reachable
//! over a terminal REPL, a loopback HTTP API, and scheduled/heartbeat
//! background sessions. Grounded on the teacher's `main.rs` entry-point
//! shape (`clap::Parser` + a `tokio::main` dispatch), replacing its
//! one-shot terminal-assistant query with the daemon lifecycle this crate
//! actually implements.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use mama_core::channels::terminal::TerminalChannel;

mod cli;
mod composition;
mod daemon_cli;
mod services;

use cli::{Cli, Commands, MemoryCommand, SchedulerCommand};

fn home_dir() -> PathBuf {
    mama_core::config::home_dir()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let home = home_dir();

    match cli.command {
        Some(Commands::Daemon { command }) => {
            daemon_cli::handle(command.unwrap_or_default(), &home).await?;
        }
        Some(Commands::Scheduler { command }) => {
            let app = build_app(&home).await?;
            run_scheduler_command(command, &app).await?;
        }
        Some(Commands::Memory { command }) => {
            let app = build_app(&home).await?;
            run_memory_command(command, &app).await?;
        }
        Some(Commands::Cost { period }) => {
            let app = build_app(&home).await?;
            run_cost_command(&period, &app).await?;
        }
        None => {
            let app = build_app(&home).await?;
            let channel = TerminalChannel::new(app.agent.clone());
            channel.run(&app.soul).await?;
        }
    }

    Ok(())
}

async fn build_app(home: &std::path::Path) -> Result<composition::App> {
    let config = mama_core::config::load(&home.join("config.yaml")).await?;
    Ok(composition::build(config, home.to_path_buf()).await?)
}

async fn run_scheduler_command(command: SchedulerCommand, app: &composition::App) -> Result<()> {
    match command {
        SchedulerCommand::List => {
            for job in app.scheduler.list_jobs().await? {
                println!("{}\t{}\t{}\t{}", job.id, job.name, job.schedule, job.task);
            }
        }
        SchedulerCommand::Create { schedule, task, name } => {
            let job = app.scheduler.create_job(name, schedule, task).await?;
            println!("Created job {}", job.id);
        }
        SchedulerCommand::Enable { id } => app.scheduler.enable_job(&id).await?,
        SchedulerCommand::Disable { id } => app.scheduler.disable_job(&id).await?,
        SchedulerCommand::Delete { id } => app.scheduler.delete_job(&id).await?,
    }
    Ok(())
}

async fn run_memory_command(command: MemoryCommand, app: &composition::App) -> Result<()> {
    use mama_core::memory::consolidated::SearchFilter;

    match command {
        MemoryCommand::Search { query, top_k } => {
            let embedding = app.embeddings.embed(&query).await?;
            let filter = SearchFilter {
                top_k: Some(top_k),
                ..SearchFilter::default()
            };
            for (score, memory) in app.memories.search(&query, &embedding, &filter).await? {
                println!("{score:.3}\t{}\t{}", memory.id, memory.content);
            }
        }
        MemoryCommand::List => {
            for memory in app.memories.get_active(0.0).await? {
                println!("{}\t{:?}\t{:.2}\t{}", memory.id, memory.category, memory.confidence, memory.content);
            }
        }
        MemoryCommand::Forget { id } => app.memories.deactivate(&id).await?,
        MemoryCommand::Consolidate => {
            let engine = mama_core::memory::ConsolidationEngine::new(
                app.llm_router.clone(),
                app.embeddings.clone(),
                mama_core::memory::EpisodicStore::new(
                    mama_core::store::Store::open(app.home.join("mama.db")).await?,
                    app.embeddings.clone(),
                ),
                app.memories.clone(),
                mama_core::memory::DecayEngine::new(mama_core::memory::DecayConfig::default()),
            );
            let report = engine.run_consolidation(mama_core::memory::ConsolidationOptions::default(), None).await?;
            println!("{report:?}");
        }
        MemoryCommand::Stats => {
            let active = app.memories.get_active(0.0).await?;
            println!("active memories: {}", active.len());
        }
    }
    Ok(())
}

async fn run_cost_command(period: &str, app: &composition::App) -> Result<()> {
    let tracker = app.llm_router.get_cost_tracker();
    let summary = match period {
        "week" => tracker.this_week().await?,
        "month" => tracker.this_month().await?,
        "all" => tracker.all_time().await?,
        _ => tracker.today().await?,
    };
    println!("{summary:?}");
    Ok(())
}
