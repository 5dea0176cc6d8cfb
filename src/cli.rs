//! Command-line surface. Grounded on the teacher's `cli/mod.rs` shape
//! (`Parser`/`Subcommand` over `clap`'s derive macros), generalized from a
//! one-shot terminal-assistant query into the daemon's lifecycle and the
//! thin wrappers spec names over its scheduler/memory/cost APIs.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mama")]
#[command(about = "Personal-assistant daemon: a sandboxed agent loop over terminal, HTTP, and chat channels")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the background daemon process (default: run in the foreground).
    Daemon {
        #[command(subcommand)]
        command: Option<DaemonCommand>,
    },
    /// Manage scheduled jobs.
    Scheduler {
        #[command(subcommand)]
        command: SchedulerCommand,
    },
    /// Inspect and manage long-term memory.
    Memory {
        #[command(subcommand)]
        command: MemoryCommand,
    },
    /// Show LLM spend.
    Cost {
        #[arg(long, default_value = "today")]
        period: String,
    },
}

#[derive(Subcommand, Default)]
pub enum DaemonCommand {
    /// Start the daemon in the background.
    Start,
    /// Stop the running daemon.
    Stop,
    /// Report whether the daemon is running.
    Status,
    /// Tail the daemon's log file.
    Logs {
        #[arg(long, default_value_t = 100)]
        lines: usize,
    },
    /// Run every service in this process, attached to the terminal.
    #[default]
    Foreground,
}

#[derive(Subcommand)]
pub enum SchedulerCommand {
    List,
    Create {
        schedule: String,
        task: String,
        #[arg(long)]
        name: Option<String>,
    },
    Enable { id: String },
    Disable { id: String },
    Delete { id: String },
}

#[derive(Subcommand)]
pub enum MemoryCommand {
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        top_k: usize,
    },
    List,
    Forget { id: String },
    Consolidate,
    Stats,
}
