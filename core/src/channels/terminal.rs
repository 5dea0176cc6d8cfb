//! Terminal channel: a synchronous read-eval-print loop over stdin/stdout.
//! Grounded on the teacher's `terminal/app.rs` REPL shape, stripped down to
//! the line-reading loop since this crate's TUI concerns live in the
//! channel, not a separate terminal app crate.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::agent::{AgentLoop, NoopAgentEventSink};
use crate::error::Result;
use crate::memory::SoulDocument;

pub const CHANNEL_NAME: &str = "terminal";

pub struct TerminalChannel {
    agent: Arc<AgentLoop>,
}

impl TerminalChannel {
    pub fn new(agent: Arc<AgentLoop>) -> Self {
        Self { agent }
    }

    /// Runs until stdin closes. Each line becomes one turn.
    pub async fn run(&self, soul: &SoulDocument) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        while let Some(line) = lines.next_line().await.map_err(|e| crate::error::MamaError::Internal {
            message: e.to_string(),
        })? {
            if line.trim().is_empty() {
                continue;
            }
            let result = self.agent.handle_message(&line, CHANNEL_NAME, soul, &NoopAgentEventSink).await?;
            println!("{}", result.content);
        }
        Ok(())
    }
}
