//! Triggers: reactive entry points into the agent loop that aren't on a
//! schedule — file-system changes and inbound webhooks. Both reuse the
//! scheduler's `RunTask` so the composition root wires a single agent-loop
//! closure into every subsystem.

pub mod filewatch;
pub mod webhook;

pub use filewatch::{FileWatchConfig, FileWatchEngine, WatchEvent};
pub use webhook::{WebhookConfig, WebhookServer};
