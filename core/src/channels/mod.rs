//! External interfaces to the agent loop: a terminal REPL, a loopback-only
//! HTTP API, and a chat-bot adapter contract.

pub mod chatbot;
pub mod http;
pub mod terminal;

pub use chatbot::{ChatAdapter, FakeChatAdapter, IncomingMessage, SendOptions};
pub use http::HttpApiState;
pub use terminal::TerminalChannel;
