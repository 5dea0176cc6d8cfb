//! Chat-bot adapter contract: a long-polling style interface any bot
//! platform (Telegram, Slack, ...) implements. The daemon only depends on
//! this trait; a concrete long-poller is an integration detail outside
//! this crate's scope.

use async_trait::async_trait;

const MAX_MESSAGE_LEN: usize = 4096;
const APPROVAL_TIMEOUT_SECS: u64 = 5 * 60;

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub chat_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub parse_mode: Option<String>,
    pub disable_notification: bool,
    pub reply_markup: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalChoice {
    Approve,
    Deny,
    Always,
}

#[async_trait]
pub trait OnMessage: Send + Sync {
    async fn handle(&self, message: IncomingMessage);
}

#[async_trait]
pub trait OnCallback: Send + Sync {
    async fn handle(&self, request_id: String, choice: ApprovalChoice);
}

#[async_trait]
pub trait ChatAdapter: Send + Sync {
    async fn start(&self, on_message: Box<dyn OnMessage>, on_callback: Box<dyn OnCallback>);
    async fn stop(&self);
    async fn send_message(&self, chat_id: &str, text: &str, options: SendOptions) -> crate::error::Result<()>;
}

/// Splits on newlines where possible, never exceeding `MAX_MESSAGE_LEN`
/// per chunk; a single line longer than the limit is hard-cut.
pub fn split_for_delivery(text: &str) -> Vec<String> {
    let mut chunks = vec![];
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.len() + line.len() > MAX_MESSAGE_LEN {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if line.len() > MAX_MESSAGE_LEN {
                for hard_chunk in line.as_bytes().chunks(MAX_MESSAGE_LEN) {
                    chunks.push(String::from_utf8_lossy(hard_chunk).to_string());
                }
                continue;
            }
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

pub fn approval_timeout() -> std::time::Duration {
    std::time::Duration::from_secs(APPROVAL_TIMEOUT_SECS)
}

/// In-memory test double recording every call, used to exercise channel
/// wiring without a real bot platform.
pub struct FakeChatAdapter {
    pub sent: tokio::sync::Mutex<Vec<(String, String)>>,
}

impl FakeChatAdapter {
    pub fn new() -> Self {
        Self {
            sent: tokio::sync::Mutex::new(vec![]),
        }
    }
}

impl Default for FakeChatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatAdapter for FakeChatAdapter {
    async fn start(&self, _on_message: Box<dyn OnMessage>, _on_callback: Box<dyn OnCallback>) {}
    async fn stop(&self) {}
    async fn send_message(&self, chat_id: &str, text: &str, _options: SendOptions) -> crate::error::Result<()> {
        self.sent.lock().await.push((chat_id.to_string(), text.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_a_single_chunk() {
        assert_eq!(split_for_delivery("hello").len(), 1);
    }

    #[test]
    fn splits_long_text_on_newlines() {
        let line = "x".repeat(3000);
        let text = format!("{line}\n{line}\n{line}");
        let chunks = split_for_delivery(&text);
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.len() <= MAX_MESSAGE_LEN);
        }
    }

    #[tokio::test]
    async fn fake_adapter_records_sent_messages() {
        let adapter = FakeChatAdapter::new();
        adapter.send_message("chat-1", "hi", SendOptions::default()).await.unwrap();
        assert_eq!(adapter.sent.lock().await.len(), 1);
    }
}
