//! Working memory: the token-budgeted message buffer handed to the router
//! on every turn. Grounded on the teacher's `context/manager.rs` sliding
//! window, generalized from a fixed message count to an explicit token
//! budget with threshold-triggered compression.

use crate::llm::ChatMessage;

const CHARS_PER_TOKEN: usize = 4;
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// `ceil(len/4) + 4`, plus the JSON length of any tool-call payload.
fn message_tokens(message: &ChatMessage) -> usize {
    let mut tokens = message.content.len().div_ceil(CHARS_PER_TOKEN) + MESSAGE_OVERHEAD_TOKENS;
    for call in &message.tool_calls {
        let json = serde_json::to_string(&call.arguments).unwrap_or_default();
        tokens += json.len().div_ceil(CHARS_PER_TOKEN);
    }
    tokens
}

pub struct WorkingMemoryConfig {
    pub max_tokens: usize,
    pub compress_threshold: f32,
}

impl Default for WorkingMemoryConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8000,
            compress_threshold: 0.75,
        }
    }
}

pub struct WorkingMemory {
    config: WorkingMemoryConfig,
    messages: Vec<ChatMessage>,
    system_injection: Option<String>,
}

impl WorkingMemory {
    pub fn new(config: WorkingMemoryConfig) -> Self {
        Self {
            config,
            messages: vec![],
            system_injection: None,
        }
    }

    pub fn add_message(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn set_system_injection(&mut self, injection: Option<String>) {
        self.system_injection = injection;
    }

    pub fn system_injection(&self) -> Option<&str> {
        self.system_injection.as_deref()
    }

    pub fn token_count(&self) -> usize {
        self.messages.iter().map(message_tokens).sum()
    }

    /// Collapse all but the last 4 messages into a single summarized
    /// system message once token usage crosses `compress_threshold *
    /// max_tokens`. `summarizer` receives the messages being dropped.
    pub async fn compress<F, Fut>(&mut self, summarizer: F)
    where
        F: FnOnce(Vec<ChatMessage>) -> Fut,
        Fut: std::future::Future<Output = String>,
    {
        let threshold = (self.config.max_tokens as f32 * self.config.compress_threshold) as usize;
        if self.token_count() < threshold || self.messages.len() <= 4 {
            return;
        }
        let keep_from = self.messages.len() - 4;
        let to_summarize: Vec<ChatMessage> = self.messages.drain(..keep_from).collect();
        let summary = summarizer(to_summarize).await;
        let summary_message = ChatMessage::system(format!("[Previous conversation summary]: {summary}"));
        self.messages.insert(0, summary_message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_count_accumulates_across_messages() {
        let mut wm = WorkingMemory::new(WorkingMemoryConfig::default());
        wm.add_message(ChatMessage::user("hello there"));
        wm.add_message(ChatMessage::assistant("hi"));
        assert_eq!(wm.token_count(), message_tokens(&wm.messages[0]) + message_tokens(&wm.messages[1]));
    }

    #[tokio::test]
    async fn compress_collapses_all_but_last_four() {
        let config = WorkingMemoryConfig {
            max_tokens: 10,
            compress_threshold: 0.5,
        };
        let mut wm = WorkingMemory::new(config);
        for i in 0..10 {
            wm.add_message(ChatMessage::user(format!("message number {i}")));
        }
        wm.compress(|dropped| async move { format!("{} messages summarized", dropped.len()) }).await;
        assert_eq!(wm.messages().len(), 5);
        assert!(wm.messages()[0].content.contains("Previous conversation summary"));
    }

    #[tokio::test]
    async fn compress_is_noop_below_threshold() {
        let mut wm = WorkingMemory::new(WorkingMemoryConfig::default());
        wm.add_message(ChatMessage::user("hi"));
        wm.compress(|_| async move { "unused".to_string() }).await;
        assert_eq!(wm.messages().len(), 1);
    }
}
