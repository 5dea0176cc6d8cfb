//! LLM Router: provider fallback, cost tracking, task-type-keyed routing.
//!
//! Grounded on the teacher's `llm/client.rs` (`LlmClient`, `LlmProvider`
//! enum, retry/backoff with jitter) and `llm/chat.rs` (`ChatMessage`,
//! `ChatRequest`, `Usage`), generalized from a single client's retry policy
//! into the two-tier primary/fallback routing this crate needs.

pub mod cost;
pub mod provider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MamaError, Result};
pub use cost::CostTracker;
pub use provider::{CloudProvider, LlmProviderClient, LocalProvider};

/// Role of a message in a chat-style request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: vec![],
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: vec![],
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            name: None,
            tool_call_id: None,
            tool_calls: vec![],
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            name: None,
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A tool definition exported to the router so the provider can offer it to
/// the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// The task categories the routing map is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ComplexReasoning,
    CodeGeneration,
    SimpleTasks,
    Embeddings,
    MemoryConsolidation,
    PrivateContent,
    General,
}

#[derive(Debug)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    pub task_type: TaskType,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tools: Option<Vec<ToolDefinition>>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>, task_type: TaskType) -> Self {
        Self {
            messages,
            system_prompt: None,
            task_type,
            model: None,
            temperature: None,
            max_tokens: None,
            tools: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
    pub model: String,
    pub provider: String,
    pub finish_reason: String,
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub provider: String,
    pub model: String,
    pub reason: String,
}

/// Per-provider, per-task model selection. Cloud providers always use their
/// configured default; local providers choose among smart/fast/embedding
/// models by task type, per spec §4.6.
#[derive(Debug, Clone, Default)]
pub struct ModelSelection {
    pub default_model: String,
    pub smart_model: Option<String>,
    pub fast_model: Option<String>,
    pub embedding_model: Option<String>,
}

impl ModelSelection {
    pub fn model_for(&self, task_type: TaskType) -> &str {
        match task_type {
            TaskType::ComplexReasoning | TaskType::CodeGeneration | TaskType::MemoryConsolidation => {
                self.smart_model.as_deref().unwrap_or(&self.default_model)
            }
            TaskType::SimpleTasks | TaskType::PrivateContent => {
                self.fast_model.as_deref().unwrap_or(&self.default_model)
            }
            TaskType::Embeddings => self
                .embedding_model
                .as_deref()
                .unwrap_or(&self.default_model),
            TaskType::General => &self.default_model,
        }
    }
}

struct RegisteredProvider {
    client: Arc<dyn LlmProviderClient>,
    models: ModelSelection,
}

/// Composes one or more providers and a cost tracker. The single choke point
/// the agent loop, planner, scheduler, and consolidation engine all call
/// through.
pub struct Router {
    routing_map: HashMap<TaskType, String>,
    providers: HashMap<String, RegisteredProvider>,
    primary: Option<String>,
    fallback: Option<String>,
    cost_tracker: CostTracker,
}

impl Router {
    pub fn new(cost_tracker: CostTracker) -> Self {
        Self {
            routing_map: HashMap::new(),
            providers: HashMap::new(),
            primary: None,
            fallback: None,
            cost_tracker,
        }
    }

    pub fn register_provider(
        &mut self,
        name: impl Into<String>,
        client: Arc<dyn LlmProviderClient>,
        models: ModelSelection,
    ) {
        let name = name.into();
        if self.primary.is_none() {
            self.primary = Some(name.clone());
        } else if self.fallback.is_none() {
            self.fallback = Some(name.clone());
        }
        self.providers.insert(name, RegisteredProvider { client, models });
    }

    pub fn set_route(&mut self, task_type: TaskType, provider_name: impl Into<String>) {
        self.routing_map.insert(task_type, provider_name.into());
    }

    pub fn route(&self, task_type: TaskType) -> Result<RouteDecision> {
        let provider_name = self
            .routing_map
            .get(&task_type)
            .cloned()
            .or_else(|| self.primary.clone())
            .ok_or(MamaError::NoProvidersAvailable)?;
        let registered = self
            .providers
            .get(&provider_name)
            .ok_or(MamaError::NoProvidersAvailable)?;
        let model = registered.models.model_for(task_type).to_string();
        Ok(RouteDecision {
            provider: provider_name,
            model,
            reason: format!("routed {:?} to {}", task_type, "configured mapping"),
        })
    }

    pub fn get_cost_tracker(&self) -> &CostTracker {
        &self.cost_tracker
    }

    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let decision = self.route(request.task_type)?;
        let primary_name = decision.provider.clone();

        match self.call_provider(&primary_name, &decision.model, &request).await {
            Ok(resp) => {
                self.record_usage(&resp).await;
                Ok(resp)
            }
            Err(primary_err) => {
                warn!(provider = %primary_name, error = %primary_err, "primary LLM provider failed");
                let fallback_name = self
                    .providers
                    .keys()
                    .find(|k| k.as_str() != primary_name)
                    .cloned();
                let Some(fallback_name) = fallback_name else {
                    return Err(primary_err);
                };
                let fallback_model = self.providers[&fallback_name]
                    .models
                    .model_for(request.task_type)
                    .to_string();
                match self
                    .call_provider(&fallback_name, &fallback_model, &request)
                    .await
                {
                    Ok(resp) => {
                        self.record_usage(&resp).await;
                        Ok(resp)
                    }
                    Err(fallback_err) => Err(MamaError::AllProvidersFailed {
                        primary: primary_err.to_string(),
                        fallback: fallback_err.to_string(),
                    }),
                }
            }
        }
    }

    async fn call_provider(
        &self,
        name: &str,
        model: &str,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse> {
        let registered = self
            .providers
            .get(name)
            .ok_or(MamaError::NoProvidersAvailable)?;
        let started = Instant::now();
        let mut req = request.clone();
        req.model = Some(model.to_string());
        let mut resp = registered.client.complete(&req).await?;
        resp.provider = name.to_string();
        resp.model = model.to_string();
        let _elapsed = started.elapsed();
        Ok(resp)
    }

    async fn record_usage(&self, resp: &CompletionResponse) {
        if let Err(e) = self
            .cost_tracker
            .record(
                &resp.provider,
                &resp.model,
                resp.usage.input_tokens,
                resp.usage.output_tokens,
                "general",
                0,
            )
            .await
        {
            warn!(error = %e, "failed to record LLM usage");
        }
    }

    /// Produce an embedding via whichever registered provider supports it.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        for registered in self.providers.values() {
            if let Some(vec) = registered.client.embed(text).await? {
                return Ok(vec);
            }
        }
        Err(MamaError::NoProvidersAvailable)
    }
}

impl Clone for CompletionRequest {
    fn clone(&self) -> Self {
        Self {
            messages: self.messages.clone(),
            system_prompt: self.system_prompt.clone(),
            task_type: self.task_type,
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: self.tools.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct FakeProvider {
        fail: bool,
    }

    #[async_trait]
    impl LlmProviderClient for FakeProvider {
        async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse> {
            if self.fail {
                return Err(MamaError::ProviderError {
                    provider: "fake".into(),
                    message: "boom".into(),
                });
            }
            Ok(CompletionResponse {
                content: "hello".into(),
                tool_calls: vec![],
                usage: TokenUsage {
                    input_tokens: 10,
                    output_tokens: 5,
                },
                model: "fake-model".into(),
                provider: "fake".into(),
                finish_reason: "stop".into(),
            })
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn embed(&self, _text: &str) -> Result<Option<Vec<f32>>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn falls_back_on_primary_failure() {
        let store = crate::store::Store::open_in_memory().await.unwrap();
        let tracker = CostTracker::new(store);
        let mut router = Router::new(tracker);
        router.register_provider(
            "primary",
            Arc::new(FakeProvider { fail: true }),
            ModelSelection {
                default_model: "p-model".into(),
                ..Default::default()
            },
        );
        router.register_provider(
            "fallback",
            Arc::new(FakeProvider { fail: false }),
            ModelSelection {
                default_model: "f-model".into(),
                ..Default::default()
            },
        );
        let resp = router
            .complete(CompletionRequest::new(
                vec![ChatMessage::user("hi")],
                TaskType::General,
            ))
            .await
            .unwrap();
        assert_eq!(resp.provider, "fallback");
    }

    #[tokio::test]
    async fn errors_when_no_providers_registered() {
        let store = crate::store::Store::open_in_memory().await.unwrap();
        let tracker = CostTracker::new(store);
        let router = Router::new(tracker);
        let result = router
            .complete(CompletionRequest::new(vec![], TaskType::General))
            .await;
        assert!(result.is_err());
    }
}
