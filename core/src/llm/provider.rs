//! Provider implementations behind the opaque `LlmProviderClient` trait.
//!
//! Grounded on the teacher's `llm/client.rs`: both built-ins speak the same
//! OpenAI-compatible wire format the teacher's `LlmProvider::OpenAiCompatible`
//! variant targets, differing only in base URL and model bookkeeping — the
//! same "cloud vs local" split the teacher draws.

use async_trait::async_trait;
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{sleep, Duration};

use super::{CompletionRequest, CompletionResponse, MessageRole, TokenUsage, ToolCall};
use crate::error::{MamaError, Result};

const MAX_RETRIES: u32 = 3;

#[async_trait]
pub trait LlmProviderClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
    async fn is_available(&self) -> bool;
    /// `Ok(None)` means this provider does not support embeddings.
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunctionCall,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn role_str(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::Tool => "tool",
    }
}

fn build_wire_request<'a>(request: &'a CompletionRequest, model: &'a str) -> WireRequest<'a> {
    let mut messages = vec![];
    if let Some(system) = &request.system_prompt {
        messages.push(WireMessage {
            role: "system".to_string(),
            content: system.clone(),
            tool_call_id: None,
        });
    }
    for m in &request.messages {
        messages.push(WireMessage {
            role: role_str(m.role).to_string(),
            content: m.content.clone(),
            tool_call_id: m.tool_call_id.clone(),
        });
    }
    let tools = request.tools.as_ref().map(|tools| {
        json!(tools
            .iter()
            .map(|t| json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            }))
            .collect::<Vec<_>>())
    });
    WireRequest {
        model,
        messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        tools,
    }
}

async fn retrying_post(
    client: &Client,
    url: &str,
    api_key: &Option<String>,
    body: &impl Serialize,
) -> Result<reqwest::Response> {
    let mut attempt = 0;
    loop {
        let mut builder = client.post(url).json(body);
        if let Some(key) = api_key {
            builder = builder.bearer_auth(key);
        }
        match builder.send().await {
            Ok(resp) if resp.status().is_success() => return Ok(resp),
            Ok(resp) => {
                let status = resp.status();
                let retryable = matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504);
                if !retryable || attempt >= MAX_RETRIES {
                    let text = resp.text().await.unwrap_or_default();
                    return Err(MamaError::ProviderError {
                        provider: url.to_string(),
                        message: format!("HTTP {status}: {text}"),
                    });
                }
            }
            Err(e) => {
                if attempt >= MAX_RETRIES {
                    return Err(MamaError::from(e));
                }
            }
        }
        let jitter_ms = rand::thread_rng().gen_range(0..250);
        let backoff = Duration::from_millis(200 * 2u64.pow(attempt) + jitter_ms);
        sleep(backoff).await;
        attempt += 1;
    }
}

fn parse_response(body: WireResponse) -> Result<CompletionResponse> {
    let choice = body
        .choices
        .into_iter()
        .next()
        .ok_or(MamaError::JsonExtractionFailed)?;
    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id,
            name: tc.function.name,
            arguments: serde_json::from_str(&tc.function.arguments)
                .unwrap_or(serde_json::Value::Null),
        })
        .collect();
    let usage = body
        .usage
        .map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or(TokenUsage {
            input_tokens: 0,
            output_tokens: 0,
        });
    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage,
        model: String::new(),
        provider: String::new(),
        finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
    })
}

/// Cloud provider: an OpenAI-compatible hosted endpoint (OpenAI,
/// OpenRouter, etc.), always uses its configured default model.
pub struct CloudProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    embedding_url: Option<String>,
}

impl CloudProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key,
            embedding_url: None,
        }
    }

    pub fn with_embeddings(mut self, embedding_url: impl Into<String>) -> Self {
        self.embedding_url = Some(embedding_url.into());
        self
    }
}

#[async_trait]
impl LlmProviderClient for CloudProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let model = request.model.as_deref().unwrap_or("gpt-4o-mini");
        let wire = build_wire_request(request, model);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let resp = retrying_post(&self.client, &url, &self.api_key, &wire).await?;
        let body: WireResponse = resp.json().await.map_err(MamaError::from)?;
        parse_response(body)
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url.trim_end_matches('/')))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let Some(url) = &self.embedding_url else {
            return Ok(None);
        };
        #[derive(Serialize)]
        struct EmbedRequest<'a> {
            model: &'a str,
            input: &'a str,
        }
        #[derive(Deserialize)]
        struct EmbedData {
            embedding: Vec<f32>,
        }
        #[derive(Deserialize)]
        struct EmbedResponse {
            data: Vec<EmbedData>,
        }
        let body = EmbedRequest {
            model: "text-embedding-3-small",
            input: text,
        };
        let resp = retrying_post(&self.client, url, &self.api_key, &body).await?;
        let parsed: EmbedResponse = resp.json().await.map_err(MamaError::from)?;
        Ok(parsed.data.into_iter().next().map(|d| d.embedding))
    }
}

/// Local provider: same OpenAI-compatible wire format, pointed at a
/// self-hosted endpoint (Ollama, LM Studio). No API key required.
pub struct LocalProvider {
    client: Client,
    base_url: String,
}

impl LocalProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl LlmProviderClient for LocalProvider {
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let model = request.model.as_deref().unwrap_or("llama3");
        let wire = build_wire_request(request, model);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let resp = retrying_post(&self.client, &url, &None, &wire).await?;
        let body: WireResponse = resp.json().await.map_err(MamaError::from)?;
        parse_response(body)
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url.trim_end_matches('/')))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>> {
        #[derive(Serialize)]
        struct EmbedRequest<'a> {
            model: &'a str,
            input: &'a str,
        }
        #[derive(Deserialize)]
        struct EmbedData {
            embedding: Vec<f32>,
        }
        #[derive(Deserialize)]
        struct EmbedResponse {
            data: Vec<EmbedData>,
        }
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let body = EmbedRequest {
            model: "nomic-embed-text",
            input: text,
        };
        let resp = retrying_post(&self.client, &url, &None, &body).await?;
        let parsed: EmbedResponse = resp.json().await.map_err(MamaError::from)?;
        Ok(parsed.data.into_iter().next().map(|d| d.embedding))
    }
}
