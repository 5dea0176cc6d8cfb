//! Local HTTP API: loopback-only, bearer-token authenticated surface over
//! the agent loop, scheduler, audit log, memory search, and cost tracker.
//! Grounded on the same `axum::Router` + `State` shape as the webhook
//! server in `crate::triggers::webhook`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agent::{AgentLoop, NoopAgentEventSink};
use crate::llm::Router as LlmRouter;
use crate::memory::consolidated::SearchFilter;
use crate::memory::{EmbeddingService, SoulDocument};
use crate::sandbox::{AuditFilter, AuditStore};
use crate::scheduler::Scheduler;

pub struct HttpApiState {
    pub token: String,
    pub agent: Arc<AgentLoop>,
    pub soul: tokio::sync::RwLock<SoulDocument>,
    pub scheduler: Arc<Scheduler>,
    pub audit: Arc<AuditStore>,
    pub llm_router: Arc<LlmRouter>,
    pub embeddings: Arc<EmbeddingService>,
    pub memories: crate::memory::consolidated::ConsolidatedMemoryStore,
}

fn authorized(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {token}"))
        .unwrap_or(false)
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    message: String,
}

async fn post_message(
    State(state): State<Arc<HttpApiState>>,
    headers: HeaderMap,
    Json(body): Json<MessageRequest>,
) -> Response {
    if !authorized(&headers, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if body.message.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing 'message'"}))).into_response();
    }
    let soul = state.soul.read().await;
    match state.agent.handle_message(&body.message, "http", &soul, &NoopAgentEventSink).await {
        Ok(result) => Json(json!({
            "content": result.content,
            "model": result.model,
            "provider": result.provider,
        }))
        .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.user_message()}))).into_response(),
    }
}

async fn get_status(State(state): State<Arc<HttpApiState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let jobs = state.scheduler.list_jobs().await.unwrap_or_default();
    Json(json!({"jobs": jobs.len(), "uptime_ok": true})).into_response()
}

async fn get_jobs(State(state): State<Arc<HttpApiState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.scheduler.list_jobs().await {
        Ok(jobs) => Json(json!({"jobs": jobs})).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": e.user_message()}))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct CreateJobRequest {
    schedule: String,
    task: String,
    name: Option<String>,
}

async fn post_jobs(
    State(state): State<Arc<HttpApiState>>,
    headers: HeaderMap,
    Json(body): Json<CreateJobRequest>,
) -> Response {
    if !authorized(&headers, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if body.schedule.trim().is_empty() || body.task.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing 'schedule' or 'task'"}))).into_response();
    }
    match state.scheduler.create_job(body.name, &body.schedule, body.task).await {
        Ok(job) => (StatusCode::CREATED, Json(json!({"id": job.id}))).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e.user_message()}))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct AuditQuery {
    limit: Option<usize>,
}

async fn get_audit(State(state): State<Arc<HttpApiState>>, headers: HeaderMap, Query(q): Query<AuditQuery>) -> Response {
    if !authorized(&headers, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let limit = q.limit.unwrap_or(20).clamp(1, 100);
    match state.audit.query(&AuditFilter::default(), limit).await {
        Ok(entries) => Json(json!({"entries": entries})).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.user_message()}))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct MemorySearchQuery {
    q: Option<String>,
}

async fn get_memory_search(
    State(state): State<Arc<HttpApiState>>,
    headers: HeaderMap,
    Query(q): Query<MemorySearchQuery>,
) -> Response {
    if !authorized(&headers, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(query) = q.q.filter(|s| !s.trim().is_empty()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing 'q'"}))).into_response();
    };
    let embedding = state.embeddings.embed(&query).await.unwrap_or_default();
    match state.memories.search(&query, &embedding, &SearchFilter::default()).await {
        Ok(hits) => {
            let results: Vec<_> = hits.into_iter().map(|(score, memory)| json!({"score": score, "memory": memory})).collect();
            Json(json!({"result": results})).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.user_message()}))).into_response(),
    }
}

async fn get_cost(State(state): State<Arc<HttpApiState>>, headers: HeaderMap) -> Response {
    if !authorized(&headers, &state.token) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let tracker = state.llm_router.get_cost_tracker();
    match tracker.today().await {
        Ok(today) => Json(json!({"today": today})).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.user_message()}))).into_response(),
    }
}

async fn fallback() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

pub fn router(state: Arc<HttpApiState>) -> AxumRouter {
    AxumRouter::new()
        .route("/api/message", post(post_message))
        .route("/api/status", get(get_status))
        .route("/api/jobs", get(get_jobs).post(post_jobs))
        .route("/api/audit", get(get_audit))
        .route("/api/memory/search", get(get_memory_search))
        .route("/api/cost", get(get_cost))
        .fallback(fallback)
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: Arc<HttpApiState>) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedToken(pub String);

pub fn generate_token() -> String {
    uuid::Uuid::new_v4().to_string()
}
