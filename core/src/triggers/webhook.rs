//! Webhook triggers: a small `axum` server exposing `POST /hooks/:id`, token
//! authenticated per hook, that fires a task fire-and-forget and responds
//! immediately. Grounded on the teacher's local HTTP API route layout
//! (`axum::Router`, `State` extractor, JSON body handling).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router as AxumRouter;
use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use crate::sandbox::audit::{AuditEntry, AuditStore};
use crate::scheduler::RunTask;

#[derive(Clone)]
pub struct WebhookConfig {
    pub id: String,
    pub token: String,
    pub task_template: String,
}

struct WebhookState {
    hooks: HashMap<String, WebhookConfig>,
    audit: Arc<AuditStore>,
    run_task: RunTask,
}

/// Fill `{payload}` with the raw request body, or a pretty-printed
/// representation if it parsed as JSON.
fn render_task(template: &str, payload: &str) -> String {
    template.replace("{payload}", payload)
}

fn extract_payload(body: &[u8]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => value.to_string(),
        Err(_) => String::from_utf8_lossy(body).to_string(),
    }
}

async fn handle_hook(
    State(state): State<Arc<WebhookState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> StatusCode {
    let Some(hook) = state.hooks.get(&id) else {
        return StatusCode::NOT_FOUND;
    };

    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {}", hook.token))
        .unwrap_or(false);
    if !authorized {
        return StatusCode::UNAUTHORIZED;
    }

    let payload = extract_payload(&body);
    let task = render_task(&hook.task_template, &payload);
    let run_task = Arc::clone(&state.run_task);
    let audit = Arc::clone(&state.audit);
    let hook_id = hook.id.clone();

    tokio::spawn(async move {
        let started = std::time::Instant::now();
        let result = run_task(task.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        let (output, error) = match &result {
            Ok(output) => (Some(output.clone()), None),
            Err(e) => (None, Some(e.user_message())),
        };
        if let Err(e) = audit
            .append(AuditEntry {
                id: uuid::Uuid::new_v4().to_string(),
                timestamp: Utc::now(),
                capability: "webhook".into(),
                action: "fire".into(),
                resource: hook_id,
                params: task,
                decision: "auto-approved".into(),
                result: if result.is_ok() { "success".into() } else { "error".into() },
                output: output.map(|o| crate::redact::truncate_utf8(&o, 1024).0),
                error,
                duration_ms,
                requested_by: "webhook".into(),
            })
            .await
        {
            warn!(error = %e, "failed to record webhook audit entry");
        }
    });

    StatusCode::ACCEPTED
}

pub struct WebhookServer {
    addr: SocketAddr,
    hooks: Vec<WebhookConfig>,
}

impl WebhookServer {
    pub fn new(addr: SocketAddr, hooks: Vec<WebhookConfig>) -> Self {
        Self { addr, hooks }
    }

    fn router(hooks: Vec<WebhookConfig>, audit: Arc<AuditStore>, run_task: RunTask) -> AxumRouter {
        let state = Arc::new(WebhookState {
            hooks: hooks.into_iter().map(|h| (h.id.clone(), h)).collect(),
            audit,
            run_task,
        });
        AxumRouter::new().route("/hooks/:id", post(handle_hook)).with_state(state)
    }

    pub async fn serve(self, audit: Arc<AuditStore>, run_task: RunTask) -> std::io::Result<()> {
        let app = Self::router(self.hooks, audit, run_task);
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn fake_runner() -> RunTask {
        Arc::new(|_task: String| Box::pin(async move { Ok("ok".to_string()) }))
    }

    fn hooks() -> Vec<WebhookConfig> {
        vec![WebhookConfig {
            id: "deploy".into(),
            token: "secret".into(),
            task_template: "handle payload: {payload}".into(),
        }]
    }

    #[tokio::test]
    async fn valid_token_returns_accepted() {
        let audit = Arc::new(AuditStore::in_memory());
        let app = WebhookServer::router(hooks(), audit, fake_runner());
        let response = app
            .oneshot(
                Request::post("/hooks/deploy")
                    .header("authorization", "Bearer secret")
                    .body(Body::from("{\"ok\":true}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn missing_token_is_rejected() {
        let audit = Arc::new(AuditStore::in_memory());
        let app = WebhookServer::router(hooks(), audit, fake_runner());
        let response = app
            .oneshot(Request::post("/hooks/deploy").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_hook_id_is_not_found() {
        let audit = Arc::new(AuditStore::in_memory());
        let app = WebhookServer::router(hooks(), audit, fake_runner());
        let response = app
            .oneshot(
                Request::post("/hooks/nope")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_route_is_not_found() {
        let audit = Arc::new(AuditStore::in_memory());
        let app = WebhookServer::router(hooks(), audit, fake_runner());
        let response = app.oneshot(Request::get("/anything").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
