//! The sandbox: sole path from tool invocation to side effect.
//!
//! Composes a set of [`Capability`] implementations and an [`AuditStore`].
//! Every capability call flows through [`Sandbox::execute`], which runs the
//! permission pipeline, consults the approval handler when needed, invokes
//! the capability, and writes exactly one audit entry regardless of outcome.
//! The trait shape mirrors the teacher's per-tool trait object pattern
//! (`agent/tool.rs`'s `Tool` trait), generalized to a permission-aware
//! capability with a structured decision instead of a bare string result.

pub mod audit;
pub mod filesystem;
pub mod network;
pub mod shell;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::error::{MamaError, Result};
use crate::redact::truncate_utf8;
use crate::store::Store;

pub use audit::{AuditEntry, AuditFilter, AuditStore};

/// The outcome of a pure permission check, before any side effect runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Auto,
    Ask,
    RuleDenied,
}

/// What actually happened once a capability's `execute` ran (or didn't).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditDecision {
    AutoApproved,
    UserApproved,
    RuleDenied,
    UserDenied,
    Error,
}

impl AuditDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AutoApproved => "auto-approved",
            Self::UserApproved => "user-approved",
            Self::RuleDenied => "rule-denied",
            Self::UserDenied => "user-denied",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditResult {
    Success,
    Denied,
    Error,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }
}

/// The result of a capability's `execute`, before the sandbox wraps it into
/// an audit entry.
#[derive(Debug, Clone)]
pub struct CapabilityResult {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl CapabilityResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// A permission-bounded side-effect facility. Implemented by the filesystem,
/// shell, and network capabilities.
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    /// Pure decision query: would `execute` be allowed right now?
    async fn check_permission(&self, action: &str, resource: &str) -> PermissionDecision;

    /// Run the side effect. Only called after the permission pipeline allows
    /// it (and, for `ask`-level actions, after approval). `params` carries
    /// `__approved_by_user=true` when a human just approved this call.
    async fn execute(&self, action: &str, params: &Value) -> CapabilityResult;
}

/// Installed by the channel layer; resolves `ask`/`user-approved` decisions.
/// A single-slot callback — at most one approval request is outstanding per
/// (capability, action, resource) at any time, mirroring the teacher's
/// one-approval-in-flight discipline for shell confirmations.
#[async_trait]
pub trait ApprovalHandler: Send + Sync {
    async fn request_approval(&self, capability: &str, action: &str, resource: &str) -> bool;
}

/// The composition point that mediates every tool invocation.
pub struct Sandbox {
    capabilities: RwLock<HashMap<String, Arc<dyn Capability>>>,
    audit: AuditStore,
    approval_handler: Mutex<Option<Arc<dyn ApprovalHandler>>>,
}

impl Sandbox {
    pub fn new(audit: AuditStore) -> Self {
        Self {
            capabilities: RwLock::new(HashMap::new()),
            audit,
            approval_handler: Mutex::new(None),
        }
    }

    /// Register a capability. Idempotent by capability name.
    pub async fn register(&self, capability: Arc<dyn Capability>) {
        let mut caps = self.capabilities.write().await;
        caps.insert(capability.name().to_string(), capability);
    }

    pub async fn set_approval_handler(&self, handler: Arc<dyn ApprovalHandler>) {
        *self.approval_handler.lock().await = Some(handler);
    }

    /// Pure decision query, no side effect, no audit entry.
    pub async fn check(&self, cap_name: &str, action: &str, resource: &str) -> PermissionDecision {
        let caps = self.capabilities.read().await;
        match caps.get(cap_name) {
            Some(cap) => cap.check_permission(action, resource).await,
            None => PermissionDecision::RuleDenied,
        }
    }

    /// Run the full permission pipeline and, on allow, the capability.
    /// Always writes exactly one audit entry.
    pub async fn execute(
        &self,
        cap_name: &str,
        action: &str,
        params: Value,
        requested_by: &str,
    ) -> Result<CapabilityResult> {
        let started = Instant::now();
        let resource = derive_resource(&params);

        let cap = {
            let caps = self.capabilities.read().await;
            caps.get(cap_name).cloned()
        };
        let Some(cap) = cap else {
            self.audit(
                cap_name,
                action,
                &resource,
                &params,
                AuditDecision::RuleDenied,
                AuditResult::Denied,
                None,
                Some("Unknown capability"),
                started,
                requested_by,
            )
            .await;
            return Err(MamaError::UnknownCapability {
                name: cap_name.to_string(),
            });
        };

        let decision = cap.check_permission(action, &resource).await;
        if decision == PermissionDecision::RuleDenied {
            self.audit(
                cap_name,
                action,
                &resource,
                &params,
                AuditDecision::RuleDenied,
                AuditResult::Denied,
                None,
                Some("Denied by capability policy"),
                started,
                requested_by,
            )
            .await;
            return Ok(CapabilityResult::err("Denied by capability policy"));
        }

        let mut params = params;
        let audit_decision;
        if decision == PermissionDecision::Ask {
            let handler = self.approval_handler.lock().await.clone();
            let approved = match handler {
                Some(h) => h.request_approval(cap_name, action, &resource).await,
                None => false,
            };
            if !approved {
                self.audit(
                    cap_name,
                    action,
                    &resource,
                    &params,
                    AuditDecision::UserDenied,
                    AuditResult::Denied,
                    None,
                    Some("User denied the action"),
                    started,
                    requested_by,
                )
                .await;
                return Ok(CapabilityResult::err("User denied the action"));
            }
            if let Value::Object(ref mut map) = params {
                map.insert("__approved_by_user".to_string(), Value::Bool(true));
            }
            audit_decision = AuditDecision::UserApproved;
        } else {
            audit_decision = AuditDecision::AutoApproved;
        }

        let result = cap.execute(action, &params).await;
        let audit_result = if result.success {
            AuditResult::Success
        } else {
            AuditResult::Error
        };
        self.audit(
            cap_name,
            action,
            &resource,
            &params,
            audit_decision,
            audit_result,
            result.output.as_deref(),
            result.error.as_deref(),
            started,
            requested_by,
        )
        .await;

        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn audit(
        &self,
        capability: &str,
        action: &str,
        resource: &str,
        params: &Value,
        decision: AuditDecision,
        result: AuditResult,
        output: Option<&str>,
        error: Option<&str>,
        started: Instant,
        requested_by: &str,
    ) {
        let (truncated_output, _) =
            truncate_utf8(&crate::redact::redact(output.unwrap_or("")), 1024);
        let entry = AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            capability: capability.to_string(),
            action: action.to_string(),
            resource: crate::redact::redact(resource),
            params: crate::redact::redact(&redact_params(params)),
            decision: decision.as_str().to_string(),
            result: result.as_str().to_string(),
            output: if output.is_some() {
                Some(truncated_output)
            } else {
                None
            },
            error: error.map(crate::redact::redact),
            duration_ms: started.elapsed().as_millis() as u64,
            requested_by: requested_by.to_string(),
        };
        if let Err(e) = self.audit.append(entry).await {
            tracing::error!(error = %e, "failed to write audit entry");
        }
    }

    pub fn audit_store(&self) -> &AuditStore {
        &self.audit
    }
}

/// The first of `path`, `command`, `url` found in `params`, else empty.
fn derive_resource(params: &Value) -> String {
    for key in ["path", "command", "url"] {
        if let Some(v) = params.get(key).and_then(|v| v.as_str()) {
            return v.to_string();
        }
    }
    String::new()
}

fn redact_params(params: &Value) -> String {
    let mut params = params.clone();
    if let Value::Object(ref mut map) = params {
        if map.contains_key("content") {
            let len = map
                .get("content")
                .and_then(|v| v.as_str())
                .map(|s| s.len())
                .unwrap_or(0);
            map.insert("content_length".to_string(), Value::from(len));
            map.remove("content");
        }
    }
    params.to_string()
}

/// Build an [`AuditStore`] backed by `store`.
pub fn audit_store_for(store: Store) -> AuditStore {
    AuditStore::new(store)
}
