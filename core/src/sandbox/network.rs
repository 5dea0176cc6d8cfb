//! Network capability: domain allow/ask/deny with a sliding-window rate
//! limiter, grounded on the spirit of the teacher's `rate_limiter.rs`
//! (timestamp-window counting) generalized to per-host HTTP requests.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::{Capability, CapabilityResult, PermissionDecision};

const RESPONSE_CHAR_CAP: usize = 10_000;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub allowed_domains: Vec<String>,
    pub ask_domains: bool,
    pub rate_limit_per_minute: usize,
    pub log_all_requests: bool,
}

pub struct NetworkCapability {
    config: NetworkConfig,
    client: Client,
    session_approved: StdMutex<HashSet<String>>,
    request_timestamps: StdMutex<VecDeque<Instant>>,
}

impl NetworkCapability {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            client: Client::new(),
            session_approved: StdMutex::new(HashSet::new()),
            request_timestamps: StdMutex::new(VecDeque::new()),
        }
    }

    fn host_of(url: &str) -> Option<String> {
        url::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string))
    }

    fn decide_host(&self, host: &str) -> PermissionDecision {
        if self.config.allowed_domains.iter().any(|d| d == host)
            || self.session_approved.lock().unwrap().contains(host)
        {
            PermissionDecision::Auto
        } else if self.config.ask_domains {
            PermissionDecision::Ask
        } else {
            PermissionDecision::RuleDenied
        }
    }

    /// Sliding 60s window; returns true if the request may proceed.
    fn check_rate_limit(&self) -> bool {
        let mut stamps = self.request_timestamps.lock().unwrap();
        let now = Instant::now();
        while stamps
            .front()
            .map(|t| now.duration_since(*t) > Duration::from_secs(60))
            .unwrap_or(false)
        {
            stamps.pop_front();
        }
        if stamps.len() >= self.config.rate_limit_per_minute {
            false
        } else {
            stamps.push_back(now);
            true
        }
    }
}

#[async_trait]
impl Capability for NetworkCapability {
    fn name(&self) -> &str {
        "network"
    }

    async fn check_permission(&self, _action: &str, resource: &str) -> PermissionDecision {
        match Self::host_of(resource) {
            Some(host) => self.decide_host(&host),
            None => PermissionDecision::RuleDenied,
        }
    }

    async fn execute(&self, _action: &str, params: &Value) -> CapabilityResult {
        let Some(url) = params.get("url").and_then(|v| v.as_str()) else {
            return CapabilityResult::err("missing 'url' parameter");
        };
        let method = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let allowed_methods = [
            "GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS",
        ];
        if !allowed_methods.contains(&method.as_str()) {
            return CapabilityResult::err(format!("unsupported method: {method}"));
        }

        if !self.check_rate_limit() {
            return CapabilityResult::err(format!(
                "rate limit exceeded: {} requests/min",
                self.config.rate_limit_per_minute
            ));
        }

        let Some(host) = Self::host_of(url) else {
            return CapabilityResult::err("invalid URL");
        };

        let mut builder = self.client.request(
            method.parse().unwrap_or(reqwest::Method::GET),
            url,
        );
        if !matches!(method.as_str(), "GET" | "HEAD") {
            if let Some(body) = params.get("body").and_then(|v| v.as_str()) {
                builder = builder.body(body.to_string());
            }
        }

        match builder.send().await {
            Ok(resp) => {
                let status = resp.status();
                match resp.text().await {
                    Ok(text) => {
                        self.session_approved.lock().unwrap().insert(host);
                        let truncated = text.chars().count() > RESPONSE_CHAR_CAP;
                        let body: String = text.chars().take(RESPONSE_CHAR_CAP).collect();
                        if status.is_success() {
                            CapabilityResult::ok(
                                serde_json::json!({
                                    "status": status.as_u16(),
                                    "body": body,
                                    "truncated": truncated,
                                })
                                .to_string(),
                            )
                        } else {
                            CapabilityResult::err(format!("HTTP {}: {}", status.as_u16(), body))
                        }
                    }
                    Err(e) => CapabilityResult::err(e.to_string()),
                }
            }
            Err(e) => CapabilityResult::err(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(rate_limit: usize) -> NetworkCapability {
        NetworkCapability::new(NetworkConfig {
            allowed_domains: vec!["example.com".to_string()],
            ask_domains: true,
            rate_limit_per_minute: rate_limit,
            log_all_requests: false,
        })
    }

    #[tokio::test]
    async fn allowed_domain_is_auto() {
        let cap = cap(10);
        let decision = cap.check_permission("GET", "https://example.com/path").await;
        assert_eq!(decision, PermissionDecision::Auto);
    }

    #[tokio::test]
    async fn unknown_domain_is_ask_when_configured() {
        let cap = cap(10);
        let decision = cap.check_permission("GET", "https://other.com").await;
        assert_eq!(decision, PermissionDecision::Ask);
    }

    #[test]
    fn rate_limit_triggers_exactly_at_threshold() {
        let cap = cap(3);
        assert!(cap.check_rate_limit());
        assert!(cap.check_rate_limit());
        assert!(cap.check_rate_limit());
        assert!(!cap.check_rate_limit());
    }
}
