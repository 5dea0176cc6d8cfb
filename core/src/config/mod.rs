//! Configuration: a single `config.yaml` layered over defaults and
//! `MAMA_*` environment variables via the `config` crate, with `${VAR}`
//! expansion applied to every string value before deserialization. Grounded
//! on the teacher's reliance on `config`/`serde_yml` for settings loading,
//! narrowed to the settings this daemon actually has: providers, routing,
//! paths, and the background services.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{MamaError, Result};
use crate::llm::TaskType;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProviderSettings {
    pub kind: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub smart_model: Option<String>,
    #[serde(default)]
    pub fast_model: Option<String>,
    #[serde(default)]
    pub embedding_model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval")]
    pub interval_minutes: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpApiSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_http_port")]
    pub port: u16,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_webhook_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}
fn default_heartbeat_interval() -> u32 {
    30
}
fn default_http_port() -> u16 {
    8787
}
fn default_webhook_port() -> u16 {
    8788
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MamaConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    pub providers: HashMap<String, ProviderSettings>,
    #[serde(default)]
    pub routing: HashMap<String, String>,
    #[serde(default)]
    pub scheduler: Option<SchedulerSettings>,
    #[serde(default)]
    pub heartbeat: Option<HeartbeatSettings>,
    #[serde(default)]
    pub http_api: Option<HttpApiSettings>,
    #[serde(default)]
    pub webhook: Option<WebhookSettings>,
}

impl MamaConfig {
    pub fn routing_for(&self, task_type: TaskType) -> Option<&str> {
        let key = match task_type {
            TaskType::ComplexReasoning => "complex_reasoning",
            TaskType::CodeGeneration => "code_generation",
            TaskType::SimpleTasks => "simple_tasks",
            TaskType::Embeddings => "embeddings",
            TaskType::MemoryConsolidation => "memory_consolidation",
            TaskType::PrivateContent => "private_content",
            TaskType::General => "general",
        };
        self.routing.get(key).map(String::as_str)
    }
}

/// Directory layout per deployment: `~/.mama/` (or `$MAMA_HOME`), holding
/// `config.yaml`, `mama.db`, `logs/`, `mama.pid`, `soul.md`, `heartbeat.md`,
/// `workspace/`.
pub fn home_dir() -> PathBuf {
    if let Ok(path) = std::env::var("MAMA_HOME") {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(path).join("mama");
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".mama")
}

lazy_static! {
    static ref VAR_PATTERN: Regex = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
}

/// Replace every `${VAR}` with the environment variable's value, or the
/// empty string if unset.
fn expand_vars(input: &str) -> String {
    VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| std::env::var(&caps[1]).unwrap_or_default())
        .into_owned()
}

fn expand_value(value: &mut serde_yml::Value) {
    match value {
        serde_yml::Value::String(s) => *s = expand_vars(s),
        serde_yml::Value::Sequence(items) => items.iter_mut().for_each(expand_value),
        serde_yml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                expand_value(v);
            }
        }
        _ => {}
    }
}

/// Loads `config.yaml`, expands `${VAR}` references in its string values,
/// then layers `MAMA__section__key`-style environment overrides on top via
/// the `config` crate before deserializing into [`MamaConfig`].
pub async fn load(path: &Path) -> Result<MamaConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| MamaError::InvalidConfig {
            message: format!("failed to read {}: {e}", path.display()),
        })?;
    let mut value: serde_yml::Value = serde_yml::from_str(&raw).map_err(|e| MamaError::InvalidConfig {
        message: format!("failed to parse {}: {e}", path.display()),
    })?;
    expand_value(&mut value);
    let expanded_yaml = serde_yml::to_string(&value).map_err(|e| MamaError::InvalidConfig {
        message: format!("failed to re-serialize expanded config: {e}"),
    })?;

    let settings = config::Config::builder()
        .add_source(config::File::from_str(&expanded_yaml, config::FileFormat::Yaml))
        .add_source(config::Environment::with_prefix("MAMA").separator("__"))
        .build()
        .map_err(|e| MamaError::InvalidConfig {
            message: format!("failed to build configuration from {}: {e}", path.display()),
        })?;

    settings.try_deserialize().map_err(|e| MamaError::InvalidConfig {
        message: format!("invalid configuration in {}: {e}", path.display()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_vars_substitutes_known_and_blanks_unknown() {
        std::env::set_var("MAMA_TEST_VAR", "resolved");
        assert_eq!(expand_vars("prefix-${MAMA_TEST_VAR}-suffix"), "prefix-resolved-suffix");
        assert_eq!(expand_vars("${MAMA_DEFINITELY_UNSET_VAR}"), "");
    }

    #[tokio::test]
    async fn load_parses_yaml_and_expands_nested_vars() {
        std::env::set_var("MAMA_TEST_KEY", "sk-test-123");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        tokio::fs::write(
            &path,
            "providers:\n  cloud:\n    kind: anthropic\n    api_key: \"${MAMA_TEST_KEY}\"\nrouting:\n  general: cloud\n",
        )
        .await
        .unwrap();
        let config = load(&path).await.unwrap();
        assert_eq!(config.providers["cloud"].api_key.as_deref(), Some("sk-test-123"));
        assert_eq!(config.routing_for(TaskType::General), Some("cloud"));
    }

    #[tokio::test]
    async fn load_errors_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("missing.yaml")).await.is_err());
    }
}
