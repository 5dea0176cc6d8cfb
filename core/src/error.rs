//! Structured error types for mama
//!
//! Provides type-safe error handling with rich context for debugging,
//! user-friendly messages, and audit-safe (redacted) display.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Primary error type for mama operations
#[derive(Error, Debug)]
pub enum MamaError {
    // =========================================================================
    // Configuration errors (fatal at startup)
    // =========================================================================
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("missing required configuration: {key}")]
    MissingConfig { key: String },

    // =========================================================================
    // Sandbox / permission errors
    // =========================================================================
    /// A capability's permission pipeline denied the action outright.
    #[error("rule denied: {reason}")]
    RuleDenied { reason: String },

    /// A human approver rejected an `ask`/`user-approved` action.
    #[error("user denied the action")]
    UserDenied,

    /// The sandbox was asked for a capability name it has no registration for.
    #[error("unknown capability: {name}")]
    UnknownCapability { name: String },

    // =========================================================================
    // Tool execution errors
    // =========================================================================
    #[error("tool not found: {tool_name}")]
    ToolNotFound { tool_name: String },

    #[error("invalid tool parameters: {reason}")]
    InvalidToolParameters { reason: String },

    #[error("tool execution failed: {tool_name} - {error}")]
    ToolExecutionFailed { tool_name: String, error: String },

    #[error("tool timeout: {tool_name} after {duration:?}")]
    ToolTimeout { tool_name: String, duration: Duration },

    // =========================================================================
    // LLM provider / router errors
    // =========================================================================
    #[error("no LLM providers available")]
    NoProvidersAvailable,

    #[error("provider error: {provider} - {message}")]
    ProviderError { provider: String, message: String },

    #[error("all providers failed: {primary} then {fallback}")]
    AllProvidersFailed { primary: String, fallback: String },

    #[error("rate limit exceeded: {limit_type}")]
    RateLimitExceeded { limit_type: String },

    #[error("context window exceeded. Max: {max_tokens}, Used: {used_tokens}")]
    ContextWindowExceeded {
        max_tokens: usize,
        used_tokens: usize,
    },

    // =========================================================================
    // Parsing / schema errors (never fatal, degrade gracefully per spec)
    // =========================================================================
    #[error("schema validation failed: {message}")]
    SchemaValidation { message: String },

    #[error("could not extract JSON from response")]
    JsonExtractionFailed,

    #[error("invalid cron expression: {expression}")]
    InvalidCronExpression { expression: String },

    // =========================================================================
    // Persistence errors
    // =========================================================================
    #[error("migration {version} failed: {message}")]
    MigrationFailed { version: i64, message: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("record not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    // =========================================================================
    // Filesystem / path errors
    // =========================================================================
    #[error("invalid path: {path}")]
    InvalidPath { path: String },

    #[error("path traversal detected: {path}")]
    PathTraversal { path: String },

    #[error("file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("file too large: {path} ({size} bytes, max {max})")]
    FileTooLarge {
        path: String,
        size: usize,
        max: usize,
    },

    // =========================================================================
    // Network / system errors
    // =========================================================================
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("service temporarily unavailable")]
    ServiceUnavailable,

    // =========================================================================
    // Daemon errors
    // =========================================================================
    #[error("daemon already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("daemon not running")]
    NotRunning,

    // =========================================================================
    // Internal errors
    // =========================================================================
    #[error("internal error: {message}")]
    Internal { message: String },

    #[error("unexpected state: {description}")]
    UnexpectedState { description: String },

    // =========================================================================
    // External error wrappers (transparent)
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl MamaError {
    /// Check if error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::Timeout { .. } => true,
            Self::ServiceUnavailable => true,
            Self::RateLimitExceeded { .. } => true,
            Self::ToolTimeout { .. } => true,
            Self::ProviderError { .. } => true,
            Self::Database(_) => false,
            Self::Io(io_err) => matches!(
                io_err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Suggested retry delay for retryable errors.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { .. } => Some(Duration::from_secs(5)),
            Self::Timeout { .. } => Some(Duration::from_secs(1)),
            Self::ConnectionFailed { .. } => Some(Duration::from_secs(2)),
            Self::ServiceUnavailable => Some(Duration::from_secs(10)),
            _ => None,
        }
    }

    /// Whether this error can only be resolved by a human (config fix, approval).
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig { .. }
                | Self::MissingConfig { .. }
                | Self::UserDenied
                | Self::AlreadyRunning { .. }
        )
    }

    /// True for the family of "sandbox said no" outcomes; these are reported as
    /// `{success:false, error}` rather than surfaced as hard failures.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            Self::RuleDenied { .. } | Self::UserDenied | Self::UnknownCapability { .. }
        )
    }

    /// User-facing message, already redacted.
    pub fn user_message(&self) -> String {
        crate::redact::redact(&self.to_string())
    }
}

impl From<anyhow::Error> for MamaError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
            return Self::Io(std::io::Error::new(io_err.kind(), io_err.to_string()));
        }
        Self::Internal {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for MamaError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

impl From<rusqlite::Error> for MamaError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<reqwest::Error> for MamaError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

/// Result type alias using MamaError
pub type Result<T> = std::result::Result<T, MamaError>;

/// Extension trait for converting Option to Result with MamaError
pub trait OptionExt<T> {
    fn ok_or_not_found(self, path: impl Into<PathBuf>) -> Result<T>;
    fn ok_or_missing(self, key: impl Into<String>) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, path: impl Into<PathBuf>) -> Result<T> {
        self.ok_or_else(|| MamaError::FileNotFound { path: path.into() })
    }

    fn ok_or_missing(self, key: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| MamaError::MissingConfig { key: key.into() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(MamaError::Timeout {
            duration: Duration::from_secs(30)
        }
        .is_retryable());
        assert!(!MamaError::UserDenied.is_retryable());
        assert!(!MamaError::InvalidConfig {
            message: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_permission_denied_family() {
        assert!(MamaError::RuleDenied {
            reason: "x".into()
        }
        .is_permission_denied());
        assert!(MamaError::UserDenied.is_permission_denied());
        assert!(!MamaError::Timeout {
            duration: Duration::from_secs(1)
        }
        .is_permission_denied());
    }

    #[test]
    fn test_option_ext() {
        let opt: Option<i32> = None;
        assert!(matches!(
            opt.ok_or_not_found("/tmp/test"),
            Err(MamaError::FileNotFound { .. })
        ));
        let opt: Option<i32> = None;
        assert!(matches!(
            opt.ok_or_missing("api_key"),
            Err(MamaError::MissingConfig { .. })
        ));
    }
}
