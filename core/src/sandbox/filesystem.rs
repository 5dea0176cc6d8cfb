//! Filesystem capability: read/write/list/delete/search/move under a
//! workspace root and a set of glob-based allow rules. Grounded on the
//! teacher's `executor/allowlist.rs` category model, generalized from
//! command names to path globs.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Capability, CapabilityResult, PermissionDecision};
use crate::redact::truncate_utf8;

const MAX_READ_BYTES: usize = 256 * 1024;
const MAX_SEARCH_RESULTS: usize = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsAction {
    Read,
    Write,
    List,
    Delete,
    Search,
    Move,
}

impl FsAction {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::List => "list",
            Self::Delete => "delete",
            Self::Search => "search",
            Self::Move => "move",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "list" => Some(Self::List),
            "delete" => Some(Self::Delete),
            "search" => Some(Self::Search),
            "move" => Some(Self::Move),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleLevel {
    Auto,
    Ask,
    Deny,
}

#[derive(Debug, Clone)]
pub struct PathRule {
    pub glob: String,
    pub actions: Vec<FsAction>,
    pub level: RuleLevel,
}

#[derive(Debug, Clone)]
pub struct FilesystemConfig {
    pub workspace_root: PathBuf,
    pub allow_rules: Vec<PathRule>,
    pub denied_globs: Vec<String>,
}

pub struct FilesystemCapability {
    config: FilesystemConfig,
}

impl FilesystemCapability {
    pub fn new(config: FilesystemConfig) -> Self {
        Self { config }
    }

    /// Expand `~`, resolve the parent for non-existent write targets, and
    /// detect traversal. Returns `Err` with a user-facing reason on any
    /// resolution failure or detected traversal attempt.
    fn resolve(&self, raw: &str) -> Result<PathBuf, String> {
        if raw.as_bytes().contains(&0) {
            return Err("NUL byte in path".to_string());
        }

        let expanded = if raw == "~" {
            dirs::home_dir().ok_or("no home directory")?
        } else if let Some(rest) = raw.strip_prefix("~/") {
            dirs::home_dir().ok_or("no home directory")?.join(rest)
        } else {
            PathBuf::from(raw)
        };

        let has_dotdot = expanded
            .components()
            .any(|c| matches!(c, Component::ParentDir));

        let pre_dotdot_prefix: PathBuf = expanded
            .components()
            .take_while(|c| !matches!(c, Component::ParentDir))
            .collect();

        let resolved = if expanded.exists() {
            expanded.canonicalize().map_err(|e| e.to_string())?
        } else {
            let parent = expanded.parent().unwrap_or(Path::new("."));
            let parent_canon = if parent.as_os_str().is_empty() {
                std::env::current_dir().map_err(|e| e.to_string())?
            } else {
                parent.canonicalize().map_err(|e| e.to_string())?
            };
            parent_canon.join(
                expanded
                    .file_name()
                    .ok_or("path has no file name")?,
            )
        };

        if has_dotdot {
            let canon_prefix = pre_dotdot_prefix
                .canonicalize()
                .unwrap_or(pre_dotdot_prefix.clone());
            if !resolved.starts_with(&canon_prefix) {
                return Err("path traversal detected".to_string());
            }
        }

        Ok(resolved)
    }

    fn decide(&self, action: FsAction, resolved: &Path) -> PermissionDecision {
        for denied in &self.config.denied_globs {
            if glob_match(denied, resolved) {
                return PermissionDecision::RuleDenied;
            }
        }

        let workspace_root = self
            .config
            .workspace_root
            .canonicalize()
            .unwrap_or_else(|_| self.config.workspace_root.clone());
        if resolved.starts_with(&workspace_root) {
            return PermissionDecision::Auto;
        }

        for rule in &self.config.allow_rules {
            if rule.actions.contains(&action) && glob_match(&rule.glob, resolved) {
                return match rule.level {
                    RuleLevel::Auto => PermissionDecision::Auto,
                    RuleLevel::Ask => PermissionDecision::Ask,
                    RuleLevel::Deny => PermissionDecision::RuleDenied,
                };
            }
        }

        PermissionDecision::RuleDenied
    }
}

fn glob_match(pattern: &str, path: &Path) -> bool {
    glob::Pattern::new(pattern)
        .map(|p| p.matches_path(path))
        .unwrap_or(false)
}

#[async_trait]
impl Capability for FilesystemCapability {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn check_permission(&self, action: &str, resource: &str) -> PermissionDecision {
        let Some(action) = FsAction::parse(action) else {
            return PermissionDecision::RuleDenied;
        };
        match self.resolve(resource) {
            Ok(resolved) => self.decide(action, &resolved),
            Err(_) => PermissionDecision::RuleDenied,
        }
    }

    async fn execute(&self, action: &str, params: &Value) -> CapabilityResult {
        let Some(action) = FsAction::parse(action) else {
            return CapabilityResult::err("unknown filesystem action");
        };

        let path = match params.get("path").and_then(|v| v.as_str()) {
            Some(p) => p,
            None => return CapabilityResult::err("missing 'path' parameter"),
        };

        let resolved = match self.resolve(path) {
            Ok(p) => p,
            Err(e) => return CapabilityResult::err(e),
        };

        match action {
            FsAction::Read => read_file(&resolved).await,
            FsAction::Write => {
                let content = params.get("content").and_then(|v| v.as_str()).unwrap_or("");
                write_file(&resolved, content).await
            }
            FsAction::List => list_dir(&resolved).await,
            FsAction::Delete => delete_file(&resolved).await,
            FsAction::Search => {
                let pattern = params
                    .get("pattern")
                    .and_then(|v| v.as_str())
                    .unwrap_or("*");
                search_files(&resolved, pattern).await
            }
            FsAction::Move => {
                let dest_raw = match params.get("destination").and_then(|v| v.as_str()) {
                    Some(d) => d,
                    None => return CapabilityResult::err("missing 'destination' parameter"),
                };
                let dest = match self.resolve(dest_raw) {
                    Ok(p) => p,
                    Err(e) => return CapabilityResult::err(e),
                };
                move_file(&resolved, &dest).await
            }
        }
    }
}

async fn read_file(path: &Path) -> CapabilityResult {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.len() as usize > MAX_READ_BYTES => {
            return CapabilityResult::err(format!(
                "file too large: {} bytes (max {})",
                meta.len(),
                MAX_READ_BYTES
            ))
        }
        Ok(_) => {}
        Err(e) => return CapabilityResult::err(e.to_string()),
    }
    match tokio::fs::read_to_string(path).await {
        Ok(content) => CapabilityResult::ok(content),
        Err(e) => CapabilityResult::err(e.to_string()),
    }
}

async fn write_file(path: &Path, content: &str) -> CapabilityResult {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return CapabilityResult::err(e.to_string());
        }
    }
    match tokio::fs::write(path, content).await {
        Ok(()) => CapabilityResult::ok(format!("{{\"bytesWritten\":{}}}", content.len())),
        Err(e) => CapabilityResult::err(e.to_string()),
    }
}

async fn list_dir(path: &Path) -> CapabilityResult {
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(r) => r,
        Err(e) => return CapabilityResult::err(e.to_string()),
    };
    let mut names = vec![];
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => names.push(entry.file_name().to_string_lossy().into_owned()),
            Ok(None) => break,
            Err(e) => return CapabilityResult::err(e.to_string()),
        }
    }
    CapabilityResult::ok(serde_json::to_string(&names).unwrap_or_default())
}

async fn delete_file(path: &Path) -> CapabilityResult {
    match tokio::fs::remove_file(path).await {
        Ok(()) => CapabilityResult::ok("deleted"),
        Err(e) => CapabilityResult::err(e.to_string()),
    }
}

async fn search_files(root: &Path, pattern: &str) -> CapabilityResult {
    let pattern = match glob::Pattern::new(pattern) {
        Ok(p) => p,
        Err(e) => return CapabilityResult::err(e.to_string()),
    };
    let mut results = vec![];
    let mut truncated = false;
    let mut queue = std::collections::VecDeque::new();
    queue.push_back(root.to_path_buf());
    while let Some(dir) = queue.pop_front() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_symlink() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if pattern.matches(name) {
                    if results.len() >= MAX_SEARCH_RESULTS {
                        truncated = true;
                        break;
                    }
                    results.push(path.to_string_lossy().into_owned());
                }
            }
            if meta.is_dir() {
                queue.push_back(path);
            }
        }
        if truncated {
            break;
        }
    }
    CapabilityResult::ok(
        serde_json::json!({ "results": results, "truncated": truncated }).to_string(),
    )
}

async fn move_file(src: &Path, dest: &Path) -> CapabilityResult {
    if let Some(parent) = dest.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return CapabilityResult::err(e.to_string());
        }
    }
    match tokio::fs::rename(src, dest).await {
        Ok(()) => CapabilityResult::ok("moved"),
        Err(e) => CapabilityResult::err(e.to_string()),
    }
}

/// Redact write content from audit output: callers should replace `content`
/// with `content_length` before logging, as the sandbox's `redact_params`
/// helper already does for every capability.
pub fn audit_safe_output(output: &str) -> String {
    truncate_utf8(output, 1024).0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cap(root: PathBuf) -> FilesystemCapability {
        FilesystemCapability::new(FilesystemConfig {
            workspace_root: root,
            allow_rules: vec![],
            denied_globs: vec![],
        })
    }

    #[tokio::test]
    async fn workspace_root_is_auto_allowed() {
        let dir = tempdir().unwrap();
        let cap = cap(dir.path().to_path_buf());
        let file = dir.path().join("note.txt");
        tokio::fs::write(&file, "hi").await.unwrap();
        let decision = cap
            .check_permission("read", file.to_str().unwrap())
            .await;
        assert_eq!(decision, PermissionDecision::Auto);
    }

    #[tokio::test]
    async fn nul_byte_is_denied() {
        let dir = tempdir().unwrap();
        let cap = cap(dir.path().to_path_buf());
        let decision = cap.check_permission("read", "bad\0path").await;
        assert_eq!(decision, PermissionDecision::RuleDenied);
    }

    #[tokio::test]
    async fn outside_workspace_without_rule_is_denied() {
        let dir = tempdir().unwrap();
        let other = tempdir().unwrap();
        let cap = cap(dir.path().to_path_buf());
        let file = other.path().join("x.txt");
        tokio::fs::write(&file, "hi").await.unwrap();
        let decision = cap
            .check_permission("read", file.to_str().unwrap())
            .await;
        assert_eq!(decision, PermissionDecision::RuleDenied);
    }

    #[tokio::test]
    async fn read_write_roundtrip() {
        let dir = tempdir().unwrap();
        let cap = cap(dir.path().to_path_buf());
        let file = dir.path().join("a.txt");
        let write_params = serde_json::json!({"path": file.to_str().unwrap(), "content": "hello"});
        let result = cap.execute("write", &write_params).await;
        assert!(result.success);
        let read_params = serde_json::json!({"path": file.to_str().unwrap()});
        let result = cap.execute("read", &read_params).await;
        assert!(result.success);
        assert_eq!(result.output.unwrap(), "hello");
    }
}
