//! Shell capability: classifies and executes shell commands. Grounded on the
//! teacher's `executor/allowlist.rs` (categorized command sets) and
//! `executor/safety.rs` (dangerous-pattern detection), generalized into the
//! full decision pipeline of spec §4.2.2.

use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{Capability, CapabilityResult, PermissionDecision};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 300;
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct ShellConfig {
    pub safe_commands: Vec<Vec<String>>,
    pub ask_commands: Vec<Vec<String>>,
    pub denied_patterns: Vec<Vec<String>>,
    pub default_timeout: Option<Duration>,
    pub working_dir: Option<std::path::PathBuf>,
}

pub struct ShellCapability {
    config: ShellConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Safe,
    Ask,
    Denied,
}

impl ShellCapability {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    /// Tokenize the full command line, split into `|`/`||`/`&&`/`;` segments,
    /// and classify.
    fn classify(&self, command: &str) -> Classification {
        let Ok(all_tokens) = shell_words::split(command) else {
            return Classification::Denied;
        };
        if all_tokens.is_empty() {
            return Classification::Denied;
        }

        if self.matches_denied(&all_tokens) {
            return Classification::Denied;
        }

        let segments = split_segments(command);
        if segments.iter().any(|s| s.trim().is_empty()) {
            return Classification::Denied;
        }

        let mut worst = Classification::Safe;
        for segment in &segments {
            let class = self.classify_segment(segment);
            worst = combine(worst, class);
        }
        if segments.len() > 1 && worst == Classification::Safe {
            worst = Classification::Ask;
        }
        worst
    }

    fn matches_denied(&self, tokens: &[String]) -> bool {
        for pattern in &self.config.denied_patterns {
            if token_subsequence_match(pattern, tokens) {
                return true;
            }
        }
        false
    }

    fn classify_segment(&self, segment: &str) -> Classification {
        if has_shell_expansion(segment) {
            return Classification::Ask;
        }
        let Ok(tokens) = shell_words::split(segment) else {
            return Classification::Denied;
        };
        if tokens.is_empty() {
            return Classification::Denied;
        }
        if matches_any_prefix(&self.config.safe_commands, &tokens) {
            return Classification::Safe;
        }
        if matches_any_prefix(&self.config.ask_commands, &tokens) {
            return Classification::Ask;
        }
        Classification::Ask
    }
}

fn combine(a: Classification, b: Classification) -> Classification {
    use Classification::*;
    match (a, b) {
        (Denied, _) | (_, Denied) => Denied,
        (Ask, _) | (_, Ask) => Ask,
        (Safe, Safe) => Safe,
    }
}

/// Split on `|`, `||`, `&&`, `;` at the top level, outside quotes.
fn split_segments(command: &str) -> Vec<String> {
    let mut segments = vec![];
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '\\' if in_double => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '|' | '&' | ';' if !in_single && !in_double => {
                if c == '|' && chars.peek() == Some(&'|') {
                    chars.next();
                } else if c == '&' && chars.peek() == Some(&'&') {
                    chars.next();
                }
                segments.push(current.trim().to_string());
                current = String::new();
            }
            _ => current.push(c),
        }
    }
    segments.push(current.trim().to_string());
    segments
}

fn has_shell_expansion(segment: &str) -> bool {
    segment.contains('`')
        || segment.contains("$(")
        || segment.contains("${")
        || segment.contains("<(")
        || segment.contains(">(")
        || segment.contains('\n')
        || segment.contains('>')
        || segment.contains('<')
}

fn matches_any_prefix(patterns: &[Vec<String>], tokens: &[String]) -> bool {
    patterns.iter().any(|p| {
        p.len() <= tokens.len()
            && p.iter()
                .zip(tokens.iter())
                .all(|(pattern_tok, actual_tok)| pattern_tok == actual_tok)
    })
}

/// A denied pattern matches the token stream as a subsequence (in order, not
/// necessarily contiguous): pattern tokens ending in `=` match as a key
/// prefix, tokens starting with `/` match as a path prefix, everything else
/// is an exact token match. This is the spec's explicit "strict
/// token-subsequence" choice — implementers may tighten it, never loosen it.
fn token_subsequence_match(pattern: &[String], tokens: &[String]) -> bool {
    let mut ti = 0;
    for p in pattern {
        let mut found = false;
        while ti < tokens.len() {
            let t = &tokens[ti];
            ti += 1;
            let matched = if let Some(prefix) = p.strip_suffix('=') {
                t.starts_with(prefix) && t.contains('=')
            } else if p.starts_with('/') {
                t.starts_with(p.as_str())
            } else {
                t == p
            };
            if matched {
                found = true;
                break;
            }
        }
        if !found {
            return false;
        }
    }
    true
}

#[async_trait]
impl Capability for ShellCapability {
    fn name(&self) -> &str {
        "shell"
    }

    async fn check_permission(&self, _action: &str, resource: &str) -> PermissionDecision {
        match self.classify(resource) {
            Classification::Safe => PermissionDecision::Auto,
            Classification::Ask => PermissionDecision::Ask,
            Classification::Denied => PermissionDecision::RuleDenied,
        }
    }

    async fn execute(&self, _action: &str, params: &Value) -> CapabilityResult {
        let Some(command) = params.get("command").and_then(|v| v.as_str()) else {
            return CapabilityResult::err("missing 'command' parameter");
        };

        let timeout_secs = params
            .get("timeoutSeconds")
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| {
                self.config
                    .default_timeout
                    .map(|d| d.as_secs())
                    .unwrap_or(DEFAULT_TIMEOUT_SECS)
            })
            .min(MAX_TIMEOUT_SECS);

        let working_dir = params
            .get("workingDirectory")
            .and_then(|v| v.as_str())
            .map(std::path::PathBuf::from)
            .or_else(|| self.config.working_dir.clone());

        if let Some(dir) = &working_dir {
            match tokio::fs::canonicalize(dir).await {
                Ok(resolved) if resolved.is_dir() => {}
                _ => return CapabilityResult::err("invalid working directory"),
            }
        }

        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        if let Some(dir) = &working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return CapabilityResult::err(e.to_string()),
        };

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        drop(child.stdin.take());

        async fn read_capped(mut r: impl tokio::io::AsyncRead + Unpin) -> Vec<u8> {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 8192];
            loop {
                match r.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        if buf.len() >= MAX_OUTPUT_BYTES {
                            buf.truncate(MAX_OUTPUT_BYTES);
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            buf
        }

        let run = async {
            let (stdout_buf, stderr_buf) = tokio::join!(read_capped(stdout), read_capped(stderr));
            let status = child.wait().await;
            (stdout_buf, stderr_buf, status)
        };

        match timeout(Duration::from_secs(timeout_secs), run).await {
            Ok((stdout_buf, stderr_buf, status)) => {
                let stdout_str = crate::redact::redact(&String::from_utf8_lossy(&stdout_buf));
                let stderr_str = crate::redact::redact(&String::from_utf8_lossy(&stderr_buf));
                match status {
                    Ok(status) if status.success() => CapabilityResult::ok(stdout_str),
                    Ok(status) => CapabilityResult {
                        success: false,
                        output: Some(stdout_str),
                        error: Some(format!(
                            "exit code {}: {}",
                            status.code().unwrap_or(-1),
                            stderr_str
                        )),
                    },
                    Err(e) => CapabilityResult::err(e.to_string()),
                }
            }
            Err(_) => {
                let _ = child.kill().await;
                CapabilityResult::err(format!("command timed out after {timeout_secs}s"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ShellConfig {
        ShellConfig {
            safe_commands: vec![vec!["ls".into()], vec!["cat".into()]],
            ask_commands: vec![vec!["curl".into()]],
            denied_patterns: vec![vec!["rm".into(), "-rf".into()]],
            default_timeout: None,
            working_dir: None,
        }
    }

    fn cap() -> ShellCapability {
        ShellCapability::new(config())
    }

    #[test]
    fn safe_command_classifies_auto() {
        assert_eq!(cap().classify("ls -la"), Classification::Safe);
    }

    #[test]
    fn expansion_forces_ask() {
        assert_eq!(cap().classify("echo $(whoami)"), Classification::Ask);
    }

    #[test]
    fn denied_pattern_as_tokens() {
        assert_eq!(cap().classify("ls && rm -rf /"), Classification::Denied);
    }

    #[test]
    fn compound_pipe_forces_ask() {
        assert_eq!(cap().classify("ls | cat"), Classification::Ask);
    }

    #[test]
    fn literal_string_argument_not_denied_by_substring() {
        // token-subsequence semantics: "rm -rf" appearing as a literal
        // string argument to `git commit -m` does not match the denied
        // pattern, since the pattern tokens ("rm","-rf") must each match a
        // *separate* token in the command's tokenized form, and here they
        // are absorbed into a single quoted argument token.
        let class = cap().classify(r#"git commit -m "rm -rf""#);
        assert_ne!(class, Classification::Denied);
    }

    #[test]
    fn empty_command_denied() {
        assert_eq!(cap().classify(""), Classification::Denied);
    }
}
