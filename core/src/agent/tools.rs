//! Tool registry: a static, typed set of tools exported to the router and
//! invoked by the reactive loop and the plan executor alike. Grounded on
//! the teacher's `agent/tool.rs` per-tool trait object pattern, generalized
//! to a schema-validated envelope over the sandbox and scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{MamaError, Result};
use crate::llm::ToolDefinition;
use crate::sandbox::Sandbox;
use crate::scheduler::Scheduler;

/// What a tool invocation returns, regardless of how it ran.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ToolOutcome {
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

pub struct ToolContext {
    pub sandbox: Arc<Sandbox>,
    pub scheduler: Arc<Scheduler>,
    pub requested_by: String,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, params: Value, context: &ToolContext) -> ToolOutcome;
}

/// Minimal subset of JSON Schema this registry actually needs: object
/// `required` + `properties.*.type`. Good enough to catch the common
/// "missing field" / "wrong type" mistakes an LLM makes; not a full
/// validator.
fn validate(schema: &Value, params: &Value) -> std::result::Result<(), String> {
    let Some(required) = schema.get("required").and_then(|r| r.as_array()) else {
        return Ok(());
    };
    for field in required {
        let Some(field_name) = field.as_str() else { continue };
        if params.get(field_name).is_none() {
            return Err(format!("missing required field '{field_name}'"));
        }
    }
    if let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) {
        for (field_name, field_schema) in properties {
            let Some(value) = params.get(field_name) else { continue };
            let Some(expected_type) = field_schema.get("type").and_then(|t| t.as_str()) else { continue };
            let matches = match expected_type {
                "string" => value.is_string(),
                "number" => value.is_number(),
                "integer" => value.is_i64() || value.is_u64(),
                "boolean" => value.is_boolean(),
                "array" => value.is_array(),
                "object" => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(format!("field '{field_name}' expected type {expected_type}"));
            }
        }
    }
    Ok(())
}

macro_rules! sandbox_tool {
    ($struct_name:ident, $name:expr, $description:expr, $capability:expr, $action:expr, $schema:expr) => {
        pub struct $struct_name;

        #[async_trait]
        impl Tool for $struct_name {
            fn name(&self) -> &str {
                $name
            }
            fn description(&self) -> &str {
                $description
            }
            fn parameters_schema(&self) -> Value {
                $schema
            }
            async fn execute(&self, params: Value, context: &ToolContext) -> ToolOutcome {
                match context.sandbox.execute($capability, $action, params, &context.requested_by).await {
                    Ok(result) => ToolOutcome {
                        success: result.success,
                        output: result.output,
                        error: result.error,
                    },
                    Err(e) => ToolOutcome::err(e.user_message()),
                }
            }
        }
    };
}

sandbox_tool!(
    ReadFileTool,
    "read_file",
    "Read the contents of a file.",
    "filesystem",
    "read",
    json!({"type":"object","required":["path"],"properties":{"path":{"type":"string"}}})
);

sandbox_tool!(
    WriteFileTool,
    "write_file",
    "Write content to a file, creating or overwriting it.",
    "filesystem",
    "write",
    json!({"type":"object","required":["path","content"],"properties":{"path":{"type":"string"},"content":{"type":"string"}}})
);

sandbox_tool!(
    ListDirectoryTool,
    "list_directory",
    "List the entries of a directory.",
    "filesystem",
    "list",
    json!({"type":"object","required":["path"],"properties":{"path":{"type":"string"}}})
);

sandbox_tool!(
    SearchFilesTool,
    "search_files",
    "Search for files matching a glob pattern.",
    "filesystem",
    "search",
    json!({"type":"object","required":["path","pattern"],"properties":{"path":{"type":"string"},"pattern":{"type":"string"}}})
);

sandbox_tool!(
    MoveFileTool,
    "move_file",
    "Move or rename a file.",
    "filesystem",
    "move",
    json!({"type":"object","required":["from","to"],"properties":{"from":{"type":"string"},"to":{"type":"string"}}})
);

sandbox_tool!(
    ExecuteCommandTool,
    "execute_command",
    "Execute a shell command.",
    "shell",
    "run",
    json!({"type":"object","required":["command"],"properties":{"command":{"type":"string"}}})
);

sandbox_tool!(
    HttpRequestTool,
    "http_request",
    "Make an HTTP request.",
    "network",
    "fetch",
    json!({"type":"object","required":["url"],"properties":{"url":{"type":"string"},"method":{"type":"string"},"body":{"type":"string"}}})
);

pub struct CreateScheduledJobTool;

#[async_trait]
impl Tool for CreateScheduledJobTool {
    fn name(&self) -> &str {
        "create_scheduled_job"
    }
    fn description(&self) -> &str {
        "Create a new scheduled job that runs an agent task on a cron schedule or natural-language recurrence."
    }
    fn parameters_schema(&self) -> Value {
        json!({"type":"object","required":["schedule","task"],"properties":{
            "name":{"type":"string"},"schedule":{"type":"string"},"task":{"type":"string"}
        }})
    }
    async fn execute(&self, params: Value, context: &ToolContext) -> ToolOutcome {
        let schedule = params.get("schedule").and_then(|v| v.as_str()).unwrap_or_default();
        let task = params.get("task").and_then(|v| v.as_str()).unwrap_or_default();
        let name = params.get("name").and_then(|v| v.as_str()).map(str::to_string);
        match context.scheduler.create_job(name, schedule, task.to_string()).await {
            Ok(job) => ToolOutcome::ok(serde_json::to_string(&job).unwrap_or_default()),
            Err(e) => ToolOutcome::err(e.user_message()),
        }
    }
}

pub struct ListScheduledJobsTool;

#[async_trait]
impl Tool for ListScheduledJobsTool {
    fn name(&self) -> &str {
        "list_scheduled_jobs"
    }
    fn description(&self) -> &str {
        "List all scheduled jobs."
    }
    fn parameters_schema(&self) -> Value {
        json!({"type":"object","properties":{}})
    }
    async fn execute(&self, _params: Value, context: &ToolContext) -> ToolOutcome {
        match context.scheduler.list_jobs().await {
            Ok(jobs) => ToolOutcome::ok(serde_json::to_string(&jobs).unwrap_or_default()),
            Err(e) => ToolOutcome::err(e.user_message()),
        }
    }
}

pub struct ManageJobTool;

#[async_trait]
impl Tool for ManageJobTool {
    fn name(&self) -> &str {
        "manage_job"
    }
    fn description(&self) -> &str {
        "Enable, disable, delete, or run a scheduled job by id."
    }
    fn parameters_schema(&self) -> Value {
        json!({"type":"object","required":["id","action"],"properties":{
            "id":{"type":"string"},"action":{"type":"string"}
        }})
    }
    async fn execute(&self, params: Value, context: &ToolContext) -> ToolOutcome {
        let id = params.get("id").and_then(|v| v.as_str()).unwrap_or_default();
        let action = params.get("action").and_then(|v| v.as_str()).unwrap_or_default();
        let result = match action {
            "enable" => context.scheduler.enable_job(id).await.map(|_| "enabled".to_string()),
            "disable" => context.scheduler.disable_job(id).await.map(|_| "disabled".to_string()),
            "delete" => context.scheduler.delete_job(id).await.map(|_| "deleted".to_string()),
            "run" => context.scheduler.run_job_now(id).await,
            other => return ToolOutcome::err(format!("unknown action '{other}'")),
        };
        match result {
            Ok(output) => ToolOutcome::ok(output),
            Err(e) => ToolOutcome::err(e.user_message()),
        }
    }
}

/// Meta tool: surfaces a question to the user with no side effect. The
/// channel layer is responsible for actually prompting; the tool result is
/// a structured envelope the model can react to next turn.
pub struct AskUserTool;

#[async_trait]
impl Tool for AskUserTool {
    fn name(&self) -> &str {
        "ask_user"
    }
    fn description(&self) -> &str {
        "Ask the user a clarifying question."
    }
    fn parameters_schema(&self) -> Value {
        json!({"type":"object","required":["question"],"properties":{"question":{"type":"string"}}})
    }
    async fn execute(&self, params: Value, _context: &ToolContext) -> ToolOutcome {
        let question = params.get("question").and_then(|v| v.as_str()).unwrap_or_default();
        ToolOutcome::ok(json!({"type":"ask_user","question":question}).to_string())
    }
}

pub struct ReportProgressTool;

#[async_trait]
impl Tool for ReportProgressTool {
    fn name(&self) -> &str {
        "report_progress"
    }
    fn description(&self) -> &str {
        "Report progress on a long-running task without ending the turn."
    }
    fn parameters_schema(&self) -> Value {
        json!({"type":"object","required":["message"],"properties":{"message":{"type":"string"}}})
    }
    async fn execute(&self, params: Value, _context: &ToolContext) -> ToolOutcome {
        let message = params.get("message").and_then(|v| v.as_str()).unwrap_or_default();
        ToolOutcome::ok(json!({"type":"progress","message":message}).to_string())
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn with_builtins() -> Self {
        let builtins: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ReadFileTool),
            Arc::new(WriteFileTool),
            Arc::new(ListDirectoryTool),
            Arc::new(SearchFilesTool),
            Arc::new(MoveFileTool),
            Arc::new(ExecuteCommandTool),
            Arc::new(HttpRequestTool),
            Arc::new(CreateScheduledJobTool),
            Arc::new(ListScheduledJobsTool),
            Arc::new(ManageJobTool),
            Arc::new(AskUserTool),
            Arc::new(ReportProgressTool),
        ];
        let mut tools = HashMap::new();
        for tool in builtins {
            tools.insert(tool.name().to_string(), tool);
        }
        Self { tools }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub async fn invoke(&self, name: &str, params: Value, context: &ToolContext) -> Result<ToolOutcome> {
        let Some(tool) = self.tools.get(name) else {
            return Err(MamaError::ToolNotFound {
                tool_name: name.to_string(),
            });
        };
        if let Err(reason) = validate(&tool.parameters_schema(), &params) {
            return Ok(ToolOutcome::err(format!("Invalid tool parameters: {reason}")));
        }
        Ok(tool.execute(params, context).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_definitions_cover_the_spec_list() {
        let registry = ToolRegistry::with_builtins();
        let names: Vec<String> = registry.definitions().into_iter().map(|d| d.name).collect();
        for expected in [
            "read_file",
            "write_file",
            "list_directory",
            "search_files",
            "move_file",
            "execute_command",
            "http_request",
            "create_scheduled_job",
            "list_scheduled_jobs",
            "manage_job",
            "ask_user",
            "report_progress",
        ] {
            assert!(names.contains(&expected.to_string()), "missing tool {expected}");
        }
    }

    #[test]
    fn validate_catches_missing_required_field() {
        let schema = json!({"type":"object","required":["path"],"properties":{"path":{"type":"string"}}});
        assert!(validate(&schema, &json!({})).is_err());
        assert!(validate(&schema, &json!({"path":"/tmp/x"})).is_ok());
    }

    #[test]
    fn validate_catches_wrong_type() {
        let schema = json!({"type":"object","required":["path"],"properties":{"path":{"type":"string"}}});
        assert!(validate(&schema, &json!({"path": 5})).is_err());
    }

    #[tokio::test]
    async fn unknown_tool_errors() {
        let sandbox = Arc::new(Sandbox::new(crate::sandbox::AuditStore::in_memory()));
        let store = crate::store::Store::open_in_memory().await.unwrap();
        let jobs = crate::scheduler::JobStore::new(store);
        let parser = crate::scheduler::ScheduleParser::new(None);
        let audit = Arc::new(crate::sandbox::AuditStore::in_memory());
        let run_task: crate::scheduler::RunTask = Arc::new(|_t: String| Box::pin(async move { Ok(String::new()) }));
        let scheduler = Arc::new(Scheduler::new(jobs, parser, audit, run_task));
        let registry = ToolRegistry::with_builtins();
        let context = ToolContext {
            sandbox,
            scheduler,
            requested_by: "test".into(),
        };
        let result = registry.invoke("nonexistent_tool", json!({}), &context).await;
        assert!(result.is_err());
    }
}
