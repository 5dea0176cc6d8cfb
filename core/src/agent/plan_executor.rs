//! Plan executor: runs a normalized [`Plan`](super::planner::Plan) step by
//! step, honoring dependency ordering, retries, and fallback tools. Named
//! `plan_executor` rather than `executor` to keep it distinct from shell
//! command execution — this module walks a `Plan` through the tool
//! registry, it never runs a raw command line itself.

use std::collections::HashSet;

use serde_json::Value;

use super::planner::Plan;
use super::tools::{ToolContext, ToolOutcome, ToolRegistry};

const MAX_RETRIES: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    Fallback,
    FailedAcceptable,
    FailedCritical,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub output: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub aborted: bool,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub results: Vec<StepResult>,
}

pub trait PlanEventSink: Send + Sync {
    fn step_started(&self, _step_id: &str) {}
    fn step_finished(&self, _step_id: &str, _status: &StepStatus, _percent_complete: u32) {}
}

pub struct NoopEventSink;
impl PlanEventSink for NoopEventSink {}

/// `tool_name[ {json}]` — the fallback grammar a plan step's `fallback`
/// field uses.
fn parse_fallback(spec: &str) -> (String, Value) {
    match spec.find('[') {
        Some(idx) if spec.ends_with(']') => {
            let tool = spec[..idx].trim().to_string();
            let json_part = &spec[idx + 1..spec.len() - 1];
            let params = serde_json::from_str(json_part).unwrap_or(Value::Null);
            (tool, params)
        }
        _ => (spec.trim().to_string(), Value::Null),
    }
}

pub async fn execute_plan(
    plan: &Plan,
    registry: &ToolRegistry,
    context: &ToolContext,
    events: &dyn PlanEventSink,
) -> ExecutionReport {
    let total = plan.steps.len();
    let mut completed: HashSet<String> = HashSet::new();
    let mut results = vec![];
    let mut aborted = false;

    for (i, step) in plan.steps.iter().enumerate() {
        if aborted {
            break;
        }

        let deps_met = step.depends_on.iter().all(|dep| completed.contains(dep));
        if !deps_met {
            results.push(StepResult {
                step_id: step.id.clone(),
                status: StepStatus::Skipped,
                output: None,
                error: Some("Dependencies not met".to_string()),
            });
            continue;
        }

        events.step_started(&step.id);

        let mut attempt_error = None;
        let mut succeeded = false;
        let mut last_output = None;
        for _ in 0..=MAX_RETRIES {
            match registry.invoke(&step.tool, step.params.clone(), context).await {
                Ok(ToolOutcome { success: true, output, .. }) => {
                    succeeded = true;
                    last_output = output;
                    break;
                }
                Ok(ToolOutcome { error, .. }) => attempt_error = error,
                Err(e) => attempt_error = Some(e.user_message()),
            }
        }

        let status = if succeeded {
            StepStatus::Success
        } else if step.can_fail {
            StepStatus::FailedAcceptable
        } else {
            StepStatus::FailedCritical
        };

        let (final_status, output, error) = if status == StepStatus::FailedCritical || status == StepStatus::FailedAcceptable {
            if let Some(fallback_spec) = &step.fallback {
                let (tool, params) = parse_fallback(fallback_spec);
                match registry.invoke(&tool, params, context).await {
                    Ok(ToolOutcome { success: true, output, .. }) => (StepStatus::Fallback, output, None),
                    Ok(ToolOutcome { error: fallback_error, .. }) => (status, None, fallback_error.or(attempt_error)),
                    Err(e) => (status, None, Some(e.user_message())),
                }
            } else {
                (status, last_output, attempt_error)
            }
        } else {
            (status, last_output, attempt_error)
        };

        if matches!(final_status, StepStatus::Success | StepStatus::Fallback | StepStatus::FailedAcceptable) {
            completed.insert(step.id.clone());
        }

        let percent_complete = (((i + 1) as f64 / total as f64) * 100.0).round() as u32;
        events.step_finished(&step.id, &final_status, percent_complete);

        let is_critical_failure = final_status == StepStatus::FailedCritical;
        results.push(StepResult {
            step_id: step.id.clone(),
            status: final_status,
            output,
            error,
        });

        if is_critical_failure {
            aborted = true;
        }
    }

    ExecutionReport {
        aborted,
        completed_steps: completed.len(),
        total_steps: total,
        results,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::planner::PlanStep;
    use crate::sandbox::{AuditStore, Sandbox};
    use crate::scheduler::{JobStore, RunTask, ScheduleParser, Scheduler};
    use crate::store::Store;
    use serde_json::json;
    use std::sync::Arc;

    async fn context() -> ToolContext {
        let sandbox = Arc::new(Sandbox::new(AuditStore::in_memory()));
        let store = Store::open_in_memory().await.unwrap();
        let jobs = JobStore::new(store);
        let parser = ScheduleParser::new(None);
        let audit = Arc::new(AuditStore::in_memory());
        let run_task: RunTask = Arc::new(|_t: String| Box::pin(async move { Ok(String::new()) }));
        let scheduler = Arc::new(Scheduler::new(jobs, parser, audit, run_task));
        ToolContext {
            sandbox,
            scheduler,
            requested_by: "test".into(),
        }
    }

    fn plan_with(steps: Vec<PlanStep>) -> Plan {
        Plan {
            goal: "test".into(),
            steps,
            has_side_effects: false,
            estimated_duration: None,
            risks: vec![],
        }
    }

    #[tokio::test]
    async fn skips_step_with_unmet_dependency() {
        let plan = plan_with(vec![PlanStep {
            id: "2".into(),
            description: "d".into(),
            tool: "report_progress".into(),
            params: json!({"message":"hi"}),
            depends_on: vec!["1".into()],
            can_fail: false,
            fallback: None,
        }]);
        let registry = ToolRegistry::with_builtins();
        let context = context().await;
        let report = execute_plan(&plan, &registry, &context, &NoopEventSink).await;
        assert_eq!(report.results[0].status, StepStatus::Skipped);
        assert_eq!(report.completed_steps, 0);
    }

    #[tokio::test]
    async fn critical_failure_aborts_remaining_steps() {
        let plan = plan_with(vec![
            PlanStep {
                id: "1".into(),
                description: "d".into(),
                tool: "nonexistent_tool".into(),
                params: Value::Null,
                depends_on: vec![],
                can_fail: false,
                fallback: None,
            },
            PlanStep {
                id: "2".into(),
                description: "d".into(),
                tool: "report_progress".into(),
                params: json!({"message":"never runs"}),
                depends_on: vec![],
                can_fail: false,
                fallback: None,
            },
        ]);
        let registry = ToolRegistry::with_builtins();
        let context = context().await;
        let report = execute_plan(&plan, &registry, &context, &NoopEventSink).await;
        assert!(report.aborted);
        assert_eq!(report.results.len(), 1);
    }

    #[tokio::test]
    async fn successful_step_is_marked_complete() {
        let plan = plan_with(vec![PlanStep {
            id: "1".into(),
            description: "d".into(),
            tool: "report_progress".into(),
            params: json!({"message":"hi"}),
            depends_on: vec![],
            can_fail: false,
            fallback: None,
        }]);
        let registry = ToolRegistry::with_builtins();
        let context = context().await;
        let report = execute_plan(&plan, &registry, &context, &NoopEventSink).await;
        assert_eq!(report.completed_steps, 1);
        assert!(!report.aborted);
    }
}
