//! Planner: detects multi-step requests, asks the router for a strict JSON
//! plan, and normalizes it into an executable shape. JSON extraction mirrors
//! the teacher's fenced-block-then-brace-walk pattern already used by the
//! consolidation engine's response parser, specialized here to track
//! string/escape state since plan JSON often embeds shell commands.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const MAX_STEPS: usize = 8;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlanStep {
    pub id: String,
    pub description: String,
    pub tool: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, rename = "dependsOn")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub can_fail: bool,
    #[serde(default)]
    pub fallback: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<PlanStep>,
    #[serde(default, rename = "hasSideEffects")]
    pub has_side_effects: bool,
    #[serde(default, rename = "estimatedDuration")]
    pub estimated_duration: Option<String>,
    #[serde(default)]
    pub risks: Vec<String>,
}

const SIDE_EFFECTING_TOOLS: &[&str] = &["write_file", "move_file", "execute_command", "http_request"];

lazy_static! {
    static ref MULTISTEP_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"\bthen\b").unwrap(),
        Regex::new(r"\band then\b").unwrap(),
        Regex::new(r"\bafter that\b").unwrap(),
        Regex::new(r"\bfirst\b.*\bthen\b").unwrap(),
        Regex::new(r"\bcreate\b.*\b(write|list|read|move|run)\b").unwrap(),
        Regex::new(r"\bmulti[- ]step\b").unwrap(),
    ];
}

pub fn looks_multistep(input: &str) -> bool {
    let lower = input.to_lowercase();
    MULTISTEP_PATTERNS.iter().any(|re| re.is_match(&lower))
}

pub fn build_plan_prompt(input: &str, tool_names: &[String]) -> String {
    format!(
        "The user asked: \"{input}\"\n\n\
        Available tools: {}\n\n\
        Produce a plan as strict JSON of this exact shape, nothing else:\n\
        {{\"goal\": string, \"steps\": [{{\"id\": string, \"description\": string, \"tool\": string, \
        \"params\": object, \"dependsOn\": [string], \"canFail\": boolean, \"fallback\": string|null}}], \
        \"hasSideEffects\": boolean, \"estimatedDuration\": string, \"risks\": [string]}}",
        tool_names.join(", ")
    )
}

/// Extract the first balanced JSON object from `text`. Prefers a fenced
/// ```json ... ``` block if present; otherwise walks braces tracking string
/// and escape state so embedded `{`/`}` inside string literals don't
/// confuse the depth counter.
pub fn extract_json_object(text: &str) -> Option<Value> {
    lazy_static! {
        static ref FENCED: Regex = Regex::new(r"```(?:json)?\s*(\{[\s\S]*?\})\s*```").unwrap();
    }
    if let Some(caps) = FENCED.captures(text) {
        if let Ok(value) = serde_json::from_str(&caps[1]) {
            return Some(value);
        }
    }

    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return serde_json::from_str(&text[start..end]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Apply id normalization, sort-by-id, step cap, and side-effect
/// derivation. Consumes the raw parsed plan and returns the final one.
pub fn normalize(mut plan: Plan) -> Plan {
    for (i, step) in plan.steps.iter_mut().enumerate() {
        if step.id.trim().is_empty() {
            step.id = (i + 1).to_string();
        }
    }
    plan.steps.sort_by(|a, b| a.id.cmp(&b.id));
    plan.steps.truncate(MAX_STEPS);

    let any_side_effecting_step = plan.steps.iter().any(|s| SIDE_EFFECTING_TOOLS.contains(&s.tool.as_str()));
    plan.has_side_effects = plan.has_side_effects || any_side_effecting_step;
    plan
}

pub fn parse_plan_response(text: &str) -> Option<Plan> {
    let value = extract_json_object(text)?;
    let plan: Plan = serde_json::from_value(value).ok()?;
    Some(normalize(plan))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_then_as_multistep() {
        assert!(looks_multistep("read the file then write a summary"));
        assert!(looks_multistep("first check disk space then email me"));
        assert!(!looks_multistep("what time is it"));
    }

    #[test]
    fn extracts_fenced_json() {
        let text = "Here is the plan:\n```json\n{\"goal\":\"x\",\"steps\":[]}\n```\nDone.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["goal"], "x");
    }

    #[test]
    fn brace_walk_ignores_braces_inside_strings() {
        let text = r#"noise {"goal":"say \"hi {there}\"","steps":[]} trailing"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["goal"], "say \"hi {there}\"");
    }

    #[test]
    fn normalize_assigns_missing_ids_and_caps_steps() {
        let plan = Plan {
            goal: "g".into(),
            steps: (0..10)
                .map(|_| PlanStep {
                    id: String::new(),
                    description: "d".into(),
                    tool: "read_file".into(),
                    params: Value::Null,
                    depends_on: vec![],
                    can_fail: false,
                    fallback: None,
                })
                .collect(),
            has_side_effects: false,
            estimated_duration: None,
            risks: vec![],
        };
        let normalized = normalize(plan);
        assert_eq!(normalized.steps.len(), 8);
        assert_eq!(normalized.steps[0].id, "1");
    }

    #[test]
    fn side_effecting_tool_marks_plan_side_effecting() {
        let plan = Plan {
            goal: "g".into(),
            steps: vec![PlanStep {
                id: "1".into(),
                description: "d".into(),
                tool: "write_file".into(),
                params: Value::Null,
                depends_on: vec![],
                can_fail: false,
                fallback: None,
            }],
            has_side_effects: false,
            estimated_duration: None,
            risks: vec![],
        };
        assert!(normalize(plan).has_side_effects);
    }
}
