//! Schedule parsing: standard 5-field cron as-is, else an LLM-backed
//! natural-language parser, else a deterministic phrase table. Mirrors the
//! layered-fallback shape of the teacher's retry/backoff chain in
//! `llm/client.rs`, applied to parsing instead of network calls.

use std::sync::Arc;

use regex::Regex;

use crate::error::{MamaError, Result};
use crate::llm::{ChatMessage, CompletionRequest, Router, TaskType};

/// Validate and normalize to a 5-field cron expression the `cron` crate can
/// parse. The `cron` crate expects 6 or 7 fields (seconds-first); this
/// crate's schedules are always 5-field (minute-first), so we prefix `0 `
/// for seconds internally wherever a `cron::Schedule` is built.
pub fn is_valid_five_field_cron(expr: &str) -> bool {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return false;
    }
    let with_seconds = format!("0 {expr}");
    cron::Schedule::try_from(with_seconds.as_str()).is_ok()
}

pub fn to_six_field(expr: &str) -> String {
    format!("0 {expr}")
}

fn phrase_table_fallback(phrase: &str) -> Option<String> {
    let lower = phrase.trim().to_lowercase();

    if lower == "every minute" {
        return Some("* * * * *".to_string());
    }
    if lower == "hourly" || lower == "every hour" {
        return Some("0 * * * *".to_string());
    }

    lazy_static::lazy_static! {
        static ref EVERY_N_MINUTES: Regex = Regex::new(r"^every (\d+) minutes?$").unwrap();
        static ref EVERY_N_HOURS: Regex = Regex::new(r"^every (\d+) hours?$").unwrap();
        static ref DAILY_AT: Regex = Regex::new(r"^every day at (\d{1,2}):(\d{2})$").unwrap();
        static ref WEEKDAY_AT: Regex = Regex::new(
            r"^every (monday|tuesday|wednesday|thursday|friday|saturday|sunday) at (\d{1,2}):(\d{2})$"
        ).unwrap();
    }

    if let Some(caps) = EVERY_N_MINUTES.captures(&lower) {
        let n: u32 = caps[1].parse().ok()?;
        if n == 0 || n > 59 {
            return None;
        }
        return Some(format!("*/{n} * * * *"));
    }
    if let Some(caps) = EVERY_N_HOURS.captures(&lower) {
        let n: u32 = caps[1].parse().ok()?;
        if n == 0 || n > 23 {
            return None;
        }
        return Some(format!("0 */{n} * * *"));
    }
    if let Some(caps) = DAILY_AT.captures(&lower) {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps[2].parse().ok()?;
        if hour > 23 || minute > 59 {
            return None;
        }
        return Some(format!("{minute} {hour} * * *"));
    }
    if let Some(caps) = WEEKDAY_AT.captures(&lower) {
        let weekday = weekday_number(&caps[1])?;
        let hour: u32 = caps[2].parse().ok()?;
        let minute: u32 = caps[3].parse().ok()?;
        if hour > 23 || minute > 59 {
            return None;
        }
        return Some(format!("{minute} {hour} * * {weekday}"));
    }
    if lower == "daily" {
        return Some("0 0 * * *".to_string());
    }
    if lower == "weekly" {
        return Some("0 0 * * 0".to_string());
    }
    if lower == "monthly" {
        return Some("0 0 1 * *".to_string());
    }

    None
}

fn weekday_number(name: &str) -> Option<u32> {
    Some(match name {
        "sunday" => 0,
        "monday" => 1,
        "tuesday" => 2,
        "wednesday" => 3,
        "thursday" => 4,
        "friday" => 5,
        "saturday" => 6,
        _ => return None,
    })
}

pub struct ScheduleParser {
    router: Option<Arc<Router>>,
}

impl ScheduleParser {
    pub fn new(router: Option<Arc<Router>>) -> Self {
        Self { router }
    }

    pub async fn parse(&self, input: &str) -> Result<String> {
        let trimmed = input.trim();
        if is_valid_five_field_cron(trimmed) {
            return Ok(trimmed.to_string());
        }

        if let Some(router) = &self.router {
            let prompt = format!(
                "Convert this schedule description to a standard 5-field cron expression \
                (minute hour day month weekday). Respond with ONLY the cron expression, or \
                the literal word INVALID if it cannot be expressed as one.\n\nSchedule: {trimmed}"
            );
            let request = CompletionRequest {
                max_tokens: Some(64),
                temperature: Some(0.0),
                ..CompletionRequest::new(vec![ChatMessage::user(prompt)], TaskType::SimpleTasks)
            };
            if let Ok(resp) = router.complete(request).await {
                let candidate = resp.content.trim();
                if candidate != "INVALID" && is_valid_five_field_cron(candidate) {
                    return Ok(candidate.to_string());
                }
            }
        }

        if let Some(expr) = phrase_table_fallback(trimmed) {
            if is_valid_five_field_cron(&expr) {
                return Ok(expr);
            }
        }

        Err(MamaError::InvalidCronExpression {
            expression: trimmed.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_raw_cron_as_is() {
        let parser = ScheduleParser::new(None);
        assert_eq!(parser.parse("*/5 * * * *").await.unwrap(), "*/5 * * * *");
    }

    #[tokio::test]
    async fn resolves_common_phrases_without_llm() {
        let parser = ScheduleParser::new(None);
        assert_eq!(parser.parse("every minute").await.unwrap(), "* * * * *");
        assert_eq!(parser.parse("hourly").await.unwrap(), "0 * * * *");
        assert_eq!(parser.parse("every 15 minutes").await.unwrap(), "*/15 * * * *");
        assert_eq!(parser.parse("every day at 09:30").await.unwrap(), "30 9 * * *");
        assert_eq!(parser.parse("every monday at 08:00").await.unwrap(), "0 8 * * 1");
    }

    #[tokio::test]
    async fn invalid_input_errors_without_llm() {
        let parser = ScheduleParser::new(None);
        assert!(parser.parse("do the thing whenever").await.is_err());
    }
}
