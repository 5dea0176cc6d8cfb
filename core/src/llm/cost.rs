//! Cost tracker: immutable append log of LLM usage, backed by the store.
//!
//! Pricing is a lookup table by model with per-million-token input/output
//! rates; local models default to zero, matching the teacher's distinction
//! between hosted and self-hosted providers.

use chrono::{Datelike, Duration as ChronoDuration, Utc, Weekday};
use lazy_static::lazy_static;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, Copy)]
struct Pricing {
    input_per_million: f64,
    output_per_million: f64,
}

lazy_static! {
    static ref PRICING_TABLE: HashMap<&'static str, Pricing> = HashMap::from([
        (
            "gpt-4o",
            Pricing {
                input_per_million: 2.50,
                output_per_million: 10.00
            }
        ),
        (
            "gpt-4o-mini",
            Pricing {
                input_per_million: 0.15,
                output_per_million: 0.60
            }
        ),
        (
            "claude-3-5-sonnet",
            Pricing {
                input_per_million: 3.00,
                output_per_million: 15.00
            }
        ),
    ]);
}

fn price_for(model: &str) -> Pricing {
    PRICING_TABLE.get(model).copied().unwrap_or(Pricing {
        input_per_million: 0.0,
        output_per_million: 0.0,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub id: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub task_type: String,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CostSummary {
    pub total_usd: f64,
    pub by_model: HashMap<String, f64>,
    pub average_per_day_usd: f64,
}

#[derive(Clone)]
pub struct CostTracker {
    store: Store,
}

impl CostTracker {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        task_type: &str,
        latency_ms: u64,
    ) -> Result<UsageRecord> {
        let pricing = price_for(model);
        let cost_usd = (input_tokens as f64 / 1_000_000.0) * pricing.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * pricing.output_per_million;
        let record = UsageRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            provider: provider.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost_usd,
            task_type: task_type.to_string(),
            latency_ms,
        };
        self.store
            .run(
                "INSERT INTO llm_usage
                    (id, timestamp, provider, model, input_tokens, output_tokens, cost_usd,
                     task_type, latency_ms)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                vec![
                    Value::from(record.id.clone()),
                    Value::from(record.timestamp.to_rfc3339()),
                    Value::from(record.provider.clone()),
                    Value::from(record.model.clone()),
                    Value::from(record.input_tokens),
                    Value::from(record.output_tokens),
                    Value::from(record.cost_usd),
                    Value::from(record.task_type.clone()),
                    Value::from(record.latency_ms),
                ],
            )
            .await?;
        Ok(record)
    }

    async fn summarize_since(&self, since: chrono::DateTime<Utc>) -> Result<CostSummary> {
        let rows = self
            .store
            .all(
                "SELECT model, cost_usd FROM llm_usage WHERE timestamp >= ?1",
                vec![Value::from(since.to_rfc3339())],
            )
            .await?;
        let mut by_model: HashMap<String, f64> = HashMap::new();
        let mut total = 0.0;
        for row in &rows {
            let model = row.get("model").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
            let cost = row.get("cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0);
            *by_model.entry(model).or_insert(0.0) += cost;
            total += cost;
        }
        let span_days = (Utc::now() - since).num_seconds() as f64 / 86400.0;
        let average_per_day_usd = total / (span_days.ceil().max(1.0));
        Ok(CostSummary {
            total_usd: total,
            by_model,
            average_per_day_usd,
        })
    }

    pub async fn today(&self) -> Result<CostSummary> {
        let midnight = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        self.summarize_since(midnight).await
    }

    pub async fn this_week(&self) -> Result<CostSummary> {
        let now = Utc::now();
        let days_since_sunday = now.weekday().num_days_from_sunday();
        let start = (now - ChronoDuration::days(days_since_sunday as i64))
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        self.summarize_since(start).await
    }

    pub async fn this_month(&self) -> Result<CostSummary> {
        let now = Utc::now();
        let start = now
            .date_naive()
            .with_day(1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        self.summarize_since(start).await
    }

    pub async fn all_time(&self) -> Result<CostSummary> {
        self.summarize_since(chrono::DateTime::<Utc>::from_timestamp(0, 0).unwrap())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_cost_for_known_model() {
        let store = Store::open_in_memory().await.unwrap();
        let tracker = CostTracker::new(store);
        let record = tracker
            .record("cloud", "gpt-4o-mini", 1_000_000, 1_000_000, "general", 100)
            .await
            .unwrap();
        assert!((record.cost_usd - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn local_models_default_to_zero_cost() {
        let store = Store::open_in_memory().await.unwrap();
        let tracker = CostTracker::new(store);
        let record = tracker
            .record("local", "llama3", 1_000_000, 1_000_000, "general", 100)
            .await
            .unwrap();
        assert_eq!(record.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn sum_per_model_equals_total() {
        let store = Store::open_in_memory().await.unwrap();
        let tracker = CostTracker::new(store);
        tracker
            .record("cloud", "gpt-4o", 1000, 1000, "general", 10)
            .await
            .unwrap();
        tracker
            .record("cloud", "gpt-4o-mini", 1000, 1000, "general", 10)
            .await
            .unwrap();
        let summary = tracker.all_time().await.unwrap();
        let sum: f64 = summary.by_model.values().sum();
        assert!((sum - summary.total_usd).abs() < 1e-9);
    }
}
