//! Append-only audit trail for every sandbox capability call.
//!
//! Durable storage is preferred (backed by the persistent store's
//! `audit_entries` table) but a bounded in-memory fallback is part of the
//! contract: the sandbox must not depend on durability to keep functioning.

use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::store::Store;

const IN_MEMORY_CAP: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub capability: String,
    pub action: String,
    pub resource: String,
    pub params: String,
    pub decision: String,
    pub result: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub requested_by: String,
}

#[derive(Debug, Default, Clone)]
pub struct AuditFilter {
    pub capability: Option<String>,
    pub action: Option<String>,
    pub result: Option<String>,
    pub requested_by: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

enum Backend {
    Store(Store),
    /// Durable write failed or no store was configured; entries accumulate
    /// here instead, preserving the same query contract up to a cap.
    InMemory(StdMutex<VecDeque<AuditEntry>>),
}

pub struct AuditStore {
    backend: Backend,
}

impl AuditStore {
    pub fn new(store: Store) -> Self {
        Self {
            backend: Backend::Store(store),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Backend::InMemory(StdMutex::new(VecDeque::new())),
        }
    }

    pub async fn append(&self, entry: AuditEntry) -> Result<()> {
        match &self.backend {
            Backend::Store(store) => {
                store
                    .run(
                        "INSERT INTO audit_entries
                            (id, timestamp, capability, action, resource, params, decision,
                             result, output, error, duration_ms, requested_by)
                         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                        vec![
                            Value::from(entry.id.clone()),
                            Value::from(entry.timestamp.to_rfc3339()),
                            Value::from(entry.capability.clone()),
                            Value::from(entry.action.clone()),
                            Value::from(entry.resource.clone()),
                            Value::from(entry.params.clone()),
                            Value::from(entry.decision.clone()),
                            Value::from(entry.result.clone()),
                            entry.output.clone().map(Value::from).unwrap_or(Value::Null),
                            entry.error.clone().map(Value::from).unwrap_or(Value::Null),
                            Value::from(entry.duration_ms),
                            Value::from(entry.requested_by.clone()),
                        ],
                    )
                    .await?;
                Ok(())
            }
            Backend::InMemory(deque) => {
                let mut deque = deque.lock().unwrap();
                deque.push_back(entry);
                while deque.len() > IN_MEMORY_CAP {
                    deque.pop_front();
                }
                Ok(())
            }
        }
    }

    /// Newest-first, filtered by `filter`.
    pub async fn query(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditEntry>> {
        match &self.backend {
            Backend::Store(store) => {
                let mut sql = String::from("SELECT * FROM audit_entries WHERE 1=1");
                let mut params = vec![];
                if let Some(c) = &filter.capability {
                    sql.push_str(" AND capability = ?");
                    params.push(Value::from(c.clone()));
                }
                if let Some(a) = &filter.action {
                    sql.push_str(" AND action = ?");
                    params.push(Value::from(a.clone()));
                }
                if let Some(r) = &filter.result {
                    sql.push_str(" AND result = ?");
                    params.push(Value::from(r.clone()));
                }
                if let Some(r) = &filter.requested_by {
                    sql.push_str(" AND requested_by = ?");
                    params.push(Value::from(r.clone()));
                }
                if let Some(s) = &filter.since {
                    sql.push_str(" AND timestamp >= ?");
                    params.push(Value::from(s.to_rfc3339()));
                }
                if let Some(u) = &filter.until {
                    sql.push_str(" AND timestamp <= ?");
                    params.push(Value::from(u.to_rfc3339()));
                }
                sql.push_str(" ORDER BY timestamp DESC LIMIT ?");
                params.push(Value::from(limit as i64));
                // rusqlite positional params use ?1, ?2... rewrite sequentially.
                let sql = renumber_placeholders(&sql);
                let rows = store.all(&sql, params).await?;
                Ok(rows.into_iter().filter_map(row_to_entry).collect())
            }
            Backend::InMemory(deque) => {
                let deque = deque.lock().unwrap();
                let mut out: Vec<AuditEntry> = deque
                    .iter()
                    .rev()
                    .filter(|e| {
                        filter.capability.as_deref().map_or(true, |c| e.capability == c)
                            && filter.action.as_deref().map_or(true, |a| e.action == a)
                            && filter.result.as_deref().map_or(true, |r| e.result == r)
                            && filter
                                .requested_by
                                .as_deref()
                                .map_or(true, |r| e.requested_by == r)
                            && filter.since.map_or(true, |s| e.timestamp >= s)
                            && filter.until.map_or(true, |u| e.timestamp <= u)
                    })
                    .cloned()
                    .collect();
                out.truncate(limit);
                Ok(out)
            }
        }
    }

    pub async fn get_recent(&self, n: usize) -> Result<Vec<AuditEntry>> {
        self.query(&AuditFilter::default(), n).await
    }
}

fn renumber_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut n = 0;
    for ch in sql.chars() {
        if ch == '?' {
            n += 1;
            out.push('?');
            out.push_str(&n.to_string());
        } else {
            out.push(ch);
        }
    }
    out
}

fn row_to_entry(row: crate::store::Row) -> Option<AuditEntry> {
    let get_str = |k: &str| row.get(k).and_then(|v| v.as_str()).map(str::to_string);
    Some(AuditEntry {
        id: get_str("id")?,
        timestamp: get_str("timestamp")?.parse().ok()?,
        capability: get_str("capability")?,
        action: get_str("action")?,
        resource: get_str("resource")?,
        params: get_str("params")?,
        decision: get_str("decision")?,
        result: get_str("result")?,
        output: get_str("output"),
        error: get_str("error"),
        duration_ms: row.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0),
        requested_by: get_str("requested_by")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(capability: &str) -> AuditEntry {
        AuditEntry {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            capability: capability.to_string(),
            action: "read".to_string(),
            resource: "/tmp/a".to_string(),
            params: "{}".to_string(),
            decision: "auto-approved".to_string(),
            result: "success".to_string(),
            output: Some("ok".to_string()),
            error: None,
            duration_ms: 5,
            requested_by: "terminal".to_string(),
        }
    }

    #[tokio::test]
    async fn in_memory_append_and_query() {
        let audit = AuditStore::in_memory();
        audit.append(sample("filesystem")).await.unwrap();
        audit.append(sample("shell")).await.unwrap();
        let recent = audit.get_recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].capability, "shell");
    }

    #[tokio::test]
    async fn store_backed_append_and_query() {
        let store = Store::open_in_memory().await.unwrap();
        let audit = AuditStore::new(store);
        audit.append(sample("network")).await.unwrap();
        let recent = audit.get_recent(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].capability, "network");
    }

    #[tokio::test]
    async fn filter_by_capability() {
        let audit = AuditStore::in_memory();
        audit.append(sample("filesystem")).await.unwrap();
        audit.append(sample("shell")).await.unwrap();
        let filtered = audit
            .query(
                &AuditFilter {
                    capability: Some("shell".to_string()),
                    ..Default::default()
                },
                10,
            )
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].capability, "shell");
    }
}
