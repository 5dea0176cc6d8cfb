//! Consolidated (long-term) memory: durable facts distilled from episodes by
//! the consolidation engine, with reinforcement, contradiction links, and
//! soft deactivation instead of hard deletes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Fact,
    Pattern,
    Relationship,
    Skill,
    Project,
    Goal,
    Preference,
    Routine,
    Emotional,
    Other,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Pattern => "pattern",
            Self::Relationship => "relationship",
            Self::Skill => "skill",
            Self::Project => "project",
            Self::Goal => "goal",
            Self::Preference => "preference",
            Self::Routine => "routine",
            Self::Emotional => "emotional",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pattern" => Self::Pattern,
            "relationship" => Self::Relationship,
            "skill" => Self::Skill,
            "project" => Self::Project,
            "goal" => Self::Goal,
            "preference" => Self::Preference,
            "routine" => Self::Routine,
            "emotional" => Self::Emotional,
            "fact" => Self::Fact,
            _ => Self::Other,
        }
    }

    /// Categories the soul document's Knowledge section draws from.
    pub fn is_knowledge(self) -> bool {
        matches!(
            self,
            Self::Fact | Self::Pattern | Self::Relationship | Self::Skill | Self::Project
        )
    }

    /// Categories the soul document's Preferences section draws from.
    pub fn is_preference_like(self) -> bool {
        matches!(self, Self::Preference | Self::Routine | Self::Emotional)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatedMemory {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub category: MemoryCategory,
    pub content: String,
    pub confidence: f32,
    pub source_episode_ids: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub active: bool,
    pub reinforcement_count: u32,
    pub last_reinforced_at: Option<DateTime<Utc>>,
    pub contradicting_ids: Vec<String>,
}

pub struct NewConsolidatedMemory {
    pub category: MemoryCategory,
    pub content: String,
    pub confidence: f32,
    pub source_episode_ids: Vec<String>,
    pub embedding: Option<Vec<f32>>,
}

#[derive(Clone)]
pub struct ConsolidatedMemoryStore {
    store: Store,
}

impl ConsolidatedMemoryStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn insert(&self, new: NewConsolidatedMemory) -> Result<ConsolidatedMemory> {
        let now = Utc::now();
        let memory = ConsolidatedMemory {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            category: new.category,
            content: new.content,
            confidence: new.confidence.clamp(0.0, 1.0),
            source_episode_ids: new.source_episode_ids,
            embedding: new.embedding,
            active: true,
            reinforcement_count: 1,
            last_reinforced_at: Some(now),
            contradicting_ids: vec![],
        };
        self.persist(&memory).await?;
        Ok(memory)
    }

    async fn persist(&self, m: &ConsolidatedMemory) -> Result<()> {
        self.store
            .run(
                "INSERT INTO consolidated_memories
                    (id, created_at, updated_at, category, content, confidence,
                     source_episode_ids, embedding, active, reinforcement_count,
                     last_reinforced_at, contradicting_ids)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                vec![
                    Value::from(m.id.clone()),
                    Value::from(m.created_at.to_rfc3339()),
                    Value::from(m.updated_at.to_rfc3339()),
                    Value::from(m.category.as_str()),
                    Value::from(m.content.clone()),
                    Value::from(m.confidence as f64),
                    Value::from(serde_json::to_string(&m.source_episode_ids).unwrap()),
                    m.embedding
                        .as_ref()
                        .map(|e| Value::from(serde_json::to_string(e).unwrap_or_default()))
                        .unwrap_or(Value::Null),
                    Value::from(m.active as i64),
                    Value::from(m.reinforcement_count),
                    m.last_reinforced_at
                        .map(|t| Value::from(t.to_rfc3339()))
                        .unwrap_or(Value::Null),
                    Value::from(serde_json::to_string(&m.contradicting_ids).unwrap()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConsolidatedMemory>> {
        let row = self
            .store
            .get(
                "SELECT * FROM consolidated_memories WHERE id = ?1",
                vec![Value::from(id.to_string())],
            )
            .await?;
        Ok(row.and_then(row_to_memory))
    }

    pub async fn reinforce(&self, id: &str) -> Result<Option<ConsolidatedMemory>> {
        let Some(mut memory) = self.get(id).await? else {
            return Ok(None);
        };
        memory.reinforcement_count += 1;
        memory.last_reinforced_at = Some(Utc::now());
        memory.updated_at = Utc::now();
        memory.confidence = (memory.confidence + 0.05).clamp(0.0, 1.0);
        self.update(&memory).await?;
        Ok(Some(memory))
    }

    /// Content change triggers re-embed; caller supplies the new embedding.
    pub async fn update_content(&self, id: &str, content: &str, embedding: Option<Vec<f32>>) -> Result<()> {
        self.store
            .run(
                "UPDATE consolidated_memories SET content = ?2, embedding = ?3, updated_at = ?4 WHERE id = ?1",
                vec![
                    Value::from(id.to_string()),
                    Value::from(content.to_string()),
                    embedding
                        .map(|e| Value::from(serde_json::to_string(&e).unwrap_or_default()))
                        .unwrap_or(Value::Null),
                    Value::from(Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn set_confidence(&self, id: &str, confidence: f32) -> Result<()> {
        self.store
            .run(
                "UPDATE consolidated_memories SET confidence = ?2, updated_at = ?3 WHERE id = ?1",
                vec![
                    Value::from(id.to_string()),
                    Value::from(confidence.clamp(0.0, 1.0) as f64),
                    Value::from(Utc::now().to_rfc3339()),
                ],
            )
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub async fn backdate_for_test(&self, id: &str, when: DateTime<Utc>) -> Result<()> {
        self.store
            .run(
                "UPDATE consolidated_memories SET created_at = ?2, last_reinforced_at = ?2 WHERE id = ?1",
                vec![Value::from(id.to_string()), Value::from(when.to_rfc3339())],
            )
            .await?;
        Ok(())
    }

    pub async fn deactivate(&self, id: &str) -> Result<()> {
        self.store
            .run(
                "UPDATE consolidated_memories SET active = 0, updated_at = ?2 WHERE id = ?1",
                vec![Value::from(id.to_string()), Value::from(Utc::now().to_rfc3339())],
            )
            .await?;
        Ok(())
    }

    pub async fn reactivate(&self, id: &str) -> Result<()> {
        self.store
            .run(
                "UPDATE consolidated_memories SET active = 1, updated_at = ?2 WHERE id = ?1",
                vec![Value::from(id.to_string()), Value::from(Utc::now().to_rfc3339())],
            )
            .await?;
        Ok(())
    }

    pub async fn mark_contradicting(&self, id: &str, other_id: &str) -> Result<()> {
        let Some(mut memory) = self.get(id).await? else {
            return Ok(());
        };
        if !memory.contradicting_ids.iter().any(|x| x == other_id) {
            memory.contradicting_ids.push(other_id.to_string());
        }
        memory.updated_at = Utc::now();
        self.update(&memory).await?;
        Ok(())
    }

    async fn update(&self, m: &ConsolidatedMemory) -> Result<()> {
        self.store
            .run(
                "UPDATE consolidated_memories SET
                    updated_at = ?2, confidence = ?3, active = ?4,
                    reinforcement_count = ?5, last_reinforced_at = ?6,
                    contradicting_ids = ?7
                 WHERE id = ?1",
                vec![
                    Value::from(m.id.clone()),
                    Value::from(m.updated_at.to_rfc3339()),
                    Value::from(m.confidence as f64),
                    Value::from(m.active as i64),
                    Value::from(m.reinforcement_count),
                    m.last_reinforced_at
                        .map(|t| Value::from(t.to_rfc3339()))
                        .unwrap_or(Value::Null),
                    Value::from(serde_json::to_string(&m.contradicting_ids).unwrap()),
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get_active(&self, min_confidence: f32) -> Result<Vec<ConsolidatedMemory>> {
        let rows = self
            .store
            .all(
                "SELECT * FROM consolidated_memories WHERE active = 1 AND confidence >= ?1 ORDER BY updated_at DESC",
                vec![Value::from(min_confidence as f64)],
            )
            .await?;
        Ok(rows.into_iter().filter_map(row_to_memory).collect())
    }

    pub async fn get_by_category(&self, category: MemoryCategory) -> Result<Vec<ConsolidatedMemory>> {
        let rows = self
            .store
            .all(
                "SELECT * FROM consolidated_memories WHERE category = ?1 AND active = 1 ORDER BY updated_at DESC",
                vec![Value::from(category.as_str())],
            )
            .await?;
        Ok(rows.into_iter().filter_map(row_to_memory).collect())
    }

    /// SQL-filtered candidates (newest first, capped at 2000), re-ranked by
    /// `0.75*cosine + 0.25*lexical + 0.05*confidence`.
    pub async fn search(&self, query: &str, query_embedding: &[f32], options: &SearchFilter) -> Result<Vec<(f32, ConsolidatedMemory)>> {
        let mut sql = String::from("SELECT * FROM consolidated_memories WHERE 1=1");
        let mut params = vec![];
        if !options.include_inactive {
            sql.push_str(" AND active = 1");
        }
        if let Some(category) = options.category {
            sql.push_str(" AND category = ?");
            params.push(Value::from(category.as_str()));
        }
        if let Some(min_confidence) = options.min_confidence {
            sql.push_str(" AND confidence >= ?");
            params.push(Value::from(min_confidence as f64));
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT 2000");
        let sql = renumber(&sql);
        let rows = self.store.all(&sql, params).await?;
        let candidates: Vec<ConsolidatedMemory> = rows.into_iter().filter_map(row_to_memory).collect();

        let query_lower = query.to_lowercase();
        let query_words: Vec<&str> = query_lower.split_whitespace().collect();
        let mut scored: Vec<(f32, ConsolidatedMemory)> = candidates
            .into_iter()
            .map(|m| {
                let cosine = m
                    .embedding
                    .as_ref()
                    .map(|v| super::cosine_similarity(query_embedding, v))
                    .unwrap_or(0.0);
                let lexical = lexical_overlap(&query_words, &m.content);
                let score = 0.75 * cosine + 0.25 * lexical + 0.05 * m.confidence;
                (score, m)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let top_k = options.top_k.unwrap_or(10);
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[derive(Debug, Default, Clone)]
pub struct SearchFilter {
    pub top_k: Option<usize>,
    pub min_confidence: Option<f32>,
    pub include_inactive: bool,
    pub category: Option<MemoryCategory>,
}

fn lexical_overlap(query_words: &[&str], content: &str) -> f32 {
    if query_words.is_empty() {
        return 0.0;
    }
    let content_lower = content.to_lowercase();
    let hits = query_words.iter().filter(|w| content_lower.contains(*w)).count();
    hits as f32 / query_words.len() as f32
}

fn renumber(sql: &str) -> String {
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

fn row_to_memory(row: crate::store::Row) -> Option<ConsolidatedMemory> {
    let get_str = |k: &str| row.get(k).and_then(|v| v.as_str()).map(str::to_string);
    Some(ConsolidatedMemory {
        id: get_str("id")?,
        created_at: get_str("created_at")?.parse().ok()?,
        updated_at: get_str("updated_at")?.parse().ok()?,
        category: MemoryCategory::parse(&get_str("category")?),
        content: get_str("content")?,
        confidence: row.get("confidence").and_then(|v| v.as_f64()).unwrap_or(0.0) as f32,
        source_episode_ids: get_str("source_episode_ids")
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        embedding: get_str("embedding").and_then(|s| serde_json::from_str(&s).ok()),
        active: row.get("active").and_then(|v| v.as_i64()).unwrap_or(0) != 0,
        reinforcement_count: row
            .get("reinforcement_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        last_reinforced_at: get_str("last_reinforced_at").and_then(|s| s.parse().ok()),
        contradicting_ids: get_str("contradicting_ids")
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> ConsolidatedMemoryStore {
        let store = Store::open_in_memory().await.unwrap();
        ConsolidatedMemoryStore::new(store)
    }

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = memory_store().await;
        let m = store
            .insert(NewConsolidatedMemory {
                category: MemoryCategory::Preference,
                content: "prefers dark mode".into(),
                confidence: 0.8,
                source_episode_ids: vec!["ep1".into()],
                embedding: None,
            })
            .await
            .unwrap();
        let fetched = store.get(&m.id).await.unwrap().unwrap();
        assert_eq!(fetched.content, "prefers dark mode");
        assert!(fetched.active);
    }

    #[tokio::test]
    async fn reinforce_increments_count_and_confidence() {
        let store = memory_store().await;
        let m = store
            .insert(NewConsolidatedMemory {
                category: MemoryCategory::Fact,
                content: "lives in Berlin".into(),
                confidence: 0.5,
                source_episode_ids: vec![],
                embedding: None,
            })
            .await
            .unwrap();
        let reinforced = store.reinforce(&m.id).await.unwrap().unwrap();
        assert_eq!(reinforced.reinforcement_count, 1);
        assert!(reinforced.confidence > 0.5);
        assert!(reinforced.last_reinforced_at.is_some());
    }

    #[tokio::test]
    async fn deactivate_excludes_from_active_list() {
        let store = memory_store().await;
        let m = store
            .insert(NewConsolidatedMemory {
                category: MemoryCategory::Goal,
                content: "learn rust".into(),
                confidence: 0.9,
                source_episode_ids: vec![],
                embedding: None,
            })
            .await
            .unwrap();
        store.deactivate(&m.id).await.unwrap();
        let active = store.get_active(0.0).await.unwrap();
        assert!(active.is_empty());
    }
}
