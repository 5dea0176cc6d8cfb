//! Episodic memory: one row per interaction turn, with automatic metadata
//! enrichment (topics, entities, importance, emotional tone) and semantic /
//! temporal / hybrid search.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::cosine_similarity;
use super::embedding::EmbeddingService;
use crate::error::Result;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeRole {
    System,
    User,
    Assistant,
    Tool,
}

impl EpisodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => Self::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    Low,
    Medium,
    High,
}

impl Importance {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tone {
    Neutral,
    Positive,
    Negative,
}

impl Tone {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Positive => "positive",
            Self::Negative => "negative",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub role: EpisodeRole,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub topics: Vec<String>,
    pub entities: Vec<String>,
    pub importance: Importance,
    pub emotional_tone: Tone,
    pub extra: Value,
    pub consolidated: bool,
}

pub struct NewEpisode {
    pub channel: String,
    pub role: EpisodeRole,
    pub content: String,
}

#[derive(Debug, Default, Clone)]
pub struct SearchOptions {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub channel: Option<String>,
    pub role: Option<EpisodeRole>,
    pub top_k: Option<usize>,
}

const STOPWORDS: &[&str] = &[
    "this", "that", "with", "from", "have", "about", "would", "there", "their",
    "which", "could", "should", "these", "those", "where", "when", "what",
    "your", "been", "were", "into", "than", "them", "then", "also",
];

fn extract_topics(content: &str) -> Vec<String> {
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for word in content.split_whitespace() {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if cleaned.len() >= 4 && !STOPWORDS.contains(&cleaned.as_str()) {
            *counts.entry(cleaned).or_insert(0) += 1;
        }
    }
    let mut entries: Vec<(String, usize)> = counts.into_iter().collect();
    entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    entries.into_iter().take(6).map(|(w, _)| w).collect()
}

fn extract_entities(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut entities = vec![];
    for word in content.split_whitespace() {
        let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        if cleaned.len() >= 3
            && cleaned.chars().next().map(|c| c.is_uppercase()).unwrap_or(false)
            && seen.insert(cleaned.clone())
        {
            entities.push(cleaned);
            if entities.len() >= 8 {
                break;
            }
        }
    }
    entities
}

fn classify_importance(content: &str) -> Importance {
    let lower = content.to_lowercase();
    if ["urgent", "critical", "security", "incident"]
        .iter()
        .any(|kw| lower.contains(kw))
        || content.len() > 280
    {
        Importance::High
    } else if content.len() > 120 {
        Importance::Medium
    } else {
        Importance::Low
    }
}

const POSITIVE_WORDS: &[&str] = &["great", "thanks", "awesome", "happy", "good", "love", "excellent"];
const NEGATIVE_WORDS: &[&str] = &["bad", "angry", "hate", "frustrated", "terrible", "sad", "worried"];

fn classify_tone(content: &str) -> Tone {
    let lower = content.to_lowercase();
    let positive = POSITIVE_WORDS.iter().any(|w| lower.contains(w));
    let negative = NEGATIVE_WORDS.iter().any(|w| lower.contains(w));
    match (positive, negative) {
        (true, false) => Tone::Positive,
        (false, true) => Tone::Negative,
        _ => Tone::Neutral,
    }
}

pub struct EpisodicStore {
    store: Store,
    embeddings: Arc<EmbeddingService>,
}

impl EpisodicStore {
    pub fn new(store: Store, embeddings: Arc<EmbeddingService>) -> Self {
        Self { store, embeddings }
    }

    pub async fn store_episode(&self, new: NewEpisode) -> Result<Episode> {
        let topics = extract_topics(&new.content);
        let entities = extract_entities(&new.content);
        let importance = classify_importance(&new.content);
        let emotional_tone = classify_tone(&new.content);
        // Embedding failure is tolerated: store with null embedding on error.
        let embedding = self.embeddings.embed(&new.content).await.ok();

        let episode = Episode {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            channel: new.channel,
            role: new.role,
            content: new.content,
            embedding,
            topics,
            entities,
            importance,
            emotional_tone,
            extra: Value::Object(Default::default()),
            consolidated: false,
        };

        self.store
            .run(
                "INSERT INTO episodes
                    (id, timestamp, channel, role, content, embedding, topics, entities,
                     importance, emotional_tone, extra, consolidated)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
                vec![
                    Value::from(episode.id.clone()),
                    Value::from(episode.timestamp.to_rfc3339()),
                    Value::from(episode.channel.clone()),
                    Value::from(episode.role.as_str()),
                    Value::from(episode.content.clone()),
                    episode
                        .embedding
                        .as_ref()
                        .map(|e| Value::from(serde_json::to_string(e).unwrap_or_default()))
                        .unwrap_or(Value::Null),
                    Value::from(serde_json::to_string(&episode.topics).unwrap()),
                    Value::from(serde_json::to_string(&episode.entities).unwrap()),
                    Value::from(episode.importance.as_str()),
                    Value::from(episode.emotional_tone.as_str()),
                    Value::from(episode.extra.to_string()),
                    Value::from(0i64),
                ],
            )
            .await?;

        Ok(episode)
    }

    pub async fn get_recent(&self, n: usize) -> Result<Vec<Episode>> {
        let rows = self
            .store
            .all(
                "SELECT * FROM episodes ORDER BY timestamp DESC LIMIT ?1",
                vec![Value::from(n as i64)],
            )
            .await?;
        Ok(rows.into_iter().filter_map(row_to_episode).collect())
    }

    pub async fn search_temporal(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<Episode>> {
        let rows = self
            .store
            .all(
                "SELECT * FROM episodes WHERE timestamp >= ?1 AND timestamp <= ?2 ORDER BY timestamp DESC",
                vec![Value::from(start.to_rfc3339()), Value::from(end.to_rfc3339())],
            )
            .await?;
        Ok(rows.into_iter().filter_map(row_to_episode).collect())
    }

    pub async fn search_semantic(&self, query: &str, options: &SearchOptions) -> Result<Vec<Episode>> {
        let query_embedding = self.embeddings.embed(query).await.unwrap_or_default();
        let candidates = self.filtered_candidates(options).await?;
        let mut scored: Vec<(f32, Episode)> = candidates
            .into_iter()
            .map(|e| {
                let score = e
                    .embedding
                    .as_ref()
                    .map(|v| cosine_similarity(&query_embedding, v))
                    .unwrap_or(0.0);
                (score, e)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let top_k = options.top_k.unwrap_or(10);
        Ok(scored.into_iter().take(top_k).map(|(_, e)| e).collect())
    }

    pub async fn search_hybrid(&self, query: &str, options: &SearchOptions) -> Result<Vec<(f32, Episode)>> {
        let query_embedding = self.embeddings.embed(query).await.unwrap_or_default();
        let query_topics: HashSet<String> = extract_topics(query).into_iter().collect();
        let candidates = self.filtered_candidates(options).await?;
        let now = Utc::now();
        let mut scored: Vec<(f32, Episode)> = candidates
            .into_iter()
            .map(|e| {
                let semantic = e
                    .embedding
                    .as_ref()
                    .map(|v| cosine_similarity(&query_embedding, v))
                    .unwrap_or(0.0);
                let age_days = (now - e.timestamp).num_seconds() as f32 / 86400.0;
                let recency = 1.0 / (1.0 + age_days.max(0.0));
                let topic_hits = e.topics.iter().filter(|t| query_topics.contains(*t)).count();
                let topic_hit_rate = if e.topics.is_empty() {
                    0.0
                } else {
                    topic_hits as f32 / e.topics.len() as f32
                };
                let score = 0.65 * semantic + 0.25 * recency + 0.10 * topic_hit_rate;
                (score, e)
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        let top_k = options.top_k.unwrap_or(10);
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn filtered_candidates(&self, options: &SearchOptions) -> Result<Vec<Episode>> {
        let mut sql = String::from("SELECT * FROM episodes WHERE 1=1");
        let mut params = vec![];
        if let Some(start) = options.start {
            sql.push_str(" AND timestamp >= ?");
            params.push(Value::from(start.to_rfc3339()));
        }
        if let Some(end) = options.end {
            sql.push_str(" AND timestamp <= ?");
            params.push(Value::from(end.to_rfc3339()));
        }
        if let Some(channel) = &options.channel {
            sql.push_str(" AND channel = ?");
            params.push(Value::from(channel.clone()));
        }
        if let Some(role) = options.role {
            sql.push_str(" AND role = ?");
            params.push(Value::from(role.as_str()));
        }
        sql.push_str(" ORDER BY timestamp DESC");
        let sql = renumber(&sql);
        let rows = self.store.all(&sql, params).await?;
        Ok(rows.into_iter().filter_map(row_to_episode).collect())
    }

    pub async fn mark_consolidated(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            self.store
                .run(
                    "UPDATE episodes SET consolidated = 1 WHERE id = ?1",
                    vec![Value::from(id.clone())],
                )
                .await?;
        }
        Ok(())
    }

    pub async fn count_pending(&self) -> Result<usize> {
        let row = self
            .store
            .get("SELECT COUNT(*) as n FROM episodes WHERE consolidated = 0", vec![])
            .await?;
        Ok(row.and_then(|r| r.get("n").and_then(|v| v.as_u64())).unwrap_or(0) as usize)
    }

    pub async fn load_pending(&self, batch_size: usize) -> Result<Vec<Episode>> {
        let rows = self
            .store
            .all(
                "SELECT * FROM episodes WHERE consolidated = 0 ORDER BY timestamp ASC LIMIT ?1",
                vec![Value::from(batch_size as i64)],
            )
            .await?;
        Ok(rows.into_iter().filter_map(row_to_episode).collect())
    }
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

fn row_to_episode(row: crate::store::Row) -> Option<Episode> {
    let get_str = |k: &str| row.get(k).and_then(|v| v.as_str()).map(str::to_string);
    let embedding = row
        .get("embedding")
        .and_then(|v| v.as_str())
        .and_then(|s| serde_json::from_str::<Vec<f32>>(s).ok());
    Some(Episode {
        id: get_str("id")?,
        timestamp: get_str("timestamp")?.parse().ok()?,
        channel: get_str("channel")?,
        role: EpisodeRole::parse(&get_str("role")?),
        content: get_str("content")?,
        embedding,
        topics: get_str("topics")
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        entities: get_str("entities")
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        importance: match get_str("importance").as_deref() {
            Some("high") => Importance::High,
            Some("medium") => Importance::Medium,
            _ => Importance::Low,
        },
        emotional_tone: match get_str("emotional_tone").as_deref() {
            Some("positive") => Tone::Positive,
            Some("negative") => Tone::Negative,
            _ => Tone::Neutral,
        },
        extra: get_str("extra")
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or(Value::Null),
        consolidated: row.get("consolidated").and_then(|v| v.as_i64()).unwrap_or(0) != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::cost::CostTracker;
    use crate::llm::Router;

    async fn episodic_store() -> EpisodicStore {
        let store = Store::open_in_memory().await.unwrap();
        let tracker = CostTracker::new(store.clone());
        let router = Arc::new(Router::new(tracker));
        let embeddings = Arc::new(EmbeddingService::new(router));
        EpisodicStore::new(store, embeddings)
    }

    #[tokio::test]
    async fn importance_classification_on_length_and_keywords() {
        assert_eq!(classify_importance("this is urgent"), Importance::High);
        assert_eq!(classify_importance(&"a".repeat(130)), Importance::Medium);
        assert_eq!(classify_importance("short"), Importance::Low);
    }

    #[tokio::test]
    async fn stores_with_null_embedding_when_provider_unavailable() {
        let store = episodic_store().await;
        let episode = store
            .store_episode(NewEpisode {
                channel: "terminal".into(),
                role: EpisodeRole::User,
                content: "hello there, general assistant".into(),
            })
            .await
            .unwrap();
        assert!(episode.embedding.is_none());
        assert!(!episode.consolidated);
    }

    #[tokio::test]
    async fn consolidated_flag_is_monotonic() {
        let store = episodic_store().await;
        let episode = store
            .store_episode(NewEpisode {
                channel: "terminal".into(),
                role: EpisodeRole::User,
                content: "remember this please".into(),
            })
            .await
            .unwrap();
        store.mark_consolidated(&[episode.id.clone()]).await.unwrap();
        let pending = store.count_pending().await.unwrap();
        assert_eq!(pending, 0);
    }
}
