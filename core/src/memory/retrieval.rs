//! Retrieval pipeline: gathers candidate memories, episodes, and goals,
//! scores each, and greedily fills a fixed token budget.

use chrono::Utc;
use serde::Serialize;

use crate::error::Result;

use super::consolidated::{ConsolidatedMemoryStore, SearchFilter};
use super::episodic::EpisodicStore;
use super::estimate_tokens;

#[derive(Debug, Clone, Copy)]
pub struct RetrievalConfig {
    pub recent_window_hours: i64,
    pub min_confidence: f32,
    pub max_memories: usize,
    pub max_episodes: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            recent_window_hours: 24,
            min_confidence: 0.3,
            max_memories: 20,
            max_episodes: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalEntry {
    pub kind: &'static str,
    pub text: String,
    pub score: f32,
    pub tokens: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalStats {
    pub candidates: usize,
    pub selected: usize,
    pub memories: usize,
    pub episodes: usize,
    pub goals: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalResult {
    pub entries: Vec<RetrievalEntry>,
    pub formatted: String,
    pub token_count: usize,
    pub stats: RetrievalStats,
}

/// A pending job, as surfaced to retrieval. Decoupled from the scheduler's
/// own job type so this module doesn't need to depend on it.
#[derive(Debug, Clone)]
pub struct GoalCandidate {
    pub text: String,
    pub next_run: Option<chrono::DateTime<Utc>>,
}

pub struct RetrievalPipeline {
    config: RetrievalConfig,
}

impl RetrievalPipeline {
    pub fn new(config: RetrievalConfig) -> Self {
        Self { config }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        query_embedding: &[f32],
        token_budget: usize,
        memories: &ConsolidatedMemoryStore,
        episodes: &EpisodicStore,
        goals: Vec<GoalCandidate>,
    ) -> Result<RetrievalResult> {
        let mut candidates: Vec<RetrievalEntry> = vec![];

        let memory_filter = SearchFilter {
            top_k: Some(self.config.max_memories),
            min_confidence: Some(self.config.min_confidence),
            include_inactive: false,
            category: None,
        };
        let memory_hits = memories.search(query, query_embedding, &memory_filter).await?;
        let mut memory_count = 0;
        for (_cosine, memory) in &memory_hits {
            let lexical = lexical_overlap(query, &memory.content);
            let freshness = freshness(memory.updated_at, 14.0);
            let score = 0.5 * lexical + 0.35 * memory.confidence + 0.15 * freshness;
            memory_count += 1;
            candidates.push(entry("memory", memory.content.clone(), score));
        }

        let now = Utc::now();
        let start = now - chrono::Duration::hours(self.config.recent_window_hours);
        let recent = episodes
            .search_temporal(start, now)
            .await?
            .into_iter()
            .take(self.config.max_episodes);
        let mut episode_count = 0;
        for episode in recent {
            let lexical = lexical_overlap(query, &episode.content);
            let recency = recency(episode.timestamp, 24.0);
            let importance_bonus = if matches!(episode.importance, super::episodic::Importance::High) {
                1.0
            } else {
                0.0
            };
            let score = 0.55 * lexical + 0.45 * recency + 0.15 * importance_bonus;
            episode_count += 1;
            candidates.push(entry("episode", episode.content.clone(), score));
        }

        let mut sorted_goals = goals;
        sorted_goals.sort_by_key(|g| g.next_run);
        let goal_count = sorted_goals.len();
        for goal in &sorted_goals {
            let lexical = lexical_overlap(query, &goal.text);
            let urgency = goal
                .next_run
                .map(|next_run| urgency(next_run, now, 24.0))
                .unwrap_or(0.0);
            let score = 0.6 * lexical + 0.4 * urgency;
            candidates.push(entry("goal", goal.text.clone(), score));
        }

        let total_candidates = candidates.len();
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.tokens.cmp(&b.tokens))
        });

        let mut selected = vec![];
        let mut used = 0usize;
        for candidate in candidates {
            if used + candidate.tokens > token_budget {
                continue;
            }
            used += candidate.tokens;
            selected.push(candidate);
        }

        let formatted = selected
            .iter()
            .map(|e| e.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(RetrievalResult {
            stats: RetrievalStats {
                candidates: total_candidates,
                selected: selected.len(),
                memories: memory_count,
                episodes: episode_count,
                goals: goal_count,
            },
            token_count: used,
            entries: selected,
            formatted,
        })
    }
}

fn entry(kind: &'static str, text: String, score: f32) -> RetrievalEntry {
    let tokens = estimate_tokens(&text);
    RetrievalEntry { kind, text, score, tokens }
}

fn lexical_overlap(query: &str, content: &str) -> f32 {
    let query_lower = query.to_lowercase();
    let query_words: Vec<&str> = query_lower.split_whitespace().collect();
    if query_words.is_empty() {
        return 0.0;
    }
    let content_lower = content.to_lowercase();
    let hits = query_words.iter().filter(|w| content_lower.contains(*w)).count();
    hits as f32 / query_words.len() as f32
}

fn freshness(updated_at: chrono::DateTime<Utc>, half_life_days: f32) -> f32 {
    let age_days = (Utc::now() - updated_at).num_seconds() as f32 / 86400.0;
    (1.0 - (age_days.max(0.0) / half_life_days)).clamp(0.0, 1.0)
}

fn recency(timestamp: chrono::DateTime<Utc>, window_hours: f32) -> f32 {
    let age_hours = (Utc::now() - timestamp).num_seconds() as f32 / 3600.0;
    (1.0 - (age_hours.max(0.0) / window_hours)).clamp(0.0, 1.0)
}

/// 1 if past due, decays linearly to 0 at `window_hours` past `next_run`.
fn urgency(next_run: chrono::DateTime<Utc>, now: chrono::DateTime<Utc>, window_hours: f32) -> f32 {
    if next_run <= now {
        return 1.0;
    }
    let hours_until = (next_run - now).num_seconds() as f32 / 3600.0;
    (1.0 - (hours_until / window_hours)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::cost::CostTracker;
    use crate::llm::Router;
    use crate::memory::consolidated::{MemoryCategory, NewConsolidatedMemory};
    use crate::memory::embedding::EmbeddingService;
    use crate::memory::episodic::{EpisodeRole, NewEpisode};
    use crate::store::Store;
    use std::sync::Arc;

    #[tokio::test]
    async fn honors_token_budget() {
        let store = Store::open_in_memory().await.unwrap();
        let memories = ConsolidatedMemoryStore::new(store.clone());
        let tracker = CostTracker::new(store.clone());
        let router = Arc::new(Router::new(tracker));
        let embeddings = Arc::new(EmbeddingService::new(router));
        let episodes = EpisodicStore::new(store, embeddings);

        memories
            .insert(NewConsolidatedMemory {
                category: MemoryCategory::Fact,
                content: "likes rust programming".into(),
                confidence: 0.9,
                source_episode_ids: vec![],
                embedding: None,
            })
            .await
            .unwrap();
        episodes
            .store_episode(NewEpisode {
                channel: "terminal".into(),
                role: EpisodeRole::User,
                content: "asked about rust programming today".into(),
            })
            .await
            .unwrap();

        let pipeline = RetrievalPipeline::new(RetrievalConfig::default());
        let result = pipeline
            .retrieve("rust programming", &[], 8, &memories, &episodes, vec![])
            .await
            .unwrap();
        assert!(result.token_count <= 8);
        assert!(result.entries.len() <= 1);
    }

    #[test]
    fn urgency_is_one_when_past_due() {
        let now = Utc::now();
        let past = now - chrono::Duration::hours(1);
        assert_eq!(urgency(past, now, 24.0), 1.0);
    }

    #[test]
    fn urgency_decays_to_zero_at_window_edge() {
        let now = Utc::now();
        let future = now + chrono::Duration::hours(24);
        assert!(urgency(future, now, 24.0) <= 0.01);
    }
}
