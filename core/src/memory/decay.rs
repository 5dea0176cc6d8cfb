//! Decay engine: confidence erosion for memories that haven't been
//! reinforced recently, with automatic deactivation once confidence bottoms
//! out.

use chrono::Utc;
use serde::Serialize;

use crate::error::Result;

use super::consolidated::ConsolidatedMemoryStore;

#[derive(Debug, Clone)]
pub struct DecayConfig {
    pub inactive_days_threshold: i64,
    pub decay_factor: f32,
    pub deactivate_threshold: f32,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            inactive_days_threshold: 30,
            decay_factor: 0.9,
            deactivate_threshold: 0.1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DecayReport {
    pub checked: usize,
    pub decayed: usize,
    pub deactivated: usize,
}

pub struct DecayEngine {
    config: DecayConfig,
}

impl DecayEngine {
    pub fn new(config: DecayConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, memories: &ConsolidatedMemoryStore) -> Result<DecayReport> {
        let active = memories.get_active(0.0).await?;
        let now = Utc::now();
        let mut report = DecayReport::default();

        for memory in active {
            report.checked += 1;
            let reference = memory.last_reinforced_at.unwrap_or(memory.created_at);
            let age_days = (now - reference).num_seconds() as f32 / 86400.0;
            if age_days < self.config.inactive_days_threshold as f32 {
                continue;
            }
            let new_confidence = (memory.confidence * self.config.decay_factor).clamp(0.0, 1.0);
            memories.set_confidence(&memory.id, new_confidence).await?;
            report.decayed += 1;
            if new_confidence < self.config.deactivate_threshold {
                memories.deactivate(&memory.id).await?;
                report.deactivated += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::consolidated::{MemoryCategory, NewConsolidatedMemory};
    use crate::store::Store;

    #[tokio::test]
    async fn decays_stale_memories_and_deactivates_below_threshold() {
        let store = Store::open_in_memory().await.unwrap();
        let memories = ConsolidatedMemoryStore::new(store);
        let m = memories
            .insert(NewConsolidatedMemory {
                category: MemoryCategory::Fact,
                content: "stale fact".into(),
                confidence: 0.12,
                source_episode_ids: vec![],
                embedding: None,
            })
            .await
            .unwrap();
        // Force it stale by backdating directly through the store.
        memories
            .backdate_for_test(&m.id, Utc::now() - chrono::Duration::days(60))
            .await
            .unwrap();

        let engine = DecayEngine::new(DecayConfig::default());
        let report = engine.run(&memories).await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.decayed, 1);
        assert_eq!(report.deactivated, 1);
    }

    #[tokio::test]
    async fn fresh_memories_are_untouched() {
        let store = Store::open_in_memory().await.unwrap();
        let memories = ConsolidatedMemoryStore::new(store);
        memories
            .insert(NewConsolidatedMemory {
                category: MemoryCategory::Fact,
                content: "fresh fact".into(),
                confidence: 0.9,
                source_episode_ids: vec![],
                embedding: None,
            })
            .await
            .unwrap();
        let engine = DecayEngine::new(DecayConfig::default());
        let report = engine.run(&memories).await.unwrap();
        assert_eq!(report.decayed, 0);
        assert_eq!(report.deactivated, 0);
    }
}
