//! Embedding service: wraps a provider `embed` call with an unbounded
//! in-memory cache keyed by trimmed text. Batch embedding deduplicates
//! inputs before calling the provider.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::Result;
use crate::llm::Router;

pub struct EmbeddingService {
    router: Arc<Router>,
    cache: RwLock<HashMap<String, Vec<f32>>>,
}

impl EmbeddingService {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Embed `text`, tolerant of provider failure only at the call site —
    /// this method itself surfaces the error so callers (episodic store) can
    /// decide to store a null embedding instead of failing the write.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let key = text.trim().to_string();
        if let Some(cached) = self.cache.read().await.get(&key) {
            return Ok(cached.clone());
        }
        let vector = self.router.embed(&key).await?;
        self.cache.write().await.insert(key, vector.clone());
        Ok(vector)
    }

    /// Embed many texts, deduplicating before calling the provider.
    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Result<Vec<f32>>> {
        let mut unique: Vec<String> = vec![];
        for t in texts {
            let key = t.trim().to_string();
            if !unique.contains(&key) {
                unique.push(key);
            }
        }
        let mut resolved: HashMap<String, Result<Vec<f32>>> = HashMap::new();
        for key in unique {
            let result = self.embed(&key).await;
            resolved.insert(key, result);
        }
        texts
            .iter()
            .map(|t| {
                let key = t.trim().to_string();
                match resolved.get(&key) {
                    Some(Ok(v)) => Ok(v.clone()),
                    Some(Err(e)) => Err(clone_err(e)),
                    None => Ok(vec![]),
                }
            })
            .collect()
    }
}

fn clone_err(e: &crate::error::MamaError) -> crate::error::MamaError {
    crate::error::MamaError::Internal {
        message: e.to_string(),
    }
}
