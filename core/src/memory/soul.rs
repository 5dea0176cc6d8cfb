//! Soul document: a human-readable Markdown profile loaded at startup and
//! partially regenerated after each consolidation pass. Sections not owned
//! by consolidation (Identity, Personality, Boundaries) are left untouched.

use std::path::{Path, PathBuf};

use regex::Regex;
use tokio::fs;

use crate::error::Result;

use super::consolidated::{ConsolidatedMemory, MemoryCategory};

const SECTIONS: &[&str] = &[
    "Identity",
    "Personality",
    "Knowledge",
    "Active Goals",
    "Preferences",
    "Boundaries",
];

const DEFAULT_TEMPLATE: &str = "## Identity\n\n## Personality\n\n## Knowledge\n\n## Active Goals\n\n## Preferences\n\n## Boundaries\n";

pub struct SoulDocument {
    path: PathBuf,
    content: String,
}

impl SoulDocument {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => DEFAULT_TEMPLATE.to_string(),
        };
        Ok(Self { path, content })
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn section(&self, name: &str) -> Option<String> {
        section_body(&self.content, name)
    }

    /// Regenerate Knowledge, Active Goals, and Preferences from active
    /// consolidated memories, de-duplicated by content. Overwrites the file
    /// atomically (write to a temp path, then rename).
    pub async fn regenerate_from_memories(&mut self, memories: &[ConsolidatedMemory]) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        let active: Vec<&ConsolidatedMemory> = memories
            .iter()
            .filter(|m| m.active && seen.insert(m.content.clone()))
            .collect();

        let knowledge = select_top(&active, |c| c.is_knowledge(), 12);
        let goals = select_top(&active, |c| c == MemoryCategory::Goal, 8);
        let preferences = select_top(&active, |c| c.is_preference_like(), 8);

        let mut content = self.content.clone();
        content = upsert_section(&content, "Knowledge", &bullet_list(&knowledge));
        content = upsert_section(&content, "Active Goals", &bullet_list(&goals));
        content = upsert_section(&content, "Preferences", &bullet_list(&preferences));

        self.write_atomic(&content).await?;
        self.content = content;
        Ok(())
    }

    async fn write_atomic(&self, content: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, content).await?;
        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

fn select_top(
    memories: &[&ConsolidatedMemory],
    predicate: impl Fn(MemoryCategory) -> bool,
    limit: usize,
) -> Vec<String> {
    let mut matched: Vec<&ConsolidatedMemory> = memories
        .iter()
        .copied()
        .filter(|m| predicate(m.category))
        .collect();
    matched.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
    matched.into_iter().take(limit).map(|m| m.content.clone()).collect()
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return String::new();
    }
    items.iter().map(|i| format!("- {i}")).collect::<Vec<_>>().join("\n")
}

fn section_regex(name: &str) -> Regex {
    let escaped = regex::escape(name);
    Regex::new(&format!(r"(?ms)^## {escaped}\s*\n(.*?)(?:\n## |\z)")).unwrap()
}

fn section_body(content: &str, name: &str) -> Option<String> {
    section_regex(name).captures(content).map(|c| c[1].trim().to_string())
}

/// Replace the body of section `name`, leaving header and section order
/// intact. Appends the section if absent.
fn upsert_section(content: &str, name: &str, body: &str) -> String {
    let re = section_regex(name);
    let replacement = format!("## {name}\n\n{body}\n\n");
    if re.is_match(content) {
        re.replace(content, |_: &regex::Captures| replacement.clone()).into_owned()
    } else {
        format!("{}\n{}", content.trim_end(), replacement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn memory(category: MemoryCategory, content: &str, confidence: f32) -> ConsolidatedMemory {
        ConsolidatedMemory {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            category,
            content: content.to_string(),
            confidence,
            source_episode_ids: vec![],
            embedding: None,
            active: true,
            reinforcement_count: 1,
            last_reinforced_at: Some(Utc::now()),
            contradicting_ids: vec![],
        }
    }

    #[test]
    fn upsert_preserves_other_sections() {
        let content = DEFAULT_TEMPLATE;
        let updated = upsert_section(content, "Knowledge", "- likes rust");
        assert!(updated.contains("## Identity"));
        assert!(updated.contains("## Knowledge\n\n- likes rust"));
        assert!(updated.contains("## Boundaries"));
    }

    #[tokio::test]
    async fn regenerate_deduplicates_and_sorts_by_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("soul.md");
        tokio::fs::write(&path, DEFAULT_TEMPLATE).await.unwrap();
        let mut soul = SoulDocument::load(&path).await.unwrap();

        let memories = vec![
            memory(MemoryCategory::Fact, "duplicate fact", 0.4),
            memory(MemoryCategory::Fact, "duplicate fact", 0.9),
            memory(MemoryCategory::Goal, "ship the feature", 0.8),
        ];
        soul.regenerate_from_memories(&memories).await.unwrap();

        let knowledge = soul.section("Knowledge").unwrap();
        let occurrences = knowledge.matches("duplicate fact").count();
        assert_eq!(occurrences, 1);
        let goals = soul.section("Active Goals").unwrap();
        assert!(goals.contains("ship the feature"));
    }

    #[test]
    fn sections_constant_matches_canonical_headers() {
        for section in SECTIONS {
            assert!(DEFAULT_TEMPLATE.contains(&format!("## {section}")));
        }
    }
}
