//! The Store: insert, search with relevance blending, auto-linking,
//! reinforcement, and forget. The facade `Engine` (see `engine.rs`) is a thin
//! wrapper over this type plus consolidation.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::decay::{self, within_reinforcement_window};
use crate::error::{CortexError, Result};
use crate::links::{self, MemoryLink, Relationship};
use crate::memory::{Category, IngestInput, Memory, MemoryType, Scope, GLOBAL_PROJECT};
use crate::similarity;
use crate::storage::Storage;

/// Top-N candidates considered for auto-link detection on insert.
const AUTO_LINK_CANDIDATE_POOL: usize = 20;

/// Maximum number of auto-link edges created per insert.
const AUTO_LINK_MAX_EDGES: usize = 3;

/// How many top search results receive reinforcement side effects.
const REINFORCEMENT_TOP_N: usize = 5;

/// Minimum new tokens the query must contribute before it's folded into the
/// top result as enrichment context.
const ENRICHMENT_TOKEN_THRESHOLD: usize = 30;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub query: Option<String>,
    pub project: String,
    pub category: Option<Category>,
    pub min_salience: Option<f64>,
    pub include_global: bool,
    pub include_decayed: bool,
    pub limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub memory: Memory,
    pub relevance: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgetFilter {
    pub ids: Option<Vec<String>>,
    pub category: Option<Category>,
    pub older_than_days: Option<i64>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForgetResult {
    pub deleted: usize,
    pub preview: Option<Vec<String>>,
}

pub struct Store {
    storage: Storage,
    config: EngineConfig,
}

impl Store {
    pub fn new(storage: Storage, config: EngineConfig) -> Self {
        Self { storage, config }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Insert a new memory, enforcing the content limit, scoring salience,
    /// auto-classifying, extracting tags, and auto-linking to similar
    /// existing memories. Returns the stored memory.
    pub fn add_memory(&self, input: IngestInput) -> Result<Memory> {
        let now = Utc::now();
        if input.strict && input.content.len() > crate::memory::MAX_CONTENT_BYTES {
            return Err(CortexError::ContentTooLarge(input.content.len()));
        }
        let (content, _truncated) = Memory::enforce_content_limit(&input.content);

        let category = input.category.unwrap_or_else(|| decay::suggest_category(&content));
        let salience = input
            .salience_override
            .unwrap_or_else(|| decay::compute_salience(&content, input.importance.as_deref()));

        let mut tags = decay::extract_tags(&content);
        tags.extend(input.tags);

        let project = input.project.unwrap_or_else(|| GLOBAL_PROJECT.to_string());
        let scope = input.scope.unwrap_or_default();
        let memory_type = input.memory_type.unwrap_or_default();

        let id = Uuid::new_v4().to_string();
        let memory = self.storage.insert_memory(
            &id,
            memory_type,
            category,
            &input.title,
            &content,
            &project,
            scope,
            input.transferable,
            &tags,
            salience,
            now,
            &serde_json::Value::Null,
        )?;

        if let Err(e) = self.auto_link_new_memory(&memory) {
            tracing::warn!(memory_id = %memory.id, error = %e, "auto-link on insert failed");
        }

        Ok(memory)
    }

    fn auto_link_new_memory(&self, memory: &Memory) -> Result<()> {
        let candidates = self.storage.candidates_by_tag(
            &memory.tags,
            &memory.project,
            &memory.id,
            AUTO_LINK_CANDIDATE_POOL as i64,
        )?;

        let memory_tokens = similarity::tokenize(&memory.content);
        let mut scored: Vec<(String, f64)> = candidates
            .iter()
            .map(|c| {
                let candidate_tokens = similarity::tokenize(&c.content);
                (c.id.clone(), similarity::jaccard_sets(&memory_tokens, &candidate_tokens))
            })
            .filter(|(_, j)| *j > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        for (target_id, jaccard) in scored.into_iter().take(AUTO_LINK_MAX_EDGES) {
            let strength = links::auto_link_strength(jaccard);
            self.storage
                .insert_link(&memory.id, &target_id, Relationship::Related, strength, Utc::now())?;
        }
        Ok(())
    }

    /// Full search: keyword relevance blended with decay, recency, category
    /// match, link boost, and tag overlap; applies reinforcement side
    /// effects to the top results after the read completes.
    pub fn search(&self, query: SearchQuery) -> Result<Vec<SearchResult>> {
        let now = Utc::now();
        let query_text = query.query.clone().unwrap_or_default();

        let (candidates, bm25_by_id): (Vec<Memory>, BTreeMap<String, f32>) = if query_text.trim().is_empty() {
            (self.storage.list_memories(Some(&query.project))?, BTreeMap::new())
        } else {
            let hits = self
                .storage
                .keyword_search(&query_text, &query.project, (query.limit.max(1) * 4).max(50))?;
            let scores = hits.iter().map(|(m, score)| (m.id.clone(), *score)).collect();
            (hits.into_iter().map(|(m, _)| m).collect(), scores)
        };

        let query_tokens = similarity::tokenize(&query_text);
        let query_category = if query_text.trim().is_empty() {
            None
        } else {
            Some(decay::suggest_category(&query_text))
        };

        let mut scored = Vec::new();
        for memory in candidates {
            if !query.include_global && memory.scope == Scope::Global && memory.project != query.project {
                continue;
            }
            if let Some(cat) = query.category {
                if memory.category != cat {
                    continue;
                }
            }
            if let Some(min_salience) = query.min_salience {
                if memory.salience < min_salience {
                    continue;
                }
            }

            let current_decayed = decay::decayed_score(&memory, now);
            if !query.include_decayed && current_decayed < memory.category.deletion_threshold() {
                continue;
            }

            // An empty query has no keyword/category/tag signal to blend, so
            // rank purely by decayed_score rather than the full relevance mix.
            let relevance = if query_text.trim().is_empty() {
                current_decayed
            } else {
                let bm25 = bm25_by_id.get(&memory.id).copied().unwrap_or(0.0) as f64;
                self.relevance_score(&memory, bm25, current_decayed, query_category, &query_tokens)?
            };
            scored.push(SearchResult { memory, relevance });
        }

        scored.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        scored.truncate(query.limit.max(0) as usize);

        if let Err(e) = self.reinforce_top_results(&scored, &query_text) {
            tracing::warn!(error = %e, "search reinforcement side effects failed");
        }

        Ok(scored)
    }

    fn relevance_score(
        &self,
        memory: &Memory,
        bm25_normalized: f64,
        current_decayed: f64,
        query_category: Option<Category>,
        query_tokens: &BTreeSet<String>,
    ) -> Result<f64> {
        let mut score = 0.0;
        score += 0.30 * bm25_normalized;
        score += 0.25 * current_decayed;
        score += 0.10 * memory.salience;

        let hours = memory.hours_since_access(Utc::now());
        score += if hours < 1.0 {
            0.10
        } else if hours < 24.0 {
            0.05
        } else {
            0.0
        };

        if let Some(qc) = query_category {
            if qc == memory.category {
                score += 0.10;
            }
        }

        let links = self.storage.links_for(&memory.id)?;
        if !links.is_empty() {
            let mean_strength = links.iter().map(|l| l.strength).sum::<f64>() / links.len() as f64;
            score += 0.15 * mean_strength;
        }

        let tag_jaccard = if query_tokens.is_empty() || memory.tags.is_empty() {
            0.0
        } else {
            similarity::jaccard_sets(query_tokens, &memory.tags)
        };
        score += 0.10 * tag_jaccard;

        Ok(score)
    }

    fn reinforce_top_results(&self, results: &[SearchResult], query_text: &str) -> Result<()> {
        let top: Vec<&SearchResult> = results.iter().take(REINFORCEMENT_TOP_N).collect();
        let now = Utc::now();

        for result in &top {
            self.storage.update_memory_access(&result.memory.id, now)?;
            let boost = 0.05 / (1.0 + result.memory.access_count as f64);
            let new_salience = (result.memory.salience + boost).min(1.0);
            self.storage.update_salience(&result.memory.id, new_salience)?;
            self.storage.update_decayed_score(
                &result.memory.id,
                decay::decayed_score(
                    &Memory { salience: new_salience, ..result.memory.clone() },
                    now,
                ),
            )?;
        }

        for i in 0..top.len() {
            for j in (i + 1)..top.len() {
                let a = &top[i].memory;
                let b = &top[j].memory;
                if !within_reinforcement_window(a.last_accessed, b.last_accessed) {
                    continue;
                }
                let existing = self
                    .storage
                    .links_for(&a.id)?
                    .into_iter()
                    .find(|l| (l.source_id == b.id || l.target_id == b.id) && l.relationship == Relationship::Related);

                match existing {
                    Some(link) => {
                        let new_strength = links::saturating_add(link.strength, links::REINFORCEMENT_STEP);
                        self.storage.reinforce_link(&a.id, &b.id, Relationship::Related, new_strength)?;
                    }
                    None => {
                        self.storage.insert_link(
                            &a.id,
                            &b.id,
                            Relationship::Related,
                            links::COACCESS_LINK_STRENGTH,
                            now,
                        )?;
                    }
                }
            }
        }

        if let Some(first) = results.first() {
            let new_tokens = similarity::tokenize(query_text)
                .difference(&similarity::tokenize(&first.memory.content))
                .count();
            if new_tokens >= ENRICHMENT_TOKEN_THRESHOLD {
                let enriched = format!("{}\n\n[related query] {}", first.memory.content, query_text);
                let (bounded, _) = Memory::enforce_content_limit(&enriched);
                self.storage.update_content(&first.memory.id, &first.memory.title, &bounded)?;
            }
        }

        Ok(())
    }

    /// Reinforcement for a single explicit access, outside of search.
    pub fn access_memory(&self, id: &str) -> Result<Memory> {
        let memory = self
            .storage
            .get_memory(id)?
            .ok_or_else(|| CortexError::MemoryNotFound(id.to_string()))?;

        let now = Utc::now();
        self.storage.update_memory_access(id, now)?;
        let boost = 0.05 / (1.0 + memory.access_count as f64);
        let new_salience = (memory.salience + boost).min(1.0);
        self.storage.update_salience(id, new_salience)?;
        let refreshed = Memory {
            salience: new_salience,
            last_accessed: now,
            access_count: memory.access_count + 1,
            ..memory
        };
        self.storage
            .update_decayed_score(id, decay::decayed_score(&refreshed, now))?;
        Ok(refreshed)
    }

    /// Delete memories matching `filter`. Previews the count first; if it
    /// exceeds the configured bulk-delete threshold, requires `confirm`.
    pub fn forget(&self, filter: ForgetFilter) -> Result<ForgetResult> {
        let now = Utc::now();
        let all = self.storage.list_memories(None)?;

        let matches: Vec<Memory> = all
            .into_iter()
            .filter(|m| {
                if let Some(ids) = &filter.ids {
                    if !ids.contains(&m.id) {
                        return false;
                    }
                }
                if let Some(cat) = filter.category {
                    if m.category != cat {
                        return false;
                    }
                }
                if let Some(days) = filter.older_than_days {
                    let age_days = (now - m.created_at).num_days();
                    if age_days < days {
                        return false;
                    }
                }
                true
            })
            .collect();

        if filter.dry_run {
            return Ok(ForgetResult {
                deleted: 0,
                preview: Some(matches.iter().map(|m| m.id.clone()).collect()),
            });
        }

        if matches.len() >= self.config.bulk_delete_threshold && !filter.confirm {
            return Err(CortexError::BulkDeleteBlocked { count: matches.len() });
        }

        let ids: Vec<String> = matches.iter().map(|m| m.id.clone()).collect();
        let deleted = self.storage.delete_memories(&ids)?;
        Ok(ForgetResult { deleted, preview: None })
    }

    pub fn get_related(&self, id: &str) -> Result<BTreeMap<Relationship, Vec<(String, f64)>>> {
        if self.storage.get_memory(id)?.is_none() {
            return Err(CortexError::MemoryNotFound(id.to_string()));
        }
        let links = self.storage.links_for(id)?;
        let mut grouped: BTreeMap<Relationship, Vec<(String, f64)>> = BTreeMap::new();
        for link in links {
            let other = if link.source_id == id { link.target_id } else { link.source_id };
            grouped.entry(link.relationship).or_default().push((other, link.strength));
        }
        for neighbors in grouped.values_mut() {
            neighbors.sort_by(|a, b| b.1.total_cmp(&a.1));
        }
        Ok(grouped)
    }

    /// Create or strengthen an edge between two existing, distinct memories.
    pub fn link_memories(
        &self,
        source_id: &str,
        target_id: &str,
        relationship: Relationship,
        strength: f64,
    ) -> Result<MemoryLink> {
        if source_id == target_id {
            return Err(CortexError::InvalidRelationship("source and target must differ".into()));
        }
        if self.storage.get_memory(source_id)?.is_none() {
            return Err(CortexError::InvalidRelationship(format!("unknown source memory {source_id}")));
        }
        if self.storage.get_memory(target_id)?.is_none() {
            return Err(CortexError::InvalidRelationship(format!("unknown target memory {target_id}")));
        }

        let now = Utc::now();
        self.storage.insert_link(source_id, target_id, relationship, strength.clamp(0.0, 1.0), now)?;
        Ok(MemoryLink {
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            relationship,
            strength: strength.clamp(0.0, 1.0),
            created_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Storage::open(Some(dir.path().join("memories.db"))).unwrap();
        (Store::new(storage, EngineConfig::default()), dir)
    }

    #[test]
    fn add_memory_truncates_oversized_content() {
        let (store, _dir) = test_store();
        let oversized = "x".repeat(20 * 1024);
        let memory = store
            .add_memory(IngestInput {
                title: "big".into(),
                content: oversized,
                ..Default::default()
            })
            .unwrap();
        assert!(memory.content.ends_with("[truncated]"));
    }

    #[test]
    fn add_memory_rejects_oversized_content_in_strict_mode() {
        let (store, _dir) = test_store();
        let oversized = "x".repeat(20 * 1024);
        let result = store.add_memory(IngestInput {
            title: "big".into(),
            content: oversized,
            strict: true,
            ..Default::default()
        });
        assert!(matches!(result, Err(CortexError::ContentTooLarge(n)) if n == 20 * 1024));
    }

    #[test]
    fn add_memory_auto_links_similar_content() {
        let (store, _dir) = test_store();
        let first = store
            .add_memory(IngestInput {
                title: "decision one".into(),
                content: "we chose postgres for strong ACID transactional guarantees".into(),
                project: Some("proj".into()),
                ..Default::default()
            })
            .unwrap();
        let second = store
            .add_memory(IngestInput {
                title: "decision two".into(),
                content: "postgres gives us strong ACID transactional guarantees too".into(),
                project: Some("proj".into()),
                ..Default::default()
            })
            .unwrap();

        let related = store.get_related(&second.id).unwrap();
        let all_neighbors: Vec<&String> = related.values().flatten().map(|(id, _)| id).collect();
        assert!(all_neighbors.contains(&&first.id));
    }

    #[test]
    fn search_finds_inserted_memory_by_keyword() {
        let (store, _dir) = test_store();
        store
            .add_memory(IngestInput {
                title: "t".into(),
                content: "the api rate limiter uses a token bucket".into(),
                project: Some("proj".into()),
                ..Default::default()
            })
            .unwrap();

        let results = store
            .search(SearchQuery {
                query: Some("token bucket".into()),
                project: "proj".into(),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].relevance > 0.0);
    }

    #[test]
    fn search_excludes_decayed_memories_by_default() {
        let (store, _dir) = test_store();
        let memory = store
            .add_memory(IngestInput {
                title: "t".into(),
                content: "ordinary note about lunch".into(),
                project: Some("proj".into()),
                category: Some(Category::Note),
                salience_override: Some(0.01),
                ..Default::default()
            })
            .unwrap();
        store.storage.update_decayed_score(&memory.id, 0.01).unwrap();

        let results = store
            .search(SearchQuery {
                query: None,
                project: "proj".into(),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn empty_query_orders_by_decayed_score_descending() {
        let (store, _dir) = test_store();
        let low = store
            .add_memory(IngestInput {
                title: "low decay".into(),
                content: "a note with plenty of links and tags but low decayed score".into(),
                project: Some("proj".into()),
                category: Some(Category::Note),
                salience_override: Some(0.9),
                ..Default::default()
            })
            .unwrap();
        let high = store
            .add_memory(IngestInput {
                title: "high decay".into(),
                content: "a sparse note with the highest decayed score".into(),
                project: Some("proj".into()),
                category: Some(Category::Note),
                salience_override: Some(0.5),
                ..Default::default()
            })
            .unwrap();
        // Force `low`'s decayed_score well below `high`'s even though its
        // salience (and thus its blended relevance) would otherwise win.
        store.storage.update_decayed_score(&low.id, 0.2).unwrap();
        store.storage.update_decayed_score(&high.id, 0.45).unwrap();

        let results = store
            .search(SearchQuery {
                query: None,
                project: "proj".into(),
                limit: 10,
                include_decayed: true,
                ..Default::default()
            })
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].memory.id, high.id);
        assert_eq!(results[1].memory.id, low.id);
        assert!(results[0].relevance > results[1].relevance);
    }

    #[test]
    fn access_memory_increments_count_and_boosts_salience() {
        let (store, _dir) = test_store();
        let memory = store
            .add_memory(IngestInput {
                title: "t".into(),
                content: "some content".into(),
                salience_override: Some(0.5),
                ..Default::default()
            })
            .unwrap();
        let accessed = store.access_memory(&memory.id).unwrap();
        assert_eq!(accessed.access_count, 1);
        assert!(accessed.salience > 0.5);
    }

    #[test]
    fn forget_requires_confirm_above_threshold() {
        let (store, _dir) = test_store();
        for i in 0..60 {
            store
                .add_memory(IngestInput {
                    title: format!("note {i}"),
                    content: format!("disposable note number {i}"),
                    category: Some(Category::Note),
                    ..Default::default()
                })
                .unwrap();
        }

        let result = store.forget(ForgetFilter {
            category: Some(Category::Note),
            ..Default::default()
        });
        assert!(matches!(result, Err(CortexError::BulkDeleteBlocked { count }) if count >= 50));

        let confirmed = store
            .forget(ForgetFilter {
                category: Some(Category::Note),
                confirm: true,
                ..Default::default()
            })
            .unwrap();
        assert!(confirmed.deleted >= 50);
    }

    #[test]
    fn link_memories_rejects_self_link() {
        let (store, _dir) = test_store();
        let memory = store
            .add_memory(IngestInput { title: "t".into(), content: "c".into(), ..Default::default() })
            .unwrap();
        let result = store.link_memories(&memory.id, &memory.id, Relationship::Related, 0.5);
        assert!(matches!(result, Err(CortexError::InvalidRelationship(_))));
    }

    #[test]
    fn link_memories_rejects_missing_endpoint() {
        let (store, _dir) = test_store();
        let memory = store
            .add_memory(IngestInput { title: "t".into(), content: "c".into(), ..Default::default() })
            .unwrap();
        let result = store.link_memories(&memory.id, "does-not-exist", Relationship::Extends, 0.5);
        assert!(matches!(result, Err(CortexError::InvalidRelationship(_))));
    }
}
