//! The consolidation pass: recompute decay, promote, prune, enforce capacity,
//! merge near-duplicate short-term memories, and let well-connected memories
//! accrue a small salience bonus. Everything lands in storage through one
//! atomic batch so a crash mid-pass leaves no partial state observable.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::deadline::Deadline;
use crate::decay;
use crate::error::Result;
use crate::memory::{Category, Memory, MemoryType};
use crate::similarity;
use crate::storage::{ConsolidationMutation, Storage};
use crate::store::Store;

/// Metadata key a pass's completion timestamp is recorded under.
pub const LAST_RUN_METADATA_KEY: &str = "last_consolidation_at";

/// Minimum gap between automatic passes; manual invocation bypasses this.
pub const MIN_AUTO_INTERVAL_SECS: i64 = 60 * 60;

/// Whether enough time has passed since the last recorded run for an
/// automatic consolidation pass to be worth doing.
pub fn due_for_automatic_run(storage: &Storage, now: DateTime<Utc>) -> Result<bool> {
    match storage.get_metadata(LAST_RUN_METADATA_KEY)? {
        None => Ok(true),
        Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
            Ok(last) => Ok((now - last.with_timezone(&Utc)).num_seconds() >= MIN_AUTO_INTERVAL_SECS),
            Err(_) => Ok(true),
        },
    }
}

/// Result of a consolidation pass (or a preview of one).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationSummary {
    /// Memories promoted from short-term to long-term.
    pub consolidated: usize,
    /// Memories whose decayed score was recomputed and persisted.
    pub decayed: usize,
    /// Memories removed (threshold pruning, capacity enforcement, and merge losers).
    pub deleted: usize,
    /// Memories that received a salience bump for being well-linked.
    pub salience_evolved: usize,
    /// Memories absorbed into another during the merge step.
    pub merged: usize,
    pub duration_ms: u64,
    pub preview: bool,
    /// Present only for preview passes: ids that would be promoted or deleted.
    pub preview_ids: Option<Vec<String>>,
}

/// Accumulates counters across the pipeline the way a long pipeline accrues
/// state in a tracker rather than threading return values through every step.
struct ConsolidationRun {
    start: Instant,
    consolidated: usize,
    decayed: usize,
    deleted: usize,
    salience_evolved: usize,
    merged: usize,
}

impl ConsolidationRun {
    fn start() -> Self {
        Self { start: Instant::now(), consolidated: 0, decayed: 0, deleted: 0, salience_evolved: 0, merged: 0 }
    }

    fn finish(self, preview: bool, preview_ids: Option<Vec<String>>) -> ConsolidationSummary {
        ConsolidationSummary {
            consolidated: self.consolidated,
            decayed: self.decayed,
            deleted: self.deleted,
            salience_evolved: self.salience_evolved,
            merged: self.merged,
            duration_ms: self.start.elapsed().as_millis() as u64,
            preview,
            preview_ids,
        }
    }
}

/// Run (or preview) a full consolidation pass.
///
/// `preview` stops after capacity enforcement (steps 1-4) and returns the set
/// of ids that would be promoted or deleted, without mutating storage.
pub fn run(store: &Store, now: DateTime<Utc>, preview: bool) -> Result<ConsolidationSummary> {
    run_with_deadline(store, now, preview, None)
}

/// As [`run`], but stops starting new major phases (merge, evolve) once
/// `deadline` has passed, persisting whatever phases already completed
/// instead of running the full pipeline. Phases that never start are simply
/// absent from the mutation batch committed at the end, so a pass that runs
/// out of time still leaves the store in a fully consistent state — it is
/// just a smaller step than a full pass would have taken.
pub fn run_with_deadline(
    store: &Store,
    now: DateTime<Utc>,
    preview: bool,
    deadline: Option<Deadline>,
) -> Result<ConsolidationSummary> {
    let expired = |d: &Option<Deadline>| d.as_ref().is_some_and(Deadline::is_expired);
    let storage = store.storage();
    let config = store.config();
    let mut run = ConsolidationRun::start();

    // Step 1: recompute decayed scores in-memory; `working` tracks every
    // field change through the rest of the pipeline before anything is
    // persisted back.
    let mut working: BTreeMap<String, Memory> = storage
        .list_memories(config.project.as_deref())?
        .into_iter()
        .map(|mut m| {
            m.decayed_score = decay::decayed_score(&m, now);
            (m.id.clone(), m)
        })
        .collect();

    // Step 2: promote.
    let mut promoted: BTreeSet<String> = BTreeSet::new();
    for memory in working.values() {
        if decay::promotion_eligible(memory, now, config.promotion_min_age_hours) {
            promoted.insert(memory.id.clone());
        }
    }
    for id in &promoted {
        if let Some(memory) = working.get_mut(id) {
            memory.memory_type = MemoryType::LongTerm;
        }
    }
    run.consolidated = promoted.len();

    // Step 3: delete decayed, except anything just promoted.
    let mut deleted: BTreeSet<String> = working
        .values()
        .filter(|m| !promoted.contains(&m.id) && decay::deletion_eligible(m, now))
        .map(|m| m.id.clone())
        .collect();

    // Step 4: enforce capacity.
    enforce_capacity(&working, &deleted, MemoryType::ShortTerm, config.max_short_term, &mut deleted);
    enforce_capacity(&working, &deleted, MemoryType::LongTerm, config.max_long_term, &mut deleted);
    run.deleted = deleted.len();

    if preview {
        let mut preview_ids: Vec<String> = promoted.iter().chain(deleted.iter()).cloned().collect();
        preview_ids.sort();
        preview_ids.dedup();
        return Ok(run.finish(true, Some(preview_ids)));
    }

    // Step 5: merge similar short-term memories within each (project, category) group.
    // `merges` maps each absorbed id to the surviving id it was folded into.
    let merges = if expired(&deadline) {
        BTreeMap::new()
    } else {
        merge_similar(&mut working, &promoted, &mut deleted, config.merge_similarity_threshold, &mut run)
    };

    // Step 6: evolve salience for well-linked survivors.
    let evolved = if expired(&deadline) {
        BTreeSet::new()
    } else {
        evolve_salience(storage, &mut working, &deleted, &mut run)?
    };

    // Step 7: persist decayed scores for everything that survives, using
    // whatever salience/content each memory ended up with after merge/evolve.
    // Open question #2: merged-away ids have their incident `memory_links` rows
    // rewritten onto the survivor inside this same transaction, rather than left
    // as dangling edges.
    let mut mutations = Vec::new();
    for id in &promoted {
        mutations.push(ConsolidationMutation::Promote { id: id.clone() });
    }
    let survivors: BTreeSet<&String> = merges.values().collect();
    for survivor_id in &survivors {
        let memory = &working[*survivor_id];
        mutations.push(ConsolidationMutation::MergeContent {
            survivor_id: (*survivor_id).clone(),
            new_content: memory.content.clone(),
            new_tags_json: serde_json::to_string(&memory.tags).unwrap_or_else(|_| "[]".to_string()),
            new_access_count: memory.access_count,
            new_salience: memory.salience,
        });
    }
    for (absorbed_id, survivor_id) in &merges {
        mutations.push(ConsolidationMutation::RewriteLinks { old_id: absorbed_id.clone(), new_id: survivor_id.clone() });
    }
    for id in &evolved {
        if survivors.contains(id) {
            continue;
        }
        mutations.push(ConsolidationMutation::UpdateSalience { id: id.clone(), salience: working[id].salience });
    }
    for (id, memory) in working.iter() {
        if deleted.contains(id) {
            continue;
        }
        let score = decay::decayed_score(memory, now);
        mutations.push(ConsolidationMutation::UpdateDecayedScore { id: id.clone(), score });
        run.decayed += 1;
    }
    for id in &deleted {
        mutations.push(ConsolidationMutation::Delete { id: id.clone() });
    }

    storage.apply_consolidation_mutations(&mutations)?;

    // Step 8: vacuum outside the transaction if anything was removed.
    if !deleted.is_empty() {
        storage.vacuum()?;
    }

    storage.set_metadata(LAST_RUN_METADATA_KEY, &now.to_rfc3339())?;

    Ok(run.finish(false, None))
}

/// Trim the lowest-ranked members of `memory_type` down to `limit`, ranking
/// by ascending `(salience, access_count, last_accessed)` (access_count is
/// ignored for short-term).
fn enforce_capacity(
    working: &BTreeMap<String, Memory>,
    already_deleted: &BTreeSet<String>,
    memory_type: MemoryType,
    limit: usize,
    deleted: &mut BTreeSet<String>,
) {
    let mut pool: Vec<&Memory> = working
        .values()
        .filter(|m| m.memory_type == memory_type && !already_deleted.contains(&m.id) && !deleted.contains(&m.id))
        .collect();
    if pool.len() <= limit {
        return;
    }
    match memory_type {
        MemoryType::ShortTerm => {
            pool.sort_by(|a, b| a.salience.total_cmp(&b.salience).then(a.last_accessed.cmp(&b.last_accessed)));
        }
        _ => {
            pool.sort_by(|a, b| {
                a.salience
                    .total_cmp(&b.salience)
                    .then(a.access_count.cmp(&b.access_count))
                    .then(a.last_accessed.cmp(&b.last_accessed))
            });
        }
    }
    let excess = pool.len() - limit;
    for memory in pool.into_iter().take(excess) {
        deleted.insert(memory.id.clone());
    }
}

/// Greedily cluster short-term memories within each `(project, category)`
/// group by combined title/content Jaccard similarity, merging each cluster
/// into its highest-salience member.
fn merge_similar(
    working: &mut BTreeMap<String, Memory>,
    promoted: &BTreeSet<String>,
    deleted: &mut BTreeSet<String>,
    threshold: f64,
    run: &mut ConsolidationRun,
) -> BTreeMap<String, String> {
    let mut merges: BTreeMap<String, String> = BTreeMap::new();
    let mut groups: BTreeMap<(String, Category), Vec<String>> = BTreeMap::new();
    for memory in working.values() {
        if memory.memory_type != MemoryType::ShortTerm {
            continue;
        }
        if promoted.contains(&memory.id) || deleted.contains(&memory.id) {
            continue;
        }
        groups.entry((memory.project.clone(), memory.category)).or_default().push(memory.id.clone());
    }

    for ids in groups.into_values() {
        if ids.len() < 2 {
            continue;
        }

        let content_tokens: BTreeMap<&str, BTreeSet<String>> =
            ids.iter().map(|id| (id.as_str(), similarity::tokenize(&working[id].content))).collect();
        let title_tokens: BTreeMap<&str, BTreeSet<String>> =
            ids.iter().map(|id| (id.as_str(), similarity::tokenize(&working[id].title))).collect();

        let mut clustered = vec![false; ids.len()];
        for i in 0..ids.len() {
            if clustered[i] {
                continue;
            }
            let mut cluster = vec![i];
            clustered[i] = true;
            for j in (i + 1)..ids.len() {
                if clustered[j] {
                    continue;
                }
                let content_sim = similarity::jaccard_sets(&content_tokens[ids[i].as_str()], &content_tokens[ids[j].as_str()]);
                let title_sim = similarity::jaccard_sets(&title_tokens[ids[i].as_str()], &title_tokens[ids[j].as_str()]);
                let combined = 0.6 * content_sim + 0.4 * title_sim;
                if combined >= threshold {
                    cluster.push(j);
                    clustered[j] = true;
                }
            }
            if cluster.len() < 2 {
                continue;
            }

            let cluster_ids: Vec<&String> = cluster.iter().map(|&idx| &ids[idx]).collect();
            let survivor_id = cluster_ids
                .iter()
                .max_by(|a, b| working[**a].salience.total_cmp(&working[**b].salience))
                .unwrap()
                .to_string();

            let others: Vec<String> =
                cluster_ids.into_iter().filter(|id| **id != survivor_id).cloned().collect();

            let mut new_content = working[&survivor_id].content.clone();
            let mut new_tags = working[&survivor_id].tags.clone();
            let mut new_access_count = working[&survivor_id].access_count;
            new_content.push_str("\n\nConsolidated context:");
            for other_id in &others {
                let other = &working[other_id];
                new_content.push_str(&format!("\n- {}", summarize(&other.content)));
                new_tags.extend(other.tags.iter().cloned());
                new_access_count += other.access_count;
            }
            let (bounded_content, _) = Memory::enforce_content_limit(&new_content);
            let new_salience = (working[&survivor_id].salience + 0.1).clamp(0.0, 1.0);

            if let Some(survivor) = working.get_mut(&survivor_id) {
                survivor.content = bounded_content;
                survivor.tags = new_tags;
                survivor.access_count = new_access_count;
                survivor.salience = new_salience;
            }
            for other_id in &others {
                deleted.insert(other_id.clone());
                merges.insert(other_id.clone(), survivor_id.clone());
            }
            run.merged += others.len();
        }
    }
    merges
}

/// Bullet-point summary of an absorbed memory's content: its first line,
/// bounded so a run of merges can't blow up the survivor's content length.
fn summarize(content: &str) -> String {
    let first_line = content.lines().next().unwrap_or(content);
    if first_line.len() > 200 {
        format!("{}...", &first_line[..200])
    } else {
        first_line.to_string()
    }
}

/// Add `min(0.1, 0.03 * log2(link_count))` to the salience of any surviving
/// memory with at least two links.
fn evolve_salience(
    storage: &Storage,
    working: &mut BTreeMap<String, Memory>,
    deleted: &BTreeSet<String>,
    run: &mut ConsolidationRun,
) -> Result<BTreeSet<String>> {
    let mut evolved = BTreeSet::new();
    let ids: Vec<String> = working.keys().filter(|id| !deleted.contains(*id)).cloned().collect();
    for id in ids {
        let link_count = storage.links_for(&id)?.len();
        if link_count < 2 {
            continue;
        }
        let bonus = (0.03 * (link_count as f64).log2()).min(0.1);
        if let Some(memory) = working.get_mut(&id) {
            memory.salience = (memory.salience + bonus).clamp(0.0, 1.0);
        }
        evolved.insert(id);
        run.salience_evolved += 1;
    }
    Ok(evolved)
}
