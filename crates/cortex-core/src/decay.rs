//! Decay math, promotion eligibility, and salience scoring of new input.
//!
//! All functions here are pure and take `now`/config explicitly rather than
//! reaching for the clock, so consolidation can run deterministically in
//! tests against a fixed instant.

use crate::links::REINFORCEMENT_WINDOW_MINUTES;
use crate::memory::{Category, Memory, MemoryType};
use crate::similarity::extract_key_phrases;
use chrono::{DateTime, Utc};

/// Per-hour multiplicative decay for short-term memories.
pub const BASE_DECAY_RATE: f64 = 0.995;

/// How much `log2(1 + access_count)` is scaled by before being capped at 0.3.
/// Chosen so the 30% attenuation ceiling saturates around 7 accesses
/// (`log2(8) * 0.1 == 0.3`).
const ACCESS_SLOWDOWN_K: f64 = 0.1;

/// Maximum attenuation of decay contributed by repeated access.
const ACCESS_SLOWDOWN_CAP: f64 = 0.3;

/// Salience at or above which a short-term memory becomes eligible for
/// promotion to long-term (given at least one access, or sufficient age).
pub const PROMOTION_SALIENCE_THRESHOLD: f64 = 0.6;

/// `1 + min(0.3, log2(1 + access_count) * k)`.
pub fn access_slowdown(access_count: i64) -> f64 {
    let n = access_count.max(0) as f64;
    1.0 + ((1.0 + n).log2() * ACCESS_SLOWDOWN_K).min(ACCESS_SLOWDOWN_CAP)
}

/// Recompute `decayed_score` for a memory as of `now`.
///
/// Short-term memories decay per hour; long-term and episodic memories decay
/// at the same rate but per day (~24x slower for the same wall-clock gap).
pub fn decayed_score(memory: &Memory, now: DateTime<Utc>) -> f64 {
    let hours = memory.hours_since_access(now).max(0.0);
    let exponent = match memory.memory_type {
        MemoryType::ShortTerm => hours,
        MemoryType::LongTerm | MemoryType::Episodic => hours / 24.0,
    };
    let slowdown = access_slowdown(memory.access_count);
    // `slowdown` is >= 1.0 by construction (it only attenuates decay), so the
    // raw product can exceed `salience` for a freshly-accessed memory. Clamp
    // to `salience` so decayed_score never outgrows the base it decays from
    // (invariant: 0 <= decayed_score <= salience <= 1).
    (memory.salience * BASE_DECAY_RATE.powf(exponent) * slowdown).min(memory.salience)
}

/// Whether `memory` qualifies for promotion from short-term to long-term.
///
/// Eligible when salience clears the threshold and either it has been
/// accessed at least once, or its age exceeds `min_retention_hours` and its
/// current decayed score is still above the threshold.
pub fn promotion_eligible(memory: &Memory, now: DateTime<Utc>, min_retention_hours: f64) -> bool {
    if memory.memory_type != MemoryType::ShortTerm {
        return false;
    }
    if memory.salience < PROMOTION_SALIENCE_THRESHOLD {
        return false;
    }
    if memory.access_count > 0 {
        return true;
    }
    let age_hours = (now - memory.created_at).num_seconds() as f64 / 3600.0;
    age_hours >= min_retention_hours && decayed_score(memory, now) >= PROMOTION_SALIENCE_THRESHOLD
}

/// Whether a memory's decayed score has fallen below its category's deletion
/// threshold.
pub fn deletion_eligible(memory: &Memory, now: DateTime<Utc>) -> bool {
    decayed_score(memory, now) < memory.category.deletion_threshold()
}

/// Whether `a` and `b` were accessed within the Hebbian reinforcement window
/// of each other.
pub fn within_reinforcement_window(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    (a - b).num_minutes().abs() <= REINFORCEMENT_WINDOW_MINUTES
}

const EXPLICIT_REQUEST_PHRASES: &[&str] = &[
    "remember this",
    "important",
    "don't forget",
    "keep in mind",
    "make sure to remember",
];

const ARCHITECTURE_KEYWORDS: &[&str] = &[
    "architecture", "design decision", "we chose", "we decided", "pattern", "approach",
];

const ERROR_KEYWORDS: &[&str] = &[
    "bug", "error", "exception", "crash", "failed", "failure", "broken", "fix",
];

/// Score new input text (plus optional importance hint) into a salience value
/// in `[0.0, 1.0]`.
pub fn compute_salience(content: &str, importance: Option<&str>) -> f64 {
    let lower = content.to_lowercase();
    let mut score: f64 = 0.25;

    if EXPLICIT_REQUEST_PHRASES.iter().any(|p| lower.contains(p)) {
        score += 0.3;
        score = score.max(0.7);
    }
    if ARCHITECTURE_KEYWORDS.iter().any(|p| lower.contains(p)) {
        score += 0.15;
    }
    if ERROR_KEYWORDS.iter().any(|p| lower.contains(p)) {
        score += 0.15;
    }

    let phrases = extract_key_phrases(content);
    let identifier_bonus = (phrases.len() as f64 * 0.05).min(0.2);
    score += identifier_bonus;

    score = match importance {
        Some("high") => score.max(0.7),
        Some("low") => score.min(0.3),
        _ => score,
    };

    score.clamp(0.0, 1.0)
}

/// Suggest a category from deterministic pattern matches over the content.
pub fn suggest_category(content: &str) -> Category {
    let lower = content.to_lowercase();
    if ARCHITECTURE_KEYWORDS.iter().any(|p| lower.contains(p)) {
        return Category::Architecture;
    }
    if ERROR_KEYWORDS.iter().any(|p| lower.contains(p)) {
        return Category::Error;
    }
    if lower.contains("prefer") || lower.contains("always use") || lower.contains("never use") {
        return Category::Preference;
    }
    if lower.contains("todo") || lower.contains("fixme") || lower.starts_with("- [ ]") {
        return Category::Todo;
    }
    if lower.contains("learned") || lower.contains("turns out") || lower.contains("realized") {
        return Category::Learning;
    }
    if lower.contains("context:") || lower.contains("background:") {
        return Category::Context;
    }
    Category::Note
}

/// Extract a deduplicated, lowercased tag set from content's key phrases.
pub fn extract_tags(content: &str) -> std::collections::BTreeSet<String> {
    extract_key_phrases(content)
        .into_iter()
        .map(|p| p.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Scope, GLOBAL_PROJECT};
    use std::collections::BTreeSet;

    fn memory_at(
        memory_type: MemoryType,
        category: Category,
        salience: f64,
        access_count: i64,
        last_accessed: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Memory {
        Memory {
            id: "m1".to_string(),
            memory_type,
            category,
            title: "t".to_string(),
            content: "c".to_string(),
            project: GLOBAL_PROJECT.to_string(),
            scope: Scope::Project,
            transferable: false,
            tags: BTreeSet::new(),
            salience,
            decayed_score: salience,
            access_count,
            last_accessed,
            created_at,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn access_slowdown_saturates_at_cap() {
        assert_eq!(access_slowdown(0), 1.0);
        assert!(access_slowdown(1000) <= 1.0 + ACCESS_SLOWDOWN_CAP);
        assert!(access_slowdown(1000) > access_slowdown(1));
    }

    #[test]
    fn decayed_score_drops_with_elapsed_hours() {
        let now = Utc::now();
        let fresh = memory_at(MemoryType::ShortTerm, Category::Note, 0.8, 0, now, now);
        let stale = memory_at(
            MemoryType::ShortTerm,
            Category::Note,
            0.8,
            0,
            now - chrono::Duration::hours(100),
            now - chrono::Duration::hours(100),
        );
        assert!(decayed_score(&fresh, now) > decayed_score(&stale, now));
    }

    #[test]
    fn decayed_score_never_exceeds_salience() {
        let now = Utc::now();
        // Freshly accessed with a high access count: slowdown is near its
        // 1.3x ceiling and the elapsed-time exponent is ~0, so the raw
        // product would overshoot salience without the clamp.
        let memory = memory_at(MemoryType::ShortTerm, Category::Note, 0.8, 50, now, now);
        let score = decayed_score(&memory, now);
        assert!(score <= memory.salience);
        assert!((score - memory.salience).abs() < 1e-9);
    }

    #[test]
    fn long_term_decays_slower_than_short_term_for_same_gap() {
        let now = Utc::now();
        let then = now - chrono::Duration::hours(48);
        let short = memory_at(MemoryType::ShortTerm, Category::Note, 0.8, 0, then, then);
        let long = memory_at(MemoryType::LongTerm, Category::Note, 0.8, 0, then, then);
        assert!(decayed_score(&long, now) > decayed_score(&short, now));
    }

    #[test]
    fn promotion_requires_salience_and_access_or_age() {
        let now = Utc::now();
        let low_salience = memory_at(MemoryType::ShortTerm, Category::Note, 0.3, 5, now, now);
        assert!(!promotion_eligible(&low_salience, now, 24.0));

        let high_salience_accessed =
            memory_at(MemoryType::ShortTerm, Category::Note, 0.8, 1, now, now);
        assert!(promotion_eligible(&high_salience_accessed, now, 24.0));

        let high_salience_unaccessed_fresh =
            memory_at(MemoryType::ShortTerm, Category::Note, 0.8, 0, now, now);
        assert!(!promotion_eligible(&high_salience_unaccessed_fresh, now, 24.0));
    }

    #[test]
    fn deletion_eligible_respects_category_thresholds() {
        let now = Utc::now();
        let below_arch_threshold =
            memory_at(MemoryType::ShortTerm, Category::Architecture, 0.14, 0, now, now);
        assert!(deletion_eligible(&below_arch_threshold, now));

        let above_note_threshold =
            memory_at(MemoryType::ShortTerm, Category::Note, 0.9, 0, now, now);
        assert!(!deletion_eligible(&above_note_threshold, now));
    }

    #[test]
    fn salience_boosted_by_explicit_request_phrase() {
        let base = compute_salience("just a regular note about something", None);
        let explicit = compute_salience("Remember this: always regular note", None);
        assert!(explicit >= 0.7);
        assert!(explicit > base);
    }

    #[test]
    fn salience_importance_hint_sets_floor_or_ceiling() {
        let low = compute_salience("some ordinary content here", Some("low"));
        assert!(low <= 0.3);
        let high = compute_salience("some ordinary content here", Some("high"));
        assert!(high >= 0.7);
    }

    #[test]
    fn salience_is_always_clamped() {
        let s = compute_salience(
            "Remember this important architecture decision: we chose `Postgres` with \"ACID\" guarantees for bug-free error handling",
            Some("high"),
        );
        assert!((0.0..=1.0).contains(&s));
    }

    #[test]
    fn suggest_category_matches_keywords() {
        assert_eq!(suggest_category("We chose a layered architecture"), Category::Architecture);
        assert_eq!(suggest_category("This caused a crash in prod"), Category::Error);
        assert_eq!(suggest_category("I prefer tabs over spaces"), Category::Preference);
        assert_eq!(suggest_category("just some unrelated text"), Category::Note);
    }
}
