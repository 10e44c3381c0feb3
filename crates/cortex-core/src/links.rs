//! The link graph: typed, weighted directed edges between memories.
//!
//! Auto-linking happens on insert and on co-access (search top-5 or explicit
//! `accessMemory` calls within a short window). Strength is used for the link
//! boost in ranking and is only ever strengthened via Hebbian reinforcement,
//! never explicitly decayed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default Hebbian reinforcement window: co-accessed memories within this
/// many minutes of each other have their edge strengthened.
pub const REINFORCEMENT_WINDOW_MINUTES: i64 = 5;

/// Strength assigned to edges created purely from co-access (not content similarity).
pub const COACCESS_LINK_STRENGTH: f64 = 0.1;

/// Per-reinforcement strength increment, saturating at 1.0.
pub const REINFORCEMENT_STEP: f64 = 0.05;

/// The authoritative set of edge relationships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relationship {
    /// One memory cites another.
    References,
    /// One memory builds on another.
    Extends,
    /// One memory overrides/supersedes another.
    Contradicts,
    /// Default: a detected or reinforced association without stronger semantics.
    Related,
}

impl Relationship {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relationship::References => "references",
            Relationship::Extends => "extends",
            Relationship::Contradicts => "contradicts",
            Relationship::Related => "related",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "references" => Some(Relationship::References),
            "extends" => Some(Relationship::Extends),
            "contradicts" => Some(Relationship::Contradicts),
            "related" => Some(Relationship::Related),
            _ => None,
        }
    }
}

impl std::fmt::Display for Relationship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A directed edge between two memories.
///
/// At most one edge exists per ordered `(source_id, target_id, relationship)`
/// triple; `source_id != target_id` always holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryLink {
    pub source_id: String,
    pub target_id: String,
    pub relationship: Relationship,
    pub strength: f64,
    pub created_at: DateTime<Utc>,
}

/// Clamp a strength increment so it saturates at 1.0 without overshoot.
pub fn saturating_add(current: f64, delta: f64) -> f64 {
    (current + delta).clamp(0.0, 1.0)
}

/// The auto-link weight for a newly detected `related` edge from Jaccard
/// similarity: `0.2 + 0.5 * jaccard`, clamped to `[0.2, 0.9]`.
pub fn auto_link_strength(jaccard: f64) -> f64 {
    (0.2 + 0.5 * jaccard).clamp(0.2, 0.9)
}
