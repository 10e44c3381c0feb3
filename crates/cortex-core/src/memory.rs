//! Core data model: the Memory entity and its lifecycle/classification types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// The global project sentinel: memories scoped here are visible cross-project.
pub const GLOBAL_PROJECT: &str = "*";

/// Hard content limit, bytes. Oversized input is truncated with a marker.
pub const MAX_CONTENT_BYTES: usize = 10 * 1024;

/// Suffix appended to content truncated at [`MAX_CONTENT_BYTES`].
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Lifecycle class of a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Recent entry subject to aggressive decay; working context.
    #[default]
    ShortTerm,
    /// Consolidated entry with slower decay and higher deletion resistance.
    LongTerm,
    /// Time-anchored entry (e.g. a session marker); uses the long-term curve.
    Episodic,
}

impl MemoryType {
    /// Stable string form, as stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::ShortTerm => "short_term",
            MemoryType::LongTerm => "long_term",
            MemoryType::Episodic => "episodic",
        }
    }

    /// Parse from the stored string form; unrecognized values fall back to `short_term`.
    pub fn parse_str(s: &str) -> Self {
        match s {
            "long_term" => MemoryType::LongTerm,
            "episodic" => MemoryType::Episodic,
            _ => MemoryType::ShortTerm,
        }
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification used for deletion-threshold selection and search filtering.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Architecture,
    Pattern,
    Preference,
    Error,
    Context,
    Learning,
    Todo,
    #[default]
    Note,
    Relationship,
    Custom,
}

impl Category {
    /// Stable string form, as stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Architecture => "architecture",
            Category::Pattern => "pattern",
            Category::Preference => "preference",
            Category::Error => "error",
            Category::Context => "context",
            Category::Learning => "learning",
            Category::Todo => "todo",
            Category::Note => "note",
            Category::Relationship => "relationship",
            Category::Custom => "custom",
        }
    }

    /// Parse from the stored string form; unrecognized values fall back to `note`.
    pub fn parse_str(s: &str) -> Self {
        match s {
            "architecture" => Category::Architecture,
            "pattern" => Category::Pattern,
            "preference" => Category::Preference,
            "error" => Category::Error,
            "context" => Category::Context,
            "learning" => Category::Learning,
            "todo" => Category::Todo,
            "relationship" => Category::Relationship,
            "custom" => Category::Custom,
            _ => Category::Note,
        }
    }

    /// Decayed-score threshold below which a memory of this category is
    /// eligible for deletion during consolidation. Architectural decisions
    /// resist deletion longest; notes and todos are pruned most readily.
    pub fn deletion_threshold(&self) -> f64 {
        match self {
            Category::Architecture => 0.15,
            Category::Pattern | Category::Preference => 0.20,
            Category::Error
            | Category::Learning
            | Category::Context
            | Category::Relationship
            | Category::Custom => 0.22,
            Category::Note | Category::Todo => 0.25,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a memory is visible only within its project or cross-project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[default]
    Project,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Project => "project",
            Scope::Global => "global",
        }
    }

    pub fn parse_str(s: &str) -> Self {
        match s {
            "global" => Scope::Global,
            _ => Scope::Project,
        }
    }
}

/// The primary unit of the engine: a single stored memory.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    /// Opaque stable identifier, assigned on insert and never reused.
    pub id: String,
    pub memory_type: MemoryType,
    pub category: Category,
    pub title: String,
    pub content: String,
    /// Scoping key; either a concrete project name or [`GLOBAL_PROJECT`].
    pub project: String,
    pub scope: Scope,
    pub transferable: bool,
    pub tags: BTreeSet<String>,
    /// Base importance in `[0.0, 1.0]`.
    pub salience: f64,
    /// Current effective score; recomputed on the fly, persisted during consolidation.
    pub decayed_score: f64,
    pub access_count: i64,
    pub last_accessed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Free-form metadata bag, stored as JSON and parsed defensively.
    pub metadata: serde_json::Value,
}

impl Memory {
    /// Hours elapsed since this memory was last accessed.
    pub fn hours_since_access(&self, now: DateTime<Utc>) -> f64 {
        (now - self.last_accessed).num_seconds() as f64 / 3600.0
    }

    /// Truncate `content` to [`MAX_CONTENT_BYTES`], appending [`TRUNCATION_MARKER`]
    /// when the input was over the limit. Returns the (possibly unchanged) content
    /// and whether truncation occurred.
    pub fn enforce_content_limit(content: &str) -> (String, bool) {
        if content.len() <= MAX_CONTENT_BYTES {
            return (content.to_string(), false);
        }
        let marker_len = TRUNCATION_MARKER.len();
        let budget = MAX_CONTENT_BYTES.saturating_sub(marker_len);
        let mut cut = budget.min(content.len());
        while cut > 0 && !content.is_char_boundary(cut) {
            cut -= 1;
        }
        let mut truncated = content[..cut].to_string();
        truncated.push_str(TRUNCATION_MARKER);
        (truncated, true)
    }
}

/// Input for inserting a new memory via `Store::add_memory`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestInput {
    pub title: String,
    pub content: String,
    pub category: Option<Category>,
    pub tags: BTreeSet<String>,
    /// `high` / `medium` / `low`; overrides the computed salience floor/ceiling.
    pub importance: Option<String>,
    pub memory_type: Option<MemoryType>,
    pub project: Option<String>,
    pub scope: Option<Scope>,
    #[serde(default)]
    pub transferable: bool,
    /// If set, skip computed salience and use this value directly.
    pub salience_override: Option<f64>,
    /// When `true`, content over [`MAX_CONTENT_BYTES`] is rejected with
    /// `ContentTooLarge` instead of silently truncated.
    #[serde(default)]
    pub strict: bool,
}
