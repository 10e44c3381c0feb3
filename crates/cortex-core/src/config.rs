//! Engine configuration, loaded from `~/.claude-cortex/hooks.json`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::decay::{BASE_DECAY_RATE, PROMOTION_SALIENCE_THRESHOLD};
use crate::error::Result;

/// Default consolidation cadence: four hours.
pub const DEFAULT_CONSOLIDATION_INTERVAL_SECS: u64 = 4 * 60 * 60;

/// Tunable engine parameters. Every field has a sensible default and is
/// optional in the serialized file (`#[serde(default)]` everywhere rather
/// than a required schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub max_short_term: usize,
    pub max_long_term: usize,
    pub decay_rate: f64,
    pub salience_threshold: f64,
    pub consolidation_interval_secs: u64,
    pub project: Option<String>,
    /// Minimum age, in hours, an unaccessed short-term memory must reach
    /// before it can be promoted purely on decayed-score grounds.
    pub promotion_min_age_hours: f64,
    /// `forget` calls touching at least this many memories require
    /// `confirm: true`.
    pub bulk_delete_threshold: usize,
    /// Jaccard threshold below which two memories in the same merge group
    /// are considered unrelated.
    pub merge_similarity_threshold: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_short_term: 100,
            max_long_term: 1000,
            decay_rate: BASE_DECAY_RATE,
            salience_threshold: PROMOTION_SALIENCE_THRESHOLD,
            consolidation_interval_secs: DEFAULT_CONSOLIDATION_INTERVAL_SECS,
            project: None,
            promotion_min_age_hours: 24.0,
            bulk_delete_threshold: 50,
            merge_similarity_threshold: 0.25,
        }
    }
}

impl EngineConfig {
    /// Load from `path`, falling back to defaults field-by-field for
    /// anything absent or if the file itself doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| crate::error::CortexError::Internal(format!("invalid config at {}: {e}", path.display())))?;
        Ok(config)
    }

    /// Resolve the conventional config path (`~/.claude-cortex/hooks.json`),
    /// honoring the same legacy directory fallback as the database path.
    pub fn default_path() -> Option<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "claude-cortex")?;
        Some(dirs.data_dir().join("hooks.json"))
    }
}
