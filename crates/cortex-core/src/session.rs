//! Sessions: a bounded work period scoped to a project.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bounded work period, used to scope `start_session`/`end_session` stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub memories_created: i64,
    pub memories_accessed: i64,
}

impl Session {
    pub fn new(id: String, project: String, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            project,
            started_at,
            ended_at: None,
            summary: None,
            memories_created: 0,
            memories_accessed: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}
