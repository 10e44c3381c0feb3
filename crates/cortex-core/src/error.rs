//! Error taxonomy for the memory engine.
//!
//! Mirrors the stable error codes a host tool server surfaces to callers.
//! Recoverable errors carry enough detail for the host to suggest a retry or
//! a corrective action; unexpected errors are flattened to a generic message
//! but keep their original text available via `Display` for diagnostics.

use thiserror::Error;

/// Engine result type.
pub type Result<T> = std::result::Result<T, CortexError>;

/// Stable error taxonomy surfaced to callers of the engine.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CortexError {
    /// Storage layer was never initialized.
    #[error("storage not initialized")]
    DbNotInit,

    /// Database file exceeds the 100 MiB hard limit.
    #[error("database blocked: file exceeds size limit, run consolidate or forget")]
    DbBlocked,

    /// Database file exceeds the 50 MiB soft limit (informational only).
    #[error("database size warning: file is over 50 MiB")]
    DbSizeWarning,

    /// Transient lock contention; the caller should retry.
    #[error("database busy, retry the operation")]
    DbBusy,

    /// Another writer currently holds the advisory lock.
    #[error("database locked by another process")]
    DbLocked,

    /// The database file or FTS index is corrupt.
    #[error("database corrupt, restore from backup: {0}")]
    DbCorrupt(String),

    /// No memory exists with the given id.
    #[error("memory not found: {0}")]
    MemoryNotFound(String),

    /// The search query could not be parsed or sanitized.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Content exceeds the 10 KiB hard limit in strict mode.
    #[error("content too large: {0} bytes exceeds the 10 KiB limit")]
    ContentTooLarge(usize),

    /// A bulk delete would exceed the safety threshold without explicit confirmation.
    #[error("bulk delete blocked: {count} memories match, pass confirm=true to proceed")]
    BulkDeleteBlocked {
        /// Number of memories that would be deleted.
        count: usize,
    },

    /// No session exists with the given id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A link request was self-referential, pointed at a missing memory, or
    /// named an unknown relationship.
    #[error("invalid relationship: {0}")]
    InvalidRelationship(String),

    /// Underlying SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error (lock file, database path resolution, vacuum).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else; original text is preserved for diagnostics but callers
    /// should treat this as opaque and non-actionable.
    #[error("internal error")]
    Internal(String),
}

impl CortexError {
    /// Whether a caller can reasonably retry or correct and resubmit.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CortexError::DbNotInit | CortexError::DbCorrupt(_) | CortexError::Internal(_)
        )
    }

    /// Stable machine-readable code, matching the engine's external error taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            CortexError::DbNotInit => "DB_NOT_INIT",
            CortexError::DbBlocked => "DB_BLOCKED",
            CortexError::DbSizeWarning => "DB_SIZE_WARNING",
            CortexError::DbBusy => "DB_BUSY",
            CortexError::DbLocked => "DB_LOCKED",
            CortexError::DbCorrupt(_) => "DB_CORRUPT",
            CortexError::MemoryNotFound(_) => "MEMORY_NOT_FOUND",
            CortexError::InvalidQuery(_) => "INVALID_QUERY",
            CortexError::ContentTooLarge(_) => "CONTENT_TOO_LARGE",
            CortexError::BulkDeleteBlocked { .. } => "BULK_DELETE_BLOCKED",
            CortexError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            CortexError::InvalidRelationship(_) => "INVALID_RELATIONSHIP",
            CortexError::Database(_) => "DB_BUSY",
            CortexError::Io(_) => "DB_NOT_INIT",
            CortexError::Internal(_) => "INTERNAL",
        }
    }
}
