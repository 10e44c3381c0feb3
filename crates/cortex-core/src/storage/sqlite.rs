//! SQLite-backed persistence for memories, links, and sessions.
//!
//! Uses separate reader/writer connections guarded by independent mutexes so
//! `Storage` is `Send + Sync` and callable via `&self` — callers hold an
//! `Arc<Storage>` rather than an `Arc<Mutex<Storage>>`.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value as JsonValue;

use crate::error::{CortexError, Result};
use crate::links::{MemoryLink, Relationship};
use crate::memory::{Category, Memory, MemoryType, Scope};
use crate::session::Session;

/// Size above which mutating writes are rejected outright.
const HARD_SIZE_LIMIT_BYTES: u64 = 100 * 1024 * 1024;

/// Size above which a warning is logged but writes still proceed.
const SOFT_SIZE_LIMIT_BYTES: u64 = 50 * 1024 * 1024;

/// A single edit consolidation wants applied atomically alongside others.
///
/// Each variant is a direct, minimal SQL operation rather than a call back
/// into `Storage`'s own CRUD methods, since those each take `writer`
/// independently and would deadlock if invoked from inside an already-held
/// transaction.
#[derive(Debug, Clone)]
pub enum ConsolidationMutation {
    Promote { id: String },
    Delete { id: String },
    UpdateDecayedScore { id: String, score: f64 },
    UpdateSalience { id: String, salience: f64 },
    MergeContent {
        survivor_id: String,
        new_content: String,
        new_tags_json: String,
        new_access_count: i64,
        new_salience: f64,
    },
    RewriteLinks { old_id: String, new_id: String },
}

/// Resolve the database path: an explicit override, else the current data
/// directory, falling back transparently to a legacy directory if it exists
/// and the current one does not yet.
pub fn resolve_db_path(override_path: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = override_path {
        return Ok(path);
    }

    let current_dir = ProjectDirs::from("", "", "claude-cortex")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".claude-cortex"));

    if current_dir.join("memories.db").exists() {
        return Ok(current_dir.join("memories.db"));
    }

    let legacy_dir = dirs_home().map(|home| home.join(".claude-memory"));
    if let Some(legacy) = legacy_dir {
        if legacy.join("memories.db").exists() {
            tracing::info!(path = %legacy.display(), "using legacy memory directory");
            return Ok(legacy.join("memories.db"));
        }
    }

    std::fs::create_dir_all(&current_dir)?;
    Ok(current_dir.join("memories.db"))
}

fn dirs_home() -> Option<PathBuf> {
    directories::UserDirs::new().map(|d| d.home_dir().to_path_buf())
}

/// Cooperative, non-enforced advisory lock: a marker file removed on drop.
/// Another process can still open the database; this only lets tooling warn
/// a human operator that something else believes it owns the store.
struct AdvisoryLock {
    path: PathBuf,
}

impl AdvisoryLock {
    fn acquire(db_path: &Path) -> Result<Self> {
        let lock_path = db_path.with_extension("db-lock");
        if lock_path.exists() {
            tracing::warn!(path = %lock_path.display(), "advisory lock file already present, proceeding cooperatively");
        }
        std::fs::write(&lock_path, std::process::id().to_string())?;
        Ok(Self { path: lock_path })
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct Storage {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    db_path: PathBuf,
    _lock: AdvisoryLock,
}

impl Storage {
    fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 10000;
             PRAGMA wal_autocheckpoint = 100;
             PRAGMA foreign_keys = ON;",
        )
    }

    /// Open (creating and migrating if necessary) the database at `db_path`,
    /// or the resolved default location if `db_path` is `None`.
    pub fn open(db_path: Option<PathBuf>) -> Result<Self> {
        let path = resolve_db_path(db_path)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let lock = AdvisoryLock::acquire(&path)?;

        let writer_conn = Connection::open(&path)?;
        Self::configure_connection(&writer_conn)?;
        let applied = super::migrations::apply_migrations(&writer_conn)?;
        if applied > 0 {
            tracing::info!(applied, path = %path.display(), "schema migrated");
        }

        let reader_conn = Connection::open(&path)?;
        Self::configure_connection(&reader_conn)?;

        Ok(Self {
            writer: Mutex::new(writer_conn),
            reader: Mutex::new(reader_conn),
            db_path: path,
            _lock: lock,
        })
    }

    fn writer(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| CortexError::Internal("writer lock poisoned".into()))
    }

    fn reader(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| CortexError::Internal("reader lock poisoned".into()))
    }

    /// Current on-disk database file size, in bytes.
    pub fn file_size_bytes(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.db_path)?.len())
    }

    /// Enforce the size guardrails before a mutating write: log a warning at
    /// the soft limit, reject outright at the hard limit.
    fn check_size_guardrails(&self) -> Result<()> {
        let size = self.file_size_bytes().unwrap_or(0);
        if size >= HARD_SIZE_LIMIT_BYTES {
            return Err(CortexError::DbBlocked);
        }
        if size >= SOFT_SIZE_LIMIT_BYTES {
            tracing::warn!(size_bytes = size, "database file over the 50 MiB soft limit");
        }
        Ok(())
    }

    /// Read a value from the `metadata` key/value table, used to track
    /// engine-wide bookkeeping such as the last consolidation run.
    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let reader = self.reader()?;
        let value = reader
            .query_row("SELECT value FROM metadata WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Insert a new memory row and return it as stored.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_memory(
        &self,
        id: &str,
        memory_type: MemoryType,
        category: Category,
        title: &str,
        content: &str,
        project: &str,
        scope: Scope,
        transferable: bool,
        tags: &std::collections::BTreeSet<String>,
        salience: f64,
        now: DateTime<Utc>,
        metadata: &JsonValue,
    ) -> Result<Memory> {
        self.check_size_guardrails()?;

        let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
        let metadata_json = serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string());

        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO memories (
                id, memory_type, category, title, content, project, scope, transferable,
                tags, salience, decayed_score, access_count, last_accessed, created_at, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12, ?12, ?13)",
            params![
                id,
                memory_type.as_str(),
                category.as_str(),
                title,
                content,
                project,
                scope.as_str(),
                transferable as i64,
                tags_json,
                salience,
                salience,
                now.to_rfc3339(),
                metadata_json,
            ],
        )?;
        drop(writer);

        self.get_memory(id)?
            .ok_or_else(|| CortexError::Internal("memory vanished immediately after insert".into()))
    }

    /// Insert a memory reconstructed verbatim from an import, preserving every
    /// field the exporter recorded (salience, decayed score, access count,
    /// both timestamps) rather than recomputing them the way `insert_memory`
    /// does for freshly ingested input. `id` is caller-supplied since imports
    /// mint a fresh id rather than reusing the exported one.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_memory_full(
        &self,
        id: &str,
        memory_type: MemoryType,
        category: Category,
        title: &str,
        content: &str,
        project: &str,
        scope: Scope,
        transferable: bool,
        tags: &std::collections::BTreeSet<String>,
        salience: f64,
        decayed_score: f64,
        access_count: i64,
        last_accessed: DateTime<Utc>,
        created_at: DateTime<Utc>,
        metadata: &JsonValue,
    ) -> Result<Memory> {
        self.check_size_guardrails()?;

        let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
        let metadata_json = serde_json::to_string(metadata).unwrap_or_else(|_| "{}".to_string());

        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO memories (
                id, memory_type, category, title, content, project, scope, transferable,
                tags, salience, decayed_score, access_count, last_accessed, created_at, metadata
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                id,
                memory_type.as_str(),
                category.as_str(),
                title,
                content,
                project,
                scope.as_str(),
                transferable as i64,
                tags_json,
                salience,
                decayed_score,
                access_count,
                last_accessed.to_rfc3339(),
                created_at.to_rfc3339(),
                metadata_json,
            ],
        )?;
        drop(writer);

        self.get_memory(id)?
            .ok_or_else(|| CortexError::Internal("memory vanished immediately after insert".into()))
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        let reader = self.reader()?;
        let memory = reader
            .query_row("SELECT * FROM memories WHERE id = ?1", params![id], |row| {
                Self::row_to_memory(row)
            })
            .optional()?;
        Ok(memory)
    }

    pub fn update_memory_access(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let writer = self.writer()?;
        let rows = writer.execute(
            "UPDATE memories SET access_count = access_count + 1, last_accessed = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), id],
        )?;
        if rows == 0 {
            return Err(CortexError::MemoryNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn update_decayed_score(&self, id: &str, decayed_score: f64) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET decayed_score = ?1 WHERE id = ?2",
            params![decayed_score, id],
        )?;
        Ok(())
    }

    /// Persist a reinforcement-driven salience bump (outside of consolidation's
    /// own `UpdateSalience` mutation, which goes through
    /// `apply_consolidation_mutations` instead).
    pub fn update_salience(&self, id: &str, salience: f64) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET salience = ?1 WHERE id = ?2",
            params![salience, id],
        )?;
        Ok(())
    }

    pub fn promote_to_long_term(&self, id: &str) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET memory_type = ?1 WHERE id = ?2",
            params![MemoryType::LongTerm.as_str(), id],
        )?;
        Ok(())
    }

    pub fn update_content(&self, id: &str, title: &str, content: &str) -> Result<()> {
        let writer = self.writer()?;
        let rows = writer.execute(
            "UPDATE memories SET title = ?1, content = ?2 WHERE id = ?3",
            params![title, content, id],
        )?;
        if rows == 0 {
            return Err(CortexError::MemoryNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn update_tags(&self, id: &str, tags: &std::collections::BTreeSet<String>) -> Result<()> {
        let tags_json = serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string());
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memories SET tags = ?1 WHERE id = ?2",
            params![tags_json, id],
        )?;
        Ok(())
    }

    pub fn delete_memory(&self, id: &str) -> Result<bool> {
        let writer = self.writer()?;
        let rows = writer.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        Ok(rows > 0)
    }

    pub fn delete_memories(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let writer = self.writer()?;
        let mut deleted = 0;
        for id in ids {
            deleted += writer.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        }
        Ok(deleted)
    }

    /// All memories in a project (or every project when `project` is `None`),
    /// used by consolidation passes that must sweep the whole store.
    pub fn list_memories(&self, project: Option<&str>) -> Result<Vec<Memory>> {
        let reader = self.reader()?;
        let mut stmt = match project {
            Some(_) => reader.prepare(
                "SELECT * FROM memories WHERE project = ?1 OR scope = 'global' ORDER BY created_at",
            )?,
            None => reader.prepare("SELECT * FROM memories ORDER BY created_at")?,
        };

        let rows = match project {
            Some(p) => stmt.query_map(params![p], |row| Self::row_to_memory(row))?,
            None => stmt.query_map([], |row| Self::row_to_memory(row))?,
        };

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Candidate memories sharing at least one tag with `tags`, for auto-link
    /// scoring; excludes `exclude_id`.
    pub fn candidates_by_tag(
        &self,
        tags: &std::collections::BTreeSet<String>,
        project: &str,
        exclude_id: &str,
        limit: i64,
    ) -> Result<Vec<Memory>> {
        if tags.is_empty() {
            return Ok(Vec::new());
        }
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT * FROM memories
             WHERE (project = ?1 OR scope = 'global')
             AND id != ?2
             ORDER BY created_at DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![project, exclude_id, limit], |row| {
            Self::row_to_memory(row)
        })?;
        let mut out = Vec::new();
        for row in rows {
            let memory = row?;
            if memory.tags.intersection(tags).next().is_some() {
                out.push(memory);
            }
        }
        Ok(out)
    }

    /// Full-text search returning memories alongside a BM25 score normalized
    /// by the maximum score in this result set (so the caller never sees an
    /// un-normalized FTS5 rank). Scores are in `[0.0, 1.0]`, highest first.
    pub fn keyword_search(&self, query: &str, project: &str, limit: i64) -> Result<Vec<(Memory, f32)>> {
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }

        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT m.*, rank FROM memories m
             JOIN memories_fts fts ON m.id = fts.id
             WHERE memories_fts MATCH ?1
             AND (m.project = ?2 OR m.scope = 'global')
             ORDER BY rank
             LIMIT ?3",
        )?;

        let rows = stmt.query_map(params![sanitized, project, limit], |row| {
            let memory = Self::row_to_memory(row)?;
            let rank: f64 = row.get("rank")?;
            Ok((memory, (-rank).max(0.0) as f32))
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }

        let max_score = results.iter().map(|(_, s)| *s).fold(0.0_f32, f32::max);
        if max_score > 0.0 {
            for (_, score) in results.iter_mut() {
                *score /= max_score;
            }
        }
        Ok(results)
    }

    fn row_to_memory(row: &rusqlite::Row) -> rusqlite::Result<Memory> {
        let tags_json: String = row.get("tags")?;
        let tags: std::collections::BTreeSet<String> =
            serde_json::from_str(&tags_json).unwrap_or_default();

        let metadata_json: String = row.get("metadata")?;
        let metadata: JsonValue =
            serde_json::from_str(&metadata_json).unwrap_or(JsonValue::Null);

        let last_accessed: String = row.get("last_accessed")?;
        let created_at: String = row.get("created_at")?;

        Ok(Memory {
            id: row.get("id")?,
            memory_type: MemoryType::parse_str(&row.get::<_, String>("memory_type")?),
            category: Category::parse_str(&row.get::<_, String>("category")?),
            title: row.get("title")?,
            content: row.get("content")?,
            project: row.get("project")?,
            scope: Scope::parse_str(&row.get::<_, String>("scope")?),
            transferable: row.get::<_, i64>("transferable")? != 0,
            tags,
            salience: row.get("salience")?,
            decayed_score: row.get("decayed_score")?,
            access_count: row.get("access_count")?,
            last_accessed: parse_timestamp(&last_accessed)?,
            created_at: parse_timestamp(&created_at)?,
            metadata,
        })
    }

    // -- links --

    pub fn insert_link(
        &self,
        source_id: &str,
        target_id: &str,
        relationship: Relationship,
        strength: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO memory_links (source_id, target_id, relationship, strength, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source_id, target_id, relationship)
             DO UPDATE SET strength = excluded.strength",
            params![source_id, target_id, relationship.as_str(), strength, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn links_for(&self, memory_id: &str) -> Result<Vec<MemoryLink>> {
        let reader = self.reader()?;
        let mut stmt = reader.prepare(
            "SELECT source_id, target_id, relationship, strength, created_at FROM memory_links
             WHERE source_id = ?1 OR target_id = ?1",
        )?;
        let rows = stmt.query_map(params![memory_id], Self::row_to_link)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn reinforce_link(
        &self,
        source_id: &str,
        target_id: &str,
        relationship: Relationship,
        new_strength: f64,
    ) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE memory_links SET strength = ?1
             WHERE (source_id = ?2 AND target_id = ?3 OR source_id = ?3 AND target_id = ?2)
             AND relationship = ?4",
            params![new_strength, source_id, target_id, relationship.as_str()],
        )?;
        Ok(())
    }

    /// Repoint every link touching `old_id` onto `new_id`, dropping any that
    /// would become self-referential. Used when consolidation merges two
    /// memories and `old_id` is about to be deleted.
    pub fn rewrite_links(&self, old_id: &str, new_id: &str) -> Result<()> {
        let writer = self.writer()?;
        Self::rewrite_links_with(&writer, old_id, new_id)
    }

    fn rewrite_links_with(conn: &Connection, old_id: &str, new_id: &str) -> Result<()> {
        conn.execute(
            "UPDATE OR IGNORE memory_links SET source_id = ?1 WHERE source_id = ?2",
            params![new_id, old_id],
        )?;
        conn.execute(
            "UPDATE OR IGNORE memory_links SET target_id = ?1 WHERE target_id = ?2",
            params![new_id, old_id],
        )?;
        conn.execute(
            "DELETE FROM memory_links WHERE source_id = ?1 AND target_id = ?1",
            params![new_id],
        )?;
        conn.execute("DELETE FROM memory_links WHERE source_id = ?1 OR target_id = ?1", params![old_id])?;
        Ok(())
    }

    fn row_to_link(row: &rusqlite::Row) -> rusqlite::Result<MemoryLink> {
        let created_at: String = row.get("created_at")?;
        Ok(MemoryLink {
            source_id: row.get("source_id")?,
            target_id: row.get("target_id")?,
            relationship: Relationship::parse_str(&row.get::<_, String>("relationship")?)
                .unwrap_or(Relationship::Related),
            strength: row.get("strength")?,
            created_at: parse_timestamp(&created_at)?,
        })
    }

    // -- sessions --

    pub fn insert_session(&self, session: &Session) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "INSERT INTO sessions (id, project, started_at, ended_at, summary, memories_created, memories_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.id,
                session.project,
                session.started_at.to_rfc3339(),
                session.ended_at.map(|dt| dt.to_rfc3339()),
                session.summary,
                session.memories_created,
                session.memories_accessed,
            ],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let reader = self.reader()?;
        let session = reader
            .query_row("SELECT * FROM sessions WHERE id = ?1", params![id], |row| {
                Self::row_to_session(row)
            })
            .optional()?;
        Ok(session)
    }

    pub fn end_session(&self, id: &str, ended_at: DateTime<Utc>, summary: Option<&str>) -> Result<()> {
        let writer = self.writer()?;
        let rows = writer.execute(
            "UPDATE sessions SET ended_at = ?1, summary = ?2 WHERE id = ?3",
            params![ended_at.to_rfc3339(), summary, id],
        )?;
        if rows == 0 {
            return Err(CortexError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn bump_session_counters(&self, id: &str, created: i64, accessed: i64) -> Result<()> {
        let writer = self.writer()?;
        writer.execute(
            "UPDATE sessions SET memories_created = memories_created + ?1, memories_accessed = memories_accessed + ?2 WHERE id = ?3",
            params![created, accessed, id],
        )?;
        Ok(())
    }

    fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
        let started_at: String = row.get("started_at")?;
        let ended_at: Option<String> = row.get("ended_at")?;
        Ok(Session {
            id: row.get("id")?,
            project: row.get("project")?,
            started_at: parse_timestamp(&started_at)?,
            ended_at: ended_at.and_then(|s| parse_timestamp(&s).ok()),
            summary: row.get("summary")?,
            memories_created: row.get("memories_created")?,
            memories_accessed: row.get("memories_accessed")?,
        })
    }

    /// Apply a batch of consolidation edits inside a single write transaction.
    ///
    /// Consolidation needs true atomicity across steps that would otherwise
    /// each take and release `writer` independently (promote, delete, merge,
    /// re-score, relink). Expressing every step as a `ConsolidationMutation`
    /// and applying them here against one held connection means the pass
    /// really does commit or roll back as a unit, with no re-entrant locking.
    pub fn apply_consolidation_mutations(&self, mutations: &[ConsolidationMutation]) -> Result<()> {
        let writer = self.writer()?;
        writer.execute_batch("BEGIN IMMEDIATE")?;

        let result = (|| -> Result<()> {
            for mutation in mutations {
                match mutation {
                    ConsolidationMutation::Promote { id } => {
                        writer.execute(
                            "UPDATE memories SET memory_type = 'long_term' WHERE id = ?1",
                            params![id],
                        )?;
                    }
                    ConsolidationMutation::Delete { id } => {
                        writer.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
                    }
                    ConsolidationMutation::UpdateDecayedScore { id, score } => {
                        writer.execute(
                            "UPDATE memories SET decayed_score = ?2 WHERE id = ?1",
                            params![id, score],
                        )?;
                    }
                    ConsolidationMutation::UpdateSalience { id, salience } => {
                        writer.execute(
                            "UPDATE memories SET salience = ?2 WHERE id = ?1",
                            params![id, salience],
                        )?;
                    }
                    ConsolidationMutation::MergeContent {
                        survivor_id,
                        new_content,
                        new_tags_json,
                        new_access_count,
                        new_salience,
                    } => {
                        writer.execute(
                            "UPDATE memories SET content = ?2, tags = ?3, access_count = ?4, salience = ?5 WHERE id = ?1",
                            params![survivor_id, new_content, new_tags_json, new_access_count, new_salience],
                        )?;
                    }
                    ConsolidationMutation::RewriteLinks { old_id, new_id } => {
                        Self::rewrite_links_with(&writer, old_id, new_id)?;
                    }
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                writer.execute_batch("COMMIT")?;
                Ok(())
            }
            Err(e) => {
                let _ = writer.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Run the whole closure inside a single write transaction, committing on
    /// `Ok` and rolling back (leaving no partial state observable) on `Err`.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let writer = self.writer()?;
        writer.execute_batch("BEGIN IMMEDIATE")?;
        match f(&writer) {
            Ok(value) => {
                writer.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = writer.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    pub fn vacuum(&self) -> Result<()> {
        let writer = self.writer()?;
        writer.execute_batch("VACUUM;")?;
        Ok(())
    }
}

fn parse_timestamp(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())),
            )
        })
}

/// Strip FTS5 operator syntax a caller might accidentally trigger (`"`, `*`,
/// `:`, parens) so arbitrary user text can be matched as a plain term list.
pub fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| {
            let cleaned: String = term
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            cleaned
        })
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn open_test_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Storage::open(Some(dir.path().join("memories.db"))).unwrap();
        (storage, dir)
    }

    #[test]
    fn insert_and_get_roundtrips() {
        let (storage, _dir) = open_test_storage();
        let now = Utc::now();
        let tags: BTreeSet<String> = ["rust", "testing"].iter().map(|s| s.to_string()).collect();
        let memory = storage
            .insert_memory(
                "id-1",
                MemoryType::ShortTerm,
                Category::Note,
                "title",
                "some content",
                "proj",
                Scope::Project,
                false,
                &tags,
                0.5,
                now,
                &JsonValue::Null,
            )
            .unwrap();
        assert_eq!(memory.id, "id-1");
        assert_eq!(memory.tags, tags);

        let fetched = storage.get_memory("id-1").unwrap().unwrap();
        assert_eq!(fetched.title, "title");
        assert_eq!(fetched.access_count, 0);
    }

    #[test]
    fn update_access_increments_count_and_touches_last_accessed() {
        let (storage, _dir) = open_test_storage();
        let now = Utc::now();
        storage
            .insert_memory(
                "id-1",
                MemoryType::ShortTerm,
                Category::Note,
                "t",
                "c",
                "proj",
                Scope::Project,
                false,
                &BTreeSet::new(),
                0.5,
                now,
                &JsonValue::Null,
            )
            .unwrap();

        let later = now + chrono::Duration::hours(1);
        storage.update_memory_access("id-1", later).unwrap();
        let fetched = storage.get_memory("id-1").unwrap().unwrap();
        assert_eq!(fetched.access_count, 1);
        assert_eq!(fetched.last_accessed, later);
    }

    #[test]
    fn keyword_search_finds_inserted_content() {
        let (storage, _dir) = open_test_storage();
        let now = Utc::now();
        storage
            .insert_memory(
                "id-1",
                MemoryType::ShortTerm,
                Category::Architecture,
                "decision",
                "we chose postgres for ACID guarantees",
                "proj",
                Scope::Project,
                false,
                &BTreeSet::new(),
                0.8,
                now,
                &JsonValue::Null,
            )
            .unwrap();

        let results = storage.keyword_search("postgres", "proj", 10).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, "id-1");
    }

    #[test]
    fn global_scope_memory_visible_across_projects() {
        let (storage, _dir) = open_test_storage();
        let now = Utc::now();
        storage
            .insert_memory(
                "id-1",
                MemoryType::LongTerm,
                Category::Preference,
                "t",
                "always use snake_case identifiers",
                "project-a",
                Scope::Global,
                true,
                &BTreeSet::new(),
                0.6,
                now,
                &JsonValue::Null,
            )
            .unwrap();

        let results = storage.keyword_search("snake_case", "project-b", 10).unwrap();
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn delete_removes_row_and_is_idempotent() {
        let (storage, _dir) = open_test_storage();
        let now = Utc::now();
        storage
            .insert_memory(
                "id-1",
                MemoryType::ShortTerm,
                Category::Note,
                "t",
                "c",
                "proj",
                Scope::Project,
                false,
                &BTreeSet::new(),
                0.5,
                now,
                &JsonValue::Null,
            )
            .unwrap();
        assert!(storage.delete_memory("id-1").unwrap());
        assert!(!storage.delete_memory("id-1").unwrap());
        assert!(storage.get_memory("id-1").unwrap().is_none());
    }

    #[test]
    fn link_insert_and_rewrite_on_merge() {
        let (storage, _dir) = open_test_storage();
        let now = Utc::now();
        for id in ["a", "b", "c"] {
            storage
                .insert_memory(
                    id,
                    MemoryType::ShortTerm,
                    Category::Note,
                    "t",
                    "c",
                    "proj",
                    Scope::Project,
                    false,
                    &BTreeSet::new(),
                    0.5,
                    now,
                    &JsonValue::Null,
                )
                .unwrap();
        }
        storage.insert_link("a", "b", Relationship::Related, 0.3, now).unwrap();
        storage.insert_link("b", "c", Relationship::Related, 0.4, now).unwrap();

        storage.rewrite_links("b", "a").unwrap();

        let links_a = storage.links_for("a").unwrap();
        assert!(links_a.iter().any(|l| l.source_id == "a" && l.target_id == "c" || l.target_id == "a" && l.source_id == "c"));
        let links_b = storage.links_for("b").unwrap();
        assert!(links_b.is_empty());
    }

    #[test]
    fn consolidation_mutations_apply_atomically() {
        let (storage, _dir) = open_test_storage();
        let now = Utc::now();
        for id in ["a", "b"] {
            storage
                .insert_memory(
                    id,
                    MemoryType::ShortTerm,
                    Category::Note,
                    "t",
                    "c",
                    "proj",
                    Scope::Project,
                    false,
                    &BTreeSet::new(),
                    0.5,
                    now,
                    &JsonValue::Null,
                )
                .unwrap();
        }
        storage.insert_link("a", "b", Relationship::Related, 0.3, now).unwrap();

        storage
            .apply_consolidation_mutations(&[
                ConsolidationMutation::Promote { id: "a".to_string() },
                ConsolidationMutation::UpdateDecayedScore { id: "a".to_string(), score: 0.9 },
                ConsolidationMutation::UpdateSalience { id: "a".to_string(), salience: 0.8 },
                ConsolidationMutation::RewriteLinks { old_id: "b".to_string(), new_id: "a".to_string() },
                ConsolidationMutation::Delete { id: "b".to_string() },
            ])
            .unwrap();

        let a = storage.get_memory("a").unwrap().unwrap();
        assert_eq!(a.memory_type, MemoryType::LongTerm);
        assert!((a.decayed_score - 0.9).abs() < 1e-9);
        assert!((a.salience - 0.8).abs() < 1e-9);
        assert!(storage.get_memory("b").unwrap().is_none());
        assert!(storage.links_for("a").unwrap().is_empty());
    }

    #[test]
    fn sanitize_fts5_query_strips_operator_characters() {
        let sanitized = sanitize_fts5_query("postgres* OR \"evil\":query");
        assert!(!sanitized.contains('*'));
        assert!(sanitized.contains("postgres"));
    }

    #[test]
    fn insert_memory_full_preserves_exported_timestamps_and_counters() {
        let (storage, _dir) = open_test_storage();
        let created = Utc::now() - chrono::Duration::days(10);
        let accessed = Utc::now() - chrono::Duration::days(1);
        let tags: BTreeSet<String> = ["imported"].iter().map(|s| s.to_string()).collect();

        let memory = storage
            .insert_memory_full(
                "imported-1",
                MemoryType::LongTerm,
                Category::Architecture,
                "t",
                "c",
                "proj",
                Scope::Project,
                true,
                &tags,
                0.7,
                0.5,
                3,
                accessed,
                created,
                &JsonValue::Null,
            )
            .unwrap();

        assert_eq!(memory.created_at, created);
        assert_eq!(memory.last_accessed, accessed);
        assert_eq!(memory.access_count, 3);
        assert!((memory.decayed_score - 0.5).abs() < 1e-9);
    }
}
