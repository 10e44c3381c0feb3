//! `Engine`: the facade a host process owns for the lifetime of the process.
//!
//! Wraps a single `Store` (itself wrapping one `Storage` handle and one
//! `EngineConfig`) plus the small bits of session/project state the
//! external operations need that don't belong in `Store` proper: the
//! current project scope, the active session (if any), and the
//! consolidation schedule. No ambient singletons — the host constructs one
//! `Engine` at startup and disposes it at shutdown.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::consolidation::{self, ConsolidationSummary};
use crate::decay;
use crate::error::{CortexError, Result};
use crate::links::{MemoryLink, Relationship};
use crate::memory::{Category, IngestInput, Memory, MemoryType, GLOBAL_PROJECT};
use crate::session::Session;
use crate::storage::Storage;
use crate::store::{ForgetFilter, ForgetResult, SearchQuery, SearchResult, Store};

/// `recall`'s selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecallMode {
    /// Full relevance-blended keyword search (the default).
    #[default]
    Query,
    /// Most recently accessed memories, ignoring textual relevance.
    Recent,
    /// Highest-salience memories, ignoring textual relevance.
    Important,
}

/// Input to `Engine::recall`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallQuery {
    pub query: Option<String>,
    pub project: Option<String>,
    pub category: Option<Category>,
    pub min_salience: Option<f64>,
    pub limit: Option<i64>,
    pub include_global: bool,
    pub mode: RecallMode,
}

/// Default number of results for `recall` and `get_context` when the caller
/// doesn't specify a limit.
const DEFAULT_RECALL_LIMIT: i64 = 10;

/// A structured, human-readable snapshot of a project's most load-bearing
/// memories, grouped the way a session-start summary would present them.
/// Rendering this into prose is the host's job (out of scope here).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub key_decisions: Vec<Memory>,
    pub patterns: Vec<Memory>,
    pub pending: Vec<Memory>,
    pub recent: Vec<Memory>,
}

/// Counts returned by `memory_stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub average_salience: f64,
    pub average_decayed_score: f64,
}

/// Returned by `end_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session: Session,
}

/// The persistent memory engine. One per process; `Send + Sync` so a host
/// can share it behind an `Arc` across concurrent request handlers.
pub struct Engine {
    store: Store,
    current_project: Mutex<String>,
    active_session: Mutex<Option<String>>,
}

impl Engine {
    /// Open (creating and migrating if necessary) the database at `db_path`
    /// — or the resolved default location if `None` — load configuration
    /// from `config_path` (or its conventional location), and run an
    /// automatic consolidation pass if one is due.
    pub fn open(db_path: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<Self> {
        let config = match config_path.or_else(EngineConfig::default_path) {
            Some(path) => EngineConfig::load_from(&path)?,
            None => EngineConfig::default(),
        };
        let storage = Storage::open(db_path)?;
        let project = config.project.clone().unwrap_or_else(|| GLOBAL_PROJECT.to_string());
        let store = Store::new(storage, config);
        let engine = Self {
            store,
            current_project: Mutex::new(project),
            active_session: Mutex::new(None),
        };
        engine.maybe_run_automatic_consolidation()?;
        Ok(engine)
    }

    /// Construct directly from an already-open `Storage` and `EngineConfig`;
    /// used by tests and by callers embedding the engine without going
    /// through the conventional path resolution.
    pub fn with_storage(storage: Storage, config: EngineConfig) -> Self {
        let project = config.project.clone().unwrap_or_else(|| GLOBAL_PROJECT.to_string());
        Self {
            store: Store::new(storage, config),
            current_project: Mutex::new(project),
            active_session: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn project_lock(&self) -> std::sync::MutexGuard<'_, String> {
        self.current_project.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Background, fire-and-forget maintenance: run consolidation only if the
    /// last recorded run is stale enough. Failures are logged, never
    /// propagated to the caller.
    fn maybe_run_automatic_consolidation(&self) -> Result<()> {
        let now = Utc::now();
        if !consolidation::due_for_automatic_run(self.store.storage(), now)? {
            return Ok(());
        }
        match consolidation::run(&self.store, now, false) {
            Ok(summary) => {
                tracing::info!(
                    consolidated = summary.consolidated,
                    deleted = summary.deleted,
                    merged = summary.merged,
                    "automatic consolidation completed"
                );
            }
            Err(e) => tracing::warn!(error = %e, "automatic consolidation failed"),
        }
        Ok(())
    }

    // -- remember / recall --

    /// `remember`: insert a new memory, scoping it to the current project
    /// unless the caller names one explicitly.
    pub fn remember(&self, mut input: IngestInput) -> Result<Memory> {
        if input.project.is_none() {
            input.project = Some(self.project_lock().clone());
        }
        let memory = self.store.add_memory(input)?;
        if let Some(session_id) = self.active_session.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            if let Err(e) = self.store.storage().bump_session_counters(&session_id, 1, 0) {
                tracing::warn!(error = %e, "failed to bump session creation counter");
            }
        }
        if let Err(e) = self.maybe_consolidate_on_capacity() {
            tracing::warn!(error = %e, "capacity-triggered consolidation failed");
        }
        Ok(memory)
    }

    /// If the short-term population has crossed 90% of its configured cap,
    /// run a consolidation pass immediately rather than waiting for the
    /// regular time-based schedule to catch up.
    fn maybe_consolidate_on_capacity(&self) -> Result<()> {
        let config = self.store.config();
        let soft_limit = (config.max_short_term as f64 * 0.9) as usize;
        let short_term_count = self
            .store
            .storage()
            .list_memories(None)?
            .into_iter()
            .filter(|m| m.memory_type == MemoryType::ShortTerm)
            .count();
        if short_term_count < soft_limit {
            return Ok(());
        }
        let summary = consolidation::run(&self.store, Utc::now(), false)?;
        tracing::info!(
            consolidated = summary.consolidated,
            deleted = summary.deleted,
            merged = summary.merged,
            "capacity-triggered consolidation completed"
        );
        Ok(())
    }

    /// `recall`: dispatches on `mode`. `query` mode is the full
    /// relevance-blended search; `recent`/`important` bypass textual
    /// relevance and the FTS join entirely, sorting on a single signal.
    pub fn recall(&self, query: RecallQuery) -> Result<Vec<SearchResult>> {
        let project = query.project.unwrap_or_else(|| self.project_lock().clone());
        let limit = query.limit.unwrap_or(DEFAULT_RECALL_LIMIT);

        let results = match query.mode {
            RecallMode::Query => self.store.search(SearchQuery {
                query: query.query,
                project,
                category: query.category,
                min_salience: query.min_salience,
                include_global: query.include_global,
                include_decayed: false,
                limit,
            })?,
            RecallMode::Recent => self.rank_without_relevance(&project, query.category, limit, |a, b| {
                b.last_accessed.cmp(&a.last_accessed)
            })?,
            RecallMode::Important => self.rank_without_relevance(&project, query.category, limit, |a, b| {
                b.salience.total_cmp(&a.salience)
            })?,
        };

        if let Some(session_id) = self.active_session.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            if let Err(e) = self
                .store
                .storage()
                .bump_session_counters(&session_id, 0, results.len() as i64)
            {
                tracing::warn!(error = %e, "failed to bump session access counter");
            }
        }
        Ok(results)
    }

    fn rank_without_relevance(
        &self,
        project: &str,
        category: Option<Category>,
        limit: i64,
        cmp: impl Fn(&Memory, &Memory) -> std::cmp::Ordering,
    ) -> Result<Vec<SearchResult>> {
        let now = Utc::now();
        let mut memories = self.store.storage().list_memories(Some(project))?;
        if let Some(cat) = category {
            memories.retain(|m| m.category == cat);
        }
        memories.sort_by(|a, b| cmp(a, b));
        memories.truncate(limit.max(0) as usize);
        Ok(memories
            .into_iter()
            .map(|m| {
                let relevance = decay::decayed_score(&m, now);
                SearchResult { memory: m, relevance }
            })
            .collect())
    }

    /// `get_context`: a structured snapshot split into the categories a
    /// session-start summary would want, grounded in the current project
    /// (or `project` if given) and optionally narrowed by `query`.
    pub fn get_context(&self, query: Option<&str>, project: Option<String>) -> Result<ContextSummary> {
        let project = project.unwrap_or_else(|| self.project_lock().clone());
        let section = |category: Category| -> Result<Vec<Memory>> {
            Ok(self
                .store
                .search(SearchQuery {
                    query: query.map(str::to_string),
                    project: project.clone(),
                    category: Some(category),
                    min_salience: None,
                    include_global: true,
                    include_decayed: false,
                    limit: 5,
                })?
                .into_iter()
                .map(|r| r.memory)
                .collect())
        };

        let recent = self.rank_without_relevance(&project, None, 5, |a, b| b.created_at.cmp(&a.created_at))?
            .into_iter()
            .map(|r| r.memory)
            .collect();

        Ok(ContextSummary {
            key_decisions: section(Category::Architecture)?,
            patterns: section(Category::Pattern)?,
            pending: section(Category::Todo)?,
            recent,
        })
    }

    // -- forget / access / links --

    pub fn forget(&self, filter: ForgetFilter) -> Result<ForgetResult> {
        self.store.forget(filter)
    }

    pub fn access_memory(&self, id: &str) -> Result<Memory> {
        self.store.access_memory(id)
    }

    pub fn get_related(&self, id: &str) -> Result<BTreeMap<Relationship, Vec<(String, f64)>>> {
        self.store.get_related(id)
    }

    pub fn link_memories(
        &self,
        source_id: &str,
        target_id: &str,
        relationship: Relationship,
        strength: f64,
    ) -> Result<MemoryLink> {
        self.store.link_memories(source_id, target_id, relationship, strength)
    }

    // -- sessions --

    /// `start_session`: opens a new session scoped to `project` (or the
    /// current project), marks it active, and returns it alongside the
    /// project's context summary — the caller renders that into whatever
    /// human-readable form it needs.
    pub fn start_session(&self, project: Option<String>) -> Result<(Session, ContextSummary)> {
        let project = project.unwrap_or_else(|| self.project_lock().clone());
        let session = Session::new(Uuid::new_v4().to_string(), project.clone(), Utc::now());
        self.store.storage().insert_session(&session)?;
        *self.active_session.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.id.clone());
        let context = self.get_context(None, Some(project))?;
        Ok((session, context))
    }

    /// `end_session`: closes the session and returns its final counters.
    pub fn end_session(&self, session_id: &str, summary: Option<&str>) -> Result<SessionStats> {
        self.store.storage().end_session(session_id, Utc::now(), summary)?;
        let mut active = self.active_session.lock().unwrap_or_else(|e| e.into_inner());
        if active.as_deref() == Some(session_id) {
            *active = None;
        }
        let session = self
            .store
            .storage()
            .get_session(session_id)?
            .ok_or_else(|| CortexError::SessionNotFound(session_id.to_string()))?;
        Ok(SessionStats { session })
    }

    // -- consolidation --

    pub fn consolidate(&self, dry_run: bool) -> Result<ConsolidationSummary> {
        consolidation::run(&self.store, Utc::now(), dry_run)
    }

    // -- stats --

    pub fn memory_stats(&self) -> Result<MemoryStats> {
        let memories = self.store.storage().list_memories(None)?;
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
        let mut salience_sum = 0.0;
        let mut decayed_sum = 0.0;

        for memory in &memories {
            *by_type.entry(memory.memory_type.as_str().to_string()).or_insert(0) += 1;
            *by_category.entry(memory.category.as_str().to_string()).or_insert(0) += 1;
            salience_sum += memory.salience;
            decayed_sum += memory.decayed_score;
        }

        let total = memories.len();
        Ok(MemoryStats {
            total,
            by_type,
            by_category,
            average_salience: if total > 0 { salience_sum / total as f64 } else { 0.0 },
            average_decayed_score: if total > 0 { decayed_sum / total as f64 } else { 0.0 },
        })
    }

    // -- project scope --

    pub fn get_project(&self) -> String {
        self.project_lock().clone()
    }

    pub fn set_project(&self, project: String) {
        *self.project_lock() = project;
    }

    // -- export / import --

    /// `export_memories`: every memory in `project` (or every project if
    /// `None`), in canonical field order, ready to serialize as JSON.
    pub fn export_memories(&self, project: Option<&str>) -> Result<Vec<Memory>> {
        self.store.storage().list_memories(project)
    }

    /// `import_memories`: additive and idempotent on duplicate
    /// `(project, title, created_at)` triples, which are silently skipped.
    /// Every field except `id` is reconstructed verbatim from the export;
    /// a fresh id is minted for each imported memory.
    pub fn import_memories(&self, memories: Vec<Memory>) -> Result<usize> {
        let existing = self.store.storage().list_memories(None)?;
        let mut seen: std::collections::BTreeSet<(String, String, String)> = existing
            .iter()
            .map(|m| (m.project.clone(), m.title.clone(), m.created_at.to_rfc3339()))
            .collect();

        let mut imported = 0;
        for memory in memories {
            let key = (memory.project.clone(), memory.title.clone(), memory.created_at.to_rfc3339());
            if seen.contains(&key) {
                continue;
            }
            let id = Uuid::new_v4().to_string();
            self.store.storage().insert_memory_full(
                &id,
                memory.memory_type,
                memory.category,
                &memory.title,
                &memory.content,
                &memory.project,
                memory.scope,
                memory.transferable,
                &memory.tags,
                memory.salience,
                memory.decayed_score,
                memory.access_count,
                memory.last_accessed,
                memory.created_at,
                &memory.metadata,
            )?;
            seen.insert(key);
            imported += 1;
        }
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Scope;

    fn test_engine() -> (Engine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(Some(dir.path().join("memories.db"))).unwrap();
        (Engine::with_storage(storage, EngineConfig::default()), dir)
    }

    #[test]
    fn remember_defaults_to_current_project() {
        let (engine, _dir) = test_engine();
        engine.set_project("proj-a".into());
        let memory = engine
            .remember(IngestInput { title: "t".into(), content: "some content here".into(), ..Default::default() })
            .unwrap();
        assert_eq!(memory.project, "proj-a");
    }

    #[test]
    fn remember_triggers_consolidation_once_short_term_crosses_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(Some(dir.path().join("memories.db"))).unwrap();
        let config = EngineConfig { max_short_term: 4, ..EngineConfig::default() };
        let engine = Engine::with_storage(storage, config);
        engine.set_project("proj-a".into());
        assert!(consolidation::due_for_automatic_run(engine.store.storage(), Utc::now()).unwrap());
        for i in 0..4 {
            engine
                .remember(IngestInput {
                    title: format!("note {i}"),
                    content: format!("distinct unrelated content body number {i}"),
                    ..Default::default()
                })
                .unwrap();
        }
        assert!(!consolidation::due_for_automatic_run(engine.store.storage(), Utc::now()).unwrap());
    }

    #[test]
    fn recall_important_mode_sorts_by_salience() {
        let (engine, _dir) = test_engine();
        engine.set_project("proj".into());
        engine
            .remember(IngestInput {
                title: "low".into(),
                content: "low salience note".into(),
                salience_override: Some(0.2),
                ..Default::default()
            })
            .unwrap();
        engine
            .remember(IngestInput {
                title: "high".into(),
                content: "high salience note".into(),
                salience_override: Some(0.9),
                ..Default::default()
            })
            .unwrap();

        let results = engine
            .recall(RecallQuery { mode: RecallMode::Important, limit: Some(10), ..Default::default() })
            .unwrap();
        assert_eq!(results[0].memory.title, "high");
    }

    #[test]
    fn start_and_end_session_tracks_creation_counter() {
        let (engine, _dir) = test_engine();
        let (session, _context) = engine.start_session(Some("proj".into())).unwrap();
        engine
            .remember(IngestInput { title: "t".into(), content: "during session".into(), project: Some("proj".into()), ..Default::default() })
            .unwrap();
        let stats = engine.end_session(&session.id, Some("wrapped up")).unwrap();
        assert_eq!(stats.session.memories_created, 1);
        assert!(!stats.session.is_active());
    }

    #[test]
    fn export_then_import_round_trips_into_empty_database() {
        let (engine, _dir) = test_engine();
        engine
            .remember(IngestInput {
                title: "decision".into(),
                content: "we chose postgres for ACID guarantees".into(),
                category: Some(Category::Architecture),
                project: Some("proj".into()),
                ..Default::default()
            })
            .unwrap();

        let exported = engine.export_memories(None).unwrap();
        assert_eq!(exported.len(), 1);

        let (fresh_engine, _dir2) = test_engine();
        let imported = fresh_engine.import_memories(exported.clone()).unwrap();
        assert_eq!(imported, 1);

        let reimported = fresh_engine.import_memories(exported).unwrap();
        assert_eq!(reimported, 0, "re-importing the same export must be a no-op");
    }

    #[test]
    fn memory_stats_counts_by_type_and_category() {
        let (engine, _dir) = test_engine();
        engine
            .remember(IngestInput {
                title: "t".into(),
                content: "c".into(),
                category: Some(Category::Note),
                memory_type: Some(MemoryType::ShortTerm),
                scope: Some(Scope::Project),
                ..Default::default()
            })
            .unwrap();
        let stats = engine.memory_stats().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_type.get("short_term"), Some(&1));
        assert_eq!(stats.by_category.get("note"), Some(&1));
    }
}
