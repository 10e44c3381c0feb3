//! End-to-end scenarios exercised through the public `Engine` facade, the
//! way a host process would actually drive the crate.

use chrono::Utc;
use cortex_core::consolidation;
use cortex_core::engine::{RecallMode, RecallQuery};
use cortex_core::memory::{Category, IngestInput, MemoryType};
use cortex_core::storage::Storage;
use cortex_core::{Engine, EngineConfig};

fn test_engine() -> (Engine, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let storage = Storage::open(Some(dir.path().join("memories.db"))).expect("open storage");
    (Engine::with_storage(storage, EngineConfig::default()), dir)
}

#[test]
fn insert_and_recall_ranks_the_match_first() {
    let (engine, _dir) = test_engine();
    engine.set_project("acme".into());

    let memory = engine
        .remember(IngestInput {
            title: "Use PostgreSQL".into(),
            content: "We chose PostgreSQL for ACID guarantees.".into(),
            category: Some(Category::Architecture),
            importance: Some("high".into()),
            ..Default::default()
        })
        .expect("remember");

    let results = engine
        .recall(RecallQuery {
            query: Some("postgres".into()),
            mode: RecallMode::Query,
            ..Default::default()
        })
        .expect("recall");

    assert!(!results.is_empty());
    let top = &results[0];
    assert_eq!(top.memory.id, memory.id);
    assert!(top.relevance > 0.5, "relevance was {}", top.relevance);
    assert_eq!(top.memory.category, Category::Architecture);
}

#[test]
fn decayed_low_salience_memory_is_deleted_after_consolidation() {
    let (engine, _dir) = test_engine();
    engine.set_project("acme".into());

    let memory = engine
        .remember(IngestInput {
            title: "stray note".into(),
            content: "a passing thought worth almost nothing".into(),
            category: Some(Category::Note),
            salience_override: Some(0.3),
            ..Default::default()
        })
        .expect("remember");

    let future = Utc::now() + chrono::Duration::hours(200);
    consolidation::run(engine.store(), future, false).expect("consolidate");

    let survivor = engine.store().storage().get_memory(&memory.id).expect("query");
    assert!(survivor.is_none(), "memory should have decayed below its deletion threshold and been pruned");
}

#[test]
fn high_salience_memory_is_promoted_to_long_term_on_access() {
    let (engine, _dir) = test_engine();
    engine.set_project("acme".into());

    let memory = engine
        .remember(IngestInput {
            title: "key architectural call".into(),
            content: "we standardized on async everywhere".into(),
            category: Some(Category::Architecture),
            memory_type: Some(MemoryType::ShortTerm),
            salience_override: Some(0.8),
            ..Default::default()
        })
        .expect("remember");

    engine.access_memory(&memory.id).expect("access");

    let future = Utc::now() + chrono::Duration::hours(30);
    consolidation::run(engine.store(), future, false).expect("consolidate");

    let promoted = engine
        .store()
        .storage()
        .get_memory(&memory.id)
        .expect("query")
        .expect("still present");
    assert_eq!(promoted.memory_type, MemoryType::LongTerm);
}

#[test]
fn similar_memories_are_auto_linked_as_related() {
    let (engine, _dir) = test_engine();
    engine.set_project("acme".into());

    let first = engine
        .remember(IngestInput { title: "JWT tokens".into(), content: "Auth uses JWT.".into(), ..Default::default() })
        .expect("remember first");
    let second = engine
        .remember(IngestInput { title: "JWT expiry".into(), content: "JWT expiry is 24h.".into(), ..Default::default() })
        .expect("remember second");

    let related = engine.get_related(&first.id).expect("get_related");
    let related_targets = related.get(&cortex_core::Relationship::Related).cloned().unwrap_or_default();

    assert!(
        related_targets.iter().any(|(id, strength)| id == &second.id && *strength >= 0.2),
        "expected {} to be auto-linked to {} with strength >= 0.2, got {:?}",
        first.id,
        second.id,
        related_targets
    );
}

#[test]
fn near_duplicate_short_term_memories_merge_with_consolidated_context() {
    let (engine, _dir) = test_engine();
    engine.set_project("acme".into());

    let shared = "the rate limiter uses a token bucket algorithm with burst capacity";
    let a = engine
        .remember(IngestInput {
            title: "rate limiter notes".into(),
            content: shared.to_string(),
            category: Some(Category::Pattern),
            ..Default::default()
        })
        .expect("remember a");
    let b = engine
        .remember(IngestInput {
            title: "rate limiter notes v2".into(),
            content: format!("{shared} for the public API"),
            category: Some(Category::Pattern),
            ..Default::default()
        })
        .expect("remember b");
    let c = engine
        .remember(IngestInput {
            title: "rate limiter notes v3".into(),
            content: format!("{shared} for the internal API"),
            category: Some(Category::Pattern),
            ..Default::default()
        })
        .expect("remember c");

    let summary = engine.consolidate(false).expect("consolidate");
    assert!(summary.merged >= 2, "expected at least two memories absorbed into a survivor, got {}", summary.merged);

    let ids = [a.id, b.id, c.id];
    let survivors: Vec<_> = ids
        .iter()
        .filter_map(|id| engine.store().storage().get_memory(id).expect("query").map(|m| (id.clone(), m)))
        .collect();
    assert_eq!(survivors.len(), 1, "exactly one of the three near-duplicates should remain");
    assert!(survivors[0].1.content.contains("Consolidated context:"));
}

#[test]
fn fts_special_characters_do_not_break_recall() {
    let (engine, _dir) = test_engine();
    engine.set_project("acme".into());

    let memory = engine
        .remember(IngestInput {
            title: "cache/evict + ttl".into(),
            content: "cache/evict uses a ttl-based sweep with AND/OR style keys".into(),
            ..Default::default()
        })
        .expect("remember");

    let results = engine
        .recall(RecallQuery { query: Some("cache/evict".into()), mode: RecallMode::Query, ..Default::default() })
        .expect("recall");

    assert!(results.iter().any(|r| r.memory.id == memory.id && r.relevance > 0.0));
}

#[test]
fn export_import_round_trip_is_idempotent_and_preserves_fields() {
    let (engine, _dir) = test_engine();
    engine.set_project("acme".into());

    engine
        .remember(IngestInput {
            title: "decision".into(),
            content: "we pinned the protocol version".into(),
            category: Some(Category::Architecture),
            salience_override: Some(0.6),
            ..Default::default()
        })
        .expect("remember");

    let exported = engine.export_memories(None).expect("export");
    assert_eq!(exported.len(), 1);

    let (fresh, _dir2) = test_engine();
    let imported = fresh.import_memories(exported.clone()).expect("import");
    assert_eq!(imported, 1);

    let reimported = fresh.import_memories(exported).expect("reimport");
    assert_eq!(reimported, 0);

    let stats = fresh.memory_stats().expect("stats");
    assert_eq!(stats.total, 1);
}

#[test]
fn session_lifecycle_tracks_creation_counters() {
    let (engine, _dir) = test_engine();
    let (session, _context) = engine.start_session(Some("acme".into())).expect("start_session");

    engine
        .remember(IngestInput { title: "t".into(), content: "c".into(), project: Some("acme".into()), ..Default::default() })
        .expect("remember");

    let stats = engine.end_session(&session.id, Some("wrapped up")).expect("end_session");
    assert_eq!(stats.session.memories_created, 1);
    assert!(!stats.session.is_active());
}
