//! cortex: command-line harness for the claude-cortex memory engine.
//!
//! A thin wrapper over `cortex_core::Engine` — every subcommand opens the
//! engine, performs one operation, prints a result, and exits. No server,
//! no stdio protocol; a host process embeds `cortex-core` directly for
//! anything more than ad-hoc inspection and maintenance.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use cortex_core::engine::{RecallMode, RecallQuery};
use cortex_core::{Category, Engine, ForgetFilter, IngestInput, Memory, Relationship, Scope};
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cortex")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the claude-cortex persistent memory engine")]
struct Cli {
    /// Override the database path (defaults to the platform data directory).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Override the config file path.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a new memory
    Remember {
        title: String,
        content: String,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        importance: Option<String>,
        #[arg(long)]
        global: bool,
    },

    /// Search memories
    Recall {
        query: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long, default_value = "query")]
        mode: String,
        #[arg(long, default_value = "10")]
        limit: i64,
        #[arg(long)]
        include_global: bool,
    },

    /// Show a structured project context summary
    Context {
        query: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },

    /// Delete memories matching a filter
    Forget {
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        older_than_days: Option<i64>,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        confirm: bool,
    },

    /// Begin a work session
    StartSession {
        #[arg(long)]
        project: Option<String>,
    },

    /// End a work session
    EndSession {
        session_id: String,
        #[arg(long)]
        summary: Option<String>,
    },

    /// Run decay/promotion/pruning/merge maintenance
    Consolidate {
        #[arg(long)]
        dry_run: bool,
    },

    /// Show aggregate memory statistics
    Stats,

    /// Show memories linked to a given memory
    Related { id: String },

    /// Create or strengthen a link between two memories
    Link {
        source_id: String,
        target_id: String,
        #[arg(long, default_value = "related")]
        relationship: String,
        #[arg(long, default_value = "0.5")]
        strength: f64,
    },

    /// Export memories as JSON
    Export {
        output: PathBuf,
        #[arg(long)]
        project: Option<String>,
    },

    /// Import memories from a JSON export, skipping duplicates
    Import { input: PathBuf },

    /// Print or set the current project scope
    Project {
        /// New project name; omit to print the current one
        set: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let engine = Engine::open(cli.db, cli.config)?;

    match cli.command {
        Commands::Remember { title, content, project, category, tags, importance, global } => {
            run_remember(&engine, title, content, project, category, tags, importance, global)
        }
        Commands::Recall { query, project, category, mode, limit, include_global } => {
            run_recall(&engine, query, project, category, mode, limit, include_global)
        }
        Commands::Context { query, project } => run_context(&engine, query, project),
        Commands::Forget { ids, category, older_than_days, dry_run, confirm } => {
            run_forget(&engine, ids, category, older_than_days, dry_run, confirm)
        }
        Commands::StartSession { project } => run_start_session(&engine, project),
        Commands::EndSession { session_id, summary } => run_end_session(&engine, session_id, summary),
        Commands::Consolidate { dry_run } => run_consolidate(&engine, dry_run),
        Commands::Stats => run_stats(&engine),
        Commands::Related { id } => run_related(&engine, id),
        Commands::Link { source_id, target_id, relationship, strength } => {
            run_link(&engine, source_id, target_id, relationship, strength)
        }
        Commands::Export { output, project } => run_export(&engine, output, project),
        Commands::Import { input } => run_import(&engine, input),
        Commands::Project { set } => run_project(&engine, set),
    }
}

fn parse_category(s: &str) -> anyhow::Result<Category> {
    let parsed = Category::parse_str(&s.to_lowercase());
    if parsed.as_str() != s.to_lowercase() {
        anyhow::bail!("unrecognized category '{}'", s);
    }
    Ok(parsed)
}

fn parse_relationship(s: &str) -> anyhow::Result<Relationship> {
    Relationship::parse_str(&s.to_lowercase()).ok_or_else(|| anyhow::anyhow!("unrecognized relationship '{}'", s))
}

#[allow(clippy::too_many_arguments)]
fn run_remember(
    engine: &Engine,
    title: String,
    content: String,
    project: Option<String>,
    category: Option<String>,
    tags: Vec<String>,
    importance: Option<String>,
    global: bool,
) -> anyhow::Result<()> {
    let category = category.map(|c| parse_category(&c)).transpose()?;
    let memory = engine.remember(IngestInput {
        title,
        content,
        project,
        category,
        tags: tags.into_iter().collect(),
        importance,
        scope: if global { Some(Scope::Global) } else { None },
        ..Default::default()
    })?;

    println!("{} {}", "created".green().bold(), memory.id);
    print_memory_line(&memory);
    Ok(())
}

fn run_recall(
    engine: &Engine,
    query: Option<String>,
    project: Option<String>,
    category: Option<String>,
    mode: String,
    limit: i64,
    include_global: bool,
) -> anyhow::Result<()> {
    let category = category.map(|c| parse_category(&c)).transpose()?;
    let mode = match mode.as_str() {
        "recent" => RecallMode::Recent,
        "important" => RecallMode::Important,
        _ => RecallMode::Query,
    };

    let results = engine.recall(RecallQuery {
        query,
        project,
        category,
        min_salience: None,
        limit: Some(limit),
        include_global,
        mode,
    })?;

    if results.is_empty() {
        println!("{}", "no matching memories".dimmed());
        return Ok(());
    }

    for result in &results {
        println!(
            "{} [{:.3}] {}",
            result.memory.id[..8].cyan(),
            result.relevance,
            result.memory.title.bold()
        );
        println!("  {}", truncate(&result.memory.content, 100).dimmed());
    }
    Ok(())
}

fn run_context(engine: &Engine, query: Option<String>, project: Option<String>) -> anyhow::Result<()> {
    let context = engine.get_context(query.as_deref(), project)?;

    let section = |label: &str, memories: &[Memory]| {
        if memories.is_empty() {
            return;
        }
        println!("{}", label.yellow().bold());
        for memory in memories {
            println!("  {} {}", memory.id[..8].cyan(), memory.title);
        }
    };

    section("Key decisions", &context.key_decisions);
    section("Patterns", &context.patterns);
    section("Pending", &context.pending);
    section("Recent", &context.recent);
    Ok(())
}

fn run_forget(
    engine: &Engine,
    ids: Vec<String>,
    category: Option<String>,
    older_than_days: Option<i64>,
    dry_run: bool,
    confirm: bool,
) -> anyhow::Result<()> {
    let category = category.map(|c| parse_category(&c)).transpose()?;
    let result = engine.forget(ForgetFilter {
        ids: if ids.is_empty() { None } else { Some(ids) },
        category,
        older_than_days,
        dry_run,
        confirm,
    })?;

    if dry_run {
        println!("{}: {} memories would be deleted", "dry run".yellow().bold(), result.deleted);
        if let Some(preview) = &result.preview {
            for id in preview {
                println!("  {}", id);
            }
        }
    } else {
        println!("{} {} memories", "deleted".red().bold(), result.deleted);
    }
    Ok(())
}

fn run_start_session(engine: &Engine, project: Option<String>) -> anyhow::Result<()> {
    let (session, context) = engine.start_session(project)?;
    println!("{} {}", "session started".green().bold(), session.id);
    println!("project: {}", session.project);
    run_context(engine, None, Some(session.project))?;
    let _ = context;
    Ok(())
}

fn run_end_session(engine: &Engine, session_id: String, summary: Option<String>) -> anyhow::Result<()> {
    let stats = engine.end_session(&session_id, summary.as_deref())?;
    println!("{} {}", "session ended".green().bold(), session_id);
    println!("memories created: {}", stats.session.memories_created);
    println!("memories accessed: {}", stats.session.memories_accessed);
    Ok(())
}

fn run_consolidate(engine: &Engine, dry_run: bool) -> anyhow::Result<()> {
    let summary = engine.consolidate(dry_run)?;
    println!("{}", "=== Consolidation ===".cyan().bold());
    println!("promoted to long-term: {}", summary.consolidated);
    println!("decayed: {}", summary.decayed);
    println!("deleted: {}", summary.deleted);
    println!("merged: {}", summary.merged);
    println!("salience evolved: {}", summary.salience_evolved);
    println!("duration: {}ms", summary.duration_ms);
    Ok(())
}

fn run_stats(engine: &Engine) -> anyhow::Result<()> {
    let stats = engine.memory_stats()?;
    println!("{}", "=== Memory Statistics ===".cyan().bold());
    println!("total: {}", stats.total);
    println!("average salience: {:.3}", stats.average_salience);
    println!("average decayed score: {:.3}", stats.average_decayed_score);
    println!();
    println!("{}", "by type:".yellow().bold());
    for (k, v) in &stats.by_type {
        println!("  {}: {}", k, v);
    }
    println!("{}", "by category:".yellow().bold());
    for (k, v) in &stats.by_category {
        println!("  {}: {}", k, v);
    }
    Ok(())
}

fn run_related(engine: &Engine, id: String) -> anyhow::Result<()> {
    let related = engine.get_related(&id)?;
    if related.is_empty() {
        println!("{}", "no links".dimmed());
        return Ok(());
    }
    for (relationship, targets) in &related {
        println!("{}", relationship.to_string().yellow().bold());
        for (target_id, strength) in targets {
            println!("  {} [{:.2}]", target_id, strength);
        }
    }
    Ok(())
}

fn run_link(
    engine: &Engine,
    source_id: String,
    target_id: String,
    relationship: String,
    strength: f64,
) -> anyhow::Result<()> {
    let relationship = parse_relationship(&relationship)?;
    let link = engine.link_memories(&source_id, &target_id, relationship, strength)?;
    println!(
        "{} {} -> {} ({}, strength {:.2})",
        "linked".green().bold(),
        link.source_id,
        link.target_id,
        link.relationship,
        link.strength
    );
    Ok(())
}

fn run_export(engine: &Engine, output: PathBuf, project: Option<String>) -> anyhow::Result<()> {
    let memories = engine.export_memories(project.as_deref())?;
    let json = serde_json::to_string_pretty(&memories)?;
    std::fs::write(&output, json)?;
    println!(
        "{} {} memories to {}",
        "exported".green().bold(),
        memories.len(),
        output.display()
    );
    Ok(())
}

fn run_import(engine: &Engine, input: PathBuf) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(&input)?;
    let memories: Vec<Memory> = serde_json::from_str(&text)?;
    let total = memories.len();
    let imported = engine.import_memories(memories)?;
    println!(
        "{} {}/{} memories (duplicates skipped)",
        "imported".green().bold(),
        imported,
        total
    );
    Ok(())
}

fn run_project(engine: &Engine, set: Option<String>) -> anyhow::Result<()> {
    match set {
        Some(project) => {
            engine.set_project(project.clone());
            println!("{} {}", "project set to".green().bold(), project);
        }
        None => println!("{}", engine.get_project()),
    }
    Ok(())
}

fn print_memory_line(memory: &Memory) {
    println!(
        "  {} / {} / salience {:.2}",
        memory.project,
        memory.category,
        memory.salience
    );
}

fn truncate(s: &str, max_chars: usize) -> String {
    let s = s.replace('\n', " ");
    if s.chars().count() <= max_chars {
        s
    } else {
        let truncated: String = s.chars().take(max_chars).collect();
        format!("{truncated}...")
    }
}
