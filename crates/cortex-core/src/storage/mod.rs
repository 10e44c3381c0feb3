//! Low-level SQLite persistence: connection management, migrations, and the
//! raw CRUD surface the higher-level `store` module composes into search,
//! auto-linking, and consolidation.

pub mod migrations;
mod sqlite;

pub use sqlite::{resolve_db_path, ConsolidationMutation, Storage};
