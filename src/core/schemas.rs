//! Table definitions for the SQLite registry backend.
//!
//! Every entity table stores the serialized record in a `data` column keyed by
//! its id, so the JSON shape is identical across all backends. Only
//! `update_states` keeps its counter in a typed column, since the
//! anti-rollback compare happens inside SQL transactions.

pub const REGISTRY_DB_NAME: &str = "registry.db";

pub const MODELS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS models (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )
";

pub const MODEL_VERSIONS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS model_versions (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )
";

pub const ARTIFACTS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS artifacts (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )
";

pub const RELEASE_POINTERS_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS release_pointers (
        id TEXT PRIMARY KEY,
        data TEXT NOT NULL
    )
";

pub const UPDATE_STATES_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS update_states (
        scope_key TEXT PRIMARY KEY,
        max_seen_version INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
";

/// Entity tables in creation order.
pub const REGISTRY_SCHEMAS: &[&str] = &[
    MODELS_SCHEMA,
    MODEL_VERSIONS_SCHEMA,
    ARTIFACTS_SCHEMA,
    RELEASE_POINTERS_SCHEMA,
    UPDATE_STATES_SCHEMA,
];

/// Tables wiped by `clear_all`.
pub const REGISTRY_TABLES: &[&str] = &[
    "models",
    "model_versions",
    "artifacts",
    "release_pointers",
    "update_states",
];
