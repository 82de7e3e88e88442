use crate::core::error::RegistryError;
use crate::core::schemas;
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Open a connection with the registry's standard pragmas. `busy_timeout` is
/// the cross-process wait budget; it mirrors the file-lock timeout.
pub fn db_connect(db_path: &Path, busy_timeout: Duration) -> Result<Connection, RegistryError> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
    conn.execute("PRAGMA synchronous=FULL;", [])?;
    Ok(conn)
}

pub fn registry_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(schemas::REGISTRY_DB_NAME)
}

pub fn initialize_registry_db(data_dir: &Path, busy_timeout: Duration) -> Result<PathBuf, RegistryError> {
    fs::create_dir_all(data_dir)?;
    let db_path = registry_db_path(data_dir);
    let conn = db_connect(&db_path, busy_timeout)?;
    for schema in schemas::REGISTRY_SCHEMAS {
        conn.execute(schema, [])?;
    }
    tracing::debug!(path = %db_path.display(), "registry database initialized");
    Ok(db_path)
}

/// SQLite gave up waiting on another writer.
pub fn is_busy_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => matches!(
            code.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}
