//! SQLite backend over `registry.db`.
//!
//! Connections are opened per operation; in-process writers serialize on a
//! write mutex and cross-process writers on SQLite's own locking, bounded by
//! the busy timeout. Anti-rollback runs inside `BEGIN IMMEDIATE`, so the
//! compare and the write see the same row.

use crate::core::anti_rollback::{self, Bump};
use crate::core::config::{BackendKind, RegistryConfig};
use crate::core::db;
use crate::core::error::RegistryError;
use crate::core::model::{Artifact, Model, ModelVersion, ReleasePointer, UpdateState};
use crate::core::schemas;
use crate::core::time;
use crate::store::{
    self, ARTIFACTS, MODEL_VERSIONS, MODELS, RELEASE_POINTERS, RegistryStore, UPDATE_STATES,
};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub struct SqliteStore {
    db_path: PathBuf,
    busy_timeout: Duration,
    write_lock: Mutex<()>,
}

impl SqliteStore {
    pub fn new(data_dir: &Path, busy_timeout: Duration) -> Result<Self, RegistryError> {
        let db_path = db::initialize_registry_db(data_dir, busy_timeout)?;
        Ok(Self {
            db_path,
            busy_timeout,
            write_lock: Mutex::new(()),
        })
    }

    pub fn open(config: &RegistryConfig) -> Result<Self, RegistryError> {
        Self::new(&config.data_dir, config.lock_timeout())
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, RegistryError> {
        db::db_connect(&self.db_path, self.busy_timeout)
    }

    fn with_write<F, R>(&self, table: &str, f: F) -> Result<R, RegistryError>
    where
        F: FnOnce(&mut Connection) -> Result<R, RegistryError>,
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RegistryError::Poisoned("sqlite write lock".into()))?;
        self.connect()
            .and_then(|mut conn| f(&mut conn))
            .map_err(|e| self.busy_to_timeout(table, e))
    }

    fn with_read<F, R>(&self, table: &str, f: F) -> Result<R, RegistryError>
    where
        F: FnOnce(&Connection) -> Result<R, RegistryError>,
    {
        self.connect()
            .and_then(|conn| f(&conn))
            .map_err(|e| self.busy_to_timeout(table, e))
    }

    fn busy_to_timeout(&self, table: &str, err: RegistryError) -> RegistryError {
        match err {
            RegistryError::RusqliteError(ref e) if db::is_busy_error(e) => {
                tracing::warn!(table, "sqlite busy timeout");
                RegistryError::LockTimeout {
                    name: table.to_string(),
                    waited_ms: self.busy_timeout.as_millis() as u64,
                }
            }
            other => other,
        }
    }

    fn get_json<T: DeserializeOwned>(&self, table: &str, id: &str) -> Result<Option<T>, RegistryError> {
        self.with_read(table, |conn| get_row(conn, table, id))
    }

    fn put_json<T: Serialize>(&self, table: &str, id: &str, value: &T) -> Result<(), RegistryError> {
        self.with_write(table, |conn| put_row(conn, table, id, value))
    }

    fn list_json<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>, RegistryError> {
        self.with_read(table, |conn| list_rows(conn, table))
    }
}

fn get_row<T: DeserializeOwned>(
    conn: &Connection,
    table: &str,
    id: &str,
) -> Result<Option<T>, RegistryError> {
    let sql = format!("SELECT data FROM {} WHERE id = ?1", table);
    let data: Option<String> = conn
        .query_row(&sql, params![id], |r| r.get(0))
        .optional()?;
    data.map(|d| decode(table, &d)).transpose()
}

fn put_row<T: Serialize>(
    conn: &Connection,
    table: &str,
    id: &str,
    value: &T,
) -> Result<(), RegistryError> {
    let data = serde_json::to_string(value)?;
    let sql = format!(
        "INSERT INTO {} (id, data) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET data = excluded.data",
        table
    );
    conn.execute(&sql, params![id, data])?;
    Ok(())
}

fn list_rows<T: DeserializeOwned>(conn: &Connection, table: &str) -> Result<Vec<T>, RegistryError> {
    let sql = format!("SELECT data FROM {} ORDER BY id", table);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
    let mut out = Vec::new();
    for row in rows {
        out.push(decode(table, &row?)?);
    }
    Ok(out)
}

fn decode<T: DeserializeOwned>(table: &str, data: &str) -> Result<T, RegistryError> {
    serde_json::from_str(data).map_err(|e| {
        tracing::error!(table, error = %e, "stored row is corrupted");
        RegistryError::PersistCorrupted {
            name: table.to_string(),
            detail: e.to_string(),
        }
    })
}

fn read_state(conn: &Connection, scope_key: &str) -> Result<Option<UpdateState>, RegistryError> {
    let row = conn
        .query_row(
            "SELECT max_seen_version, updated_at FROM update_states WHERE scope_key = ?1",
            params![scope_key],
            |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(max, updated_at)| UpdateState {
        scope_key: scope_key.to_string(),
        max_seen_version: max as u64,
        updated_at: updated_at as u64,
    }))
}

fn write_state(conn: &Connection, state: &UpdateState) -> Result<(), RegistryError> {
    conn.execute(
        "INSERT INTO update_states (scope_key, max_seen_version, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(scope_key) DO UPDATE SET
             max_seen_version = excluded.max_seen_version,
             updated_at = excluded.updated_at",
        params![
            state.scope_key,
            state.max_seen_version as i64,
            state.updated_at as i64
        ],
    )?;
    Ok(())
}

impl RegistryStore for SqliteStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn get_model(&self, id: &str) -> Result<Option<Model>, RegistryError> {
        self.get_json(MODELS, id)
    }

    fn put_model(&self, model: &Model) -> Result<(), RegistryError> {
        self.put_json(MODELS, &model.id, model)
    }

    fn list_models(&self) -> Result<Vec<Model>, RegistryError> {
        self.list_json(MODELS)
    }

    fn get_version(&self, id: &str) -> Result<Option<ModelVersion>, RegistryError> {
        self.get_json(MODEL_VERSIONS, id)
    }

    fn put_version(&self, version: &ModelVersion) -> Result<(), RegistryError> {
        self.put_json(MODEL_VERSIONS, &version.id, version)
    }

    fn list_versions(&self) -> Result<Vec<ModelVersion>, RegistryError> {
        self.list_json(MODEL_VERSIONS)
    }

    fn get_artifact(&self, id: &str) -> Result<Option<Artifact>, RegistryError> {
        self.get_json(ARTIFACTS, id)
    }

    fn put_artifact(&self, artifact: &Artifact) -> Result<(), RegistryError> {
        self.put_json(ARTIFACTS, &artifact.id, artifact)
    }

    fn list_artifacts(&self) -> Result<Vec<Artifact>, RegistryError> {
        self.list_json(ARTIFACTS)
    }

    fn get_release_pointer(&self, id: &str) -> Result<Option<ReleasePointer>, RegistryError> {
        self.get_json(RELEASE_POINTERS, id)
    }

    fn put_release_pointer(&self, pointer: &ReleasePointer) -> Result<(), RegistryError> {
        self.put_json(RELEASE_POINTERS, &pointer.id, pointer)
    }

    fn list_release_pointers(&self) -> Result<Vec<ReleasePointer>, RegistryError> {
        self.list_json(RELEASE_POINTERS)
    }

    fn put_release_pointer_checked(&self, pointer: &ReleasePointer) -> Result<(), RegistryError> {
        self.with_write(RELEASE_POINTERS, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let version: Option<ModelVersion> =
                get_row(&tx, MODEL_VERSIONS, &pointer.model_version_id)?;
            store::check_pointer_target(pointer, version.as_ref())?;
            put_row(&tx, RELEASE_POINTERS, &pointer.id, pointer)?;
            tx.commit()?;
            Ok(())
        })
    }

    fn roll_back_version(
        &self,
        tenant_id: &str,
        version_id: &str,
        at_ms: u64,
    ) -> Result<ModelVersion, RegistryError> {
        self.with_write(MODEL_VERSIONS, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let version = get_row(&tx, MODEL_VERSIONS, version_id)?;
            let pointers: Vec<ReleasePointer> = list_rows(&tx, RELEASE_POINTERS)?;
            let rolled =
                store::roll_back_checked(tenant_id, version_id, version, pointers.iter(), at_ms)?;
            put_row(&tx, MODEL_VERSIONS, &rolled.id, &rolled)?;
            tx.commit()?;
            Ok(rolled)
        })
    }

    fn get_update_state(&self, scope_key: &str) -> Result<Option<UpdateState>, RegistryError> {
        self.with_read(UPDATE_STATES, |conn| read_state(conn, scope_key))
    }

    fn put_update_state(&self, state: &UpdateState) -> Result<(), RegistryError> {
        self.with_write(UPDATE_STATES, |conn| write_state(conn, state))
    }

    fn enforce_and_bump_max_seen_version(
        &self,
        scope_key: &str,
        incoming: u64,
    ) -> Result<u64, RegistryError> {
        self.with_write(UPDATE_STATES, |conn| {
            // Dropping the transaction on any early return rolls it back.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = read_state(&tx, scope_key)?.map(|s| s.max_seen_version);
            let bump = anti_rollback::decide(scope_key, current, incoming)?;
            if let Bump::Advance(v) = bump {
                write_state(
                    &tx,
                    &UpdateState {
                        scope_key: scope_key.to_string(),
                        max_seen_version: v,
                        updated_at: time::now_ms(),
                    },
                )?;
            }
            tx.commit()?;
            Ok(bump.committed())
        })
    }

    fn clear_all(&self) -> Result<(), RegistryError> {
        self.with_write(MODELS, |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for table in schemas::REGISTRY_TABLES {
                tx.execute(&format!("DELETE FROM {}", table), [])?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn flush_now(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}
