//! Uniform storage contract over interchangeable backends.
//!
//! Every backend returns lists ordered by id and implements
//! `enforce_and_bump_max_seen_version` as one indivisible read-compare-write
//! per scope key, so callers cannot tell backends apart. Setting a release
//! pointer and rolling back a version are likewise atomic against each other.

pub mod file;
pub mod memory;
pub mod sqlite;

use crate::core::config::{BackendKind, RegistryConfig};
use crate::core::error::RegistryError;
use crate::core::model::{
    Artifact, Model, ModelVersion, ReleasePointer, UpdateState, VersionStatus,
};
use std::sync::Arc;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Document and table names shared by the file and SQLite backends.
pub const MODELS: &str = "models";
pub const MODEL_VERSIONS: &str = "model_versions";
pub const ARTIFACTS: &str = "artifacts";
pub const RELEASE_POINTERS: &str = "release_pointers";
pub const UPDATE_STATES: &str = "update_states";

pub trait RegistryStore: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn get_model(&self, id: &str) -> Result<Option<Model>, RegistryError>;
    fn put_model(&self, model: &Model) -> Result<(), RegistryError>;
    fn list_models(&self) -> Result<Vec<Model>, RegistryError>;

    fn get_version(&self, id: &str) -> Result<Option<ModelVersion>, RegistryError>;
    fn put_version(&self, version: &ModelVersion) -> Result<(), RegistryError>;
    fn list_versions(&self) -> Result<Vec<ModelVersion>, RegistryError>;

    fn get_artifact(&self, id: &str) -> Result<Option<Artifact>, RegistryError>;
    fn put_artifact(&self, artifact: &Artifact) -> Result<(), RegistryError>;
    fn list_artifacts(&self) -> Result<Vec<Artifact>, RegistryError>;

    fn get_release_pointer(&self, id: &str) -> Result<Option<ReleasePointer>, RegistryError>;
    fn put_release_pointer(&self, pointer: &ReleasePointer) -> Result<(), RegistryError>;
    fn list_release_pointers(&self) -> Result<Vec<ReleasePointer>, RegistryError>;

    /// Upsert `pointer` only while its version is still released.
    fn put_release_pointer_checked(&self, pointer: &ReleasePointer) -> Result<(), RegistryError>;

    /// Mark a released version rolled back at `at_ms`, refusing with
    /// `VERSION_IN_USE` while any pointer references it.
    fn roll_back_version(
        &self,
        tenant_id: &str,
        version_id: &str,
        at_ms: u64,
    ) -> Result<ModelVersion, RegistryError>;

    fn get_update_state(&self, scope_key: &str) -> Result<Option<UpdateState>, RegistryError>;
    fn put_update_state(&self, state: &UpdateState) -> Result<(), RegistryError>;

    /// Reject `incoming` below the persisted maximum, persist it when higher,
    /// and return the committed maximum.
    fn enforce_and_bump_max_seen_version(
        &self,
        scope_key: &str,
        incoming: u64,
    ) -> Result<u64, RegistryError>;

    fn clear_all(&self) -> Result<(), RegistryError>;

    /// Force any buffered writes to durable storage.
    fn flush_now(&self) -> Result<(), RegistryError>;
}

/// Pointer precondition, evaluated by each backend inside its atomic section.
pub(crate) fn check_pointer_target(
    pointer: &ReleasePointer,
    version: Option<&ModelVersion>,
) -> Result<(), RegistryError> {
    let version = version
        .filter(|v| v.tenant_id == pointer.tenant_id)
        .ok_or_else(|| RegistryError::NotFound(format!("version {}", pointer.model_version_id)))?;
    if version.status != VersionStatus::Released {
        return Err(RegistryError::InvalidTransition(format!(
            "version {} is {:?}, pointers require a released version",
            version.id, version.status
        )));
    }
    Ok(())
}

/// Rollback precondition and transition, evaluated inside the atomic section.
pub(crate) fn roll_back_checked<'a>(
    tenant_id: &str,
    version_id: &str,
    version: Option<ModelVersion>,
    mut pointers: impl Iterator<Item = &'a ReleasePointer>,
    at_ms: u64,
) -> Result<ModelVersion, RegistryError> {
    let mut version = version
        .filter(|v| v.tenant_id == tenant_id)
        .ok_or_else(|| RegistryError::NotFound(format!("version {}", version_id)))?;
    if version.status != VersionStatus::Released {
        return Err(RegistryError::InvalidTransition(format!(
            "version {} is {:?}, only released versions roll back",
            version_id, version.status
        )));
    }
    if pointers.any(|p| p.tenant_id == tenant_id && p.model_version_id == version_id) {
        return Err(RegistryError::VersionInUse(version_id.to_string()));
    }
    version.status = VersionStatus::RolledBack;
    version.rolled_back_at = Some(at_ms);
    Ok(version)
}

/// Open the backend named by `config.backend` rooted at `config.data_dir`.
pub fn open_store(config: &RegistryConfig) -> Result<Arc<dyn RegistryStore>, RegistryError> {
    let store: Arc<dyn RegistryStore> = match config.backend {
        BackendKind::File => Arc::new(FileStore::open(config)?),
        BackendKind::Memory => Arc::new(MemoryStore::new()),
        BackendKind::Sqlite => Arc::new(SqliteStore::open(config)?),
    };
    tracing::debug!(backend = ?config.backend, data_dir = %config.data_dir.display(), "store opened");
    Ok(store)
}
