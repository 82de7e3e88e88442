//! In-process backend. One mutex guards every table, which also makes the
//! anti-rollback compare-and-bump atomic.

use crate::core::anti_rollback::{self, Bump};
use crate::core::config::BackendKind;
use crate::core::error::RegistryError;
use crate::core::model::{Artifact, Model, ModelVersion, ReleasePointer, UpdateState};
use crate::core::time;
use crate::store::{self, RegistryStore};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Tables {
    models: BTreeMap<String, Model>,
    versions: BTreeMap<String, ModelVersion>,
    artifacts: BTreeMap<String, Artifact>,
    pointers: BTreeMap<String, ReleasePointer>,
    update_states: BTreeMap<String, UpdateState>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, RegistryError> {
        self.tables
            .lock()
            .map_err(|_| RegistryError::Poisoned("memory store".into()))
    }
}

impl RegistryStore for MemoryStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn get_model(&self, id: &str) -> Result<Option<Model>, RegistryError> {
        Ok(self.tables()?.models.get(id).cloned())
    }

    fn put_model(&self, model: &Model) -> Result<(), RegistryError> {
        self.tables()?.models.insert(model.id.clone(), model.clone());
        Ok(())
    }

    fn list_models(&self) -> Result<Vec<Model>, RegistryError> {
        Ok(self.tables()?.models.values().cloned().collect())
    }

    fn get_version(&self, id: &str) -> Result<Option<ModelVersion>, RegistryError> {
        Ok(self.tables()?.versions.get(id).cloned())
    }

    fn put_version(&self, version: &ModelVersion) -> Result<(), RegistryError> {
        self.tables()?
            .versions
            .insert(version.id.clone(), version.clone());
        Ok(())
    }

    fn list_versions(&self) -> Result<Vec<ModelVersion>, RegistryError> {
        Ok(self.tables()?.versions.values().cloned().collect())
    }

    fn get_artifact(&self, id: &str) -> Result<Option<Artifact>, RegistryError> {
        Ok(self.tables()?.artifacts.get(id).cloned())
    }

    fn put_artifact(&self, artifact: &Artifact) -> Result<(), RegistryError> {
        self.tables()?
            .artifacts
            .insert(artifact.id.clone(), artifact.clone());
        Ok(())
    }

    fn list_artifacts(&self) -> Result<Vec<Artifact>, RegistryError> {
        Ok(self.tables()?.artifacts.values().cloned().collect())
    }

    fn get_release_pointer(&self, id: &str) -> Result<Option<ReleasePointer>, RegistryError> {
        Ok(self.tables()?.pointers.get(id).cloned())
    }

    fn put_release_pointer(&self, pointer: &ReleasePointer) -> Result<(), RegistryError> {
        self.tables()?
            .pointers
            .insert(pointer.id.clone(), pointer.clone());
        Ok(())
    }

    fn list_release_pointers(&self) -> Result<Vec<ReleasePointer>, RegistryError> {
        Ok(self.tables()?.pointers.values().cloned().collect())
    }

    fn put_release_pointer_checked(&self, pointer: &ReleasePointer) -> Result<(), RegistryError> {
        let mut tables = self.tables()?;
        store::check_pointer_target(pointer, tables.versions.get(&pointer.model_version_id))?;
        tables.pointers.insert(pointer.id.clone(), pointer.clone());
        Ok(())
    }

    fn roll_back_version(
        &self,
        tenant_id: &str,
        version_id: &str,
        at_ms: u64,
    ) -> Result<ModelVersion, RegistryError> {
        let mut tables = self.tables()?;
        let rolled = store::roll_back_checked(
            tenant_id,
            version_id,
            tables.versions.get(version_id).cloned(),
            tables.pointers.values(),
            at_ms,
        )?;
        tables.versions.insert(rolled.id.clone(), rolled.clone());
        Ok(rolled)
    }

    fn get_update_state(&self, scope_key: &str) -> Result<Option<UpdateState>, RegistryError> {
        Ok(self.tables()?.update_states.get(scope_key).cloned())
    }

    fn put_update_state(&self, state: &UpdateState) -> Result<(), RegistryError> {
        self.tables()?
            .update_states
            .insert(state.scope_key.clone(), state.clone());
        Ok(())
    }

    fn enforce_and_bump_max_seen_version(
        &self,
        scope_key: &str,
        incoming: u64,
    ) -> Result<u64, RegistryError> {
        let mut tables = self.tables()?;
        let current = tables
            .update_states
            .get(scope_key)
            .map(|s| s.max_seen_version);
        let bump = anti_rollback::decide(scope_key, current, incoming)?;
        if let Bump::Advance(v) = bump {
            tables.update_states.insert(
                scope_key.to_string(),
                UpdateState {
                    scope_key: scope_key.to_string(),
                    max_seen_version: v,
                    updated_at: time::now_ms(),
                },
            );
        }
        Ok(bump.committed())
    }

    fn clear_all(&self) -> Result<(), RegistryError> {
        *self.tables()? = Tables::default();
        Ok(())
    }

    fn flush_now(&self) -> Result<(), RegistryError> {
        Ok(())
    }
}
