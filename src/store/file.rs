//! File-backed store: one JSON document per entity collection.
//!
//! Entity collections sit behind write-buffering `PersistMap`s. Update states
//! never do: every anti-rollback check re-reads `update_states.json` under its
//! file lock, so two processes sharing a data directory still serialize.
//!
//! Pointer updates and version rollbacks hold the `release_guard` lock and
//! decide against the documents on disk, not the in-process buffers.

use crate::core::anti_rollback::{self, Bump};
use crate::core::config::{BackendKind, RegistryConfig};
use crate::core::error::RegistryError;
use crate::core::model::{Artifact, Model, ModelVersion, ReleasePointer, UpdateState};
use crate::core::persist::{Mutation, Persistence};
use crate::core::persist_map::PersistMap;
use crate::core::time;
use crate::store::{
    self, ARTIFACTS, MODEL_VERSIONS, MODELS, RELEASE_POINTERS, RegistryStore, UPDATE_STATES,
};
use std::collections::BTreeMap;
use std::time::Duration;

type StateDoc = BTreeMap<String, UpdateState>;

const RELEASE_GUARD: &str = "release_guard";

pub struct FileStore {
    persist: Persistence,
    models: PersistMap<Model>,
    versions: PersistMap<ModelVersion>,
    artifacts: PersistMap<Artifact>,
    pointers: PersistMap<ReleasePointer>,
}

impl FileStore {
    pub fn new(persist: Persistence, debounce: Duration) -> Self {
        Self {
            models: PersistMap::new(persist.clone(), MODELS, debounce),
            versions: PersistMap::new(persist.clone(), MODEL_VERSIONS, debounce),
            artifacts: PersistMap::new(persist.clone(), ARTIFACTS, debounce),
            pointers: PersistMap::new(persist.clone(), RELEASE_POINTERS, debounce),
            persist,
        }
    }

    pub fn open(config: &RegistryConfig) -> Result<Self, RegistryError> {
        Ok(Self::new(
            Persistence::from_config(config)?,
            config.flush_debounce(),
        ))
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persist
    }

    // Flush our own buffered writes, then read what every handle has written.
    fn durable_doc<V>(&self, map: &PersistMap<V>) -> Result<BTreeMap<String, V>, RegistryError>
    where
        V: Clone + serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
    {
        map.flush_now()?;
        Ok(self.persist.read_json(map.name())?.unwrap_or_default())
    }
}

impl RegistryStore for FileStore {
    fn kind(&self) -> BackendKind {
        BackendKind::File
    }

    fn get_model(&self, id: &str) -> Result<Option<Model>, RegistryError> {
        self.models.get(id)
    }

    fn put_model(&self, model: &Model) -> Result<(), RegistryError> {
        self.models.insert(&model.id, model.clone())
    }

    fn list_models(&self) -> Result<Vec<Model>, RegistryError> {
        self.models.values()
    }

    fn get_version(&self, id: &str) -> Result<Option<ModelVersion>, RegistryError> {
        self.versions.get(id)
    }

    fn put_version(&self, version: &ModelVersion) -> Result<(), RegistryError> {
        self.versions.insert(&version.id, version.clone())
    }

    fn list_versions(&self) -> Result<Vec<ModelVersion>, RegistryError> {
        self.versions.values()
    }

    fn get_artifact(&self, id: &str) -> Result<Option<Artifact>, RegistryError> {
        self.artifacts.get(id)
    }

    fn put_artifact(&self, artifact: &Artifact) -> Result<(), RegistryError> {
        self.artifacts.insert(&artifact.id, artifact.clone())
    }

    fn list_artifacts(&self) -> Result<Vec<Artifact>, RegistryError> {
        self.artifacts.values()
    }

    fn get_release_pointer(&self, id: &str) -> Result<Option<ReleasePointer>, RegistryError> {
        self.pointers.get(id)
    }

    fn put_release_pointer(&self, pointer: &ReleasePointer) -> Result<(), RegistryError> {
        self.pointers.insert(&pointer.id, pointer.clone())
    }

    fn list_release_pointers(&self) -> Result<Vec<ReleasePointer>, RegistryError> {
        self.pointers.values()
    }

    fn put_release_pointer_checked(&self, pointer: &ReleasePointer) -> Result<(), RegistryError> {
        self.persist.with_lock(RELEASE_GUARD, || {
            let versions = self.durable_doc(&self.versions)?;
            store::check_pointer_target(pointer, versions.get(&pointer.model_version_id))?;
            self.pointers.insert(&pointer.id, pointer.clone())?;
            self.pointers.flush_now()
        })
    }

    fn roll_back_version(
        &self,
        tenant_id: &str,
        version_id: &str,
        at_ms: u64,
    ) -> Result<ModelVersion, RegistryError> {
        self.persist.with_lock(RELEASE_GUARD, || {
            let mut versions = self.durable_doc(&self.versions)?;
            let pointers = self.durable_doc(&self.pointers)?;
            let rolled = store::roll_back_checked(
                tenant_id,
                version_id,
                versions.remove(version_id),
                pointers.values(),
                at_ms,
            )?;
            self.versions.insert(&rolled.id, rolled.clone())?;
            self.versions.flush_now()?;
            Ok(rolled)
        })
    }

    fn get_update_state(&self, scope_key: &str) -> Result<Option<UpdateState>, RegistryError> {
        let doc: Option<StateDoc> = self.persist.read_json(UPDATE_STATES)?;
        Ok(doc.and_then(|mut d| d.remove(scope_key)))
    }

    fn put_update_state(&self, state: &UpdateState) -> Result<(), RegistryError> {
        self.persist.update_json(UPDATE_STATES, |doc: &mut StateDoc| {
            doc.insert(state.scope_key.clone(), state.clone());
            Ok(Mutation::Write(()))
        })
    }

    fn enforce_and_bump_max_seen_version(
        &self,
        scope_key: &str,
        incoming: u64,
    ) -> Result<u64, RegistryError> {
        self.persist.update_json(UPDATE_STATES, |doc: &mut StateDoc| {
            let current = doc.get(scope_key).map(|s| s.max_seen_version);
            match anti_rollback::decide(scope_key, current, incoming)? {
                Bump::Unchanged(v) => Ok(Mutation::Keep(v)),
                Bump::Advance(v) => {
                    doc.insert(
                        scope_key.to_string(),
                        UpdateState {
                            scope_key: scope_key.to_string(),
                            max_seen_version: v,
                            updated_at: time::now_ms(),
                        },
                    );
                    Ok(Mutation::Write(v))
                }
            }
        })
    }

    fn clear_all(&self) -> Result<(), RegistryError> {
        self.models.clear()?;
        self.versions.clear()?;
        self.artifacts.clear()?;
        self.pointers.clear()?;
        self.persist.write_json(UPDATE_STATES, &StateDoc::new())?;
        self.flush_now()
    }

    fn flush_now(&self) -> Result<(), RegistryError> {
        self.models.flush_now()?;
        self.versions.flush_now()?;
        self.artifacts.flush_now()?;
        self.pointers.flush_now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lock::LockOptions;
    use crate::core::model::ModelStatus;
    use tempfile::tempdir;

    fn model(id: &str) -> Model {
        Model {
            id: id.into(),
            tenant_id: "t1".into(),
            name: "detector".into(),
            status: ModelStatus::Draft,
            created_at: 1,
            updated_at: 1,
        }
    }

    #[test]
    fn buffered_entities_survive_reopen_after_flush() {
        let tmp = tempdir().unwrap();
        {
            let p = Persistence::new(tmp.path(), LockOptions::default()).unwrap();
            let store = FileStore::new(p, Duration::from_secs(60));
            store.put_model(&model("m1")).unwrap();
            store.flush_now().unwrap();
        }
        let p = Persistence::new(tmp.path(), LockOptions::default()).unwrap();
        let store = FileStore::new(p, Duration::from_secs(60));
        assert_eq!(store.get_model("m1").unwrap(), Some(model("m1")));
    }

    #[test]
    fn two_handles_share_update_states_without_buffering() {
        let tmp = tempdir().unwrap();
        let a = FileStore::new(
            Persistence::new(tmp.path(), LockOptions::default()).unwrap(),
            Duration::from_secs(60),
        );
        let b = FileStore::new(
            Persistence::new(tmp.path(), LockOptions::default()).unwrap(),
            Duration::from_secs(60),
        );
        assert_eq!(a.enforce_and_bump_max_seen_version("t:m", 3).unwrap(), 3);
        assert!(matches!(
            b.enforce_and_bump_max_seen_version("t:m", 2),
            Err(RegistryError::AntiRollbackViolation { current: 3, .. })
        ));
        assert_eq!(b.get_update_state("t:m").unwrap().unwrap().max_seen_version, 3);
    }

    #[test]
    fn rollback_sees_pointer_written_by_another_handle() {
        use crate::core::model::VersionStatus;

        let tmp = tempdir().unwrap();
        let open = || {
            FileStore::new(
                Persistence::new(tmp.path(), LockOptions::default()).unwrap(),
                Duration::from_secs(60),
            )
        };
        let a = open();
        let b = open();
        let v = ModelVersion {
            id: "v1".into(),
            model_id: "m1".into(),
            tenant_id: "t1".into(),
            version: "1.0.0".into(),
            status: VersionStatus::Released,
            created_at: 1,
            released_at: Some(2),
            rolled_back_at: None,
        };
        a.put_version(&v).unwrap();
        a.flush_now().unwrap();

        let pointer = ReleasePointer {
            id: ReleasePointer::pointer_id("m1", "android", "tflite"),
            model_id: "m1".into(),
            tenant_id: "t1".into(),
            platform: "android".into(),
            runtime: "tflite".into(),
            model_version_id: "v1".into(),
            artifact_id: "a1".into(),
            created_at: 3,
        };
        b.put_release_pointer_checked(&pointer).unwrap();
        // a's pointer buffer is stale; the guard reads the document instead
        assert!(matches!(
            a.roll_back_version("t1", "v1", 4),
            Err(RegistryError::VersionInUse(_))
        ));
    }
}
