//! Model, version, artifact and release-pointer state transitions.
//!
//! Every lookup is tenant scoped: a record owned by another tenant reads as
//! not found.

use crate::core::error::{Denial, ReasonCode, RegistryError};
use crate::core::gateway::{RegisterBody, SignatureFields};
use crate::core::keys::{KeyResolver, Resolution};
use crate::core::model::{
    Artifact, ArtifactStatus, Model, ModelStatus, ModelVersion, ReleasePointer, VersionStatus,
};
use crate::core::signing;
use crate::core::time;
use crate::registry::Registry;
use crate::store::RegistryStore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterArtifactRequest {
    pub tenant_id: String,
    pub body: RegisterBody,
    #[serde(flatten)]
    pub sig: SignatureFields,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasePointerRequest {
    pub tenant_id: String,
    pub model_id: String,
    pub platform: String,
    pub runtime: String,
    pub version_id: String,
    pub artifact_id: String,
}

/// What a device needs to fetch and check a released artifact.
///
/// `apply_failclosed` is set when the stored provenance signature no longer
/// verifies against its key; the device must refuse to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryView {
    pub model_id: String,
    pub version_id: String,
    pub version: String,
    pub artifact_id: String,
    pub platform: String,
    pub runtime: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub storage_ref: String,
    pub signature: String,
    pub key_id: String,
    pub apply_failclosed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
}

fn not_found(kind: &str, id: &str) -> RegistryError {
    RegistryError::NotFound(format!("{} {}", kind, id))
}

impl<S: RegistryStore + ?Sized> Registry<S> {
    pub(crate) fn load_model(&self, tenant_id: &str, id: &str) -> Result<Model, RegistryError> {
        self.store
            .get_model(id)?
            .filter(|m| m.tenant_id == tenant_id)
            .ok_or_else(|| not_found("model", id))
    }

    pub(crate) fn load_version(
        &self,
        tenant_id: &str,
        id: &str,
    ) -> Result<ModelVersion, RegistryError> {
        self.store
            .get_version(id)?
            .filter(|v| v.tenant_id == tenant_id)
            .ok_or_else(|| not_found("version", id))
    }

    pub(crate) fn load_artifact(&self, tenant_id: &str, id: &str) -> Result<Artifact, RegistryError> {
        self.store
            .get_artifact(id)?
            .filter(|a| a.tenant_id == tenant_id)
            .ok_or_else(|| not_found("artifact", id))
    }

    pub fn create_model(&self, tenant_id: &str, name: &str) -> Result<Model, RegistryError> {
        let now = self.now_ms();
        let model = Model {
            id: time::new_id("model"),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            status: ModelStatus::Draft,
            created_at: now,
            updated_at: now,
        };
        self.store.put_model(&model)?;
        tracing::info!(model_id = %model.id, "model created");
        Ok(model)
    }

    pub fn activate_model(&self, tenant_id: &str, model_id: &str) -> Result<Model, RegistryError> {
        self.transition_model(tenant_id, model_id, ModelStatus::Active)
    }

    pub fn deprecate_model(&self, tenant_id: &str, model_id: &str) -> Result<Model, RegistryError> {
        self.transition_model(tenant_id, model_id, ModelStatus::Deprecated)
    }

    fn transition_model(
        &self,
        tenant_id: &str,
        model_id: &str,
        to: ModelStatus,
    ) -> Result<Model, RegistryError> {
        let mut model = self.load_model(tenant_id, model_id)?;
        let allowed = matches!(
            (model.status, to),
            (ModelStatus::Draft, ModelStatus::Active)
                | (ModelStatus::Draft, ModelStatus::Deprecated)
                | (ModelStatus::Active, ModelStatus::Deprecated)
        );
        if !allowed {
            return Err(RegistryError::InvalidTransition(format!(
                "model {} cannot move from {:?} to {:?}",
                model_id, model.status, to
            )));
        }
        model.status = to;
        model.updated_at = self.now_ms();
        self.store.put_model(&model)?;
        Ok(model)
    }

    pub fn create_version(
        &self,
        tenant_id: &str,
        model_id: &str,
        version: &str,
    ) -> Result<ModelVersion, RegistryError> {
        let model = self.load_model(tenant_id, model_id)?;
        if model.status == ModelStatus::Deprecated {
            return Err(RegistryError::InvalidTransition(format!(
                "model {} is deprecated",
                model_id
            )));
        }
        let v = ModelVersion {
            id: time::new_id("ver"),
            model_id: model.id,
            tenant_id: tenant_id.to_string(),
            version: version.to_string(),
            status: VersionStatus::Draft,
            created_at: self.now_ms(),
            released_at: None,
            rolled_back_at: None,
        };
        self.store.put_version(&v)?;
        Ok(v)
    }

    pub fn release_version(
        &self,
        tenant_id: &str,
        version_id: &str,
    ) -> Result<ModelVersion, RegistryError> {
        let mut v = self.load_version(tenant_id, version_id)?;
        match v.status {
            VersionStatus::Draft => {}
            VersionStatus::Released => {
                return Err(RegistryError::AlreadyReleased(version_id.to_string()));
            }
            VersionStatus::RolledBack => {
                return Err(RegistryError::InvalidTransition(format!(
                    "version {} was rolled back and cannot be released again",
                    version_id
                )));
            }
        }
        v.status = VersionStatus::Released;
        v.released_at = Some(self.now_ms());
        self.store.put_version(&v)?;
        tracing::info!(version_id, version = %v.version, "version released");
        Ok(v)
    }

    /// Retire a released version. Refused while any release pointer still
    /// references it, so pointers only ever reach released versions. The
    /// in-use check and the write are one step against `set_release_pointer`.
    pub fn mark_version_rolled_back(
        &self,
        tenant_id: &str,
        version_id: &str,
    ) -> Result<ModelVersion, RegistryError> {
        self.load_version(tenant_id, version_id)?;
        let v = self
            .store
            .roll_back_version(tenant_id, version_id, self.now_ms())?;
        tracing::warn!(version_id, "version marked rolled back");
        Ok(v)
    }

    /// Verify the signed request, then record the artifact with a provenance
    /// signature from the active signing key.
    pub fn register_artifact(&self, req: &RegisterArtifactRequest) -> Result<Artifact, RegistryError> {
        self.gateway
            .verify_artifact_register(&req.tenant_id, &req.body, &req.sig)
            .inspect_err(|d| {
                tracing::warn!(reason_code = %d.reason_code, "artifact registration denied")
            })?;
        let body = &req.body;
        if body.sha256.trim().is_empty() {
            return Err(Denial::client(ReasonCode::Sha256Missing).into());
        }

        let version = self.load_version(&req.tenant_id, &body.version_id)?;
        if version.model_id != body.model_id {
            return Err(not_found("version", &body.version_id));
        }
        if version.status == VersionStatus::RolledBack {
            return Err(RegistryError::InvalidTransition(format!(
                "version {} was rolled back",
                version.id
            )));
        }

        let key = self.keys.active_signing_key()?;
        let signature = signing::sign_artifact(
            &body.sha256,
            &body.model_id,
            &version.version,
            &body.platform,
            &body.runtime,
            &key.private_key,
        )?;
        let artifact = Artifact {
            id: time::new_id("art"),
            model_version_id: version.id,
            tenant_id: req.tenant_id.clone(),
            platform: body.platform.clone(),
            runtime: body.runtime.clone(),
            sha256: body.sha256.clone(),
            size_bytes: body.size_bytes,
            storage_ref: body.storage_ref.clone(),
            signature,
            key_id: key.key_id,
            status: ArtifactStatus::Uploading,
            created_at: self.now_ms(),
        };
        self.store.put_artifact(&artifact)?;
        tracing::info!(artifact_id = %artifact.id, key_id = %artifact.key_id, "artifact registered");
        Ok(artifact)
    }

    pub fn complete_upload(
        &self,
        tenant_id: &str,
        artifact_id: &str,
        succeeded: bool,
    ) -> Result<Artifact, RegistryError> {
        let mut artifact = self.load_artifact(tenant_id, artifact_id)?;
        if artifact.status != ArtifactStatus::Uploading {
            return Err(RegistryError::InvalidTransition(format!(
                "artifact {} is {:?}, not uploading",
                artifact_id, artifact.status
            )));
        }
        artifact.status = if succeeded {
            ArtifactStatus::Ready
        } else {
            ArtifactStatus::Failed
        };
        self.store.put_artifact(&artifact)?;
        Ok(artifact)
    }

    pub fn set_release_pointer(
        &self,
        req: &ReleasePointerRequest,
    ) -> Result<ReleasePointer, RegistryError> {
        let tenant_id = req.tenant_id.as_str();
        self.load_model(tenant_id, &req.model_id)?;
        let version = self.load_version(tenant_id, &req.version_id)?;
        if version.model_id != req.model_id {
            return Err(not_found("version", &req.version_id));
        }
        if version.status != VersionStatus::Released {
            return Err(RegistryError::InvalidTransition(format!(
                "version {} is {:?}, pointers require a released version",
                version.id, version.status
            )));
        }

        let artifact = self.load_artifact(tenant_id, &req.artifact_id)?;
        if artifact.model_version_id != version.id {
            return Err(RegistryError::InvalidTransition(format!(
                "artifact {} does not belong to version {}",
                artifact.id, version.id
            )));
        }
        if artifact.platform != req.platform || artifact.runtime != req.runtime {
            return Err(RegistryError::InvalidTransition(format!(
                "artifact {} targets {}/{}, not {}/{}",
                artifact.id, artifact.platform, artifact.runtime, req.platform, req.runtime
            )));
        }
        if artifact.status == ArtifactStatus::Failed {
            return Err(RegistryError::InvalidTransition(format!(
                "artifact {} failed upload",
                artifact.id
            )));
        }

        let pointer = ReleasePointer {
            id: ReleasePointer::pointer_id(&req.model_id, &req.platform, &req.runtime),
            model_id: req.model_id.clone(),
            tenant_id: tenant_id.to_string(),
            platform: req.platform.clone(),
            runtime: req.runtime.clone(),
            model_version_id: version.id,
            artifact_id: artifact.id,
            created_at: self.now_ms(),
        };
        // re-checks the version is still released in the same step as the write
        self.store.put_release_pointer_checked(&pointer)?;
        tracing::info!(pointer_id = %pointer.id, artifact_id = %pointer.artifact_id, "release pointer set");
        Ok(pointer)
    }

    pub fn delivery_view(
        &self,
        tenant_id: &str,
        model_id: &str,
        platform: &str,
        runtime: &str,
    ) -> Result<DeliveryView, RegistryError> {
        let pointer_id = ReleasePointer::pointer_id(model_id, platform, runtime);
        let pointer = self
            .store
            .get_release_pointer(&pointer_id)?
            .filter(|p| {
                p.tenant_id == tenant_id
                    && p.model_id == model_id
                    && p.platform == platform
                    && p.runtime == runtime
            })
            .ok_or_else(|| not_found("release pointer", &pointer_id))?;
        let version = self.load_version(tenant_id, &pointer.model_version_id)?;
        let artifact = self.load_artifact(tenant_id, &pointer.artifact_id)?;

        let verified = match KeyResolver::resolve(&*self.keys, &artifact.key_id, self.now_ms()) {
            Resolution::Usable { public_key } => signing::verify_artifact(
                &artifact.sha256,
                &pointer.model_id,
                &version.version,
                &artifact.platform,
                &artifact.runtime,
                &artifact.signature,
                &public_key,
            ),
            _ => false,
        };
        if !verified {
            tracing::warn!(
                artifact_id = %artifact.id,
                key_id = %artifact.key_id,
                "stored provenance does not verify; delivery fails closed"
            );
        }
        Ok(DeliveryView {
            model_id: pointer.model_id,
            version_id: version.id,
            version: version.version,
            artifact_id: artifact.id,
            platform: artifact.platform,
            runtime: artifact.runtime,
            sha256: artifact.sha256,
            size_bytes: artifact.size_bytes,
            storage_ref: artifact.storage_ref,
            signature: artifact.signature,
            key_id: artifact.key_id,
            apply_failclosed: !verified,
            reason_code: (!verified).then_some(ReasonCode::SignatureInvalidFailclosed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::AuditTrail;
    use crate::core::canonical::Operation;
    use crate::core::gateway::sign_request;
    use crate::core::keys::{KeyRing, KeyState};
    use crate::core::lock::LockOptions;
    use crate::core::persist::Persistence;
    use crate::core::time::FixedClock;
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    const NOW: u64 = 1_800_000_000_000;

    struct Fixture {
        _tmp: TempDir,
        registry: Registry<MemoryStore>,
        caller_key: String,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let keys = Arc::new(KeyRing::new());
        keys.rotate(NOW, 0).unwrap();
        let caller = signing::generate_keypair();
        keys.register_public("caller", &caller.public_key, KeyState::Active, NOW)
            .unwrap();
        let persist = Persistence::new(tmp.path(), LockOptions::default()).unwrap();
        let registry = Registry::new(
            Arc::new(MemoryStore::new()),
            keys,
            AuditTrail::new(persist, 1_000_000, 14),
            Arc::new(FixedClock::new(NOW)),
        );
        Fixture {
            _tmp: tmp,
            registry,
            caller_key: caller.private_key,
        }
    }

    fn register(f: &Fixture, model_id: &str, version_id: &str) -> Result<Artifact, RegistryError> {
        register_for(f, model_id, version_id, "android", "tflite")
    }

    fn register_for(
        f: &Fixture,
        model_id: &str,
        version_id: &str,
        platform: &str,
        runtime: &str,
    ) -> Result<Artifact, RegistryError> {
        let body = RegisterBody {
            model_id: model_id.into(),
            version_id: version_id.into(),
            platform: platform.into(),
            runtime: runtime.into(),
            sha256: "ab".repeat(32),
            size_bytes: 2048,
            storage_ref: "blob://models/a".into(),
        };
        let sig = sign_request(Operation::ArtifactRegister, "t1", NOW, &body, "caller", &f.caller_key)
            .unwrap();
        f.registry.register_artifact(&RegisterArtifactRequest {
            tenant_id: "t1".into(),
            body,
            sig,
        })
    }

    #[test]
    fn model_status_only_moves_forward() {
        let f = fixture();
        let m = f.registry.create_model("t1", "detector").unwrap();
        assert_eq!(m.status, ModelStatus::Draft);
        assert_eq!(f.registry.activate_model("t1", &m.id).unwrap().status, ModelStatus::Active);
        assert_eq!(
            f.registry.deprecate_model("t1", &m.id).unwrap().status,
            ModelStatus::Deprecated
        );
        assert!(matches!(
            f.registry.activate_model("t1", &m.id),
            Err(RegistryError::InvalidTransition(_))
        ));
        assert!(matches!(
            f.registry.create_version("t1", &m.id, "1.0.0"),
            Err(RegistryError::InvalidTransition(_))
        ));
    }

    #[test]
    fn second_release_is_refused() {
        let f = fixture();
        let m = f.registry.create_model("t1", "detector").unwrap();
        let v = f.registry.create_version("t1", &m.id, "1.0.0").unwrap();
        let released = f.registry.release_version("t1", &v.id).unwrap();
        assert_eq!(released.released_at, Some(NOW));
        assert!(matches!(
            f.registry.release_version("t1", &v.id),
            Err(RegistryError::AlreadyReleased(_))
        ));
    }

    #[test]
    fn other_tenants_see_nothing() {
        let f = fixture();
        let m = f.registry.create_model("t1", "detector").unwrap();
        assert!(matches!(
            f.registry.create_version("t2", &m.id, "1.0.0"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn artifact_carries_verifiable_provenance() {
        let f = fixture();
        let m = f.registry.create_model("t1", "detector").unwrap();
        let v = f.registry.create_version("t1", &m.id, "1.0.0").unwrap();
        let a = register(&f, &m.id, &v.id).unwrap();
        assert_eq!(a.status, ArtifactStatus::Uploading);

        let key = f.registry.keys().active_signing_key().unwrap();
        assert_eq!(a.key_id, key.key_id);
        assert!(signing::verify_artifact(
            &a.sha256, &m.id, "1.0.0", "android", "tflite", &a.signature, &key.public_key
        ));
    }

    #[test]
    fn upload_completes_once() {
        let f = fixture();
        let m = f.registry.create_model("t1", "detector").unwrap();
        let v = f.registry.create_version("t1", &m.id, "1.0.0").unwrap();
        let a = register(&f, &m.id, &v.id).unwrap();
        let done = f.registry.complete_upload("t1", &a.id, true).unwrap();
        assert_eq!(done.status, ArtifactStatus::Ready);
        assert!(matches!(
            f.registry.complete_upload("t1", &a.id, false),
            Err(RegistryError::InvalidTransition(_))
        ));
    }

    #[test]
    fn pointer_requires_release_and_pins_version() {
        let f = fixture();
        let m = f.registry.create_model("t1", "detector").unwrap();
        let v = f.registry.create_version("t1", &m.id, "1.0.0").unwrap();
        let a = register(&f, &m.id, &v.id).unwrap();
        let req = ReleasePointerRequest {
            tenant_id: "t1".into(),
            model_id: m.id.clone(),
            platform: "android".into(),
            runtime: "tflite".into(),
            version_id: v.id.clone(),
            artifact_id: a.id.clone(),
        };
        assert!(matches!(
            f.registry.set_release_pointer(&req),
            Err(RegistryError::InvalidTransition(_))
        ));

        f.registry.release_version("t1", &v.id).unwrap();
        f.registry.set_release_pointer(&req).unwrap();
        assert!(matches!(
            f.registry.mark_version_rolled_back("t1", &v.id),
            Err(RegistryError::VersionInUse(_))
        ));

        let mut wrong_runtime = req.clone();
        wrong_runtime.runtime = "coreml".into();
        assert!(f.registry.set_release_pointer(&wrong_runtime).is_err());
    }

    fn released_with_pointer(f: &Fixture, platform: &str, runtime: &str) -> (Model, Artifact) {
        let m = f.registry.create_model("t1", "detector").unwrap();
        let v = f.registry.create_version("t1", &m.id, "1.0.0").unwrap();
        let a = register_for(f, &m.id, &v.id, platform, runtime).unwrap();
        f.registry.complete_upload("t1", &a.id, true).unwrap();
        f.registry.release_version("t1", &v.id).unwrap();
        f.registry
            .set_release_pointer(&ReleasePointerRequest {
                tenant_id: "t1".into(),
                model_id: m.id.clone(),
                platform: platform.into(),
                runtime: runtime.into(),
                version_id: v.id,
                artifact_id: a.id.clone(),
            })
            .unwrap();
        (m, a)
    }

    #[test]
    fn intact_provenance_is_applicable() {
        let f = fixture();
        let (m, _) = released_with_pointer(&f, "android", "tflite");
        let view = f.registry.delivery_view("t1", &m.id, "android", "tflite").unwrap();
        assert!(!view.apply_failclosed);
        assert_eq!(view.reason_code, None);
    }

    #[test]
    fn tampered_digest_fails_closed_in_view() {
        let f = fixture();
        let (m, mut a) = released_with_pointer(&f, "android", "tflite");
        a.sha256 = "cd".repeat(32);
        f.registry.store().put_artifact(&a).unwrap();

        let view = f.registry.delivery_view("t1", &m.id, "android", "tflite").unwrap();
        assert!(view.apply_failclosed);
        assert_eq!(view.reason_code, Some(ReasonCode::SignatureInvalidFailclosed));
    }

    #[test]
    fn revoked_provenance_key_fails_closed_in_view() {
        let f = fixture();
        let (m, a) = released_with_pointer(&f, "android", "tflite");
        f.registry.keys().revoke(&a.key_id).unwrap();

        let view = f.registry.delivery_view("t1", &m.id, "android", "tflite").unwrap();
        assert!(view.apply_failclosed);
        assert_eq!(view.reason_code, Some(ReasonCode::SignatureInvalidFailclosed));
    }

    #[test]
    fn colon_bearing_targets_get_distinct_pointers() {
        let f = fixture();
        let m = f.registry.create_model("t1", "detector").unwrap();
        let v = f.registry.create_version("t1", &m.id, "1.0.0").unwrap();
        let left = register_for(&f, &m.id, &v.id, "a:b", "c").unwrap();
        let right = register_for(&f, &m.id, &v.id, "a", "b:c").unwrap();
        f.registry.release_version("t1", &v.id).unwrap();
        for (a, platform, runtime) in [(&left, "a:b", "c"), (&right, "a", "b:c")] {
            f.registry
                .set_release_pointer(&ReleasePointerRequest {
                    tenant_id: "t1".into(),
                    model_id: m.id.clone(),
                    platform: platform.into(),
                    runtime: runtime.into(),
                    version_id: v.id.clone(),
                    artifact_id: a.id.clone(),
                })
                .unwrap();
        }
        assert_eq!(f.registry.store().list_release_pointers().unwrap().len(), 2);

        let l = f.registry.delivery_view("t1", &m.id, "a:b", "c").unwrap();
        let r = f.registry.delivery_view("t1", &m.id, "a", "b:c").unwrap();
        assert_eq!(l.artifact_id, left.id);
        assert_eq!(r.artifact_id, right.id);
        assert!(!l.apply_failclosed && !r.apply_failclosed);
    }

    #[test]
    fn pointer_fields_must_match_the_request() {
        let f = fixture();
        let (m, _) = released_with_pointer(&f, "android", "tflite");
        let mut stored = f
            .registry
            .store()
            .get_release_pointer(&ReleasePointer::pointer_id(&m.id, "android", "tflite"))
            .unwrap()
            .unwrap();
        stored.runtime = "coreml".into();
        f.registry.store().put_release_pointer(&stored).unwrap();

        assert!(matches!(
            f.registry.delivery_view("t1", &m.id, "android", "tflite"),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn unsigned_registration_is_denied_before_lookup() {
        let f = fixture();
        let req = RegisterArtifactRequest {
            tenant_id: "t1".into(),
            body: RegisterBody {
                model_id: "missing".into(),
                version_id: "missing".into(),
                platform: "android".into(),
                runtime: "tflite".into(),
                sha256: String::new(),
                size_bytes: 0,
                storage_ref: String::new(),
            },
            sig: SignatureFields::default(),
        };
        let err = f.registry.register_artifact(&req).unwrap_err();
        assert_eq!(err.reason_code(), ReasonCode::SignatureMissing);
    }
}
