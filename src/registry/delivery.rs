//! Signed delivery apply and rollback.
//!
//! Each call writes exactly one audit record, ALLOW or DENY, before it
//! returns. If that record cannot be written the call fails.

use crate::core::anti_rollback;
use crate::core::audit::{AuditAction, AuditEvent};
use crate::core::error::{Denial, ReasonCode, RegistryError};
use crate::core::gateway::{ApplyBody, RollbackBody, SignatureFields};
use crate::core::model::Artifact;
use crate::registry::Registry;
use crate::store::RegistryStore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplyRequest {
    pub tenant_id: String,
    pub body: ApplyBody,
    #[serde(flatten)]
    pub sig: SignatureFields,
    /// Unsigned freshness bound; `None` never expires.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub tenant_id: String,
    pub body: RollbackBody,
    #[serde(flatten)]
    pub sig: SignatureFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Applied {
    pub artifact_id: String,
    pub sha256: String,
    /// Persisted maximum update version for the scope after this apply.
    pub max_seen_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolledBack {
    pub artifact_id: String,
    pub reason_code: String,
}

impl<S: RegistryStore + ?Sized> Registry<S> {
    pub fn apply_delivery(&self, req: &ApplyRequest) -> Result<Applied, RegistryError> {
        let outcome = self.try_apply(req);
        let now = self.now_ms();
        let key_id = req.sig.key_id.as_deref();
        let event = match &outcome {
            Ok(applied) => AuditEvent::allow(now, AuditAction::Apply)
                .with_key(key_id)
                .with_sha256(Some(&applied.sha256)),
            Err(e) => AuditEvent::deny(now, AuditAction::Apply, e.reason_code())
                .with_key(key_id)
                .with_sha256(Some(&req.body.sha256)),
        };
        self.record(&event, &outcome)?;
        outcome
    }

    fn try_apply(&self, req: &ApplyRequest) -> Result<Applied, RegistryError> {
        let body = &req.body;
        self.gateway
            .verify_delivery_apply(&req.tenant_id, body, &req.sig, req.expires_at)?;
        if body.sha256.trim().is_empty() {
            return Err(Denial::client(ReasonCode::Sha256Missing).into());
        }

        let artifact = self.delivery_artifact(
            &req.tenant_id,
            &body.model_id,
            &body.version_id,
            &body.artifact_id,
        )?;
        // The signature covers the caller's sha256; it must also be the one we stored.
        if artifact.sha256 != body.sha256 {
            return Err(Denial::forbidden(ReasonCode::SignatureInvalid).into());
        }

        let scope = anti_rollback::scope_key(&req.tenant_id, &body.model_id);
        let max_seen_version = self
            .store
            .enforce_and_bump_max_seen_version(&scope, body.update_version)?;
        tracing::info!(
            artifact_id = %artifact.id,
            scope_key = %scope,
            max_seen_version,
            "delivery applied"
        );
        Ok(Applied {
            artifact_id: artifact.id,
            sha256: artifact.sha256,
            max_seen_version,
        })
    }

    pub fn rollback_delivery(&self, req: &RollbackRequest) -> Result<RolledBack, RegistryError> {
        let outcome = self.try_rollback(req);
        let now = self.now_ms();
        let key_id = req.sig.key_id.as_deref();
        let event = match &outcome {
            Ok(_) => AuditEvent::allow(now, AuditAction::Rollback),
            Err(e) => AuditEvent::deny(now, AuditAction::Rollback, e.reason_code()),
        }
        .with_key(key_id);
        self.record(&event, &outcome)?;
        outcome
    }

    fn try_rollback(&self, req: &RollbackRequest) -> Result<RolledBack, RegistryError> {
        let body = &req.body;
        self.gateway
            .verify_delivery_rollback(&req.tenant_id, body, &req.sig)?;
        if body.reason_code.trim().is_empty() {
            return Err(Denial::client(ReasonCode::CanonicalPayloadInvalid).into());
        }
        let artifact = self.delivery_artifact(
            &req.tenant_id,
            &body.model_id,
            &body.version_id,
            &body.artifact_id,
        )?;
        tracing::warn!(
            artifact_id = %artifact.id,
            reason = %body.reason_code,
            "delivery rolled back"
        );
        Ok(RolledBack {
            artifact_id: artifact.id,
            reason_code: body.reason_code.clone(),
        })
    }

    /// The artifact must hang off the signed version, and that version off the
    /// signed model; the anti-rollback scope is keyed by the model.
    fn delivery_artifact(
        &self,
        tenant_id: &str,
        model_id: &str,
        version_id: &str,
        artifact_id: &str,
    ) -> Result<Artifact, RegistryError> {
        let artifact = self.load_artifact(tenant_id, artifact_id)?;
        if artifact.model_version_id != version_id {
            return Err(RegistryError::NotFound(format!(
                "artifact {} under version {}",
                artifact_id, version_id
            )));
        }
        let version = self.load_version(tenant_id, &artifact.model_version_id)?;
        if version.model_id != model_id {
            return Err(RegistryError::NotFound(format!(
                "version {} under model {}",
                version_id, model_id
            )));
        }
        Ok(artifact)
    }

    fn record<T>(
        &self,
        event: &AuditEvent,
        outcome: &Result<T, RegistryError>,
    ) -> Result<(), RegistryError> {
        if let Err(e) = outcome {
            tracing::warn!(action = ?event.action, reason_code = %e.reason_code(), error = %e, "delivery denied");
        }
        self.audit.append(event).inspect_err(|audit_err| {
            tracing::error!(action = ?event.action, error = %audit_err, "audit append failed; failing the request");
        })
    }
}
