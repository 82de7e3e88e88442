//! Fail-closed verification gateway.
//!
//! Every signed operation passes the same ordered checks; the first failure
//! wins and nothing after it runs:
//!
//! 1. `signature`, `sig_alg`, `key_id` present        -> `SIGNATURE_MISSING`
//! 2. `ts_ms` present                                -> `CANONICAL_PAYLOAD_INVALID`
//! 3. apply only: `expires_at` not in the past       -> `SIGNATURE_EXPIRED`
//! 4. `key_id` resolves to a usable key              -> `KEY_ID_UNKNOWN` / `KEY_REVOKED` / `KEY_GRACE_EXPIRED`
//! 5. canonical payload verifies under that key      -> `SIGNATURE_INVALID`

use crate::core::canonical::{self, Operation};
use crate::core::error::{Denial, ReasonCode};
use crate::core::keys::{KeyResolver, Resolution};
use crate::core::signing::{self, SIG_ALG_ED25519};
use crate::core::time::Clock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Signature material accompanying a request. Every field is optional on the
/// wire; absence is decided here, never upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureFields {
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub sig_alg: Option<String>,
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub ts_ms: Option<u64>,
}

impl SignatureFields {
    pub fn signed(signature: String, key_id: &str, ts_ms: u64) -> Self {
        Self {
            signature: Some(signature),
            sig_alg: Some(SIG_ALG_ED25519.to_string()),
            key_id: Some(key_id.to_string()),
            ts_ms: Some(ts_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBody {
    pub model_id: String,
    pub version_id: String,
    pub platform: String,
    pub runtime: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub storage_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub device_class: String,
    pub min_app_version: String,
}

impl Default for DeliveryTarget {
    fn default() -> Self {
        Self {
            device_class: "default".to_string(),
            min_app_version: "1.0.0".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyBody {
    pub model_id: String,
    pub version_id: String,
    pub artifact_id: String,
    pub sha256: String,
    pub target: DeliveryTarget,
    /// Monotonic update number checked by anti-rollback enforcement.
    pub update_version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackBody {
    pub model_id: String,
    pub version_id: String,
    pub artifact_id: String,
    pub reason_code: String,
}

#[derive(Clone)]
pub struct Gateway {
    resolver: Arc<dyn KeyResolver>,
    clock: Arc<dyn Clock>,
}

impl Gateway {
    pub fn new(resolver: Arc<dyn KeyResolver>, clock: Arc<dyn Clock>) -> Self {
        Self { resolver, clock }
    }

    pub fn verify_artifact_register(
        &self,
        tenant_id: &str,
        body: &RegisterBody,
        sig: &SignatureFields,
    ) -> Result<(), Denial> {
        self.check(Operation::ArtifactRegister, tenant_id, body, sig, None)
    }

    pub fn verify_delivery_apply(
        &self,
        tenant_id: &str,
        body: &ApplyBody,
        sig: &SignatureFields,
        expires_at: Option<u64>,
    ) -> Result<(), Denial> {
        self.check(Operation::DeliveryApply, tenant_id, body, sig, expires_at)
    }

    pub fn verify_delivery_rollback(
        &self,
        tenant_id: &str,
        body: &RollbackBody,
        sig: &SignatureFields,
    ) -> Result<(), Denial> {
        self.check(Operation::DeliveryRollback, tenant_id, body, sig, None)
    }

    fn check<B: Serialize>(
        &self,
        op: Operation,
        tenant_id: &str,
        body: &B,
        sig: &SignatureFields,
        expires_at: Option<u64>,
    ) -> Result<(), Denial> {
        let (Some(signature), Some(sig_alg), Some(key_id)) = (
            present(&sig.signature),
            present(&sig.sig_alg),
            present(&sig.key_id),
        ) else {
            return Err(Denial::client(ReasonCode::SignatureMissing));
        };

        let Some(ts_ms) = sig.ts_ms else {
            return Err(Denial::client(ReasonCode::CanonicalPayloadInvalid));
        };

        let now = self.clock.now_ms();
        if let Some(exp) = expires_at {
            if exp < now {
                return Err(Denial::forbidden(ReasonCode::SignatureExpired));
            }
        }

        let public_key = match self.resolver.resolve(key_id, now) {
            Resolution::Usable { public_key } => public_key,
            Resolution::Unknown => return Err(Denial::client(ReasonCode::KeyIdUnknown)),
            Resolution::Revoked => return Err(Denial::forbidden(ReasonCode::KeyRevoked)),
            Resolution::GraceExpired => {
                return Err(Denial::forbidden(ReasonCode::KeyGraceExpired));
            }
        };

        if !sig_alg.eq_ignore_ascii_case(SIG_ALG_ED25519) {
            return Err(Denial::forbidden(ReasonCode::SignatureInvalid));
        }

        let body = serde_json::to_value(body)
            .map_err(|_| Denial::client(ReasonCode::CanonicalPayloadInvalid))?;
        let payload = canonical::canonical_bytes(op, tenant_id, ts_ms, &body)
            .map_err(|_| Denial::client(ReasonCode::CanonicalPayloadInvalid))?;
        if !signing::verify(&payload, signature, &public_key) {
            return Err(Denial::forbidden(ReasonCode::SignatureInvalid));
        }
        Ok(())
    }
}

fn present(v: &Option<String>) -> Option<&str> {
    v.as_deref().filter(|s| !s.trim().is_empty())
}

/// Sign `body` for `op` the way a caller must. Used by clients and tests.
pub fn sign_request<B: Serialize>(
    op: Operation,
    tenant_id: &str,
    ts_ms: u64,
    body: &B,
    key_id: &str,
    private_key: &str,
) -> Result<SignatureFields, crate::core::error::RegistryError> {
    let value: Value = serde_json::to_value(body)?;
    let payload = canonical::canonical_bytes(op, tenant_id, ts_ms, &value)?;
    let signature = signing::sign(&payload, private_key)?;
    Ok(SignatureFields::signed(signature, key_id, ts_ms))
}
