//! Key directory: `resolve(key_id) -> public key | none`, with rotation and revocation.

use crate::core::error::{RegistryError, ReasonCode};
use crate::core::model::SigningKey;
use crate::core::signing;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KeyState {
    Active,
    /// Still verifies until `until_ms` after being rotated out.
    Grace { until_ms: u64 },
    Revoked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Usable { public_key: String },
    Unknown,
    Revoked,
    GraceExpired,
}

impl Resolution {
    /// Reason code for a non-usable resolution.
    pub fn reason_code(&self) -> Option<ReasonCode> {
        match self {
            Resolution::Usable { .. } => None,
            Resolution::Unknown => Some(ReasonCode::KeyIdUnknown),
            Resolution::Revoked => Some(ReasonCode::KeyRevoked),
            Resolution::GraceExpired => Some(ReasonCode::KeyGraceExpired),
        }
    }
}

pub trait KeyResolver: Send + Sync {
    fn resolve(&self, key_id: &str, now_ms: u64) -> Resolution;
}

#[derive(Debug, Clone)]
struct KeyEntry {
    public_key: String,
    // Absent for verification-only keys registered by external signers.
    private_key: Option<String>,
    state: KeyState,
    created_at: u64,
}

/// In-process key ring. At most one key holding a private half is `Active`
/// at a time; that key signs artifact provenance.
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: Mutex<BTreeMap<String, KeyEntry>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    fn keys(&self) -> Result<MutexGuard<'_, BTreeMap<String, KeyEntry>>, RegistryError> {
        self.keys
            .lock()
            .map_err(|_| RegistryError::Poisoned("key ring".into()))
    }

    /// Generate a fresh signing key and make it the active one. The previous
    /// active signing key stays verifiable for `grace_ms`.
    pub fn rotate(&self, now_ms: u64, grace_ms: u64) -> Result<SigningKey, RegistryError> {
        let kp = signing::generate_keypair();
        let key_id = time::new_id("key");
        let mut keys = self.keys()?;
        for entry in keys.values_mut() {
            if entry.private_key.is_some() && entry.state == KeyState::Active {
                entry.state = KeyState::Grace {
                    until_ms: now_ms.saturating_add(grace_ms),
                };
            }
        }
        keys.insert(
            key_id.clone(),
            KeyEntry {
                public_key: kp.public_key.clone(),
                private_key: Some(kp.private_key.clone()),
                state: KeyState::Active,
                created_at: now_ms,
            },
        );
        tracing::info!(key_id = %key_id, "signing key rotated");
        Ok(SigningKey {
            key_id,
            public_key: kp.public_key,
            private_key: kp.private_key,
            active: true,
            created_at: now_ms,
        })
    }

    /// Import an existing signing key as the active one.
    pub fn install(&self, key: &SigningKey, grace_ms: u64) -> Result<(), RegistryError> {
        let derived = signing::public_key_for(&key.private_key)?;
        if derived != key.public_key {
            return Err(RegistryError::Crypto(format!(
                "public key of '{}' does not match its private key",
                key.key_id
            )));
        }
        let mut keys = self.keys()?;
        for entry in keys.values_mut() {
            if entry.private_key.is_some() && entry.state == KeyState::Active {
                entry.state = KeyState::Grace {
                    until_ms: key.created_at.saturating_add(grace_ms),
                };
            }
        }
        keys.insert(
            key.key_id.clone(),
            KeyEntry {
                public_key: key.public_key.clone(),
                private_key: Some(key.private_key.clone()),
                state: KeyState::Active,
                created_at: key.created_at,
            },
        );
        Ok(())
    }

    /// Register a verification-only key for an external request signer.
    pub fn register_public(
        &self,
        key_id: &str,
        public_key: &str,
        state: KeyState,
        now_ms: u64,
    ) -> Result<(), RegistryError> {
        self.keys()?.insert(
            key_id.to_string(),
            KeyEntry {
                public_key: public_key.to_string(),
                private_key: None,
                state,
                created_at: now_ms,
            },
        );
        Ok(())
    }

    pub fn revoke(&self, key_id: &str) -> Result<(), RegistryError> {
        let mut keys = self.keys()?;
        let entry = keys
            .get_mut(key_id)
            .ok_or_else(|| RegistryError::NotFound(format!("key {}", key_id)))?;
        entry.state = KeyState::Revoked;
        tracing::warn!(key_id, "key revoked");
        Ok(())
    }

    pub fn state(&self, key_id: &str) -> Option<KeyState> {
        self.keys().ok()?.get(key_id).map(|e| e.state)
    }

    /// The active signing key, private half included.
    pub fn active_signing_key(&self) -> Result<SigningKey, RegistryError> {
        let keys = self.keys()?;
        keys.iter()
            .filter(|(_, e)| e.state == KeyState::Active)
            .find_map(|(id, e)| {
                e.private_key.as_ref().map(|private_key| SigningKey {
                    key_id: id.clone(),
                    public_key: e.public_key.clone(),
                    private_key: private_key.clone(),
                    active: true,
                    created_at: e.created_at,
                })
            })
            .ok_or_else(|| RegistryError::NotFound("active signing key".into()))
    }
}

impl KeyResolver for KeyRing {
    fn resolve(&self, key_id: &str, now_ms: u64) -> Resolution {
        let Ok(keys) = self.keys() else {
            return Resolution::Unknown;
        };
        match keys.get(key_id) {
            None => Resolution::Unknown,
            Some(entry) => match entry.state {
                KeyState::Active => Resolution::Usable {
                    public_key: entry.public_key.clone(),
                },
                KeyState::Grace { until_ms } if now_ms <= until_ms => Resolution::Usable {
                    public_key: entry.public_key.clone(),
                },
                KeyState::Grace { .. } => Resolution::GraceExpired,
                KeyState::Revoked => Resolution::Revoked,
            },
        }
    }
}
