//! Lifecycle orchestration over a [`RegistryStore`].
//!
//! A `Registry` is an explicitly constructed handle; there is no process-wide
//! store. It owns the pieces a request passes through in order: the
//! verification gateway, the store, anti-rollback enforcement and the audit
//! trail.

pub mod delivery;
pub mod lifecycle;

pub use delivery::{Applied, ApplyRequest, RollbackRequest, RolledBack};
pub use lifecycle::{DeliveryView, RegisterArtifactRequest, ReleasePointerRequest};

use crate::core::audit::AuditTrail;
use crate::core::config::RegistryConfig;
use crate::core::error::RegistryError;
use crate::core::gateway::Gateway;
use crate::core::keys::{KeyResolver, KeyRing};
use crate::core::persist::Persistence;
use crate::core::time::{Clock, SystemClock};
use crate::store::{self, RegistryStore};
use std::sync::Arc;

pub struct Registry<S: RegistryStore + ?Sized = dyn RegistryStore> {
    store: Arc<S>,
    keys: Arc<KeyRing>,
    gateway: Gateway,
    audit: AuditTrail,
    clock: Arc<dyn Clock>,
}

impl<S: RegistryStore + ?Sized> Registry<S> {
    pub fn new(store: Arc<S>, keys: Arc<KeyRing>, audit: AuditTrail, clock: Arc<dyn Clock>) -> Self {
        let resolver: Arc<dyn KeyResolver> = keys.clone();
        Self {
            gateway: Gateway::new(resolver, clock.clone()),
            store,
            keys,
            audit,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Flush buffered store writes. Call before dropping the last handle when
    /// the flush outcome matters; `Drop` alone only logs failures.
    pub fn shutdown(&self) -> Result<(), RegistryError> {
        self.store.flush_now()?;
        tracing::info!(backend = ?self.store.kind(), "registry shut down");
        Ok(())
    }
}

impl Registry<dyn RegistryStore> {
    /// Open the configured backend and audit trail under `config.data_dir`.
    pub fn open(config: &RegistryConfig, keys: Arc<KeyRing>) -> Result<Self, RegistryError> {
        let store = store::open_store(config)?;
        let audit = AuditTrail::from_config(Persistence::from_config(config)?, config);
        Ok(Self::new(store, keys, audit, Arc::new(SystemClock)))
    }
}
