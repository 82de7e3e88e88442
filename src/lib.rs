//! modreg: a signed model artifact registry and delivery engine.
//!
//! Requests to register artifacts and to apply or roll back deliveries are
//! refused unless they carry a valid ed25519 signature over a canonical
//! payload. Applies are additionally held to a per-(tenant, model) monotonic
//! update version, so a deployment can never be moved backward.
//!
//! # Layers
//!
//! - [`core`]: persistence with file locks, signing, the verification
//!   gateway, anti-rollback and the audit trail
//! - [`store`]: the [`store::RegistryStore`] contract and its file, memory and
//!   SQLite backends
//! - [`registry`]: lifecycle orchestration over a store
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use modreg::core::config::RegistryConfig;
//! use modreg::core::keys::KeyRing;
//! use modreg::registry::Registry;
//!
//! let config = RegistryConfig::load(std::path::Path::new("data"))?;
//! let keys = Arc::new(KeyRing::new());
//! keys.rotate(modreg::core::time::now_ms(), 7 * 24 * 3600 * 1000)?;
//! let registry = Registry::open(&config, keys)?;
//! let model = registry.create_model("tenant-a", "detector")?;
//! registry.shutdown()?;
//! # let _ = model;
//! # Ok::<(), modreg::core::error::RegistryError>(())
//! ```

pub mod cli;
pub mod core;
pub mod registry;
pub mod store;

pub use cli::run;
pub use crate::core::error::{ReasonCode, RegistryError};
pub use registry::Registry;
pub use store::RegistryStore;
