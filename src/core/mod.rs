//! Core primitives for the registry: persistence, locking, signing, the
//! verification gateway, anti-rollback and audit.
//!
//! Everything above this layer (stores, lifecycle orchestration, the CLI)
//! is composed from these modules.

pub mod anti_rollback;
pub mod audit;
pub mod canonical;
pub mod config;
pub mod counters;
pub mod db;
pub mod error;
pub mod gateway;
pub mod keys;
pub mod lock;
pub mod model;
pub mod persist;
pub mod persist_map;
pub mod schemas;
pub mod signing;
pub mod time;
