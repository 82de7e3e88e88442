//! Operational counters over a rolling 24h window (`ops_counters.json`).
//!
//! Counters are diagnostics, not authoritative state: a corrupted counters
//! document is logged and reset instead of failing the caller.

use crate::core::error::RegistryError;
use crate::core::lock::{self, LockOptions};
use crate::core::persist;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const COUNTERS_DOC: &str = "ops_counters";
const WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CounterName {
    LockTimeout,
    PersistCorrupted,
    AuditRotate,
    AuditRetentionDelete,
}

impl CounterName {
    pub const ALL: [CounterName; 4] = [
        CounterName::LockTimeout,
        CounterName::PersistCorrupted,
        CounterName::AuditRotate,
        CounterName::AuditRetentionDelete,
    ];
}

type CounterDoc = BTreeMap<CounterName, Vec<u64>>;

#[derive(Debug, Clone)]
pub struct OpsCounters {
    dir: PathBuf,
    lock: LockOptions,
}

impl OpsCounters {
    pub fn new(dir: &Path, lock: LockOptions) -> Self {
        Self {
            dir: dir.to_path_buf(),
            lock,
        }
    }

    /// Record one occurrence. Failures are logged and swallowed so a counter
    /// can never mask the error being counted.
    pub fn record(&self, name: CounterName) {
        if let Err(e) = self.increment(name, time::now_ms()) {
            tracing::warn!(counter = ?name, error = %e, "failed to record ops counter");
        }
    }

    pub fn increment(&self, name: CounterName, now_ms: u64) -> Result<(), RegistryError> {
        let _lease = lock::acquire(&self.dir, COUNTERS_DOC, self.lock)?;
        let mut doc = self.load();
        for stamps in doc.values_mut() {
            prune(stamps, now_ms);
        }
        doc.entry(name).or_default().push(now_ms);
        let bytes = serde_json::to_vec_pretty(&doc)?;
        persist::write_atomic(&self.path(), &bytes)
    }

    pub fn counts_24h(&self, now_ms: u64) -> BTreeMap<CounterName, usize> {
        let doc = self.load();
        CounterName::ALL
            .iter()
            .map(|name| {
                let n = doc
                    .get(name)
                    .map(|stamps| stamps.iter().filter(|t| in_window(**t, now_ms)).count())
                    .unwrap_or(0);
                (*name, n)
            })
            .collect()
    }

    fn path(&self) -> PathBuf {
        persist::document_path(&self.dir, COUNTERS_DOC)
    }

    fn load(&self) -> CounterDoc {
        let path = self.path();
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(_) => return CounterDoc::new(),
        };
        match serde_json::from_slice(&bytes) {
            Ok(doc) => doc,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ops counters unreadable; starting fresh");
                CounterDoc::new()
            }
        }
    }
}

fn in_window(ts: u64, now_ms: u64) -> bool {
    ts >= now_ms.saturating_sub(WINDOW_MS)
}

fn prune(stamps: &mut Vec<u64>, now_ms: u64) {
    stamps.retain(|t| in_window(*t, now_ms));
}
