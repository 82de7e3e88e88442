//! Crash-safe JSON document persistence.
//!
//! Documents live at `<dir>/<name>.json`. Writes go to a unique temp sibling,
//! are synced, then renamed over the target, so a reader sees either the old
//! document or the new one, never a prefix. Every public operation holds the
//! document's file lock for its whole duration.
//!
//! Reads fail closed: an unparseable document is `PERSIST_CORRUPTED`, never
//! "no data".

use crate::core::config::RegistryConfig;
use crate::core::counters::{CounterName, OpsCounters};
use crate::core::error::RegistryError;
use crate::core::lock::{self, LockOptions};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use ulid::Ulid;

pub fn document_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.json", name))
}

/// Write `bytes` to `target` via temp file + fsync + rename.
pub fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
    let dir = target
        .parent()
        .ok_or_else(|| RegistryError::IoError(std::io::Error::other("target has no parent")))?;
    fs::create_dir_all(dir).map_err(RegistryError::IoError)?;
    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp-{}-{}", file_name, std::process::id(), Ulid::new()));

    let result = (|| -> std::io::Result<()> {
        let mut f = OpenOptions::new().create_new(true).write(true).open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, target)?;
        sync_dir(dir);
        Ok(())
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(RegistryError::IoError(e));
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Outcome of an [`Persistence::update_json`] closure.
pub enum Mutation<R> {
    /// Persist the mutated document, then return the value.
    Write(R),
    /// Leave the document untouched.
    Keep(R),
}

#[derive(Debug, Clone)]
pub struct Persistence {
    dir: PathBuf,
    lock: LockOptions,
    counters: OpsCounters,
}

impl Persistence {
    pub fn new(dir: &Path, lock: LockOptions) -> Result<Self, RegistryError> {
        fs::create_dir_all(dir).map_err(RegistryError::IoError)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            lock,
            counters: OpsCounters::new(dir, lock),
        })
    }

    pub fn from_config(config: &RegistryConfig) -> Result<Self, RegistryError> {
        Self::new(
            &config.data_dir,
            LockOptions {
                timeout: config.lock_timeout(),
                retry: config.lock_retry(),
            },
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn counters(&self) -> &OpsCounters {
        &self.counters
    }

    pub fn document_path(&self, name: &str) -> PathBuf {
        document_path(&self.dir, name)
    }

    /// Run `f` while holding the named lock. A timeout bumps `LOCK_TIMEOUT`.
    pub fn with_lock<R, F>(&self, name: &str, f: F) -> Result<R, RegistryError>
    where
        F: FnOnce() -> Result<R, RegistryError>,
    {
        let _lease = match lock::acquire(&self.dir, name, self.lock) {
            Ok(lease) => lease,
            Err(e) => {
                if matches!(e, RegistryError::LockTimeout { .. }) {
                    self.counters.record(CounterName::LockTimeout);
                }
                return Err(e);
            }
        };
        f()
    }

    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, RegistryError> {
        self.with_lock(name, || self.read_unlocked(name))
    }

    pub fn write_json<T: Serialize>(&self, name: &str, doc: &T) -> Result<(), RegistryError> {
        self.with_lock(name, || self.write_unlocked(name, doc))
    }

    /// Locked read-modify-write. The document is re-read from disk under the
    /// lock, so concurrent writers in other processes are never lost.
    pub fn update_json<T, R, F>(&self, name: &str, f: F) -> Result<R, RegistryError>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> Result<Mutation<R>, RegistryError>,
    {
        self.with_lock(name, || {
            let mut doc = self.read_unlocked::<T>(name)?.unwrap_or_default();
            match f(&mut doc)? {
                Mutation::Write(r) => {
                    self.write_unlocked(name, &doc)?;
                    Ok(r)
                }
                Mutation::Keep(r) => Ok(r),
            }
        })
    }

    /// Caller must already hold the `name` lock.
    pub(crate) fn read_unlocked<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, RegistryError> {
        let path = self.document_path(name);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RegistryError::IoError(e)),
        };
        match serde_json::from_slice::<T>(&bytes) {
            Ok(doc) => Ok(Some(doc)),
            Err(e) => {
                tracing::error!(document = name, path = %path.display(), error = %e, "persisted document is corrupted");
                self.counters.record(CounterName::PersistCorrupted);
                Err(RegistryError::PersistCorrupted {
                    name: name.to_string(),
                    detail: e.to_string(),
                })
            }
        }
    }

    /// Caller must already hold the `name` lock.
    pub(crate) fn write_unlocked<T: Serialize>(
        &self,
        name: &str,
        doc: &T,
    ) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        write_atomic(&self.document_path(name), &bytes)
    }

    pub fn remove(&self, name: &str) -> Result<(), RegistryError> {
        self.with_lock(name, || match fs::remove_file(self.document_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RegistryError::IoError(e)),
        })
    }
}
