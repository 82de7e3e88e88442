//! Cross-process exclusive file lock.
//!
//! A lock named `models` is the marker file `<dir>/models.lock`. Acquisition is an
//! exclusive create (`create_new`), which gives single-winner semantics across
//! processes sharing the directory. The marker body records who holds it.
//! The returned [`LockLease`] removes the marker on drop, so every exit path of
//! the protected operation releases the lock, including `?` returns and panics.

use crate::core::error::RegistryError;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub host: String,
    pub acquired_at_ms: u64,
}

impl LockHolder {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: hostname(),
            acquired_at_ms: time::now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    pub timeout: Duration,
    pub retry: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5_000),
            retry: Duration::from_millis(10),
        }
    }
}

pub fn lock_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.lock", name))
}

/// Acquire the named lock, retrying with a fixed backoff until `opts.timeout`.
pub fn acquire(dir: &Path, name: &str, opts: LockOptions) -> Result<LockLease, RegistryError> {
    fs::create_dir_all(dir).map_err(RegistryError::IoError)?;
    let path = lock_path(dir, name);
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        if let Some(lease) = try_acquire(&path)? {
            if attempts > 1 {
                tracing::debug!(lock = name, attempts, "lock acquired after contention");
            }
            return Ok(lease);
        }
        let waited = started.elapsed();
        if waited >= opts.timeout {
            let holder = read_holder(dir, name).ok().flatten();
            tracing::warn!(
                lock = name,
                attempts,
                waited_ms = waited.as_millis() as u64,
                holder_pid = holder.as_ref().map(|h| h.pid),
                holder_host = holder.as_ref().map(|h| h.host.as_str()),
                "lock acquisition timed out"
            );
            return Err(RegistryError::LockTimeout {
                name: name.to_string(),
                waited_ms: waited.as_millis() as u64,
            });
        }
        std::thread::sleep(opts.retry.min(opts.timeout - waited));
    }
}

fn try_acquire(path: &Path) -> Result<Option<LockLease>, RegistryError> {
    let mut file = match OpenOptions::new()
        .create_new(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
        Err(err) => return Err(RegistryError::IoError(err)),
    };

    // The lease exists from here on, so a failed metadata write still releases.
    let lease_path = path.to_path_buf();
    let holder = LockHolder::current();
    let body = serde_json::to_vec(&holder)?;
    if let Err(err) = file.write_all(&body).and_then(|_| file.flush()) {
        let _ = fs::remove_file(&lease_path);
        return Err(RegistryError::IoError(err));
    }

    Ok(Some(LockLease {
        path: lease_path,
        holder,
        _file: file,
    }))
}

/// Holder metadata of a currently held lock, `None` if the lock is free.
pub fn read_holder(dir: &Path, name: &str) -> Result<Option<LockHolder>, RegistryError> {
    let path = lock_path(dir, name);
    match fs::read(&path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(RegistryError::IoError(err)),
    }
}

fn hostname() -> String {
    if let Ok(h) = std::env::var("HOSTNAME") {
        if !h.trim().is_empty() {
            return h.trim().to_string();
        }
    }
    fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[derive(Debug)]
pub struct LockLease {
    path: PathBuf,
    holder: LockHolder,
    _file: File,
}

impl LockLease {
    pub fn holder(&self) -> &LockHolder {
        &self.holder
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
