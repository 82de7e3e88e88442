//! Registry configuration: `<data_dir>/modreg.toml` overlaid with `MODREG_*` env vars.

use crate::core::error::RegistryError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "modreg.toml";

const ENV_DATA_DIR: &str = "MODREG_DATA_DIR";
const ENV_BACKEND: &str = "MODREG_BACKEND";
const ENV_LOCK_TIMEOUT_MS: &str = "MODREG_LOCK_TIMEOUT_MS";
const ENV_LOCK_RETRY_MS: &str = "MODREG_LOCK_RETRY_MS";
const ENV_FLUSH_DEBOUNCE_MS: &str = "MODREG_FLUSH_DEBOUNCE_MS";
const ENV_AUDIT_MAX_BYTES: &str = "MODREG_AUDIT_MAX_BYTES";
const ENV_AUDIT_RETAIN_DAYS: &str = "MODREG_AUDIT_RETAIN_DAYS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    File,
    Memory,
    Sqlite,
}

impl std::str::FromStr for BackendKind {
    type Err = RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(BackendKind::File),
            "memory" => Ok(BackendKind::Memory),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(RegistryError::Config(format!(
                "unknown backend '{}': expected file|memory|sqlite",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub data_dir: PathBuf,
    pub backend: BackendKind,
    pub lock_timeout_ms: u64,
    pub lock_retry_ms: u64,
    pub flush_debounce_ms: u64,
    pub audit_max_bytes: u64,
    pub audit_retain_days: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            backend: BackendKind::File,
            lock_timeout_ms: 5_000,
            lock_retry_ms: 10,
            flush_debounce_ms: 50,
            audit_max_bytes: 1_000_000,
            audit_retain_days: 14,
        }
    }
}

// Distinguishes an absent `data_dir` key from one that equals the default.
#[derive(Deserialize)]
struct DataDirKey {
    data_dir: Option<PathBuf>,
}

impl RegistryConfig {
    /// Defaults rooted at `data_dir`, without reading any file or env.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Load `<data_dir>/modreg.toml` if present, then apply env overrides.
    /// A missing file is not an error; an unparseable one is. The directory
    /// argument is the data dir unless the file names one explicitly.
    pub fn load(data_dir: &Path) -> Result<Self, RegistryError> {
        let path = data_dir.join(CONFIG_FILE_NAME);
        let mut config = Self::default();
        let mut explicit_dir = None;
        if path.exists() {
            let content = fs::read_to_string(&path).map_err(RegistryError::IoError)?;
            let parse_err = |e: toml::de::Error| RegistryError::Config(format!("{}: {}", path.display(), e));
            config = toml::from_str::<RegistryConfig>(&content).map_err(parse_err)?;
            explicit_dir = toml::from_str::<DataDirKey>(&content).map_err(parse_err)?.data_dir;
        }
        if explicit_dir.is_none() {
            config.data_dir = data_dir.to_path_buf();
        }
        config.apply_env(|k| std::env::var(k).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<(), RegistryError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_DATA_DIR).filter(|v| !v.is_empty()) {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup(ENV_BACKEND) {
            self.backend = v.parse()?;
        }
        let parse_u64 = |key: &str| -> Result<Option<u64>, RegistryError> {
            match lookup(key) {
                None => Ok(None),
                Some(v) => v
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| RegistryError::Config(format!("{}={}: {}", key, v, e))),
            }
        };
        if let Some(v) = parse_u64(ENV_LOCK_TIMEOUT_MS)? {
            self.lock_timeout_ms = v;
        }
        if let Some(v) = parse_u64(ENV_LOCK_RETRY_MS)? {
            self.lock_retry_ms = v;
        }
        if let Some(v) = parse_u64(ENV_FLUSH_DEBOUNCE_MS)? {
            self.flush_debounce_ms = v;
        }
        if let Some(v) = parse_u64(ENV_AUDIT_MAX_BYTES)? {
            self.audit_max_bytes = v;
        }
        if let Some(v) = parse_u64(ENV_AUDIT_RETAIN_DAYS)? {
            self.audit_retain_days = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.lock_retry_ms == 0 {
            return Err(RegistryError::Config("lock_retry_ms must be > 0".into()));
        }
        if self.lock_timeout_ms < self.lock_retry_ms {
            return Err(RegistryError::Config(
                "lock_timeout_ms must be >= lock_retry_ms".into(),
            ));
        }
        if self.audit_max_bytes == 0 {
            return Err(RegistryError::Config("audit_max_bytes must be > 0".into()));
        }
        if self.audit_retain_days == 0 {
            return Err(RegistryError::Config(
                "audit_retain_days must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }

    pub fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }
}
