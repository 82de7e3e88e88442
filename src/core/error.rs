use rusqlite;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Machine-readable reason attached to every denial and audited DENY record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    SignatureMissing,
    SignatureInvalid,
    SignatureExpired,
    /// Stored provenance no longer verifies; the device must not apply.
    SignatureInvalidFailclosed,
    KeyIdUnknown,
    KeyRevoked,
    KeyGraceExpired,
    CanonicalPayloadInvalid,
    Sha256Missing,
    AntiRollbackViolation,
    LockTimeout,
    PersistCorrupted,
    NotFound,
    InternalError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::SignatureMissing => "SIGNATURE_MISSING",
            ReasonCode::SignatureInvalid => "SIGNATURE_INVALID",
            ReasonCode::SignatureExpired => "SIGNATURE_EXPIRED",
            ReasonCode::SignatureInvalidFailclosed => "SIGNATURE_INVALID_FAILCLOSED",
            ReasonCode::KeyIdUnknown => "KEY_ID_UNKNOWN",
            ReasonCode::KeyRevoked => "KEY_REVOKED",
            ReasonCode::KeyGraceExpired => "KEY_GRACE_EXPIRED",
            ReasonCode::CanonicalPayloadInvalid => "CANONICAL_PAYLOAD_INVALID",
            ReasonCode::Sha256Missing => "SHA256_MISSING",
            ReasonCode::AntiRollbackViolation => "ANTI_ROLLBACK_VIOLATION",
            ReasonCode::LockTimeout => "LOCK_TIMEOUT",
            ReasonCode::PersistCorrupted => "PERSIST_CORRUPTED",
            ReasonCode::NotFound => "NOT_FOUND",
            ReasonCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport-agnostic status class. `Client` maps to a 4xx "bad request",
/// `Forbidden` to a signature or policy refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusClass {
    Client,
    Forbidden,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub reason_code: ReasonCode,
    pub status: StatusClass,
}

impl Denial {
    pub fn client(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            status: StatusClass::Client,
        }
    }

    pub fn forbidden(reason_code: ReasonCode) -> Self {
        Self {
            reason_code,
            status: StatusClass::Forbidden,
        }
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.reason_code, self.status)
    }
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("request denied: {0}")]
    Denied(Denial),
    #[error("LOCK_TIMEOUT: could not acquire lock '{name}' within {waited_ms}ms")]
    LockTimeout { name: String, waited_ms: u64 },
    #[error("PERSIST_CORRUPTED: document '{name}' is unreadable: {detail}")]
    PersistCorrupted { name: String, detail: String },
    #[error("ANTI_ROLLBACK_VIOLATION: scope '{scope_key}' incoming {incoming} < max seen {current}")]
    AntiRollbackViolation {
        scope_key: String,
        incoming: u64,
        current: u64,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("ALREADY_RELEASED: version {0} is already released")]
    AlreadyReleased(String),
    #[error("INVALID_TRANSITION: {0}")]
    InvalidTransition(String),
    #[error("VERSION_IN_USE: {0}")]
    VersionInUse(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Lock poisoned: {0}")]
    Poisoned(String),
}

impl RegistryError {
    /// Reason code recorded in the audit trail when this error ends a request.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            RegistryError::Denied(d) => d.reason_code,
            RegistryError::LockTimeout { .. } => ReasonCode::LockTimeout,
            RegistryError::PersistCorrupted { .. } => ReasonCode::PersistCorrupted,
            RegistryError::AntiRollbackViolation { .. } => ReasonCode::AntiRollbackViolation,
            RegistryError::NotFound(_) => ReasonCode::NotFound,
            _ => ReasonCode::InternalError,
        }
    }

    pub fn denial(&self) -> Option<&Denial> {
        match self {
            RegistryError::Denied(d) => Some(d),
            _ => None,
        }
    }
}

impl From<Denial> for RegistryError {
    fn from(d: Denial) -> Self {
        RegistryError::Denied(d)
    }
}
