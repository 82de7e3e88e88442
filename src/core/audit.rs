//! Append-only, meta-only decision log.
//!
//! One document per UTC day (`audit_<YYYY-MM-DD>.json`). When the active file
//! grows past `max_bytes` it becomes `audit_<day>.1.json`, replacing any older
//! generation, and a fresh active file starts. Days older than the retention
//! window are deleted. Every write goes through locked persistence, so audit
//! writes share its bounded timeout and are never skipped.

use crate::core::config::RegistryConfig;
use crate::core::counters::CounterName;
use crate::core::error::{ReasonCode, RegistryError};
use crate::core::persist::Persistence;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::fs;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;
const AUDIT_PREFIX: &str = "audit_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Apply,
    Rollback,
    Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditResult {
    Allow,
    Deny,
}

/// The only fields an audit record may carry. No bodies, no tenant ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts_ms: u64,
    pub action: AuditAction,
    pub result: AuditResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<ReasonCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl AuditEvent {
    pub fn allow(ts_ms: u64, action: AuditAction) -> Self {
        Self {
            ts_ms,
            action,
            result: AuditResult::Allow,
            reason_code: None,
            key_id: None,
            sha256: None,
        }
    }

    pub fn deny(ts_ms: u64, action: AuditAction, reason_code: ReasonCode) -> Self {
        Self {
            ts_ms,
            action,
            result: AuditResult::Deny,
            reason_code: Some(reason_code),
            key_id: None,
            sha256: None,
        }
    }

    pub fn with_key(mut self, key_id: Option<&str>) -> Self {
        self.key_id = key_id.filter(|k| !k.is_empty()).map(str::to_string);
        self
    }

    pub fn with_sha256(mut self, sha256: Option<&str>) -> Self {
        self.sha256 = sha256.filter(|s| !s.is_empty()).map(str::to_string);
        self
    }
}

pub fn audit_doc_name(day: &str) -> String {
    format!("{}{}", AUDIT_PREFIX, day)
}

pub fn rotated_doc_name(day: &str) -> String {
    format!("{}{}.1", AUDIT_PREFIX, day)
}

#[derive(Debug, Clone)]
pub struct AuditTrail {
    persist: Persistence,
    max_bytes: u64,
    retain_days: u64,
}

impl AuditTrail {
    pub fn new(persist: Persistence, max_bytes: u64, retain_days: u64) -> Self {
        Self {
            persist,
            max_bytes,
            retain_days,
        }
    }

    pub fn from_config(persist: Persistence, config: &RegistryConfig) -> Self {
        Self::new(persist, config.audit_max_bytes, config.audit_retain_days)
    }

    pub fn append(&self, event: &AuditEvent) -> Result<(), RegistryError> {
        self.enforce_retention(event.ts_ms)?;

        let day = time::day_key(event.ts_ms);
        let name = audit_doc_name(&day);
        self.persist.with_lock(&name, || {
            self.rotate_if_needed(&day)?;
            let mut events: Vec<AuditEvent> = self.persist.read_unlocked(&name)?.unwrap_or_default();
            events.push(event.clone());
            self.persist.write_unlocked(&name, &events)
        })?;
        tracing::info!(
            action = ?event.action,
            result = ?event.result,
            reason_code = event.reason_code.map(|r| r.as_str()),
            "audit recorded"
        );
        Ok(())
    }

    /// Events in the active generation for `day`.
    pub fn read_day(&self, day: &str) -> Result<Vec<AuditEvent>, RegistryError> {
        Ok(self.persist.read_json(&audit_doc_name(day))?.unwrap_or_default())
    }

    /// Events in the single retained rotated generation for `day`.
    pub fn read_rotated(&self, day: &str) -> Result<Vec<AuditEvent>, RegistryError> {
        Ok(self.persist.read_json(&rotated_doc_name(day))?.unwrap_or_default())
    }

    // Caller holds the lock for the day's active document.
    fn rotate_if_needed(&self, day: &str) -> Result<(), RegistryError> {
        let active = self.persist.document_path(&audit_doc_name(day));
        let size = match fs::metadata(&active) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(RegistryError::IoError(e)),
        };
        if size <= self.max_bytes {
            return Ok(());
        }
        let rotated = self.persist.document_path(&rotated_doc_name(day));
        fs::rename(&active, &rotated).map_err(RegistryError::IoError)?;
        self.persist.counters().record(CounterName::AuditRotate);
        tracing::info!(day, size, "audit file rotated");
        Ok(())
    }

    fn enforce_retention(&self, now_ms: u64) -> Result<(), RegistryError> {
        let cutoff = now_ms.saturating_sub(self.retain_days.saturating_mul(DAY_MS));
        let entries = match fs::read_dir(self.persist.dir()) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(RegistryError::IoError(e)),
        };
        for entry in entries {
            let file_name = entry.map_err(RegistryError::IoError)?.file_name();
            let file_name = file_name.to_string_lossy();
            let Some(doc) = file_name.strip_suffix(".json") else {
                continue;
            };
            let Some(rest) = doc.strip_prefix(AUDIT_PREFIX) else {
                continue;
            };
            let Some(day) = rest.get(..10) else { continue };
            let Some(day_start) = time::day_start_ms(day) else {
                continue;
            };
            if day_start < cutoff {
                self.persist.remove(doc)?;
                self.persist.counters().record(CounterName::AuditRetentionDelete);
                tracing::info!(document = doc, "audit file past retention deleted");
            }
        }
        Ok(())
    }
}
