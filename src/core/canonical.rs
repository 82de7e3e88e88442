//! Canonical request payload (`v1`).
//!
//! The signed bytes are the compact JSON of
//! `{"v":"v1","ts_ms":..,"tenant_id":..,"op":..,"body":{..}}` with the fields in
//! exactly that order and every object key inside `body` sorted
//! lexicographically. Signer and verifier therefore derive byte-identical input
//! no matter how the caller ordered the body.

use crate::core::error::RegistryError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

pub const CANONICAL_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    ArtifactRegister,
    DeliveryApply,
    DeliveryRollback,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ArtifactRegister => "ARTIFACT_REGISTER",
            Operation::DeliveryApply => "DELIVERY_APPLY",
            Operation::DeliveryRollback => "DELIVERY_ROLLBACK",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    v: &'a str,
    ts_ms: u64,
    tenant_id: &'a str,
    op: Operation,
    body: Value,
}

/// Recursively rebuild objects with sorted keys.
pub fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), sort_keys(&obj[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

fn envelope<'a>(op: Operation, tenant_id: &'a str, ts_ms: u64, body: &Value) -> Envelope<'a> {
    Envelope {
        v: CANONICAL_VERSION,
        ts_ms,
        tenant_id,
        op,
        body: sort_keys(body),
    }
}

/// Canonical bytes for `op` issued by `tenant_id` at `ts_ms` over `body`.
pub fn canonical_bytes(
    op: Operation,
    tenant_id: &str,
    ts_ms: u64,
    body: &Value,
) -> Result<Vec<u8>, RegistryError> {
    Ok(serde_json::to_vec(&envelope(op, tenant_id, ts_ms, body))?)
}

pub fn canonical_string(
    op: Operation,
    tenant_id: &str,
    ts_ms: u64,
    body: &Value,
) -> Result<String, RegistryError> {
    Ok(serde_json::to_string(&envelope(op, tenant_id, ts_ms, body))?)
}

/// Join `fields` after `tag` with each field length-prefixed, so no two
/// distinct tuples share an encoding even when fields contain the separator.
pub fn length_prefixed(tag: &str, fields: &[&str]) -> String {
    let mut out = String::from(tag);
    for f in fields {
        out.push(':');
        out.push_str(&f.len().to_string());
        out.push(':');
        out.push_str(f);
    }
    out
}
