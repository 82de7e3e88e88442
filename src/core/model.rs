//! Registry entities.

use crate::core::canonical;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Draft,
    Active,
    Deprecated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub status: ModelStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Draft,
    Released,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub id: String,
    pub model_id: String,
    pub tenant_id: String,
    /// Opaque version label, e.g. `1.0.0`.
    pub version: String,
    pub status: VersionStatus,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub released_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolled_back_at: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Uploading,
    Ready,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub model_version_id: String,
    pub tenant_id: String,
    pub platform: String,
    pub runtime: String,
    pub sha256: String,
    pub size_bytes: u64,
    pub storage_ref: String,
    /// Provenance signature over the length-prefixed
    /// `(sha256, model_id, version, platform, runtime)` tuple.
    pub signature: String,
    pub key_id: String,
    pub status: ArtifactStatus,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasePointer {
    pub id: String,
    pub model_id: String,
    pub tenant_id: String,
    pub platform: String,
    pub runtime: String,
    pub model_version_id: String,
    pub artifact_id: String,
    pub created_at: u64,
}

impl ReleasePointer {
    /// One pointer per `(model, platform, runtime)`; the id is derived so a put is an upsert.
    pub fn pointer_id(model_id: &str, platform: &str, runtime: &str) -> String {
        canonical::length_prefixed("rp", &[model_id, platform, runtime])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKey {
    pub key_id: String,
    pub public_key: String,
    pub private_key: String,
    pub active: bool,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateState {
    pub scope_key: String,
    pub max_seen_version: u64,
    #[serde(default)]
    pub updated_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_use_snake_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&VersionStatus::RolledBack).unwrap(),
            "\"rolled_back\""
        );
        assert_eq!(
            serde_json::to_string(&ArtifactStatus::Uploading).unwrap(),
            "\"uploading\""
        );
    }

    #[test]
    fn pointer_id_is_stable_per_triple() {
        assert_eq!(
            ReleasePointer::pointer_id("m1", "android", "tflite"),
            ReleasePointer::pointer_id("m1", "android", "tflite")
        );
        assert_ne!(
            ReleasePointer::pointer_id("m1", "android", "tflite"),
            ReleasePointer::pointer_id("m1", "ios", "tflite")
        );
    }

    #[test]
    fn separator_inside_a_field_does_not_collide() {
        assert_ne!(
            ReleasePointer::pointer_id("m1", "a:b", "c"),
            ReleasePointer::pointer_id("m1", "a", "b:c")
        );
    }

    #[test]
    fn optional_timestamps_are_omitted_until_set() {
        let v = ModelVersion {
            id: "v".into(),
            model_id: "m".into(),
            tenant_id: "t".into(),
            version: "1.0.0".into(),
            status: VersionStatus::Draft,
            created_at: 1,
            released_at: None,
            rolled_back_at: None,
        };
        let s = serde_json::to_string(&v).unwrap();
        assert!(!s.contains("released_at"));
        let back: ModelVersion = serde_json::from_str(&s).unwrap();
        assert_eq!(back, v);
    }
}
