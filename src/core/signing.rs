//! Ed25519 signing primitives.
//!
//! Keys and signatures travel as standard base64 strings. The private key is
//! the 32-byte seed; it never leaves the server boundary.

use crate::core::canonical;
use crate::core::error::RegistryError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

pub const SIG_ALG_ED25519: &str = "ed25519";
const ARTIFACT_MESSAGE_TAG: &str = "artifact-v1";

#[derive(Debug, Clone)]
pub struct GeneratedKeypair {
    pub public_key: String,
    pub private_key: String,
}

pub fn generate_keypair() -> GeneratedKeypair {
    let signing = SigningKey::generate(&mut OsRng);
    GeneratedKeypair {
        public_key: STANDARD.encode(signing.verifying_key().to_bytes()),
        private_key: STANDARD.encode(signing.to_bytes()),
    }
}

/// Public key for a base64 private key seed.
pub fn public_key_for(private_key: &str) -> Result<String, RegistryError> {
    let signing = decode_signing_key(private_key)?;
    Ok(STANDARD.encode(signing.verifying_key().to_bytes()))
}

pub fn sign(data: &[u8], private_key: &str) -> Result<String, RegistryError> {
    let signing = decode_signing_key(private_key)?;
    Ok(STANDARD.encode(signing.sign(data).to_bytes()))
}

/// Any malformed key or signature verifies as `false`.
pub fn verify(data: &[u8], signature: &str, public_key: &str) -> bool {
    let Some(key) = decode_verifying_key(public_key) else {
        return false;
    };
    let Some(sig) = decode_signature(signature) else {
        return false;
    };
    key.verify(data, &sig).is_ok()
}

/// Provenance message binding artifact metadata to a key. Fields are
/// length-prefixed so a `:` inside any of them cannot shift the boundaries.
pub fn artifact_message(
    sha256: &str,
    model_id: &str,
    version: &str,
    platform: &str,
    runtime: &str,
) -> String {
    canonical::length_prefixed(
        ARTIFACT_MESSAGE_TAG,
        &[sha256, model_id, version, platform, runtime],
    )
}

pub fn sign_artifact(
    sha256: &str,
    model_id: &str,
    version: &str,
    platform: &str,
    runtime: &str,
    private_key: &str,
) -> Result<String, RegistryError> {
    let msg = artifact_message(sha256, model_id, version, platform, runtime);
    sign(msg.as_bytes(), private_key)
}

pub fn verify_artifact(
    sha256: &str,
    model_id: &str,
    version: &str,
    platform: &str,
    runtime: &str,
    signature: &str,
    public_key: &str,
) -> bool {
    let msg = artifact_message(sha256, model_id, version, platform, runtime);
    verify(msg.as_bytes(), signature, public_key)
}

fn decode_signing_key(private_key: &str) -> Result<SigningKey, RegistryError> {
    let bytes = STANDARD
        .decode(private_key.trim())
        .map_err(|e| RegistryError::Crypto(format!("private key is not base64: {}", e)))?;
    let seed: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| RegistryError::Crypto(format!("private key must be 32 bytes, got {}", bytes.len())))?;
    Ok(SigningKey::from_bytes(&seed))
}

fn decode_verifying_key(public_key: &str) -> Option<VerifyingKey> {
    let bytes = STANDARD.decode(public_key.trim()).ok()?;
    let arr: [u8; 32] = bytes.as_slice().try_into().ok()?;
    VerifyingKey::from_bytes(&arr).ok()
}

fn decode_signature(signature: &str) -> Option<Signature> {
    let bytes = STANDARD.decode(signature.trim()).ok()?;
    Signature::from_slice(&bytes).ok()
}
