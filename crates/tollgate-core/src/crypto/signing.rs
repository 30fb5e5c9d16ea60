//! Ed25519 detached signatures over canonical JSON.
//!
//! A signed record carries `{alg, key_id, sig, signed_digest}`:
//! `signed_digest` is the hex SHA-256 of the canonical bytes of the record
//! with its signature removed, and `sig` is the base64 ed25519 signature over
//! the 32 raw digest bytes. A verifier can check `sig` against
//! `signed_digest` without re-deriving canonicalization, and then separately
//! confirm the digest still matches the record.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use super::jcs;

/// The only supported algorithm.
pub const ALG_ED25519: &str = "ed25519";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetachedSignature {
    pub alg: String,
    pub key_id: String,
    pub sig: String,
    pub signed_digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("record is not signed")]
    Missing,

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("malformed signature: {reason}")]
    Malformed { reason: String },

    #[error("key not trusted: {key_id}")]
    KeyNotTrusted { key_id: String },

    #[error("signed digest does not match record content")]
    DigestMismatch,

    #[error("ed25519 verification failed")]
    SignatureInvalid,
}

/// Compute key_id from SPKI-encoded public key bytes.
///
/// Returns `sha256:<lowercase-hex>`.
pub fn compute_key_id(spki_bytes: &[u8]) -> String {
    format!("sha256:{}", jcs::digest_bytes(spki_bytes))
}

/// Compute key_id from a VerifyingKey.
pub fn key_id_for(key: &VerifyingKey) -> Result<String> {
    use pkcs8::EncodePublicKey;
    let doc = key
        .to_public_key_der()
        .context("failed to encode public key as SPKI DER")?;
    Ok(compute_key_id(doc.as_bytes()))
}

/// Sign already-canonical bytes.
pub fn sign_canonical(canonical: &[u8], signing_key: &SigningKey) -> Result<DetachedSignature> {
    let digest = jcs::sha256(canonical);
    let signature: Signature = signing_key.sign(&digest);
    Ok(DetachedSignature {
        alg: ALG_ED25519.to_string(),
        key_id: key_id_for(&signing_key.verifying_key())?,
        sig: BASE64.encode(signature.to_bytes()),
        signed_digest: hex::encode(digest),
    })
}

/// Canonicalize `unsigned` and sign it. Callers pass the record with its
/// signature field cleared.
pub fn sign_value<T: Serialize>(unsigned: &T, signing_key: &SigningKey) -> Result<DetachedSignature> {
    let canonical = jcs::to_vec(unsigned)?;
    sign_canonical(&canonical, signing_key)
}

/// Verify `signature` over `canonical` with one specific key.
pub fn verify_canonical(
    canonical: &[u8],
    signature: &DetachedSignature,
    key: &VerifyingKey,
) -> Result<(), SignatureError> {
    if signature.alg != ALG_ED25519 {
        return Err(SignatureError::UnsupportedAlgorithm(signature.alg.clone()));
    }
    let digest = jcs::sha256(canonical);
    if hex::encode(digest) != signature.signed_digest {
        return Err(SignatureError::DigestMismatch);
    }

    let actual_key_id = key_id_for(key).map_err(|e| SignatureError::Malformed {
        reason: e.to_string(),
    })?;
    if signature.key_id != actual_key_id {
        return Err(SignatureError::KeyNotTrusted {
            key_id: signature.key_id.clone(),
        });
    }

    let sig_bytes = BASE64
        .decode(&signature.sig)
        .map_err(|e| SignatureError::Malformed {
            reason: format!("invalid base64 signature: {e}"),
        })?;
    let sig = Signature::from_slice(&sig_bytes).map_err(|e| SignatureError::Malformed {
        reason: format!("invalid signature bytes: {e}"),
    })?;
    key.verify(&digest, &sig)
        .map_err(|_| SignatureError::SignatureInvalid)
}

/// Verify a signed record against one key.
pub fn verify_value<T: Serialize>(
    unsigned: &T,
    signature: &DetachedSignature,
    key: &VerifyingKey,
) -> Result<(), SignatureError> {
    let canonical = jcs::to_vec(unsigned).map_err(|e| SignatureError::Malformed {
        reason: format!("{e:#}"),
    })?;
    verify_canonical(&canonical, signature, key)
}

/// Public keys accepted for a verification role, indexed by key_id.
#[derive(Debug, Clone, Default)]
pub struct TrustedKeys {
    keys: BTreeMap<String, VerifyingKey>,
}

impl TrustedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys<I: IntoIterator<Item = VerifyingKey>>(keys: I) -> Result<Self> {
        let mut trusted = Self::new();
        for key in keys {
            trusted.insert(key)?;
        }
        Ok(trusted)
    }

    /// Add a key and return its key_id.
    pub fn insert(&mut self, key: VerifyingKey) -> Result<String> {
        let key_id = key_id_for(&key)?;
        self.keys.insert(key_id.clone(), key);
        Ok(key_id)
    }

    pub fn get(&self, key_id: &str) -> Option<&VerifyingKey> {
        self.keys.get(key_id)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn key_ids(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }

    /// Resolve the signer by `signature.key_id` and verify the record.
    pub fn verify_value<T: Serialize>(
        &self,
        unsigned: &T,
        signature: &DetachedSignature,
    ) -> Result<(), SignatureError> {
        let key = self
            .get(&signature.key_id)
            .ok_or_else(|| SignatureError::KeyNotTrusted {
                key_id: signature.key_id.clone(),
            })?;
        verify_value(unsigned, signature, key)
    }
}

/// Load a public key from SPKI PEM file.
pub fn load_public_key_pem(path: &Path) -> Result<VerifyingKey> {
    use pkcs8::DecodePublicKey;

    let pem = fs::read_to_string(path)
        .with_context(|| format!("failed to read public key: {}", path.display()))?;

    VerifyingKey::from_public_key_pem(&pem)
        .with_context(|| format!("failed to parse public key PEM: {}", path.display()))
}

/// Load a private key from PKCS#8 PEM file.
pub fn load_private_key_pem(path: &Path) -> Result<SigningKey> {
    use pkcs8::DecodePrivateKey;

    let pem = fs::read_to_string(path)
        .with_context(|| format!("failed to read private key: {}", path.display()))?;

    SigningKey::from_pkcs8_pem(&pem)
        .with_context(|| format!("failed to parse private key PEM: {}", path.display()))
}

/// Load every listed public key into one trust set.
pub fn load_trusted_keys<P: AsRef<Path>>(paths: &[P]) -> Result<TrustedKeys> {
    let mut trusted = TrustedKeys::new();
    for path in paths {
        trusted.insert(load_public_key_pem(path.as_ref())?)?;
    }
    Ok(trusted)
}
