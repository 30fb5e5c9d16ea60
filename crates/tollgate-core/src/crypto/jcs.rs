//! JSON Canonicalization Scheme (RFC 8785) and content digests.
//!
//! Every stable identifier in the gate (intent digest, policy digest, script
//! hash, token binding, signed trace digest) reduces to [`digest`] over the
//! canonical bytes produced here. Uses `serde_jcs`, which guarantees:
//!
//! - Lexicographic key ordering (per JCS sorting rules)
//! - No whitespace between tokens
//! - Numbers serialized per ECMAScript/IEEE 754 constraints
//! - Unicode preserved as-is (no normalization)

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Serialize a value to JCS canonical JSON bytes.
pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_jcs::to_vec(value).context("JCS canonicalization failed")
}

/// Serialize to JCS canonical JSON string.
pub fn to_string<T: Serialize>(value: &T) -> Result<String> {
    serde_jcs::to_string(value).context("JCS canonicalization failed")
}

/// Re-canonicalize raw JSON text.
///
/// Canonicalizing output of this function again returns identical bytes.
pub fn canonicalize_bytes(raw: &[u8]) -> Result<Vec<u8>> {
    let value: serde_json::Value =
        serde_json::from_slice(raw).context("input is not valid JSON")?;
    to_vec(&value)
}

/// Raw SHA-256 of arbitrary bytes.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let hash = Sha256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(hash.as_slice());
    out
}

/// Lowercase hex SHA-256 of arbitrary bytes.
pub fn digest_bytes(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}

/// Lowercase hex SHA-256 of the canonical form of `value`.
pub fn digest<T: Serialize>(value: &T) -> Result<String> {
    let canonical = to_vec(value)?;
    Ok(digest_bytes(&canonical))
}

/// Short deterministic identifier: the first 12 bytes of SHA-256 over the
/// parts joined with `:`, hex encoded.
pub fn short_id(parts: &[&str]) -> String {
    let hash = sha256(parts.join(":").as_bytes());
    hex::encode(&hash[..12])
}
