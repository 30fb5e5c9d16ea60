//! Field normalization shared by tokens, registry entries and records.

use chrono::{DateTime, TimeZone, Utc};

use crate::errors::GateError;
use crate::gate::intent::is_hex_digest;

/// Fallback when no producer version is supplied.
pub const DEV_PRODUCER_VERSION: &str = "0.0.0-dev";

pub fn producer_version(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        DEV_PRODUCER_VERSION.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Fixed timestamp used when the caller does not pin one, so artifacts
/// replay byte for byte.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1980, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// Trimmed, lowercased, sorted and deduplicated; blanks dropped.
pub fn lower_sorted(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn optional_digest(value: Option<&str>, field: &str) -> Result<String, GateError> {
    let digest = value.unwrap_or_default().trim().to_lowercase();
    if !digest.is_empty() && !is_hex_digest(&digest) {
        return Err(GateError::InvalidInput(format!(
            "{field} must be sha256 hex when set"
        )));
    }
    Ok(digest)
}
