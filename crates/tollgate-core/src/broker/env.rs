use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::crypto::jcs;

use super::{BrokerError, CredentialBroker, CredentialRequest, CredentialResponse};

pub const DEFAULT_ENV_PREFIX: &str = "TOLLGATE_BROKER_TOKEN_";

static NON_KEY_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Z0-9_]+").unwrap());

/// Reads credentials from `<prefix><KEY>` environment variables.
#[derive(Debug, Clone)]
pub struct EnvBroker {
    prefix: String,
}

impl EnvBroker {
    pub fn new(prefix: Option<&str>) -> Self {
        let prefix = prefix
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_ENV_PREFIX);
        EnvBroker {
            prefix: prefix.to_string(),
        }
    }

    /// Variable consulted for `request`.
    pub fn env_key(&self, request: &CredentialRequest) -> String {
        let name = if request.reference.is_empty() {
            &request.tool_name
        } else {
            &request.reference
        };
        format!("{}{}", self.prefix, normalize_key(name))
    }
}

impl Default for EnvBroker {
    fn default() -> Self {
        EnvBroker::new(None)
    }
}

fn normalize_key(value: &str) -> String {
    let upper = value.trim().to_uppercase();
    let key = NON_KEY_CHARS.replace_all(&upper, "_");
    let key = key.trim_matches('_');
    if key.is_empty() {
        "DEFAULT".to_string()
    } else {
        key.to_string()
    }
}

fn env_time(key: &str) -> Option<DateTime<Utc>> {
    let raw = std::env::var(key).ok()?;
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl CredentialBroker for EnvBroker {
    fn name(&self) -> &str {
        "env"
    }

    fn issue(&self, request: &CredentialRequest) -> Result<CredentialResponse, BrokerError> {
        let env_key = self.env_key(request);
        let value = std::env::var(&env_key).unwrap_or_default();
        let value = value.trim();
        if value.is_empty() {
            return Err(BrokerError::CredentialUnavailable(env_key));
        }
        let digest = jcs::sha256(value.as_bytes());
        let key_suffix = env_key.strip_prefix(&self.prefix).unwrap_or(&env_key);
        Ok(CredentialResponse {
            issued_by: "env".into(),
            credential_ref: format!("env:{}:{}", key_suffix, hex::encode(&digest[..8])),
            issued_at: env_time(&format!("{env_key}_ISSUED_AT")),
            expires_at: env_time(&format!("{env_key}_EXPIRES_AT")),
            ttl_seconds: std::env::var(format!("{env_key}_TTL_SECONDS"))
                .ok()
                .and_then(|raw| raw.trim().parse::<u64>().ok())
                .filter(|ttl| *ttl > 0),
        })
    }
}
