//! Registry of pre-approved scripts.
//!
//! An entry pins a script hash, a policy digest and the exact tool sequence.
//! A script matching a live, signed entry skips per-step evaluation.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::crypto::signing::{self, DetachedSignature, TrustedKeys};
use crate::errors::GateError;
use crate::files;
use crate::gate::helpers::{epoch, lower_sorted};
use crate::gate::intent::{is_hex_digest, IntentRequest};
use crate::gate::verdict::reason_codes;

pub const APPROVED_SCRIPT_SCHEMA_ID: &str = "tollgate.approved_script_entry";
pub const APPROVED_SCRIPT_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovedScriptEntry {
    #[serde(default = "default_schema_id")]
    pub schema_id: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub pattern_id: String,
    pub policy_digest: String,
    pub script_hash: String,
    pub tool_sequence: Vec<String>,
    pub approver_identity: String,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default = "epoch")]
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<DetachedSignature>,
}

fn default_schema_id() -> String {
    APPROVED_SCRIPT_SCHEMA_ID.to_string()
}

fn default_schema_version() -> String {
    APPROVED_SCRIPT_SCHEMA_VERSION.to_string()
}

impl ApprovedScriptEntry {
    /// Validate and canonicalize an entry. Entries that fail here are never
    /// written and make the whole registry unreadable.
    pub fn normalize(&self) -> Result<ApprovedScriptEntry, GateError> {
        let invalid = |m: String| GateError::InvalidInput(format!("approved script entry: {m}"));
        if self.schema_id.trim() != APPROVED_SCRIPT_SCHEMA_ID {
            return Err(invalid(format!("unsupported schema_id {}", self.schema_id)));
        }
        if self.schema_version.trim() != APPROVED_SCRIPT_SCHEMA_VERSION {
            return Err(invalid(format!(
                "unsupported schema_version {}",
                self.schema_version
            )));
        }
        let entry = ApprovedScriptEntry {
            schema_id: APPROVED_SCRIPT_SCHEMA_ID.to_string(),
            schema_version: APPROVED_SCRIPT_SCHEMA_VERSION.to_string(),
            pattern_id: self.pattern_id.trim().to_string(),
            policy_digest: self.policy_digest.trim().to_lowercase(),
            script_hash: self.script_hash.trim().to_lowercase(),
            tool_sequence: self
                .tool_sequence
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            approver_identity: self.approver_identity.trim().to_string(),
            scope: lower_sorted(&self.scope),
            created_at: self.created_at,
            expires_at: self.expires_at,
            signature: self.signature.clone(),
        };
        if entry.pattern_id.is_empty() {
            return Err(invalid("pattern_id is required".into()));
        }
        if !is_hex_digest(&entry.policy_digest) {
            return Err(invalid("policy_digest must be sha256 hex".into()));
        }
        if !is_hex_digest(&entry.script_hash) {
            return Err(invalid("script_hash must be sha256 hex".into()));
        }
        if entry.tool_sequence.is_empty() {
            return Err(invalid("tool_sequence is required".into()));
        }
        if entry.approver_identity.is_empty() {
            return Err(invalid("approver_identity is required".into()));
        }
        if entry.expires_at <= entry.created_at {
            return Err(invalid("expires_at must be after created_at".into()));
        }
        Ok(entry)
    }

    fn unsigned(&self) -> ApprovedScriptEntry {
        ApprovedScriptEntry {
            signature: None,
            ..self.clone()
        }
    }

    /// Signature and expiry check for a normalized entry.
    pub fn verify(&self, keys: &TrustedKeys, now: DateTime<Utc>) -> Result<(), String> {
        let signature = self
            .signature
            .as_ref()
            .ok_or_else(|| "signature is required".to_string())?;
        if now >= self.expires_at {
            return Err("entry is expired".to_string());
        }
        keys.verify_value(&self.unsigned(), signature)
            .map_err(|e| e.to_string())
    }
}

/// Inputs for minting a registry entry.
#[derive(Debug, Clone)]
pub struct MintApprovedScript {
    pub pattern_id: String,
    pub policy_digest: String,
    /// A normalized script intent. Supplies the hash and tool sequence.
    pub script: IntentRequest,
    pub approver_identity: String,
    pub scope: Vec<String>,
    pub ttl: Duration,
    pub now: DateTime<Utc>,
}

pub fn mint(opts: &MintApprovedScript, key: &SigningKey) -> Result<ApprovedScriptEntry, GateError> {
    if opts.ttl <= Duration::zero() {
        return Err(GateError::InvalidInput("ttl must be greater than 0".into()));
    }
    let script = opts
        .script
        .script
        .as_ref()
        .ok_or_else(|| GateError::InvalidInput("intent is not a script".into()))?;
    let script_hash = opts
        .script
        .script_hash
        .clone()
        .ok_or_else(|| GateError::InvalidInput("script intent is not normalized".into()))?;

    let mut entry = ApprovedScriptEntry {
        schema_id: APPROVED_SCRIPT_SCHEMA_ID.to_string(),
        schema_version: APPROVED_SCRIPT_SCHEMA_VERSION.to_string(),
        pattern_id: opts.pattern_id.clone(),
        policy_digest: opts.policy_digest.clone(),
        script_hash,
        tool_sequence: script.steps.iter().map(|s| s.tool_name.clone()).collect(),
        approver_identity: opts.approver_identity.clone(),
        scope: opts.scope.clone(),
        created_at: opts.now,
        expires_at: opts.now + opts.ttl,
        signature: None,
    }
    .normalize()?;
    entry.signature = Some(signing::sign_value(&entry, key)?);
    Ok(entry)
}

/// Result of a registry lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryMatch {
    pub matched: bool,
    pub pattern_id: Option<String>,
    pub reason: &'static str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryFile {
    Envelope { entries: Vec<ApprovedScriptEntry> },
    Bare(Vec<ApprovedScriptEntry>),
}

#[derive(Serialize)]
struct RegistryEnvelope<'a> {
    entries: &'a [ApprovedScriptEntry],
}

/// In-memory registry of approved-script entries.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: Vec<ApprovedScriptEntry>,
}

impl Registry {
    pub fn new(entries: Vec<ApprovedScriptEntry>) -> Result<Self, GateError> {
        let mut entries = entries
            .iter()
            .enumerate()
            .map(|(i, e)| {
                e.normalize().map_err(|err| {
                    GateError::InvalidInput(format!("registry entries[{i}]: {err}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| {
            a.pattern_id
                .cmp(&b.pattern_id)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(Registry { entries })
    }

    /// Load from disk. A missing or blank file is an empty registry.
    pub fn load(path: &Path) -> Result<Self, GateError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "approved script registry absent");
                return Ok(Registry::default());
            }
            Err(e) => {
                return Err(GateError::io(
                    format!("read approved script registry {}", path.display()),
                    e,
                ))
            }
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Registry::default());
        }
        let file: RegistryFile = serde_json::from_slice(&raw).map_err(|e| {
            GateError::InvalidInput(format!(
                "parse approved script registry {}: {e}",
                path.display()
            ))
        })?;
        let entries = match file {
            RegistryFile::Envelope { entries } | RegistryFile::Bare(entries) => entries,
        };
        Registry::new(entries)
    }

    pub fn write(&self, path: &Path) -> Result<(), GateError> {
        files::write_json_atomic(
            path,
            &RegistryEnvelope {
                entries: &self.entries,
            },
        )
    }

    /// Add an entry, replacing any entry with the same pattern id.
    pub fn upsert(&mut self, entry: ApprovedScriptEntry) -> Result<(), GateError> {
        let entry = entry.normalize()?;
        self.entries.retain(|e| e.pattern_id != entry.pattern_id);
        self.entries.push(entry);
        self.entries.sort_by(|a, b| {
            a.pattern_id
                .cmp(&b.pattern_id)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(())
    }

    pub fn entries(&self) -> &[ApprovedScriptEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find a live, signed entry for a normalized script intent. Stale or
    /// unverifiable entries count as absent.
    pub fn lookup(
        &self,
        intent: &IntentRequest,
        policy_digest: &str,
        keys: &TrustedKeys,
        now: DateTime<Utc>,
    ) -> RegistryMatch {
        let not_found = RegistryMatch {
            matched: false,
            pattern_id: None,
            reason: reason_codes::APPROVED_SCRIPT_NOT_FOUND,
        };
        let (Some(script), Some(script_hash)) = (&intent.script, &intent.script_hash) else {
            return not_found;
        };
        let sequence: Vec<&str> = script.steps.iter().map(|s| s.tool_name.as_str()).collect();
        let policy_digest = policy_digest.trim().to_lowercase();

        for entry in &self.entries {
            if entry.script_hash != *script_hash
                || entry.policy_digest != policy_digest
                || !entry.tool_sequence.iter().map(String::as_str).eq(sequence.iter().copied())
            {
                continue;
            }
            match entry.verify(keys, now) {
                Ok(()) => {
                    tracing::debug!(pattern_id = %entry.pattern_id, "approved script matched");
                    return RegistryMatch {
                        matched: true,
                        pattern_id: Some(entry.pattern_id.clone()),
                        reason: reason_codes::APPROVED_SCRIPT_MATCH,
                    };
                }
                Err(reason) => {
                    tracing::debug!(pattern_id = %entry.pattern_id, %reason, "approved script entry skipped");
                }
            }
        }
        not_found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn script() -> IntentRequest {
        serde_json::from_value::<IntentRequest>(json!({
            "tool_name": "script",
            "script": {"steps": [
                {"tool_name": "tool.read", "targets": [{"kind": "path", "value": "/a", "operation": "read"}]},
                {"tool_name": "tool.write", "targets": [{"kind": "path", "value": "/b", "operation": "write"}]}
            ]},
            "context": {"identity": "agent", "workspace": "/w", "risk_class": "low"}
        }))
        .unwrap()
        .normalize()
        .unwrap()
    }

    fn policy_digest() -> String {
        "a".repeat(64)
    }

    fn entry(key: &SigningKey, ttl: Duration) -> ApprovedScriptEntry {
        mint(
            &MintApprovedScript {
                pattern_id: "read-then-write".into(),
                policy_digest: policy_digest(),
                script: script(),
                approver_identity: "secops".into(),
                scope: vec!["Team:Platform".into()],
                ttl,
                now: now(),
            },
            key,
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_matches_signed_entry() {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let keys = TrustedKeys::from_keys([key.verifying_key()]).unwrap();
        let registry = Registry::new(vec![entry(&key, Duration::hours(1))]).unwrap();

        let hit = registry.lookup(&script(), &policy_digest(), &keys, now());
        assert!(hit.matched);
        assert_eq!(hit.pattern_id.as_deref(), Some("read-then-write"));
        assert_eq!(hit.reason, "approved_script_match");

        let other_policy = registry.lookup(&script(), &"b".repeat(64), &keys, now());
        assert!(!other_policy.matched);
        assert_eq!(other_policy.reason, "approved_script_not_found");
    }

    #[test]
    fn test_expired_or_untrusted_entry_is_absent() {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let keys = TrustedKeys::from_keys([key.verifying_key()]).unwrap();
        let registry = Registry::new(vec![entry(&key, Duration::minutes(5))]).unwrap();
        let later = now() + Duration::minutes(5);
        assert!(!registry.lookup(&script(), &policy_digest(), &keys, later).matched);

        let stranger = SigningKey::generate(&mut rand::thread_rng());
        let stranger_keys = TrustedKeys::from_keys([stranger.verifying_key()]).unwrap();
        assert!(!registry
            .lookup(&script(), &policy_digest(), &stranger_keys, now())
            .matched);
    }

    #[test]
    fn test_tampered_sequence_fails_signature() {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let keys = TrustedKeys::from_keys([key.verifying_key()]).unwrap();
        let mut tampered = entry(&key, Duration::hours(1));
        tampered.approver_identity = "mallory".into();
        let registry = Registry::new(vec![tampered]).unwrap();
        assert!(!registry.lookup(&script(), &policy_digest(), &keys, now()).matched);
    }

    #[test]
    fn test_load_missing_envelope_and_bare_array() {
        let dir = tempdir().unwrap();
        let missing = Registry::load(&dir.path().join("none.json")).unwrap();
        assert!(missing.is_empty());

        let key = SigningKey::generate(&mut rand::thread_rng());
        let e = entry(&key, Duration::hours(1));

        let path = dir.path().join("registry.json");
        Registry::new(vec![e.clone()]).unwrap().write(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\n  \"entries\""));
        assert_eq!(Registry::load(&path).unwrap().entries(), &[e.clone()]);

        let bare = dir.path().join("bare.json");
        std::fs::write(&bare, serde_json::to_vec(&vec![e.clone()]).unwrap()).unwrap();
        assert_eq!(Registry::load(&bare).unwrap().entries(), &[e]);

        let blank = dir.path().join("blank.json");
        std::fs::write(&blank, "  \n").unwrap();
        assert!(Registry::load(&blank).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_entries_are_rejected() {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let mut bad = entry(&key, Duration::hours(1));
        bad.script_hash = "xyz".into();
        let err = Registry::new(vec![bad]).unwrap_err();
        assert!(err.to_string().contains("entries[0]"));

        let not_script = serde_json::from_value::<IntentRequest>(json!({
            "tool_name": "tool.read",
            "context": {"identity": "a", "workspace": "/w", "risk_class": "low"}
        }))
        .unwrap()
        .normalize()
        .unwrap();
        let err = mint(
            &MintApprovedScript {
                pattern_id: "p".into(),
                policy_digest: policy_digest(),
                script: not_script,
                approver_identity: "secops".into(),
                scope: vec![],
                ttl: Duration::hours(1),
                now: now(),
            },
            &key,
        )
        .unwrap_err();
        assert!(matches!(err, GateError::InvalidInput(_)));
    }

    #[test]
    fn test_upsert_replaces_pattern() {
        let key = SigningKey::generate(&mut rand::thread_rng());
        let mut registry = Registry::default();
        registry.upsert(entry(&key, Duration::hours(1))).unwrap();
        registry.upsert(entry(&key, Duration::hours(2))).unwrap();
        assert_eq!(registry.entries().len(), 1);
        assert_eq!(registry.entries()[0].expires_at, now() + Duration::hours(2));
    }
}
