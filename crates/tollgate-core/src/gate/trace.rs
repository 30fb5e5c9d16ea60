//! Signed decision traces.

use std::path::Path;

use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::crypto::jcs;
use crate::crypto::signing::{self, DetachedSignature, SignatureError, TrustedKeys};
use crate::errors::GateError;
use crate::files;
use crate::gate::intent::IntentRequest;
use crate::gate::script::StepVerdict;
use crate::gate::verdict::Verdict;

pub const TRACE_SCHEMA_ID: &str = "tollgate.trace";
pub const TRACE_SCHEMA_VERSION: &str = "1.0.0";

/// Delegation context carried into the trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRef {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_ref: String,
    pub requester_identity: String,
    pub depth: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope_class: String,
    pub chain_digest: String,
    #[serde(default)]
    pub reason_codes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub schema_id: String,
    pub schema_version: String,
    pub created_at: DateTime<Utc>,
    pub producer_version: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
    pub tool_name: String,
    pub args_digest: String,
    pub intent_digest: String,
    pub policy_digest: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub reason_codes: Vec<String>,
    #[serde(default)]
    pub violations: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub matched_rule: String,
    #[serde(default)]
    pub latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_token_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<DelegationRef>,
    #[serde(default)]
    pub script: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub step_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_risk_class: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_verdicts: Vec<StepVerdict>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub pre_approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<DetachedSignature>,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// Deterministic trace id for a decision.
pub fn trace_id(policy_digest: &str, intent_digest: &str, verdict: Verdict) -> String {
    jcs::short_id(&[policy_digest, intent_digest, verdict.as_str()])
}

impl TraceRecord {
    /// Unsigned record for a normalized intent. Optional fields start empty.
    pub fn build(
        intent: &IntentRequest,
        policy_digest: &str,
        verdict: Verdict,
        created_at: DateTime<Utc>,
        producer_version: &str,
    ) -> Result<Self, GateError> {
        let intent_digest = intent
            .intent_digest
            .clone()
            .ok_or_else(|| GateError::Internal("intent digest missing after normalization".into()))?;
        Ok(TraceRecord {
            schema_id: TRACE_SCHEMA_ID.to_string(),
            schema_version: TRACE_SCHEMA_VERSION.to_string(),
            created_at,
            producer_version: producer_version.to_string(),
            trace_id: trace_id(policy_digest, &intent_digest, verdict),
            correlation_id: String::new(),
            tool_name: intent.tool_name.clone(),
            args_digest: intent.args_digest.clone().unwrap_or_default(),
            intent_digest,
            policy_digest: policy_digest.to_string(),
            verdict,
            reason_codes: Vec::new(),
            violations: Vec::new(),
            matched_rule: String::new(),
            latency_ms: 0.0,
            approval_token_ref: None,
            delegation: None,
            script: intent.is_script(),
            step_count: intent.script.as_ref().map_or(0, |s| s.steps.len()),
            script_hash: intent.script_hash.clone(),
            composite_risk_class: None,
            step_verdicts: Vec::new(),
            pre_approved: false,
            pattern_id: None,
            registry_reason: None,
            signature: None,
        })
    }

    /// Negative or non-finite latencies are recorded as zero.
    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = if latency_ms.is_finite() && latency_ms > 0.0 {
            latency_ms
        } else {
            0.0
        };
        self
    }

    pub fn unsigned(&self) -> TraceRecord {
        TraceRecord {
            signature: None,
            ..self.clone()
        }
    }

    pub fn sign(&mut self, key: &SigningKey) -> Result<(), GateError> {
        self.signature = None;
        self.signature = Some(signing::sign_value(self, key)?);
        Ok(())
    }

    pub fn verify(&self, key: &VerifyingKey) -> Result<(), SignatureError> {
        let signature = self.signature.as_ref().ok_or(SignatureError::Missing)?;
        signing::verify_value(&self.unsigned(), signature, key)
    }

    pub fn verify_trusted(&self, keys: &TrustedKeys) -> Result<(), SignatureError> {
        let signature = self.signature.as_ref().ok_or(SignatureError::Missing)?;
        keys.verify_value(&self.unsigned(), signature)
    }

    pub fn read(path: &Path) -> Result<Self, GateError> {
        files::read_json(path)
    }
}

/// Digest over a delegation claim, recorded instead of the chain itself.
pub fn delegation_chain_digest(intent: &IntentRequest) -> Result<Option<String>, GateError> {
    match &intent.delegation {
        Some(claim) => Ok(Some(jcs::digest(claim)?)),
        None => Ok(None),
    }
}

pub fn write_trace(path: &Path, record: &TraceRecord) -> Result<(), GateError> {
    files::write_json_atomic(path, record)?;
    tracing::debug!(path = %path.display(), trace_id = %record.trace_id, "trace written");
    Ok(())
}
