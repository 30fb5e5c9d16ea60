//! Signed approval tokens.
//!
//! An approval binds one approver's consent to an exact intent digest and
//! policy digest, for a scope and until an expiry.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::crypto::jcs;
use crate::crypto::signing::{self, DetachedSignature, TrustedKeys};
use crate::errors::GateError;
use crate::files;
use crate::gate::evidence::ApprovalAuditEntry;
use crate::gate::helpers::{lower_sorted, optional_digest, producer_version};
use crate::gate::intent::{IntentRequest, PHASE_APPLY};
use crate::gate::verdict::{reason_codes, CodeSet};

pub const APPROVAL_TOKEN_SCHEMA_ID: &str = "tollgate.approval_token";
pub const APPROVAL_TOKEN_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub schema_id: String,
    pub schema_version: String,
    pub created_at: DateTime<Utc>,
    pub producer_version: String,
    pub token_id: String,
    pub approver_identity: String,
    pub reason_code: String,
    pub intent_digest: String,
    pub policy_digest: String,
    pub scope: Vec<String>,
    /// Zero means unbounded.
    #[serde(default)]
    pub max_targets: usize,
    #[serde(default)]
    pub max_ops: usize,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<DetachedSignature>,
}

impl ApprovalToken {
    pub fn read(path: &Path) -> Result<Self, GateError> {
        files::read_json(path)
    }

    pub fn write(&self, path: &Path) -> Result<(), GateError> {
        files::write_json_atomic(path, self)
    }

    fn unsigned(&self) -> ApprovalToken {
        ApprovalToken {
            signature: None,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct MintApproval {
    pub approver_identity: String,
    pub reason_code: String,
    pub intent_digest: String,
    pub policy_digest: String,
    pub scope: Vec<String>,
    pub max_targets: usize,
    pub max_ops: usize,
    pub ttl: Duration,
    pub now: DateTime<Utc>,
    pub producer_version: String,
}

pub fn mint(opts: &MintApproval, key: &SigningKey) -> Result<ApprovalToken, GateError> {
    let invalid = |m: &str| GateError::InvalidInput(m.to_string());
    if opts.ttl <= Duration::zero() {
        return Err(invalid("ttl must be greater than 0"));
    }
    let intent_digest = optional_digest(Some(opts.intent_digest.as_str()), "intent_digest")?;
    let policy_digest = optional_digest(Some(opts.policy_digest.as_str()), "policy_digest")?;
    if intent_digest.is_empty() || policy_digest.is_empty() {
        return Err(invalid("intent_digest and policy_digest are required"));
    }
    let approver = opts.approver_identity.trim().to_string();
    if approver.is_empty() {
        return Err(invalid("approver identity is required"));
    }
    let reason_code = opts.reason_code.trim().to_string();
    if reason_code.is_empty() {
        return Err(invalid("reason code is required"));
    }
    let scope = lower_sorted(&opts.scope);
    if scope.is_empty() {
        return Err(invalid("scope must include at least one value"));
    }
    let expires_at = opts.now + opts.ttl;
    let token_id = jcs::short_id(&[
        &intent_digest,
        &policy_digest,
        &approver,
        &reason_code,
        &scope.join(","),
        &opts.max_targets.to_string(),
        &opts.max_ops.to_string(),
        &expires_at.to_rfc3339(),
    ]);

    let mut token = ApprovalToken {
        schema_id: APPROVAL_TOKEN_SCHEMA_ID.to_string(),
        schema_version: APPROVAL_TOKEN_SCHEMA_VERSION.to_string(),
        created_at: opts.now,
        producer_version: producer_version(&opts.producer_version),
        token_id,
        approver_identity: approver,
        reason_code,
        intent_digest,
        policy_digest,
        scope,
        max_targets: opts.max_targets,
        max_ops: opts.max_ops,
        expires_at,
        signature: None,
    };
    token.signature = Some(signing::sign_value(&token, key)?);
    Ok(token)
}

/// Scope an approval must carry for `intent`: the tool, plus the apply-phase
/// and destructive markers for destructive applies.
pub fn required_scope(intent: &IntentRequest) -> Vec<String> {
    let mut scope = vec![format!("tool:{}", intent.tool_name)];
    if intent.context.phase == PHASE_APPLY && intent.has_destructive_target() {
        scope.push("phase:apply".to_string());
        scope.push("destructive:apply".to_string());
    }
    lower_sorted(&scope)
}

/// True when `granted` covers every entry of `required`. `*` covers all.
pub fn scope_covers(required: &[String], granted: &[String]) -> bool {
    if granted.iter().any(|s| s == "*") {
        return true;
    }
    let granted: BTreeSet<&str> = granted.iter().map(String::as_str).collect();
    required.iter().all(|s| granted.contains(s.as_str()))
}

/// What every approval is checked against.
#[derive(Debug, Clone)]
pub struct ApprovalCheck {
    pub intent_digest: String,
    pub policy_digest: String,
    pub required_scope: Vec<String>,
    pub target_count: usize,
    pub op_count: usize,
    pub now: DateTime<Utc>,
}

impl ApprovalCheck {
    pub fn for_intent(intent: &IntentRequest, policy_digest: &str, now: DateTime<Utc>) -> Self {
        ApprovalCheck {
            intent_digest: intent.intent_digest.clone().unwrap_or_default(),
            policy_digest: policy_digest.to_string(),
            required_scope: required_scope(intent),
            target_count: intent.targets.len(),
            op_count: intent.operation_count(),
            now,
        }
    }
}

/// Verify one token. Checks run in a fixed order and the first failure wins.
pub fn verify_token(
    token: &ApprovalToken,
    keys: &TrustedKeys,
    check: &ApprovalCheck,
) -> Result<(), &'static str> {
    let signature = token
        .signature
        .as_ref()
        .ok_or(reason_codes::APPROVAL_SIGNATURE_INVALID)?;
    if token.schema_id != APPROVAL_TOKEN_SCHEMA_ID {
        return Err(reason_codes::APPROVAL_SIGNATURE_INVALID);
    }
    keys.verify_value(&token.unsigned(), signature)
        .map_err(|_| reason_codes::APPROVAL_SIGNATURE_INVALID)?;

    if !token.intent_digest.eq_ignore_ascii_case(&check.intent_digest) {
        return Err(reason_codes::APPROVAL_DIGEST_MISMATCH);
    }
    if !token.policy_digest.eq_ignore_ascii_case(&check.policy_digest) {
        return Err(reason_codes::APPROVAL_DIGEST_MISMATCH);
    }
    if check.now >= token.expires_at {
        return Err(reason_codes::APPROVAL_EXPIRED);
    }
    if !scope_covers(&check.required_scope, &token.scope) {
        return Err(reason_codes::APPROVAL_SCOPE_MISMATCH);
    }
    if (token.max_targets > 0 && check.target_count > token.max_targets)
        || (token.max_ops > 0 && check.op_count > token.max_ops)
    {
        return Err(reason_codes::APPROVAL_BOUNDS_EXCEEDED);
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApprovalStatus {
    pub granted: bool,
    pub required: u32,
    /// Distinct approvers among the tokens that verified.
    pub valid: u32,
    pub reason_codes: CodeSet,
    /// Comma-joined ids of the tokens that verified.
    pub token_ref: Option<String>,
    /// One entry per presented token, in presentation order.
    pub entries: Vec<ApprovalAuditEntry>,
}

/// Verify all presented approvals against `required` distinct approvers.
pub fn evaluate_approvals(
    tokens: &[ApprovalToken],
    keys: &TrustedKeys,
    check: &ApprovalCheck,
    required: u32,
) -> ApprovalStatus {
    let mut status = ApprovalStatus {
        required,
        ..ApprovalStatus::default()
    };
    if tokens.is_empty() {
        status.reason_codes.insert(reason_codes::APPROVAL_TOKEN_MISSING);
        return status;
    }

    let mut approvers = BTreeSet::new();
    let mut ids = BTreeSet::new();
    for token in tokens {
        let result = verify_token(token, keys, check);
        match result {
            Ok(()) => {
                approvers.insert(token.approver_identity.clone());
                ids.insert(token.token_id.clone());
            }
            Err(code) => {
                tracing::debug!(token_id = %token.token_id, code, "approval rejected");
                status.reason_codes.insert(code);
            }
        }
        status.entries.push(ApprovalAuditEntry {
            token_id: token.token_id.clone(),
            approver_identity: token.approver_identity.clone(),
            reason_code: token.reason_code.clone(),
            scope: token.scope.clone(),
            expires_at: token.expires_at,
            valid: result.is_ok(),
            error_code: result.err().unwrap_or_default().to_string(),
        });
    }
    status.valid = approvers.len() as u32;
    if !ids.is_empty() {
        status.token_ref = Some(ids.into_iter().collect::<Vec<_>>().join(","));
    }

    if status.valid >= required {
        status.granted = true;
        status.reason_codes.clear();
        status.reason_codes.insert(reason_codes::APPROVAL_GRANTED);
    } else if status.valid > 0 {
        status.reason_codes.insert(reason_codes::APPROVAL_CHAIN_INSUFFICIENT);
    }
    status
}
