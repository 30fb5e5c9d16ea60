//! Verdicts and reason codes.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Reason codes emitted by the gate. Rule-supplied codes are free-form and
/// not listed here.
pub mod reason_codes {
    // Fail-closed (F)
    pub const FAIL_CLOSED_MISSING_TARGETS: &str = "fail_closed_missing_targets";
    pub const FAIL_CLOSED_MISSING_ARG_PROVENANCE: &str = "fail_closed_missing_arg_provenance";
    pub const FAIL_CLOSED_MISSING_ENDPOINT_CLASS: &str = "fail_closed_missing_endpoint_class";
    pub const FAIL_CLOSED_MISSING_DELEGATION: &str = "fail_closed_missing_delegation";
    pub const FAIL_CLOSED_INTENT_INVALID: &str = "fail_closed_intent_invalid";

    // Matching
    pub const MATCHED_RULE_PREFIX: &str = "matched_rule_";
    pub const DEFAULT_PREFIX: &str = "default_";
    pub const PLAN_PHASE_NON_DESTRUCTIVE: &str = "plan_phase_non_destructive";
    pub const DESTRUCTIVE_APPLY_REQUIRES_APPROVAL: &str = "destructive_apply_requires_approval";

    // Rule constraints
    pub const DATAFLOW_TAINTED_DESTINATION: &str = "dataflow_tainted_destination";
    pub const ENDPOINT_PATH_DENIED: &str = "endpoint_path_denied";
    pub const ENDPOINT_PATH_NOT_ALLOWLISTED: &str = "endpoint_path_not_allowlisted";
    pub const ENDPOINT_DOMAIN_DENIED: &str = "endpoint_domain_denied";
    pub const ENDPOINT_DOMAIN_NOT_ALLOWLISTED: &str = "endpoint_domain_not_allowlisted";
    pub const ENDPOINT_EGRESS_CLASS_NOT_ALLOWED: &str = "endpoint_egress_class_not_allowed";
    pub const ENDPOINT_DESTRUCTIVE_OPERATION: &str = "endpoint_destructive_operation";
    pub const ENDPOINT_CONSTRAINT_VIOLATION: &str = "endpoint_constraint_violation";

    // Rate limiting
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    pub const RATE_LIMIT_STATE_CONTENTION: &str = "rate_limit_state_contention";
    pub const RATE_LIMIT_STATE_UNAVAILABLE: &str = "rate_limit_state_unavailable";

    // Approval
    pub const APPROVAL_TOKEN_MISSING: &str = "approval_token_missing";
    pub const APPROVAL_SIGNATURE_INVALID: &str = "approval_signature_invalid";
    pub const APPROVAL_DIGEST_MISMATCH: &str = "approval_digest_mismatch";
    pub const APPROVAL_EXPIRED: &str = "approval_expired";
    pub const APPROVAL_SCOPE_MISMATCH: &str = "approval_scope_mismatch";
    pub const APPROVAL_BOUNDS_EXCEEDED: &str = "approval_bounds_exceeded";
    pub const APPROVAL_CHAIN_INSUFFICIENT: &str = "approval_chain_insufficient";
    pub const APPROVAL_GRANTED: &str = "approval_granted";

    // Delegation
    pub const DELEGATION_TOKEN_MISSING: &str = "delegation_token_missing";
    pub const DELEGATION_SIGNATURE_INVALID: &str = "delegation_token_signature_invalid";
    pub const DELEGATION_EXPIRED: &str = "delegation_token_expired";
    pub const DELEGATION_DIGEST_MISMATCH: &str = "delegation_token_digest_mismatch";
    pub const DELEGATION_SCOPE_MISMATCH: &str = "delegation_token_scope_mismatch";
    pub const DELEGATION_CHAIN_BROKEN: &str = "delegation_chain_broken";
    pub const DELEGATION_CHAIN_TOO_DEEP: &str = "delegation_chain_too_deep";
    pub const DELEGATION_DELEGATE_MISMATCH: &str = "delegation_delegate_mismatch";
    pub const DELEGATION_CHAIN_MISMATCH: &str = "delegation_chain_mismatch";
    pub const DELEGATION_GRANTED: &str = "delegation_granted";

    // Scripts
    pub const SCRIPT_MAX_STEPS_EXCEEDED: &str = "script_max_steps_exceeded";
    pub const SCRIPT_STEP_THRESHOLD_APPROVAL: &str = "script_step_threshold_approval";
    pub const SCRIPT_MIXED_RISK_BLOCKED: &str = "script_mixed_risk_blocked";
    pub const APPROVED_SCRIPT_MATCH: &str = "approved_script_match";
    pub const APPROVED_SCRIPT_NOT_FOUND: &str = "approved_script_not_found";

    // Credential broker
    pub const BROKER_CREDENTIAL_REQUIRED: &str = "broker_credential_required";
    pub const BROKER_CREDENTIAL_MISSING: &str = "broker_credential_missing";
    pub const BROKER_CREDENTIAL_PRESENT: &str = "broker_credential_present";

    // Simulation
    pub const SIMULATE_MODE_NON_ENFORCING: &str = "simulate_mode_non_enforcing";
    pub const SIMULATED_PREFIX: &str = "simulated_";
}

/// Violation labels paired with the reason codes above.
pub mod violations {
    pub const MISSING_TARGETS: &str = "missing_targets";
    pub const MISSING_ARG_PROVENANCE: &str = "missing_arg_provenance";
    pub const MISSING_ENDPOINT_CLASS: &str = "missing_endpoint_class";
    pub const MISSING_DELEGATION: &str = "missing_delegation";
    pub const INTENT_NOT_EVALUABLE: &str = "intent_not_evaluable";
    pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
    pub const RATE_LIMIT_UNAVAILABLE: &str = "rate_limit_unavailable";
    pub const APPROVAL_NOT_GRANTED: &str = "approval_not_granted";
    pub const SCRIPT_MAX_STEPS_EXCEEDED: &str = "script_max_steps_exceeded";
    pub const SCRIPT_MIXED_RISK: &str = "script_mixed_risk";
    pub const BROKER_CREDENTIAL_MISSING: &str = "broker_credential_missing";
    pub const DESTRUCTIVE_OPERATION: &str = "destructive_operation";
    pub const TAINTED_DATAFLOW: &str = "tainted_dataflow";
    pub const ENDPOINT_CONSTRAINT_VIOLATION: &str = "endpoint_constraint_violation";
    pub const DELEGATION_NOT_VERIFIED: &str = "delegation_not_verified";
}

/// Gate decision, ordered from least to most restrictive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    DryRun,
    RequireApproval,
    Block,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::DryRun => "dry_run",
            Verdict::RequireApproval => "require_approval",
            Verdict::Block => "block",
        }
    }

    /// The stricter of `self` and `other`.
    pub fn most_restrictive(self, other: Verdict) -> Verdict {
        self.max(other)
    }

    /// Stable process exit code for this verdict.
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Allow | Verdict::DryRun => 0,
            Verdict::Block => 3,
            Verdict::RequireApproval => 4,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Verdict::Allow),
            "dry_run" => Ok(Verdict::DryRun),
            "require_approval" => Ok(Verdict::RequireApproval),
            "block" => Ok(Verdict::Block),
            other => Err(format!("unsupported verdict: {other}")),
        }
    }
}

/// Sorted, deduplicated set of codes. Reason codes and violations are always
/// reported in this form so repeated evaluations serialize identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CodeSet(BTreeSet<String>);

impl CodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: impl Into<String>) {
        let code = code.into();
        let trimmed = code.trim();
        if !trimmed.is_empty() {
            self.0.insert(trimmed.to_string());
        }
    }

    pub fn extend<I, S>(&mut self, codes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for code in codes {
            self.insert(code);
        }
    }

    pub fn merge(&mut self, other: &CodeSet) {
        self.0.extend(other.0.iter().cloned());
    }

    pub fn contains(&self, code: &str) -> bool {
        self.0.contains(code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for CodeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = CodeSet::new();
        set.extend(iter);
        set
    }
}
