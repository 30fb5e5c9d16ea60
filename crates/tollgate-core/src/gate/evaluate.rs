//! Gate orchestration.
//!
//! [`evaluate`] runs one intent through the whole pipeline: normalization,
//! fail-closed validation, script governance or rule matching, rate limits,
//! approvals, credential brokering and simulate-mode rewriting. It always
//! produces a trace for the final verdict.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::broker::{self, CredentialBroker, CredentialRequest};
use crate::crypto::jcs;
use crate::crypto::signing::TrustedKeys;
use crate::errors::GateError;
use crate::gate::approval::{self, ApprovalCheck, ApprovalToken};
use crate::gate::delegation::{self, ChainContext, DelegationStatus, DelegationToken};
use crate::gate::evidence::{
    ApprovalAuditEntry, ApprovalAuditRecord, BrokerCredentialRecord, DelegationAuditRecord,
    GateEvidence, RecordHeader,
};
use crate::gate::fail_closed::{self, FailClosedFindings};
use crate::gate::intent::IntentRequest;
use crate::gate::matcher::{self, Decision};
use crate::gate::policy::{FailClosedPolicy, Policy};
use crate::gate::rate_limit::{RateLimitDecision, RateLimitStore};
use crate::gate::helpers;
use crate::gate::registry::Registry;
use crate::gate::script::{self, RegistryCheck, StepVerdict};
use crate::gate::trace::{self, DelegationRef, TraceRecord};
use crate::gate::verdict::{reason_codes, violations, CodeSet, Verdict};

/// Evaluation profile. `strict` refuses to run without the evidence a
/// production deployment needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Standard,
    Strict,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Standard => "standard",
            Profile::Strict => "strict",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "standard" => Ok(Profile::Standard),
            "strict" => Ok(Profile::Strict),
            other => Err(GateError::InvalidInput(format!("unsupported profile: {other}"))),
        }
    }
}

/// Everything an evaluation may consult besides the policy and intent.
#[derive(Debug)]
pub struct EvaluateOptions {
    /// Clock used for token expiry, registry expiry and rate-limit buckets.
    pub now: DateTime<Utc>,
    /// Trace timestamp. Defaults to 1980-01-01 so traces replay identically.
    pub created_at: Option<DateTime<Utc>>,
    pub producer_version: String,
    pub profile: Profile,
    pub simulate: bool,
    pub approval_tokens: Vec<ApprovalToken>,
    pub approval_keys: TrustedKeys,
    /// Delegation chain, delegator first.
    pub delegation_tokens: Vec<DelegationToken>,
    pub delegation_keys: TrustedKeys,
    pub registry: Option<Registry>,
    pub registry_keys: TrustedKeys,
    pub rate_limit_store: Option<RateLimitStore>,
    pub broker: Option<Box<dyn CredentialBroker>>,
    /// Overrides the matched rule's `broker_reference`.
    pub credential_reference: Option<String>,
    /// Added to the matched rule's `broker_scopes`.
    pub credential_scopes: Vec<String>,
    pub signing_key: Option<SigningKey>,
    pub correlation_id: Option<String>,
    /// Recorded latency. Measured when unset.
    pub latency_ms: Option<f64>,
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        EvaluateOptions {
            now: Utc::now(),
            created_at: None,
            producer_version: String::new(),
            profile: Profile::default(),
            simulate: false,
            approval_tokens: Vec::new(),
            approval_keys: TrustedKeys::new(),
            delegation_tokens: Vec::new(),
            delegation_keys: TrustedKeys::new(),
            registry: None,
            registry_keys: TrustedKeys::new(),
            rate_limit_store: None,
            broker: None,
            credential_reference: None,
            credential_scopes: Vec::new(),
            signing_key: None,
            correlation_id: None,
            latency_ms: None,
        }
    }
}

/// The JSON result of an evaluation. Field names are stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateOutput {
    pub ok: bool,
    pub verdict: Verdict,
    pub reason_codes: Vec<String>,
    pub violations: Vec<String>,
    pub matched_rule: String,
    pub simulate_mode: bool,

    pub script: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub step_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub composite_risk_class: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_verdicts: Vec<StepVerdict>,
    #[serde(default)]
    pub pre_approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_reason: Option<String>,

    pub policy_digest: String,
    pub intent_digest: String,
    pub trace_id: String,

    #[serde(default)]
    pub required_approvals: u32,
    #[serde(default)]
    pub valid_approvals: u32,
    #[serde(default)]
    pub valid_delegations: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_ref: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_used: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_remaining: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_issuer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_issued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ttl_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulated_verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub simulated_reason_codes: Vec<String>,
    #[serde(default)]
    pub would_have_blocked: bool,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// Result of [`evaluate`]: the JSON output, its (possibly signed) trace and
/// the audit records that apply.
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub output: GateOutput,
    pub trace: TraceRecord,
    pub evidence: GateEvidence,
}

impl GateOutcome {
    pub fn verdict(&self) -> Verdict {
        self.output.verdict
    }

    /// Exit code for the verdict.
    pub fn exit_code(&self) -> i32 {
        self.output.verdict.exit_code()
    }
}

/// Script-only facts carried into the output and trace.
#[derive(Debug, Default)]
struct ScriptFacts {
    composite_risk: Option<String>,
    step_verdicts: Vec<StepVerdict>,
    pre_approved: bool,
    pattern_id: Option<String>,
    registry_reason: Option<String>,
}

/// Evaluate `intent` against `policy`.
///
/// Returns `Err` only for invalid input (including a strict-profile
/// misconfiguration) and internal failures. Every other problem resolves to
/// a non-allow verdict.
pub fn evaluate(
    policy: &Policy,
    intent: &IntentRequest,
    opts: &EvaluateOptions,
) -> Result<GateOutcome, GateError> {
    let started = Instant::now();
    check_profile(policy, opts)?;

    let policy_digest = policy.digest()?;
    let closed_policy = effective_fail_closed(policy, opts.profile);

    let normalized = match intent.normalize() {
        Ok(normalized) => normalized,
        Err(err) if closed_policy.applies_to(&intent.context.risk_class) => {
            tracing::info!(error = %err, "intent not evaluable under fail-closed risk class");
            let findings = FailClosedFindings::not_evaluable();
            let raw = unevaluable_intent(intent)?;
            let decision = Decision::block(findings.reason_codes, findings.violations);
            return finish(
                Pipeline::new(&raw, &policy_digest, decision),
                opts,
                started,
            );
        }
        Err(err) => return Err(err),
    };

    if let Some(findings) = fail_closed::check(&closed_policy, &normalized).filter(|f| !f.is_empty())
    {
        tracing::info!(
            risk_class = %normalized.context.risk_class,
            reasons = ?findings.reason_codes,
            "fail-closed evidence missing"
        );
        let decision = Decision::block(findings.reason_codes, findings.violations);
        return finish(Pipeline::new(&normalized, &policy_digest, decision), opts, started);
    }

    let mut pipeline = if normalized.is_script() {
        evaluate_script_intent(policy, &normalized, &closed_policy, &policy_digest, opts)?
    } else {
        let status = verify_delegation(&normalized, &policy_digest, opts);
        let decision = decide(policy, &normalized, &closed_policy, &status);
        let mut pipeline = Pipeline::new(&normalized, &policy_digest, decision);
        pipeline.delegation = Some(status);
        pipeline
    };

    pipeline.apply_rate_limit(opts);
    pipeline.apply_approvals(opts);
    pipeline.apply_broker(opts);
    finish(pipeline, opts, started)
}

fn check_profile(policy: &Policy, opts: &EvaluateOptions) -> Result<(), GateError> {
    if opts.profile != Profile::Strict {
        return Ok(());
    }
    let invalid = |m: &str| Err(GateError::InvalidInput(format!("strict profile: {m}")));
    if opts.simulate {
        return invalid("simulate mode is not allowed");
    }
    if !opts.approval_tokens.is_empty() && opts.approval_keys.is_empty() {
        return invalid("approval tokens require approval public keys");
    }
    if policy.requires_broker() && opts.broker.is_none() {
        return invalid("policy requires broker credentials but no broker is configured");
    }
    if opts.signing_key.is_none() {
        return invalid("a trace signing key is required");
    }
    Ok(())
}

fn effective_fail_closed(policy: &Policy, profile: Profile) -> FailClosedPolicy {
    if profile == Profile::Strict && !policy.fail_closed.enabled {
        FailClosedPolicy::strict_default()
    } else {
        policy.fail_closed.clone()
    }
}

/// Best-effort identity for an intent that failed normalization, so the
/// block can still be traced. Digests cover the raw request.
fn unevaluable_intent(intent: &IntentRequest) -> Result<IntentRequest, GateError> {
    let mut raw = intent.clone();
    raw.tool_name = raw.tool_name.trim().to_lowercase();
    raw.args_digest = Some(jcs::digest(&intent.args)?);
    raw.intent_digest = Some(jcs::digest(intent)?);
    raw.script_hash = None;
    Ok(raw)
}

fn verify_delegation(
    intent: &IntentRequest,
    policy_digest: &str,
    opts: &EvaluateOptions,
) -> DelegationStatus {
    let requester = intent
        .delegation
        .as_ref()
        .map(|d| d.requester_identity.as_str())
        .filter(|r| !r.is_empty())
        .unwrap_or(&intent.context.identity);
    let claim = intent
        .delegation
        .as_ref()
        .map(|d| d.chain.as_slice())
        .unwrap_or_default();
    let intent_digest = intent.intent_digest.as_deref().unwrap_or_default();
    delegation::verify_chain(
        &opts.delegation_tokens,
        &opts.delegation_keys,
        &ChainContext {
            tool_name: &intent.tool_name,
            intent_digest,
            policy_digest,
            requester_identity: requester,
            claim,
            now: opts.now,
        },
    )
}

/// Single-intent decision: fail-closed, then first-match-wins.
fn decide(
    policy: &Policy,
    intent: &IntentRequest,
    closed_policy: &FailClosedPolicy,
    delegation: &DelegationStatus,
) -> Decision {
    if let Some(findings) = fail_closed::check(closed_policy, intent).filter(|f| !f.is_empty()) {
        return Decision::block(findings.reason_codes, findings.violations);
    }
    matcher::resolve(policy, intent, delegation).into_decision()
}

fn evaluate_script_intent<'i>(
    policy: &Policy,
    intent: &'i IntentRequest,
    closed_policy: &FailClosedPolicy,
    policy_digest: &'i str,
    opts: &EvaluateOptions,
) -> Result<Pipeline<'i>, GateError> {
    let registry = opts.registry.as_ref().map(|registry| RegistryCheck {
        registry,
        keys: &opts.registry_keys,
        policy_digest,
        now: opts.now,
    });

    // Steps are bound to the script's intent digest, which is what tokens
    // minted for the script carry.
    let parent_digest = intent.intent_digest.clone().unwrap_or_default();
    let mut statuses: Vec<DelegationStatus> = Vec::new();
    let outcome = script::evaluate_script(policy, intent, registry, |step| {
        let mut bound = step.clone();
        bound.intent_digest = Some(parent_digest.clone());
        let status = verify_delegation(&bound, policy_digest, opts);
        let decision = decide(policy, step, closed_policy, &status);
        statuses.push(status);
        Ok(decision)
    })?;

    let mut pipeline = Pipeline::new(intent, policy_digest, outcome.decision);
    pipeline.script = ScriptFacts {
        composite_risk: Some(outcome.composite_risk.to_string()),
        step_verdicts: outcome.step_verdicts,
        pre_approved: outcome.pre_approved,
        pattern_id: outcome.pattern_id,
        registry_reason: outcome.registry_reason.map(str::to_string),
    };
    // The weakest step decides how much of the chain counts.
    pipeline.delegation = statuses.into_iter().min_by_key(|s| s.valid_links);
    Ok(pipeline)
}

/// Mutable evaluation state between rule resolution and trace emission.
struct Pipeline<'i> {
    intent: &'i IntentRequest,
    policy_digest: &'i str,
    decision: Decision,
    delegation: Option<DelegationStatus>,
    script: ScriptFacts,
    required_approvals: u32,
    valid_approvals: u32,
    approval_ref: Option<String>,
    approval_entries: Vec<ApprovalAuditEntry>,
    rate_limit: Option<RateLimitDecision>,
    credential: Option<IssuedCredential>,
}

/// A credential together with the request that obtained it.
struct IssuedCredential {
    request: CredentialRequest,
    response: broker::CredentialResponse,
}

impl<'i> Pipeline<'i> {
    fn new(intent: &'i IntentRequest, policy_digest: &'i str, decision: Decision) -> Self {
        Pipeline {
            intent,
            policy_digest,
            decision,
            delegation: None,
            script: ScriptFacts::default(),
            required_approvals: 0,
            valid_approvals: 0,
            approval_ref: None,
            approval_entries: Vec::new(),
            rate_limit: None,
            credential: None,
        }
    }

    fn block(&mut self, reason: &str, violation: &str) {
        self.decision.verdict = Verdict::Block;
        self.decision.reason_codes.insert(reason);
        self.decision.violations.insert(violation);
    }

    /// Count this call against the matched rule's budget when the verdict
    /// could still lead to execution.
    fn apply_rate_limit(&mut self, opts: &EvaluateOptions) {
        if !matches!(
            self.decision.verdict,
            Verdict::Allow | Verdict::RequireApproval
        ) {
            return;
        }
        let Some(limit) = self.decision.requirements.rate_limit else {
            return;
        };
        let Some(store) = &opts.rate_limit_store else {
            tracing::warn!("rule sets a rate limit but no rate limit state is configured");
            self.block(
                reason_codes::RATE_LIMIT_STATE_UNAVAILABLE,
                violations::RATE_LIMIT_UNAVAILABLE,
            );
            return;
        };

        let result = if opts.simulate {
            store.peek(&limit, self.intent, opts.now)
        } else {
            store.enforce(&limit, self.intent, opts.now)
        };
        match result {
            Ok(decision) => {
                if !decision.allowed {
                    self.block(
                        reason_codes::RATE_LIMIT_EXCEEDED,
                        violations::RATE_LIMIT_EXCEEDED,
                    );
                }
                self.rate_limit = Some(decision);
            }
            Err(err) => {
                tracing::warn!(code = err.code(), error = %err, "rate limit state not usable");
                let reason = if err.is_contention() {
                    reason_codes::RATE_LIMIT_STATE_CONTENTION
                } else {
                    reason_codes::RATE_LIMIT_STATE_UNAVAILABLE
                };
                self.block(reason, violations::RATE_LIMIT_UNAVAILABLE);
            }
        }
    }

    fn apply_approvals(&mut self, opts: &EvaluateOptions) {
        if self.decision.verdict != Verdict::RequireApproval {
            return;
        }
        let check = ApprovalCheck::for_intent(self.intent, self.policy_digest, opts.now);
        let status = approval::evaluate_approvals(
            &opts.approval_tokens,
            &opts.approval_keys,
            &check,
            self.decision.requirements.required_approvals(),
        );
        self.required_approvals = status.required;
        self.valid_approvals = status.valid;
        self.approval_ref = status.token_ref;
        self.approval_entries = status.entries;
        self.decision.reason_codes.merge(&status.reason_codes);
        if status.granted {
            tracing::debug!(valid = status.valid, "approval granted");
            self.decision.verdict = Verdict::Allow;
        } else {
            self.decision
                .violations
                .insert(violations::APPROVAL_NOT_GRANTED);
        }
    }

    /// Issue a credential for a final `allow` whose rule requires one.
    /// Simulate mode never issues.
    fn apply_broker(&mut self, opts: &EvaluateOptions) {
        let req = self.decision.requirements.clone();
        if self.decision.verdict != Verdict::Allow || !req.require_broker_credential || opts.simulate {
            return;
        }
        let Some(broker) = opts.broker.as_deref() else {
            self.block(
                reason_codes::BROKER_CREDENTIAL_REQUIRED,
                violations::BROKER_CREDENTIAL_MISSING,
            );
            return;
        };

        let mut scope = req.broker_scopes;
        scope.extend(opts.credential_scopes.iter().cloned());
        scope.sort();
        scope.dedup();
        let reference = opts
            .credential_reference
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(req.broker_reference.as_str())
            .to_string();
        let ctx = &self.intent.context;
        let request = CredentialRequest {
            tool_name: self.intent.tool_name.clone(),
            identity: ctx.identity.clone(),
            workspace: ctx.workspace.clone(),
            session_id: ctx.session_id.clone(),
            request_id: ctx.request_id.clone(),
            reference,
            scope,
        };
        match broker::issue(broker, &request) {
            Ok(response) => {
                self.decision
                    .reason_codes
                    .insert(reason_codes::BROKER_CREDENTIAL_PRESENT);
                self.credential = Some(IssuedCredential { request, response });
            }
            Err(err) => {
                tracing::warn!(broker = broker.name(), code = err.code(), error = %err, "credential issuance failed");
                self.block(
                    reason_codes::BROKER_CREDENTIAL_MISSING,
                    violations::BROKER_CREDENTIAL_MISSING,
                );
            }
        }
    }
}

/// Apply simulate-mode rewriting, then build the output and its trace.
fn finish(
    pipeline: Pipeline<'_>,
    opts: &EvaluateOptions,
    started: Instant,
) -> Result<GateOutcome, GateError> {
    let Pipeline {
        intent,
        policy_digest,
        decision,
        delegation,
        script,
        required_approvals,
        valid_approvals,
        approval_ref,
        approval_entries,
        rate_limit,
        credential,
    } = pipeline;
    let mut verdict = decision.verdict;
    let mut reasons = decision.reason_codes;
    let mut violation_set = decision.violations;

    let mut simulated_verdict = None;
    let mut simulated_reason_codes = Vec::new();
    let mut would_have_blocked = false;
    if opts.simulate {
        simulated_verdict = Some(verdict);
        simulated_reason_codes = reasons.to_vec();
        would_have_blocked = matches!(verdict, Verdict::Block | Verdict::RequireApproval);
        reasons.insert(reason_codes::SIMULATE_MODE_NON_ENFORCING);
        if would_have_blocked {
            reasons.insert(format!("{}{}", reason_codes::SIMULATED_PREFIX, verdict));
            violation_set = CodeSet::new();
            verdict = Verdict::Allow;
        }
    }

    let producer_version = helpers::producer_version(&opts.producer_version);
    let created_at = opts.created_at.unwrap_or_else(helpers::epoch);
    let latency = opts
        .latency_ms
        .unwrap_or_else(|| started.elapsed().as_secs_f64() * 1000.0);

    let mut record = TraceRecord::build(intent, policy_digest, verdict, created_at, &producer_version)?
        .with_latency(latency);
    record.correlation_id = opts.correlation_id.clone().unwrap_or_default();
    record.reason_codes = reasons.to_vec();
    record.violations = violation_set.to_vec();
    record.matched_rule = decision.matched_rule.clone();
    record.approval_token_ref = approval_ref.clone();
    record.delegation = delegation_ref(intent, delegation.as_ref(), &reasons)?;
    record.composite_risk_class = script.composite_risk.clone();
    record.step_verdicts = script.step_verdicts.clone();
    record.pre_approved = script.pre_approved;
    record.pattern_id = script.pattern_id.clone();
    record.registry_reason = script.registry_reason.clone();
    if let Some(key) = &opts.signing_key {
        record.sign(key)?;
    }

    let header = || RecordHeader::new(created_at, &producer_version, &record.trace_id, &intent.tool_name);
    let delegation_required = decision.requirements.require_delegation
        || reasons.iter().any(|c| c.starts_with("delegation_"));
    let evidence = GateEvidence {
        approval_audit: (required_approvals > 0).then(|| {
            ApprovalAuditRecord::build(
                header(),
                &record.intent_digest,
                policy_digest,
                required_approvals,
                &approval_entries,
            )
        }),
        delegation_audit: delegation
            .as_ref()
            .filter(|_| delegation_required || !opts.delegation_tokens.is_empty())
            .map(|status| {
                DelegationAuditRecord::build(
                    header(),
                    &record.intent_digest,
                    policy_digest,
                    delegation_required,
                    status.verified,
                    status.token_ref.as_deref().filter(|_| status.verified),
                    &status.reason_codes.to_vec(),
                    &status.entries,
                )
            }),
        credential: credential
            .as_ref()
            .map(|c| BrokerCredentialRecord::build(header(), &c.request, &c.response)),
    };

    let delegation_ok = delegation.as_ref().filter(|s| s.verified);
    let credential = credential.map(|c| c.response);
    let output = GateOutput {
        ok: true,
        verdict,
        reason_codes: record.reason_codes.clone(),
        violations: record.violations.clone(),
        matched_rule: decision.matched_rule,
        simulate_mode: opts.simulate,
        script: intent.is_script(),
        step_count: record.step_count,
        script_hash: intent.script_hash.clone(),
        composite_risk_class: script.composite_risk,
        step_verdicts: script.step_verdicts,
        pre_approved: script.pre_approved,
        pattern_id: script.pattern_id,
        registry_reason: script.registry_reason,
        policy_digest: policy_digest.to_string(),
        intent_digest: record.intent_digest.clone(),
        trace_id: record.trace_id.clone(),
        required_approvals,
        valid_approvals,
        valid_delegations: delegation.as_ref().map_or(0, |s| s.valid_links),
        approval_ref,
        delegation_ref: delegation_ok.and_then(|s| s.token_ref.clone()),
        rate_limit_scope: rate_limit.as_ref().map(|r| r.scope.to_string()),
        rate_limit_key: rate_limit.as_ref().map(|r| r.key.clone()),
        rate_limit_limit: rate_limit.as_ref().map(|r| r.limit),
        rate_limit_used: rate_limit.as_ref().map(|r| r.used),
        rate_limit_remaining: rate_limit.as_ref().map(|r| r.remaining),
        credential_issuer: credential.as_ref().map(|c| c.issued_by.clone()),
        credential_ref: credential.as_ref().map(|c| c.credential_ref.clone()),
        credential_issued_at: credential.as_ref().and_then(|c| c.issued_at),
        credential_expires_at: credential.as_ref().and_then(|c| c.expires_at),
        credential_ttl_seconds: credential.as_ref().and_then(|c| c.ttl_seconds),
        simulated_verdict,
        simulated_reason_codes,
        would_have_blocked,
    };
    tracing::info!(
        tool = %intent.tool_name,
        verdict = %output.verdict,
        trace_id = %output.trace_id,
        matched_rule = %output.matched_rule,
        "gate decision"
    );
    Ok(GateOutcome {
        output,
        trace: record,
        evidence,
    })
}

fn delegation_ref(
    intent: &IntentRequest,
    status: Option<&DelegationStatus>,
    reasons: &CodeSet,
) -> Result<Option<DelegationRef>, GateError> {
    let Some(claim) = &intent.delegation else {
        return Ok(None);
    };
    let chain_digest = trace::delegation_chain_digest(intent)?.unwrap_or_default();
    Ok(Some(DelegationRef {
        token_ref: status
            .filter(|s| s.verified)
            .and_then(|s| s.token_ref.clone())
            .unwrap_or_default(),
        requester_identity: if claim.requester_identity.is_empty() {
            intent.context.identity.clone()
        } else {
            claim.requester_identity.clone()
        },
        depth: claim.chain.len(),
        scope_class: claim.scope_class.clone(),
        chain_digest,
        reason_codes: reasons
            .iter()
            .filter(|c| c.starts_with("delegation_"))
            .map(str::to_string)
            .collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::StubBroker;
    use crate::gate::approval::{mint as mint_approval, MintApproval};
    use crate::gate::delegation::{mint as mint_delegation, MintDelegation};
    use chrono::Duration;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        "2026-03-01T12:00:00Z".parse().unwrap()
    }

    fn intent(value: serde_json::Value) -> IntentRequest {
        serde_json::from_value(value).unwrap()
    }

    fn write_intent() -> IntentRequest {
        intent(json!({
            "tool_name": "tool.write",
            "args": {"path": "/w/a.txt"},
            "targets": [{"kind": "path", "value": "/w/a.txt", "operation": "write"}],
            "arg_provenance": [{"arg_path": "args.path", "source": "user"}],
            "context": {"identity": "alice", "workspace": "/w", "risk_class": "high"}
        }))
    }

    fn options() -> EvaluateOptions {
        EvaluateOptions {
            now: now(),
            latency_ms: Some(1.0),
            ..EvaluateOptions::default()
        }
    }

    fn key() -> SigningKey {
        SigningKey::generate(&mut rand::thread_rng())
    }

    const POLICY: &str = r#"
default_verdict: block
fail_closed:
  enabled: true
  risk_classes: [high]
  required_fields: [targets, arg_provenance]
rules:
  - name: writes-need-approval
    effect: require_approval
    match: {tool_names: [tool.write]}
  - name: reads
    effect: allow
    match: {tool_names: [tool.read]}
"#;

    fn approval_for(
        policy: &Policy,
        intent: &IntentRequest,
        approver: &str,
        key: &SigningKey,
    ) -> ApprovalToken {
        mint_approval(
            &MintApproval {
                approver_identity: approver.into(),
                reason_code: "change_ticket".into(),
                intent_digest: intent.digest().unwrap(),
                policy_digest: policy.digest().unwrap(),
                scope: vec!["tool:tool.write".into()],
                max_targets: 0,
                max_ops: 0,
                ttl: Duration::hours(1),
                now: now(),
                producer_version: String::new(),
            },
            key,
        )
        .unwrap()
    }

    #[test]
    fn test_missing_approval_requires_approval() {
        let policy = Policy::from_yaml_str(POLICY).unwrap();
        let outcome = evaluate(&policy, &write_intent(), &options()).unwrap();
        assert_eq!(outcome.verdict(), Verdict::RequireApproval);
        assert_eq!(outcome.exit_code(), 4);
        assert!(outcome.output.reason_codes.contains(&"approval_token_missing".to_string()));
        assert_eq!(outcome.output.violations, vec!["approval_not_granted"]);
        assert_eq!(outcome.output.required_approvals, 1);
        assert_eq!(outcome.trace.verdict, Verdict::RequireApproval);
        assert_eq!(outcome.trace.created_at, helpers::epoch());
        assert_eq!(outcome.trace.producer_version, "0.0.0-dev");
    }

    #[test]
    fn test_valid_approval_allows() {
        let policy = Policy::from_yaml_str(POLICY).unwrap();
        let approver = key();
        let request = write_intent();
        let token = approval_for(&policy, &request, "secops", &approver);
        let opts = EvaluateOptions {
            approval_tokens: vec![token.clone()],
            approval_keys: TrustedKeys::from_keys([approver.verifying_key()]).unwrap(),
            ..options()
        };
        let outcome = evaluate(&policy, &request, &opts).unwrap();
        assert_eq!(outcome.verdict(), Verdict::Allow);
        assert!(outcome.output.reason_codes.contains(&"approval_granted".to_string()));
        assert_eq!(outcome.output.valid_approvals, 1);
        assert_eq!(outcome.output.approval_ref.as_deref(), Some(token.token_id.as_str()));
        assert_eq!(outcome.trace.approval_token_ref, outcome.output.approval_ref);

        let audit = outcome.evidence.approval_audit.expect("approval audit");
        assert_eq!(audit.header.trace_id, outcome.output.trace_id);
        assert_eq!(audit.intent_digest, outcome.output.intent_digest);
        assert_eq!(audit.policy_digest, outcome.output.policy_digest);
        assert_eq!(audit.required_approvals, 1);
        assert!(audit.approved);
        assert_eq!(audit.approvers, vec!["secops"]);
        assert_eq!(audit.entries.len(), 1);
        assert_eq!(audit.entries[0].token_id, token.token_id);
        assert!(outcome.evidence.delegation_audit.is_none());
        assert!(outcome.evidence.credential.is_none());
    }

    #[test]
    fn test_insufficient_approvals() {
        let policy = Policy::from_yaml_str(
            "rules: [{name: w, effect: require_approval, min_approvals: 2, match: {tool_names: [tool.write]}}]\n",
        )
        .unwrap();
        let approver = key();
        let request = write_intent();
        let opts = EvaluateOptions {
            approval_tokens: vec![
                approval_for(&policy, &request, "secops", &approver),
                approval_for(&policy, &request, "secops", &approver),
            ],
            approval_keys: TrustedKeys::from_keys([approver.verifying_key()]).unwrap(),
            ..options()
        };
        let outcome = evaluate(&policy, &request, &opts).unwrap();
        assert_eq!(outcome.verdict(), Verdict::RequireApproval);
        assert_eq!(outcome.output.required_approvals, 2);
        assert_eq!(outcome.output.valid_approvals, 1);
        assert!(outcome
            .output
            .reason_codes
            .contains(&"approval_chain_insufficient".to_string()));
    }

    #[test]
    fn test_fail_closed_blocks_before_allow_rule() {
        let policy = Policy::from_yaml_str(
            r#"
fail_closed: {enabled: true, risk_classes: [high], required_fields: [targets]}
rules:
  - name: allow-everything
    effect: allow
    match: {tool_names: [tool.write]}
"#,
        )
        .unwrap();
        let bare = intent(json!({
            "tool_name": "tool.write",
            "context": {"identity": "alice", "workspace": "/w", "risk_class": "high"}
        }));
        let outcome = evaluate(&policy, &bare, &options()).unwrap();
        assert_eq!(outcome.verdict(), Verdict::Block);
        assert_eq!(outcome.output.reason_codes, vec!["fail_closed_missing_targets"]);
        assert_eq!(outcome.output.matched_rule, "");

        let low = intent(json!({
            "tool_name": "tool.write",
            "context": {"identity": "alice", "workspace": "/w", "risk_class": "low"}
        }));
        let outcome = evaluate(&policy, &low, &options()).unwrap();
        assert_eq!(outcome.verdict(), Verdict::Allow);
    }

    #[test]
    fn test_invalid_intent_blocks_only_under_fail_closed() {
        let policy = Policy::from_yaml_str(POLICY).unwrap();
        let broken = intent(json!({
            "tool_name": "tool.write",
            "targets": [{"kind": "spaceship", "value": "x"}],
            "context": {"identity": "alice", "workspace": "/w", "risk_class": "high"}
        }));
        let outcome = evaluate(&policy, &broken, &options()).unwrap();
        assert_eq!(outcome.verdict(), Verdict::Block);
        assert_eq!(outcome.output.reason_codes, vec!["fail_closed_intent_invalid"]);
        assert_eq!(outcome.output.violations, vec!["intent_not_evaluable"]);

        let mut low = broken.clone();
        low.context.risk_class = "low".into();
        let err = evaluate(&policy, &low, &options()).unwrap_err();
        assert!(matches!(err, GateError::InvalidIntent(_)));
    }

    #[test]
    fn test_strict_profile_requirements() {
        let policy = Policy::from_yaml_str(POLICY).unwrap();
        let strict = |opts: EvaluateOptions| EvaluateOptions {
            profile: Profile::Strict,
            ..opts
        };
        let err = evaluate(&policy, &write_intent(), &strict(options())).unwrap_err();
        assert!(err.to_string().contains("signing key"));

        let err = evaluate(
            &policy,
            &write_intent(),
            &strict(EvaluateOptions {
                simulate: true,
                signing_key: Some(key()),
                ..options()
            }),
        )
        .unwrap_err();
        assert_eq!(err.exit_code(), 6);

        let signer = key();
        let outcome = evaluate(
            &policy,
            &write_intent(),
            &strict(EvaluateOptions {
                signing_key: Some(signer.clone()),
                ..options()
            }),
        )
        .unwrap();
        outcome.trace.verify(&signer.verifying_key()).unwrap();
    }

    #[test]
    fn test_strict_profile_imposes_fail_closed() {
        let policy = Policy::from_yaml_str(
            "rules: [{name: all, effect: allow, match: {risk_classes: [critical]}}]\n",
        )
        .unwrap();
        let bare = intent(json!({
            "tool_name": "tool.write",
            "context": {"identity": "alice", "workspace": "/w", "risk_class": "critical"}
        }));
        let standard = evaluate(&policy, &bare, &options()).unwrap();
        assert_eq!(standard.verdict(), Verdict::Allow);

        let strict = EvaluateOptions {
            profile: Profile::Strict,
            signing_key: Some(key()),
            ..options()
        };
        let outcome = evaluate(&policy, &bare, &strict).unwrap();
        assert_eq!(outcome.verdict(), Verdict::Block);
        assert!(outcome
            .output
            .reason_codes
            .contains(&"fail_closed_missing_targets".to_string()));
    }

    #[test]
    fn test_simulate_rewrites_blocking_verdicts() {
        let policy = Policy::from_yaml_str(POLICY).unwrap();
        let opts = EvaluateOptions {
            simulate: true,
            ..options()
        };
        let outcome = evaluate(&policy, &write_intent(), &opts).unwrap();
        let out = &outcome.output;
        assert_eq!(out.verdict, Verdict::Allow);
        assert!(out.simulate_mode);
        assert!(out.would_have_blocked);
        assert_eq!(out.simulated_verdict, Some(Verdict::RequireApproval));
        assert!(out.violations.is_empty());
        assert!(out.reason_codes.contains(&"simulate_mode_non_enforcing".to_string()));
        assert!(out.reason_codes.contains(&"simulated_require_approval".to_string()));
        assert!(out
            .simulated_reason_codes
            .contains(&"approval_token_missing".to_string()));
    }

    #[test]
    fn test_broker_issuance() {
        let policy = Policy::from_yaml_str(
            r#"
rules:
  - name: deploy
    effect: allow
    require_broker_credential: true
    broker_reference: deploy-token
    broker_scopes: [deploy]
    match: {tool_names: [tool.deploy]}
"#,
        )
        .unwrap();
        let deploy = intent(json!({
            "tool_name": "tool.deploy",
            "context": {"identity": "alice", "workspace": "/w", "risk_class": "low"}
        }));

        let outcome = evaluate(&policy, &deploy, &options()).unwrap();
        assert_eq!(outcome.verdict(), Verdict::Block);
        assert!(outcome
            .output
            .reason_codes
            .contains(&"broker_credential_required".to_string()));
        assert_eq!(outcome.output.violations, vec!["broker_credential_missing"]);

        let opts = EvaluateOptions {
            broker: Some(Box::new(StubBroker)),
            ..options()
        };
        let outcome = evaluate(&policy, &deploy, &opts).unwrap();
        assert_eq!(outcome.verdict(), Verdict::Allow);
        assert_eq!(outcome.output.credential_issuer.as_deref(), Some("stub"));
        assert!(outcome
            .output
            .credential_ref
            .as_deref()
            .is_some_and(|r| r.starts_with("stub:")));
        assert!(outcome
            .output
            .reason_codes
            .contains(&"broker_credential_present".to_string()));
        assert_eq!(outcome.output.credential_ttl_seconds, Some(300));
        assert_eq!(outcome.output.credential_issued_at, None);

        let record = outcome.evidence.credential.expect("credential record");
        assert_eq!(record.header.trace_id, outcome.output.trace_id);
        assert_eq!(record.header.tool_name, "tool.deploy");
        assert_eq!(record.identity, "alice");
        assert_eq!(record.broker, "stub");
        assert_eq!(record.reference, "deploy-token");
        assert_eq!(record.scope, vec!["deploy"]);
        assert_eq!(record.credential_ref, outcome.output.credential_ref.clone().unwrap());
        assert_eq!(record.ttl_seconds, Some(300));

        let simulated = EvaluateOptions {
            simulate: true,
            broker: Some(Box::new(StubBroker)),
            ..options()
        };
        let outcome = evaluate(&policy, &deploy, &simulated).unwrap();
        assert_eq!(outcome.output.credential_ref, None);
        assert!(outcome.evidence.credential.is_none());
    }

    #[test]
    fn test_rate_limit_without_state_blocks() {
        let policy = Policy::from_yaml_str(
            "rules: [{name: r, effect: allow, rate_limit: {requests: 1}, match: {tool_names: [tool.read]}}]\n",
        )
        .unwrap();
        let read = intent(json!({
            "tool_name": "tool.read",
            "context": {"identity": "alice", "workspace": "/w", "risk_class": "low"}
        }));
        let outcome = evaluate(&policy, &read, &options()).unwrap();
        assert_eq!(outcome.verdict(), Verdict::Block);
        assert_eq!(
            outcome.output.reason_codes,
            vec!["matched_rule_r", "rate_limit_state_unavailable"]
        );

        let dir = tempfile::tempdir().unwrap();
        let opts = EvaluateOptions {
            rate_limit_store: Some(RateLimitStore::new(dir.path().join("state.json"))),
            ..options()
        };
        let first = evaluate(&policy, &read, &opts).unwrap();
        assert_eq!(first.verdict(), Verdict::Allow);
        assert_eq!(first.output.rate_limit_used, Some(1));
        assert_eq!(first.output.rate_limit_remaining, Some(0));
        let second = evaluate(&policy, &read, &opts).unwrap();
        assert_eq!(second.verdict(), Verdict::Block);
        assert!(second
            .output
            .reason_codes
            .contains(&"rate_limit_exceeded".to_string()));
    }

    #[test]
    fn test_delegated_rule_and_trace_reference() {
        let policy = Policy::from_yaml_str(
            r#"
default_verdict: block
rules:
  - name: delegated-write
    effect: allow
    match: {tool_names: [tool.write], require_delegation: true}
"#,
        )
        .unwrap();
        let request = intent(json!({
            "tool_name": "tool.write",
            "targets": [{"kind": "path", "value": "/w/a.txt", "operation": "write"}],
            "delegation": {
                "requester_identity": "bot",
                "chain": [{"delegator_identity": "alice", "delegate_identity": "bot"}]
            },
            "context": {"identity": "bot", "workspace": "/w", "risk_class": "low"}
        }));
        let delegator = key();
        let token = mint_delegation(
            &MintDelegation {
                delegator_identity: "alice".into(),
                delegate_identity: "bot".into(),
                scope: vec!["tool:tool.write".into()],
                scope_class: "write".into(),
                intent_digest: None,
                policy_digest: None,
                ttl: Duration::hours(1),
                now: now(),
                producer_version: String::new(),
            },
            &delegator,
        )
        .unwrap();

        let missing = evaluate(&policy, &request, &options()).unwrap();
        assert_eq!(missing.verdict(), Verdict::Block);
        assert!(missing
            .output
            .reason_codes
            .contains(&"delegation_token_missing".to_string()));

        let opts = EvaluateOptions {
            delegation_tokens: vec![token.clone()],
            delegation_keys: TrustedKeys::from_keys([delegator.verifying_key()]).unwrap(),
            ..options()
        };
        let outcome = evaluate(&policy, &request, &opts).unwrap();
        assert_eq!(outcome.verdict(), Verdict::Allow);
        assert_eq!(outcome.output.valid_delegations, 1);
        assert_eq!(outcome.output.delegation_ref.as_deref(), Some(token.token_id.as_str()));
        let reference = outcome.trace.delegation.unwrap();
        assert_eq!(reference.requester_identity, "bot");
        assert_eq!(reference.token_ref, token.token_id);
        assert_eq!(reference.reason_codes, vec!["delegation_granted"]);

        let audit = outcome.evidence.delegation_audit.unwrap();
        assert!(audit.delegated);
        assert_eq!(audit.delegation_ref, token.token_id);
        assert!(audit.reason_codes.is_empty());

        let missing_audit = missing.evidence.delegation_audit.unwrap();
        assert!(missing_audit.delegation_required);
        assert!(missing_audit.entries.is_empty());
        assert_eq!(missing_audit.reason_codes, vec!["delegation_token_missing"]);
    }

    #[test]
    fn test_delegated_rule_requires_token_from_claimed_delegator() {
        let policy = Policy::from_yaml_str(
            r#"
default_verdict: require_approval
rules:
  - name: delegated-write
    effect: allow
    match:
      tool_names: [tool.write]
      require_delegation: true
      allowed_delegator_identities: [alice]
"#,
        )
        .unwrap();
        let request = intent(json!({
            "tool_name": "tool.write",
            "targets": [{"kind": "path", "value": "/w/a.txt", "operation": "write"}],
            "delegation": {
                "requester_identity": "bot",
                "chain": [{"delegator_identity": "alice", "delegate_identity": "bot"}]
            },
            "context": {"identity": "bot", "workspace": "/w", "risk_class": "low"}
        }));
        let eve = key();
        let forged = mint_delegation(
            &MintDelegation {
                delegator_identity: "eve".into(),
                delegate_identity: "bot".into(),
                scope: vec!["tool:tool.write".into()],
                scope_class: String::new(),
                intent_digest: None,
                policy_digest: None,
                ttl: Duration::hours(1),
                now: now(),
                producer_version: String::new(),
            },
            &eve,
        )
        .unwrap();
        let opts = EvaluateOptions {
            delegation_tokens: vec![forged],
            delegation_keys: TrustedKeys::from_keys([eve.verifying_key()]).unwrap(),
            ..options()
        };

        let outcome = evaluate(&policy, &request, &opts).unwrap();
        assert_eq!(outcome.verdict(), Verdict::RequireApproval);
        assert_eq!(outcome.output.matched_rule, "");
        assert_eq!(outcome.output.delegation_ref, None);
        assert!(outcome
            .output
            .reason_codes
            .contains(&"delegation_chain_mismatch".to_string()));
        assert!(!outcome
            .output
            .reason_codes
            .contains(&"delegation_granted".to_string()));

        let audit = outcome.evidence.delegation_audit.expect("delegation audit");
        assert!(audit.delegation_required);
        assert!(!audit.delegated);
        assert_eq!(audit.delegation_ref, "");
        assert_eq!(audit.valid_delegations, 1);
        assert_eq!(audit.entries[0].delegator_identity, "eve");
        assert_eq!(audit.reason_codes, vec!["delegation_chain_mismatch"]);
    }

    #[test]
    fn test_identical_inputs_produce_identical_output() {
        let policy = Policy::from_yaml_str(POLICY).unwrap();
        let a = evaluate(&policy, &write_intent(), &options()).unwrap();
        let b = evaluate(&policy, &write_intent(), &options()).unwrap();
        assert_eq!(
            serde_json::to_string(&a.output).unwrap(),
            serde_json::to_string(&b.output).unwrap()
        );
        assert_eq!(a.trace, b.trace);
        assert_eq!(
            a.output.trace_id,
            trace::trace_id(&a.output.policy_digest, &a.output.intent_digest, a.output.verdict)
        );
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!("strict".parse::<Profile>().unwrap(), Profile::Strict);
        assert_eq!("".parse::<Profile>().unwrap(), Profile::Standard);
        assert!("prod".parse::<Profile>().is_err());
    }
}
