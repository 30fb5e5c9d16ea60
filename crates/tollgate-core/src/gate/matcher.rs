//! First-match-wins rule resolution.

use crate::gate::constraints::{self, ConstraintHit};
use crate::gate::delegation::DelegationStatus;
use crate::gate::intent::{Delegation, IntentRequest, Target};
use crate::gate::policy::{Policy, PolicyRule, RateLimitPolicy, RuleMatch};
use crate::gate::verdict::{reason_codes, CodeSet, Verdict};

/// Verdict from rule matching, before approvals, rate limits and brokering.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDecision<'p> {
    pub verdict: Verdict,
    pub reason_codes: CodeSet,
    pub violations: CodeSet,
    /// `None` when the default verdict applied.
    pub rule: Option<&'p PolicyRule>,
}

impl RuleDecision<'_> {
    pub fn matched_rule(&self) -> &str {
        self.rule.map(|r| r.name.as_str()).unwrap_or_default()
    }

    /// Approvals needed to lift `require_approval`.
    pub fn required_approvals(&self) -> u32 {
        self.rule.map(PolicyRule::required_approvals).unwrap_or(1)
    }

    /// Detach from the policy borrow.
    pub fn into_decision(self) -> Decision {
        Decision {
            verdict: self.verdict,
            matched_rule: self.matched_rule().to_string(),
            requirements: Requirements::from_rule(self.rule),
            reason_codes: self.reason_codes,
            violations: self.violations,
        }
    }

    fn apply(&mut self, hit: ConstraintHit, replace: bool) {
        self.verdict = if replace {
            hit.effect
        } else {
            self.verdict.most_restrictive(hit.effect)
        };
        self.reason_codes.merge(&hit.reason_codes);
        self.violations.merge(&hit.violations);
    }
}

/// What the winning rule asks of the rest of the pipeline.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Requirements {
    /// Zero when no rule matched.
    pub min_approvals: u32,
    pub require_delegation: bool,
    pub require_broker_credential: bool,
    pub broker_reference: String,
    pub broker_scopes: Vec<String>,
    pub rate_limit: Option<RateLimitPolicy>,
}

impl Requirements {
    pub fn from_rule(rule: Option<&PolicyRule>) -> Self {
        let Some(rule) = rule else {
            return Requirements::default();
        };
        Requirements {
            min_approvals: rule.min_approvals,
            require_delegation: rule.predicate.require_delegation,
            require_broker_credential: rule.require_broker_credential,
            broker_reference: rule.broker_reference.clone(),
            broker_scopes: rule.broker_scopes.clone(),
            rate_limit: rule.rate_limit,
        }
    }

    pub fn required_approvals(&self) -> u32 {
        self.min_approvals.max(1)
    }

    /// Fold another step's requirements in: the strictest of each wins and
    /// the first broker reference is kept.
    pub fn merge(&mut self, other: &Requirements) {
        self.min_approvals = self.min_approvals.max(other.min_approvals);
        self.require_delegation |= other.require_delegation;
        self.require_broker_credential |= other.require_broker_credential;
        if self.broker_reference.is_empty() {
            self.broker_reference = other.broker_reference.clone();
        }
        self.broker_scopes.extend(other.broker_scopes.iter().cloned());
        self.broker_scopes.sort();
        self.broker_scopes.dedup();
        self.rate_limit = match (self.rate_limit, other.rate_limit) {
            (Some(a), Some(b)) => Some(a.tighter(b)),
            (a, b) => a.or(b),
        };
    }
}

/// A resolved decision for one intent, independent of the policy borrow.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub verdict: Verdict,
    pub reason_codes: CodeSet,
    pub violations: CodeSet,
    /// Empty when the default verdict applied.
    pub matched_rule: String,
    pub requirements: Requirements,
}

impl Decision {
    /// A `block` that no rule produced, e.g. fail-closed or script limits.
    pub fn block(reason_codes: CodeSet, violations: CodeSet) -> Self {
        Decision {
            verdict: Verdict::Block,
            reason_codes,
            violations,
            matched_rule: String::new(),
            requirements: Requirements::default(),
        }
    }
}

/// Walk rules in declaration order and resolve the first that matches.
///
/// A rule that requires delegation only matches when `delegation` verified
/// within the rule's depth bound; otherwise the walk continues and the
/// verification failure codes are reported on whichever decision wins.
pub fn resolve<'p>(
    policy: &'p Policy,
    intent: &IntentRequest,
    delegation: &DelegationStatus,
) -> RuleDecision<'p> {
    let mut skipped = CodeSet::new();

    for rule in &policy.rules {
        let m = &rule.predicate;
        if !predicate_matches(m, intent) || !claim_matches(m, intent.delegation.as_ref()) {
            continue;
        }
        let max_depth = m.effective_max_delegation_depth();
        if m.require_delegation && !delegation.satisfies(max_depth) {
            tracing::debug!(rule = %rule.name, "rule skipped: delegation not verified");
            skipped.merge(&delegation.failure_codes(max_depth));
            continue;
        }

        let mut decision = RuleDecision {
            verdict: rule.effect,
            reason_codes: if rule.reason_codes.is_empty() {
                [rule.matched_reason()].into_iter().collect()
            } else {
                rule.reason_codes.iter().cloned().collect()
            },
            violations: rule.violations.iter().cloned().collect(),
            rule: Some(rule),
        };
        if m.require_delegation {
            decision.reason_codes.insert(reason_codes::DELEGATION_GRANTED);
        }
        if let Some(hit) = rule
            .dataflow
            .as_ref()
            .and_then(|d| constraints::evaluate_dataflow(d, intent))
        {
            decision.apply(hit, true);
        }
        if let Some(hit) = rule
            .endpoint
            .as_ref()
            .and_then(|e| constraints::evaluate_endpoint(e, intent))
        {
            decision.apply(hit, false);
        }
        if let Some(hit) = constraints::evaluate_phase(intent) {
            decision.apply(hit, false);
        }
        decision.reason_codes.merge(&skipped);
        tracing::debug!(rule = %rule.name, verdict = %decision.verdict, "rule matched");
        return decision;
    }

    let mut reasons = CodeSet::new();
    reasons.insert(format!(
        "{}{}",
        reason_codes::DEFAULT_PREFIX,
        policy.default_verdict
    ));
    reasons.merge(&skipped);
    RuleDecision {
        verdict: policy.default_verdict,
        reason_codes: reasons,
        violations: CodeSet::new(),
        rule: None,
    }
}

fn any_in(list: &[String], value: &str) -> bool {
    list.iter().any(|v| v == value)
}

/// Conjunction of populated predicate fields. List-valued target fields hold
/// when any one target satisfies them.
pub fn predicate_matches(m: &RuleMatch, intent: &IntentRequest) -> bool {
    let ctx = &intent.context;
    let field = |list: &[String], value: &str| list.is_empty() || any_in(list, value);
    let any_target = |list: &[String], pick: fn(&Target) -> &str| {
        list.is_empty() || intent.targets.iter().any(|t| any_in(list, pick(t)))
    };

    field(&m.tool_names, &intent.tool_name)
        && field(&m.risk_classes, &ctx.risk_class)
        && field(&m.identities, &ctx.identity)
        && (m.workspace_prefixes.is_empty()
            || m.workspace_prefixes.iter().any(|p| ctx.workspace.starts_with(p.as_str())))
        && any_target(&m.target_kinds, |t| t.kind.as_str())
        && any_target(&m.target_values, |t| t.value.as_str())
        && any_target(&m.target_operations, |t| t.operation.as_str())
        && any_target(&m.endpoint_classes, |t| t.endpoint_class.as_str())
        && any_target(&m.data_classes, |t| t.sensitivity.as_str())
        && (m.provenance_sources.is_empty()
            || intent
                .arg_provenance
                .iter()
                .any(|p| any_in(&m.provenance_sources, &p.source)))
}

/// Constraints on the delegation claim carried by the intent itself.
pub fn claim_matches(m: &RuleMatch, claim: Option<&Delegation>) -> bool {
    if !m.delegation_constrained() {
        return true;
    }
    let Some(claim) = claim else {
        return false;
    };
    if let Some(max) = m.max_delegation_depth {
        if claim.chain.len() > max {
            return false;
        }
    }
    if !m.allowed_delegator_identities.is_empty()
        && !claim
            .chain
            .iter()
            .any(|l| any_in(&m.allowed_delegator_identities, &l.delegator_identity))
    {
        return false;
    }
    if !m.allowed_delegate_identities.is_empty()
        && !any_in(&m.allowed_delegate_identities, &claim.requester_identity)
        && !claim
            .chain
            .iter()
            .any(|l| any_in(&m.allowed_delegate_identities, &l.delegate_identity))
    {
        return false;
    }
    if !m.delegation_scopes.is_empty()
        && !any_in(&m.delegation_scopes, &claim.scope_class)
        && !claim
            .chain
            .iter()
            .any(|l| any_in(&m.delegation_scopes, &l.scope_class))
    {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn intent(value: serde_json::Value) -> IntentRequest {
        serde_json::from_value::<IntentRequest>(value)
            .unwrap()
            .normalize()
            .unwrap()
    }

    fn read_intent() -> IntentRequest {
        intent(json!({
            "tool_name": "tool.read",
            "targets": [{"kind": "path", "value": "/workspace/a.txt", "operation": "read", "sensitivity": "internal"}],
            "arg_provenance": [{"arg_path": "args.path", "source": "user"}],
            "context": {"identity": "alice", "workspace": "/workspace", "risk_class": "low"}
        }))
    }

    fn verified() -> DelegationStatus {
        DelegationStatus {
            verified: true,
            depth: 1,
            valid_links: 1,
            ..DelegationStatus::default()
        }
    }

    #[test]
    fn test_first_match_wins() {
        let policy = Policy::from_yaml_str(
            r#"
default_verdict: block
rules:
  - name: allow reads
    effect: allow
    match: {tool_names: [tool.read]}
  - name: block-low
    effect: block
    match: {risk_classes: [low]}
"#,
        )
        .unwrap();
        let decision = resolve(&policy, &read_intent(), &DelegationStatus::default());
        assert_eq!(decision.verdict, Verdict::Allow);
        assert_eq!(decision.matched_rule(), "allow reads");
        assert_eq!(decision.reason_codes.to_vec(), vec!["matched_rule_allow_reads"]);
    }

    #[test]
    fn test_default_verdict_when_nothing_matches() {
        let policy = Policy::from_yaml_str(
            "rules: [{name: r, effect: allow, match: {tool_names: [tool.write]}}]\n",
        )
        .unwrap();
        let decision = resolve(&policy, &read_intent(), &DelegationStatus::default());
        assert_eq!(decision.verdict, Verdict::RequireApproval);
        assert_eq!(decision.matched_rule(), "");
        assert_eq!(decision.reason_codes.to_vec(), vec!["default_require_approval"]);
        assert_eq!(decision.required_approvals(), 1);
    }

    #[test]
    fn test_predicate_fields_are_conjunctive() {
        let i = read_intent();
        let m = |yaml: &str| serde_yaml::from_str::<RuleMatch>(yaml).unwrap();
        assert!(predicate_matches(&m("{tool_names: [tool.read], identities: [alice]}"), &i));
        assert!(!predicate_matches(&m("{tool_names: [tool.read], identities: [bob]}"), &i));
        assert!(predicate_matches(&m("{workspace_prefixes: [/work]}"), &i));
        assert!(!predicate_matches(&m("{workspace_prefixes: [/srv]}"), &i));
        assert!(predicate_matches(&m("{endpoint_classes: [fs.read], data_classes: [internal]}"), &i));
        assert!(!predicate_matches(&m("{target_operations: [write]}"), &i));
        assert!(predicate_matches(&m("{provenance_sources: [user, external]}"), &i));
        assert!(!predicate_matches(&m("{provenance_sources: [external]}"), &i));
        assert!(predicate_matches(&m("{target_values: [/workspace/a.txt]}"), &i));
    }

    #[test]
    fn test_reason_codes_replace_fallback() {
        let policy = Policy::from_yaml_str(
            "rules: [{name: r, effect: block, reason_codes: [no_reads], violations: [read_denied], match: {tool_names: [tool.read]}}]\n",
        )
        .unwrap();
        let decision = resolve(&policy, &read_intent(), &DelegationStatus::default());
        assert_eq!(decision.reason_codes.to_vec(), vec!["no_reads"]);
        assert_eq!(decision.violations.to_vec(), vec!["read_denied"]);
    }

    #[test]
    fn test_destructive_apply_escalates_allow() {
        let policy = Policy::from_yaml_str(
            "rules: [{name: r, effect: allow, match: {tool_names: [tool.delete]}}]\n",
        )
        .unwrap();
        let i = intent(json!({
            "tool_name": "tool.delete",
            "targets": [{"kind": "path", "value": "/data", "operation": "delete"}],
            "context": {"identity": "alice", "workspace": "/w", "risk_class": "low"}
        }));
        let decision = resolve(&policy, &i, &DelegationStatus::default());
        assert_eq!(decision.verdict, Verdict::RequireApproval);
        assert!(decision.reason_codes.contains("destructive_apply_requires_approval"));
    }

    #[test]
    fn test_delegation_is_a_match_predicate() {
        let policy = Policy::from_yaml_str(
            r#"
default_verdict: block
rules:
  - name: delegated-write
    effect: allow
    match: {tool_names: [tool.write], require_delegation: true, max_delegation_depth: 2}
  - name: write-needs-approval
    effect: require_approval
    match: {tool_names: [tool.write]}
"#,
        )
        .unwrap();
        let i = intent(json!({
            "tool_name": "tool.write",
            "targets": [{"kind": "path", "value": "/w/a", "operation": "write"}],
            "delegation": {"requester_identity": "bot", "chain": [{"delegator_identity": "alice", "delegate_identity": "bot"}]},
            "context": {"identity": "bot", "workspace": "/w", "risk_class": "low"}
        }));

        let granted = resolve(&policy, &i, &verified());
        assert_eq!(granted.verdict, Verdict::Allow);
        assert!(granted.reason_codes.contains("delegation_granted"));

        let mut failed = DelegationStatus::default();
        failed.reason_codes.insert("delegation_token_expired");
        let fallback = resolve(&policy, &i, &failed);
        assert_eq!(fallback.matched_rule(), "write-needs-approval");
        assert!(fallback.reason_codes.contains("delegation_token_expired"));

        let deep = DelegationStatus { depth: 3, ..verified() };
        let too_deep = resolve(&policy, &i, &deep);
        assert_eq!(too_deep.matched_rule(), "write-needs-approval");
        assert!(too_deep.reason_codes.contains("delegation_chain_too_deep"));
    }

    #[test]
    fn test_requirements_merge_takes_strictest() {
        let policy = Policy::from_yaml_str(
            r#"
rules:
  - name: a
    effect: allow
    min_approvals: 2
    broker_reference: first
    broker_scopes: [write]
    rate_limit: {requests: 10, window: hour}
    match: {tool_names: [tool.a]}
  - name: b
    effect: allow
    require_broker_credential: true
    broker_reference: second
    broker_scopes: [read, write]
    rate_limit: {requests: 10, window: minute, scope: tool}
    match: {tool_names: [tool.b]}
"#,
        )
        .unwrap();
        let mut merged = Requirements::from_rule(policy.rule("a"));
        merged.merge(&Requirements::from_rule(policy.rule("b")));
        assert_eq!(merged.min_approvals, 2);
        assert!(merged.require_broker_credential);
        assert_eq!(merged.broker_reference, "first");
        assert_eq!(merged.broker_scopes, vec!["read", "write"]);
        let limit = merged.rate_limit.unwrap();
        assert_eq!(limit.window, crate::gate::policy::RateWindow::Minute);

        assert_eq!(Requirements::from_rule(None).required_approvals(), 1);
    }

    #[test]
    fn test_claim_constraints() {
        let claim: Delegation = serde_json::from_value(json!({
            "requester_identity": "bot",
            "scope_class": "write",
            "chain": [{"delegator_identity": "alice", "delegate_identity": "bot", "scope_class": "write"}]
        }))
        .unwrap();
        let m = |yaml: &str| serde_yaml::from_str::<RuleMatch>(yaml).unwrap();
        assert!(claim_matches(&m("{tool_names: [x]}"), None));
        assert!(!claim_matches(&m("{require_delegation: true}"), None));
        assert!(claim_matches(&m("{allowed_delegator_identities: [alice]}"), Some(&claim)));
        assert!(!claim_matches(&m("{allowed_delegator_identities: [eve]}"), Some(&claim)));
        assert!(claim_matches(&m("{allowed_delegate_identities: [bot]}"), Some(&claim)));
        assert!(claim_matches(&m("{delegation_scopes: [write]}"), Some(&claim)));
        assert!(!claim_matches(&m("{delegation_scopes: [admin]}"), Some(&claim)));
        assert!(!claim_matches(&m("{max_delegation_depth: 0}"), Some(&claim)));
    }
}
