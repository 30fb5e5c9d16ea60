//! Per-rule constraints applied after a rule matches.

use globset::GlobBuilder;

use crate::gate::intent::{IntentRequest, Target, PHASE_PLAN};
use crate::gate::policy::{DataflowPolicy, EndpointPolicy};
use crate::gate::verdict::{reason_codes, violations, CodeSet, Verdict};

/// A constraint that fired: the effect it demands plus its codes.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintHit {
    pub effect: Verdict,
    pub reason_codes: CodeSet,
    pub violations: CodeSet,
}

const DEFAULT_EGRESS_KINDS: &[&str] = &["host", "url", "bucket", "queue", "topic"];

/// Fires when any provenance entry comes from a tainted source and a target
/// matches the configured destination.
pub fn evaluate_dataflow(dataflow: &DataflowPolicy, intent: &IntentRequest) -> Option<ConstraintHit> {
    if !dataflow.enabled {
        return None;
    }
    let tainted = intent
        .arg_provenance
        .iter()
        .any(|p| dataflow.tainted_sources.contains(&p.source));
    if !tainted || !matches_destination(dataflow, &intent.targets) {
        return None;
    }
    Some(ConstraintHit {
        effect: dataflow.action.into(),
        reason_codes: [dataflow.reason_code.as_str()].into_iter().collect(),
        violations: [dataflow.violation.as_str()].into_iter().collect(),
    })
}

fn matches_destination(dataflow: &DataflowPolicy, targets: &[Target]) -> bool {
    let unconstrained = dataflow.destination_kinds.is_empty()
        && dataflow.destination_values.is_empty()
        && dataflow.destination_operations.is_empty();
    if unconstrained {
        return targets
            .iter()
            .any(|t| DEFAULT_EGRESS_KINDS.contains(&t.kind.as_str()));
    }
    let allows = |list: &[String], value: &str| list.is_empty() || list.iter().any(|v| v == value);
    targets.iter().any(|t| {
        allows(&dataflow.destination_kinds, &t.kind)
            && allows(&dataflow.destination_values, &t.value)
            && allows(&dataflow.destination_operations, &t.operation)
    })
}

/// Path and domain allow/deny lists, egress classes and destructive actions.
pub fn evaluate_endpoint(endpoint: &EndpointPolicy, intent: &IntentRequest) -> Option<ConstraintHit> {
    if !endpoint.enabled {
        return None;
    }
    let mut reasons = CodeSet::new();
    let mut found = CodeSet::new();
    let mut flag = |code: &str| {
        reasons.insert(code);
        found.insert(code);
    };

    for target in &intent.targets {
        if target.kind == "path" {
            let path = target.value.trim().replace('\\', "/");
            if matches_any_path(&path, &endpoint.path_denylist) {
                flag(reason_codes::ENDPOINT_PATH_DENIED);
            }
            if !endpoint.path_allowlist.is_empty() && !matches_any_path(&path, &endpoint.path_allowlist) {
                flag(reason_codes::ENDPOINT_PATH_NOT_ALLOWLISTED);
            }
        }

        let domain = target.endpoint_domain.trim().to_lowercase();
        if !domain.is_empty() {
            if matches_any_domain(&domain, &endpoint.domain_denylist) {
                flag(reason_codes::ENDPOINT_DOMAIN_DENIED);
            }
            if !endpoint.domain_allowlist.is_empty() && !matches_any_domain(&domain, &endpoint.domain_allowlist) {
                flag(reason_codes::ENDPOINT_DOMAIN_NOT_ALLOWLISTED);
            }
        }

        if target.endpoint_class.starts_with("net.")
            && !endpoint.egress_classes.is_empty()
            && !endpoint.egress_classes.contains(&target.endpoint_class)
        {
            flag(reason_codes::ENDPOINT_EGRESS_CLASS_NOT_ALLOWED);
        }
    }

    let mut effect: Verdict = endpoint.action.into();
    if let Some(destructive) = endpoint.destructive_action {
        if intent.has_destructive_target() {
            effect = effect.most_restrictive(destructive.into());
            reasons.insert(reason_codes::ENDPOINT_DESTRUCTIVE_OPERATION);
            found.insert(violations::DESTRUCTIVE_OPERATION);
        }
    }

    if reasons.is_empty() {
        return None;
    }
    reasons.insert(endpoint.reason_code.as_str());
    found.insert(endpoint.violation.as_str());
    Some(ConstraintHit {
        effect,
        reason_codes: reasons,
        violations: found,
    })
}

/// Destructive targets escalate by phase: `plan` can at most dry-run,
/// `apply` needs approval.
pub fn evaluate_phase(intent: &IntentRequest) -> Option<ConstraintHit> {
    if !intent.has_destructive_target() {
        return None;
    }
    let (effect, code) = if intent.context.phase == PHASE_PLAN {
        (Verdict::DryRun, reason_codes::PLAN_PHASE_NON_DESTRUCTIVE)
    } else {
        (Verdict::RequireApproval, reason_codes::DESTRUCTIVE_APPLY_REQUIRES_APPROVAL)
    };
    Some(ConstraintHit {
        effect,
        reason_codes: [code].into_iter().collect(),
        violations: CodeSet::new(),
    })
}

fn matches_any_path(value: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| match_path_pattern(value, p))
}

/// Exact match, `prefix/**` subtree match, or a glob where `*` stays within
/// one path segment.
pub fn match_path_pattern(value: &str, pattern: &str) -> bool {
    let pattern = pattern.trim().replace('\\', "/");
    if pattern.is_empty() {
        return false;
    }
    if pattern == value {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        if value == prefix || value.starts_with(&format!("{prefix}/")) {
            return true;
        }
    }
    GlobBuilder::new(&pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher().is_match(value))
        .unwrap_or(false)
}

fn matches_any_domain(value: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| match_domain_pattern(value, p))
}

/// Exact match, `*.suffix` match on any subdomain, or a glob.
pub fn match_domain_pattern(value: &str, pattern: &str) -> bool {
    let pattern = pattern.trim().to_lowercase();
    let value = value.trim().to_lowercase();
    if pattern.is_empty() {
        return false;
    }
    if pattern == value {
        return true;
    }
    if let Some(suffix) = pattern.strip_prefix('*') {
        if suffix.starts_with('.') && value.ends_with(suffix) {
            return true;
        }
    }
    GlobBuilder::new(&pattern)
        .build()
        .map(|g| g.compile_matcher().is_match(value.as_str()))
        .unwrap_or(false)
}
