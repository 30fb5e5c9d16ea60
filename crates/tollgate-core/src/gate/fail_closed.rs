//! Fail-closed validation for high-risk intents.
//!
//! Runs before any rule is consulted, so no `allow` rule can override it for
//! a fail-closed risk class.

use crate::gate::intent::IntentRequest;
use crate::gate::policy::FailClosedPolicy;
use crate::gate::verdict::{reason_codes, violations, CodeSet};

/// Missing evidence found on a fail-closed intent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailClosedFindings {
    pub reason_codes: CodeSet,
    pub violations: CodeSet,
}

impl FailClosedFindings {
    pub fn is_empty(&self) -> bool {
        self.reason_codes.is_empty()
    }

    /// Findings for an intent that could not be normalized at all.
    pub fn not_evaluable() -> Self {
        FailClosedFindings {
            reason_codes: [reason_codes::FAIL_CLOSED_INTENT_INVALID].into_iter().collect(),
            violations: [violations::INTENT_NOT_EVALUABLE].into_iter().collect(),
        }
    }
}

/// Check each required field. Returns `None` when the intent's risk class is
/// not fail-closed.
pub fn check(policy: &FailClosedPolicy, intent: &IntentRequest) -> Option<FailClosedFindings> {
    if !policy.applies_to(&intent.context.risk_class) {
        return None;
    }
    let mut findings = FailClosedFindings::default();
    for field in &policy.required_fields {
        let missing = match field.as_str() {
            "targets" => intent.targets.is_empty().then_some((
                reason_codes::FAIL_CLOSED_MISSING_TARGETS,
                violations::MISSING_TARGETS,
            )),
            "arg_provenance" => intent.arg_provenance.is_empty().then_some((
                reason_codes::FAIL_CLOSED_MISSING_ARG_PROVENANCE,
                violations::MISSING_ARG_PROVENANCE,
            )),
            "endpoint_class" => intent
                .targets
                .iter()
                .any(|t| t.endpoint_class.is_empty() || t.endpoint_class == "other")
                .then_some((
                    reason_codes::FAIL_CLOSED_MISSING_ENDPOINT_CLASS,
                    violations::MISSING_ENDPOINT_CLASS,
                )),
            "delegation" => intent.delegation.is_none().then_some((
                reason_codes::FAIL_CLOSED_MISSING_DELEGATION,
                violations::MISSING_DELEGATION,
            )),
            _ => None,
        };
        if let Some((code, violation)) = missing {
            findings.reason_codes.insert(code);
            findings.violations.insert(violation);
        }
    }
    Some(findings)
}
