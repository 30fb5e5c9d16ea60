//! Script governance: multi-step intents evaluated as one decision.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::signing::TrustedKeys;
use crate::errors::GateError;
use crate::gate::intent::{IntentRequest, Target};
use crate::gate::matcher::{Decision, Requirements};
use crate::gate::policy::Policy;
use crate::gate::registry::Registry;
use crate::gate::verdict::{reason_codes, violations, CodeSet, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk of one step, from its targets.
pub fn step_risk(targets: &[Target]) -> RiskLevel {
    targets
        .iter()
        .map(|t| match t.endpoint_class.as_str() {
            _ if t.destructive => RiskLevel::High,
            "fs.delete" | "proc.exec" => RiskLevel::High,
            "fs.write" | "net.http" | "net.dns" => RiskLevel::Medium,
            _ => RiskLevel::Low,
        })
        .max()
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepVerdict {
    pub index: usize,
    pub tool_name: String,
    pub verdict: Verdict,
    pub reason_codes: Vec<String>,
    pub violations: Vec<String>,
    pub matched_rule: String,
}

/// Registry fast-path inputs.
#[derive(Debug, Clone, Copy)]
pub struct RegistryCheck<'a> {
    pub registry: &'a Registry,
    pub keys: &'a TrustedKeys,
    pub policy_digest: &'a str,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptDecision {
    pub decision: Decision,
    pub step_count: usize,
    pub composite_risk: RiskLevel,
    pub step_verdicts: Vec<StepVerdict>,
    pub pre_approved: bool,
    pub pattern_id: Option<String>,
    /// Set when a registry was consulted.
    pub registry_reason: Option<&'static str>,
}

/// Evaluate a normalized script intent.
///
/// Each step is lifted into an intent under the parent's context and handed
/// to `eval_step`, which runs the single-intent pipeline on it.
pub fn evaluate_script<F>(
    policy: &Policy,
    intent: &IntentRequest,
    registry: Option<RegistryCheck<'_>>,
    mut eval_step: F,
) -> Result<ScriptDecision, GateError>
where
    F: FnMut(&IntentRequest) -> Result<Decision, GateError>,
{
    let steps = intent
        .script
        .as_ref()
        .map(|s| s.steps.as_slice())
        .unwrap_or_default();
    if steps.is_empty() {
        return Err(GateError::InvalidIntent(
            "script intent requires at least one step".into(),
        ));
    }
    let risks: BTreeSet<RiskLevel> = steps.iter().map(|s| step_risk(&s.targets)).collect();
    let mut out = ScriptDecision {
        decision: Decision::block(CodeSet::new(), CodeSet::new()),
        step_count: steps.len(),
        composite_risk: risks.iter().max().copied().unwrap_or_default(),
        step_verdicts: Vec::new(),
        pre_approved: false,
        pattern_id: None,
        registry_reason: None,
    };

    if steps.len() > policy.scripts.max_steps {
        tracing::info!(
            steps = steps.len(),
            max_steps = policy.scripts.max_steps,
            "script exceeds step limit"
        );
        out.decision.reason_codes.insert(reason_codes::SCRIPT_MAX_STEPS_EXCEEDED);
        out.decision.violations.insert(violations::SCRIPT_MAX_STEPS_EXCEEDED);
        return Ok(out);
    }

    if let Some(check) = registry {
        let hit = check
            .registry
            .lookup(intent, check.policy_digest, check.keys, check.now);
        out.registry_reason = Some(hit.reason);
        if hit.matched {
            out.pre_approved = true;
            out.pattern_id = hit.pattern_id;
            out.decision = Decision {
                verdict: Verdict::Allow,
                reason_codes: [reason_codes::APPROVED_SCRIPT_MATCH].into_iter().collect(),
                violations: CodeSet::new(),
                matched_rule: String::new(),
                requirements: Requirements::default(),
            };
            return Ok(out);
        }
    }

    let mut verdict = Verdict::Allow;
    let mut reasons = CodeSet::new();
    let mut violation_set = CodeSet::new();
    let mut matched = BTreeSet::new();
    let mut requirements = Requirements::default();
    for (index, step) in steps.iter().enumerate() {
        let step_intent = intent.step_intent(step).normalize()?;
        let decision = eval_step(&step_intent)?;
        tracing::debug!(index, tool = %step.tool_name, verdict = %decision.verdict, "script step evaluated");

        verdict = verdict.most_restrictive(decision.verdict);
        reasons.merge(&decision.reason_codes);
        violation_set.merge(&decision.violations);
        if !decision.matched_rule.is_empty() {
            matched.insert(decision.matched_rule.clone());
        }
        requirements.merge(&decision.requirements);
        out.step_verdicts.push(StepVerdict {
            index,
            tool_name: step.tool_name.clone(),
            verdict: decision.verdict,
            reason_codes: decision.reason_codes.to_vec(),
            violations: decision.violations.to_vec(),
            matched_rule: decision.matched_rule,
        });
    }

    let above = policy.scripts.require_approval_above;
    if above > 0 && steps.len() > above {
        verdict = verdict.most_restrictive(Verdict::RequireApproval);
        reasons.insert(reason_codes::SCRIPT_STEP_THRESHOLD_APPROVAL);
    }
    if policy.scripts.block_mixed_risk && risks.len() > 1 {
        verdict = Verdict::Block;
        reasons.insert(reason_codes::SCRIPT_MIXED_RISK_BLOCKED);
        violation_set.insert(violations::SCRIPT_MIXED_RISK);
    }

    out.decision = Decision {
        verdict,
        reason_codes: reasons,
        violations: violation_set,
        matched_rule: matched.into_iter().collect::<Vec<_>>().join(","),
        requirements,
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::delegation::DelegationStatus;
    use crate::gate::matcher;
    use crate::gate::registry::{mint, MintApprovedScript};
    use chrono::Duration;
    use ed25519_dalek::SigningKey;
    use serde_json::json;

    fn script(steps: serde_json::Value) -> IntentRequest {
        serde_json::from_value::<IntentRequest>(json!({
            "tool_name": "script",
            "script": {"steps": steps},
            "context": {"identity": "agent", "workspace": "/w", "risk_class": "low"}
        }))
        .unwrap()
        .normalize()
        .unwrap()
    }

    fn read_write() -> IntentRequest {
        script(json!([
            {"tool_name": "tool.read", "targets": [{"kind": "path", "value": "/w/a", "operation": "read"}]},
            {"tool_name": "tool.write", "targets": [{"kind": "path", "value": "/w/b", "operation": "write"}]}
        ]))
    }

    fn policy(yaml: &str) -> Policy {
        Policy::from_yaml_str(yaml).unwrap()
    }

    fn run(
        policy: &Policy,
        intent: &IntentRequest,
        registry: Option<RegistryCheck<'_>>,
    ) -> ScriptDecision {
        evaluate_script(policy, intent, registry, |step| {
            Ok(matcher::resolve(policy, step, &DelegationStatus::default()).into_decision())
        })
        .unwrap()
    }

    const RULES: &str = r#"
rules:
  - name: reads
    effect: allow
    match: {tool_names: [tool.read]}
  - name: writes
    effect: require_approval
    min_approvals: 2
    match: {tool_names: [tool.write]}
"#;

    #[test]
    fn test_step_risk_levels() {
        let i = script(json!([
            {"tool_name": "tool.read", "targets": [{"kind": "path", "value": "/a", "operation": "read"}]},
            {"tool_name": "tool.fetch", "targets": [{"kind": "url", "value": "https://x.test/"}]},
            {"tool_name": "tool.rm", "targets": [{"kind": "path", "value": "/a", "operation": "delete"}]}
        ]));
        let steps = &i.script.as_ref().unwrap().steps;
        assert_eq!(step_risk(&steps[0].targets), RiskLevel::Low);
        assert_eq!(step_risk(&steps[1].targets), RiskLevel::Medium);
        assert_eq!(step_risk(&steps[2].targets), RiskLevel::High);
        assert_eq!(step_risk(&[]), RiskLevel::Low);
    }

    #[test]
    fn test_most_restrictive_step_wins() {
        let p = policy(RULES);
        let out = run(&p, &read_write(), None);
        assert_eq!(out.decision.verdict, Verdict::RequireApproval);
        assert_eq!(out.decision.matched_rule, "reads,writes");
        assert_eq!(out.decision.requirements.min_approvals, 2);
        assert_eq!(out.step_count, 2);
        assert_eq!(out.composite_risk, RiskLevel::Medium);
        assert_eq!(out.step_verdicts.len(), 2);
        assert_eq!(out.step_verdicts[0].verdict, Verdict::Allow);
        assert_eq!(out.step_verdicts[1].matched_rule, "writes");
        assert_eq!(out.registry_reason, None);
    }

    #[test]
    fn test_max_steps_blocks_before_steps() {
        let p = policy(&format!("scripts: {{max_steps: 1}}\n{RULES}"));
        let out = evaluate_script(&p, &read_write(), None, |_| {
            panic!("steps must not be evaluated")
        })
        .unwrap();
        assert_eq!(out.decision.verdict, Verdict::Block);
        assert_eq!(out.decision.reason_codes.to_vec(), vec!["script_max_steps_exceeded"]);
        assert!(out.step_verdicts.is_empty());
    }

    #[test]
    fn test_threshold_and_mixed_risk() {
        let p = policy(&format!("scripts: {{require_approval_above: 1}}\n{RULES}"));
        let out = run(&p, &read_write(), None);
        assert!(out.decision.reason_codes.contains("script_step_threshold_approval"));

        let p = policy(&format!("scripts: {{block_mixed_risk: true}}\n{RULES}"));
        let out = run(&p, &read_write(), None);
        assert_eq!(out.decision.verdict, Verdict::Block);
        assert!(out.decision.reason_codes.contains("script_mixed_risk_blocked"));
        assert!(out.decision.violations.contains("script_mixed_risk"));
    }

    #[test]
    fn test_registry_fast_path() {
        let p = policy(RULES);
        let intent = read_write();
        let digest = p.digest().unwrap();
        let now: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().unwrap();
        let key = SigningKey::generate(&mut rand::thread_rng());
        let keys = TrustedKeys::from_keys([key.verifying_key()]).unwrap();
        let entry = mint(
            &MintApprovedScript {
                pattern_id: "rw".into(),
                policy_digest: digest.clone(),
                script: intent.clone(),
                approver_identity: "secops".into(),
                scope: vec![],
                ttl: Duration::hours(1),
                now,
            },
            &key,
        )
        .unwrap();
        let registry = Registry::new(vec![entry]).unwrap();
        let check = RegistryCheck {
            registry: &registry,
            keys: &keys,
            policy_digest: &digest,
            now,
        };

        let out = evaluate_script(&p, &intent, Some(check), |_| panic!("fast path"))
            .unwrap();
        assert!(out.pre_approved);
        assert_eq!(out.decision.verdict, Verdict::Allow);
        assert_eq!(out.pattern_id.as_deref(), Some("rw"));
        assert_eq!(out.registry_reason, Some("approved_script_match"));

        let expired = RegistryCheck {
            now: now + Duration::hours(2),
            ..check
        };
        let out = run(&p, &intent, Some(expired));
        assert!(!out.pre_approved);
        assert_eq!(out.registry_reason, Some("approved_script_not_found"));
        assert_eq!(out.decision.verdict, Verdict::RequireApproval);
    }
}
