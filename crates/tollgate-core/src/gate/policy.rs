//! Policy model, load-time validation and policy digest.
//!
//! Policies are YAML. Parsing is strict (`deny_unknown_fields` everywhere) so
//! a typo cannot silently widen what a rule allows. After parsing the policy
//! is normalized (lists lower-cased where case-insensitive, sorted and
//! deduplicated, defaults filled in) and the digest is taken over that
//! normalized form, so formatting-only edits never change it.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use globset::GlobBuilder;
use serde::{Deserialize, Serialize};

use crate::crypto::jcs;
use crate::errors::GateError;
use crate::gate::intent::ENDPOINT_CLASSES;
use crate::gate::verdict::{reason_codes, violations, Verdict};

pub const POLICY_SCHEMA_ID: &str = "tollgate.policy";
pub const POLICY_SCHEMA_VERSION: &str = "1.0.0";

pub const DEFAULT_MAX_SCRIPT_STEPS: usize = 64;
pub const DEFAULT_MAX_DELEGATION_DEPTH: usize = 8;
pub const DEFAULT_FAIL_CLOSED_RISK_CLASSES: &[&str] = &["critical", "high"];
pub const FAIL_CLOSED_FIELDS: &[&str] = &["targets", "arg_provenance", "endpoint_class", "delegation"];

const DEFAULT_TAINTED_SOURCES: &[&str] = &["external", "tool_output"];

fn default_schema_id() -> String {
    POLICY_SCHEMA_ID.to_string()
}

fn default_schema_version() -> String {
    POLICY_SCHEMA_VERSION.to_string()
}

fn default_verdict() -> Verdict {
    Verdict::RequireApproval
}

fn default_max_steps() -> usize {
    DEFAULT_MAX_SCRIPT_STEPS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    #[serde(default = "default_schema_id")]
    pub schema_id: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    #[serde(default = "default_verdict")]
    pub default_verdict: Verdict,
    #[serde(default)]
    pub scripts: ScriptPolicy,
    #[serde(default)]
    pub fail_closed: FailClosedPolicy,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            schema_id: default_schema_id(),
            schema_version: default_schema_version(),
            default_verdict: default_verdict(),
            scripts: ScriptPolicy::default(),
            fail_closed: FailClosedPolicy::default(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptPolicy {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Scripts with more steps than this need approval. Zero disables.
    #[serde(default)]
    pub require_approval_above: usize,
    #[serde(default)]
    pub block_mixed_risk: bool,
}

impl Default for ScriptPolicy {
    fn default() -> Self {
        ScriptPolicy {
            max_steps: DEFAULT_MAX_SCRIPT_STEPS,
            require_approval_above: 0,
            block_mixed_risk: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailClosedPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub risk_classes: Vec<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
}

impl FailClosedPolicy {
    /// The block the strict profile imposes when a policy leaves fail-closed off.
    pub fn strict_default() -> Self {
        FailClosedPolicy {
            enabled: true,
            risk_classes: DEFAULT_FAIL_CLOSED_RISK_CLASSES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            required_fields: vec!["arg_provenance".to_string(), "targets".to_string()],
        }
    }

    pub fn applies_to(&self, risk_class: &str) -> bool {
        self.enabled
            && self
                .risk_classes
                .iter()
                .any(|c| c == &risk_class.trim().to_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyRule {
    #[serde(default)]
    pub name: String,
    pub effect: Verdict,
    #[serde(rename = "match", default)]
    pub predicate: RuleMatch,
    #[serde(default)]
    pub reason_codes: Vec<String>,
    #[serde(default)]
    pub violations: Vec<String>,
    #[serde(default)]
    pub min_approvals: u32,
    #[serde(default)]
    pub require_broker_credential: bool,
    #[serde(default)]
    pub broker_reference: String,
    #[serde(default)]
    pub broker_scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataflow: Option<DataflowPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointPolicy>,
}

impl PolicyRule {
    /// Approvals needed to lift a `require_approval` verdict from this rule.
    pub fn required_approvals(&self) -> u32 {
        self.min_approvals.max(1)
    }

    /// Fallback reason when the rule declares none.
    pub fn matched_reason(&self) -> String {
        format!("{}{}", reason_codes::MATCHED_RULE_PREFIX, sanitize_name(&self.name))
    }
}

/// Rule predicate. Every populated field must hold; absent fields match
/// anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleMatch {
    #[serde(default)]
    pub tool_names: Vec<String>,
    #[serde(default)]
    pub risk_classes: Vec<String>,
    #[serde(default)]
    pub identities: Vec<String>,
    #[serde(default)]
    pub workspace_prefixes: Vec<String>,
    #[serde(default)]
    pub target_kinds: Vec<String>,
    #[serde(default)]
    pub target_values: Vec<String>,
    #[serde(default)]
    pub target_operations: Vec<String>,
    #[serde(default)]
    pub endpoint_classes: Vec<String>,
    #[serde(default)]
    pub data_classes: Vec<String>,
    #[serde(default)]
    pub provenance_sources: Vec<String>,
    #[serde(default)]
    pub require_delegation: bool,
    #[serde(default)]
    pub allowed_delegator_identities: Vec<String>,
    #[serde(default)]
    pub allowed_delegate_identities: Vec<String>,
    #[serde(default)]
    pub delegation_scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delegation_depth: Option<usize>,
}

impl RuleMatch {
    pub fn is_empty(&self) -> bool {
        self.tool_names.is_empty()
            && self.risk_classes.is_empty()
            && self.identities.is_empty()
            && self.workspace_prefixes.is_empty()
            && self.target_kinds.is_empty()
            && self.target_values.is_empty()
            && self.target_operations.is_empty()
            && self.endpoint_classes.is_empty()
            && self.data_classes.is_empty()
            && self.provenance_sources.is_empty()
            && !self.delegation_constrained()
    }

    /// True when any delegation field is set.
    pub fn delegation_constrained(&self) -> bool {
        self.require_delegation
            || !self.allowed_delegator_identities.is_empty()
            || !self.allowed_delegate_identities.is_empty()
            || !self.delegation_scopes.is_empty()
            || self.max_delegation_depth.is_some()
    }

    pub fn effective_max_delegation_depth(&self) -> usize {
        self.max_delegation_depth
            .unwrap_or(DEFAULT_MAX_DELEGATION_DEPTH)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateWindow {
    #[default]
    Minute,
    Hour,
}

impl RateWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateWindow::Minute => "minute",
            RateWindow::Hour => "hour",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateScope {
    Tool,
    Identity,
    #[default]
    ToolIdentity,
}

impl RateScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateScope::Tool => "tool",
            RateScope::Identity => "identity",
            RateScope::ToolIdentity => "tool_identity",
        }
    }
}

impl fmt::Display for RateScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitPolicy {
    pub requests: u32,
    #[serde(default)]
    pub window: RateWindow,
    #[serde(default)]
    pub scope: RateScope,
}

impl RateLimitPolicy {
    /// The tighter of two limits: fewer requests, then the shorter window,
    /// then the narrower scope name.
    pub fn tighter(self, other: RateLimitPolicy) -> RateLimitPolicy {
        let key = |p: &RateLimitPolicy| (p.requests, p.window, p.scope.as_str());
        if key(&other) < key(&self) {
            other
        } else {
            self
        }
    }
}

/// Escalation a constraint applies when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintAction {
    #[default]
    Block,
    RequireApproval,
}

impl From<ConstraintAction> for Verdict {
    fn from(action: ConstraintAction) -> Self {
        match action {
            ConstraintAction::Block => Verdict::Block,
            ConstraintAction::RequireApproval => Verdict::RequireApproval,
        }
    }
}

fn default_dataflow_action() -> ConstraintAction {
    ConstraintAction::RequireApproval
}

/// Tainted provenance flowing to an egress destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataflowPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tainted_sources: Vec<String>,
    #[serde(default)]
    pub destination_kinds: Vec<String>,
    #[serde(default)]
    pub destination_values: Vec<String>,
    #[serde(default)]
    pub destination_operations: Vec<String>,
    #[serde(default = "default_dataflow_action")]
    pub action: ConstraintAction,
    #[serde(default)]
    pub reason_code: String,
    #[serde(default)]
    pub violation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub path_allowlist: Vec<String>,
    #[serde(default)]
    pub path_denylist: Vec<String>,
    #[serde(default)]
    pub domain_allowlist: Vec<String>,
    #[serde(default)]
    pub domain_denylist: Vec<String>,
    #[serde(default)]
    pub egress_classes: Vec<String>,
    #[serde(default)]
    pub action: ConstraintAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destructive_action: Option<ConstraintAction>,
    #[serde(default)]
    pub reason_code: String,
    #[serde(default)]
    pub violation: String,
}

impl Policy {
    /// Parse and normalize a YAML policy.
    pub fn from_yaml_str(content: &str) -> Result<Policy, GateError> {
        let parsed: Policy = serde_yaml::from_str(content)
            .map_err(|e| GateError::InvalidPolicy(format!("parse policy YAML: {e}")))?;
        parsed.normalize()
    }

    /// Read, parse and normalize a policy file.
    pub fn load(path: &Path) -> Result<Policy, GateError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GateError::io(format!("read policy {}", path.display()), e))?;
        let policy = Self::from_yaml_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            rules = policy.rules.len(),
            "policy loaded"
        );
        Ok(policy)
    }

    /// Digest over the canonical JSON of the normalized policy.
    pub fn digest(&self) -> Result<String, GateError> {
        Ok(jcs::digest(self)?)
    }

    /// True when any rule needs a brokered credential.
    pub fn requires_broker(&self) -> bool {
        self.rules.iter().any(|r| r.require_broker_credential)
    }

    pub fn rule(&self, name: &str) -> Option<&PolicyRule> {
        self.rules.iter().find(|r| r.name == name)
    }

    /// Validate and canonicalize. Idempotent.
    pub fn normalize(mut self) -> Result<Policy, GateError> {
        if self.schema_id.trim() != POLICY_SCHEMA_ID {
            return Err(invalid(format!("unsupported schema_id: {}", self.schema_id)));
        }
        if self.schema_version.trim() != POLICY_SCHEMA_VERSION {
            return Err(invalid(format!(
                "unsupported schema_version: {}",
                self.schema_version
            )));
        }
        self.schema_id = POLICY_SCHEMA_ID.to_string();
        self.schema_version = POLICY_SCHEMA_VERSION.to_string();

        if self.scripts.max_steps == 0 {
            self.scripts.max_steps = DEFAULT_MAX_SCRIPT_STEPS;
        }

        let fc = &mut self.fail_closed;
        fc.risk_classes = lower_set(&fc.risk_classes);
        fc.required_fields = lower_set(&fc.required_fields);
        if !fc.enabled && (!fc.risk_classes.is_empty() || !fc.required_fields.is_empty()) {
            return Err(invalid(
                "fail_closed declares risk_classes or required_fields but is not enabled",
            ));
        }
        if let Some(field) = fc
            .required_fields
            .iter()
            .find(|f| !FAIL_CLOSED_FIELDS.contains(&f.as_str()))
        {
            return Err(invalid(format!("unsupported fail_closed required_field: {field}")));
        }
        if fc.enabled && fc.risk_classes.is_empty() {
            fc.risk_classes = DEFAULT_FAIL_CLOSED_RISK_CLASSES
                .iter()
                .map(|s| s.to_string())
                .collect();
        }

        let mut seen = BTreeSet::new();
        for rule in &mut self.rules {
            rule.name = rule.name.trim().to_string();
            if rule.name.is_empty() {
                return Err(invalid("rule name is required"));
            }
            if !seen.insert(rule.name.clone()) {
                return Err(invalid(format!("duplicate rule name: {}", rule.name)));
            }
            normalize_rule(rule)?;
        }
        Ok(self)
    }
}

fn invalid(message: impl Into<String>) -> GateError {
    GateError::InvalidPolicy(message.into())
}

fn normalize_rule(rule: &mut PolicyRule) -> Result<(), GateError> {
    let name = rule.name.clone();
    let m = &mut rule.predicate;
    m.tool_names = lower_set(&m.tool_names);
    m.risk_classes = lower_set(&m.risk_classes);
    m.identities = trimmed_set(&m.identities);
    m.workspace_prefixes = trimmed_set(&m.workspace_prefixes)
        .into_iter()
        .map(|p| p.replace('\\', "/"))
        .collect();
    m.target_kinds = lower_set(&m.target_kinds);
    m.target_values = trimmed_set(&m.target_values);
    m.target_operations = lower_set(&m.target_operations);
    m.endpoint_classes = lower_set(&m.endpoint_classes);
    m.data_classes = lower_set(&m.data_classes);
    m.provenance_sources = lower_set(&m.provenance_sources);
    m.allowed_delegator_identities = trimmed_set(&m.allowed_delegator_identities);
    m.allowed_delegate_identities = trimmed_set(&m.allowed_delegate_identities);
    m.delegation_scopes = lower_set(&m.delegation_scopes);

    if m.is_empty() {
        return Err(invalid(format!("rule {name} has an empty match")));
    }
    if let Some(class) = m
        .endpoint_classes
        .iter()
        .find(|c| !ENDPOINT_CLASSES.contains(&c.as_str()))
    {
        return Err(invalid(format!(
            "unsupported match endpoint_class {class:?} for {name}"
        )));
    }

    rule.reason_codes = trimmed_set(&rule.reason_codes);
    rule.violations = trimmed_set(&rule.violations);
    rule.broker_reference = rule.broker_reference.trim().to_string();
    rule.broker_scopes = lower_set(&rule.broker_scopes);

    if let Some(limit) = &rule.rate_limit {
        if limit.requests == 0 {
            return Err(invalid(format!("rate_limit.requests must be >= 1 for {name}")));
        }
    }

    if let Some(dataflow) = &mut rule.dataflow {
        dataflow.tainted_sources = lower_set(&dataflow.tainted_sources);
        if dataflow.tainted_sources.is_empty() {
            dataflow.tainted_sources = DEFAULT_TAINTED_SOURCES.iter().map(|s| s.to_string()).collect();
        }
        dataflow.destination_kinds = lower_set(&dataflow.destination_kinds);
        dataflow.destination_values = trimmed_set(&dataflow.destination_values);
        dataflow.destination_operations = lower_set(&dataflow.destination_operations);
        dataflow.reason_code = non_empty_or(&dataflow.reason_code, reason_codes::DATAFLOW_TAINTED_DESTINATION);
        dataflow.violation = non_empty_or(&dataflow.violation, violations::TAINTED_DATAFLOW);
    }

    if let Some(endpoint) = &mut rule.endpoint {
        endpoint.path_allowlist = path_patterns(&endpoint.path_allowlist);
        endpoint.path_denylist = path_patterns(&endpoint.path_denylist);
        for pattern in endpoint.path_allowlist.iter().chain(&endpoint.path_denylist) {
            GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .map_err(|e| invalid(format!("invalid endpoint path pattern {pattern:?} for {name}: {e}")))?;
        }
        endpoint.domain_allowlist = lower_set(&endpoint.domain_allowlist);
        endpoint.domain_denylist = lower_set(&endpoint.domain_denylist);
        endpoint.egress_classes = lower_set(&endpoint.egress_classes);
        if let Some(class) = endpoint
            .egress_classes
            .iter()
            .find(|c| !c.starts_with("net.") || !ENDPOINT_CLASSES.contains(&c.as_str()))
        {
            return Err(invalid(format!(
                "endpoint.egress_classes must be network classes, got {class:?} for {name}"
            )));
        }
        endpoint.reason_code = non_empty_or(&endpoint.reason_code, reason_codes::ENDPOINT_CONSTRAINT_VIOLATION);
        endpoint.violation = non_empty_or(&endpoint.violation, violations::ENDPOINT_CONSTRAINT_VIOLATION);
    }
    Ok(())
}

fn non_empty_or(value: &str, fallback: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn trimmed_set(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn lower_set(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn path_patterns(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().replace('\\', "/"))
        .filter(|v| !v.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Lower-case rule name with spaces and dashes folded to `_`.
pub fn sanitize_name(name: &str) -> String {
    if name.is_empty() {
        return "rule".to_string();
    }
    name.to_lowercase().replace([' ', '-'], "_")
}
