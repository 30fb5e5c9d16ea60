//! Intent intake: validation, normalization and digesting.
//!
//! A raw intent is untrusted. [`IntentRequest::normalize`] produces the
//! canonical form every later stage works on; digests supplied by the client
//! are discarded and recomputed from that form.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::crypto::jcs;
use crate::errors::GateError;

/// Hard intake ceiling on script length. Policies bound it further via
/// `scripts.max_steps`.
pub const MAX_SCRIPT_STEPS_INTAKE: usize = 1024;

pub const TARGET_KINDS: &[&str] = &[
    "path", "url", "host", "repo", "bucket", "table", "queue", "topic", "other",
];

pub const PROVENANCE_SOURCES: &[&str] = &[
    "user",
    "tool_output",
    "untrusted_external",
    "external",
    "system",
];

pub const ENDPOINT_CLASSES: &[&str] = &[
    "fs.read",
    "fs.write",
    "fs.delete",
    "proc.exec",
    "net.http",
    "net.dns",
    "other",
];

pub const PHASE_PLAN: &str = "plan";
pub const PHASE_APPLY: &str = "apply";

static HEX_DIGEST: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-f0-9]{64}$").unwrap());

/// True for a bare lowercase SHA-256 hex digest.
pub fn is_hex_digest(value: &str) -> bool {
    HEX_DIGEST.is_match(value)
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A proposed tool call. Script steps use this same type; their `context`
/// is inherited from the enclosing intent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentRequest {
    #[serde(default)]
    pub tool_name: String,
    #[serde(default = "empty_object")]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<IntentScript>,
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub arg_provenance: Vec<ArgProvenance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<Delegation>,
    #[serde(default)]
    pub context: IntentContext,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentScript {
    #[serde(default)]
    pub steps: Vec<IntentRequest>,
}

/// A concrete resource touched by the call. Field order is the sort order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sensitivity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint_class: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint_domain: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub destructive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArgProvenance {
    #[serde(default)]
    pub arg_path: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_ref: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub integrity_digest: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentContext {
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub risk_class: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
}

/// Delegation claim carried by the intent. The signed proof is presented
/// separately as a chain of delegation tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delegation {
    #[serde(default)]
    pub requester_identity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope_class: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<DelegationLink>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DelegationLink {
    #[serde(default)]
    pub delegator_identity: String,
    #[serde(default)]
    pub delegate_identity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope_class: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl IntentRequest {
    /// Parse raw JSON bytes. Shape errors are reported as `InvalidIntent`.
    pub fn from_json_slice(raw: &[u8]) -> Result<Self, GateError> {
        serde_json::from_slice(raw)
            .map_err(|e| GateError::InvalidIntent(format!("parse intent JSON: {e}")))
    }

    pub fn is_script(&self) -> bool {
        self.script.is_some()
    }

    pub fn is_apply_phase(&self) -> bool {
        self.context.phase != PHASE_PLAN
    }

    /// True when any target is destructive.
    pub fn has_destructive_target(&self) -> bool {
        self.targets.iter().any(|t| t.destructive)
    }

    /// Number of distinct operations the call performs, counting
    /// target-less calls as one.
    pub fn operation_count(&self) -> usize {
        match &self.script {
            Some(script) => script.steps.len(),
            None => 1,
        }
    }

    /// Validate and canonicalize, recomputing every digest.
    pub fn normalize(&self) -> Result<IntentRequest, GateError> {
        let script = match &self.script {
            Some(script) => Some(normalize_script(script)?),
            None => None,
        };

        let mut tool_name = self.tool_name.trim().to_lowercase();
        if script.is_some() {
            tool_name = "script".to_string();
        }
        if tool_name.is_empty() {
            return Err(invalid("tool_name is required"));
        }

        let args = normalize_args(&self.args).map_err(|e| invalid(format!("args: {e}")))?;

        let mut raw_targets = self.targets.clone();
        let mut raw_provenance = self.arg_provenance.clone();
        if let Some(script) = &script {
            if raw_targets.is_empty() {
                raw_targets = script
                    .steps
                    .iter()
                    .flat_map(|s| s.targets.iter().cloned())
                    .collect();
            }
            if raw_provenance.is_empty() {
                raw_provenance = script
                    .steps
                    .iter()
                    .flat_map(|s| s.arg_provenance.iter().cloned())
                    .collect();
            }
        }
        let targets = normalize_targets(&tool_name, &raw_targets)?;
        let arg_provenance = normalize_provenance(&raw_provenance)?;
        let context = normalize_context(&self.context)?;
        let delegation = match &self.delegation {
            Some(d) => Some(normalize_delegation(d)?),
            None => None,
        };

        let script_hash = match &script {
            Some(script) => Some(jcs::digest(&ScriptView::of(script))?),
            None => None,
        };

        let mut normalized = IntentRequest {
            tool_name,
            args,
            args_digest: None,
            intent_digest: None,
            script_hash,
            script,
            targets,
            arg_provenance,
            delegation,
            context,
        };
        normalized.args_digest = Some(jcs::digest(&normalized.args)?);
        normalized.intent_digest = Some(jcs::digest(&IntentView::of(&normalized))?);
        Ok(normalized)
    }

    /// A single script step lifted into a standalone intent under this
    /// intent's context and delegation claim.
    pub fn step_intent(&self, step: &IntentRequest) -> IntentRequest {
        IntentRequest {
            tool_name: step.tool_name.clone(),
            args: step.args.clone(),
            args_digest: None,
            intent_digest: None,
            script_hash: None,
            script: None,
            targets: step.targets.clone(),
            arg_provenance: step.arg_provenance.clone(),
            delegation: self.delegation.clone(),
            context: self.context.clone(),
        }
    }

    /// Digest of a normalized intent, as carried in `intent_digest`.
    pub fn digest(&self) -> Result<String, GateError> {
        match &self.intent_digest {
            Some(d) => Ok(d.clone()),
            None => Ok(self.normalize()?.intent_digest.unwrap_or_default()),
        }
    }
}

/// What the intent digest covers: everything except the digests themselves.
#[derive(Serialize)]
struct IntentView<'a> {
    tool_name: &'a str,
    args: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    script_hash: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    script: Option<ScriptView<'a>>,
    targets: &'a [Target],
    #[serde(skip_serializing_if = "<[ArgProvenance]>::is_empty")]
    arg_provenance: &'a [ArgProvenance],
    #[serde(skip_serializing_if = "Option::is_none")]
    delegation: Option<&'a Delegation>,
    context: &'a IntentContext,
}

impl<'a> IntentView<'a> {
    fn of(intent: &'a IntentRequest) -> Self {
        IntentView {
            tool_name: &intent.tool_name,
            args: &intent.args,
            script_hash: intent.script_hash.as_deref(),
            script: intent.script.as_ref().map(ScriptView::of),
            targets: &intent.targets,
            arg_provenance: &intent.arg_provenance,
            delegation: intent.delegation.as_ref(),
            context: &intent.context,
        }
    }
}

/// What the script hash covers: the ordered steps, nothing else.
#[derive(Serialize)]
struct ScriptView<'a> {
    steps: Vec<StepView<'a>>,
}

#[derive(Serialize)]
struct StepView<'a> {
    tool_name: &'a str,
    args: &'a Value,
    #[serde(skip_serializing_if = "<[Target]>::is_empty")]
    targets: &'a [Target],
    #[serde(skip_serializing_if = "<[ArgProvenance]>::is_empty")]
    arg_provenance: &'a [ArgProvenance],
}

impl<'a> ScriptView<'a> {
    fn of(script: &'a IntentScript) -> Self {
        ScriptView {
            steps: script
                .steps
                .iter()
                .map(|s| StepView {
                    tool_name: &s.tool_name,
                    args: &s.args,
                    targets: &s.targets,
                    arg_provenance: &s.arg_provenance,
                })
                .collect(),
        }
    }
}

fn invalid(message: impl Into<String>) -> GateError {
    GateError::InvalidIntent(message.into())
}

fn normalize_script(script: &IntentScript) -> Result<IntentScript, GateError> {
    if script.steps.is_empty() {
        return Err(invalid("script.steps must not be empty"));
    }
    if script.steps.len() > MAX_SCRIPT_STEPS_INTAKE {
        return Err(invalid(format!(
            "script.steps exceeds intake ceiling ({MAX_SCRIPT_STEPS_INTAKE})"
        )));
    }
    let mut steps = Vec::with_capacity(script.steps.len());
    for (index, step) in script.steps.iter().enumerate() {
        if step.script.is_some() {
            return Err(invalid(format!("script.steps[{index}] cannot nest a script")));
        }
        let tool_name = step.tool_name.trim().to_lowercase();
        if tool_name.is_empty() {
            return Err(invalid(format!("script.steps[{index}].tool_name is required")));
        }
        let args = normalize_args(&step.args)
            .map_err(|e| invalid(format!("script.steps[{index}].args: {e}")))?;
        let targets = normalize_targets(&tool_name, &step.targets)
            .map_err(|e| invalid(format!("script.steps[{index}]: {}", strip_prefix(&e))))?;
        let arg_provenance = normalize_provenance(&step.arg_provenance)
            .map_err(|e| invalid(format!("script.steps[{index}]: {}", strip_prefix(&e))))?;
        steps.push(IntentRequest {
            tool_name,
            args,
            targets,
            arg_provenance,
            ..IntentRequest::default()
        });
    }
    Ok(IntentScript { steps })
}

fn strip_prefix(err: &GateError) -> String {
    match err {
        GateError::InvalidIntent(message) => message.clone(),
        other => other.to_string(),
    }
}

fn normalize_args(args: &Value) -> Result<Value, String> {
    match args {
        Value::Null => Ok(empty_object()),
        Value::Object(_) => normalize_json_value(args),
        _ => Err("must be a JSON object".to_string()),
    }
}

fn normalize_json_value(value: &Value) -> Result<Value, String> {
    match value {
        Value::String(s) => Ok(Value::String(s.trim().to_string())),
        Value::Array(items) => items
            .iter()
            .map(normalize_json_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, nested) in map {
                let key = key.trim();
                if key.is_empty() {
                    return Err("contains empty key".to_string());
                }
                out.insert(key.to_string(), normalize_json_value(nested)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn normalize_targets(tool_name: &str, targets: &[Target]) -> Result<Vec<Target>, GateError> {
    let mut out = Vec::with_capacity(targets.len());
    for target in targets {
        let kind = target.kind.trim().to_lowercase();
        let value = target.value.trim().to_string();
        let operation = target.operation.trim().to_lowercase();
        let sensitivity = target.sensitivity.trim().to_lowercase();
        let mut endpoint_class = target.endpoint_class.trim().to_lowercase();
        let mut endpoint_domain = target.endpoint_domain.trim().to_lowercase();

        if kind.is_empty() || value.is_empty() {
            return Err(invalid("targets require kind and value"));
        }
        if !TARGET_KINDS.contains(&kind.as_str()) {
            return Err(invalid(format!("unsupported target kind: {kind}")));
        }
        if endpoint_class.is_empty() {
            endpoint_class = infer_endpoint_class(&kind, &operation, tool_name).to_string();
        }
        if !ENDPOINT_CLASSES.contains(&endpoint_class.as_str()) {
            return Err(invalid(format!("unsupported endpoint class: {endpoint_class}")));
        }
        if endpoint_domain.is_empty() {
            endpoint_domain = infer_endpoint_domain(&kind, &value);
        }
        let destructive = target.destructive || infer_destructive(&endpoint_class, &operation);

        out.push(Target {
            kind,
            value,
            operation,
            sensitivity,
            endpoint_class,
            endpoint_domain,
            destructive,
        });
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn has_tool_hint(tool_name: &str, hints: &[&str]) -> bool {
    let base = tool_name.rsplit('/').next().unwrap_or(tool_name);
    hints.iter().any(|hint| base.contains(hint))
}

pub(crate) fn infer_endpoint_class(kind: &str, operation: &str, tool_name: &str) -> &'static str {
    match kind {
        "path" => match operation {
            "read" | "get" | "list" | "open" | "cat" | "head" | "download" | "stat" => "fs.read",
            "write" | "append" | "put" | "create" | "update" | "save" | "copy" | "move"
            | "rename" => "fs.write",
            "delete" | "remove" | "rm" | "unlink" | "rmdir" | "drop" | "truncate" => "fs.delete",
            _ if has_tool_hint(tool_name, &["read", "list", "fetch", "search"]) => "fs.read",
            _ if has_tool_hint(tool_name, &["write", "update", "save", "create"]) => "fs.write",
            _ if has_tool_hint(tool_name, &["delete", "remove", "rm", "drop"]) => "fs.delete",
            _ => "other",
        },
        "host" | "url" => match operation {
            "dns" | "resolve" | "lookup" => "net.dns",
            _ => "net.http",
        },
        "other" => match operation {
            "exec" | "spawn" | "run" | "shell" | "command" => "proc.exec",
            _ if has_tool_hint(tool_name, &["exec", "shell", "command", "spawn", "run"]) => {
                "proc.exec"
            }
            _ => "other",
        },
        _ => "other",
    }
}

fn infer_endpoint_domain(kind: &str, value: &str) -> String {
    match kind {
        "host" => {
            let host = value
                .trim()
                .trim_start_matches("http://")
                .trim_start_matches("https://");
            let host = host.split('/').next().unwrap_or_default();
            let host = host.split(':').next().unwrap_or_default();
            host.trim().to_lowercase()
        }
        "url" => url::Url::parse(value.trim())
            .ok()
            .and_then(|u| u.host_str().map(str::to_lowercase))
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn infer_destructive(endpoint_class: &str, operation: &str) -> bool {
    matches!(endpoint_class, "fs.delete" | "proc.exec")
        || matches!(
            operation,
            "delete" | "remove" | "rm" | "unlink" | "rmdir" | "drop" | "truncate" | "exec" | "spawn"
        )
}

fn normalize_provenance(entries: &[ArgProvenance]) -> Result<Vec<ArgProvenance>, GateError> {
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        let arg_path = entry.arg_path.trim().to_string();
        let source = entry.source.trim().to_lowercase();
        if arg_path.is_empty() || source.is_empty() {
            return Err(invalid("arg provenance requires arg_path and source"));
        }
        if !PROVENANCE_SOURCES.contains(&source.as_str()) {
            return Err(invalid(format!("unsupported provenance source: {source}")));
        }
        let integrity_digest = entry.integrity_digest.trim().to_lowercase();
        if !integrity_digest.is_empty() && !is_hex_digest(&integrity_digest) {
            return Err(invalid(format!(
                "invalid provenance integrity_digest: {integrity_digest}"
            )));
        }
        out.push(ArgProvenance {
            arg_path,
            source,
            source_ref: entry.source_ref.trim().to_string(),
            integrity_digest,
        });
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn normalize_context(context: &IntentContext) -> Result<IntentContext, GateError> {
    let identity = context.identity.trim();
    let workspace = context.workspace.trim();
    let risk_class = context.risk_class.trim().to_lowercase();
    if identity.is_empty() {
        return Err(invalid("context.identity is required"));
    }
    if workspace.is_empty() {
        return Err(invalid("context.workspace is required"));
    }
    if risk_class.is_empty() {
        return Err(invalid("context.risk_class is required"));
    }
    let phase = match context.phase.trim().to_lowercase().as_str() {
        "" | PHASE_APPLY => PHASE_APPLY.to_string(),
        PHASE_PLAN => PHASE_PLAN.to_string(),
        other => return Err(invalid(format!("context.phase must be plan or apply, got {other}"))),
    };
    Ok(IntentContext {
        identity: identity.to_string(),
        workspace: workspace.replace('\\', "/"),
        risk_class,
        phase,
        session_id: context.session_id.trim().to_string(),
        request_id: context.request_id.trim().to_string(),
    })
}

fn normalize_delegation(delegation: &Delegation) -> Result<Delegation, GateError> {
    let requester_identity = delegation.requester_identity.trim().to_string();
    if requester_identity.is_empty() {
        return Err(invalid("delegation.requester_identity is required"));
    }
    let mut chain = Vec::with_capacity(delegation.chain.len());
    for (index, link) in delegation.chain.iter().enumerate() {
        let delegator_identity = link.delegator_identity.trim().to_string();
        let delegate_identity = link.delegate_identity.trim().to_string();
        if delegator_identity.is_empty() || delegate_identity.is_empty() {
            return Err(invalid(format!(
                "delegation.chain[{index}] requires delegator_identity and delegate_identity"
            )));
        }
        if let (Some(issued), Some(expires)) = (link.issued_at, link.expires_at) {
            if expires <= issued {
                return Err(invalid(format!(
                    "delegation.chain[{index}] expires_at must be after issued_at"
                )));
            }
        }
        chain.push(DelegationLink {
            delegator_identity,
            delegate_identity,
            scope_class: link.scope_class.trim().to_lowercase(),
            token_ref: link.token_ref.trim().to_string(),
            issued_at: link.issued_at,
            expires_at: link.expires_at,
        });
    }
    let mut token_refs: Vec<String> = delegation
        .token_refs
        .iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    token_refs.sort();
    token_refs.dedup();

    Ok(Delegation {
        requester_identity,
        scope_class: delegation.scope_class.trim().to_lowercase(),
        token_refs,
        chain,
    })
}
