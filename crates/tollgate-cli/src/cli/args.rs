use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "tollgate",
    version,
    about = "Deterministic policy gate for agent tool calls"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Evaluate an intent against a policy and print the decision
    Eval(EvalArgs),
    /// Print the digests that tokens and registry entries bind to
    Digest(DigestArgs),
    /// Mint a signed approval token for an intent
    Approve(ApproveArgs),
    /// Mint a signed delegation token
    Delegate(DelegateArgs),
    /// Add a signed entry to the approved-script registry
    ApproveScript(ApproveScriptArgs),
    /// Generate an ed25519 keypair (PKCS#8 / SPKI PEM)
    Keygen(KeygenArgs),
    /// Signed trace operations
    Trace {
        #[command(subcommand)]
        cmd: TraceCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum TraceCommand {
    /// Verify the signature on a trace record
    Verify(TraceVerifyArgs),
}

/// Policy and intent inputs shared by most commands.
#[derive(Args, Debug, Clone)]
pub struct GateInputs {
    /// Policy file (YAML). Falls back to `gate.policy` in the project config
    #[arg(long, env = "TOLLGATE_POLICY")]
    pub policy: Option<PathBuf>,

    /// Intent file (JSON), or `-` for stdin
    #[arg(long)]
    pub intent: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct EvalArgs {
    #[command(flatten)]
    pub inputs: GateInputs,

    /// Project config (default: .tollgate/config.yaml when present)
    #[arg(long, env = "TOLLGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Evaluation profile: standard or strict
    #[arg(long, env = "TOLLGATE_PROFILE")]
    pub profile: Option<String>,

    /// Evaluate without enforcing; non-allow verdicts are reported as simulated
    #[arg(long)]
    pub simulate: bool,

    /// Approval token file (repeatable)
    #[arg(long = "approval-token")]
    pub approval_tokens: Vec<PathBuf>,

    /// Trusted approver public key (repeatable)
    #[arg(long = "approval-public-key")]
    pub approval_public_keys: Vec<PathBuf>,

    /// Delegation token file, delegator first (repeatable)
    #[arg(long = "delegation-token")]
    pub delegation_tokens: Vec<PathBuf>,

    /// Trusted delegator public key (repeatable)
    #[arg(long = "delegation-public-key")]
    pub delegation_public_keys: Vec<PathBuf>,

    /// Approved-script registry file
    #[arg(long, env = "TOLLGATE_APPROVED_SCRIPT_REGISTRY")]
    pub approved_script_registry: Option<PathBuf>,

    /// Trusted registry signer public key (repeatable)
    #[arg(long = "registry-public-key")]
    pub registry_public_keys: Vec<PathBuf>,

    /// Rate-limit state file
    #[arg(long, env = "TOLLGATE_RATE_LIMIT_STATE")]
    pub rate_limit_state: Option<PathBuf>,

    /// Credential broker: off, stub, env or command
    #[arg(long, env = "TOLLGATE_CREDENTIAL_BROKER")]
    pub broker: Option<String>,

    /// Environment prefix for the env broker
    #[arg(long, env = "TOLLGATE_BROKER_ENV_PREFIX")]
    pub broker_env_prefix: Option<String>,

    /// Executable for the command broker
    #[arg(long, env = "TOLLGATE_CREDENTIAL_COMMAND")]
    pub broker_command: Option<String>,

    /// Argument for the command broker (repeatable)
    #[arg(long = "broker-command-arg", allow_hyphen_values = true)]
    pub broker_command_args: Vec<String>,

    /// Command broker timeout, e.g. `5s`
    #[arg(long, env = "TOLLGATE_CREDENTIAL_COMMAND_TIMEOUT")]
    pub broker_timeout: Option<String>,

    /// Override the matched rule's broker reference
    #[arg(long)]
    pub credential_ref: Option<String>,

    /// Extra credential scope (repeatable)
    #[arg(long = "credential-scope")]
    pub credential_scopes: Vec<String>,

    /// Private key used to sign the trace
    #[arg(long, env = "TOLLGATE_SIGNING_KEY")]
    pub signing_key: Option<PathBuf>,

    /// Write the trace record here
    #[arg(long, env = "TOLLGATE_TRACE_OUT")]
    pub trace_out: Option<PathBuf>,

    /// Write the approval audit record here when approvals were checked
    #[arg(long, env = "TOLLGATE_APPROVAL_AUDIT_OUT")]
    pub approval_audit_out: Option<PathBuf>,

    /// Write the delegation audit record here when delegation was involved
    #[arg(long, env = "TOLLGATE_DELEGATION_AUDIT_OUT")]
    pub delegation_audit_out: Option<PathBuf>,

    /// Write the broker credential record here when a credential was issued
    #[arg(long, env = "TOLLGATE_CREDENTIAL_EVIDENCE_OUT")]
    pub credential_evidence_out: Option<PathBuf>,

    /// Correlation id recorded in the trace (default: random uuid)
    #[arg(long)]
    pub correlation_id: Option<String>,

    /// Trace timestamp (RFC 3339). Defaults to a fixed epoch for replayable traces
    #[arg(long)]
    pub created_at: Option<String>,

    /// Print the decision as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct DigestArgs {
    #[command(flatten)]
    pub inputs: GateInputs,

    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ApproveArgs {
    #[command(flatten)]
    pub inputs: GateInputs,

    /// Approver identity
    #[arg(long)]
    pub approver: String,

    /// Why the call was approved
    #[arg(long, default_value = "manual_review")]
    pub reason_code: String,

    /// Granted scope (repeatable). Defaults to what the intent requires
    #[arg(long = "scope")]
    pub scope: Vec<String>,

    /// Maximum targets covered, 0 for unbounded
    #[arg(long, default_value_t = 0)]
    pub max_targets: usize,

    /// Maximum operations covered, 0 for unbounded
    #[arg(long, default_value_t = 0)]
    pub max_ops: usize,

    /// Token lifetime, e.g. `15m`
    #[arg(long, default_value = "15m")]
    pub ttl: String,

    /// Approver private key
    #[arg(long, env = "TOLLGATE_APPROVAL_SIGNING_KEY")]
    pub signing_key: PathBuf,

    /// Output file (default: stdout)
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct DelegateArgs {
    #[arg(long)]
    pub delegator: String,

    #[arg(long)]
    pub delegate: String,

    /// Granted scope, e.g. `tool:repo.write` (repeatable)
    #[arg(long = "scope", required = true)]
    pub scope: Vec<String>,

    #[arg(long, default_value = "")]
    pub scope_class: String,

    /// Bind the token to this intent (requires --policy)
    #[arg(long, requires = "policy")]
    pub intent: Option<PathBuf>,

    #[arg(long, env = "TOLLGATE_POLICY")]
    pub policy: Option<PathBuf>,

    #[arg(long, default_value = "1h")]
    pub ttl: String,

    /// Delegator private key
    #[arg(long, env = "TOLLGATE_DELEGATION_SIGNING_KEY")]
    pub signing_key: PathBuf,

    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ApproveScriptArgs {
    #[command(flatten)]
    pub inputs: GateInputs,

    /// Stable name for the approved pattern
    #[arg(long)]
    pub pattern_id: String,

    #[arg(long)]
    pub approver: String,

    #[arg(long = "scope")]
    pub scope: Vec<String>,

    #[arg(long, default_value = "24h")]
    pub ttl: String,

    /// Registry signer private key
    #[arg(long, env = "TOLLGATE_REGISTRY_SIGNING_KEY")]
    pub signing_key: PathBuf,

    /// Registry file to update (created when missing)
    #[arg(long, env = "TOLLGATE_APPROVED_SCRIPT_REGISTRY")]
    pub registry: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct KeygenArgs {
    /// Output directory for keys
    #[arg(long, default_value = ".tollgate/keys")]
    pub out: PathBuf,

    /// File stem: writes `<name>.key.pem` and `<name>.pub.pem`
    #[arg(long, default_value = "tollgate")]
    pub name: String,

    /// Overwrite existing keys
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug, Clone)]
pub struct TraceVerifyArgs {
    /// Trace record (JSON)
    pub trace: PathBuf,

    /// Trusted public key (repeatable)
    #[arg(long = "public-key", required = true)]
    pub public_keys: Vec<PathBuf>,

    #[arg(long)]
    pub json: bool,
}
