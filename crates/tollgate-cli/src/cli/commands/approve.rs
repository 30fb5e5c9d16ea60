use anyhow::Result;
use chrono::Utc;
use tollgate_core::crypto::signing::load_private_key_pem;
use tollgate_core::gate::approval::{self, MintApproval};

use super::common::{emit, load_config, load_policy, parse_ttl, policy_path, read_intent, report_error};
use crate::cli::args::ApproveArgs;
use crate::exit_codes;

pub fn cmd_approve(args: ApproveArgs) -> i32 {
    match run_approve(args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => report_error(&e, false),
    }
}

fn run_approve(args: ApproveArgs) -> Result<()> {
    let config = load_config(None)?;
    let policy = load_policy(&policy_path(args.inputs.policy.as_deref(), &config)?)?;
    let intent = read_intent(&args.inputs.intent)?.normalize()?;
    let key = load_private_key_pem(&args.signing_key)?;

    let scope = if args.scope.is_empty() {
        approval::required_scope(&intent)
    } else {
        args.scope.clone()
    };

    let token = approval::mint(
        &MintApproval {
            approver_identity: args.approver.clone(),
            reason_code: args.reason_code.clone(),
            intent_digest: intent.digest()?,
            policy_digest: policy.digest()?,
            scope,
            max_targets: args.max_targets,
            max_ops: args.max_ops,
            ttl: parse_ttl(&args.ttl)?,
            now: Utc::now(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
        },
        &key,
    )?;
    tracing::info!(
        token_id = %token.token_id,
        approver = %token.approver_identity,
        expires_at = %token.expires_at,
        "approval token minted"
    );
    emit(&token, args.out.as_deref())
}
