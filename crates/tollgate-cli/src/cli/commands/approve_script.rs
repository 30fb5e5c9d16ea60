use anyhow::Result;
use chrono::Utc;
use tollgate_core::crypto::signing::load_private_key_pem;
use tollgate_core::gate::registry::{self, MintApprovedScript, Registry};
use tollgate_core::GateError;

use super::common::{load_config, load_policy, parse_ttl, policy_path, read_intent, report_error};
use crate::cli::args::ApproveScriptArgs;
use crate::exit_codes;

pub fn cmd_approve_script(args: ApproveScriptArgs) -> i32 {
    match run_approve_script(args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => report_error(&e, false),
    }
}

fn run_approve_script(args: ApproveScriptArgs) -> Result<()> {
    let config = load_config(None)?;
    let policy = load_policy(&policy_path(args.inputs.policy.as_deref(), &config)?)?;
    let script = read_intent(&args.inputs.intent)?.normalize()?;
    if !script.is_script() {
        return Err(GateError::InvalidInput("intent has no script steps".into()).into());
    }
    let key = load_private_key_pem(&args.signing_key)?;

    let entry = registry::mint(
        &MintApprovedScript {
            pattern_id: args.pattern_id.clone(),
            policy_digest: policy.digest()?,
            script,
            approver_identity: args.approver.clone(),
            scope: args.scope.clone(),
            ttl: parse_ttl(&args.ttl)?,
            now: Utc::now(),
        },
        &key,
    )?;

    let mut registry = Registry::load(&args.registry)?;
    let pattern_id = entry.pattern_id.clone();
    let script_hash = entry.script_hash.clone();
    registry.upsert(entry)?;
    registry.write(&args.registry)?;

    tracing::info!(
        pattern_id = %pattern_id,
        script_hash = %script_hash,
        entries = registry.entries().len(),
        "approved script recorded"
    );
    eprintln!("Recorded {pattern_id} in {}", args.registry.display());
    Ok(())
}
