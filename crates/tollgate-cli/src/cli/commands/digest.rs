use anyhow::Result;
use serde::Serialize;
use tollgate_core::gate::approval::required_scope;

use super::common::{load_config, load_policy, policy_path, print_json, read_intent, report_error};
use crate::cli::args::DigestArgs;
use crate::exit_codes;

/// What approval and delegation tokens bind to.
#[derive(Debug, Serialize)]
struct Digests {
    tool_name: String,
    intent_digest: String,
    args_digest: String,
    policy_digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    script_hash: Option<String>,
    required_scope: Vec<String>,
}

pub fn cmd_digest(args: DigestArgs) -> i32 {
    let json = args.json;
    match run_digest(args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => report_error(&e, json),
    }
}

fn run_digest(args: DigestArgs) -> Result<()> {
    let config = load_config(None)?;
    let policy = load_policy(&policy_path(args.inputs.policy.as_deref(), &config)?)?;
    let intent = read_intent(&args.inputs.intent)?.normalize()?;

    let digests = Digests {
        tool_name: intent.tool_name.clone(),
        intent_digest: intent.digest()?,
        args_digest: intent.args_digest.clone().unwrap_or_default(),
        policy_digest: policy.digest()?,
        script_hash: intent.script_hash.clone(),
        required_scope: required_scope(&intent),
    };

    if args.json {
        return print_json(&digests);
    }
    println!("tool_name: {}", digests.tool_name);
    println!("intent_digest: {}", digests.intent_digest);
    println!("args_digest: {}", digests.args_digest);
    println!("policy_digest: {}", digests.policy_digest);
    if let Some(hash) = &digests.script_hash {
        println!("script_hash: {hash}");
    }
    println!("required_scope: {}", digests.required_scope.join(", "));
    Ok(())
}
