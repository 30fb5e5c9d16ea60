use anyhow::Result;
use chrono::Utc;
use tollgate_core::crypto::signing::load_private_key_pem;
use tollgate_core::gate::delegation::{self, MintDelegation};

use super::common::{emit, load_policy, parse_ttl, read_intent, report_error};
use crate::cli::args::DelegateArgs;
use crate::exit_codes;

pub fn cmd_delegate(args: DelegateArgs) -> i32 {
    match run_delegate(args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => report_error(&e, false),
    }
}

fn run_delegate(args: DelegateArgs) -> Result<()> {
    let key = load_private_key_pem(&args.signing_key)?;

    // Unbound tokens cover any intent in scope; binding pins both digests.
    let (intent_digest, policy_digest) = match (&args.intent, &args.policy) {
        (Some(intent), Some(policy)) => {
            let intent = read_intent(intent)?.normalize()?;
            let policy = load_policy(policy)?;
            (Some(intent.digest()?), Some(policy.digest()?))
        }
        (None, Some(policy)) => (None, Some(load_policy(policy)?.digest()?)),
        _ => (None, None),
    };

    let token = delegation::mint(
        &MintDelegation {
            delegator_identity: args.delegator.clone(),
            delegate_identity: args.delegate.clone(),
            scope: args.scope.clone(),
            scope_class: args.scope_class.clone(),
            intent_digest,
            policy_digest,
            ttl: parse_ttl(&args.ttl)?,
            now: Utc::now(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
        },
        &key,
    )?;
    tracing::info!(
        token_id = %token.token_id,
        delegator = %token.delegator_identity,
        delegate = %token.delegate_identity,
        "delegation token minted"
    );
    emit(&token, args.out.as_deref())
}
