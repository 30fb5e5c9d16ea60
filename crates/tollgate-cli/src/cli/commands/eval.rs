use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tollgate_core::broker::{self, BrokerKind, BrokerSettings};
use tollgate_core::config::ProjectConfig;
use tollgate_core::crypto::signing::{load_private_key_pem, load_trusted_keys};
use tollgate_core::gate::approval::ApprovalToken;
use tollgate_core::gate::delegation::DelegationToken;
use tollgate_core::gate::rate_limit::RateLimitStore;
use tollgate_core::gate::registry::Registry;
use tollgate_core::gate::trace::write_trace;
use tollgate_core::gate::GateEvidence;
use tollgate_core::{evaluate, EvaluateOptions, GateError, GateOutput, Profile};

use super::common::{
    load_config, load_policy, policy_path, prefer, print_json, read_intent, report_error,
};
use crate::cli::args::EvalArgs;

pub const DEFAULT_RATE_LIMIT_STATE: &str = ".tollgate/rate_limit_state.json";

pub fn cmd_eval(args: EvalArgs) -> i32 {
    let json = args.json;
    match run_eval(args) {
        Ok(code) => code,
        Err(e) => report_error(&e, json),
    }
}

fn run_eval(args: EvalArgs) -> Result<i32> {
    let config = load_config(args.config.as_deref())?;
    let policy = load_policy(&policy_path(args.inputs.policy.as_deref(), &config)?)?;
    let intent = read_intent(&args.inputs.intent)?;
    let opts = build_options(&args, &config)?;

    let outcome = evaluate(&policy, &intent, &opts)?;

    if let Some(path) = args.trace_out.clone().or_else(|| config.gate.trace_out.clone()) {
        write_trace(&path, &outcome.trace)
            .with_context(|| format!("failed to write trace: {}", path.display()))?;
    }

    write_evidence(&args, &outcome.evidence)?;

    if args.json {
        print_json(&outcome.output)?;
    } else {
        print_summary(&outcome.output);
    }
    Ok(outcome.exit_code())
}

/// Write each requested record that the evaluation produced.
fn write_evidence(args: &EvalArgs, evidence: &GateEvidence) -> Result<()> {
    if let (Some(path), Some(record)) = (&args.approval_audit_out, &evidence.approval_audit) {
        record
            .write(path)
            .with_context(|| format!("failed to write approval audit: {}", path.display()))?;
    }
    if let (Some(path), Some(record)) = (&args.delegation_audit_out, &evidence.delegation_audit) {
        record
            .write(path)
            .with_context(|| format!("failed to write delegation audit: {}", path.display()))?;
    }
    if let (Some(path), Some(record)) = (&args.credential_evidence_out, &evidence.credential) {
        record
            .write(path)
            .with_context(|| format!("failed to write credential evidence: {}", path.display()))?;
    }
    Ok(())
}

fn build_options(args: &EvalArgs, config: &ProjectConfig) -> Result<EvaluateOptions> {
    let g = &config.gate;

    let profile = match args.profile.as_deref() {
        Some(raw) => raw.parse::<Profile>()?,
        None => g.profile.unwrap_or_default(),
    };

    let approval_tokens = args
        .approval_tokens
        .iter()
        .map(|p| ApprovalToken::read(p))
        .collect::<Result<Vec<_>, GateError>>()?;
    let delegation_tokens = args
        .delegation_tokens
        .iter()
        .map(|p| DelegationToken::read(p))
        .collect::<Result<Vec<_>, GateError>>()?;

    let registry = match args
        .approved_script_registry
        .as_ref()
        .or(g.approved_script_registry.as_ref())
    {
        Some(path) => Some(Registry::load(path)?),
        None => None,
    };

    let state_path = args
        .rate_limit_state
        .clone()
        .or_else(|| g.rate_limit_state.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RATE_LIMIT_STATE));

    let signing_key = match args.signing_key.as_ref().or(g.signing_key.as_ref()) {
        Some(path) => Some(load_private_key_pem(path)?),
        None => None,
    };

    let created_at = match args.created_at.as_deref() {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw.trim())
                .map_err(|e| GateError::InvalidInput(format!("--created-at: {e}")))?
                .with_timezone(&Utc),
        ),
        None => None,
    };

    let correlation_id = args
        .correlation_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    Ok(EvaluateOptions {
        now: Utc::now(),
        created_at,
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        profile,
        simulate: args.simulate,
        approval_tokens,
        approval_keys: load_trusted_keys(prefer(&args.approval_public_keys, &g.approval_public_keys))?,
        delegation_tokens,
        delegation_keys: load_trusted_keys(prefer(
            &args.delegation_public_keys,
            &g.delegation_public_keys,
        ))?,
        registry,
        registry_keys: load_trusted_keys(prefer(&args.registry_public_keys, &g.registry_public_keys))?,
        rate_limit_store: Some(RateLimitStore::new(state_path)),
        broker: build_broker(args, config)?,
        credential_reference: args.credential_ref.clone(),
        credential_scopes: args.credential_scopes.clone(),
        signing_key,
        correlation_id: Some(correlation_id),
        latency_ms: None,
    })
}

fn build_broker(
    args: &EvalArgs,
    config: &ProjectConfig,
) -> Result<Option<Box<dyn broker::CredentialBroker>>> {
    let g = &config.gate;
    let config_err = |e: broker::BrokerError| GateError::InvalidInput(e.to_string());

    let kind = match args.broker.as_deref() {
        Some(raw) => raw.parse::<BrokerKind>().map_err(config_err)?,
        None => g.broker.unwrap_or_default(),
    };
    let timeout = match args.broker_timeout.as_deref().or(g.broker_timeout.as_deref()) {
        Some(raw) => Some(humantime::parse_duration(raw.trim()).map_err(|e| {
            GateError::InvalidInput(format!("invalid broker timeout {raw:?}: {e}"))
        })?),
        None => None,
    };
    let command_args = if args.broker_command_args.is_empty() {
        g.broker_command_args.clone()
    } else {
        args.broker_command_args.clone()
    };

    let settings = BrokerSettings {
        kind,
        env_prefix: args.broker_env_prefix.clone().or_else(|| g.broker_env_prefix.clone()),
        command: args.broker_command.clone().or_else(|| g.broker_command.clone()),
        command_args,
        command_timeout: timeout,
    };
    let broker = broker::resolve(&settings).map_err(config_err)?;
    Ok(broker)
}

fn print_summary(output: &GateOutput) {
    println!("verdict: {}", output.verdict);
    if !output.matched_rule.is_empty() {
        println!("matched_rule: {}", output.matched_rule);
    }
    if !output.reason_codes.is_empty() {
        println!("reason_codes: {}", output.reason_codes.join(", "));
    }
    if !output.violations.is_empty() {
        println!("violations: {}", output.violations.join(", "));
    }
    if output.required_approvals > 0 {
        println!(
            "approvals: {}/{}",
            output.valid_approvals, output.required_approvals
        );
    }
    if let Some(simulated) = output.simulated_verdict {
        println!("simulated_verdict: {simulated}");
    }
    if let Some(credential) = &output.credential_ref {
        println!("credential_ref: {credential}");
    }
    println!("trace_id: {}", output.trace_id);
}
