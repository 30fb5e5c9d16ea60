use anyhow::Result;
use serde_json::json;
use tollgate_core::crypto::signing::load_trusted_keys;
use tollgate_core::gate::trace::TraceRecord;
use tollgate_core::GateError;

use super::common::report_error;
use crate::cli::args::TraceVerifyArgs;
use crate::exit_codes;

pub fn cmd_trace_verify(args: TraceVerifyArgs) -> i32 {
    let json = args.json;
    match run_trace_verify(args) {
        Ok(()) => exit_codes::SUCCESS,
        Err(e) => report_error(&e, json),
    }
}

fn run_trace_verify(args: TraceVerifyArgs) -> Result<()> {
    let keys = load_trusted_keys(args.public_keys.as_slice())?;
    let record = TraceRecord::read(&args.trace)?;

    record
        .verify_trusted(&keys)
        .map_err(|e| GateError::Verification {
            code: "trace_signature_invalid",
            message: format!("{}: {e}", args.trace.display()),
        })?;

    let key_id = record
        .signature
        .as_ref()
        .map(|s| s.key_id.clone())
        .unwrap_or_default();
    tracing::debug!(trace_id = %record.trace_id, key_id = %key_id, "trace verified");

    if args.json {
        println!(
            "{}",
            json!({
                "ok": true,
                "trace_id": record.trace_id,
                "verdict": record.verdict,
                "key_id": key_id,
            })
        );
    } else {
        println!("verified: {} ({})", record.trace_id, record.verdict);
        println!("key_id: {key_id}");
    }
    Ok(())
}
