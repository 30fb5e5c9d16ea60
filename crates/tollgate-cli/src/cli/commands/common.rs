//! Input loading and error reporting shared by the commands.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tollgate_core::config::ProjectConfig;
use tollgate_core::{ErrorCategory, GateError, IntentRequest, Policy};

use crate::exit_codes;

/// Project config named on the command line, else the default location
/// under the working directory.
pub fn load_config(explicit: Option<&Path>) -> Result<ProjectConfig> {
    let config = match explicit {
        Some(path) => ProjectConfig::load(path)?,
        None => {
            let cwd = std::env::current_dir().context("failed to resolve working directory")?;
            ProjectConfig::load_default(&cwd)?
        }
    };
    Ok(config)
}

pub fn policy_path(flag: Option<&Path>, config: &ProjectConfig) -> Result<PathBuf> {
    flag.map(Path::to_path_buf)
        .or_else(|| config.gate.policy.clone())
        .ok_or_else(|| {
            GateError::InvalidInput("a policy is required (--policy or gate.policy)".into()).into()
        })
}

pub fn load_policy(path: &Path) -> Result<Policy> {
    Ok(Policy::load(path)?)
}

/// Read a raw intent from a file, or from stdin for `-`.
pub fn read_intent(path: &Path) -> Result<IntentRequest> {
    let raw = if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("failed to read intent from stdin")?;
        buf
    } else {
        std::fs::read(path).with_context(|| format!("failed to read intent: {}", path.display()))?
    };
    Ok(IntentRequest::from_json_slice(&raw)?)
}

/// Parse a humantime duration such as `15m` or `2h 30m`.
pub fn parse_ttl(raw: &str) -> Result<chrono::Duration> {
    let std = humantime::parse_duration(raw.trim())
        .map_err(|e| GateError::InvalidInput(format!("invalid duration {raw:?}: {e}")))?;
    let ttl = chrono::Duration::from_std(std)
        .map_err(|_| GateError::InvalidInput(format!("duration out of range: {raw}")))?;
    Ok(ttl)
}

/// Command-line list if given, else the configured one.
pub fn prefer<'a>(flag: &'a [PathBuf], configured: &'a [PathBuf]) -> &'a [PathBuf] {
    if flag.is_empty() {
        configured
    } else {
        flag
    }
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Write a minted artifact to `out`, or print it.
pub fn emit<T: Serialize>(value: &T, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => {
            tollgate_core::files::write_json_atomic(path, value)?;
            eprintln!("Wrote {}", path.display());
            Ok(())
        }
        None => print_json(value),
    }
}

/// Report a failed command and return its exit code.
///
/// Gate errors keep their code and category; anything else counts as
/// invalid input (unreadable files, bad keys).
pub fn report_error(err: &anyhow::Error, json: bool) -> i32 {
    let (code, category, exit) = match err.chain().find_map(|e| e.downcast_ref::<GateError>()) {
        Some(gate) => (gate.code(), gate.category(), gate.exit_code()),
        None => (
            "input_invalid",
            ErrorCategory::InvalidInput,
            exit_codes::INVALID_INPUT,
        ),
    };
    if json {
        let body = json!({
            "ok": false,
            "error": format!("{err:#}"),
            "error_code": code,
            "error_category": category,
        });
        println!("{body}");
    } else {
        eprintln!("error: {err:#}");
    }
    exit
}
