//! Credential brokers.
//!
//! A broker turns an allowed tool call into a short-lived credential
//! reference. The gate only ever records the reference, never the secret.

mod command;
mod env;
mod stub;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command::{CommandBroker, COMMAND_ALLOWLIST_ENV, DEFAULT_COMMAND_TIMEOUT, MAX_OUTPUT_BYTES};
pub use env::{EnvBroker, DEFAULT_ENV_PREFIX};
pub use stub::StubBroker;

/// Longest credential reference a broker may return.
pub const MAX_CREDENTIAL_REF_LEN: usize = 256;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("invalid credential request: {0}")]
    InvalidRequest(String),

    #[error("invalid credential response from {broker}: {reason}")]
    InvalidResponse { broker: String, reason: String },

    #[error("credential command {command} exited with {status}")]
    CommandFailed { command: String, status: String },

    #[error("credential command {command} timed out after {timeout:?}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error("credential command {command} output exceeded {limit} bytes")]
    OutputTooLarge { command: String, limit: usize },

    #[error("credential broker configuration: {0}")]
    Config(String),
}

impl BrokerError {
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::CredentialUnavailable(_) => "credential_unavailable",
            BrokerError::InvalidRequest(_) => "credential_request_invalid",
            BrokerError::InvalidResponse { .. } => "credential_response_invalid",
            BrokerError::CommandFailed { .. } => "credential_command_failed",
            BrokerError::CommandTimeout { .. } => "credential_command_timeout",
            BrokerError::OutputTooLarge { .. } => "credential_command_output_too_large",
            BrokerError::Config(_) => "credential_broker_config_invalid",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialRequest {
    pub tool_name: String,
    pub identity: String,
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub scope: Vec<String>,
}

impl CredentialRequest {
    fn normalized(&self) -> Result<CredentialRequest, BrokerError> {
        let tool_name = self.tool_name.trim().to_lowercase();
        if tool_name.is_empty() {
            return Err(BrokerError::InvalidRequest("tool_name is required".into()));
        }
        let identity = self.identity.trim().to_string();
        if identity.is_empty() {
            return Err(BrokerError::InvalidRequest("identity is required".into()));
        }
        let mut scope: Vec<String> = Vec::new();
        for s in &self.scope {
            let s = s.trim().to_lowercase();
            if !s.is_empty() && !scope.contains(&s) {
                scope.push(s);
            }
        }
        Ok(CredentialRequest {
            tool_name,
            identity,
            workspace: self.workspace.trim().to_string(),
            session_id: self.session_id.trim().to_string(),
            request_id: self.request_id.trim().to_string(),
            reference: self.reference.trim().to_string(),
            scope,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredentialResponse {
    #[serde(default)]
    pub issued_by: String,
    pub credential_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

pub trait CredentialBroker: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn issue(&self, request: &CredentialRequest) -> Result<CredentialResponse, BrokerError>;
}

/// Normalize the request, call the broker and normalize its answer.
pub fn issue(
    broker: &dyn CredentialBroker,
    request: &CredentialRequest,
) -> Result<CredentialResponse, BrokerError> {
    let request = request.normalized()?;
    let mut response = broker.issue(&request)?;

    response.issued_by = response.issued_by.trim().to_string();
    if response.issued_by.is_empty() {
        response.issued_by = broker.name().to_string();
    }
    response.credential_ref = response.credential_ref.trim().to_string();
    if response.credential_ref.is_empty() {
        return Err(BrokerError::InvalidResponse {
            broker: broker.name().to_string(),
            reason: "empty credential reference".into(),
        });
    }
    if let (Some(issued), Some(expires), None) =
        (response.issued_at, response.expires_at, response.ttl_seconds)
    {
        if expires > issued {
            response.ttl_seconds = u64::try_from((expires - issued).num_seconds()).ok();
        }
    }
    if let (Some(issued), None, Some(ttl)) =
        (response.issued_at, response.expires_at, response.ttl_seconds)
    {
        response.expires_at = i64::try_from(ttl)
            .ok()
            .and_then(chrono::TimeDelta::try_seconds)
            .and_then(|ttl| issued.checked_add_signed(ttl));
    }
    tracing::debug!(broker = broker.name(), issued_by = %response.issued_by, "credential issued");
    Ok(response)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Off,
    Stub,
    Env,
    Command,
}

impl FromStr for BrokerKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "off" | "none" => Ok(BrokerKind::Off),
            "stub" => Ok(BrokerKind::Stub),
            "env" => Ok(BrokerKind::Env),
            "command" => Ok(BrokerKind::Command),
            other => Err(BrokerError::Config(format!("unsupported credential broker: {other}"))),
        }
    }
}

/// How to build a broker from configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerSettings {
    pub kind: BrokerKind,
    pub env_prefix: Option<String>,
    pub command: Option<String>,
    pub command_args: Vec<String>,
    pub command_timeout: Option<Duration>,
}

/// Build the configured broker. `Off` yields `None`.
pub fn resolve(settings: &BrokerSettings) -> Result<Option<Box<dyn CredentialBroker>>, BrokerError> {
    let broker: Box<dyn CredentialBroker> = match settings.kind {
        BrokerKind::Off => return Ok(None),
        BrokerKind::Stub => Box::new(StubBroker),
        BrokerKind::Env => Box::new(EnvBroker::new(settings.env_prefix.as_deref())),
        BrokerKind::Command => {
            let command = settings
                .command
                .as_deref()
                .ok_or_else(|| BrokerError::Config("command broker requires a command".into()))?;
            let allowlist = std::env::var(COMMAND_ALLOWLIST_ENV).unwrap_or_default();
            let mut broker = CommandBroker::new(command, settings.command_args.clone(), &allowlist)?;
            if let Some(timeout) = settings.command_timeout {
                broker = broker.with_timeout(timeout);
            }
            Box::new(broker)
        }
    };
    Ok(Some(broker))
}
