//! Broker behaviour that depends on process environment variables.

use chrono::{DateTime, Utc};
use serial_test::serial;
use tollgate_core::broker::{
    self, BrokerKind, BrokerSettings, CredentialRequest, EnvBroker, COMMAND_ALLOWLIST_ENV,
};

fn request(reference: &str) -> CredentialRequest {
    CredentialRequest {
        tool_name: "tool.deploy".into(),
        identity: "agent-1".into(),
        workspace: "/w".into(),
        reference: reference.into(),
        ..CredentialRequest::default()
    }
}

#[test]
#[serial]
fn env_broker_reads_token_and_companions() {
    let key = "TOLLGATE_BROKER_TOKEN_DEPLOY_PROD";
    std::env::set_var(key, "s3cr3t");
    std::env::set_var(format!("{key}_ISSUED_AT"), "2026-03-01T12:00:00Z");
    std::env::set_var(format!("{key}_TTL_SECONDS"), "120");

    let response = broker::issue(&EnvBroker::default(), &request("deploy-prod")).unwrap();
    assert_eq!(response.issued_by, "env");
    assert!(response.credential_ref.starts_with("env:DEPLOY_PROD:"));
    assert_eq!(response.credential_ref.len(), "env:DEPLOY_PROD:".len() + 16);
    assert!(!response.credential_ref.contains("s3cr3t"));
    let issued: DateTime<Utc> = "2026-03-01T12:00:00Z".parse().unwrap();
    assert_eq!(response.issued_at, Some(issued));
    assert_eq!(response.ttl_seconds, Some(120));
    assert_eq!(
        response.expires_at,
        Some(issued + chrono::Duration::seconds(120))
    );

    std::env::remove_var(key);
    std::env::remove_var(format!("{key}_ISSUED_AT"));
    std::env::remove_var(format!("{key}_TTL_SECONDS"));
}

#[test]
#[serial]
fn env_broker_reports_missing_variable() {
    std::env::remove_var("TOLLGATE_BROKER_TOKEN_TOOL_DEPLOY");
    let err = broker::issue(&EnvBroker::default(), &request("")).unwrap_err();
    assert_eq!(err.code(), "credential_unavailable");
    assert!(err.to_string().contains("TOLLGATE_BROKER_TOKEN_TOOL_DEPLOY"));
}

#[test]
#[serial]
fn command_broker_requires_allowlist() {
    let settings = BrokerSettings {
        kind: BrokerKind::Command,
        command: Some("cat".into()),
        ..BrokerSettings::default()
    };

    std::env::remove_var(COMMAND_ALLOWLIST_ENV);
    let err = broker::resolve(&settings).unwrap_err();
    assert_eq!(err.code(), "credential_broker_config_invalid");

    std::env::set_var(COMMAND_ALLOWLIST_ENV, "jq, cat");
    let resolved = broker::resolve(&settings).unwrap().unwrap();
    assert_eq!(resolved.name(), "command");
    std::env::remove_var(COMMAND_ALLOWLIST_ENV);
}
