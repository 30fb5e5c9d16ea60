//! Key generation, token minting and trace verification through the binary.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;

const POLICY: &str = r#"
schema_id: tollgate.policy
schema_version: 1.0.0
default_verdict: require_approval
rules:
  - name: allow-reads
    effect: allow
    match:
      tool_names: [tool.read]
  - name: writes-need-approval
    effect: require_approval
    match:
      tool_names: [tool.write]
"#;

fn tollgate(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("tollgate").unwrap();
    cmd.current_dir(dir).env("RUST_LOG", "warn");
    cmd
}

fn setup() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("policy.yaml"), POLICY).unwrap();
    dir
}

fn write_json(path: &Path, value: &Value) -> PathBuf {
    std::fs::write(path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
    path.to_path_buf()
}

fn keygen(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
    tollgate(dir)
        .args(["keygen", "--out", "keys", "--name", name])
        .assert()
        .success()
        .stdout(predicate::str::contains("key_id: sha256:"));
    (
        dir.join("keys").join(format!("{name}.key.pem")),
        dir.join("keys").join(format!("{name}.pub.pem")),
    )
}

fn write_intent(dir: &Path) -> PathBuf {
    write_json(
        &dir.join("write.json"),
        &json!({
            "tool_name": "tool.write",
            "args": {"path": "/workspace/out.txt", "content": "hi"},
            "targets": [{"kind": "path", "value": "/workspace/out.txt", "operation": "write"}],
            "arg_provenance": [{"arg_path": "args.content", "source": "user"}],
            "context": {"identity": "agent-1", "workspace": "/workspace", "risk_class": "medium"}
        }),
    )
}

#[test]
fn keygen_writes_keypair_and_refuses_overwrite() {
    let tmp = setup();
    let (private, public) = keygen(tmp.path(), "approver");
    assert!(private.exists());
    assert!(public.exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&private).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    tollgate(tmp.path())
        .args(["keygen", "--out", "keys", "--name", "approver"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));
    tollgate(tmp.path())
        .args(["keygen", "--out", "keys", "--name", "approver", "--force"])
        .assert()
        .success();
}

#[test]
fn minted_approval_lifts_require_approval() {
    let tmp = setup();
    let dir = tmp.path();
    let (private, public) = keygen(dir, "approver");
    let intent = write_intent(dir);

    tollgate(dir)
        .args(["approve", "--policy", "policy.yaml", "--approver", "secops"])
        .args(["--reason-code", "ticket_42", "--ttl", "10m", "--out", "approval.json"])
        .arg("--intent")
        .arg(&intent)
        .arg("--signing-key")
        .arg(&private)
        .assert()
        .success();

    let token: Value =
        serde_json::from_slice(&std::fs::read(dir.join("approval.json")).unwrap()).unwrap();
    assert_eq!(token["schema_id"], "tollgate.approval_token");
    assert_eq!(token["scope"], json!(["tool:tool.write"]));

    let output = tollgate(dir)
        .args(["eval", "--policy", "policy.yaml", "--json"])
        .arg("--intent")
        .arg(&intent)
        .args(["--approval-token", "approval.json"])
        .arg("--approval-public-key")
        .arg(&public)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let body: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["verdict"], "allow");
    assert_eq!(body["valid_approvals"], 1);
    assert_eq!(body["approval_ref"], token["token_id"]);

    // A token from an untrusted key does not count, and the audit says why.
    let (_, stranger) = keygen(dir, "stranger");
    tollgate(dir)
        .args(["eval", "--policy", "policy.yaml"])
        .arg("--intent")
        .arg(&intent)
        .args(["--approval-token", "approval.json"])
        .arg("--approval-public-key")
        .arg(&stranger)
        .args(["--approval-audit-out", "audit/approval.json"])
        .args(["--delegation-audit-out", "audit/delegation.json"])
        .assert()
        .code(4);

    let audit: Value =
        serde_json::from_slice(&std::fs::read(dir.join("audit/approval.json")).unwrap()).unwrap();
    assert_eq!(audit["schema_id"], "tollgate.approval_audit_record");
    assert_eq!(audit["tool_name"], "tool.write");
    assert_eq!(audit["required_approvals"], 1);
    assert_eq!(audit["valid_approvals"], 0);
    assert_eq!(audit["approved"], false);
    assert_eq!(audit["entries"][0]["token_id"], token["token_id"]);
    assert_eq!(audit["entries"][0]["valid"], false);
    assert_eq!(audit["entries"][0]["error_code"], "approval_signature_invalid");
    // No delegation was involved, so no delegation audit is written.
    assert!(!dir.join("audit/delegation.json").exists());
}

#[test]
fn delegate_mints_unbound_token() {
    let tmp = setup();
    let dir = tmp.path();
    let (private, _) = keygen(dir, "lead");
    let output = tollgate(dir)
        .args(["delegate", "--delegator", "lead", "--delegate", "agent-1"])
        .args(["--scope", "tool:tool.write", "--ttl", "30m"])
        .arg("--signing-key")
        .arg(&private)
        .output()
        .unwrap();
    assert!(output.status.success());
    let token: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(token["schema_id"], "tollgate.delegation_token");
    assert_eq!(token["delegate_identity"], "agent-1");
    assert!(token["signature"]["sig"].is_string());
}

#[test]
fn delegation_audit_lists_presented_chain() {
    let tmp = setup();
    let dir = tmp.path();
    std::fs::write(
        dir.join("delegated.yaml"),
        r#"
default_verdict: block
rules:
  - name: delegated-write
    effect: allow
    match:
      tool_names: [tool.write]
      require_delegation: true
      allowed_delegator_identities: [lead]
"#,
    )
    .unwrap();
    let intent = write_json(
        &dir.join("delegated-write.json"),
        &json!({
            "tool_name": "tool.write",
            "args": {"path": "/workspace/out.txt"},
            "targets": [{"kind": "path", "value": "/workspace/out.txt", "operation": "write"}],
            "delegation": {
                "requester_identity": "agent-1",
                "chain": [{"delegator_identity": "lead", "delegate_identity": "agent-1"}]
            },
            "context": {"identity": "agent-1", "workspace": "/workspace", "risk_class": "low"}
        }),
    );
    let (private, public) = keygen(dir, "lead");
    tollgate(dir)
        .args(["delegate", "--delegator", "lead", "--delegate", "agent-1"])
        .args(["--scope", "tool:tool.write", "--out", "delegation.json"])
        .arg("--signing-key")
        .arg(&private)
        .assert()
        .success();

    let output = tollgate(dir)
        .args(["eval", "--policy", "delegated.yaml", "--json"])
        .arg("--intent")
        .arg(&intent)
        .args(["--delegation-token", "delegation.json"])
        .arg("--delegation-public-key")
        .arg(&public)
        .args(["--delegation-audit-out", "delegation-audit.json"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let body: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["verdict"], "allow");

    let audit: Value =
        serde_json::from_slice(&std::fs::read(dir.join("delegation-audit.json")).unwrap())
            .unwrap();
    assert_eq!(audit["schema_id"], "tollgate.delegation_audit_record");
    assert_eq!(audit["trace_id"], body["trace_id"]);
    assert_eq!(audit["delegation_required"], true);
    assert_eq!(audit["delegated"], true);
    assert_eq!(audit["valid_delegations"], 1);
    assert_eq!(audit["delegation_ref"], body["delegation_ref"]);
    assert_eq!(audit["entries"][0]["delegator_identity"], "lead");
    assert_eq!(audit["entries"][0]["valid"], true);
}

#[test]
fn approved_script_registry_enables_fast_path() {
    let tmp = setup();
    let dir = tmp.path();
    let (private, public) = keygen(dir, "registry");
    let script = write_json(
        &dir.join("script.json"),
        &json!({
            "tool_name": "script",
            "script": {"steps": [
                {"tool_name": "tool.read", "args": {"path": "/workspace/a"},
                 "targets": [{"kind": "path", "value": "/workspace/a", "operation": "read"}]},
                {"tool_name": "tool.write", "args": {"path": "/workspace/b"},
                 "targets": [{"kind": "path", "value": "/workspace/b", "operation": "write"}]}
            ]},
            "context": {"identity": "agent-1", "workspace": "/workspace", "risk_class": "low"}
        }),
    );

    tollgate(dir)
        .args(["eval", "--policy", "policy.yaml"])
        .arg("--intent")
        .arg(&script)
        .assert()
        .code(4);

    tollgate(dir)
        .args(["approve-script", "--policy", "policy.yaml", "--pattern-id", "read-then-write"])
        .args(["--approver", "secops", "--scope", "workspace:/workspace"])
        .args(["--registry", "registry.json"])
        .arg("--intent")
        .arg(&script)
        .arg("--signing-key")
        .arg(&private)
        .assert()
        .success();

    let output = tollgate(dir)
        .args(["eval", "--policy", "policy.yaml", "--json"])
        .args(["--approved-script-registry", "registry.json"])
        .arg("--registry-public-key")
        .arg(&public)
        .arg("--intent")
        .arg(&script)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    let body: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["pre_approved"], true);
    assert_eq!(body["pattern_id"], "read-then-write");
}

#[test]
fn approve_script_rejects_single_call_intent() {
    let tmp = setup();
    let dir = tmp.path();
    let (private, _) = keygen(dir, "registry");
    let intent = write_intent(dir);
    tollgate(dir)
        .args(["approve-script", "--policy", "policy.yaml", "--pattern-id", "p"])
        .args(["--approver", "secops", "--registry", "registry.json"])
        .arg("--intent")
        .arg(&intent)
        .arg("--signing-key")
        .arg(&private)
        .assert()
        .code(6)
        .stderr(predicate::str::contains("no script steps"));
    assert!(!dir.join("registry.json").exists());
}

#[test]
fn signed_trace_verifies_and_tampering_exits_two() {
    let tmp = setup();
    let dir = tmp.path();
    let (private, public) = keygen(dir, "gate");
    let intent = write_intent(dir);

    tollgate(dir)
        .args(["eval", "--policy", "policy.yaml", "--trace-out", "trace.json"])
        .args(["--correlation-id", "run-1"])
        .arg("--intent")
        .arg(&intent)
        .arg("--signing-key")
        .arg(&private)
        .assert()
        .code(4);

    tollgate(dir)
        .args(["trace", "verify", "trace.json", "--public-key"])
        .arg(&public)
        .assert()
        .success()
        .stdout(predicate::str::contains("verified:"));

    let mut trace: Value =
        serde_json::from_slice(&std::fs::read(dir.join("trace.json")).unwrap()).unwrap();
    assert_eq!(trace["correlation_id"], "run-1");
    trace["verdict"] = json!("allow");
    write_json(&dir.join("trace.json"), &trace);

    let output = tollgate(dir)
        .args(["trace", "verify", "trace.json", "--json", "--public-key"])
        .arg(&public)
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let body: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(body["ok"], false);
    assert_eq!(body["error_code"], "trace_signature_invalid");
    assert_eq!(body["error_category"], "verification_failed");
}
