use crate::crypto::jcs;

use super::{BrokerError, CredentialBroker, CredentialRequest, CredentialResponse};

const STUB_TTL_SECONDS: u64 = 300;

/// Deterministic broker for tests and demos. The reference is a digest of
/// the request, so identical requests get identical references.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubBroker;

impl CredentialBroker for StubBroker {
    fn name(&self) -> &str {
        "stub"
    }

    fn issue(&self, request: &CredentialRequest) -> Result<CredentialResponse, BrokerError> {
        let scope = request.scope.join(",");
        let raw = [
            request.tool_name.as_str(),
            request.identity.as_str(),
            request.workspace.as_str(),
            request.session_id.as_str(),
            request.request_id.as_str(),
            request.reference.as_str(),
            scope.as_str(),
        ]
        .join("|");
        let digest = jcs::sha256(raw.as_bytes());
        Ok(CredentialResponse {
            issued_by: "stub".into(),
            credential_ref: format!("stub:{}", hex::encode(&digest[..12])),
            ttl_seconds: Some(STUB_TTL_SECONDS),
            ..CredentialResponse::default()
        })
    }
}
