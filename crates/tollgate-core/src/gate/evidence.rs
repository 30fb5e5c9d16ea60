//! Audit records emitted next to the trace.
//!
//! Each record is a standalone JSON document tied to its decision by
//! `trace_id`. Approval and delegation audits list every presented token,
//! valid or not, with the code that rejected it. The credential record keeps
//! only the broker's reference, never secret material.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::GateError;
use crate::files;
use crate::gate::helpers::{lower_sorted, producer_version};

pub const APPROVAL_AUDIT_SCHEMA_ID: &str = "tollgate.approval_audit_record";
pub const DELEGATION_AUDIT_SCHEMA_ID: &str = "tollgate.delegation_audit_record";
pub const BROKER_CREDENTIAL_SCHEMA_ID: &str = "tollgate.broker_credential_record";
pub const EVIDENCE_SCHEMA_VERSION: &str = "1.0.0";

/// Fields shared by every record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    pub created_at: DateTime<Utc>,
    pub producer_version: String,
    pub trace_id: String,
    pub tool_name: String,
}

impl RecordHeader {
    pub fn new(created_at: DateTime<Utc>, version: &str, trace_id: &str, tool_name: &str) -> Self {
        RecordHeader {
            created_at,
            producer_version: producer_version(version),
            trace_id: trace_id.trim().to_string(),
            tool_name: tool_name.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalAuditEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub approver_identity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason_code: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    pub expires_at: DateTime<Utc>,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalAuditRecord {
    pub schema_id: String,
    pub schema_version: String,
    #[serde(flatten)]
    pub header: RecordHeader,
    pub intent_digest: String,
    pub policy_digest: String,
    pub required_approvals: u32,
    /// Distinct approvers among valid entries.
    pub valid_approvals: u32,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub approvers: Vec<String>,
    pub entries: Vec<ApprovalAuditEntry>,
}

impl ApprovalAuditRecord {
    pub fn build(
        header: RecordHeader,
        intent_digest: &str,
        policy_digest: &str,
        required_approvals: u32,
        entries: &[ApprovalAuditEntry],
    ) -> Self {
        let mut entries: Vec<ApprovalAuditEntry> = entries
            .iter()
            .map(|e| ApprovalAuditEntry {
                token_id: e.token_id.trim().to_string(),
                approver_identity: e.approver_identity.trim().to_string(),
                reason_code: e.reason_code.trim().to_string(),
                scope: lower_sorted(&e.scope),
                error_code: e.error_code.trim().to_string(),
                ..e.clone()
            })
            .collect();
        entries.sort_by(|a, b| {
            (&a.token_id, &a.approver_identity, &a.reason_code, a.expires_at, &a.scope).cmp(&(
                &b.token_id,
                &b.approver_identity,
                &b.reason_code,
                b.expires_at,
                &b.scope,
            ))
        });

        let mut approvers: Vec<String> = entries
            .iter()
            .filter(|e| e.valid && !e.approver_identity.is_empty())
            .map(|e| e.approver_identity.clone())
            .collect();
        approvers.sort();
        approvers.dedup();
        let valid_approvals = approvers.len() as u32;

        ApprovalAuditRecord {
            schema_id: APPROVAL_AUDIT_SCHEMA_ID.to_string(),
            schema_version: EVIDENCE_SCHEMA_VERSION.to_string(),
            header,
            intent_digest: intent_digest.trim().to_lowercase(),
            policy_digest: policy_digest.trim().to_lowercase(),
            required_approvals,
            valid_approvals,
            approved: required_approvals > 0 && valid_approvals >= required_approvals,
            approvers,
            entries,
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), GateError> {
        files::write_json_atomic(path, self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationAuditEntry {
    /// Position in the presented chain, delegator first.
    pub index: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_id: String,
    pub delegator_identity: String,
    pub delegate_identity: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope_class: String,
    pub expires_at: DateTime<Utc>,
    pub valid: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationAuditRecord {
    pub schema_id: String,
    pub schema_version: String,
    #[serde(flatten)]
    pub header: RecordHeader,
    pub intent_digest: String,
    pub policy_digest: String,
    pub delegation_required: bool,
    pub valid_delegations: usize,
    /// True only when the whole chain verified.
    pub delegated: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub delegation_ref: String,
    /// Chain-level failures such as a broken or mismatched chain.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reason_codes: Vec<String>,
    pub entries: Vec<DelegationAuditEntry>,
}

impl DelegationAuditRecord {
    /// Entries keep chain order, which is what continuity was checked on.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        header: RecordHeader,
        intent_digest: &str,
        policy_digest: &str,
        delegation_required: bool,
        delegated: bool,
        delegation_ref: Option<&str>,
        reason_codes: &[String],
        entries: &[DelegationAuditEntry],
    ) -> Self {
        let mut entries = entries.to_vec();
        entries.sort_by_key(|e| e.index);
        DelegationAuditRecord {
            schema_id: DELEGATION_AUDIT_SCHEMA_ID.to_string(),
            schema_version: EVIDENCE_SCHEMA_VERSION.to_string(),
            header,
            intent_digest: intent_digest.trim().to_lowercase(),
            policy_digest: policy_digest.trim().to_lowercase(),
            delegation_required,
            valid_delegations: entries.iter().filter(|e| e.valid).count(),
            delegated,
            delegation_ref: delegation_ref.unwrap_or_default().trim().to_string(),
            reason_codes: reason_codes.to_vec(),
            entries,
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), GateError> {
        files::write_json_atomic(path, self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerCredentialRecord {
    pub schema_id: String,
    pub schema_version: String,
    #[serde(flatten)]
    pub header: RecordHeader,
    pub identity: String,
    pub broker: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    pub credential_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
}

impl BrokerCredentialRecord {
    pub fn build(
        header: RecordHeader,
        request: &crate::broker::CredentialRequest,
        response: &crate::broker::CredentialResponse,
    ) -> Self {
        BrokerCredentialRecord {
            schema_id: BROKER_CREDENTIAL_SCHEMA_ID.to_string(),
            schema_version: EVIDENCE_SCHEMA_VERSION.to_string(),
            header,
            identity: request.identity.trim().to_string(),
            broker: response.issued_by.trim().to_string(),
            reference: request.reference.trim().to_string(),
            scope: lower_sorted(&request.scope),
            credential_ref: response.credential_ref.trim().to_string(),
            issued_at: response.issued_at,
            expires_at: response.expires_at,
            ttl_seconds: response.ttl_seconds,
        }
    }

    pub fn write(&self, path: &Path) -> Result<(), GateError> {
        files::write_json_atomic(path, self)
    }
}

/// Records produced by one evaluation. Absent when not applicable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateEvidence {
    /// Present when the verdict reached approval verification.
    pub approval_audit: Option<ApprovalAuditRecord>,
    /// Present when delegation was required or tokens were presented.
    pub delegation_audit: Option<DelegationAuditRecord>,
    /// Present when a credential was issued.
    pub credential: Option<BrokerCredentialRecord>,
}
