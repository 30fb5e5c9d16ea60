//! Signed delegation tokens and chain verification.
//!
//! A chain is an ordered list of tokens, each one handing authority from a
//! delegator to a delegate. The chain is valid only if every link verifies,
//! consecutive links connect, and the last delegate is the requester.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::crypto::jcs;
use crate::crypto::signing::{self, DetachedSignature, TrustedKeys};
use crate::errors::GateError;
use crate::files;
use crate::gate::approval::scope_covers;
use crate::gate::evidence::DelegationAuditEntry;
use crate::gate::helpers::{lower_sorted, optional_digest, producer_version};
use crate::gate::intent::DelegationLink;
use crate::gate::verdict::{reason_codes, CodeSet};

pub const DELEGATION_TOKEN_SCHEMA_ID: &str = "tollgate.delegation_token";
pub const DELEGATION_TOKEN_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationToken {
    pub schema_id: String,
    pub schema_version: String,
    pub created_at: DateTime<Utc>,
    pub producer_version: String,
    pub token_id: String,
    pub delegator_identity: String,
    pub delegate_identity: String,
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scope_class: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub intent_digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub policy_digest: String,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<DetachedSignature>,
}

impl DelegationToken {
    pub fn read(path: &Path) -> Result<Self, GateError> {
        files::read_json(path)
    }

    pub fn write(&self, path: &Path) -> Result<(), GateError> {
        files::write_json_atomic(path, self)
    }

    fn unsigned(&self) -> DelegationToken {
        DelegationToken {
            signature: None,
            ..self.clone()
        }
    }
}

/// Inputs for minting a delegation token.
#[derive(Debug, Clone)]
pub struct MintDelegation {
    pub delegator_identity: String,
    pub delegate_identity: String,
    pub scope: Vec<String>,
    pub scope_class: String,
    pub intent_digest: Option<String>,
    pub policy_digest: Option<String>,
    pub ttl: Duration,
    pub now: DateTime<Utc>,
    pub producer_version: String,
}

pub fn mint(opts: &MintDelegation, key: &SigningKey) -> Result<DelegationToken, GateError> {
    let invalid = |m: &str| GateError::InvalidInput(m.to_string());
    if opts.ttl <= Duration::zero() {
        return Err(invalid("ttl must be greater than 0"));
    }
    let delegator = opts.delegator_identity.trim().to_string();
    let delegate = opts.delegate_identity.trim().to_string();
    if delegator.is_empty() || delegate.is_empty() {
        return Err(invalid("delegator and delegate identities are required"));
    }
    let scope = lower_sorted(&opts.scope);
    if scope.is_empty() {
        return Err(invalid("scope must include at least one value"));
    }
    let intent_digest = optional_digest(opts.intent_digest.as_deref(), "intent_digest")?;
    let policy_digest = optional_digest(opts.policy_digest.as_deref(), "policy_digest")?;
    let scope_class = opts.scope_class.trim().to_lowercase();
    let expires_at = opts.now + opts.ttl;

    let token_id = jcs::short_id(&[
        &delegator,
        &delegate,
        &scope.join(","),
        &scope_class,
        &intent_digest,
        &policy_digest,
        &expires_at.to_rfc3339(),
    ]);
    let mut token = DelegationToken {
        schema_id: DELEGATION_TOKEN_SCHEMA_ID.to_string(),
        schema_version: DELEGATION_TOKEN_SCHEMA_VERSION.to_string(),
        created_at: opts.now,
        producer_version: producer_version(&opts.producer_version),
        token_id,
        delegator_identity: delegator,
        delegate_identity: delegate,
        scope,
        scope_class,
        intent_digest,
        policy_digest,
        expires_at,
        signature: None,
    };
    token.signature = Some(signing::sign_value(&token, key)?);
    Ok(token)
}

/// What the chain is checked against.
#[derive(Debug, Clone)]
pub struct ChainContext<'a> {
    pub tool_name: &'a str,
    pub intent_digest: &'a str,
    pub policy_digest: &'a str,
    /// Identity the last delegate must equal.
    pub requester_identity: &'a str,
    /// Links claimed by the intent. When non-empty the signed chain must
    /// carry the same identities, link for link.
    pub claim: &'a [DelegationLink],
    pub now: DateTime<Utc>,
}

/// Outcome of walking a delegation chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DelegationStatus {
    pub verified: bool,
    pub depth: usize,
    pub valid_links: usize,
    /// Failure codes. Empty when `verified`.
    pub reason_codes: CodeSet,
    /// Token id of the final link.
    pub token_ref: Option<String>,
    /// One entry per presented link, in chain order.
    pub entries: Vec<DelegationAuditEntry>,
}

impl DelegationStatus {
    /// True when the chain verified and is no deeper than `max_depth`.
    pub fn satisfies(&self, max_depth: usize) -> bool {
        self.verified && self.depth <= max_depth
    }

    /// Codes explaining why [`Self::satisfies`] is false for `max_depth`.
    pub fn failure_codes(&self, max_depth: usize) -> CodeSet {
        let mut codes = self.reason_codes.clone();
        if self.depth > max_depth {
            codes.insert(reason_codes::DELEGATION_CHAIN_TOO_DEEP);
        }
        codes
    }
}

/// Verify every link and fold the results. Each link's signer is resolved by
/// `signature.key_id` among `keys`.
pub fn verify_chain(
    chain: &[DelegationToken],
    keys: &TrustedKeys,
    ctx: &ChainContext<'_>,
) -> DelegationStatus {
    let mut status = DelegationStatus {
        depth: chain.len(),
        token_ref: chain.last().map(|t| t.token_id.clone()),
        ..DelegationStatus::default()
    };
    if chain.is_empty() {
        status.reason_codes.insert(reason_codes::DELEGATION_TOKEN_MISSING);
        return status;
    }

    let required_scope = vec![format!("tool:{}", ctx.tool_name)];
    let mut links_ok = true;
    for (index, token) in chain.iter().enumerate() {
        let result = verify_link(token, keys, ctx, &required_scope);
        match result {
            Ok(()) => status.valid_links += 1,
            Err(code) => {
                tracing::debug!(index, token_id = %token.token_id, code, "delegation link rejected");
                status.reason_codes.insert(code);
                links_ok = false;
            }
        }
        status.entries.push(DelegationAuditEntry {
            index,
            token_id: token.token_id.clone(),
            delegator_identity: token.delegator_identity.trim().to_string(),
            delegate_identity: token.delegate_identity.trim().to_string(),
            scope: token.scope.clone(),
            scope_class: token.scope_class.clone(),
            expires_at: token.expires_at,
            valid: result.is_ok(),
            error_code: result.err().unwrap_or_default().to_string(),
        });
    }

    let continuous = chain
        .windows(2)
        .all(|pair| pair[0].delegate_identity.trim() == pair[1].delegator_identity.trim());
    if !continuous {
        status.reason_codes.insert(reason_codes::DELEGATION_CHAIN_BROKEN);
    }

    let final_delegate_ok = chain
        .last()
        .is_some_and(|t| t.delegate_identity.trim() == ctx.requester_identity.trim());
    if !final_delegate_ok {
        status.reason_codes.insert(reason_codes::DELEGATION_DELEGATE_MISMATCH);
    }

    let claim_ok = ctx.claim.is_empty() || matches_claim(chain, ctx.claim);
    if !claim_ok {
        tracing::debug!(
            claimed = ctx.claim.len(),
            presented = chain.len(),
            "delegation tokens do not match the claimed chain"
        );
        status.reason_codes.insert(reason_codes::DELEGATION_CHAIN_MISMATCH);
    }

    status.verified = links_ok && continuous && final_delegate_ok && claim_ok;
    status
}

fn matches_claim(chain: &[DelegationToken], claim: &[DelegationLink]) -> bool {
    chain.len() == claim.len()
        && chain.iter().zip(claim).all(|(token, link)| {
            token.delegator_identity.trim() == link.delegator_identity.trim()
                && token.delegate_identity.trim() == link.delegate_identity.trim()
        })
}

fn verify_link(
    token: &DelegationToken,
    keys: &TrustedKeys,
    ctx: &ChainContext<'_>,
    required_scope: &[String],
) -> Result<(), &'static str> {
    let signature = token
        .signature
        .as_ref()
        .ok_or(reason_codes::DELEGATION_SIGNATURE_INVALID)?;
    if token.schema_id != DELEGATION_TOKEN_SCHEMA_ID {
        return Err(reason_codes::DELEGATION_SIGNATURE_INVALID);
    }
    keys.verify_value(&token.unsigned(), signature)
        .map_err(|_| reason_codes::DELEGATION_SIGNATURE_INVALID)?;

    if ctx.now >= token.expires_at {
        return Err(reason_codes::DELEGATION_EXPIRED);
    }
    let bound_mismatch =
        |bound: &str, expected: &str| !bound.is_empty() && !bound.eq_ignore_ascii_case(expected);
    if bound_mismatch(&token.intent_digest, ctx.intent_digest)
        || bound_mismatch(&token.policy_digest, ctx.policy_digest)
    {
        return Err(reason_codes::DELEGATION_DIGEST_MISMATCH);
    }
    if !token.scope.is_empty() && !scope_covers(required_scope, &token.scope) {
        return Err(reason_codes::DELEGATION_SCOPE_MISMATCH);
    }
    Ok(())
}
