//! Gate decision engine.
//!
//! Evaluation pipeline: intent normalization, fail-closed validation, script
//! governance, rule matching, approval verification, credential issuance, trace
//! emission and audit records. [`evaluate::evaluate`] is the entry point.

pub mod approval;
pub mod constraints;
pub mod delegation;
pub mod evaluate;
pub mod evidence;
pub mod fail_closed;
pub mod helpers;
pub mod intent;
pub mod matcher;
pub mod policy;
pub mod rate_limit;
pub mod registry;
pub mod script;
pub mod trace;
pub mod verdict;

pub use evaluate::{evaluate, EvaluateOptions, GateOutcome, GateOutput, Profile};
pub use evidence::GateEvidence;
pub use intent::IntentRequest;
pub use policy::Policy;
pub use verdict::{CodeSet, Verdict};
