//! Tollgate core: a deterministic policy gate for agent tool calls.
//!
//! The gate takes a structured intent, evaluates it against a declarative
//! policy and returns one of `allow`, `block`, `require_approval` or
//! `dry_run`, together with a signed, replayable trace of the decision.

pub mod broker;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod files;
pub mod gate;

pub use errors::{ErrorCategory, GateError};
pub use gate::evaluate::{evaluate, EvaluateOptions, GateOutcome, GateOutput, Profile};
pub use gate::intent::IntentRequest;
pub use gate::policy::Policy;
pub use gate::verdict::Verdict;
