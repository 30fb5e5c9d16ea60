pub mod jcs;
pub mod signing;

pub use signing::{DetachedSignature, SignatureError, TrustedKeys};
