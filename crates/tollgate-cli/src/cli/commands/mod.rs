pub mod approve;
pub mod approve_script;
pub mod common;
pub mod delegate;
pub mod digest;
pub mod dispatch;
pub mod eval;
pub mod keygen;
pub mod trace;

pub use dispatch::dispatch;
