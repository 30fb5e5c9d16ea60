//! Process exit codes. These are part of the public contract.
//!
//! Verdict codes come from [`tollgate_core::Verdict::exit_code`]; error codes
//! from [`tollgate_core::GateError::exit_code`]. The constants below name
//! the same values for the CLI's own checks.

pub const SUCCESS: i32 = 0;
pub const INTERNAL_ERROR: i32 = 1;
pub const VERIFICATION_FAILED: i32 = 2;
pub const BLOCKED: i32 = 3;
pub const APPROVAL_REQUIRED: i32 = 4;
pub const INVALID_INPUT: i32 = 6;
pub const DEPENDENCY_MISSING: i32 = 7;

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::{GateError, Verdict};

    #[test]
    fn test_constants_match_core() {
        assert_eq!(Verdict::Allow.exit_code(), SUCCESS);
        assert_eq!(Verdict::DryRun.exit_code(), SUCCESS);
        assert_eq!(Verdict::Block.exit_code(), BLOCKED);
        assert_eq!(Verdict::RequireApproval.exit_code(), APPROVAL_REQUIRED);
        assert_eq!(GateError::InvalidInput("x".into()).exit_code(), INVALID_INPUT);
        assert_eq!(GateError::Internal("x".into()).exit_code(), INTERNAL_ERROR);
        assert_eq!(
            GateError::DependencyMissing("x".into()).exit_code(),
            DEPENDENCY_MISSING
        );
        assert_eq!(
            GateError::Verification {
                code: "x",
                message: "x".into()
            }
            .exit_code(),
            VERIFICATION_FAILED
        );
    }
}
