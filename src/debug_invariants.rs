//! Opt-in structural validation for partition indices and transfer plans.

use crate::exchange_error::ExchangeError;

/// Trait for validating data structure invariants.
pub trait DebugInvariants {
    /// Validate invariants and return the first error encountered.
    fn validate_invariants(&self) -> Result<(), ExchangeError>;

    /// Panic on a violated invariant in debug builds or when invariant checking
    /// is enabled; a no-op otherwise.
    fn debug_assert_invariants(&self) {
        if cfg!(any(
            debug_assertions,
            feature = "strict-invariants",
            feature = "check-invariants"
        )) {
            if let Err(e) = self.validate_invariants() {
                panic!("[invariants] {}: {e}", std::any::type_name::<Self>());
            }
        }
    }
}
