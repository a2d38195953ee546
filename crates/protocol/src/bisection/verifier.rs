//! The verifier module holds the [OneStepVerifier] trait.

use super::{ExecutionAssertionStub, Precondition};

/// The [OneStepVerifier] trait defines the interface of the deterministic checker that
/// adjudicates the single disputed step of a challenge.
pub trait OneStepVerifier: Send + Sync {
    /// Check a one step proof against a claim.
    ///
    /// ### Takes
    /// - `precondition`: The committed starting state of the step.
    /// - `assertion`: The claimed result of executing the step.
    /// - `proof`: The opaque proof submitted by the asserter.
    ///
    /// ### Returns
    /// - `true` if executing the step from `precondition` yields exactly `assertion`.
    fn verify(
        &self,
        precondition: &Precondition,
        assertion: &ExecutionAssertionStub,
        proof: &[u8],
    ) -> bool;
}
