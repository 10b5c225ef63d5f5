//! Progress callbacks for apply and verify passes.

use crate::applier::UnitResult;
use crate::unit::DeploymentUnit;
use crate::verifier::VerifyResult;

/// Receives per-unit progress. Every method defaults to a no-op.
pub trait PassObserver: Send + Sync {
    /// A unit is about to be applied. `position` is 1-based.
    fn apply_started(&self, _unit: &DeploymentUnit, _position: usize, _total: usize) {}

    /// A unit reached its apply-pass outcome.
    fn apply_finished(&self, _result: &UnitResult) {}

    /// Health polling for a unit begins.
    fn verify_started(&self, _unit: &DeploymentUnit, _position: usize, _total: usize) {}

    /// A unit reached its verification outcome.
    fn verify_finished(&self, _result: &VerifyResult) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentObserver;

impl PassObserver for SilentObserver {}
