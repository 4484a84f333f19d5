//! Core traits for Salvage
//!
//! The ReportingHook trait is the only way outcomes leave the orchestrator.
//! Implementations must not block; delivery failures are their own business.

use std::time::Duration;

use crate::types::{Crane, Tide, Volume};

/// Sink for backup outcomes, invoked fire-and-forget
pub trait ReportingHook: Send + Sync {
    /// A volume has been backed up
    fn volume_success(&self, volume: &Volume, crane: &Crane, duration: Duration);

    /// A volume backup failed, `message` holds the reason or last crane output
    fn volume_failure(&self, volume: &Volume, crane: &Crane, message: &str, duration: Duration);

    /// Every volume of the tide has been backed up
    fn tide_success(&self, tide: &Tide, volumes: &[Volume], duration: Duration);

    /// The tide failed before any volume reported an outcome
    fn tide_failure(&self, tide: &Tide, message: &str, duration: Duration);

    /// The tide failed, but some volumes reported an outcome
    fn tide_failure_with_volumes(
        &self,
        tide: &Tide,
        succeeded: &[Volume],
        failed: &[Volume],
        message: &str,
        duration: Duration,
    );
}
