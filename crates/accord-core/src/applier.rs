//! Commit Applier contract
//!
//! Physically mutating the code artifact is out of the engine's hands; an
//! applier receives each commit once, and a failure is recorded as
//! `apply_failed` without retry.

use crate::error::ApplyError;
use crate::types::CommitRecord;
use async_trait::async_trait;

/// Performs the code mutation for an accepted commit
#[async_trait]
pub trait CommitApplier: Send + Sync {
    /// Apply the commit's resolved change
    async fn apply(&self, commit: &CommitRecord) -> Result<(), ApplyError>;
}

/// Applier that accepts every commit without touching anything
///
/// Used when a session only needs the negotiated outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunApplier;

#[async_trait]
impl CommitApplier for DryRunApplier {
    async fn apply(&self, commit: &CommitRecord) -> Result<(), ApplyError> {
        tracing::debug!(commit = %commit.id, "Dry run: commit not applied");
        Ok(())
    }
}
