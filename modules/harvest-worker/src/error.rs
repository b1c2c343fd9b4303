use harvest_common::HarvestError;
use harvest_store::StoreError;

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Errors that abort a shard or a sampling pass. Provider failures are
/// handled inside the batch loop and never surface here.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Invalid(#[from] HarvestError),
}
