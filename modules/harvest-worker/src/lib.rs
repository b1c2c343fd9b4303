//! Distributed detail harvesting over a shared listing store.
//!
//! `sampler` fills the store with facet-diversified listings; each
//! `ShardCoordinator` then works one shard of the unclaimed snapshot in
//! batches against the remote scraper.

pub mod batch_client;
pub mod candidates;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod sampler;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use batch_client::{ApifyBatchClient, BatchError, BatchRun, RemoteBatchClient, RetryPolicy};
pub use candidates::{ApifyCandidateSource, CandidateSource};
pub use coordinator::{ShardCoordinator, ShardReport};
pub use error::{Result, WorkerError};
pub use metrics::{CostTracker, LogProgressSink, NoopProgressSink, ProgressSink};
pub use sampler::{CategoryReport, GroupSample, SamplingAggregator};
