use async_trait::async_trait;
use chrono::{DateTime, Utc};

use harvest_common::{
    InsertStats, ItemFilter, ListingDetails, ListingId, NewWorkItem, ProcessingMarker,
    StatusCounts, WorkItem, WorkerCounts,
};

use crate::error::Result;

/// Which settled or stuck items a requeue puts back into play.
#[derive(Debug, Clone, Default)]
pub struct RequeueScope {
    /// Items whose batch exhausted its retries or was rejected.
    pub failed: bool,
    /// Claims older than this are treated as orphaned by a dead worker.
    pub orphaned_before: Option<DateTime<Utc>>,
    pub filter: ItemFilter,
}

/// Persistence of work items and processing markers.
///
/// Commit operations (`apply_result`, `mark_empty`, `mark_failed`) only touch
/// items currently claimed by `worker_id`, and return whether they did.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Insert sampled items, leaving any already present (by id or URL) untouched.
    async fn insert_items(&self, items: &[NewWorkItem]) -> Result<InsertStats>;

    /// Unclaimed items matching `filter`, ordered by listing id.
    async fn find_unclaimed(&self, filter: &ItemFilter, limit: Option<usize>) -> Result<Vec<WorkItem>>;

    /// Atomically move an item from unclaimed to claimed by `worker_id`.
    /// Returns false when the item is missing or anyone already holds it.
    async fn claim(&self, listing_id: ListingId, worker_id: &str) -> Result<bool>;

    async fn apply_result(
        &self,
        listing_id: ListingId,
        worker_id: &str,
        batch_seq: i64,
        details: &ListingDetails,
    ) -> Result<bool>;

    /// The remote call succeeded but returned nothing for this item.
    async fn mark_empty(&self, listing_id: ListingId, worker_id: &str, batch_seq: i64) -> Result<bool>;

    async fn mark_failed(
        &self,
        listing_id: ListingId,
        worker_id: &str,
        batch_seq: i64,
        reason: &str,
    ) -> Result<bool>;

    /// Number of items matching `filter`, whatever their status.
    async fn count(&self, filter: &ItemFilter) -> Result<u64>;

    async fn status_counts(&self, filter: &ItemFilter) -> Result<StatusCounts>;

    async fn worker_counts(&self) -> Result<Vec<WorkerCounts>>;

    async fn marker(&self, listing_id: ListingId) -> Result<Option<ProcessingMarker>>;

    /// Reset matching failed/orphaned items to unclaimed. Returns how many moved.
    async fn requeue(&self, scope: &RequeueScope) -> Result<u64>;
}
