// In-process WorkStore. One mutex guards every row, so `claim` is as
// atomic here as the conditional UPDATE is in Postgres. Used by tests and
// dry runs; workers in separate processes need PgWorkStore.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use harvest_common::{
    InsertStats, ItemFilter, ItemStatus, ListingDetails, ListingId, NewWorkItem,
    ProcessingMarker, StatusCounts, WorkItem, WorkerCounts,
};

use crate::error::Result;
use crate::traits::{RequeueScope, WorkStore};

#[derive(Debug, Clone)]
struct Row {
    item: WorkItem,
    marker: ProcessingMarker,
    details: Option<ListingDetails>,
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<ListingId, Row>,
    urls: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryWorkStore {
    inner: Mutex<Inner>,
}

impl MemoryWorkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed plain work items (no sampling provenance).
    pub fn with_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let store = Self::new();
        {
            let mut inner = store.lock();
            for item in items {
                if inner.rows.contains_key(&item.listing_id) || inner.urls.contains(&item.url) {
                    continue;
                }
                inner.urls.insert(item.url.clone());
                inner.rows.insert(
                    item.listing_id,
                    Row {
                        item,
                        marker: ProcessingMarker::default(),
                        details: None,
                    },
                );
            }
        }
        store
    }

    /// Applied detail fields, if the item reached `done`.
    pub fn details(&self, listing_id: ListingId) -> Option<ListingDetails> {
        self.lock().rows.get(&listing_id).and_then(|r| r.details.clone())
    }

    pub fn status_of(&self, listing_id: ListingId) -> Option<ItemStatus> {
        self.lock().rows.get(&listing_id).map(|r| r.marker.status)
    }

    pub fn ids_with_status(&self, status: ItemStatus) -> Vec<ListingId> {
        self.lock()
            .rows
            .values()
            .filter(|r| r.marker.status == status)
            .map(|r| r.item.listing_id)
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle a claimed item if `worker_id` holds it.
    fn settle(
        &self,
        listing_id: ListingId,
        worker_id: &str,
        batch_seq: i64,
        status: ItemStatus,
        details: Option<&ListingDetails>,
        reason: Option<&str>,
    ) -> bool {
        let mut inner = self.lock();
        let Some(row) = inner.rows.get_mut(&listing_id) else {
            return false;
        };
        if !row.marker.status.can_transition_to(status)
            || row.marker.claimed_by.as_deref() != Some(worker_id)
        {
            return false;
        }
        row.marker.status = status;
        row.marker.batch_seq = Some(batch_seq);
        match status {
            ItemStatus::Failed => row.marker.failure_reason = reason.map(str::to_string),
            _ => row.marker.result_applied_at = Some(Utc::now()),
        }
        if let Some(details) = details {
            row.details = Some(details.clone());
        }
        true
    }
}

#[async_trait]
impl WorkStore for MemoryWorkStore {
    async fn insert_items(&self, items: &[NewWorkItem]) -> Result<InsertStats> {
        let mut inner = self.lock();
        let mut stats = InsertStats::default();
        for new in items {
            if inner.rows.contains_key(&new.listing_id) || inner.urls.contains(&new.url) {
                stats.existing += 1;
                continue;
            }
            inner.urls.insert(new.url.clone());
            inner.rows.insert(
                new.listing_id,
                Row {
                    item: new.to_work_item(),
                    marker: ProcessingMarker::default(),
                    details: None,
                },
            );
            stats.inserted += 1;
        }
        Ok(stats)
    }

    async fn find_unclaimed(&self, filter: &ItemFilter, limit: Option<usize>) -> Result<Vec<WorkItem>> {
        let inner = self.lock();
        let items = inner
            .rows
            .values()
            .filter(|r| r.marker.status == ItemStatus::Unclaimed && filter.matches(&r.item))
            .map(|r| r.item.clone())
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(items)
    }

    async fn claim(&self, listing_id: ListingId, worker_id: &str) -> Result<bool> {
        let mut inner = self.lock();
        let Some(row) = inner.rows.get_mut(&listing_id) else {
            return Ok(false);
        };
        if !row.marker.status.can_transition_to(ItemStatus::Claimed) {
            return Ok(false);
        }
        row.marker.status = ItemStatus::Claimed;
        row.marker.claimed_by = Some(worker_id.to_string());
        row.marker.claimed_at = Some(Utc::now());
        Ok(true)
    }

    async fn apply_result(
        &self,
        listing_id: ListingId,
        worker_id: &str,
        batch_seq: i64,
        details: &ListingDetails,
    ) -> Result<bool> {
        Ok(self.settle(listing_id, worker_id, batch_seq, ItemStatus::Done, Some(details), None))
    }

    async fn mark_empty(&self, listing_id: ListingId, worker_id: &str, batch_seq: i64) -> Result<bool> {
        Ok(self.settle(listing_id, worker_id, batch_seq, ItemStatus::DoneEmpty, None, None))
    }

    async fn mark_failed(
        &self,
        listing_id: ListingId,
        worker_id: &str,
        batch_seq: i64,
        reason: &str,
    ) -> Result<bool> {
        Ok(self.settle(listing_id, worker_id, batch_seq, ItemStatus::Failed, None, Some(reason)))
    }

    async fn count(&self, filter: &ItemFilter) -> Result<u64> {
        let inner = self.lock();
        Ok(inner.rows.values().filter(|r| filter.matches(&r.item)).count() as u64)
    }

    async fn status_counts(&self, filter: &ItemFilter) -> Result<StatusCounts> {
        let inner = self.lock();
        let mut counts = StatusCounts::default();
        for row in inner.rows.values().filter(|r| filter.matches(&r.item)) {
            counts.add(row.marker.status, 1);
        }
        Ok(counts)
    }

    async fn worker_counts(&self) -> Result<Vec<WorkerCounts>> {
        let inner = self.lock();
        let mut by_worker: HashMap<String, WorkerCounts> = HashMap::new();
        for row in inner.rows.values() {
            let Some(worker) = row.marker.claimed_by.as_ref() else {
                continue;
            };
            let entry = by_worker.entry(worker.clone()).or_insert_with(|| WorkerCounts {
                worker_id: worker.clone(),
                counts: StatusCounts::default(),
                last_applied_at: None,
            });
            entry.counts.add(row.marker.status, 1);
            entry.last_applied_at = entry.last_applied_at.max(row.marker.result_applied_at);
        }
        let mut workers: Vec<WorkerCounts> = by_worker.into_values().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        Ok(workers)
    }

    async fn marker(&self, listing_id: ListingId) -> Result<Option<ProcessingMarker>> {
        Ok(self.lock().rows.get(&listing_id).map(|r| r.marker.clone()))
    }

    async fn requeue(&self, scope: &RequeueScope) -> Result<u64> {
        let mut inner = self.lock();
        let mut moved = 0;
        for row in inner.rows.values_mut() {
            if !scope.filter.matches(&row.item) {
                continue;
            }
            let failed = scope.failed && row.marker.status == ItemStatus::Failed;
            let orphaned = match (scope.orphaned_before, row.marker.claimed_at) {
                (Some(cutoff), Some(at)) => row.marker.status == ItemStatus::Claimed && at < cutoff,
                _ => false,
            };
            if failed || orphaned {
                let attempts = row.marker.attempts + 1;
                row.marker = ProcessingMarker {
                    attempts,
                    ..ProcessingMarker::default()
                };
                moved += 1;
            }
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn item(id: ListingId) -> WorkItem {
        WorkItem {
            listing_id: id,
            url: format!("https://www.etsy.com/listing/{id}"),
            category: Some("rings".into()),
            country: Some(if id % 2 == 0 { "US" } else { "GB" }.into()),
            priority: false,
        }
    }

    #[tokio::test]
    async fn claim_succeeds_once() {
        let store = MemoryWorkStore::with_items([item(1)]);
        assert!(store.claim(1, "a").await.unwrap());
        assert!(!store.claim(1, "b").await.unwrap());
        assert!(!store.claim(1, "a").await.unwrap());
        assert!(!store.claim(99, "a").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryWorkStore::with_items([item(7)]));
        let mut handles = Vec::new();
        for worker in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim(7, &format!("worker-{worker}")).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn only_the_claim_holder_can_settle() {
        let store = MemoryWorkStore::with_items([item(1), item(2)]);
        assert!(store.claim(1, "a").await.unwrap());

        assert!(!store.mark_empty(1, "b", 0).await.unwrap());
        assert!(!store.mark_empty(2, "a", 0).await.unwrap(), "unclaimed items can't settle");
        assert!(store.mark_empty(1, "a", 0).await.unwrap());
        assert!(!store.mark_failed(1, "a", 0, "late").await.unwrap(), "settled items stay settled");
        assert_eq!(store.status_of(1), Some(ItemStatus::DoneEmpty));
    }

    #[tokio::test]
    async fn settled_items_never_move_again() {
        let store = MemoryWorkStore::with_items([item(1), item(2)]);
        assert!(store.claim(1, "a").await.unwrap());
        assert!(store.apply_result(1, "a", 1, &ListingDetails::default()).await.unwrap());
        assert!(store.claim(2, "a").await.unwrap());
        assert!(store.mark_failed(2, "a", 1, "boom").await.unwrap());

        for id in [1, 2] {
            assert!(!store.claim(id, "a").await.unwrap());
            assert!(!store.mark_empty(id, "a", 2).await.unwrap());
            assert!(!store.apply_result(id, "a", 2, &ListingDetails::default()).await.unwrap());
        }
        assert_eq!(store.status_of(1), Some(ItemStatus::Done));
        assert_eq!(store.status_of(2), Some(ItemStatus::Failed));
        assert_eq!(store.marker(2).await.unwrap().unwrap().batch_seq, Some(1));
    }

    #[tokio::test]
    async fn insert_skips_existing_ids_and_urls() {
        let store = MemoryWorkStore::with_items([item(1)]);
        let mut dup_url = new_item(2);
        dup_url.url = item(1).url;
        let stats = store
            .insert_items(&[new_item(1), dup_url, new_item(3)])
            .await
            .unwrap();
        assert_eq!(stats, InsertStats { inserted: 1, existing: 2 });
        assert_eq!(store.count(&ItemFilter::default()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn find_unclaimed_filters_and_orders() {
        let store = MemoryWorkStore::with_items([item(4), item(2), item(3), item(1)]);
        store.claim(2, "a").await.unwrap();
        let us = ItemFilter {
            country: Some("US".into()),
            ..Default::default()
        };
        let ids: Vec<_> = store
            .find_unclaimed(&us, None)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.listing_id)
            .collect();
        assert_eq!(ids, vec![4]);

        let all = store.find_unclaimed(&ItemFilter::default(), Some(2)).await.unwrap();
        assert_eq!(all.iter().map(|i| i.listing_id).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[tokio::test]
    async fn requeue_resets_failed_and_orphaned() {
        let store = MemoryWorkStore::with_items([item(1), item(2), item(3)]);
        for id in 1..=3 {
            store.claim(id, "a").await.unwrap();
        }
        store.mark_failed(1, "a", 0, "boom").await.unwrap();
        store.apply_result(3, "a", 0, &ListingDetails::default()).await.unwrap();

        let moved = store
            .requeue(&RequeueScope {
                failed: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(moved, 1);
        let marker = store.marker(1).await.unwrap().unwrap();
        assert_eq!(marker.status, ItemStatus::Unclaimed);
        assert_eq!(marker.attempts, 1);
        assert_eq!(marker.failure_reason, None);

        let moved = store
            .requeue(&RequeueScope {
                orphaned_before: Some(Utc::now() + chrono::Duration::seconds(1)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(moved, 1, "only the still-claimed item is orphaned");
        assert_eq!(store.status_of(2), Some(ItemStatus::Unclaimed));
        assert_eq!(store.status_of(3), Some(ItemStatus::Done));
    }

    #[tokio::test]
    async fn worker_counts_group_by_claimer() {
        let store = MemoryWorkStore::with_items([item(1), item(2), item(3)]);
        store.claim(1, "b").await.unwrap();
        store.claim(2, "a").await.unwrap();
        store.claim(3, "a").await.unwrap();
        store.mark_empty(2, "a", 1).await.unwrap();

        let workers = store.worker_counts().await.unwrap();
        assert_eq!(workers.len(), 2);
        assert_eq!(workers[0].worker_id, "a");
        assert_eq!(workers[0].counts.done_empty, 1);
        assert_eq!(workers[0].counts.claimed, 1);
        assert!(workers[0].last_applied_at.is_some());
        assert_eq!(workers[1].counts.claimed, 1);
    }

    fn new_item(id: ListingId) -> NewWorkItem {
        let base = item(id);
        NewWorkItem {
            listing_id: id,
            url: base.url,
            category: base.category,
            category_url: None,
            country: base.country,
            search_term: None,
            facet: None,
            search_rank: None,
            search_page: None,
            shop: None,
            price_range: harvest_common::PriceRange::Unknown,
            performance: harvest_common::PerformanceTag::Low,
            is_star_seller: false,
            is_etsy_pick: false,
            is_bestseller: false,
            shop_review_count: 0,
            payload: serde_json::Value::Null,
        }
    }
}
