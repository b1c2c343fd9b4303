// Per-shard batch loop.
//
//   FetchSnapshot → ClaimBatch → Submit → ApplyResults → ClaimBatch … → Done
//
// Each batch is claimed item by item against the store, submitted as one
// remote run (with retry), and fully settled before the next claim. A store
// error aborts the shard; provider errors only fail the batch's items.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use harvest_common::{ItemFilter, ListingId, ShardDescriptor, WorkItem, WorkerSettings};
use harvest_store::WorkStore;

use crate::batch_client::{BatchError, BatchRun, RemoteBatchClient, RetryPolicy};
use crate::error::Result;
use crate::metrics::{CostTracker, NoopProgressSink, ProgressSink};
use crate::partition;

/// Running totals for one shard. Also the payload of progress reports.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShardReport {
    pub worker_id: String,
    /// Unclaimed items this worker's snapshot held before sharding.
    pub snapshot_size: usize,
    pub shard_size: usize,
    /// Shard positions walked so far, claimed or not.
    pub visited: usize,
    pub batches: u64,
    pub claimed: u64,
    pub done: u64,
    pub done_empty: u64,
    pub failed: u64,
    /// Items someone else held by the time this worker tried to claim them.
    pub claim_conflicts: u64,
    /// Records for ids outside the submitted batch, or repeats.
    pub ignored_records: u64,
    pub cost_usd: f64,
    pub elapsed: Duration,
    /// The loop stopped early because the spend limit was reached.
    pub budget_exhausted: bool,
}

impl ShardReport {
    pub fn processed(&self) -> u64 {
        self.done + self.done_empty + self.failed
    }

    /// Fold per-worker reports into one for the end-of-run summary.
    pub fn combine(worker_id: &str, reports: &[ShardReport]) -> ShardReport {
        let mut total = ShardReport {
            worker_id: worker_id.to_string(),
            ..Default::default()
        };
        for r in reports {
            total.snapshot_size = total.snapshot_size.max(r.snapshot_size);
            total.shard_size += r.shard_size;
            total.visited += r.visited;
            total.batches += r.batches;
            total.claimed += r.claimed;
            total.done += r.done;
            total.done_empty += r.done_empty;
            total.failed += r.failed;
            total.claim_conflicts += r.claim_conflicts;
            total.ignored_records += r.ignored_records;
            total.cost_usd += r.cost_usd;
            total.elapsed = total.elapsed.max(r.elapsed);
            total.budget_exhausted |= r.budget_exhausted;
        }
        total
    }
}

enum Step {
    ClaimBatch,
    Submit(Vec<WorkItem>),
    ApplyResults(Vec<WorkItem>, std::result::Result<BatchRun, BatchError>),
    Done,
}

pub struct ShardCoordinator {
    store: Arc<dyn WorkStore>,
    client: Arc<dyn RemoteBatchClient>,
    progress: Arc<dyn ProgressSink>,
    costs: Arc<CostTracker>,
    shard: ShardDescriptor,
    settings: WorkerSettings,
    filter: ItemFilter,
}

impl ShardCoordinator {
    pub fn new(
        store: Arc<dyn WorkStore>,
        client: Arc<dyn RemoteBatchClient>,
        shard: ShardDescriptor,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            client,
            progress: Arc::new(NoopProgressSink),
            costs: Arc::new(CostTracker::unlimited()),
            shard,
            settings,
            filter: ItemFilter::default(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_costs(mut self, costs: Arc<CostTracker>) -> Self {
        self.costs = costs;
        self
    }

    /// Restrict the snapshot to one category and/or country.
    pub fn with_filter(mut self, filter: ItemFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Take a fresh snapshot of unclaimed items and work this worker's shard of it.
    pub async fn run(&self) -> Result<ShardReport> {
        self.shard.validate()?;
        let snapshot = self.store.find_unclaimed(&self.filter, None).await?;
        info!(
            worker = %self.shard.worker_id,
            snapshot = snapshot.len(),
            "Fetched unclaimed snapshot"
        );
        self.run_with_snapshot(snapshot).await
    }

    /// Work this worker's shard of a snapshot taken elsewhere.
    ///
    /// The snapshot may be stale; items claimed since are skipped at claim time.
    pub async fn run_with_snapshot(&self, snapshot: Vec<WorkItem>) -> Result<ShardReport> {
        self.shard.validate()?;
        let started = Instant::now();
        let snapshot_size = snapshot.len();
        let items = self.assigned_items(snapshot);

        let mut report = ShardReport {
            worker_id: self.shard.worker_id.clone(),
            snapshot_size,
            shard_size: items.len(),
            ..Default::default()
        };
        info!(
            worker = %self.shard.worker_id,
            index = self.shard.worker_index,
            shards = self.shard.shard_count,
            snapshot = snapshot_size,
            items = items.len(),
            "Shard assigned"
        );

        let retry = RetryPolicy::from_settings(&self.settings);
        let mut cursor = 0;
        let mut step = Step::ClaimBatch;

        loop {
            step = match step {
                Step::ClaimBatch => {
                    if !self.costs.has_budget(self.settings.cost_per_batch_usd) {
                        warn!(worker = %self.shard.worker_id, "Spend limit reached, stopping shard");
                        report.budget_exhausted = true;
                        Step::Done
                    } else {
                        let batch = self.claim_batch(&items, &mut cursor, &mut report).await?;
                        if batch.is_empty() {
                            Step::Done
                        } else {
                            Step::Submit(batch)
                        }
                    }
                }
                Step::Submit(batch) => {
                    let targets: Vec<String> = batch.iter().map(|i| i.url.clone()).collect();
                    debug!(
                        worker = %self.shard.worker_id,
                        batch = report.batches + 1,
                        targets = targets.len(),
                        "Submitting batch"
                    );
                    let outcome = retry.run(self.client.as_ref(), &targets).await;
                    Step::ApplyResults(batch, outcome)
                }
                Step::ApplyResults(batch, outcome) => {
                    report.batches += 1;
                    let batch_seq = report.batches as i64;
                    match outcome {
                        Ok(run) => self.apply_run(&batch, run, batch_seq, &mut report).await?,
                        Err(e) => {
                            let reason = retry.failure_reason(&e);
                            self.fail_batch(&batch, batch_seq, &reason, &mut report).await?
                        }
                    }

                    report.elapsed = started.elapsed();
                    if report.batches % self.settings.progress_every.max(1) as u64 == 0 {
                        self.progress.progress(&report);
                    }

                    if cursor < items.len() {
                        let delay = self.settings.inter_batch_delay();
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        Step::ClaimBatch
                    } else {
                        Step::Done
                    }
                }
                Step::Done => break,
            };
        }

        report.elapsed = started.elapsed();
        self.progress.finished(&report);
        Ok(report)
    }

    /// This worker's shard, narrowed to the resume range if one is set.
    fn assigned_items(&self, snapshot: Vec<WorkItem>) -> Vec<WorkItem> {
        let mut items = partition::shard(
            &snapshot,
            self.shard.worker_index,
            self.shard.shard_count,
            self.settings.partition,
        );
        if let Some((start, end)) = self.shard.resume_range {
            let end = end.min(items.len());
            let start = start.min(end);
            info!(worker = %self.shard.worker_id, start, end, "Resuming within shard");
            items.truncate(end);
            items.drain(..start);
        }
        items
    }

    /// Walk the shard from `cursor`, claiming until the batch is full or the shard ends.
    async fn claim_batch(
        &self,
        items: &[WorkItem],
        cursor: &mut usize,
        report: &mut ShardReport,
    ) -> Result<Vec<WorkItem>> {
        let mut batch = Vec::with_capacity(self.settings.batch_size);
        while batch.len() < self.settings.batch_size && *cursor < items.len() {
            let item = &items[*cursor];
            *cursor += 1;
            report.visited = *cursor;
            if self.store.claim(item.listing_id, &self.shard.worker_id).await? {
                report.claimed += 1;
                batch.push(item.clone());
            } else {
                report.claim_conflicts += 1;
                debug!(listing_id = item.listing_id, "Already claimed, skipping");
            }
        }
        Ok(batch)
    }

    async fn apply_run(
        &self,
        batch: &[WorkItem],
        run: BatchRun,
        batch_seq: i64,
        report: &mut ShardReport,
    ) -> Result<()> {
        let cost = run.cost_usd.unwrap_or(self.settings.cost_per_batch_usd);
        self.costs.spend(cost);
        report.cost_usd += cost;

        let in_batch: HashSet<ListingId> = batch.iter().map(|i| i.listing_id).collect();
        let mut applied: HashSet<ListingId> = HashSet::new();
        let worker = self.shard.worker_id.as_str();

        for record in run.records {
            if !in_batch.contains(&record.listing_id) {
                report.ignored_records += 1;
                debug!(listing_id = record.listing_id, "Record outside batch, ignoring");
                continue;
            }
            if !applied.insert(record.listing_id) {
                report.ignored_records += 1;
                continue;
            }
            if self
                .store
                .apply_result(record.listing_id, worker, batch_seq, &record.details)
                .await?
            {
                report.done += 1;
            } else {
                warn!(listing_id = record.listing_id, worker, "Lost claim before apply");
            }
        }

        let mut empty = 0;
        for item in batch.iter().filter(|i| !applied.contains(&i.listing_id)) {
            if self.store.mark_empty(item.listing_id, worker, batch_seq).await? {
                empty += 1;
            }
        }
        report.done_empty += empty;

        info!(
            worker,
            batch = batch_seq,
            run_id = run.run_id.as_deref().unwrap_or("-"),
            submitted = batch.len(),
            done = applied.len(),
            empty,
            "Batch applied"
        );
        Ok(())
    }

    async fn fail_batch(
        &self,
        batch: &[WorkItem],
        batch_seq: i64,
        reason: &str,
        report: &mut ShardReport,
    ) -> Result<()> {
        let worker = self.shard.worker_id.as_str();
        for item in batch {
            if self.store.mark_failed(item.listing_id, worker, batch_seq, reason).await? {
                report.failed += 1;
            }
        }
        warn!(worker, batch = batch_seq, items = batch.len(), reason, "Batch failed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use harvest_common::PartitionStrategy;
    use harvest_store::MemoryWorkStore;

    use super::*;

    fn items(n: i64) -> Vec<WorkItem> {
        (1..=n)
            .map(|id| WorkItem {
                listing_id: id,
                url: format!("https://www.etsy.com/listing/{id}"),
                category: None,
                country: None,
                priority: false,
            })
            .collect()
    }

    struct EmptyClient;

    #[async_trait::async_trait]
    impl RemoteBatchClient for EmptyClient {
        async fn run_batch(&self, _targets: &[String]) -> std::result::Result<BatchRun, BatchError> {
            Ok(BatchRun::default())
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            inter_batch_delay_ms: 0,
            retry_delay_ms: 0,
            partition: PartitionStrategy::Contiguous,
            ..Default::default()
        }
    }

    fn coordinator(store: Arc<MemoryWorkStore>, shard: ShardDescriptor) -> ShardCoordinator {
        ShardCoordinator::new(store, Arc::new(EmptyClient), shard, settings())
    }

    #[tokio::test]
    async fn resume_range_narrows_the_shard() {
        let store = Arc::new(MemoryWorkStore::with_items(items(20)));
        let shard = ShardDescriptor::new("w1", 1, 2).with_resume_range(2, 5);
        let report = coordinator(store.clone(), shard).run().await.unwrap();

        // shard 1 of 2 is ids 11..=20; positions 2..5 are ids 13, 14, 15
        assert_eq!(report.shard_size, 3);
        assert_eq!(report.done_empty, 3);
        let claimed: Vec<_> = store.ids_with_status(harvest_common::ItemStatus::DoneEmpty);
        assert_eq!(claimed, vec![13, 14, 15]);
    }

    #[tokio::test]
    async fn invalid_descriptor_is_rejected_before_any_claim() {
        let store = Arc::new(MemoryWorkStore::with_items(items(3)));
        let err = coordinator(store.clone(), ShardDescriptor::new("w2", 2, 2))
            .run()
            .await;
        assert!(err.is_err());
        assert_eq!(store.ids_with_status(harvest_common::ItemStatus::Unclaimed).len(), 3);
    }

    #[tokio::test]
    async fn spend_limit_stops_claiming() {
        let store = Arc::new(MemoryWorkStore::with_items(items(20)));
        let costs = Arc::new(CostTracker::new(0.04));
        let report = coordinator(store.clone(), ShardDescriptor::new("w0", 0, 1))
            .with_costs(costs.clone())
            .run()
            .await
            .unwrap();

        assert!(report.budget_exhausted);
        assert_eq!(report.batches, 2);
        assert_eq!(report.done_empty, 10);
        assert_eq!(store.ids_with_status(harvest_common::ItemStatus::Unclaimed).len(), 10);
    }

    #[test]
    fn summary_adds_up_workers() {
        let a = ShardReport {
            done: 3,
            failed: 1,
            ..Default::default()
        };
        let b = ShardReport {
            done: 2,
            done_empty: 4,
            ..Default::default()
        };
        let total = ShardReport::combine("all", &[a, b]);
        assert_eq!(total.done, 5);
        assert_eq!(total.done_empty, 4);
        assert_eq!(total.failed, 1);
        assert_eq!(total.processed(), 10);
    }
}
