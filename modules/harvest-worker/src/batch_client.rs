// Remote batch execution: one paid scraper run per batch of targets.
//
// RemoteBatchClient is the seam the coordinator talks to. ApifyBatchClient
// binds it to the Etsy detail scraper; tests use the scripted doubles in
// `testing`.

use std::time::Duration;

use apify_client::{ApifyClient, ApifyError, EtsyListingDetail};
use async_trait::async_trait;
use tracing::{info, warn};

use harvest_common::{ListingDetails, ResultRecord, WorkerSettings};

/// Records returned by one completed remote run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchRun {
    pub records: Vec<ResultRecord>,
    pub run_id: Option<String>,
    /// Cost reported by the provider, if any.
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BatchError {
    /// Network trouble, throttling, provider-side failure. Worth retrying.
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// The provider rejected the input. Retrying would fail the same way.
    #[error("Permanent input error: {0}")]
    Permanent(String),
}

impl BatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<ApifyError> for BatchError {
    fn from(e: ApifyError) -> Self {
        if e.is_transient() {
            Self::Transient(e.to_string())
        } else {
            Self::Permanent(e.to_string())
        }
    }
}

#[async_trait]
pub trait RemoteBatchClient: Send + Sync {
    /// Start a run for `targets`, wait for it, and fetch every record.
    /// An empty record set is a successful run.
    async fn run_batch(&self, targets: &[String]) -> Result<BatchRun, BatchError>;
}

/// Detail scraping through the Apify Etsy actor.
pub struct ApifyBatchClient {
    client: ApifyClient,
}

impl ApifyBatchClient {
    pub fn new(client: ApifyClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteBatchClient for ApifyBatchClient {
    async fn run_batch(&self, targets: &[String]) -> Result<BatchRun, BatchError> {
        let run = self.client.scrape_etsy_details(targets).await?;
        let records = run.items.into_iter().filter_map(to_record).collect();
        Ok(BatchRun {
            records,
            run_id: Some(run.run.id),
            cost_usd: run.run.usage_total_usd,
        })
    }
}

fn to_record(detail: EtsyListingDetail) -> Option<ResultRecord> {
    let listing_id = detail.listing_id?;
    Some(ResultRecord {
        listing_id,
        details: ListingDetails {
            tags: detail.tags.unwrap_or_default(),
            materials: detail.materials.unwrap_or_default(),
            category_tags: detail.category_tags.unwrap_or_default(),
            description: detail.description,
            who_made: detail.who_made,
            when_made: detail.when_made,
            has_star_seller_signal: detail.has_star_seller_signal.unwrap_or(false),
            is_bestseller: detail.is_bestseller.unwrap_or(false),
            is_bestseller_by_fixed_qty_category_l3: detail
                .is_bestseller_by_fixed_qty_category_l3
                .unwrap_or(false),
            is_bestseller_by_fixed_qty_category_leaf: detail
                .is_bestseller_by_fixed_qty_category_leaf
                .unwrap_or(false),
            is_made_to_order: detail.is_made_to_order.unwrap_or(false),
            is_top_rated: detail.is_top_rated.unwrap_or(false),
            free_shipping_countries: detail.free_shipping_countries.unwrap_or_default(),
            free_shipping_data: detail.free_shipping_data,
            item_details: detail.item_details.unwrap_or_default(),
        },
    })
}

/// Whole-batch retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::new(settings.max_retries, settings.retry_delay())
    }

    /// Run a batch, retrying transient failures. Permanent errors return at once.
    pub async fn run(
        &self,
        client: &dyn RemoteBatchClient,
        targets: &[String],
    ) -> Result<BatchRun, BatchError> {
        let mut attempt = 1;
        loop {
            match client.run_batch(targets).await {
                Ok(run) => return Ok(run),
                Err(e @ BatchError::Permanent(_)) => {
                    warn!(targets = targets.len(), error = %e, "Batch rejected, not retrying");
                    return Err(e);
                }
                Err(e) if attempt >= self.max_attempts => {
                    warn!(attempts = attempt, error = %e, "Batch failed, retries exhausted");
                    return Err(e);
                }
                Err(e) => {
                    info!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Batch attempt failed, retrying"
                    );
                    attempt += 1;
                    if !self.delay.is_zero() {
                        tokio::time::sleep(self.delay).await;
                    }
                }
            }
        }
    }

    /// Failure reason recorded on every item of a batch that `run` gave up on.
    pub fn failure_reason(&self, error: &BatchError) -> String {
        match error {
            BatchError::Transient(_) => {
                format!("Batch failed after {} attempts: {error}", self.max_attempts)
            }
            BatchError::Permanent(_) => format!("Batch rejected: {error}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    struct FailingClient {
        calls: AtomicU32,
        fail_times: u32,
        error: BatchError,
    }

    #[async_trait]
    impl RemoteBatchClient for FailingClient {
        async fn run_batch(&self, _targets: &[String]) -> Result<BatchRun, BatchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_times {
                Err(self.error.clone())
            } else {
                Ok(BatchRun::default())
            }
        }
    }

    fn client(fail_times: u32, error: BatchError) -> FailingClient {
        FailingClient {
            calls: AtomicU32::new(0),
            fail_times,
            error,
        }
    }

    #[tokio::test]
    async fn recovers_within_the_attempt_budget() {
        let c = client(2, BatchError::Transient("503".into()));
        let policy = RetryPolicy::new(3, Duration::ZERO);
        assert!(policy.run(&c, &["u".into()]).await.is_ok());
        assert_eq!(c.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let c = client(10, BatchError::Transient("timeout".into()));
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let err = policy.run(&c, &["u".into()]).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(c.calls.load(Ordering::SeqCst), 3);
        assert!(policy.failure_reason(&err).contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let c = client(10, BatchError::Permanent("bad input".into()));
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let err = policy.run(&c, &["u".into()]).await.unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(c.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[test]
    fn apify_errors_keep_their_classification() {
        let throttled = ApifyError::Api {
            status: 429,
            message: "slow down".into(),
        };
        let invalid = ApifyError::Api {
            status: 400,
            message: "invalid input".into(),
        };
        assert!(BatchError::from(throttled).is_transient());
        assert!(!BatchError::from(invalid).is_transient());
    }

    #[test]
    fn detail_records_default_missing_fields() {
        let detail = EtsyListingDetail::from_value(serde_json::json!({
            "listing": { "listing_id": "123", "tags": ["a"], "is_bestseller": true }
        }))
        .unwrap();
        let record = to_record(detail).unwrap();
        assert_eq!(record.listing_id, 123);
        assert_eq!(record.details.tags, vec!["a"]);
        assert!(record.details.is_bestseller);
        assert!(record.details.materials.is_empty());
        assert!(!record.details.is_top_rated);
    }
}
