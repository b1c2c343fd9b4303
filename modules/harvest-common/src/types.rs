use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;
use crate::tagging::{PerformanceTag, PriceRange};

/// Business key of a listing. Stable across re-sampling.
pub type ListingId = i64;

// --- Processing markers ---

/// Lifecycle of a work item's processing marker.
///
/// `Unclaimed → Claimed → {Done | DoneEmpty | Failed}`; never backwards within a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Unclaimed,
    Claimed,
    Done,
    DoneEmpty,
    Failed,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 5] = [
        ItemStatus::Unclaimed,
        ItemStatus::Claimed,
        ItemStatus::Done,
        ItemStatus::DoneEmpty,
        ItemStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unclaimed => "unclaimed",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::DoneEmpty => "done_empty",
            Self::Failed => "failed",
        }
    }

    /// Done, done-empty or failed.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Done | Self::DoneEmpty | Self::Failed)
    }

    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        match self {
            Self::Unclaimed => next == Self::Claimed,
            Self::Claimed => next.is_settled(),
            _ => false,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| HarvestError::Validation(format!("unknown item status: {s}")))
    }
}

/// Processing marker attached to every work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMarker {
    pub status: ItemStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub result_applied_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Sequence number of the batch that settled the item.
    pub batch_seq: Option<i64>,
    /// How many times the item has been put back into play by a requeue.
    pub attempts: i32,
}

impl Default for ProcessingMarker {
    fn default() -> Self {
        Self {
            status: ItemStatus::Unclaimed,
            claimed_by: None,
            claimed_at: None,
            result_applied_at: None,
            failure_reason: None,
            batch_seq: None,
            attempts: 0,
        }
    }
}

// --- Work items ---

/// A listing waiting for (or done with) detail scraping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub listing_id: ListingId,
    /// Handed verbatim to the remote scraper.
    pub url: String,
    pub category: Option<String>,
    pub country: Option<String>,
    /// Scraped ahead of the rest by a priority pass.
    pub priority: bool,
}

/// Shop review count at which a listing counts as priority.
pub const PRIORITY_SHOP_REVIEWS: i64 = 500;

/// A sampled listing ready for ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub listing_id: ListingId,
    pub url: String,
    pub category: Option<String>,
    pub category_url: Option<String>,
    pub country: Option<String>,
    pub search_term: Option<String>,
    pub facet: Option<Facet>,
    pub search_rank: Option<i32>,
    pub search_page: Option<i32>,
    pub shop: Option<String>,
    pub price_range: PriceRange,
    pub performance: PerformanceTag,
    pub is_star_seller: bool,
    pub is_etsy_pick: bool,
    pub is_bestseller: bool,
    pub shop_review_count: i64,
    /// The untouched search record.
    pub payload: serde_json::Value,
}

impl NewWorkItem {
    /// Star seller, bestseller, high performer or a well-reviewed shop.
    ///
    /// `0002_priority_listings.sql` computes the same rule as a generated column.
    pub fn is_priority(&self) -> bool {
        self.is_star_seller
            || self.is_bestseller
            || self.performance == PerformanceTag::High
            || self.shop_review_count >= PRIORITY_SHOP_REVIEWS
    }

    pub fn to_work_item(&self) -> WorkItem {
        WorkItem {
            listing_id: self.listing_id,
            url: self.url.clone(),
            category: self.category.clone(),
            country: self.country.clone(),
            priority: self.is_priority(),
        }
    }
}

/// Selection criteria shared by store queries. Empty filter = everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    pub category: Option<String>,
    pub country: Option<String>,
    /// Only items flagged `priority`.
    pub priority_only: bool,
}

impl ItemFilter {
    pub fn matches(&self, item: &WorkItem) -> bool {
        let category_ok = self
            .category
            .as_ref()
            .map_or(true, |c| item.category.as_deref() == Some(c.as_str()));
        let country_ok = self
            .country
            .as_ref()
            .map_or(true, |c| item.country.as_deref() == Some(c.as_str()));
        category_ok && country_ok && (!self.priority_only || item.priority)
    }
}

/// Outcome of an ingestion call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertStats {
    pub inserted: u64,
    /// Already present by listing id or URL; left untouched.
    pub existing: u64,
}

// --- Remote results ---

/// Detail fields written onto a listing when its scrape returns data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingDetails {
    pub tags: Vec<String>,
    pub materials: Vec<String>,
    pub category_tags: Vec<String>,
    pub description: Option<String>,
    pub who_made: Option<String>,
    pub when_made: Option<String>,
    pub has_star_seller_signal: bool,
    pub is_bestseller: bool,
    pub is_bestseller_by_fixed_qty_category_l3: bool,
    pub is_bestseller_by_fixed_qty_category_leaf: bool,
    pub is_made_to_order: bool,
    pub is_top_rated: bool,
    pub free_shipping_countries: Vec<String>,
    pub free_shipping_data: Option<serde_json::Value>,
    pub item_details: Vec<serde_json::Value>,
}

/// One record returned by the remote endpoint, keyed by business id.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    pub listing_id: ListingId,
    pub details: ListingDetails,
}

// --- Sampling ---

/// A ranked query strategy used to diversify a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Relevance,
    MostRecent,
    HighPrice,
    LowPrice,
}

impl Facet {
    /// Merge order; earlier facets win URL ties.
    pub const PRIORITY: [Facet; 4] = [
        Facet::Relevance,
        Facet::MostRecent,
        Facet::HighPrice,
        Facet::LowPrice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relevance => "relevance",
            Self::MostRecent => "most_recent",
            Self::HighPrice => "high_price",
            Self::LowPrice => "low_price",
        }
    }

    pub fn priority(&self) -> usize {
        Facet::PRIORITY
            .iter()
            .position(|f| f == self)
            .unwrap_or(Facet::PRIORITY.len())
    }
}

impl fmt::Display for Facet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw record from one facet's ranked result list.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleCandidate {
    pub facet: Facet,
    /// 1-based position in the facet's result list.
    pub rank: usize,
    pub url: Option<String>,
    pub owner: Option<String>,
    pub listing_id: Option<ListingId>,
    pub price: Option<f64>,
    pub signals: crate::tagging::SellerSignals,
    pub payload: serde_json::Value,
}

/// A candidate that survived dedup and the owner cap.
#[derive(Debug, Clone, PartialEq)]
pub struct SampledListing {
    pub url: String,
    pub owner: String,
    /// Result page the candidate appeared on (1-based).
    pub page: usize,
    pub candidate: SampleCandidate,
}

/// A sampling group (Etsy region).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    pub code: String,
    pub name: String,
}

impl Country {
    pub fn new(code: &str, name: &str) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
        }
    }
}

pub fn default_countries() -> Vec<Country> {
    vec![
        Country::new("US", "United States"),
        Country::new("GB", "United Kingdom"),
        Country::new("DE", "Germany"),
        Country::new("AU", "Australia"),
        Country::new("CA", "Canada"),
    ]
}

/// Category slug from a category URL: last path segment, query and
/// trailing comma-suffix stripped.
pub fn category_slug(category_url: &str) -> String {
    let path = category_url.split(['?', '#']).next().unwrap_or(category_url);
    let last = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path);
    let slug = last.split(',').next().unwrap_or(last);
    if slug.is_empty() {
        category_url.to_string()
    } else {
        slug.to_string()
    }
}

/// Search term derived from a category slug (`wall-art` → `wall art`).
pub fn search_term(slug: &str) -> String {
    slug.replace('-', " ")
}

// --- Sharding ---

/// How a snapshot is split across shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// `shard[k] = items[k·⌈n/K⌉ .. (k+1)·⌈n/K⌉]`
    #[default]
    Contiguous,
    /// `item[i] → shard[i mod K]`
    RoundRobin,
}

impl FromStr for PartitionStrategy {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contiguous" => Ok(Self::Contiguous),
            "round_robin" | "round-robin" => Ok(Self::RoundRobin),
            other => Err(HarvestError::Validation(format!(
                "unknown partition strategy: {other}"
            ))),
        }
    }
}

/// Identity and assignment of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardDescriptor {
    /// Recorded as `claimed_by` on every item this worker claims.
    pub worker_id: String,
    pub worker_index: usize,
    pub shard_count: usize,
    /// Sub-range (item positions) of this worker's shard to process.
    pub resume_range: Option<(usize, usize)>,
}

impl ShardDescriptor {
    pub fn new(worker_id: impl Into<String>, worker_index: usize, shard_count: usize) -> Self {
        Self {
            worker_id: worker_id.into(),
            worker_index,
            shard_count,
            resume_range: None,
        }
    }

    pub fn with_resume_range(mut self, start: usize, end: usize) -> Self {
        self.resume_range = Some((start, end));
        self
    }

    pub fn validate(&self) -> Result<(), HarvestError> {
        if self.shard_count == 0 {
            return Err(HarvestError::Validation("shard count must be at least 1".into()));
        }
        if self.worker_index >= self.shard_count {
            return Err(HarvestError::Validation(format!(
                "worker index {} out of range for {} shards",
                self.worker_index, self.shard_count
            )));
        }
        if self.worker_id.trim().is_empty() {
            return Err(HarvestError::Validation("worker id must not be empty".into()));
        }
        if let Some((start, end)) = self.resume_range {
            if start > end {
                return Err(HarvestError::Validation(format!(
                    "resume range start {start} is after end {end}"
                )));
            }
        }
        Ok(())
    }
}

// --- Reporting ---

/// Item counts per marker status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub unclaimed: u64,
    pub claimed: u64,
    pub done: u64,
    pub done_empty: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: ItemStatus, n: u64) {
        match status {
            ItemStatus::Unclaimed => self.unclaimed += n,
            ItemStatus::Claimed => self.claimed += n,
            ItemStatus::Done => self.done += n,
            ItemStatus::DoneEmpty => self.done_empty += n,
            ItemStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.unclaimed + self.claimed + self.done + self.done_empty + self.failed
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "done={} done_empty={} failed={} claimed={} unclaimed={} total={}",
            self.done,
            self.done_empty,
            self.failed,
            self.claimed,
            self.unclaimed,
            self.total()
        )
    }
}

/// Per-worker settled counts, for the progress view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCounts {
    pub worker_id: String,
    pub counts: StatusCounts,
    pub last_applied_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_only_move_forward() {
        use ItemStatus::*;
        assert!(Unclaimed.can_transition_to(Claimed));
        assert!(Claimed.can_transition_to(Done));
        assert!(Claimed.can_transition_to(DoneEmpty));
        assert!(Claimed.can_transition_to(Failed));

        assert!(!Unclaimed.can_transition_to(Done));
        assert!(!Done.can_transition_to(Claimed));
        assert!(!Failed.can_transition_to(Unclaimed));
        assert!(!Claimed.can_transition_to(Unclaimed));
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in ItemStatus::ALL {
            assert_eq!(status.as_str().parse::<ItemStatus>().unwrap(), status);
        }
        assert!("pending".parse::<ItemStatus>().is_err());
    }

    #[test]
    fn category_slug_handles_etsy_urls() {
        assert_eq!(
            category_slug("https://www.etsy.com/c/home-and-living/home-decor/wall-art"),
            "wall-art"
        );
        assert_eq!(
            category_slug("https://www.etsy.com/c/jewelry/rings/?ref=catnav"),
            "rings"
        );
        assert_eq!(
            category_slug("https://www.etsy.com/c/art/prints,other"),
            "prints"
        );
        assert_eq!(search_term("wall-art"), "wall art");
    }

    #[test]
    fn descriptor_validation() {
        assert!(ShardDescriptor::new("w0", 0, 1).validate().is_ok());
        assert!(ShardDescriptor::new("w0", 0, 0).validate().is_err());
        assert!(ShardDescriptor::new("w3", 3, 3).validate().is_err());
        assert!(ShardDescriptor::new(" ", 0, 2).validate().is_err());
        assert!(ShardDescriptor::new("w1", 1, 2)
            .with_resume_range(10, 5)
            .validate()
            .is_err());
    }

    #[test]
    fn filter_matches_on_set_fields_only() {
        let item = WorkItem {
            listing_id: 1,
            url: "u".into(),
            category: Some("rings".into()),
            country: Some("US".into()),
            priority: false,
        };
        assert!(ItemFilter::default().matches(&item));
        assert!(ItemFilter {
            country: Some("US".into()),
            ..Default::default()
        }
        .matches(&item));
        assert!(!ItemFilter {
            category: Some("prints".into()),
            ..Default::default()
        }
        .matches(&item));

        let priority = ItemFilter {
            priority_only: true,
            ..Default::default()
        };
        assert!(!priority.matches(&item));
        assert!(priority.matches(&WorkItem {
            priority: true,
            ..item
        }));
    }

    #[test]
    fn priority_listings_need_one_strong_signal() {
        let base = NewWorkItem {
            listing_id: 1,
            url: "u".into(),
            category: None,
            category_url: None,
            country: None,
            search_term: None,
            facet: None,
            search_rank: None,
            search_page: None,
            shop: None,
            price_range: PriceRange::Unknown,
            performance: PerformanceTag::Medium,
            is_star_seller: false,
            is_etsy_pick: true,
            is_bestseller: false,
            shop_review_count: PRIORITY_SHOP_REVIEWS - 1,
            payload: serde_json::Value::Null,
        };
        assert!(!base.is_priority());
        assert!(!base.to_work_item().priority);

        let well_reviewed = NewWorkItem {
            shop_review_count: PRIORITY_SHOP_REVIEWS,
            ..base.clone()
        };
        assert!(well_reviewed.to_work_item().priority);
        assert!(NewWorkItem {
            is_bestseller: true,
            ..base.clone()
        }
        .is_priority());
        assert!(NewWorkItem {
            performance: PerformanceTag::High,
            ..base
        }
        .is_priority());
    }

    #[test]
    fn facet_priority_follows_merge_order() {
        assert_eq!(Facet::Relevance.priority(), 0);
        assert_eq!(Facet::LowPrice.priority(), 3);
        assert_eq!(Facet::MostRecent.to_string(), "most_recent");
    }
}
