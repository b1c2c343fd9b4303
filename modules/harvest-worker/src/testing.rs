// Test doubles for the worker's two remote seams.
//
// - ScriptedBatchClient (RemoteBatchClient): queued outcomes, records every call
// - StaticCandidateSource (CandidateSource): fixed lists per (country, facet)
//
// Plus helpers for building work items and candidates.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use harvest_common::{
    Country, Facet, ListingDetails, ListingId, NewWorkItem, PerformanceTag, PriceRange,
    ResultRecord, SampleCandidate, SellerSignals, WorkItem,
};

use crate::batch_client::{BatchError, BatchRun, RemoteBatchClient};
use crate::candidates::CandidateSource;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Listing id encoded at the end of a `/listing/{id}` URL.
pub fn listing_id_from_url(url: &str) -> Option<ListingId> {
    url.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

pub fn listing_url(id: ListingId) -> String {
    format!("https://www.etsy.com/listing/{id}")
}

pub fn work_item(id: ListingId) -> WorkItem {
    WorkItem {
        listing_id: id,
        url: listing_url(id),
        category: Some("rings".into()),
        country: Some("US".into()),
        priority: false,
    }
}

pub fn new_work_item(id: ListingId) -> NewWorkItem {
    NewWorkItem {
        listing_id: id,
        url: listing_url(id),
        category: Some("rings".into()),
        category_url: None,
        country: Some("US".into()),
        search_term: Some("rings".into()),
        facet: Some(Facet::Relevance),
        search_rank: None,
        search_page: None,
        shop: None,
        price_range: PriceRange::Unknown,
        performance: PerformanceTag::Low,
        is_star_seller: false,
        is_etsy_pick: false,
        is_bestseller: false,
        shop_review_count: 0,
        payload: serde_json::Value::Null,
    }
}

/// A detail record whose tags identify the listing.
pub fn record_for(id: ListingId) -> ResultRecord {
    ResultRecord {
        listing_id: id,
        details: ListingDetails {
            tags: vec![format!("tag-{id}")],
            ..Default::default()
        },
    }
}

/// What a scripted call does.
#[derive(Debug, Clone)]
pub enum Scripted {
    /// Return records for every target.
    All,
    /// Return records for the first `n` targets only.
    First(usize),
    /// Return exactly these records.
    Records(Vec<ResultRecord>),
    Fail(BatchError),
}

/// RemoteBatchClient with queued outcomes. Once the queue is empty every
/// call behaves like `Scripted::All`. Target lists of every call are kept.
pub struct ScriptedBatchClient {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<Vec<String>>>,
    cost_usd: Option<f64>,
}

impl Default for ScriptedBatchClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBatchClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            cost_usd: None,
        }
    }

    pub fn then(self, step: Scripted) -> Self {
        lock(&self.script).push_back(step);
        self
    }

    /// Fail the next `n` calls with the same error.
    pub fn fail_times(self, n: usize, error: BatchError) -> Self {
        for _ in 0..n {
            lock(&self.script).push_back(Scripted::Fail(error.clone()));
        }
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        lock(&self.calls).clone()
    }

    /// Every target submitted, across all calls, in order.
    pub fn submitted(&self) -> Vec<String> {
        lock(&self.calls).iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl RemoteBatchClient for ScriptedBatchClient {
    async fn run_batch(&self, targets: &[String]) -> Result<BatchRun, BatchError> {
        let n = {
            let mut calls = lock(&self.calls);
            calls.push(targets.to_vec());
            calls.len()
        };
        let step = lock(&self.script).pop_front().unwrap_or(Scripted::All);
        let ids = targets.iter().filter_map(|t| listing_id_from_url(t));
        let records = match step {
            Scripted::All => ids.map(record_for).collect(),
            Scripted::First(k) => ids.take(k).map(record_for).collect(),
            Scripted::Records(records) => records,
            Scripted::Fail(e) => return Err(e),
        };
        Ok(BatchRun {
            records,
            run_id: Some(format!("run-{n}")),
            cost_usd: self.cost_usd,
        })
    }
}

/// CandidateSource serving fixed lists keyed by (country code, facet).
/// Unregistered keys return an empty list; failing keys return an error.
#[derive(Default)]
pub struct StaticCandidateSource {
    lists: HashMap<(String, Facet), Vec<SampleCandidate>>,
    failing: Vec<(String, Facet)>,
    requests: Mutex<Vec<(String, Facet, usize)>>,
}

impl StaticCandidateSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ranked list; ranks are assigned from list order.
    pub fn on(mut self, country: &str, facet: Facet, mut list: Vec<SampleCandidate>) -> Self {
        for (i, c) in list.iter_mut().enumerate() {
            c.facet = facet;
            c.rank = i + 1;
        }
        self.lists.insert((country.to_string(), facet), list);
        self
    }

    pub fn failing(mut self, country: &str, facet: Facet) -> Self {
        self.failing.push((country.to_string(), facet));
        self
    }

    /// (country, facet, limit) of every search issued.
    pub fn requests(&self) -> Vec<(String, Facet, usize)> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl CandidateSource for StaticCandidateSource {
    async fn search(
        &self,
        _query: &str,
        country: &Country,
        facet: Facet,
        limit: usize,
    ) -> Result<Vec<SampleCandidate>> {
        lock(&self.requests).push((country.code.clone(), facet, limit));
        let key = (country.code.clone(), facet);
        if self.failing.contains(&key) {
            return Err(anyhow!("StaticCandidateSource: {} {} unavailable", country.code, facet));
        }
        let mut list = self.lists.get(&key).cloned().unwrap_or_default();
        list.truncate(limit);
        Ok(list)
    }
}

/// A search candidate for listing `id` sold by `shop`.
pub fn candidate(id: ListingId, shop: &str) -> SampleCandidate {
    SampleCandidate {
        facet: Facet::Relevance,
        rank: 1,
        url: Some(listing_url(id)),
        owner: Some(shop.to_string()),
        listing_id: Some(id),
        price: Some(25.0),
        signals: SellerSignals::default(),
        payload: serde_json::json!({ "listing_id": id }),
    }
}
