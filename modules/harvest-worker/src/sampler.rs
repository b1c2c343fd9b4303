//! Facet-diversified sampling of listings per (category, country) group.
//!
//! Each group issues one ranked search per facet, merges the lists in facet
//! priority order, drops repeat URLs and caps how many listings any single
//! shop contributes. Accepted listings are tagged and ingested as work items.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{info, warn};

use harvest_common::{
    category_slug, search_term, Country, Facet, NewWorkItem, PerformanceTag, PriceRange,
    SampleCandidate, SampledListing, SamplingSettings,
};
use harvest_store::WorkStore;

use crate::candidates::CandidateSource;
use crate::error::Result;

/// Owner key for candidates that carry no shop id or name.
pub const UNKNOWN_OWNER: &str = "unknown";

/// Merge facet lists into one accepted sample.
///
/// Candidates are visited facet by facet in priority order, each list in rank
/// order. A URL is accepted once; an owner stops contributing after `owner_cap`
/// accepted listings. Candidates without a URL are dropped.
pub fn merge_candidates(
    mut candidates: Vec<SampleCandidate>,
    owner_cap: usize,
    page_size: usize,
) -> Vec<SampledListing> {
    candidates.sort_by_key(|c| (c.facet.priority(), c.rank));

    let page_size = page_size.max(1);
    let mut seen_urls: HashSet<String> = HashSet::new();
    let mut per_owner: HashMap<String, usize> = HashMap::new();
    let mut accepted = Vec::new();

    for candidate in candidates {
        let Some(url) = candidate.url.clone().filter(|u| !u.is_empty()) else {
            continue;
        };
        if seen_urls.contains(&url) {
            continue;
        }
        let owner = candidate
            .owner
            .clone()
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| UNKNOWN_OWNER.to_string());
        let count = per_owner.entry(owner.clone()).or_insert(0);
        if *count >= owner_cap {
            continue;
        }
        *count += 1;
        seen_urls.insert(url.clone());

        let page = candidate.rank.saturating_sub(1) / page_size + 1;
        accepted.push(SampledListing {
            url,
            owner,
            page,
            candidate,
        });
    }
    accepted
}

/// One (category, country) sample.
#[derive(Debug, Clone)]
pub struct GroupSample {
    pub country: Country,
    /// Candidates returned across all facets, before dedup and caps.
    pub fetched: usize,
    pub accepted: Vec<SampledListing>,
    pub facet_errors: Vec<(Facet, String)>,
}

impl GroupSample {
    /// Accepted listings per facet, in priority order.
    pub fn facet_counts(&self) -> Vec<(Facet, usize)> {
        Facet::PRIORITY
            .iter()
            .map(|f| {
                let n = self.accepted.iter().filter(|l| l.candidate.facet == *f).count();
                (*f, n)
            })
            .collect()
    }
}

/// Outcome of sampling and ingesting one category across all groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryReport {
    pub category: String,
    pub groups: usize,
    pub accepted: usize,
    /// Accepted listings without a listing id; they can't be tracked.
    pub dropped: usize,
    pub inserted: u64,
    pub existing: u64,
    pub facet_errors: usize,
}

pub struct SamplingAggregator {
    source: Arc<dyn CandidateSource>,
    settings: SamplingSettings,
}

impl SamplingAggregator {
    pub fn new(source: Arc<dyn CandidateSource>, settings: SamplingSettings) -> Self {
        Self { source, settings }
    }

    /// Query every facet for one group and merge. A failing facet contributes
    /// nothing and is recorded; it never aborts the group.
    pub async fn sample_group(&self, query: &str, country: &Country) -> GroupSample {
        let per_group = self.settings.per_group;
        let mut candidates = Vec::new();
        let mut facet_errors = Vec::new();

        for (i, plan) in self.settings.facets.iter().enumerate() {
            if i > 0 && !self.settings.facet_delay().is_zero() {
                tokio::time::sleep(self.settings.facet_delay()).await;
            }
            let limit = plan.request_limit(per_group);
            match self.source.search(query, country, plan.facet, limit).await {
                Ok(found) => {
                    info!(
                        query,
                        country = %country.code,
                        facet = %plan.facet,
                        requested = limit,
                        returned = found.len(),
                        "Facet fetched"
                    );
                    candidates.extend(found);
                }
                Err(e) => {
                    warn!(query, country = %country.code, facet = %plan.facet, error = %e, "Facet failed");
                    facet_errors.push((plan.facet, e.to_string()));
                }
            }
        }

        let fetched = candidates.len();
        let accepted = merge_candidates(candidates, self.settings.owner_cap, self.settings.page_size);
        GroupSample {
            country: country.clone(),
            fetched,
            accepted,
            facet_errors,
        }
    }

    /// Sample a category in every configured country and ingest the results.
    pub async fn sample_category(
        &self,
        category_url: &str,
        store: &dyn WorkStore,
    ) -> Result<CategoryReport> {
        let slug = category_slug(category_url);
        let query = search_term(&slug);
        let mut report = CategoryReport {
            category: slug.clone(),
            ..Default::default()
        };

        for country in &self.settings.countries {
            let group = self.sample_group(&query, country).await;
            let distribution: Vec<String> = group
                .facet_counts()
                .iter()
                .map(|(facet, n)| {
                    let target = self
                        .settings
                        .facets
                        .iter()
                        .find(|p| p.facet == *facet)
                        .map(|p| p.target(self.settings.per_group))
                        .unwrap_or(0);
                    format!("{facet}={n}/{target}")
                })
                .collect();

            let items = work_items(&group, category_url, &slug);
            let stats = store.insert_items(&items).await?;
            info!(
                category = %slug,
                country = %country.code,
                fetched = group.fetched,
                accepted = group.accepted.len(),
                target = self.settings.per_group,
                inserted = stats.inserted,
                existing = stats.existing,
                facets = %distribution.join(" "),
                "Group sampled"
            );

            report.groups += 1;
            report.accepted += group.accepted.len();
            report.dropped += group.accepted.len() - items.len();
            report.inserted += stats.inserted;
            report.existing += stats.existing;
            report.facet_errors += group.facet_errors.len();
        }
        Ok(report)
    }

    /// Sample categories one after another, pausing between them.
    pub async fn sample_categories(
        &self,
        categories: &[String],
        store: &dyn WorkStore,
    ) -> Result<Vec<CategoryReport>> {
        let mut reports = Vec::with_capacity(categories.len());
        for (i, category_url) in categories.iter().enumerate() {
            if i > 0 && !self.settings.category_delay().is_zero() {
                tokio::time::sleep(self.settings.category_delay()).await;
            }
            reports.push(self.sample_category(category_url, store).await?);
        }
        Ok(reports)
    }
}

/// Tag accepted listings of a group as ingestible work items.
pub fn work_items(group: &GroupSample, category_url: &str, slug: &str) -> Vec<NewWorkItem> {
    let mut items = Vec::with_capacity(group.accepted.len());
    for listing in &group.accepted {
        let c = &listing.candidate;
        let Some(listing_id) = c.listing_id else {
            warn!(url = %listing.url, "Sampled listing has no listing_id, dropping");
            continue;
        };
        items.push(NewWorkItem {
            listing_id,
            url: listing.url.clone(),
            category: Some(slug.to_string()),
            category_url: Some(category_url.to_string()),
            country: Some(group.country.code.clone()),
            search_term: Some(search_term(slug)),
            facet: Some(c.facet),
            search_rank: Some(c.rank as i32),
            search_page: Some(listing.page as i32),
            shop: Some(listing.owner.clone()),
            price_range: PriceRange::from_price(c.price),
            performance: PerformanceTag::from_signals(&c.signals),
            is_star_seller: c.signals.star_seller,
            is_etsy_pick: c.signals.etsy_pick,
            is_bestseller: c.signals.bestseller,
            shop_review_count: c.signals.shop_reviews,
            payload: c.payload.clone(),
        });
    }
    items
}

/// Category URLs from a CSV list: first column, `http…` values only.
///
/// Rows may have any number of columns; unreadable rows are skipped.
pub fn parse_category_list(text: &str) -> Vec<String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let mut urls = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable category row");
                continue;
            }
        };
        if let Some(url) = record.get(0).filter(|v| v.starts_with("http")) {
            urls.push(url.to_string());
        }
    }
    urls
}
