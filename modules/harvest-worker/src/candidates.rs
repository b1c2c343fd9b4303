// CandidateSource: one ranked search list per (query, country, facet).

use anyhow::Result;
use apify_client::{ApifyClient, EtsyListing, EtsySearchInput, EtsySort};
use async_trait::async_trait;

use harvest_common::{Country, Facet, SampleCandidate, SellerSignals};

#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Up to `limit` ranked candidates. Rank is the 1-based list position.
    async fn search(
        &self,
        query: &str,
        country: &Country,
        facet: Facet,
        limit: usize,
    ) -> Result<Vec<SampleCandidate>>;
}

pub fn sort_for(facet: Facet) -> EtsySort {
    match facet {
        Facet::Relevance => EtsySort::Score,
        Facet::MostRecent => EtsySort::Created,
        Facet::HighPrice => EtsySort::PriceHigh,
        Facet::LowPrice => EtsySort::PriceLow,
    }
}

/// Etsy search through the Apify scraper.
pub struct ApifyCandidateSource {
    client: ApifyClient,
}

impl ApifyCandidateSource {
    pub fn new(client: ApifyClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CandidateSource for ApifyCandidateSource {
    async fn search(
        &self,
        query: &str,
        country: &Country,
        facet: Facet,
        limit: usize,
    ) -> Result<Vec<SampleCandidate>> {
        let input = EtsySearchInput {
            query: query.to_string(),
            region: country.code.clone(),
            sort: sort_for(facet),
            limit: limit as u32,
            filters_location: country.code.clone(),
        };
        let run = self.client.search_etsy(&input).await?;
        Ok(run
            .items
            .into_iter()
            .enumerate()
            .map(|(i, listing)| to_candidate(facet, i + 1, listing))
            .collect())
    }
}

pub fn to_candidate(facet: Facet, rank: usize, listing: EtsyListing) -> SampleCandidate {
    SampleCandidate {
        facet,
        rank,
        url: listing.target_url().map(str::to_string),
        owner: listing.owner_key().map(str::to_string),
        listing_id: listing.listing_id,
        price: listing.effective_price(),
        signals: SellerSignals {
            star_seller: listing.has_star_seller_signal.unwrap_or(false),
            etsy_pick: listing.is_in_merch_library.unwrap_or(false),
            top_rated: listing.is_top_rated.unwrap_or(false),
            bestseller: listing.is_bestseller.unwrap_or(false),
            shop_rating: listing.shop_average_rating.unwrap_or(0.0),
            shop_reviews: listing.shop_total_rating_count.unwrap_or(0),
        },
        payload: listing.raw,
    }
}
