pub mod error;
pub mod types;

pub use error::{ApifyError, Result};
pub use types::{
    ActorRun, EtsyDetailInput, EtsyListing, EtsyListingDetail, EtsySearchInput, EtsySort,
    RunData,
};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use types::ApiResponse;

const BASE_URL: &str = "https://api.apify.com/v2";

/// Actor ID for jupri/etsy-scraper (search and detail modes).
pub const ETSY_SCRAPER: &str = "jupri~etsy-scraper";

pub struct ApifyClient {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl ApifyClient {
    pub fn new(token: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            token,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Start an actor run. Returns immediately with run metadata.
    pub async fn start_run<I: Serialize + ?Sized>(&self, actor_id: &str, input: &I) -> Result<RunData> {
        let url = format!("{}/acts/{}/runs", self.base_url, actor_id);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(input)
            .send()
            .await?;

        let resp = check_status(resp).await?;
        let api_resp: ApiResponse<RunData> = resp.json().await?;
        Ok(api_resp.data)
    }

    /// Poll until a run completes. Uses `waitForFinish=60` for efficient long-polling.
    pub async fn wait_for_run(&self, run_id: &str) -> Result<RunData> {
        loop {
            let url = format!("{}/actor-runs/{}?waitForFinish=60", self.base_url, run_id);
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.token)
                .send()
                .await?;

            let resp = check_status(resp).await?;
            let api_resp: ApiResponse<RunData> = resp.json().await?;
            match api_resp.data.status.as_str() {
                "SUCCEEDED" => return Ok(api_resp.data),
                "FAILED" | "ABORTED" | "TIMED-OUT" => {
                    return Err(ApifyError::RunFailed(api_resp.data.status));
                }
                _ => {
                    tracing::debug!(run_id, status = %api_resp.data.status, "Run still in progress");
                    continue;
                }
            }
        }
    }

    /// Fetch dataset items from a completed run.
    pub async fn get_dataset_items<T: DeserializeOwned>(&self, dataset_id: &str) -> Result<Vec<T>> {
        let url = format!("{}/datasets/{}/items?format=json", self.base_url, dataset_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let resp = check_status(resp).await?;
        let items: Vec<T> = resp.json().await?;
        Ok(items)
    }

    /// Run an actor end-to-end: start run, poll, fetch results.
    pub async fn call_actor<I, T>(&self, actor_id: &str, input: &I) -> Result<ActorRun<T>>
    where
        I: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let run = self.start_run(actor_id, input).await?;
        tracing::info!(actor_id, run_id = %run.id, "Apify run started, polling for completion");

        let completed = self.wait_for_run(&run.id).await?;
        tracing::info!(
            run_id = %completed.id,
            dataset_id = %completed.default_dataset_id,
            "Run completed, fetching results"
        );

        let items: Vec<T> = self.get_dataset_items(&completed.default_dataset_id).await?;
        Ok(ActorRun {
            run: completed,
            items,
        })
    }

    /// One ranked Etsy search list. Items that fail to parse are dropped.
    pub async fn search_etsy(&self, input: &EtsySearchInput) -> Result<ActorRun<EtsyListing>> {
        tracing::info!(query = %input.query, region = %input.region, sort = ?input.sort, limit = input.limit, "Starting Etsy search scrape");

        let raw: ActorRun<Value> = self.call_actor(ETSY_SCRAPER, input).await?;
        let mut listings = Vec::with_capacity(raw.items.len());
        for item in raw.items {
            match EtsyListing::from_value(item) {
                Ok(listing) => listings.push(listing),
                Err(e) => tracing::warn!(error = %e, "Skipping unparseable search item"),
            }
        }
        tracing::info!(count = listings.len(), requested = input.limit, "Fetched Etsy listings");

        Ok(ActorRun {
            run: raw.run,
            items: listings,
        })
    }

    /// Scrape listing details for a batch of URLs in a single run.
    /// Items without a `listing_id` can't be matched back and are dropped.
    pub async fn scrape_etsy_details(&self, urls: &[String]) -> Result<ActorRun<EtsyListingDetail>> {
        tracing::info!(urls = urls.len(), "Starting Etsy detail scrape");

        let input = EtsyDetailInput::for_urls(urls);
        let raw: ActorRun<Value> = self.call_actor(ETSY_SCRAPER, &input).await?;
        let mut details = Vec::with_capacity(raw.items.len());
        for item in raw.items {
            match EtsyListingDetail::from_value(item) {
                Ok(detail) if detail.listing_id.is_some() => details.push(detail),
                Ok(_) => tracing::warn!("Skipping detail item without listing_id"),
                Err(e) => tracing::warn!(error = %e, "Skipping unparseable detail item"),
            }
        }
        tracing::info!(count = details.len(), "Fetched listing details");

        Ok(ActorRun {
            run: raw.run,
            items: details,
        })
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApifyError::Api {
            status: status.as_u16(),
            message: body,
        });
    }
    Ok(resp)
}
