use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Wrapper for Apify API responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

/// Apify actor run metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct RunData {
    pub id: String,
    pub status: String,
    #[serde(rename = "defaultDatasetId")]
    pub default_dataset_id: String,
    #[serde(rename = "startedAt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedAt")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Platform usage billed for the run, when Apify reports it.
    #[serde(rename = "usageTotalUsd", default)]
    pub usage_total_usd: Option<f64>,
}

/// A finished actor run together with the items it produced.
#[derive(Debug, Clone)]
pub struct ActorRun<T> {
    pub run: RunData,
    pub items: Vec<T>,
}

// --- jupri/etsy-scraper ---

/// Sort orders understood by the Etsy scraper's search mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EtsySort {
    /// Etsy's relevance ranking.
    Score,
    Created,
    PriceHigh,
    PriceLow,
}

/// Search-mode input: one ranked result list for a query in one region.
#[derive(Debug, Clone, Serialize)]
pub struct EtsySearchInput {
    pub query: String,
    pub region: String,
    pub sort: EtsySort,
    pub limit: u32,
    #[serde(rename = "filters.location")]
    pub filters_location: String,
}

/// Detail-mode input: listing URLs, newline separated, scraped in one run.
#[derive(Debug, Clone, Serialize)]
pub struct EtsyDetailInput {
    pub query: String,
    pub limit: u32,
}

impl EtsyDetailInput {
    pub fn for_urls(urls: &[String]) -> Self {
        Self {
            query: urls.join("\n"),
            limit: urls.len() as u32,
        }
    }
}

/// A listing as returned by a search run. Only the fields the sampler
/// needs are typed; the full record is kept in `raw`.
#[derive(Debug, Clone, Deserialize)]
pub struct EtsyListing {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub listing_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub shop_id: Option<String>,
    /// Some runs spell the shop id in camel case.
    #[serde(rename = "shopId", default, deserialize_with = "lenient_string")]
    pub shop_id_alt: Option<String>,
    #[serde(default)]
    pub shop_name: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub listing_price: Option<f64>,
    #[serde(default)]
    pub has_star_seller_signal: Option<bool>,
    #[serde(default)]
    pub is_in_merch_library: Option<bool>,
    #[serde(default)]
    pub is_top_rated: Option<bool>,
    #[serde(default)]
    pub is_bestseller: Option<bool>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub shop_average_rating: Option<f64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub shop_total_rating_count: Option<i64>,
    #[serde(skip)]
    pub raw: Value,
}

impl EtsyListing {
    /// Parse a dataset item, keeping the untouched JSON alongside.
    pub fn from_value(value: Value) -> crate::Result<Self> {
        let mut listing: EtsyListing = serde_json::from_value(value.clone())?;
        listing.raw = value;
        Ok(listing)
    }

    /// Listing URL, whichever spelling the run used.
    pub fn target_url(&self) -> Option<&str> {
        first_non_empty([&self.url, &self.listing_url])
    }

    /// Grouping key for per-shop caps: shop id (either spelling), then shop name.
    pub fn owner_key(&self) -> Option<&str> {
        first_non_empty([&self.shop_id, &self.shop_id_alt, &self.shop_name])
    }

    pub fn effective_price(&self) -> Option<f64> {
        self.price.or(self.listing_price)
    }
}

/// Detail fields scraped for one listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EtsyListingDetail {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub listing_id: Option<i64>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub materials: Option<Vec<String>>,
    #[serde(default)]
    pub category_tags: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub who_made: Option<String>,
    #[serde(default)]
    pub when_made: Option<String>,
    #[serde(default)]
    pub has_star_seller_signal: Option<bool>,
    #[serde(default)]
    pub is_bestseller: Option<bool>,
    #[serde(default)]
    pub is_bestseller_by_fixed_qty_category_l3: Option<bool>,
    #[serde(default)]
    pub is_bestseller_by_fixed_qty_category_leaf: Option<bool>,
    #[serde(default)]
    pub is_made_to_order: Option<bool>,
    #[serde(default)]
    pub is_top_rated: Option<bool>,
    #[serde(default)]
    pub free_shipping_countries: Option<Vec<String>>,
    #[serde(default)]
    pub free_shipping_data: Option<Value>,
    #[serde(default)]
    pub item_details: Option<Vec<Value>>,
}

impl EtsyListingDetail {
    /// Parse a detail dataset item. The scraper sometimes nests the
    /// listing under a `listing` key and sometimes returns it flat.
    pub fn from_value(value: Value) -> crate::Result<Self> {
        let inner = match value {
            Value::Object(mut map) => match map.remove("listing") {
                Some(listing @ Value::Object(_)) => listing,
                Some(other) => {
                    map.insert("listing".to_string(), other);
                    Value::Object(map)
                }
                None => Value::Object(map),
            },
            other => other,
        };
        Ok(serde_json::from_value(inner)?)
    }
}

fn first_non_empty<const N: usize>(fields: [&Option<String>; N]) -> Option<&str> {
    fields
        .into_iter()
        .filter_map(|f| f.as_deref())
        .find(|v| !v.trim().is_empty())
}

// Etsy ids and prices show up as numbers or strings depending on the run.

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}
