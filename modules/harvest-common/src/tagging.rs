//! Coarse analysis tags attached to sampled listings.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceRange {
    Unknown,
    Budget,
    Low,
    Medium,
    High,
    Premium,
}

impl PriceRange {
    pub fn from_price(price: Option<f64>) -> Self {
        match price {
            None => Self::Unknown,
            Some(p) if p <= 0.0 || p.is_nan() => Self::Unknown,
            Some(p) if p < 10.0 => Self::Budget,
            Some(p) if p < 50.0 => Self::Low,
            Some(p) if p < 100.0 => Self::Medium,
            Some(p) if p < 500.0 => Self::High,
            Some(_) => Self::Premium,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Budget => "budget",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Premium => "premium",
        }
    }
}

impl fmt::Display for PriceRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shop-level signals reported alongside a search result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SellerSignals {
    pub star_seller: bool,
    pub etsy_pick: bool,
    pub top_rated: bool,
    pub bestseller: bool,
    pub shop_rating: f64,
    pub shop_reviews: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerformanceTag {
    High,
    Medium,
    Low,
}

impl PerformanceTag {
    /// Ratings are shop-level; the scraper doesn't report per-listing ratings.
    pub fn from_signals(s: &SellerSignals) -> Self {
        if s.star_seller || (s.top_rated && s.shop_rating >= 4.8 && s.shop_reviews > 100) {
            return Self::High;
        }
        if s.shop_rating >= 4.5 && s.shop_reviews > 20 {
            return Self::Medium;
        }
        if s.shop_reviews < 10 || s.shop_rating < 4.5 {
            return Self::Low;
        }
        Self::Medium
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for PerformanceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
