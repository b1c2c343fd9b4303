use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::HarvestError;
use crate::types::{default_countries, Country, Facet, PartitionStrategy};

/// Largest batch the detail endpoint accepts in one run.
pub const MAX_BATCH_SIZE: usize = 100;

/// Secrets and connection strings, loaded from the environment.
/// Tunables live in [`HarvestConfig`].
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// One token per Apify account; workers pick `index mod len`.
    pub apify_tokens: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let apify_tokens = parse_tokens(
            std::env::var("APIFY_API_TOKENS").ok().as_deref(),
            std::env::var("APIFY_API_TOKEN").ok().as_deref(),
        );

        let config = Self {
            database_url,
            apify_tokens,
        };
        config.log_redacted();
        Ok(config)
    }

    /// Token for a worker slot, round-robin across configured accounts.
    pub fn apify_token_for(&self, worker_index: usize) -> Option<&str> {
        if self.apify_tokens.is_empty() {
            return None;
        }
        Some(&self.apify_tokens[worker_index % self.apify_tokens.len()])
    }

    pub fn log_redacted(&self) {
        fn preview(val: &str) -> String {
            let n = val.len().min(5);
            format!("{}...({} chars)", &val[..n], val.len())
        }

        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", preview(&self.database_url));
        if self.apify_tokens.is_empty() {
            tracing::info!("  APIFY tokens: <not set>");
        }
        for (i, token) in self.apify_tokens.iter().enumerate() {
            tracing::info!("  APIFY token {}: {}", i + 1, preview(token));
        }
    }
}

fn parse_tokens(list: Option<&str>, single: Option<&str>) -> Vec<String> {
    let mut tokens: Vec<String> = list
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if tokens.is_empty() {
        if let Some(t) = single.map(str::trim).filter(|t| !t.is_empty()) {
            tokens.push(t.to_string());
        }
    }
    tokens
}

/// TOML-backed tunables. Every field has a default, so an absent file
/// or an empty table is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestConfig {
    pub worker: WorkerSettings,
    pub sampling: SamplingSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    pub shard_count: usize,
    pub batch_size: usize,
    pub inter_batch_delay_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Report progress every N batches.
    pub progress_every: usize,
    /// Flat cost assumed when a run reports no usage.
    pub cost_per_batch_usd: f64,
    /// Stop claiming new batches once this much has been spent. 0 = unlimited.
    pub budget_usd: f64,
    pub partition: PartitionStrategy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            shard_count: 1,
            batch_size: 5,
            inter_batch_delay_ms: 2_000,
            max_retries: 3,
            retry_delay_ms: 5_000,
            progress_every: 10,
            cost_per_batch_usd: 0.02,
            budget_usd: 0.0,
            partition: PartitionStrategy::Contiguous,
        }
    }
}

impl WorkerSettings {
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Oversampling plan for one facet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FacetPlan {
    pub facet: Facet,
    /// Fraction of the per-group target this facet should cover.
    pub share: f64,
    /// Extra items requested to absorb dedup and cap losses.
    pub margin: usize,
    /// Minimum request size, so every paid call is a full one.
    pub floor: usize,
}

impl FacetPlan {
    pub fn target(&self, sample_size: usize) -> usize {
        (sample_size as f64 * self.share).floor() as usize
    }

    /// `max(target + margin, floor)`
    pub fn request_limit(&self, sample_size: usize) -> usize {
        (self.target(sample_size) + self.margin).max(self.floor)
    }
}

pub fn default_facet_plans() -> Vec<FacetPlan> {
    vec![
        FacetPlan {
            facet: Facet::Relevance,
            share: 0.45,
            margin: 30,
            floor: 120,
        },
        FacetPlan {
            facet: Facet::MostRecent,
            share: 0.25,
            margin: 25,
            floor: 100,
        },
        FacetPlan {
            facet: Facet::HighPrice,
            share: 0.15,
            margin: 55,
            floor: 100,
        },
        FacetPlan {
            facet: Facet::LowPrice,
            share: 0.15,
            margin: 55,
            floor: 100,
        },
    ]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SamplingSettings {
    /// Target sample size per (category, country) group.
    pub per_group: usize,
    pub owner_cap: usize,
    /// Results per search page, for rank → page.
    pub page_size: usize,
    pub facets: Vec<FacetPlan>,
    pub countries: Vec<Country>,
    pub facet_delay_ms: u64,
    pub category_delay_ms: u64,
    /// Concurrent sampling tasks.
    pub workers: usize,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            per_group: 300,
            owner_cap: 10,
            page_size: 48,
            facets: default_facet_plans(),
            countries: default_countries(),
            facet_delay_ms: 1_500,
            category_delay_ms: 3_000,
            workers: 5,
        }
    }
}

impl SamplingSettings {
    pub fn facet_delay(&self) -> Duration {
        Duration::from_millis(self.facet_delay_ms)
    }

    pub fn category_delay(&self) -> Duration {
        Duration::from_millis(self.category_delay_ms)
    }
}

impl HarvestConfig {
    pub fn validate(&self) -> std::result::Result<(), HarvestError> {
        let w = &self.worker;
        if w.shard_count == 0 {
            return Err(HarvestError::Config("worker.shard_count must be at least 1".into()));
        }
        if w.batch_size == 0 || w.batch_size > MAX_BATCH_SIZE {
            return Err(HarvestError::Config(format!(
                "worker.batch_size must be within 1..={MAX_BATCH_SIZE}, got {}",
                w.batch_size
            )));
        }
        if w.max_retries == 0 {
            return Err(HarvestError::Config("worker.max_retries must be at least 1".into()));
        }
        if w.cost_per_batch_usd < 0.0 || w.budget_usd < 0.0 {
            return Err(HarvestError::Config("worker costs must not be negative".into()));
        }
        if w.progress_every == 0 {
            return Err(HarvestError::Config("worker.progress_every must be at least 1".into()));
        }

        let s = &self.sampling;
        if s.owner_cap == 0 {
            return Err(HarvestError::Config("sampling.owner_cap must be at least 1".into()));
        }
        if s.page_size == 0 {
            return Err(HarvestError::Config("sampling.page_size must be at least 1".into()));
        }
        if s.workers == 0 {
            return Err(HarvestError::Config("sampling.workers must be at least 1".into()));
        }
        for plan in &s.facets {
            if !(0.0..=1.0).contains(&plan.share) {
                return Err(HarvestError::Config(format!(
                    "sampling.facets share for {} must be within 0..=1",
                    plan.facet
                )));
            }
        }
        let mut seen = Vec::new();
        for plan in &s.facets {
            if seen.contains(&plan.facet) {
                return Err(HarvestError::Config(format!(
                    "sampling.facets lists {} twice",
                    plan.facet
                )));
            }
            seen.push(plan.facet);
        }
        Ok(())
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<HarvestConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse and validate TOML config text.
pub fn parse_config(content: &str) -> Result<HarvestConfig> {
    let config: HarvestConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.worker.batch_size, 5);
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.worker.inter_batch_delay(), Duration::from_secs(2));
        assert_eq!(config.worker.retry_delay(), Duration::from_secs(5));
        assert_eq!(config.sampling.owner_cap, 10);
        assert_eq!(config.sampling.facets.len(), 4);
        assert_eq!(config.sampling.countries.len(), 5);
    }

    #[test]
    fn partial_tables_override_selected_fields() {
        let config = parse_config(
            r#"
            [worker]
            shard_count = 4
            batch_size = 100
            partition = "round_robin"

            [sampling]
            per_group = 120
            "#,
        )
        .unwrap();
        assert_eq!(config.worker.shard_count, 4);
        assert_eq!(config.worker.batch_size, 100);
        assert_eq!(config.worker.partition, PartitionStrategy::RoundRobin);
        assert_eq!(config.worker.max_retries, 3);
        assert_eq!(config.sampling.per_group, 120);
        assert_eq!(config.sampling.page_size, 48);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(parse_config("[worker]\nbatch_size = 0").is_err());
        assert!(parse_config("[worker]\nbatch_size = 101").is_err());
        assert!(parse_config("[worker]\nshard_count = 0").is_err());
        assert!(parse_config("[sampling]\nowner_cap = 0").is_err());
        assert!(parse_config("[worker]\nbogus = 1").is_err());
        assert!(parse_config("[worker]\nbudget_usd = -1.0").is_err());
    }

    #[test]
    fn example_config_parses() {
        let config = parse_config(include_str!("../../../harvest.example.toml")).unwrap();
        assert_eq!(config.worker.shard_count, 5);
        assert_eq!(config.sampling.countries.len(), 2);
        assert_eq!(config.sampling.facets[1].facet, Facet::MostRecent);
    }

    #[test]
    fn rejects_duplicate_facets() {
        let text = r#"
            [[sampling.facets]]
            facet = "relevance"
            share = 0.5
            margin = 10
            floor = 50

            [[sampling.facets]]
            facet = "relevance"
            share = 0.5
            margin = 10
            floor = 50
        "#;
        assert!(parse_config(text).is_err());
    }

    #[test]
    fn facet_limits_apply_margin_and_floor() {
        let plans = default_facet_plans();
        // relevance: floor(300 * 0.45) = 135, + 30 = 165 > 120
        assert_eq!(plans[0].request_limit(300), 165);
        // most_recent: 75 + 25 = 100, floor 100
        assert_eq!(plans[1].request_limit(300), 100);
        // high_price: 45 + 55 = 100
        assert_eq!(plans[2].request_limit(300), 100);
        // small groups are lifted to the floor
        assert_eq!(plans[0].request_limit(20), 120);
    }

    #[test]
    fn tokens_prefer_list_and_trim() {
        assert_eq!(parse_tokens(Some(" a , b,,c "), Some("z")), vec!["a", "b", "c"]);
        assert_eq!(parse_tokens(None, Some(" z ")), vec!["z"]);
        assert!(parse_tokens(Some(""), None).is_empty());
    }

    #[test]
    fn token_selection_wraps_around() {
        let config = Config {
            database_url: "postgres://x".into(),
            apify_tokens: vec!["a".into(), "b".into()],
        };
        assert_eq!(config.apify_token_for(0), Some("a"));
        assert_eq!(config.apify_token_for(3), Some("b"));
    }
}
