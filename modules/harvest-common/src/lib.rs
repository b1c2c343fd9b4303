pub mod config;
pub mod error;
pub mod tagging;
pub mod types;

pub use config::{
    load_config, Config, FacetPlan, HarvestConfig, SamplingSettings, WorkerSettings,
    MAX_BATCH_SIZE,
};
pub use error::HarvestError;
pub use tagging::{PerformanceTag, PriceRange, SellerSignals};
pub use types::*;
