use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use apify_client::ApifyClient;
use harvest_common::{
    load_config, Config, HarvestConfig, ItemFilter, ShardDescriptor, StatusCounts,
    MAX_BATCH_SIZE,
};
use harvest_store::{PgWorkStore, RequeueScope, WorkStore};
use harvest_worker::partition;
use harvest_worker::sampler::parse_category_list;
use harvest_worker::{
    ApifyBatchClient, ApifyCandidateSource, CostTracker, LogProgressSink, SamplingAggregator,
    ShardCoordinator, ShardReport,
};

#[derive(Parser)]
#[command(name = "harvest")]
#[command(about = "Sample Etsy listings and harvest their details across sharded workers")]
#[command(version)]
struct Cli {
    /// TOML file with worker and sampling tunables (defaults to ./harvest.toml if present)
    #[arg(long, global = true, env = "HARVEST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Sample listings for a list of categories and ingest them as work items
    Sample {
        /// File whose first column holds category URLs
        #[arg(long)]
        categories: PathBuf,

        /// Only sample the first N categories
        #[arg(long)]
        limit: Option<usize>,

        /// Concurrent sampling tasks
        #[arg(long)]
        workers: Option<usize>,

        /// Target sample size per (category, country)
        #[arg(long)]
        per_group: Option<usize>,
    },

    /// Harvest details for this worker's shard of the unclaimed items
    ///
    /// Each worker shards the unclaimed items it sees at start-up. Workers
    /// launched at different times see different snapshots and can leave
    /// items unclaimed; run another pass until `status` shows none remain.
    Work {
        #[arg(long, env = "WORKER_INDEX", default_value_t = 0)]
        worker_index: usize,

        #[arg(long, env = "SHARD_COUNT")]
        shard_count: Option<usize>,

        /// Recorded as claimed_by (defaults to worker-<index>)
        #[arg(long, env = "WORKER_ID")]
        worker_id: Option<String>,

        /// Batch size (defaults to worker.batch_size, or the maximum with --priority)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Run every shard in this process instead of just --worker-index
        #[arg(long)]
        all_shards: bool,

        /// First shard position to process
        #[arg(long, requires = "resume_end")]
        resume_start: Option<usize>,

        /// Shard position to stop before
        #[arg(long, requires = "resume_start")]
        resume_end: Option<usize>,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Show item counts per status and per worker
    Status {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Put failed or orphaned items back into play
    Requeue {
        /// Requeue items marked failed
        #[arg(long)]
        failed: bool,

        /// Requeue claims older than this many minutes
        #[arg(long)]
        orphaned_minutes: Option<i64>,

        #[command(flatten)]
        filter: FilterArgs,
    },
}

#[derive(clap::Args, Clone, Default)]
struct FilterArgs {
    #[arg(long)]
    category: Option<String>,

    #[arg(long)]
    country: Option<String>,

    /// Only star sellers, bestsellers, high performers and well-reviewed shops
    #[arg(long)]
    priority: bool,
}

impl From<FilterArgs> for ItemFilter {
    fn from(f: FilterArgs) -> Self {
        ItemFilter {
            category: f.category,
            country: f.country,
            priority_only: f.priority,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvest=info".parse()?))
        .init();

    let cli = Cli::parse();
    let mut settings = tunables(cli.config.as_deref())?;
    let config = Config::from_env()?;

    let store = PgWorkStore::connect(&config.database_url).await?;

    match cli.command {
        Commands::Migrate => {
            store.migrate().await?;
        }
        Commands::Sample {
            categories,
            limit,
            workers,
            per_group,
        } => {
            if let Some(n) = workers {
                settings.sampling.workers = n;
            }
            if let Some(n) = per_group {
                settings.sampling.per_group = n;
            }
            settings.validate()?;
            run_sample(&config, &settings, Arc::new(store), &categories, limit).await?;
        }
        Commands::Work {
            worker_index,
            shard_count,
            worker_id,
            batch_size,
            all_shards,
            resume_start,
            resume_end,
            filter,
        } => {
            if let Some(k) = shard_count {
                settings.worker.shard_count = k;
            }
            match batch_size {
                Some(n) => settings.worker.batch_size = n,
                None if filter.priority => settings.worker.batch_size = MAX_BATCH_SIZE,
                None => {}
            }
            settings.validate()?;

            let k = settings.worker.shard_count;
            let indices: Vec<usize> = if all_shards {
                (0..k).collect()
            } else {
                vec![worker_index]
            };
            let shards = indices
                .into_iter()
                .map(|i| {
                    let id = match (&worker_id, all_shards) {
                        (Some(id), false) => id.clone(),
                        (Some(id), true) => format!("{id}-{i}"),
                        (None, _) => format!("worker-{i}"),
                    };
                    let shard = ShardDescriptor::new(id, i, k);
                    match (resume_start, resume_end) {
                        (Some(start), Some(end)) => shard.with_resume_range(start, end),
                        _ => shard,
                    }
                })
                .collect::<Vec<_>>();
            for shard in &shards {
                shard.validate()?;
            }

            let store: Arc<dyn WorkStore> = Arc::new(store);
            run_work(&config, &settings, store, shards, filter.into()).await?;
        }
        Commands::Status { filter } => {
            print_status(&store, &filter.into()).await?;
        }
        Commands::Requeue {
            failed,
            orphaned_minutes,
            filter,
        } => {
            if !failed && orphaned_minutes.is_none() {
                bail!("nothing to requeue: pass --failed and/or --orphaned-minutes");
            }
            let scope = RequeueScope {
                failed,
                orphaned_before: orphaned_minutes
                    .map(|m| chrono::Utc::now() - chrono::Duration::minutes(m)),
                filter: filter.into(),
            };
            let moved = store.requeue(&scope).await?;
            info!(moved, "Requeue complete");
        }
    }

    Ok(())
}

fn tunables(path: Option<&Path>) -> Result<HarvestConfig> {
    match path {
        Some(p) => load_config(p),
        None if Path::new("harvest.toml").exists() => load_config(Path::new("harvest.toml")),
        None => Ok(HarvestConfig::default()),
    }
}

fn apify_client(config: &Config, index: usize) -> Result<ApifyClient> {
    let token = config
        .apify_token_for(index)
        .context("APIFY_API_TOKEN or APIFY_API_TOKENS is required")?;
    Ok(ApifyClient::new(token.to_string()))
}

async fn run_sample(
    config: &Config,
    settings: &HarvestConfig,
    store: Arc<PgWorkStore>,
    categories_path: &Path,
    limit: Option<usize>,
) -> Result<()> {
    let text = std::fs::read_to_string(categories_path)
        .with_context(|| format!("Failed to read categories: {}", categories_path.display()))?;
    let mut categories = parse_category_list(&text);
    if let Some(n) = limit {
        categories.truncate(n);
        info!(limit = n, "Limiting categories");
    }
    if categories.is_empty() {
        bail!("no category URLs in {}", categories_path.display());
    }

    let workers = settings.sampling.workers.min(categories.len());
    info!(
        categories = categories.len(),
        workers,
        countries = settings.sampling.countries.len(),
        per_group = settings.sampling.per_group,
        "Sampling started"
    );

    let chunks = partition::partition(
        &categories,
        workers,
        harvest_common::PartitionStrategy::RoundRobin,
    );
    let mut tasks = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.into_iter().enumerate() {
        let source = Arc::new(ApifyCandidateSource::new(apify_client(config, i)?));
        let aggregator = SamplingAggregator::new(source, settings.sampling.clone());
        let store = store.clone();
        tasks.push(async move { aggregator.sample_categories(&chunk, &*store).await });
    }

    let mut inserted = 0;
    let mut existing = 0;
    let mut failed_tasks = 0;
    for result in futures::future::join_all(tasks).await {
        match result {
            Ok(reports) => {
                for r in reports {
                    inserted += r.inserted;
                    existing += r.existing;
                }
            }
            Err(e) => {
                warn!(error = %e, "Sampling task aborted");
                failed_tasks += 1;
            }
        }
    }
    info!(inserted, existing, failed_tasks, "Sampling complete");
    if failed_tasks > 0 {
        bail!("{failed_tasks} sampling task(s) aborted");
    }
    Ok(())
}

async fn run_work(
    config: &Config,
    settings: &HarvestConfig,
    store: Arc<dyn WorkStore>,
    shards: Vec<ShardDescriptor>,
    filter: ItemFilter,
) -> Result<()> {
    let costs = Arc::new(CostTracker::new(settings.worker.budget_usd));
    let progress = Arc::new(LogProgressSink);

    let mut coordinators = Vec::with_capacity(shards.len());
    for shard in shards {
        let client = Arc::new(ApifyBatchClient::new(apify_client(config, shard.worker_index)?));
        coordinators.push(
            ShardCoordinator::new(store.clone(), client, shard, settings.worker.clone())
                .with_progress(progress.clone())
                .with_costs(costs.clone())
                .with_filter(filter.clone()),
        );
    }

    let results = futures::future::join_all(coordinators.iter().map(|c| c.run())).await;
    let mut reports = Vec::new();
    let mut aborted = 0;
    for result in results {
        match result {
            Ok(report) => reports.push(report),
            Err(e) => {
                warn!(error = %e, "Shard aborted");
                aborted += 1;
            }
        }
    }

    let total = ShardReport::combine("all", &reports);
    info!(
        shards = reports.len(),
        aborted,
        done = total.done,
        done_empty = total.done_empty,
        failed = total.failed,
        claim_conflicts = total.claim_conflicts,
        cost_usd = %format!("{:.2}", costs.total_spent_usd()),
        "Harvest run finished"
    );
    let counts = print_status(store.as_ref(), &filter).await?;
    if counts.unclaimed > 0 {
        warn!(
            unclaimed = counts.unclaimed,
            "Items left unclaimed by this pass; run `harvest work` again to pick them up"
        );
    }

    if aborted > 0 {
        bail!("{aborted} shard(s) aborted");
    }
    Ok(())
}

async fn print_status(store: &dyn WorkStore, filter: &ItemFilter) -> Result<StatusCounts> {
    let counts = store.status_counts(filter).await?;
    println!("{counts}");
    for w in store.worker_counts().await? {
        let last = w
            .last_applied_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        println!("  {:<20} {}  last_applied={}", w.worker_id, w.counts, last);
    }
    Ok(counts)
}
