// Postgres-backed WorkStore. Every state change is a single conditional
// UPDATE whose WHERE clause re-checks the expected status, so concurrent
// workers in any number of processes never both win a claim.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info};

use harvest_common::{
    InsertStats, ItemFilter, ItemStatus, ListingDetails, ListingId, NewWorkItem,
    ProcessingMarker, StatusCounts, WorkItem, WorkerCounts,
};

use crate::error::{Result, StoreError};
use crate::traits::{RequeueScope, WorkStore};

#[derive(Clone)]
pub struct PgWorkStore {
    pool: PgPool,
}

#[derive(Debug, sqlx::FromRow)]
struct WorkItemRow {
    listing_id: i64,
    url: String,
    category: Option<String>,
    country: Option<String>,
    is_priority: bool,
}

impl From<WorkItemRow> for WorkItem {
    fn from(row: WorkItemRow) -> Self {
        Self {
            listing_id: row.listing_id,
            url: row.url,
            category: row.category,
            country: row.country,
            priority: row.is_priority,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MarkerRow {
    listing_id: i64,
    status: String,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
    result_applied_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    batch_seq: Option<i64>,
    attempts: i32,
}

impl TryFrom<MarkerRow> for ProcessingMarker {
    type Error = StoreError;

    fn try_from(row: MarkerRow) -> Result<Self> {
        let status = parse_status(row.listing_id, &row.status)?;
        Ok(Self {
            status,
            claimed_by: row.claimed_by,
            claimed_at: row.claimed_at,
            result_applied_at: row.result_applied_at,
            failure_reason: row.failure_reason,
            batch_seq: row.batch_seq,
            attempts: row.attempts,
        })
    }
}

fn parse_status(listing_id: ListingId, raw: &str) -> Result<ItemStatus> {
    raw.parse().map_err(|_| StoreError::Corrupt {
        listing_id,
        reason: format!("unknown status {raw:?}"),
    })
}

impl PgWorkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Run the embedded SQL migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Listing store migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Detail fields applied to a listing, if any.
    pub async fn details(&self, listing_id: ListingId) -> Result<Option<ListingDetails>> {
        let row = sqlx::query_scalar::<_, Option<Json<ListingDetails>>>(
            "SELECT details FROM listings WHERE listing_id = $1",
        )
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.flatten().map(|Json(d)| d))
    }

    async fn settle(
        &self,
        listing_id: ListingId,
        worker_id: &str,
        batch_seq: i64,
        status: ItemStatus,
        details: Option<&ListingDetails>,
        reason: Option<&str>,
    ) -> Result<bool> {
        let applied = status != ItemStatus::Failed;
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET status = $3,
                batch_seq = $4,
                details = COALESCE($5, details),
                failure_reason = $6,
                result_applied_at = CASE WHEN $7 THEN now() ELSE result_applied_at END,
                updated_at = now()
            WHERE listing_id = $1 AND status = 'claimed' AND claimed_by = $2
            "#,
        )
        .bind(listing_id)
        .bind(worker_id)
        .bind(status.as_str())
        .bind(batch_seq)
        .bind(details.map(Json))
        .bind(reason)
        .bind(applied)
        .execute(&self.pool)
        .await?;

        let settled = result.rows_affected() == 1;
        if !settled {
            debug!(listing_id, worker_id, status = %status, "Settle skipped, claim not held");
        }
        Ok(settled)
    }
}

#[async_trait]
impl WorkStore for PgWorkStore {
    async fn insert_items(&self, items: &[NewWorkItem]) -> Result<InsertStats> {
        let mut tx = self.pool.begin().await?;
        let mut stats = InsertStats::default();
        for item in items {
            let result = sqlx::query(
                r#"
                INSERT INTO listings
                    (listing_id, url, category, category_url, country, search_term,
                     facet, search_rank, search_page, shop, price_range, performance_tag,
                     is_star_seller, is_etsy_pick, is_bestseller, shop_review_count, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(item.listing_id)
            .bind(&item.url)
            .bind(&item.category)
            .bind(&item.category_url)
            .bind(&item.country)
            .bind(&item.search_term)
            .bind(item.facet.map(|f| f.as_str()))
            .bind(item.search_rank)
            .bind(item.search_page)
            .bind(&item.shop)
            .bind(item.price_range.as_str())
            .bind(item.performance.as_str())
            .bind(item.is_star_seller)
            .bind(item.is_etsy_pick)
            .bind(item.is_bestseller)
            .bind(item.shop_review_count)
            .bind(&item.payload)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                stats.inserted += 1;
            } else {
                stats.existing += 1;
            }
        }
        tx.commit().await?;
        Ok(stats)
    }

    async fn find_unclaimed(&self, filter: &ItemFilter, limit: Option<usize>) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query_as::<_, WorkItemRow>(
            r#"
            SELECT listing_id, url, category, country, is_priority
            FROM listings
            WHERE status = 'unclaimed'
              AND ($1::text IS NULL OR category = $1)
              AND ($2::text IS NULL OR country = $2)
              AND (NOT $3 OR is_priority)
            ORDER BY listing_id
            LIMIT $4
            "#,
        )
        .bind(&filter.category)
        .bind(&filter.country)
        .bind(filter.priority_only)
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(WorkItem::from).collect())
    }

    async fn claim(&self, listing_id: ListingId, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET status = 'claimed', claimed_by = $2, claimed_at = now(), updated_at = now()
            WHERE listing_id = $1 AND status = 'unclaimed'
            "#,
        )
        .bind(listing_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn apply_result(
        &self,
        listing_id: ListingId,
        worker_id: &str,
        batch_seq: i64,
        details: &ListingDetails,
    ) -> Result<bool> {
        self.settle(listing_id, worker_id, batch_seq, ItemStatus::Done, Some(details), None)
            .await
    }

    async fn mark_empty(&self, listing_id: ListingId, worker_id: &str, batch_seq: i64) -> Result<bool> {
        self.settle(listing_id, worker_id, batch_seq, ItemStatus::DoneEmpty, None, None)
            .await
    }

    async fn mark_failed(
        &self,
        listing_id: ListingId,
        worker_id: &str,
        batch_seq: i64,
        reason: &str,
    ) -> Result<bool> {
        self.settle(listing_id, worker_id, batch_seq, ItemStatus::Failed, None, Some(reason))
            .await
    }

    async fn count(&self, filter: &ItemFilter) -> Result<u64> {
        let n = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM listings
            WHERE ($1::text IS NULL OR category = $1)
              AND ($2::text IS NULL OR country = $2)
              AND (NOT $3 OR is_priority)
            "#,
        )
        .bind(&filter.category)
        .bind(&filter.country)
        .bind(filter.priority_only)
        .fetch_one(&self.pool)
        .await?;
        Ok(n.max(0) as u64)
    }

    async fn status_counts(&self, filter: &ItemFilter) -> Result<StatusCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT status, COUNT(*) FROM listings
            WHERE ($1::text IS NULL OR category = $1)
              AND ($2::text IS NULL OR country = $2)
              AND (NOT $3 OR is_priority)
            GROUP BY status
            "#,
        )
        .bind(&filter.category)
        .bind(&filter.country)
        .bind(filter.priority_only)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            counts.add(parse_status(0, &status)?, n.max(0) as u64);
        }
        Ok(counts)
    }

    async fn worker_counts(&self) -> Result<Vec<WorkerCounts>> {
        let rows = sqlx::query_as::<_, (String, String, i64, Option<DateTime<Utc>>)>(
            r#"
            SELECT claimed_by, status, COUNT(*), MAX(result_applied_at)
            FROM listings
            WHERE claimed_by IS NOT NULL
            GROUP BY claimed_by, status
            ORDER BY claimed_by
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut workers: Vec<WorkerCounts> = Vec::new();
        for (worker_id, status, n, last) in rows {
            let status = parse_status(0, &status)?;
            if workers.last().map(|w| &w.worker_id) != Some(&worker_id) {
                workers.push(WorkerCounts {
                    worker_id,
                    counts: StatusCounts::default(),
                    last_applied_at: None,
                });
            }
            if let Some(entry) = workers.last_mut() {
                entry.counts.add(status, n.max(0) as u64);
                entry.last_applied_at = entry.last_applied_at.max(last);
            }
        }
        Ok(workers)
    }

    async fn marker(&self, listing_id: ListingId) -> Result<Option<ProcessingMarker>> {
        let row = sqlx::query_as::<_, MarkerRow>(
            r#"
            SELECT listing_id, status, claimed_by, claimed_at, result_applied_at,
                   failure_reason, batch_seq, attempts
            FROM listings
            WHERE listing_id = $1
            "#,
        )
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ProcessingMarker::try_from).transpose()
    }

    async fn requeue(&self, scope: &RequeueScope) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET status = 'unclaimed',
                claimed_by = NULL,
                claimed_at = NULL,
                result_applied_at = NULL,
                failure_reason = NULL,
                batch_seq = NULL,
                attempts = attempts + 1,
                updated_at = now()
            WHERE ($1::text IS NULL OR category = $1)
              AND ($2::text IS NULL OR country = $2)
              AND (NOT $3 OR is_priority)
              AND (
                    ($4 AND status = 'failed')
                 OR ($5::timestamptz IS NOT NULL AND status = 'claimed' AND claimed_at < $5)
              )
            "#,
        )
        .bind(&scope.filter.category)
        .bind(&scope.filter.country)
        .bind(scope.filter.priority_only)
        .bind(scope.failed)
        .bind(scope.orphaned_before)
        .execute(&self.pool)
        .await?;

        let moved = result.rows_affected();
        info!(moved, failed = scope.failed, orphaned_before = ?scope.orphaned_before, "Requeued items");
        Ok(moved)
    }
}
