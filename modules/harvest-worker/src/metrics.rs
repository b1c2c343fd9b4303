//! Progress reporting and spend tracking for shard runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use crate::coordinator::ShardReport;

/// Receives periodic and final shard reports.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, report: &ShardReport);
    fn finished(&self, report: &ShardReport);
}

/// Writes reports to the log, with throughput and a rough ETA.
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn progress(&self, r: &ShardReport) {
        let rate = per_hour(r.processed(), r.elapsed);
        let remaining = r.shard_size.saturating_sub(r.visited) as f64;
        let eta_min = if rate > 0.0 {
            remaining / rate * 60.0
        } else {
            0.0
        };
        info!(
            worker = %r.worker_id,
            batches = r.batches,
            visited = r.visited,
            shard_size = r.shard_size,
            done = r.done,
            done_empty = r.done_empty,
            failed = r.failed,
            cost_usd = %format!("{:.2}", r.cost_usd),
            per_hour = %format!("{rate:.0}"),
            eta_min = %format!("{eta_min:.0}"),
            "Shard progress"
        );
    }

    fn finished(&self, r: &ShardReport) {
        info!(
            worker = %r.worker_id,
            batches = r.batches,
            done = r.done,
            done_empty = r.done_empty,
            failed = r.failed,
            claim_conflicts = r.claim_conflicts,
            ignored_records = r.ignored_records,
            cost_usd = %format!("{:.2}", r.cost_usd),
            elapsed_s = r.elapsed.as_secs(),
            budget_exhausted = r.budget_exhausted,
            "Shard complete"
        );
    }
}

/// Discards reports.
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn progress(&self, _report: &ShardReport) {}
    fn finished(&self, _report: &ShardReport) {}
}

fn per_hour(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    count as f64 / secs * 3600.0
}

/// Tracks remote spend against an optional limit.
/// Shared by every shard in a process; amounts are kept in micro-dollars.
pub struct CostTracker {
    /// 0 = unlimited.
    limit_micros: u64,
    spent_micros: AtomicU64,
}

fn to_micros(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * 1_000_000.0).round() as u64
    } else {
        0
    }
}

impl CostTracker {
    pub fn new(limit_usd: f64) -> Self {
        Self {
            limit_micros: to_micros(limit_usd),
            spent_micros: AtomicU64::new(0),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0.0)
    }

    /// Whether another operation of `cost_usd` fits in the budget.
    pub fn has_budget(&self, cost_usd: f64) -> bool {
        if self.limit_micros == 0 {
            return true;
        }
        self.spent_micros.load(Ordering::Relaxed) + to_micros(cost_usd) <= self.limit_micros
    }

    /// Record spend. Returns false if the limit is now exceeded (spend is still recorded).
    pub fn spend(&self, cost_usd: f64) -> bool {
        let cost = to_micros(cost_usd);
        let prev = self.spent_micros.fetch_add(cost, Ordering::Relaxed);
        if self.limit_micros > 0 && prev + cost > self.limit_micros {
            warn!(
                spent_usd = (prev + cost) as f64 / 1e6,
                limit_usd = self.limit_micros as f64 / 1e6,
                "Budget exceeded"
            );
            return false;
        }
        true
    }

    pub fn total_spent_usd(&self) -> f64 {
        self.spent_micros.load(Ordering::Relaxed) as f64 / 1e6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_always_has_budget() {
        let tracker = CostTracker::unlimited();
        assert!(tracker.spend(1_000.0));
        assert!(tracker.has_budget(1_000.0));
    }

    #[test]
    fn limit_blocks_once_spent() {
        let tracker = CostTracker::new(0.05);
        assert!(tracker.has_budget(0.02));
        assert!(tracker.spend(0.02));
        assert!(tracker.spend(0.02));
        assert!(!tracker.has_budget(0.02));
        assert!(!tracker.spend(0.02));
        assert!((tracker.total_spent_usd() - 0.06).abs() < 1e-9);
    }

    #[test]
    fn rate_is_zero_without_elapsed_time() {
        assert_eq!(per_hour(10, Duration::ZERO), 0.0);
        assert!((per_hour(10, Duration::from_secs(3600)) - 10.0).abs() < 1e-9);
    }
}
