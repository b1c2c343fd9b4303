//! Deterministic split of an id-ordered snapshot into K shards.
//!
//! Partitioning only decides who *tries* an item first. Overlap between
//! workers holding different snapshots is resolved by the store's claim.

use std::ops::Range;

use harvest_common::PartitionStrategy;

/// Positions in the snapshot that belong to shard `index` of `count`.
pub fn shard_positions(
    len: usize,
    index: usize,
    count: usize,
    strategy: PartitionStrategy,
) -> Vec<usize> {
    if count == 0 || index >= count {
        return Vec::new();
    }
    match strategy {
        PartitionStrategy::Contiguous => contiguous_range(len, index, count).collect(),
        PartitionStrategy::RoundRobin => (index..len).step_by(count).collect(),
    }
}

/// `[k·⌈n/K⌉, min((k+1)·⌈n/K⌉, n))`
fn contiguous_range(len: usize, index: usize, count: usize) -> Range<usize> {
    let chunk = len.div_ceil(count);
    let start = (index * chunk).min(len);
    let end = ((index + 1) * chunk).min(len);
    start..end
}

/// The items of one shard, in snapshot order.
pub fn shard<T: Clone>(items: &[T], index: usize, count: usize, strategy: PartitionStrategy) -> Vec<T> {
    shard_positions(items.len(), index, count, strategy)
        .into_iter()
        .map(|i| items[i].clone())
        .collect()
}

/// All K shards.
pub fn partition<T: Clone>(items: &[T], count: usize, strategy: PartitionStrategy) -> Vec<Vec<T>> {
    (0..count).map(|k| shard(items, k, count, strategy)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRATEGIES: [PartitionStrategy; 2] =
        [PartitionStrategy::Contiguous, PartitionStrategy::RoundRobin];

    #[test]
    fn every_item_lands_in_exactly_one_shard() {
        for strategy in STRATEGIES {
            for n in 0..60 {
                let items: Vec<usize> = (0..n).collect();
                for k in 1..=9 {
                    let shards = partition(&items, k, strategy);
                    assert_eq!(shards.len(), k);
                    let mut seen: Vec<usize> = shards.into_iter().flatten().collect();
                    seen.sort_unstable();
                    assert_eq!(seen, items, "n={n} k={k} {strategy:?}");
                }
            }
        }
    }

    #[test]
    fn partition_is_deterministic() {
        let items: Vec<i64> = (100..137).collect();
        for strategy in STRATEGIES {
            assert_eq!(partition(&items, 4, strategy), partition(&items, 4, strategy));
        }
    }

    #[test]
    fn contiguous_uses_ceiling_sized_ranges() {
        let items: Vec<i32> = (0..10).collect();
        let shards = partition(&items, 3, PartitionStrategy::Contiguous);
        assert_eq!(shards[0], vec![0, 1, 2, 3]);
        assert_eq!(shards[1], vec![4, 5, 6, 7]);
        assert_eq!(shards[2], vec![8, 9]);
    }

    #[test]
    fn contiguous_leaves_trailing_shards_empty_when_few_items() {
        let items = vec!["a", "b"];
        let shards = partition(&items, 4, PartitionStrategy::Contiguous);
        assert_eq!(shards[0], vec!["a"]);
        assert_eq!(shards[1], vec!["b"]);
        assert!(shards[2].is_empty());
        assert!(shards[3].is_empty());
    }

    #[test]
    fn round_robin_interleaves() {
        let items: Vec<i32> = (0..7).collect();
        let shards = partition(&items, 3, PartitionStrategy::RoundRobin);
        assert_eq!(shards[0], vec![0, 3, 6]);
        assert_eq!(shards[1], vec![1, 4]);
        assert_eq!(shards[2], vec![2, 5]);
    }

    #[test]
    fn out_of_range_index_is_empty() {
        assert!(shard_positions(10, 3, 3, PartitionStrategy::Contiguous).is_empty());
        assert!(shard_positions(10, 0, 0, PartitionStrategy::RoundRobin).is_empty());
    }
}
