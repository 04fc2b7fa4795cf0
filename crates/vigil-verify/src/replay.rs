//! Parallel replay
//!
//! The sequence space is cut into contiguous segments. Each worker owns one
//! segment: it checks the segment's internal chain and reduces it to the
//! roots of its aligned power-of-two blocks. The join checks the links
//! between segments and folds the block roots left to right, which yields
//! exactly the root a sequential replay produces.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vigil_core::{CancellationToken, Digest, HashAlgorithmId, Result, Sequence, VigilError};
use vigil_ledger::merkle::{aligned_blocks, perfect_subtree_root};
use vigil_ledger::{LedgerEntry, LedgerSnapshot, MerkleFrontier};

/// Entries between cancellation checks inside a segment
const CHECKPOINT_INTERVAL: usize = 256;

/// Replay tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Worker threads in the pool
    pub workers: usize,
    /// Contiguous segments to cut the ledger into
    pub segments: usize,
    /// Advisory time budget
    pub time_budget: Duration,
}

impl ReplayOptions {
    /// Options from the replay section of the configuration
    pub fn from_config(config: &vigil_core::config::ReplayConfig) -> Self {
        Self {
            workers: config.workers,
            segments: config.segments,
            time_budget: Duration::from_millis(config.time_budget_ms),
        }
    }
}

/// One segment's share of the work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSummary {
    /// First sequence in the segment
    pub start: Sequence,
    /// One past the last sequence
    pub end: Sequence,
    /// Aligned blocks folded for this segment
    pub blocks: usize,
}

/// Result of a parallel replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    /// Entries replayed
    pub entries: u64,
    /// Worker threads used
    pub workers: usize,
    /// Segments in sequence order
    pub segments: Vec<SegmentSummary>,
    /// Root combined from the segments
    pub merkle_root: Digest,
    /// Whether the root equals the persisted state file root, if one exists
    pub matches_persisted: Option<bool>,
    /// Wall time
    pub elapsed_ms: u64,
    /// Advisory budget
    pub budget_ms: u64,
    /// Whether the budget was exceeded
    pub budget_exceeded: bool,
}

struct SegmentResult {
    range: Range<usize>,
    first_previous: Digest,
    last_digest: Digest,
    blocks: Vec<(u32, Digest)>,
}

/// Contiguous, near-equal ranges covering `0..len`
fn partition(len: usize, segments: usize) -> Vec<Range<usize>> {
    let segments = segments.clamp(1, len.max(1));
    let base = len / segments;
    let extra = len % segments;
    let mut start = 0;
    (0..segments)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = start..start + size;
            start += size;
            range
        })
        .filter(|r| !r.is_empty())
        .collect()
}

fn replay_segment(
    entries: &[LedgerEntry],
    range: Range<usize>,
    algorithm: HashAlgorithmId,
    cancel: &dyn CancellationToken,
) -> Result<SegmentResult> {
    let mut digests = Vec::with_capacity(range.len());
    for (offset, entry) in entries[range.clone()].iter().enumerate() {
        if offset % CHECKPOINT_INTERVAL == 0 {
            cancel.checkpoint("parallel replay")?;
        }
        let position = (range.start + offset) as Sequence;
        if let Some(&previous) = digests.last() {
            if entry.previous_digest != previous {
                return Err(VigilError::chain_break(position, previous, entry.previous_digest));
            }
        }
        if entry.sequence != position {
            return Err(VigilError::chain_break(
                position,
                entry.previous_digest,
                entry.previous_digest,
            ));
        }
        let digest = entry.recompute_digest(algorithm);
        if digest != entry.digest {
            return Err(VigilError::chain_break(position, digest, entry.digest));
        }
        digests.push(digest);
    }

    let mut blocks = Vec::new();
    for (block_start, height) in aligned_blocks(range.start as u64, range.end as u64) {
        let from = block_start as usize - range.start;
        let to = from + (1usize << height);
        blocks.push((height, perfect_subtree_root(algorithm, &digests[from..to])?));
    }

    Ok(SegmentResult {
        first_previous: entries[range.start].previous_digest,
        last_digest: digests.last().copied().unwrap_or(Digest::ZERO),
        range,
        blocks,
    })
}

/// Replay a snapshot on a fixed pool of workers
///
/// The first chain fault in sequence order is returned as `ChainBreak`.
/// Exceeding the time budget is reported in the result, never as an error.
pub fn parallel_replay(
    snapshot: &LedgerSnapshot,
    options: ReplayOptions,
    cancel: &dyn CancellationToken,
) -> Result<ReplayReport> {
    let started = Instant::now();
    let algorithm = snapshot.algorithm;
    let entries: &[LedgerEntry] = &snapshot.entries;
    let workers = options.workers.max(1);
    let ranges = partition(entries.len(), options.segments);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("vigil-replay-{i}"))
        .build()
        .map_err(|e| VigilError::invalid(format!("replay pool: {e}")))?;
    debug!(
        entries = entries.len(),
        workers,
        segments = ranges.len(),
        "parallel replay started"
    );

    let results: Vec<Result<SegmentResult>> = pool.install(|| {
        ranges
            .into_par_iter()
            .map(|range| replay_segment(entries, range, algorithm, cancel))
            .collect()
    });

    let mut frontier = MerkleFrontier::new(algorithm);
    let mut segments = Vec::with_capacity(results.len());
    let mut previous = Digest::ZERO;
    for result in results {
        let segment = result?;
        if segment.first_previous != previous {
            return Err(VigilError::chain_break(
                segment.range.start as Sequence,
                previous,
                segment.first_previous,
            ));
        }
        for (height, root) in &segment.blocks {
            frontier.push_subtree(*height, *root)?;
        }
        previous = segment.last_digest;
        segments.push(SegmentSummary {
            start: segment.range.start as Sequence,
            end: segment.range.end as Sequence,
            blocks: segment.blocks.len(),
        });
    }

    let merkle_root = frontier.root();
    let elapsed = started.elapsed();
    let budget_exceeded = elapsed > options.time_budget;
    if budget_exceeded {
        warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            budget_ms = options.time_budget.as_millis() as u64,
            "replay exceeded its time budget"
        );
    }
    let matches_persisted = snapshot
        .merkle_state
        .as_ref()
        .map(|s| s.root == merkle_root && s.leaf_count == frontier.leaf_count());

    info!(
        entries = entries.len(),
        root = %merkle_root.short(),
        elapsed_ms = elapsed.as_millis() as u64,
        "parallel replay complete"
    );
    Ok(ReplayReport {
        entries: entries.len() as u64,
        workers,
        segments,
        merkle_root,
        matches_persisted,
        elapsed_ms: elapsed.as_millis() as u64,
        budget_ms: options.time_budget.as_millis() as u64,
        budget_exceeded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_is_contiguous_and_covering() {
        for len in [0usize, 1, 2, 7, 64, 100] {
            for segments in [1usize, 3, 8, 200] {
                let ranges = partition(len, segments);
                let mut next = 0;
                for r in &ranges {
                    assert_eq!(r.start, next);
                    assert!(!r.is_empty());
                    next = r.end;
                }
                assert_eq!(next, len);
                assert!(ranges.len() <= segments.max(1));
            }
        }
    }

    #[test]
    fn test_zero_segments_means_one() {
        assert_eq!(partition(5, 0), vec![0..5]);
    }
}
