//! Merkle accumulator over ledger entry digests
//!
//! The tree is a Merkle mountain range: leaves are appended left to right and
//! two equal-height subtrees merge as soon as they both exist. The root folds
//! the remaining peaks left to right (highest first). This gives:
//!
//! - O(log n) amortized work per append (one leaf plus the merges it triggers)
//! - a root that only depends on the ordered leaf digests, so a full replay,
//!   an incremental accumulator and a segment-parallel fold all agree
//! - perfect subtrees at fixed positions, which lets two trees be compared
//!   top-down to find the first differing leaf in O(log n) node comparisons
//!
//! Leaves, interior nodes and the empty root are hashed under distinct domain
//! tags, so a leaf can never be confused with an interior node.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::warn;
use vigil_core::persist::{read_optional, write_atomic};
use vigil_core::{codec, domain, Digest, HashAlgorithmId, Result, Sequence, VigilError};

/// Format version of the persisted state file
pub const MERKLE_STATE_VERSION: u32 = 1;

/// Deepest supported subtree
pub const MAX_HEIGHT: u32 = 63;

/// Leaf digest for an entry digest
pub fn leaf_digest(algorithm: HashAlgorithmId, entry_digest: &Digest) -> Digest {
    algorithm.hash_tagged(domain::MERKLE_LEAF, &[entry_digest.as_bytes()])
}

/// Interior node digest
pub fn node_digest(algorithm: HashAlgorithmId, left: &Digest, right: &Digest) -> Digest {
    algorithm.hash_tagged(domain::MERKLE_NODE, &[left.as_bytes(), right.as_bytes()])
}

/// Root of an accumulator with no leaves
pub fn empty_root(algorithm: HashAlgorithmId) -> Digest {
    algorithm.hash_tagged(domain::MERKLE_EMPTY, &[])
}

fn fold_peaks(algorithm: HashAlgorithmId, peaks: impl IntoIterator<Item = Digest>) -> Digest {
    let mut peaks = peaks.into_iter();
    let Some(first) = peaks.next() else {
        return empty_root(algorithm);
    };
    peaks.fold(first, |acc, peak| node_digest(algorithm, &acc, &peak))
}

/// A node together with its position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleNode {
    /// 0 for leaves
    pub height: u32,
    /// Position among nodes of the same height
    pub index: u64,
    /// Node digest
    pub digest: Digest,
}

/// Persisted summary, rewritten atomically after each append
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleStateFile {
    /// Format version
    pub version: u32,
    /// Algorithm every digest was produced with
    pub algorithm: HashAlgorithmId,
    /// Number of leaves folded in
    pub leaf_count: u64,
    /// Root over all leaves
    pub root: Digest,
    /// Peaks, highest first
    pub peaks: Vec<MerkleNode>,
}

/// Incremental accumulator retaining every node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleAccumulator {
    algorithm: HashAlgorithmId,
    levels: Vec<Vec<Digest>>,
}

impl MerkleAccumulator {
    /// Empty accumulator
    pub fn new(algorithm: HashAlgorithmId) -> Self {
        Self {
            algorithm,
            levels: Vec::new(),
        }
    }

    /// Full replay from entry digests in sequence order
    pub fn from_entry_digests<'a>(
        algorithm: HashAlgorithmId,
        digests: impl IntoIterator<Item = &'a Digest>,
    ) -> Self {
        let mut acc = Self::new(algorithm);
        for digest in digests {
            acc.append_entry(digest);
        }
        acc
    }

    /// Hash algorithm in use
    pub fn algorithm(&self) -> HashAlgorithmId {
        self.algorithm
    }

    /// Number of leaves
    pub fn leaf_count(&self) -> u64 {
        self.levels.first().map_or(0, |leaves| leaves.len() as u64)
    }

    /// Fold one entry digest in, returning every node created
    pub fn append_entry(&mut self, entry_digest: &Digest) -> Vec<MerkleNode> {
        let mut created = Vec::with_capacity(2);
        let mut digest = leaf_digest(self.algorithm, entry_digest);
        let mut height = 0usize;
        loop {
            if self.levels.len() <= height {
                self.levels.push(Vec::new());
            }
            let level = &mut self.levels[height];
            created.push(MerkleNode {
                height: height as u32,
                index: level.len() as u64,
                digest,
            });
            level.push(digest);
            if level.len() % 2 == 1 {
                break;
            }
            let left = level[level.len() - 2];
            digest = node_digest(self.algorithm, &left, &digest);
            height += 1;
        }
        created
    }

    /// Place a node read back from the node log
    ///
    /// Nodes must arrive in creation order for their height.
    pub fn insert_node(&mut self, node: MerkleNode) -> Result<()> {
        let height = node.height as usize;
        if node.height > MAX_HEIGHT {
            return Err(VigilError::invalid(format!(
                "merkle node height {} exceeds {MAX_HEIGHT}",
                node.height
            )));
        }
        while self.levels.len() <= height {
            self.levels.push(Vec::new());
        }
        let expected = self.levels[height].len() as u64;
        if node.index != expected {
            return Err(VigilError::invalid(format!(
                "merkle node at height {height} has index {}, expected {expected}",
                node.index
            )));
        }
        self.levels[height].push(node.digest);
        Ok(())
    }

    /// Node digest at a position, if it exists
    pub fn node(&self, height: u32, index: u64) -> Option<Digest> {
        let level = self.levels.get(height as usize)?;
        level.get(usize::try_from(index).ok()?).copied()
    }

    /// Current peaks, highest first
    pub fn peaks(&self) -> Vec<MerkleNode> {
        self.levels
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, level)| level.len() % 2 == 1)
            .filter_map(|(height, level)| {
                level.last().map(|digest| MerkleNode {
                    height: height as u32,
                    index: (level.len() - 1) as u64,
                    digest: *digest,
                })
            })
            .collect()
    }

    /// Root over all leaves
    pub fn root(&self) -> Digest {
        fold_peaks(self.algorithm, self.peaks().into_iter().map(|p| p.digest))
    }

    /// Every node in level order, for rewriting the node log
    pub fn nodes(&self) -> impl Iterator<Item = MerkleNode> + '_ {
        self.levels.iter().enumerate().flat_map(|(height, level)| {
            level.iter().enumerate().map(move |(index, digest)| MerkleNode {
                height: height as u32,
                index: index as u64,
                digest: *digest,
            })
        })
    }

    /// First interior node whose digest does not match its children
    pub fn first_inconsistent_node(&self) -> Option<MerkleNode> {
        for height in 1..self.levels.len() {
            let below = &self.levels[height - 1];
            for (index, digest) in self.levels[height].iter().enumerate() {
                let expected = match (below.get(2 * index), below.get(2 * index + 1)) {
                    (Some(l), Some(r)) => node_digest(self.algorithm, l, r),
                    _ => {
                        return Some(MerkleNode {
                            height: height as u32,
                            index: index as u64,
                            digest: *digest,
                        })
                    }
                };
                if expected != *digest {
                    return Some(MerkleNode {
                        height: height as u32,
                        index: index as u64,
                        digest: *digest,
                    });
                }
            }
        }
        None
    }

    /// First leaf at which two accumulators differ
    ///
    /// Compares the perfect subtrees covering the common prefix, then
    /// descends into the first mismatching one, so the cost is O(log n)
    /// node comparisons. A longer tree with an identical prefix diverges at
    /// the shorter tree's length.
    pub fn locate_divergence(&self, other: &MerkleAccumulator) -> Option<Sequence> {
        let common = self.leaf_count().min(other.leaf_count());
        let mut start = 0u64;
        for height in (0..=MAX_HEIGHT).rev() {
            let size = 1u64 << height;
            if common & size == 0 {
                continue;
            }
            let index = start >> height;
            if self.node(height, index) != other.node(height, index) {
                return Some(self.descend(other, height, index));
            }
            start += size;
        }
        (self.leaf_count() != other.leaf_count()).then_some(common)
    }

    fn descend(&self, other: &MerkleAccumulator, mut height: u32, mut index: u64) -> Sequence {
        while height > 0 {
            height -= 1;
            let left = index * 2;
            index = if self.node(height, left) != other.node(height, left) {
                left
            } else {
                left + 1
            };
        }
        index
    }

    /// Summary written to the state file
    pub fn state(&self) -> MerkleStateFile {
        MerkleStateFile {
            version: MERKLE_STATE_VERSION,
            algorithm: self.algorithm,
            leaf_count: self.leaf_count(),
            root: self.root(),
            peaks: self.peaks(),
        }
    }
}

/// Peaks-only accumulator for folding independently computed subtrees
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleFrontier {
    algorithm: HashAlgorithmId,
    leaf_count: u64,
    peaks: Vec<(u32, Digest)>,
}

impl MerkleFrontier {
    /// Empty frontier
    pub fn new(algorithm: HashAlgorithmId) -> Self {
        Self {
            algorithm,
            leaf_count: 0,
            peaks: Vec::new(),
        }
    }

    /// Leaves covered so far
    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// Fold one entry digest in
    pub fn push_entry(&mut self, entry_digest: &Digest) {
        let leaf = leaf_digest(self.algorithm, entry_digest);
        self.merge(0, leaf);
    }

    /// Fold in the root of a perfect subtree of `2^height` leaves
    ///
    /// The subtree must start at a multiple of its own size.
    pub fn push_subtree(&mut self, height: u32, root: Digest) -> Result<()> {
        if height > MAX_HEIGHT {
            return Err(VigilError::invalid(format!("subtree height {height} too large")));
        }
        let size = 1u64 << height;
        if self.leaf_count % size != 0 {
            return Err(VigilError::invalid(format!(
                "subtree of {size} leaves is not aligned at leaf {}",
                self.leaf_count
            )));
        }
        self.merge(height, root);
        Ok(())
    }

    fn merge(&mut self, mut height: u32, mut digest: Digest) {
        self.leaf_count += 1u64 << height;
        while let Some(&(top_height, top)) = self.peaks.last() {
            if top_height != height {
                break;
            }
            self.peaks.pop();
            digest = node_digest(self.algorithm, &top, &digest);
            height += 1;
        }
        self.peaks.push((height, digest));
    }

    /// Root over everything folded so far
    pub fn root(&self) -> Digest {
        fold_peaks(self.algorithm, self.peaks.iter().map(|(_, d)| *d))
    }
}

/// Root of a perfect subtree over a power-of-two run of entry digests
pub fn perfect_subtree_root(
    algorithm: HashAlgorithmId,
    entry_digests: &[Digest],
) -> Result<Digest> {
    if entry_digests.is_empty() || !entry_digests.len().is_power_of_two() {
        return Err(VigilError::invalid(format!(
            "{} leaves do not form a perfect subtree",
            entry_digests.len()
        )));
    }
    let mut level: Vec<Digest> = entry_digests
        .iter()
        .map(|d| leaf_digest(algorithm, d))
        .collect();
    while level.len() > 1 {
        level = level
            .chunks_exact(2)
            .map(|pair| node_digest(algorithm, &pair[0], &pair[1]))
            .collect();
    }
    Ok(level[0])
}

/// Split `[start, end)` into maximal aligned power-of-two blocks
///
/// Returns `(block_start, height)` pairs in order.
pub fn aligned_blocks(start: u64, end: u64) -> Vec<(u64, u32)> {
    let mut blocks = Vec::new();
    let mut position = start;
    while position < end {
        let mut height = if position == 0 {
            MAX_HEIGHT
        } else {
            position.trailing_zeros().min(MAX_HEIGHT)
        };
        while height > 0 && position.saturating_add(1u64 << height) > end {
            height -= 1;
        }
        blocks.push((position, height));
        position += 1u64 << height;
    }
    blocks
}

/// Read the node log back into an accumulator
///
/// Reading stops at the first unreadable or out-of-order line; whatever was
/// read before it is returned along with a description of the problem.
pub fn load_node_log(
    path: &Path,
    algorithm: HashAlgorithmId,
) -> Result<(MerkleAccumulator, Option<String>)> {
    let mut acc = MerkleAccumulator::new(algorithm);
    let Some(bytes) = read_optional(path)? else {
        return Ok((acc, None));
    };
    for (line_no, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let node: MerkleNode = match codec::decode(line) {
            Ok(node) => node,
            Err(e) => {
                let problem = format!("node log line {} unreadable: {e}", line_no + 1);
                warn!(path = %path.display(), "{problem}");
                return Ok((acc, Some(problem)));
            }
        };
        if let Err(e) = acc.insert_node(node) {
            let problem = format!("node log line {}: {e}", line_no + 1);
            warn!(path = %path.display(), "{problem}");
            return Ok((acc, Some(problem)));
        }
    }
    Ok((acc, None))
}

/// Append freshly created nodes to the node log
pub fn append_node_log(path: &Path, nodes: &[MerkleNode]) -> Result<()> {
    let mut buf = Vec::with_capacity(nodes.len() * 128);
    for node in nodes {
        buf.extend_from_slice(&codec::encode(node)?);
        buf.push(b'\n');
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

/// Replace the node log with every node of `acc`
pub fn rewrite_node_log(path: &Path, acc: &MerkleAccumulator) -> Result<()> {
    let mut buf = Vec::new();
    for node in acc.nodes() {
        buf.extend_from_slice(&codec::encode(&node)?);
        buf.push(b'\n');
    }
    write_atomic(path, &buf)
}

/// Read the state file; unreadable content is reported, not fatal
pub fn load_state(path: &Path) -> Result<(Option<MerkleStateFile>, Option<String>)> {
    let Some(bytes) = read_optional(path)? else {
        return Ok((None, None));
    };
    match codec::decode::<MerkleStateFile>(&bytes) {
        Ok(state) if state.version == MERKLE_STATE_VERSION => Ok((Some(state), None)),
        Ok(state) => Ok((
            None,
            Some(format!("merkle state version {} unsupported", state.version)),
        )),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "merkle state unreadable");
            Ok((None, Some(format!("merkle state unreadable: {e}"))))
        }
    }
}

/// Atomically write the state file
pub fn write_state(path: &Path, state: &MerkleStateFile) -> Result<()> {
    write_atomic(path, &codec::encode(state)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ALGO: HashAlgorithmId = HashAlgorithmId::Sha256;

    fn digests(n: usize) -> Vec<Digest> {
        (0..n)
            .map(|i| ALGO.hash(format!("entry-{i}").as_bytes()))
            .collect()
    }

    #[test]
    fn test_empty_and_single_leaf() {
        let acc = MerkleAccumulator::new(ALGO);
        assert_eq!(acc.root(), empty_root(ALGO));
        let d = digests(1);
        let acc = MerkleAccumulator::from_entry_digests(ALGO, &d);
        assert_eq!(acc.root(), leaf_digest(ALGO, &d[0]));
    }

    #[test]
    fn test_three_leaves_fold_peaks_left_to_right() {
        let d = digests(3);
        let acc = MerkleAccumulator::from_entry_digests(ALGO, &d);
        let pair = node_digest(ALGO, &leaf_digest(ALGO, &d[0]), &leaf_digest(ALGO, &d[1]));
        let expected = node_digest(ALGO, &pair, &leaf_digest(ALGO, &d[2]));
        assert_eq!(acc.root(), expected);
        assert_eq!(acc.peaks().len(), 2);
        assert_eq!(acc.peaks()[0].height, 1);
    }

    #[test]
    fn test_append_reports_created_nodes() {
        let d = digests(4);
        let mut acc = MerkleAccumulator::new(ALGO);
        assert_eq!(acc.append_entry(&d[0]).len(), 1);
        assert_eq!(acc.append_entry(&d[1]).len(), 2);
        assert_eq!(acc.append_entry(&d[2]).len(), 1);
        assert_eq!(acc.append_entry(&d[3]).len(), 3);
    }

    #[test]
    fn test_node_log_rebuilds_identical_tree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merkle_nodes.log");
        let mut acc = MerkleAccumulator::new(ALGO);
        for d in digests(11) {
            let nodes = acc.append_entry(&d);
            append_node_log(&path, &nodes).unwrap();
        }
        let (loaded, problem) = load_node_log(&path, ALGO).unwrap();
        assert!(problem.is_none());
        assert_eq!(loaded, acc);

        rewrite_node_log(&path, &acc).unwrap();
        let (reloaded, _) = load_node_log(&path, ALGO).unwrap();
        assert_eq!(reloaded.root(), acc.root());
    }

    #[test]
    fn test_state_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merkle_state.json");
        let acc = MerkleAccumulator::from_entry_digests(ALGO, &digests(5));
        write_state(&path, &acc.state()).unwrap();
        let (state, problem) = load_state(&path).unwrap();
        assert!(problem.is_none());
        assert_eq!(state.unwrap().root, acc.root());

        std::fs::write(&path, b"{not json").unwrap();
        let (state, problem) = load_state(&path).unwrap();
        assert!(state.is_none());
        assert!(problem.is_some());
    }

    #[test]
    fn test_locate_divergence_finds_first_leaf() {
        let original = digests(37);
        let base = MerkleAccumulator::from_entry_digests(ALGO, &original);
        for target in [0usize, 1, 16, 31, 32, 36] {
            let mut changed = original.clone();
            changed[target] = ALGO.hash(b"tampered");
            let other = MerkleAccumulator::from_entry_digests(ALGO, &changed);
            assert_eq!(base.locate_divergence(&other), Some(target as u64));
        }
        assert_eq!(base.locate_divergence(&base.clone()), None);
    }

    #[test]
    fn test_locate_divergence_on_length_mismatch() {
        let d = digests(10);
        let long = MerkleAccumulator::from_entry_digests(ALGO, &d);
        let short = MerkleAccumulator::from_entry_digests(ALGO, &d[..7]);
        assert_eq!(long.locate_divergence(&short), Some(7));
        assert_eq!(short.locate_divergence(&long), Some(7));
    }

    #[test]
    fn test_inconsistent_interior_node_detected() {
        let mut acc = MerkleAccumulator::from_entry_digests(ALGO, &digests(4));
        assert!(acc.first_inconsistent_node().is_none());
        acc.levels[1][1] = Digest::ZERO;
        let bad = acc.first_inconsistent_node().unwrap();
        assert_eq!((bad.height, bad.index), (1, 1));
    }

    #[test]
    fn test_aligned_blocks() {
        assert_eq!(aligned_blocks(0, 7), vec![(0, 2), (4, 1), (6, 0)]);
        assert_eq!(aligned_blocks(3, 9), vec![(3, 0), (4, 2), (8, 0)]);
        assert!(aligned_blocks(5, 5).is_empty());
    }

    #[test]
    fn test_misaligned_subtree_rejected() {
        let mut frontier = MerkleFrontier::new(ALGO);
        frontier.push_entry(&Digest::ZERO);
        assert!(frontier.push_subtree(1, Digest::ZERO).is_err());
        assert!(perfect_subtree_root(ALGO, &digests(3)).is_err());
    }

    proptest! {
        #[test]
        fn prop_segment_fold_matches_full_replay(
            n in 0usize..200,
            cuts in proptest::collection::vec(0usize..200, 0..6),
        ) {
            let d = digests(n);
            let full = MerkleAccumulator::from_entry_digests(ALGO, &d);

            let mut bounds: Vec<usize> = cuts.into_iter().filter(|c| *c < n).collect();
            bounds.push(0);
            bounds.push(n);
            bounds.sort_unstable();
            bounds.dedup();

            let mut frontier = MerkleFrontier::new(ALGO);
            for window in bounds.windows(2) {
                for (start, height) in aligned_blocks(window[0] as u64, window[1] as u64) {
                    let s = start as usize;
                    let e = s + (1usize << height);
                    let root = perfect_subtree_root(ALGO, &d[s..e]).unwrap();
                    frontier.push_subtree(height, root).unwrap();
                }
            }
            prop_assert_eq!(frontier.leaf_count(), n as u64);
            prop_assert_eq!(frontier.root(), full.root());
        }
    }
}
