// tree.rs — Hierarchical descriptor index (a forest of OR-trees).
//
// The index partitions one frame's descriptor list into L leaves spread
// over R = L >> D complete binary subtrees of depth D. Leaves hold the
// descriptors themselves (sorted so similar codes land in neighboring
// leaves); every internal node is the bitwise OR of its children, so the
// masked error against a parent never exceeds the error against the best
// descendant — descending toward the lower-error child is a greedy
// approximate nearest-neighbor search.
//
// CELL ADDRESSING
// ───────────────
// Nodes live in one flat array addressed like a binary heap with the
// cells *above* the roots removed. In the virtual heap (children of i at
// 2i+1 and 2i+2) the R roots sit at ids R-1 .. 2R-2 and the L leaves at
// ids L-1 .. 2L-2; the R-1 virtual cells above the roots are never
// materialized, so stored index = heap id - (R - 1) and the array holds
// exactly 2L - R nodes. The same arithmetic runs in the WGSL query
// kernel, which is why it is kept this explicit.
//
// Unfilled leaves keep a zero node and an INVALID_INDEX marker; a zero
// reference rejects any non-empty query bit pattern, and the marker
// guards the degenerate all-zero query.

use crate::descriptor::Descriptor;

/// Leaf marker for "no descriptor stored here".
pub const INVALID_INDEX: u32 = u32::MAX;

/// Rotation steps enumerated when rotation-invariant matching is on.
pub const ROTATION_STEPS: u32 = 16;

/// A match produced by querying the forest.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct MatchPair {
    /// Index into the descriptor list the forest was built from.
    pub source: u32,
    /// Index into the query descriptor list.
    pub target: u32,
}

/// The built index. Constructed on the host once per reference frame;
/// the GPU query step uploads `nodes` and `leaf_index` verbatim.
#[derive(Debug, Clone)]
pub struct DescriptorForest {
    /// Leaf count L (power of two).
    pub leaves: u32,
    /// Subtree depth D; leaves per root = 2^D.
    pub levels: u32,
    /// Root count R = L >> D.
    pub roots: u32,
    /// Flat node array, 2L - R cells (roots first, leaves last).
    pub nodes: Vec<Descriptor>,
    /// Original descriptor index per leaf position, INVALID_INDEX for
    /// padding leaves.
    pub leaf_index: Vec<u32>,
}

impl DescriptorForest {
    /// Build the forest over a descriptor list.
    ///
    /// At most `leaves` descriptors are indexed; a longer list is
    /// truncated (the corner capacity upstream keeps lists at or under
    /// the leaf count in the shipped configuration).
    ///
    /// # Panics
    /// Panics if `leaves` is not a power of two, or `levels` is 0, or
    /// `2^levels > leaves`.
    pub fn build(descriptors: &[Descriptor], leaves: u32, levels: u32) -> Self {
        assert!(leaves.is_power_of_two(), "leaf count {leaves} must be a power of two");
        assert!(levels >= 1, "forest needs at least one level");
        assert!(
            (1u32 << levels) <= leaves,
            "2^levels ({}) exceeds leaf count ({leaves})",
            1u32 << levels
        );

        let roots = leaves >> levels;
        let drop = roots - 1;
        let node_count = (2 * leaves - roots) as usize;
        let leaf0 = (leaves - roots) as usize;

        let fill = descriptors.len().min(leaves as usize);

        // Sort so similar codes share subtrees.
        let mut order: Vec<u32> = (0..fill as u32).collect();
        order.sort_by_key(|&i| descriptors[i as usize].sort_key());

        let mut nodes = vec![Descriptor::ZERO; node_count];
        let mut leaf_index = vec![INVALID_INDEX; leaves as usize];

        for (pos, &orig) in order.iter().enumerate() {
            nodes[leaf0 + pos] = descriptors[orig as usize];
            leaf_index[pos] = orig;
        }

        // Internal nodes, bottom-up: heap ids L-2 down to R-1.
        for heap in (roots - 1..leaves - 1).rev() {
            let parent = (heap - drop) as usize;
            let left = (2 * heap + 1 - drop) as usize;
            let right = (2 * heap + 2 - drop) as usize;
            nodes[parent] = nodes[left].union(&nodes[right]);
        }

        DescriptorForest {
            leaves,
            levels,
            roots,
            nodes,
            leaf_index,
        }
    }

    /// Greedy descent from one root; returns (leaf error, leaf position).
    #[inline]
    fn descend(&self, t: &Descriptor, root: u32) -> (u32, u32) {
        let drop = self.roots - 1;
        let mut heap = root + drop;
        let mut last = u32::MAX;

        for _ in 0..self.levels {
            let left = 2 * heap + 1;
            let right = 2 * heap + 2;
            let err_l = t.masked_error(&self.nodes[(left - drop) as usize]);
            let err_r = t.masked_error(&self.nodes[(right - drop) as usize]);
            // Tie keeps the left child (first candidate wins).
            if err_r < err_l {
                heap = right;
                last = err_r;
            } else {
                heap = left;
                last = err_l;
            }
        }

        (last, heap - (self.leaves - 1))
    }

    /// Find the best stored descriptor for every query.
    ///
    /// For each query the minimum leaf error over all roots (and all 16
    /// pattern rotations when `rotate` is set, rotation 0 included) is
    /// taken; the match is kept only if that error is at most
    /// `max_error`. Strict-less comparison everywhere: the first
    /// candidate reaching the minimum wins. Unmatched queries are
    /// dropped, so the output count may be below either input count.
    pub fn query(&self, queries: &[Descriptor], max_error: u32, rotate: bool) -> Vec<MatchPair> {
        let steps = if rotate { ROTATION_STEPS } else { 1 };
        let mut matches = Vec::new();

        for (qi, q) in queries.iter().enumerate() {
            let mut best_err = u32::MAX;
            let mut best_source = INVALID_INDEX;

            for step in 0..steps {
                let t = q.rotate(step);
                for root in 0..self.roots {
                    let (err, leaf_pos) = self.descend(&t, root);
                    let source = self.leaf_index[leaf_pos as usize];
                    if source != INVALID_INDEX && err < best_err {
                        best_err = err;
                        best_source = source;
                    }
                }
            }

            if best_source != INVALID_INDEX && best_err <= max_error {
                matches.push(MatchPair {
                    source: best_source,
                    target: qi as u32,
                });
            }
        }

        matches
    }

    /// Minimum leaf error for one query (diagnostics / tests).
    pub fn best_error(&self, query: &Descriptor, rotate: bool) -> u32 {
        let steps = if rotate { ROTATION_STEPS } else { 1 };
        let mut best = u32::MAX;
        for step in 0..steps {
            let t = query.rotate(step);
            for root in 0..self.roots {
                let (err, leaf_pos) = self.descend(&t, root);
                if self.leaf_index[leaf_pos as usize] != INVALID_INDEX {
                    best = best.min(err);
                }
            }
        }
        best
    }
}
