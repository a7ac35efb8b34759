//! Tournament tree for the k-way merge.
//!
//! A loser tree over per-channel leaves. Each leaf buffers the incoming
//! FIFO of one channel; internal nodes cache the winning (minimum) leaf of
//! their subtree. The tree yields only when every leaf has at least one
//! buffered value, so a globally ordered pop needs nothing beyond
//! per-channel monotone input.
//!
//! Nodes live in index-addressed arenas rather than a pointer graph; the
//! channel count is fixed at construction, matching the configure-time
//! registration model of the sort engine.

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::buffer::DaqBuffer;

/// Reference to a tree position: either a leaf or an internal node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Leaf(usize),
    Node(usize),
}

/// Internal node caching the winning leaf of its subtree.
#[derive(Debug)]
struct Internal {
    left: Slot,
    right: Slot,
    parent: Option<usize>,
    /// Index of the winning leaf, or None when the path was invalidated.
    winner: Option<usize>,
}

/// A leaf: one channel's FIFO of buffered values.
#[derive(Debug)]
struct Leaf {
    fifo: VecDeque<DaqBuffer>,
    parent: Option<usize>,
}

/// Path scratch for invalidation walks; depth stays within 16 for any
/// realistic channel count.
type Path = SmallVec<[usize; 16]>;

/// Loser tree merging a fixed set of channel leaves.
///
/// `push` appends to a leaf and invalidates its path to the root;
/// `pop` removes and returns the global minimum (by `(timestamp, mbid)`)
/// and re-evaluates only the winner's path. Both are O(log N).
#[derive(Debug)]
pub struct TournamentTree {
    leaves: Vec<Leaf>,
    nodes: Vec<Internal>,
    root: Slot,
    /// Number of leaves currently holding at least one value.
    nonempty: usize,
}

impl TournamentTree {
    /// Builds a tree over `leaf_count` channels.
    ///
    /// Leaves are paired greedily; an odd leaf is promoted unchanged to the
    /// next level. A single-leaf tree degenerates to the leaf itself.
    ///
    /// # Panics
    ///
    /// Panics if `leaf_count` is 0.
    #[must_use]
    pub fn new(leaf_count: usize) -> Self {
        assert!(leaf_count > 0, "tree needs at least one leaf");

        let leaves: Vec<Leaf> = (0..leaf_count)
            .map(|_| Leaf {
                fifo: VecDeque::new(),
                parent: None,
            })
            .collect();

        let mut tree = Self {
            leaves,
            nodes: Vec::with_capacity(leaf_count.saturating_sub(1)),
            root: Slot::Leaf(0),
            nonempty: 0,
        };

        // Pair slots level by level until one remains.
        let mut level: Vec<Slot> = (0..leaf_count).map(Slot::Leaf).collect();
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            let mut it = level.into_iter();
            while let Some(left) = it.next() {
                if let Some(right) = it.next() {
                    let idx = tree.nodes.len();
                    tree.nodes.push(Internal {
                        left,
                        right,
                        parent: None,
                        winner: None,
                    });
                    tree.set_parent(left, idx);
                    tree.set_parent(right, idx);
                    next.push(Slot::Node(idx));
                } else {
                    next.push(left);
                }
            }
            level = next;
        }
        tree.root = level[0];
        tree
    }

    /// Returns the number of leaves.
    #[inline]
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// True iff some leaf has no buffered value.
    ///
    /// While this holds, `pop` yields nothing: emitting would risk
    /// overtaking a value still in flight on the starved channel.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nonempty < self.leaves.len()
    }

    /// Returns the number of values buffered on the given leaf.
    #[must_use]
    pub fn leaf_depth(&self, leaf: usize) -> usize {
        self.leaves[leaf].fifo.len()
    }

    /// Appends a value to a leaf and invalidates its path to the root.
    ///
    /// Correctness of the merge depends on per-leaf values arriving in
    /// nondecreasing timestamp order; the tree performs no re-sort.
    ///
    /// # Panics
    ///
    /// Panics if `leaf` is out of range.
    pub fn push(&mut self, leaf: usize, value: DaqBuffer) {
        let node = &mut self.leaves[leaf];
        node.fifo.push_back(value);
        if node.fifo.len() == 1 {
            self.nonempty += 1;
        }
        self.invalidate_path(leaf);
    }

    /// Pops the global minimum, or `None` while any leaf is starved.
    pub fn pop(&mut self) -> Option<DaqBuffer> {
        if self.is_empty() {
            return None;
        }

        let winner = self.evaluate(self.root);
        let value = self.leaves[winner].fifo.pop_front()?;
        if self.leaves[winner].fifo.is_empty() {
            self.nonempty -= 1;
        }
        self.invalidate_path(winner);
        Some(value)
    }

    fn set_parent(&mut self, slot: Slot, parent: usize) {
        match slot {
            Slot::Leaf(i) => self.leaves[i].parent = Some(parent),
            Slot::Node(i) => self.nodes[i].parent = Some(parent),
        }
    }

    /// Clears cached winners from a leaf up to the root.
    fn invalidate_path(&mut self, leaf: usize) {
        let mut path = Path::new();
        let mut current = self.leaves[leaf].parent;
        while let Some(idx) = current {
            path.push(idx);
            current = self.nodes[idx].parent;
        }
        for idx in path {
            self.nodes[idx].winner = None;
        }
    }

    /// Resolves the winning leaf of a subtree, recomputing only
    /// invalidated nodes. Every leaf is non-empty when this runs.
    fn evaluate(&mut self, slot: Slot) -> usize {
        match slot {
            Slot::Leaf(i) => i,
            Slot::Node(i) => {
                if let Some(w) = self.nodes[i].winner {
                    return w;
                }
                let (left, right) = (self.nodes[i].left, self.nodes[i].right);
                let lw = self.evaluate(left);
                let rw = self.evaluate(right);
                let winner = if self.head_key(lw) <= self.head_key(rw) {
                    lw
                } else {
                    rw
                };
                self.nodes[i].winner = Some(winner);
                winner
            }
        }
    }

    fn head_key(&self, leaf: usize) -> (i64, u64) {
        // Callers guarantee the leaf is non-empty.
        self.leaves[leaf]
            .fifo
            .front()
            .map_or((i64::MAX, u64::MAX), DaqBuffer::sort_key)
    }
}
