//! Pair-memoised walk shared by the binary selection operations.
//!
//! The walk visits `(left, right)` node pairs. The result node for a pair is
//! allocated and recorded before its children are visited, so revisiting a
//! pair (a cycle on either side) links back to the node under construction
//! instead of recursing. Per key, a [`PairStrategy`] decides the outcome.

use super::{NodeId, Selection, Slot, graft};
use crate::QuarryError;
use std::collections::{BTreeMap, BTreeSet};

/// Outcome of one key of a node pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Step {
    /// Omit the key from the result.
    Drop,
    /// Emit a leaf.
    Leaf,
    /// Copy the left slot (and its subtree) as is.
    KeepLeft,
    /// Copy the right slot (and its subtree) as is.
    KeepRight,
    /// Both slots are nodes: combine them pairwise.
    Descend,
}

pub(super) trait PairStrategy {
    fn step(
        &mut self,
        key: &str,
        left: Option<Slot>,
        right: Option<Slot>,
    ) -> Result<Step, QuarryError>;
}

pub(super) fn incompatible(key: &str) -> QuarryError {
    QuarryError::IncompatibleSelection {
        key: key.to_string(),
    }
}

pub(super) struct PairWalk<'a, S> {
    left: &'a Selection,
    right: &'a Selection,
    strategy: S,
    out: Selection,
    visited: BTreeMap<(NodeId, NodeId), NodeId>,
    left_copies: BTreeMap<NodeId, NodeId>,
    right_copies: BTreeMap<NodeId, NodeId>,
}

impl<'a, S: PairStrategy> PairWalk<'a, S> {
    pub(super) fn new(left: &'a Selection, right: &'a Selection, strategy: S) -> Self {
        Self {
            left,
            right,
            strategy,
            out: Selection::arena(),
            visited: BTreeMap::new(),
            left_copies: BTreeMap::new(),
            right_copies: BTreeMap::new(),
        }
    }

    /// Walk from both roots. Returns the (unpruned) result and the strategy.
    pub(super) fn run(mut self) -> Result<(Selection, S), QuarryError> {
        let (left_root, right_root) = (self.left.root(), self.right.root());
        self.visit(left_root, right_root)?;
        Ok((self.out, self.strategy))
    }

    fn visit(&mut self, a: NodeId, b: NodeId) -> Result<NodeId, QuarryError> {
        if let Some(&done) = self.visited.get(&(a, b)) {
            return Ok(done);
        }
        let node = self.out.alloc();
        self.visited.insert((a, b), node);

        let (left, right) = (self.left, self.right);
        let keys: BTreeSet<&'a str> = left
            .slots(a)
            .map(|(k, _)| k)
            .chain(right.slots(b).map(|(k, _)| k))
            .collect();

        for key in keys {
            let (l, r) = (left.slot(a, key), right.slot(b, key));
            match self.strategy.step(key, l, r)? {
                Step::Drop => {}
                Step::Leaf => self.out.set(node, key, Slot::Leaf),
                Step::KeepLeft => {
                    if let Some(slot) = l {
                        let copied = copy_slot(&mut self.out, left, slot, &mut self.left_copies);
                        self.out.set(node, key, copied);
                    }
                }
                Step::KeepRight => {
                    if let Some(slot) = r {
                        let copied =
                            copy_slot(&mut self.out, right, slot, &mut self.right_copies);
                        self.out.set(node, key, copied);
                    }
                }
                Step::Descend => match (l, r) {
                    (Some(Slot::Node(x)), Some(Slot::Node(y))) => {
                        let child = self.visit(x, y)?;
                        self.out.set(node, key, Slot::Node(child));
                    }
                    _ => return Err(incompatible(key)),
                },
            }
        }
        Ok(node)
    }
}

fn copy_slot(
    out: &mut Selection,
    src: &Selection,
    slot: Slot,
    memo: &mut BTreeMap<NodeId, NodeId>,
) -> Slot {
    match slot {
        Slot::Leaf => Slot::Leaf,
        Slot::Node(node) => Slot::Node(graft(out, src, node, memo, None)),
    }
}
