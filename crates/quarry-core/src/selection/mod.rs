//! # Selection Trees
//!
//! A `Selection` describes which primitive fields and relations of an entity
//! (and, recursively, of its related entities) should be loaded.
//!
//! ## Representation
//!
//! Nodes live in an arena owned by the selection; `NodeId(0)` is the root.
//! Each node maps a property name to a [`Slot`]: either the leaf marker or a
//! handle to a nested node. Recursion ("select this shape indefinitely deep")
//! is a slot pointing back at an already allocated node, never a
//! materialised unroll. Every operation keys its memo tables by handle, so
//! cyclic selections terminate in time proportional to the number of nodes.
//!
//! Selections are immutable values: algebra functions build new arenas.

pub mod algebra;
mod engine;
pub mod pack;
pub mod packed;

pub use packed::{PackedSelection, PackedValue};

use crate::QuarryError;
use crate::primitives::WILDCARD;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// HANDLES
// =============================================================================

/// Handle of a node inside one selection's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

impl NodeId {
    /// Position of the node in its arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Value of one property in a selection node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Primitive field selected.
    Leaf,
    /// Relation selected with the sub-selection rooted at this node.
    Node(NodeId),
}

// =============================================================================
// SELECTION
// =============================================================================

/// A field/relation projection tree, possibly cyclic.
#[derive(Debug, Clone)]
pub struct Selection {
    nodes: Vec<BTreeMap<String, Slot>>,
}

impl Default for Selection {
    fn default() -> Self {
        Self::new()
    }
}

impl Selection {
    /// Create a selection with an empty root.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![BTreeMap::new()],
        }
    }

    /// An arena without a root. The first `alloc` creates the root.
    pub(crate) fn arena() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Parse the literal text form, e.g. `{ id, branches: * }`.
    ///
    /// No schema defaults are applied; see [`pack::unpack_selection`] for
    /// that.
    pub fn parse(text: &str) -> Result<Self, QuarryError> {
        let packed: PackedSelection = text.parse()?;
        Self::try_from(&packed)
    }

    #[must_use]
    pub const fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub(crate) fn alloc(&mut self) -> NodeId {
        self.nodes.push(BTreeMap::new());
        NodeId(self.nodes.len() - 1)
    }

    pub(crate) fn set(&mut self, node: NodeId, key: &str, slot: Slot) {
        if let Some(slots) = self.nodes.get_mut(node.0) {
            slots.insert(key.to_string(), slot);
        }
    }

    /// Iterate the slots of `node` in key order.
    pub fn slots(&self, node: NodeId) -> impl Iterator<Item = (&str, Slot)> {
        self.nodes
            .get(node.0)
            .into_iter()
            .flat_map(|slots| slots.iter().map(|(k, s)| (k.as_str(), *s)))
    }

    /// The slot of `key` in `node`.
    #[must_use]
    pub fn slot(&self, node: NodeId, key: &str) -> Option<Slot> {
        self.nodes.get(node.0)?.get(key).copied()
    }

    /// The slot of `key` in the root node.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Slot> {
        self.slot(self.root(), key)
    }

    /// Root keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.slots(self.root()).map(|(k, _)| k)
    }

    /// Number of nodes in the arena.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of leaf slots over all reachable nodes, each node counted once.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        let mut seen = BTreeSet::new();
        let mut pending = vec![self.root()];
        let mut count = 0;
        while let Some(node) = pending.pop() {
            if !seen.insert(node) {
                continue;
            }
            for (_, slot) in self.slots(node) {
                match slot {
                    Slot::Leaf => count += 1,
                    Slot::Node(child) => pending.push(child),
                }
            }
        }
        count
    }

    /// The sub-selection of a root relation key, copied into its own arena.
    #[must_use]
    pub fn subselection(&self, key: &str) -> Option<Self> {
        match self.get(key)? {
            Slot::Leaf => None,
            Slot::Node(child) => {
                let mut out = Self::arena();
                graft(&mut out, self, child, &mut BTreeMap::new(), None);
                Some(out)
            }
        }
    }

    /// Whether the selection retains no leaf reachable through non-empty
    /// relations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.live_nodes().first().copied().unwrap_or(false)
    }

    /// Prune empty sub-selections.
    ///
    /// A node is live when it has a leaf or a live child; recursive edges
    /// alone do not make a node live. Returns `None` when the root itself is
    /// empty.
    #[must_use]
    pub fn omit_empty(&self) -> Option<Self> {
        let live = self.live_nodes();
        if !live.first().copied().unwrap_or(false) {
            return None;
        }
        let mut out = Self::arena();
        graft(&mut out, self, self.root(), &mut BTreeMap::new(), Some(&live));
        Some(out)
    }

    /// Least fixpoint of "has a leaf or a live child".
    fn live_nodes(&self) -> Vec<bool> {
        let mut live = vec![false; self.nodes.len()];
        let mut changed = true;
        while changed {
            changed = false;
            for (index, slots) in self.nodes.iter().enumerate() {
                if live[index] {
                    continue;
                }
                let alive = slots.values().any(|slot| match slot {
                    Slot::Leaf => true,
                    Slot::Node(child) => live.get(child.0).copied().unwrap_or(false),
                });
                if alive {
                    live[index] = true;
                    changed = true;
                }
            }
        }
        live
    }

    /// Literal packed form: every slot kept, back-references as `*`.
    #[must_use]
    pub fn to_packed(&self) -> PackedSelection {
        let mut stack = Vec::new();
        self.pack_literal(self.root(), &mut stack)
    }

    fn pack_literal(&self, node: NodeId, stack: &mut Vec<NodeId>) -> PackedSelection {
        stack.push(node);
        let mut packed = PackedSelection::new();
        for (key, slot) in self.slots(node) {
            let value = match slot {
                Slot::Leaf => PackedValue::Leaf,
                Slot::Node(child) if stack.contains(&child) => PackedValue::Wildcard,
                Slot::Node(child) => PackedValue::Nested(self.pack_literal(child, stack)),
            };
            packed.insert(key, value);
        }
        stack.pop();
        packed
    }

    /// Structural equivalence of two nodes, cycle-safe (bisimulation).
    pub(crate) fn node_equivalent(&self, a: NodeId, other: &Self, b: NodeId) -> bool {
        self.equivalent(a, other, b, &mut BTreeSet::new())
    }

    fn equivalent(
        &self,
        a: NodeId,
        other: &Self,
        b: NodeId,
        assumed: &mut BTreeSet<(NodeId, NodeId)>,
    ) -> bool {
        if !assumed.insert((a, b)) {
            return true;
        }
        let (Some(left), Some(right)) = (self.nodes.get(a.0), other.nodes.get(b.0)) else {
            return false;
        };
        if left.len() != right.len() {
            return false;
        }
        left.iter().all(|(key, slot)| match (slot, right.get(key)) {
            (Slot::Leaf, Some(Slot::Leaf)) => true,
            (Slot::Node(x), Some(Slot::Node(y))) => self.equivalent(*x, other, *y, assumed),
            _ => false,
        })
    }

    fn write_node(
        &self,
        f: &mut fmt::Formatter<'_>,
        node: NodeId,
        stack: &mut Vec<NodeId>,
    ) -> fmt::Result {
        let Some(slots) = self.nodes.get(node.0) else {
            return write!(f, "{{}}");
        };
        if slots.is_empty() {
            return write!(f, "{{}}");
        }
        stack.push(node);
        write!(f, "{{ ")?;
        for (i, (key, slot)) in slots.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}")?;
            if let Slot::Node(child) = slot {
                if stack.contains(child) {
                    write!(f, ": {WILDCARD}")?;
                } else {
                    write!(f, ": ")?;
                    self.write_node(f, *child, stack)?;
                }
            }
        }
        stack.pop();
        write!(f, " }}")
    }
}

/// Copy the subtree of `src` rooted at `node` into `out`.
///
/// `memo` maps source handles to copies so cycles and shared nodes are
/// preserved. With `live`, edges to dead nodes are skipped.
pub(crate) fn graft(
    out: &mut Selection,
    src: &Selection,
    node: NodeId,
    memo: &mut BTreeMap<NodeId, NodeId>,
    live: Option<&[bool]>,
) -> NodeId {
    if let Some(&copy) = memo.get(&node) {
        return copy;
    }
    let copy = out.alloc();
    memo.insert(node, copy);
    for (key, slot) in src.slots(node) {
        match slot {
            Slot::Leaf => out.set(copy, key, Slot::Leaf),
            Slot::Node(child) => {
                let keep = live.is_none_or(|live| live.get(child.0).copied().unwrap_or(false));
                if keep {
                    let grafted = graft(out, src, child, memo, live);
                    out.set(copy, key, Slot::Node(grafted));
                }
            }
        }
    }
    copy
}

impl PartialEq for Selection {
    fn eq(&self, other: &Self) -> bool {
        self.node_equivalent(self.root(), other, other.root())
    }
}

impl Eq for Selection {}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_node(f, self.root(), &mut Vec::new())
    }
}

impl FromStr for Selection {
    type Err = QuarryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&PackedSelection> for Selection {
    type Error = QuarryError;

    /// Literal conversion: leaves stay leaves, `*` becomes a self-reference
    /// of the containing node. No schema defaults are applied.
    fn try_from(packed: &PackedSelection) -> Result<Self, Self::Error> {
        let mut out = Self::arena();
        build_literal(packed, &mut out)?;
        Ok(out)
    }
}

fn build_literal(packed: &PackedSelection, out: &mut Selection) -> Result<NodeId, QuarryError> {
    let node = out.alloc();
    let mut anchor: Option<&str> = None;
    for (key, value) in packed.iter() {
        match value {
            PackedValue::Leaf => out.set(node, key, Slot::Leaf),
            PackedValue::Wildcard => {
                if let Some(first) = anchor {
                    return Err(QuarryError::AmbiguousRecursion {
                        first: first.to_string(),
                        second: key.to_string(),
                    });
                }
                anchor = Some(key);
                out.set(node, key, Slot::Node(node));
            }
            PackedValue::Nested(inner) => {
                let child = build_literal(inner, out)?;
                out.set(node, key, Slot::Node(child));
            }
        }
    }
    Ok(node)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sel(text: &str) -> Selection {
        Selection::parse(text).expect("selection")
    }

    #[test]
    fn display_is_sorted_and_marks_recursion() {
        let s = sel("{ tree: *, id, foo: { bar } }");
        assert_eq!(s.to_string(), "{ foo: { bar }, id, tree: * }");
    }

    #[test]
    fn wildcard_becomes_self_reference() {
        let s = sel("{ id, branches: * }");
        assert_eq!(s.get("branches"), Some(Slot::Node(s.root())));
        assert_eq!(s.node_count(), 1);
    }

    #[test]
    fn two_wildcards_on_one_level_are_ambiguous() {
        let err = Selection::parse("{ a: *, b: * }").expect_err("ambiguous");
        assert_eq!(
            err,
            QuarryError::AmbiguousRecursion {
                first: "a".to_string(),
                second: "b".to_string()
            }
        );
    }

    #[test]
    fn equality_is_structural_for_cycles() {
        // one unroll of the same recursion is still the same selection
        let unrolled = {
            let mut s = Selection::new();
            let inner = s.alloc();
            s.set(s.root(), "id", Slot::Leaf);
            s.set(s.root(), "next", Slot::Node(inner));
            s.set(inner, "id", Slot::Leaf);
            s.set(inner, "next", Slot::Node(inner));
            s
        };
        assert_eq!(unrolled, sel("{ id, next: * }"));
        assert_ne!(sel("{ id, next: * }"), sel("{ id, next: { id } }"));
    }

    #[test]
    fn omit_empty_prunes_dead_branches() {
        let s = sel("{ foo: {}, bar: { baz: {} }, id }");
        let pruned = s.omit_empty().expect("non-empty");
        assert_eq!(pruned.to_string(), "{ id }");
    }

    #[test]
    fn all_recursive_residue_is_empty() {
        let s = sel("{ next: * }");
        assert!(s.is_empty());
        assert!(s.omit_empty().is_none());
        assert!(!sel("{ id, next: * }").is_empty());
    }

    #[test]
    fn leaf_count_counts_each_node_once() {
        assert_eq!(sel("{ id, next: * }").leaf_count(), 1);
        assert_eq!(sel("{ id, foo: { a, b } }").leaf_count(), 3);
    }

    #[test]
    fn subselection_copies_subtree() {
        let s = sel("{ id, foo: { bar, foo: * } }");
        let sub = s.subselection("foo").expect("relation");
        assert_eq!(sub.to_string(), "{ bar, foo: * }");
        assert!(s.subselection("id").is_none());
    }

    #[test]
    fn literal_pack_round_trips() {
        let s = sel("{ id, next: *, foo: { bar } }");
        assert_eq!(Selection::try_from(&s.to_packed()).expect("unpack"), s);
    }
}
