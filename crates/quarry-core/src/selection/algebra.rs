//! # Selection Algebra
//!
//! Union, intersection, difference and projection of selections.
//!
//! Every binary operation runs on the pair-memoised walk in `engine`, so
//! recursive operands terminate and recursive results come out as
//! self-references rather than finite unrolls.

use super::engine::{PairStrategy, PairWalk, Step, incompatible};
use super::{PackedSelection, Selection, Slot};
use crate::QuarryError;

// =============================================================================
// OUTCOMES
// =============================================================================

/// Result of [`subtract_selection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionDifference {
    /// `by` covers all of `what`.
    FullyCovered,
    /// `by` removes nothing from `what`.
    NoOverlap,
    /// What is left of `what` after removing `by`.
    Residual(Selection),
}

// =============================================================================
// STRATEGIES
// =============================================================================

struct Union;

impl PairStrategy for Union {
    fn step(
        &mut self,
        key: &str,
        left: Option<Slot>,
        right: Option<Slot>,
    ) -> Result<Step, QuarryError> {
        Ok(match (left, right) {
            (Some(Slot::Leaf), Some(Slot::Leaf)) => Step::Leaf,
            (Some(Slot::Node(_)), Some(Slot::Node(_))) => Step::Descend,
            (Some(_), Some(_)) => return Err(incompatible(key)),
            (Some(_), None) => Step::KeepLeft,
            (None, Some(_)) => Step::KeepRight,
            (None, None) => Step::Drop,
        })
    }
}

struct Overlap;

impl PairStrategy for Overlap {
    fn step(
        &mut self,
        key: &str,
        left: Option<Slot>,
        right: Option<Slot>,
    ) -> Result<Step, QuarryError> {
        Ok(match (left, right) {
            (Some(Slot::Leaf), Some(Slot::Leaf)) => Step::Leaf,
            (Some(Slot::Node(_)), Some(Slot::Node(_))) => Step::Descend,
            (Some(_), Some(_)) => return Err(incompatible(key)),
            _ => Step::Drop,
        })
    }
}

/// Tracks whether anything of `what` was removed.
struct Difference {
    removed: bool,
}

impl PairStrategy for Difference {
    fn step(
        &mut self,
        key: &str,
        what: Option<Slot>,
        by: Option<Slot>,
    ) -> Result<Step, QuarryError> {
        Ok(match (what, by) {
            (Some(Slot::Leaf), Some(Slot::Leaf)) => {
                self.removed = true;
                Step::Drop
            }
            (Some(Slot::Node(_)), Some(Slot::Node(_))) => Step::Descend,
            (Some(_), Some(_)) => return Err(incompatible(key)),
            (Some(_), None) => Step::KeepLeft,
            (None, _) => Step::Drop,
        })
    }
}

/// Left operand is the mask, right operand the selection being projected.
struct Projection;

impl PairStrategy for Projection {
    fn step(
        &mut self,
        key: &str,
        mask: Option<Slot>,
        selection: Option<Slot>,
    ) -> Result<Step, QuarryError> {
        Ok(match (mask, selection) {
            (Some(Slot::Leaf), Some(Slot::Leaf)) => Step::Leaf,
            (Some(Slot::Leaf), Some(Slot::Node(_))) => Step::KeepRight,
            (Some(Slot::Node(_)), Some(Slot::Node(_))) => Step::Descend,
            (Some(Slot::Node(_)), Some(Slot::Leaf)) => return Err(incompatible(key)),
            _ => Step::Drop,
        })
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

/// Least selection covering both `a` and `b`.
pub fn merge_selection(a: &Selection, b: &Selection) -> Result<Selection, QuarryError> {
    let (merged, _) = PairWalk::new(a, b, Union).run()?;
    Ok(merged)
}

/// Keys selected by both operands; `None` when they share nothing.
pub fn intersect_selection(
    a: &Selection,
    b: &Selection,
) -> Result<Option<Selection>, QuarryError> {
    let (shared, _) = PairWalk::new(a, b, Overlap).run()?;
    Ok(shared.omit_empty())
}

/// Remove from `what` everything `by` selects.
pub fn subtract_selection(
    what: &Selection,
    by: &Selection,
) -> Result<SelectionDifference, QuarryError> {
    let (rest, strategy) = PairWalk::new(what, by, Difference { removed: false }).run()?;
    Ok(match rest.omit_empty() {
        None => SelectionDifference::FullyCovered,
        Some(_) if !strategy.removed => SelectionDifference::NoOverlap,
        Some(residual) => SelectionDifference::Residual(residual),
    })
}

/// Whether `of` selects everything `what` selects.
pub fn is_selection_subset_of(what: &Selection, of: &Selection) -> Result<bool, QuarryError> {
    Ok(subtract_selection(what, of)? == SelectionDifference::FullyCovered)
}

/// Project `selection` through a capability mask.
///
/// `*` in the mask repeats the enclosing mask node at any depth. A mask leaf
/// on a relation serves the whole nested selection. `None` when nothing is
/// servable.
pub fn reshape_selection(
    shape: &PackedSelection,
    selection: &Selection,
) -> Result<Option<Selection>, QuarryError> {
    let mask = Selection::try_from(shape)?;
    reshape_selection_by(&mask, selection)
}

/// [`reshape_selection`] with an already unpacked mask.
pub fn reshape_selection_by(
    mask: &Selection,
    selection: &Selection,
) -> Result<Option<Selection>, QuarryError> {
    let (servable, _) = PairWalk::new(mask, selection, Projection).run()?;
    Ok(servable.omit_empty())
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
    fn merge_unions_keys() {
        let merged = merge_selection(&sel("{ id, foo: { a } }"), &sel("{ name, foo: { b } }"))
            .expect("merge");
        assert_eq!(merged.to_string(), "{ foo: { a, b }, id, name }");
    }

    #[test]
    fn merge_keeps_one_sided_recursion() {
        let merged = merge_selection(&sel("{ id }"), &sel("{ name, next: * }")).expect("merge");
        assert_eq!(merged.to_string(), "{ id, name, next: { name, next: * } }");
    }

    #[test]
    fn merge_of_two_recursions_stays_recursive() {
        let merged =
            merge_selection(&sel("{ id, next: * }"), &sel("{ name, next: * }")).expect("merge");
        assert_eq!(merged, sel("{ id, name, next: * }"));
    }

    #[test]
    fn leaf_against_nested_fails_with_key() {
        let err = merge_selection(&sel("{ foo }"), &sel("{ foo: { bar } }"))
            .expect_err("incompatible");
        assert_eq!(err, QuarryError::IncompatibleSelection { key: "foo".to_string() });
    }

    #[test]
    fn intersect_keeps_shared_keys() {
        let shared = intersect_selection(
            &sel("{ id, name, foo: { a, b } }"),
            &sel("{ name, foo: { b, c } }"),
        )
        .expect("intersect")
            .expect("overlap");
        assert_eq!(shared.to_string(), "{ foo: { b }, name }");
    }

    #[test]
    fn intersect_without_shared_keys_is_none() {
        let shared = intersect_selection(&sel("{ id }"), &sel("{ name }")).expect("intersect");
        assert!(shared.is_none());
        let shared =
            intersect_selection(&sel("{ foo: { a } }"), &sel("{ foo: { b } }")).expect("intersect");
        assert!(shared.is_none());
    }

    #[test]
    fn subtract_outcomes() {
        let what = sel("{ id, name, foo: { a, b } }");
        assert_eq!(
            subtract_selection(&what, &sel("{ id, name, foo: { a, b, c } }")).expect("subtract"),
            SelectionDifference::FullyCovered
        );
        assert_eq!(
            subtract_selection(&what, &sel("{ other }")).expect("subtract"),
            SelectionDifference::NoOverlap
        );
        assert_eq!(
            subtract_selection(&what, &sel("{ id, foo: { a } }")).expect("subtract"),
            SelectionDifference::Residual(sel("{ name, foo: { b } }"))
        );
    }

    #[test]
    fn subtract_recursion_from_itself_is_covered() {
        let what = sel("{ id, next: * }");
        assert_eq!(
            subtract_selection(&what, &what).expect("subtract"),
            SelectionDifference::FullyCovered
        );
    }

    #[test]
    fn subtract_shallow_from_recursion_keeps_deeper_levels() {
        let rest = subtract_selection(&sel("{ id, next: * }"), &sel("{ id }")).expect("subtract");
        assert_eq!(rest, SelectionDifference::Residual(sel("{ next: { id, next: * } }")));
    }

    #[test]
    fn subset_follows_subtract() {
        assert!(is_selection_subset_of(&sel("{ id }"), &sel("{ id, name }")).expect("subset"));
        assert!(!is_selection_subset_of(&sel("{ id, name }"), &sel("{ id }")).expect("subset"));
        assert!(
            is_selection_subset_of(&sel("{ id, next: { id } }"), &sel("{ id, next: * }"))
                .expect("subset")
        );
    }

    #[test]
    fn reshape_with_wildcard_mask_collapses_recursion() {
        let mask: PackedSelection = "{ id, next: * }".parse().expect("mask");
        let servable = reshape_selection(&mask, &sel("{ id, name, next: * }"))
            .expect("reshape")
            .expect("servable");
        assert_eq!(servable, sel("{ id, next: * }"));
    }

    #[test]
    fn reshape_leaf_mask_serves_nested_value() {
        let mask: PackedSelection = "{ owner }".parse().expect("mask");
        let servable = reshape_selection(&mask, &sel("{ id, owner: { name } }"))
            .expect("reshape")
            .expect("servable");
        assert_eq!(servable.to_string(), "{ owner: { name } }");
    }

    #[test]
    fn reshape_without_common_keys_is_none() {
        let mask: PackedSelection = "{ id }".parse().expect("mask");
        assert!(reshape_selection(&mask, &sel("{ name }")).expect("reshape").is_none());
    }
}
