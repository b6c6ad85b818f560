//! # Criterion Algebra
//!
//! Union, intersection, complement and difference of concrete criteria.
//!
//! `None` from `intersect_criterion` means the operands are disjoint; `None`
//! from `negate_criterion` means the complement is empty; `None` from
//! `merge_criterion` means the union has no single-criterion form and the
//! caller should combine with `$or`.
//!
//! Emptiness checks are conservative: a range like `(1, 2)` over integers is
//! treated as non-empty. Over-reporting overlap only ever makes a cache fetch
//! more than needed, never less.

use super::{Criterion, EntityCriterion, RangeBound, ValueRange};
use crate::types::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Result of [`subtract_criterion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CriterionDifference {
    /// Everything matched by `what` is matched by `by`.
    FullyCovered,
    /// `what` and `by` match nothing in common.
    NoOverlap,
    /// The part of `what` not matched by `by`.
    Residual(Criterion),
}

// =============================================================================
// VALUE SETS
// =============================================================================

/// `$equals`/`$inArray` and `$notEquals`/`$notInArray` as one set algebra.
enum ValueSet {
    Only(BTreeSet<Value>),
    Except(BTreeSet<Value>),
}

fn value_set(criterion: &Criterion) -> Option<ValueSet> {
    match criterion {
        Criterion::Equals(v) => Some(ValueSet::Only(BTreeSet::from([v.clone()]))),
        Criterion::NotEquals(v) => Some(ValueSet::Except(BTreeSet::from([v.clone()]))),
        Criterion::InArray(values) => Some(ValueSet::Only(values.clone())),
        Criterion::NotInArray(values) => Some(ValueSet::Except(values.clone())),
        _ => None,
    }
}

/// Criterion accepting exactly `values`; `None` when empty.
fn only(values: BTreeSet<Value>) -> Option<Criterion> {
    if values.len() == 1 {
        values.into_iter().next().map(Criterion::Equals)
    } else if values.is_empty() {
        None
    } else {
        Some(Criterion::InArray(values))
    }
}

/// Criterion accepting everything but `values`.
fn except(values: BTreeSet<Value>) -> Criterion {
    if values.len() == 1 {
        if let Some(value) = values.iter().next() {
            return Criterion::NotEquals(value.clone());
        }
    }
    Criterion::NotInArray(values)
}

// =============================================================================
// RANGES
// =============================================================================

/// Order of two lower bounds; unbounded is lowest, inclusive before exclusive.
fn lower_cmp(a: Option<&RangeBound>, b: Option<&RangeBound>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x
            .value
            .cmp(&y.value)
            .then_with(|| y.inclusive.cmp(&x.inclusive)),
    }
}

/// Order of two upper bounds; unbounded is highest, exclusive before inclusive.
fn upper_cmp(a: Option<&RangeBound>, b: Option<&RangeBound>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x
            .value
            .cmp(&y.value)
            .then_with(|| x.inclusive.cmp(&y.inclusive)),
    }
}

fn range_is_empty(range: &ValueRange) -> bool {
    match (&range.from, &range.to) {
        (Some(lo), Some(hi)) => match lo.value.cmp(&hi.value) {
            Ordering::Greater => true,
            Ordering::Equal => !(lo.inclusive && hi.inclusive),
            Ordering::Less => false,
        },
        _ => false,
    }
}

fn range_contains(range: &ValueRange, value: &Value) -> bool {
    let above = range.from.as_ref().is_none_or(|lo| match value.cmp(&lo.value) {
        Ordering::Greater => true,
        Ordering::Equal => lo.inclusive,
        Ordering::Less => false,
    });
    let below = range.to.as_ref().is_none_or(|hi| match value.cmp(&hi.value) {
        Ordering::Less => true,
        Ordering::Equal => hi.inclusive,
        Ordering::Greater => false,
    });
    above && below
}

fn range_intersect(a: &ValueRange, b: &ValueRange) -> Option<ValueRange> {
    let from = if lower_cmp(a.from.as_ref(), b.from.as_ref()) == Ordering::Less {
        b.from.clone()
    } else {
        a.from.clone()
    };
    let to = if upper_cmp(a.to.as_ref(), b.to.as_ref()) == Ordering::Greater {
        b.to.clone()
    } else {
        a.to.clone()
    };
    let range = ValueRange::new(from, to);
    (!range_is_empty(&range)).then_some(range)
}

/// Whether `a` ends exactly where `b` starts with no gap.
fn adjacent(a: &ValueRange, b: &ValueRange) -> bool {
    match (&a.to, &b.from) {
        (Some(hi), Some(lo)) => hi.value == lo.value && (hi.inclusive || lo.inclusive),
        _ => false,
    }
}

/// Smallest range covering both, if they overlap or touch.
fn range_union(a: &ValueRange, b: &ValueRange) -> Option<ValueRange> {
    let touching = range_intersect(a, b).is_some() || adjacent(a, b) || adjacent(b, a);
    if !touching {
        return None;
    }
    let from = if lower_cmp(a.from.as_ref(), b.from.as_ref()) == Ordering::Greater {
        b.from.clone()
    } else {
        a.from.clone()
    };
    let to = if upper_cmp(a.to.as_ref(), b.to.as_ref()) == Ordering::Less {
        b.to.clone()
    } else {
        a.to.clone()
    };
    Some(ValueRange::new(from, to))
}

fn flip(bound: &RangeBound) -> RangeBound {
    RangeBound {
        value: bound.value.clone(),
        inclusive: !bound.inclusive,
    }
}

/// At most two ranges covering everything outside `range`.
fn range_complement(range: &ValueRange) -> Vec<ValueRange> {
    let mut pieces = Vec::new();
    if let Some(lo) = &range.from {
        pieces.push(ValueRange::new(None, Some(flip(lo))));
    }
    if let Some(hi) = &range.to {
        pieces.push(ValueRange::new(Some(flip(hi)), None));
    }
    pieces
}

fn is_point(range: &ValueRange) -> bool {
    matches!((&range.from, &range.to), (Some(lo), Some(hi)) if lo.value == hi.value)
}

// =============================================================================
// DISJUNCTION
// =============================================================================

/// Normalised `$or`: flattened, coalesced by pairwise merge, deduplicated.
///
/// Returns the single remaining part when everything coalesced.
pub(crate) fn disjunction(parts: impl IntoIterator<Item = Criterion>) -> Criterion {
    let mut flat = Vec::new();
    for part in parts {
        match part {
            Criterion::Or(inner) => flat.extend(inner),
            other => flat.push(other),
        }
    }
    if let Some(everything) = flat.iter().find(|c| c.matches_everything()) {
        return everything.clone();
    }

    let mut i = 0;
    'scan: while i < flat.len() {
        for j in 0..flat.len() {
            if i == j {
                continue;
            }
            if let Some(merged) = merge_atoms(&flat[i], &flat[j]) {
                let (first, second) = (i.min(j), i.max(j));
                flat.remove(second);
                flat.remove(first);
                flat.push(merged);
                i = 0;
                continue 'scan;
            }
        }
        i += 1;
    }

    let mut unique: Vec<Criterion> = flat
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if unique.len() == 1 {
        if let Some(single) = unique.pop() {
            return single;
        }
    }
    Criterion::Or(unique)
}

/// Merge of two non-`$or` parts that does not itself become an `$or`.
fn merge_atoms(a: &Criterion, b: &Criterion) -> Option<Criterion> {
    if matches!(a, Criterion::Or(_)) || matches!(b, Criterion::Or(_)) {
        return None;
    }
    merge_criterion(a, b).filter(|merged| !matches!(merged, Criterion::Or(_)))
}

// =============================================================================
// MERGE
// =============================================================================

/// Union of two criteria, if expressible as one criterion.
#[must_use]
pub fn merge_criterion(a: &Criterion, b: &Criterion) -> Option<Criterion> {
    if a == b || a.matches_everything() {
        return Some(a.clone());
    }
    if b.matches_everything() {
        return Some(b.clone());
    }
    match (a, b) {
        (Criterion::Or(_), _) | (_, Criterion::Or(_)) => {
            Some(disjunction([a.clone(), b.clone()]))
        }
        (Criterion::And(_), _) | (_, Criterion::And(_)) => {
            if is_criterion_subset_of(a, b) {
                Some(b.clone())
            } else if is_criterion_subset_of(b, a) {
                Some(a.clone())
            } else {
                None
            }
        }
        (Criterion::Entity(x), Criterion::Entity(y)) => merge_entities(x, y),
        (Criterion::InRange(x), Criterion::InRange(y)) => range_union(x, y).map(Criterion::InRange),
        (Criterion::InRange(range), other) | (other, Criterion::InRange(range)) => {
            match value_set(other)? {
                ValueSet::Only(values) => values
                    .iter()
                    .all(|v| range_contains(range, v))
                    .then(|| Criterion::InRange(range.clone())),
                ValueSet::Except(values) => Some(except(
                    values.into_iter().filter(|v| !range_contains(range, v)).collect(),
                )),
            }
        }
        _ => match (value_set(a)?, value_set(b)?) {
            (ValueSet::Only(x), ValueSet::Only(y)) => only(x.union(&y).cloned().collect()),
            (ValueSet::Only(o), ValueSet::Except(e)) | (ValueSet::Except(e), ValueSet::Only(o)) => {
                Some(except(e.difference(&o).cloned().collect()))
            }
            (ValueSet::Except(x), ValueSet::Except(y)) => {
                Some(except(x.intersection(&y).cloned().collect()))
            }
        },
    }
}

/// Entity criteria merge when one absorbs the other or they differ in
/// exactly one field whose criteria merge.
fn merge_entities(x: &EntityCriterion, y: &EntityCriterion) -> Option<Criterion> {
    let (left, right) = (Criterion::Entity(x.clone()), Criterion::Entity(y.clone()));
    if is_criterion_subset_of(&left, &right) {
        return Some(right);
    }
    if is_criterion_subset_of(&right, &left) {
        return Some(left);
    }

    let keys: BTreeSet<&str> = x.keys().chain(y.keys()).collect();
    let mut differing = keys.into_iter().filter(|key| x.get(key) != y.get(key));
    let key = differing.next()?;
    if differing.next().is_some() {
        return None;
    }
    let merged = merge_criterion(x.get(key)?, y.get(key)?)?;
    let mut out = x.clone();
    if merged.matches_everything() {
        out.remove(key);
    } else {
        out.insert(key, merged);
    }
    Some(Criterion::Entity(out))
}

// =============================================================================
// INTERSECT
// =============================================================================

/// Criterion matching what both operands match; `None` when disjoint.
#[must_use]
pub fn intersect_criterion(a: &Criterion, b: &Criterion) -> Option<Criterion> {
    if a.matches_everything() {
        return Some(b.clone());
    }
    if b.matches_everything() {
        return Some(a.clone());
    }
    match (a, b) {
        (Criterion::Or(parts), other) | (other, Criterion::Or(parts)) => {
            let pieces: Vec<_> = parts
                .iter()
                .filter_map(|part| intersect_criterion(part, other))
                .collect();
            (!pieces.is_empty()).then(|| disjunction(pieces))
        }
        (Criterion::And(parts), other) | (other, Criterion::And(parts)) => parts
            .iter()
            .try_fold(other.clone(), |acc, part| intersect_criterion(&acc, part)),
        (Criterion::Entity(x), Criterion::Entity(y)) => {
            intersect_entities(x, y).map(Criterion::Entity)
        }
        (Criterion::Entity(_), _) | (_, Criterion::Entity(_)) => {
            Some(Criterion::And(vec![a.clone(), b.clone()]))
        }
        (Criterion::InRange(x), Criterion::InRange(y)) => {
            range_intersect(x, y).map(Criterion::InRange)
        }
        (Criterion::InRange(range), other) | (other, Criterion::InRange(range)) => {
            match value_set(other) {
                Some(ValueSet::Only(values)) => {
                    only(values.into_iter().filter(|v| range_contains(range, v)).collect())
                }
                Some(ValueSet::Except(values)) => {
                    let inside: BTreeSet<Value> =
                        values.into_iter().filter(|v| range_contains(range, v)).collect();
                    if inside.is_empty() {
                        Some(Criterion::InRange(range.clone()))
                    } else if is_point(range) {
                        None
                    } else {
                        Some(Criterion::And(vec![
                            except(inside),
                            Criterion::InRange(range.clone()),
                        ]))
                    }
                }
                None => Some(Criterion::And(vec![a.clone(), b.clone()])),
            }
        }
        _ => match (value_set(a), value_set(b)) {
            (Some(ValueSet::Only(x)), Some(ValueSet::Only(y))) => {
                only(x.intersection(&y).cloned().collect())
            }
            (Some(ValueSet::Only(o)), Some(ValueSet::Except(e)))
            | (Some(ValueSet::Except(e)), Some(ValueSet::Only(o))) => {
                only(o.difference(&e).cloned().collect())
            }
            (Some(ValueSet::Except(x)), Some(ValueSet::Except(y))) => {
                Some(except(x.union(&y).cloned().collect()))
            }
            _ => Some(Criterion::And(vec![a.clone(), b.clone()])),
        },
    }
}

fn intersect_entities(x: &EntityCriterion, y: &EntityCriterion) -> Option<EntityCriterion> {
    let mut out = x.clone();
    for (key, criterion) in y.iter() {
        let combined = match out.get(key) {
            Some(existing) => intersect_criterion(existing, criterion)?,
            None => criterion.clone(),
        };
        out.insert(key, combined);
    }
    Some(out)
}

// =============================================================================
// NEGATE / SUBTRACT
// =============================================================================

/// Complement of a criterion; `None` when `criterion` matches everything.
///
/// Entity criteria are complemented into disjoint parts:
/// `not (a and b) = (not a) or (a and not b)`.
#[must_use]
pub fn negate_criterion(criterion: &Criterion) -> Option<Criterion> {
    match criterion {
        Criterion::Equals(v) => Some(Criterion::NotEquals(v.clone())),
        Criterion::NotEquals(v) => Some(Criterion::Equals(v.clone())),
        Criterion::InArray(values) => Some(except(values.clone())),
        Criterion::NotInArray(values) => only(values.clone()),
        Criterion::InRange(range) => {
            let mut pieces: Vec<Criterion> =
                range_complement(range).into_iter().map(Criterion::InRange).collect();
            match pieces.len() {
                0 => None,
                1 => pieces.pop(),
                _ => Some(Criterion::Or(pieces)),
            }
        }
        Criterion::Entity(entity) => {
            let mut pieces = Vec::new();
            let mut prefix = EntityCriterion::new();
            for (key, part) in entity.iter() {
                if let Some(complement) = negate_criterion(part) {
                    pieces.push(Criterion::Entity(prefix.clone().with(key, complement)));
                }
                prefix.insert(key, part.clone());
            }
            (!pieces.is_empty()).then(|| disjunction(pieces))
        }
        Criterion::And(parts) => {
            let pieces: Vec<_> = parts.iter().filter_map(negate_criterion).collect();
            (!pieces.is_empty()).then(|| disjunction(pieces))
        }
        Criterion::Or(parts) => parts.iter().try_fold(Criterion::everything(), |acc, part| {
            intersect_criterion(&acc, &negate_criterion(part)?)
        }),
    }
}

/// What `what` matches that `by` does not.
#[must_use]
pub fn subtract_criterion(what: &Criterion, by: &Criterion) -> CriterionDifference {
    if intersect_criterion(what, by).is_none() {
        return CriterionDifference::NoOverlap;
    }
    let Some(complement) = negate_criterion(by) else {
        return CriterionDifference::FullyCovered;
    };
    match intersect_criterion(what, &complement) {
        None => CriterionDifference::FullyCovered,
        Some(rest) if &rest == what => CriterionDifference::NoOverlap,
        Some(rest) => CriterionDifference::Residual(rest),
    }
}

/// Whether everything matched by `what` is matched by `of`.
#[must_use]
pub fn is_criterion_subset_of(what: &Criterion, of: &Criterion) -> bool {
    subtract_criterion(what, of) == CriterionDifference::FullyCovered
}

// =============================================================================
// TESTS
// =============================================================================
