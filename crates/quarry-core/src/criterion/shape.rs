//! # Criterion Shapes
//!
//! The filter capability of a data source: which operators it accepts on
//! which fields, and which of those fields a request must provide.
//!
//! A relation entry nests the shape of the related entity. A recursive entry
//! (`*`) repeats the enclosing shape at any depth; it is resolved lazily
//! against the enclosing shape whenever an operation needs to look inside.
//!
//! This module also matches concrete criteria against capabilities
//! ([`reshape_criterion`]) and scores shapes by how many entities they can
//! pin down ([`criterion_shape_unique_count`]).

use super::algebra::disjunction;
use super::{Criterion, EntityCriterion, Operator, ValueRange};
use crate::QuarryError;
use crate::primitives::WILDCARD;
use crate::schema::{EntitySchema, SchemaCatalog};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// =============================================================================
// TYPES
// =============================================================================

/// Operators accepted on one primitive field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldShape {
    pub operators: BTreeSet<Operator>,
    #[serde(default)]
    pub optional: bool,
}

impl FieldShape {
    /// A field every request must constrain.
    #[must_use]
    pub fn required(operators: impl IntoIterator<Item = Operator>) -> Self {
        Self {
            operators: operators.into_iter().collect(),
            optional: false,
        }
    }

    /// A field a request may constrain.
    #[must_use]
    pub fn optional(operators: impl IntoIterator<Item = Operator>) -> Self {
        Self {
            operators: operators.into_iter().collect(),
            optional: true,
        }
    }
}

/// One entry of an entity criterion shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ShapeEntry {
    Field(FieldShape),
    Relation {
        shape: EntityCriterionShape,
        #[serde(default)]
        optional: bool,
    },
    /// The relation repeats the enclosing shape.
    Recursive {
        #[serde(default)]
        optional: bool,
    },
}

impl ShapeEntry {
    #[must_use]
    pub const fn is_optional(&self) -> bool {
        match self {
            Self::Field(field) => field.optional,
            Self::Relation { optional, .. } | Self::Recursive { optional } => *optional,
        }
    }

    fn with_optional(self, optional: bool) -> Self {
        match self {
            Self::Field(field) => Self::Field(FieldShape { optional, ..field }),
            Self::Relation { shape, .. } => Self::Relation { shape, optional },
            Self::Recursive { .. } => Self::Recursive { optional },
        }
    }
}

/// Per-property filter capability of an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityCriterionShape {
    entries: BTreeMap<String, ShapeEntry>,
}

impl EntityCriterionShape {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: accept `field` on `key`.
    #[must_use]
    pub fn field(mut self, key: &str, field: FieldShape) -> Self {
        self.insert(key, ShapeEntry::Field(field));
        self
    }

    /// Builder: accept a nested shape on relation `key`.
    #[must_use]
    pub fn relation(mut self, key: &str, shape: Self, optional: bool) -> Self {
        self.insert(key, ShapeEntry::Relation { shape, optional });
        self
    }

    /// Builder: relation `key` repeats this shape.
    #[must_use]
    pub fn recursive(mut self, key: &str, optional: bool) -> Self {
        self.insert(key, ShapeEntry::Recursive { optional });
        self
    }

    pub fn insert(&mut self, key: &str, entry: ShapeEntry) {
        self.entries.insert(key.to_string(), entry);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ShapeEntry> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ShapeEntry)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), e))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any entry must be provided by a request.
    #[must_use]
    pub fn has_required(&self) -> bool {
        self.entries.values().any(|entry| !entry.is_optional())
    }

    fn keys_with<'a>(&'a self, other: &'a Self) -> BTreeSet<&'a str> {
        self.entries
            .keys()
            .chain(other.entries.keys())
            .map(String::as_str)
            .collect()
    }
}

impl fmt::Display for EntityCriterionShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return f.write_str("{}");
        }
        f.write_str("{ ")?;
        for (i, (key, entry)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let marker = if entry.is_optional() { "?" } else { "" };
            write!(f, "{key}{marker}: ")?;
            match entry {
                ShapeEntry::Field(field) => {
                    for (j, op) in field.operators.iter().enumerate() {
                        if j > 0 {
                            f.write_str("|")?;
                        }
                        write!(f, "{op}")?;
                    }
                }
                ShapeEntry::Relation { shape, .. } => write!(f, "{shape}")?,
                ShapeEntry::Recursive { .. } => f.write_str(WILDCARD)?,
            }
        }
        f.write_str(" }")
    }
}

/// Result of [`subtract_criterion_shape`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CriterionShapeDifference {
    FullyCovered,
    NoOverlap,
    Residual(EntityCriterionShape),
}

/// Result of [`reshape_criterion_shape`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshapedCriterionShape {
    /// What the capability can filter on.
    pub servable: EntityCriterionShape,
    /// What must be filtered after fetching; `None` when nothing.
    pub open: Option<EntityCriterionShape>,
}

/// Result of [`reshape_criterion`]. `servable` and `open` together are
/// equivalent to the original criterion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshapedCriterion {
    /// Criterion to send to the source; `None` fetches unfiltered.
    pub servable: Option<Criterion>,
    /// Criterion to apply locally on the fetched entities.
    pub open: Option<Criterion>,
}

fn incompatible(key: &str) -> QuarryError {
    QuarryError::IncompatibleCriterionShape {
        key: key.to_string(),
    }
}

/// Shape a relation entry points at, with `*` resolved to `enclosing`.
fn child<'a>(
    entry: &'a ShapeEntry,
    enclosing: &'a EntityCriterionShape,
) -> Option<&'a EntityCriterionShape> {
    match entry {
        ShapeEntry::Field(_) => None,
        ShapeEntry::Relation { shape, .. } => Some(shape),
        ShapeEntry::Recursive { .. } => Some(enclosing),
    }
}

/// Both entries resolved as relations; fails when either is a field.
fn children<'a>(
    key: &str,
    (x, a): (&'a ShapeEntry, &'a EntityCriterionShape),
    (y, b): (&'a ShapeEntry, &'a EntityCriterionShape),
) -> Result<(&'a EntityCriterionShape, &'a EntityCriterionShape), QuarryError> {
    match (child(x, a), child(y, b)) {
        (Some(left), Some(right)) => Ok((left, right)),
        _ => Err(incompatible(key)),
    }
}

// =============================================================================
// MERGE / INTERSECT / SUBTRACT
// =============================================================================

/// Union of two capabilities. Fields present on one side only become
/// optional.
pub fn merge_criterion_shape(
    a: &EntityCriterionShape,
    b: &EntityCriterionShape,
) -> Result<EntityCriterionShape, QuarryError> {
    let mut out = EntityCriterionShape::new();
    for key in a.keys_with(b) {
        let entry = match (a.get(key), b.get(key)) {
            (Some(x), None) | (None, Some(x)) => x.clone().with_optional(true),
            (Some(x), Some(y)) => merge_entry(key, (x, a), (y, b))?,
            (None, None) => continue,
        };
        out.insert(key, entry);
    }
    Ok(out)
}

fn merge_entry(
    key: &str,
    (x, a): (&ShapeEntry, &EntityCriterionShape),
    (y, b): (&ShapeEntry, &EntityCriterionShape),
) -> Result<ShapeEntry, QuarryError> {
    let optional = x.is_optional() || y.is_optional();
    match (x, y) {
        (ShapeEntry::Field(f), ShapeEntry::Field(g)) => Ok(ShapeEntry::Field(FieldShape {
            operators: f.operators.union(&g.operators).copied().collect(),
            optional,
        })),
        (ShapeEntry::Recursive { .. }, ShapeEntry::Recursive { .. }) => {
            Ok(ShapeEntry::Recursive { optional })
        }
        _ => {
            let (left, right) = children(key, (x, a), (y, b))?;
            Ok(ShapeEntry::Relation {
                shape: merge_criterion_shape(left, right)?,
                optional,
            })
        }
    }
}

/// Capability served by both; `None` when a required field of one side is
/// unknown to the other.
pub fn intersect_criterion_shape(
    a: &EntityCriterionShape,
    b: &EntityCriterionShape,
) -> Result<Option<EntityCriterionShape>, QuarryError> {
    let mut out = EntityCriterionShape::new();
    for key in a.keys_with(b) {
        match (a.get(key), b.get(key)) {
            (Some(x), None) | (None, Some(x)) => {
                if !x.is_optional() {
                    return Ok(None);
                }
            }
            (Some(x), Some(y)) => match intersect_entry(key, (x, a), (y, b))? {
                Some(entry) => out.insert(key, entry),
                None if x.is_optional() && y.is_optional() => {}
                None => return Ok(None),
            },
            (None, None) => {}
        }
    }
    Ok(Some(out))
}

fn intersect_entry(
    key: &str,
    (x, a): (&ShapeEntry, &EntityCriterionShape),
    (y, b): (&ShapeEntry, &EntityCriterionShape),
) -> Result<Option<ShapeEntry>, QuarryError> {
    let optional = x.is_optional() && y.is_optional();
    match (x, y) {
        (ShapeEntry::Field(f), ShapeEntry::Field(g)) => {
            let operators: BTreeSet<Operator> =
                f.operators.intersection(&g.operators).copied().collect();
            Ok((!operators.is_empty())
                .then_some(ShapeEntry::Field(FieldShape { operators, optional })))
        }
        (ShapeEntry::Recursive { .. }, ShapeEntry::Recursive { .. }) => {
            Ok(Some(ShapeEntry::Recursive { optional }))
        }
        _ => {
            let (left, right) = children(key, (x, a), (y, b))?;
            Ok(intersect_criterion_shape(left, right)?
                .map(|shape| ShapeEntry::Relation { shape, optional }))
        }
    }
}

/// The part of `what` that `by` cannot serve.
pub fn subtract_criterion_shape(
    what: &EntityCriterionShape,
    by: &EntityCriterionShape,
) -> Result<CriterionShapeDifference, QuarryError> {
    let mut removed = false;
    let rest = subtract_shapes(what, by, &mut removed)?;
    Ok(if rest.is_empty() {
        CriterionShapeDifference::FullyCovered
    } else if !removed {
        CriterionShapeDifference::NoOverlap
    } else {
        CriterionShapeDifference::Residual(rest)
    })
}

fn subtract_shapes(
    what: &EntityCriterionShape,
    by: &EntityCriterionShape,
    removed: &mut bool,
) -> Result<EntityCriterionShape, QuarryError> {
    let mut out = EntityCriterionShape::new();
    for (key, x) in what.iter() {
        let Some(y) = by.get(key) else {
            out.insert(key, x.clone());
            continue;
        };
        match (x, y) {
            (ShapeEntry::Field(f), ShapeEntry::Field(g)) => {
                let operators: BTreeSet<Operator> =
                    f.operators.difference(&g.operators).copied().collect();
                if operators.len() < f.operators.len() {
                    *removed = true;
                }
                if !operators.is_empty() {
                    out.insert(
                        key,
                        ShapeEntry::Field(FieldShape {
                            operators,
                            optional: f.optional,
                        }),
                    );
                }
            }
            (ShapeEntry::Recursive { optional }, ShapeEntry::Recursive { .. }) => {
                // repeats whatever this level leaves over
                out.insert(key, ShapeEntry::Recursive { optional: *optional });
            }
            _ => {
                let (left, right) = children(key, (x, what), (y, by))?;
                let rest = subtract_shapes(left, right, removed)?;
                if !rest.is_empty() {
                    out.insert(
                        key,
                        ShapeEntry::Relation {
                            shape: rest,
                            optional: x.is_optional(),
                        },
                    );
                }
            }
        }
    }
    // a residue of recursive entries alone constrains nothing
    if out.entries.values().all(|e| matches!(e, ShapeEntry::Recursive { .. })) {
        out.entries.clear();
    }
    Ok(out)
}

// =============================================================================
// RESHAPE
// =============================================================================

/// Whether a capability accepting `accepted` can express `operator`,
/// possibly by rewriting it (`$equals v` as `$inArray [v]`).
fn accepts(accepted: &BTreeSet<Operator>, operator: Operator) -> bool {
    let alternatives: &[Operator] = match operator {
        Operator::Equals => &[Operator::Equals, Operator::InArray, Operator::InRange],
        Operator::NotEquals => &[Operator::NotEquals, Operator::NotInArray],
        Operator::InArray => &[Operator::InArray],
        Operator::NotInArray => &[Operator::NotInArray],
        Operator::InRange => &[Operator::InRange],
    };
    alternatives.iter().any(|op| accepted.contains(op))
}

/// Split `desired` into what `capability` can filter and what stays open.
///
/// `None` when `capability` requires a field that `desired` does not always
/// provide.
pub fn reshape_criterion_shape(
    capability: &EntityCriterionShape,
    desired: &EntityCriterionShape,
) -> Result<Option<ReshapedCriterionShape>, QuarryError> {
    for (key, entry) in capability.iter() {
        if !entry.is_optional() && desired.get(key).is_none_or(ShapeEntry::is_optional) {
            return Ok(None);
        }
    }

    let mut servable = EntityCriterionShape::new();
    let mut open = EntityCriterionShape::new();
    for (key, d) in desired.iter() {
        let Some(c) = capability.get(key) else {
            open.insert(key, d.clone());
            continue;
        };
        match (c, d) {
            (ShapeEntry::Field(cf), ShapeEntry::Field(df)) => {
                let (served, rest): (BTreeSet<Operator>, BTreeSet<Operator>) =
                    df.operators.iter().partition(|op| accepts(&cf.operators, **op));
                if !served.is_empty() {
                    servable.insert(
                        key,
                        ShapeEntry::Field(FieldShape {
                            operators: served,
                            optional: df.optional,
                        }),
                    );
                }
                if !rest.is_empty() {
                    open.insert(
                        key,
                        ShapeEntry::Field(FieldShape {
                            operators: rest,
                            optional: df.optional,
                        }),
                    );
                }
            }
            (ShapeEntry::Recursive { .. }, ShapeEntry::Recursive { optional }) => {
                servable.insert(key, ShapeEntry::Recursive { optional: *optional });
            }
            _ => {
                let (cap_child, desired_child) = children(key, (c, capability), (d, desired))?;
                match reshape_criterion_shape(cap_child, desired_child)? {
                    None => open.insert(key, d.clone()),
                    Some(nested) => {
                        let optional = d.is_optional();
                        if !nested.servable.is_empty() {
                            servable.insert(
                                key,
                                ShapeEntry::Relation {
                                    shape: nested.servable,
                                    optional,
                                },
                            );
                        }
                        if let Some(shape) = nested.open {
                            open.insert(key, ShapeEntry::Relation { shape, optional });
                        }
                    }
                }
            }
        }
    }
    Ok(Some(ReshapedCriterionShape {
        servable,
        open: (!open.is_empty()).then_some(open),
    }))
}

/// Rewrite a value criterion into one of the `accepted` operators.
fn adapt(criterion: &Criterion, accepted: &BTreeSet<Operator>) -> Option<Criterion> {
    let has = |op: Operator| accepted.contains(&op);
    match criterion {
        Criterion::Equals(v) if has(Operator::Equals) => Some(Criterion::Equals(v.clone())),
        Criterion::Equals(v) if has(Operator::InArray) => {
            Some(Criterion::InArray(BTreeSet::from([v.clone()])))
        }
        Criterion::Equals(v) if has(Operator::InRange) => {
            Some(Criterion::InRange(ValueRange::point(v.clone())))
        }
        Criterion::NotEquals(v) if has(Operator::NotEquals) => {
            Some(Criterion::NotEquals(v.clone()))
        }
        Criterion::NotEquals(v) if has(Operator::NotInArray) => {
            Some(Criterion::NotInArray(BTreeSet::from([v.clone()])))
        }
        Criterion::InArray(values) if has(Operator::InArray) => {
            Some(Criterion::InArray(values.clone()))
        }
        Criterion::InArray(values) if values.len() == 1 && has(Operator::Equals) => {
            values.iter().next().cloned().map(Criterion::Equals)
        }
        Criterion::NotInArray(values) if has(Operator::NotInArray) => {
            Some(Criterion::NotInArray(values.clone()))
        }
        Criterion::NotInArray(values) if values.len() == 1 && has(Operator::NotEquals) => {
            values.iter().next().cloned().map(Criterion::NotEquals)
        }
        Criterion::InRange(range) if has(Operator::InRange) => {
            Some(Criterion::InRange(range.clone()))
        }
        Criterion::And(parts) => parts
            .iter()
            .map(|part| adapt(part, accepted))
            .collect::<Option<Vec<_>>>()
            .map(Criterion::And),
        Criterion::Or(parts) => parts
            .iter()
            .map(|part| adapt(part, accepted))
            .collect::<Option<Vec<_>>>()
            .map(Criterion::Or),
        _ => None,
    }
}

/// Split a concrete criterion into the part `capability` can filter and the
/// part to apply after fetching.
///
/// A source without capability serves no filter: everything stays open.
/// `None` when the capability requires a field the criterion does not
/// constrain.
pub fn reshape_criterion(
    capability: Option<&EntityCriterionShape>,
    criterion: Option<&Criterion>,
) -> Result<Option<ReshapedCriterion>, QuarryError> {
    match (capability, criterion) {
        (None, criterion) => Ok(Some(ReshapedCriterion {
            servable: None,
            open: criterion.cloned(),
        })),
        (Some(capability), None) => Ok((!capability.has_required()).then_some(ReshapedCriterion {
            servable: None,
            open: None,
        })),
        (Some(capability), Some(criterion)) => reshape_top(capability, criterion),
    }
}

fn reshape_top(
    capability: &EntityCriterionShape,
    criterion: &Criterion,
) -> Result<Option<ReshapedCriterion>, QuarryError> {
    match criterion {
        Criterion::Entity(entity) => Ok(reshape_entity(capability, entity)?.map(|(servable, open)| {
            ReshapedCriterion {
                servable: (!servable.is_empty()).then(|| Criterion::Entity(servable)),
                open: (!open.is_empty()).then(|| Criterion::Entity(open)),
            }
        })),
        Criterion::Or(parts) => {
            let mut servables = Vec::new();
            let mut exact = true;
            for part in parts {
                let Some(reshaped) = reshape_top(capability, part)? else {
                    return Ok(None);
                };
                exact &= reshaped.open.is_none();
                match reshaped.servable {
                    Some(servable) => servables.push(servable),
                    // one part fetches unfiltered, so the whole fetch does
                    None => {
                        return Ok(Some(ReshapedCriterion {
                            servable: None,
                            open: Some(criterion.clone()),
                        }));
                    }
                }
            }
            Ok(Some(ReshapedCriterion {
                servable: (!servables.is_empty()).then(|| disjunction(servables)),
                open: (!exact).then(|| criterion.clone()),
            }))
        }
        _ => Ok((!capability.has_required()).then(|| ReshapedCriterion {
            servable: None,
            open: Some(criterion.clone()),
        })),
    }
}

fn reshape_entity(
    capability: &EntityCriterionShape,
    entity: &EntityCriterion,
) -> Result<Option<(EntityCriterion, EntityCriterion)>, QuarryError> {
    for (key, entry) in capability.iter() {
        if !entry.is_optional() && entity.get(key).is_none() {
            return Ok(None);
        }
    }

    let mut servable = EntityCriterion::new();
    let mut open = EntityCriterion::new();
    for (key, criterion) in entity.iter() {
        match capability.get(key) {
            None => open.insert(key, criterion.clone()),
            Some(ShapeEntry::Field(field)) => {
                if matches!(criterion, Criterion::Entity(_)) {
                    return Err(incompatible(key));
                }
                match adapt(criterion, &field.operators) {
                    Some(adapted) => servable.insert(key, adapted),
                    None => open.insert(key, criterion.clone()),
                }
            }
            Some(entry) => {
                let Some(child_shape) = child(entry, capability) else {
                    return Err(incompatible(key));
                };
                match reshape_nested(key, child_shape, criterion)? {
                    None => open.insert(key, criterion.clone()),
                    Some(reshaped) => {
                        if let Some(served) = reshaped.servable {
                            servable.insert(key, served);
                        }
                        if let Some(rest) = reshaped.open {
                            open.insert(key, rest);
                        }
                    }
                }
            }
        }
    }
    Ok(Some((servable, open)))
}

/// Reshape the criterion held by a relation key.
///
/// Combinators are split per part; when any part is not fully served the
/// whole combinator stays open. `None` when a part misses a required field.
fn reshape_nested(
    key: &str,
    capability: &EntityCriterionShape,
    criterion: &Criterion,
) -> Result<Option<ReshapedCriterion>, QuarryError> {
    match criterion {
        Criterion::Entity(nested) => {
            Ok(reshape_entity(capability, nested)?.map(|(served, rest)| ReshapedCriterion {
                servable: (!served.is_empty()).then(|| Criterion::Entity(served)),
                open: (!rest.is_empty()).then(|| Criterion::Entity(rest)),
            }))
        }
        Criterion::Or(parts) | Criterion::And(parts) => {
            let mut servables = Vec::new();
            let mut exact = true;
            for part in parts {
                let Some(reshaped) = reshape_nested(key, capability, part)? else {
                    return Ok(None);
                };
                exact &= reshaped.open.is_none();
                match reshaped.servable {
                    Some(servable) => servables.push(servable),
                    // an unfiltered disjunct fetches the relation unfiltered
                    None if matches!(criterion, Criterion::Or(_)) => {
                        return Ok(Some(ReshapedCriterion {
                            servable: None,
                            open: Some(criterion.clone()),
                        }));
                    }
                    None => exact = false,
                }
            }
            let servable = match criterion {
                Criterion::Or(_) => (!servables.is_empty()).then(|| disjunction(servables)),
                _ if servables.len() > 1 => Some(Criterion::And(servables)),
                _ => servables.pop(),
            };
            Ok(Some(ReshapedCriterion {
                servable,
                open: (!exact).then(|| criterion.clone()),
            }))
        }
        _ => Err(incompatible(key)),
    }
}

// =============================================================================
// DERIVED SHAPES / SCORING / VALIDATION
// =============================================================================

fn operators_of(criterion: &Criterion, into: &mut BTreeSet<Operator>) {
    match criterion {
        Criterion::And(parts) | Criterion::Or(parts) => {
            for part in parts {
                operators_of(part, into);
            }
        }
        other => {
            if let Some(op) = other.operator() {
                into.insert(op);
            }
        }
    }
}

fn entry_of(key: &str, criterion: &Criterion) -> Result<ShapeEntry, QuarryError> {
    match criterion {
        Criterion::Entity(entity) => Ok(ShapeEntry::Relation {
            shape: entity.shape()?,
            optional: false,
        }),
        Criterion::And(parts) | Criterion::Or(parts)
            if parts.iter().any(|p| matches!(p, Criterion::Entity(_))) =>
        {
            let mut shape = EntityCriterionShape::new();
            for part in parts {
                let Criterion::Entity(entity) = part else {
                    return Err(incompatible(key));
                };
                shape = merge_criterion_shape(&shape, &entity.shape()?)?;
            }
            Ok(ShapeEntry::Relation {
                shape,
                optional: false,
            })
        }
        other => {
            let mut operators = BTreeSet::new();
            operators_of(other, &mut operators);
            Ok(ShapeEntry::Field(FieldShape {
                operators,
                optional: false,
            }))
        }
    }
}

impl EntityCriterion {
    /// The capability needed to serve this criterion: every constrained
    /// field is required with the operators it uses.
    pub fn shape(&self) -> Result<EntityCriterionShape, QuarryError> {
        let mut shape = EntityCriterionShape::new();
        for (key, criterion) in self.iter() {
            shape.insert(key, entry_of(key, criterion)?);
        }
        Ok(shape)
    }
}

impl Criterion {
    /// Shape of an entity criterion or a combination of them; `None` for
    /// value criteria. Fields constrained by only some `$or` parts become
    /// optional.
    pub fn shape(&self) -> Result<Option<EntityCriterionShape>, QuarryError> {
        match self {
            Self::Entity(entity) => entity.shape().map(Some),
            Self::And(parts) | Self::Or(parts) => {
                let mut merged: Option<EntityCriterionShape> = None;
                for part in parts {
                    let Some(shape) = part.shape()? else {
                        return Ok(None);
                    };
                    merged = Some(match merged {
                        None => shape,
                        Some(prev) => merge_criterion_shape(&prev, &shape)?,
                    });
                }
                Ok(merged)
            }
            _ => Ok(None),
        }
    }
}

/// How many distinct ways `shape` pins a single entity of `schema`.
///
/// Counts required primitive fields accepting `$equals` or `$inArray` that
/// are unique, plus one when every path of a composite id is pinned.
pub fn criterion_shape_unique_count(
    catalog: &SchemaCatalog,
    schema: &str,
    shape: &EntityCriterionShape,
) -> Result<usize, QuarryError> {
    let schema = catalog.get(schema)?;
    let pins = |key: &str| {
        matches!(
            shape.get(key),
            Some(ShapeEntry::Field(field)) if !field.optional
                && (field.operators.contains(&Operator::Equals)
                    || field.operators.contains(&Operator::InArray))
        )
    };
    let unique = schema
        .properties()
        .filter(|(key, property)| !property.is_relation() && schema.is_unique(key) && pins(*key))
        .count();
    let composite = schema.id_paths().len() > 1
        && schema.id_paths().iter().all(|path| pins(path.as_str()));
    Ok(unique + usize::from(composite))
}

/// Check every entry of `shape` against the catalog.
pub fn validate_criterion_shape(
    catalog: &SchemaCatalog,
    schema: &str,
    shape: &EntityCriterionShape,
) -> Result<(), QuarryError> {
    validate_entries(catalog, catalog.get(schema)?, shape)
}

fn validate_entries(
    catalog: &SchemaCatalog,
    schema: &EntitySchema,
    shape: &EntityCriterionShape,
) -> Result<(), QuarryError> {
    for (key, entry) in shape.iter() {
        let property = schema.property(key)?;
        match (entry, property.as_relation()) {
            (ShapeEntry::Field(_), None) => {}
            (ShapeEntry::Relation { shape, .. }, Some(relation)) => {
                validate_entries(catalog, catalog.get(&relation.target)?, shape)?;
            }
            (ShapeEntry::Recursive { .. }, Some(relation)) if relation.target == schema.name() => {}
            (ShapeEntry::Recursive { .. }, _) => {
                return Err(QuarryError::InvalidRecursion {
                    schema: schema.name().to_string(),
                    property: key.to_string(),
                });
            }
            _ => return Err(incompatible(key)),
        }
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criterion::algebra::{CriterionDifference, subtract_criterion};
    use crate::schema::Property;
    use crate::types::Value;

    fn eq(v: i64) -> Criterion {
        Criterion::Equals(Value::Integer(v))
    }

    fn id_shape() -> EntityCriterionShape {
        EntityCriterionShape::new().field(
            "id",
            FieldShape::required([Operator::Equals, Operator::InArray]),
        )
    }

    #[test]
    fn merge_makes_one_sided_fields_optional() {
        let a = id_shape();
        let b = EntityCriterionShape::new()
            .field("id", FieldShape::required([Operator::InRange]))
            .field("name", FieldShape::required([Operator::Equals]));
        let merged = merge_criterion_shape(&a, &b).expect("merge");
        assert_eq!(merged.to_string(), "{ id: $equals|$inArray|$inRange, name?: $equals }");
    }

    #[test]
    fn merge_field_against_relation_fails() {
        let a = id_shape();
        let b = EntityCriterionShape::new().relation("id", id_shape(), true);
        let err = merge_criterion_shape(&a, &b).expect_err("incompatible");
        assert_eq!(err, QuarryError::IncompatibleCriterionShape { key: "id".to_string() });
    }

    #[test]
    fn intersect_requires_shared_required_fields() {
        let a = id_shape();
        let b = EntityCriterionShape::new().field("name", FieldShape::optional([Operator::Equals]));
        assert_eq!(intersect_criterion_shape(&a, &b).expect("intersect"), None);

        let c = EntityCriterionShape::new().field(
            "id",
            FieldShape::optional([Operator::Equals, Operator::InRange]),
        );
        let shared = intersect_criterion_shape(&a, &c).expect("intersect").expect("overlap");
        assert_eq!(shared.to_string(), "{ id: $equals }");
    }

    #[test]
    fn subtract_reports_unserved_operators() {
        let what = EntityCriterionShape::new()
            .field("id", FieldShape::required([Operator::Equals, Operator::InRange]))
            .field("name", FieldShape::optional([Operator::Equals]));
        let rest = subtract_criterion_shape(&what, &id_shape()).expect("subtract");
        let expected = EntityCriterionShape::new()
            .field("id", FieldShape::required([Operator::InRange]))
            .field("name", FieldShape::optional([Operator::Equals]));
        assert_eq!(rest, CriterionShapeDifference::Residual(expected));
        assert_eq!(
            subtract_criterion_shape(&id_shape(), &id_shape()).expect("subtract"),
            CriterionShapeDifference::FullyCovered
        );
    }

    #[test]
    fn recursive_entries_resolve_against_enclosing_shape() {
        let tree = id_shape().recursive("parent", true);
        let finite = id_shape().relation(
            "parent",
            EntityCriterionShape::new().field("name", FieldShape::optional([Operator::Equals])),
            true,
        );
        let merged = merge_criterion_shape(&tree, &finite).expect("merge");
        assert_eq!(
            merged.to_string(),
            "{ id: $equals|$inArray, parent?: { id?: $equals|$inArray, name?: $equals, parent?: * } }"
        );
        assert_eq!(merge_criterion_shape(&tree, &tree).expect("merge"), tree);
    }

    #[test]
    fn reshape_shape_splits_servable_and_open() {
        let capability =
            EntityCriterionShape::new().field("id", FieldShape::optional([Operator::InArray]));
        let desired = EntityCriterionShape::new()
            .field("id", FieldShape::required([Operator::Equals, Operator::NotEquals]))
            .field("name", FieldShape::required([Operator::Equals]));
        let reshaped = reshape_criterion_shape(&capability, &desired)
            .expect("reshape")
            .expect("servable");
        assert_eq!(reshaped.servable.to_string(), "{ id: $equals }");
        assert_eq!(
            reshaped.open.map(|s| s.to_string()),
            Some("{ id: $notEquals, name: $equals }".to_string())
        );
    }

    #[test]
    fn reshape_shape_fails_on_unmet_requirement() {
        let desired =
            EntityCriterionShape::new().field("name", FieldShape::required([Operator::Equals]));
        assert_eq!(reshape_criterion_shape(&id_shape(), &desired).expect("reshape"), None);
    }

    #[test]
    fn reshape_criterion_adapts_operators() {
        let capability =
            EntityCriterionShape::new().field("id", FieldShape::required([Operator::InArray]));
        let name = Criterion::Equals(Value::from("x"));
        let criterion = Criterion::Entity(
            EntityCriterion::new()
                .with("id", eq(5))
                .with("name", name.clone()),
        );
        let reshaped = reshape_criterion(Some(&capability), Some(&criterion))
            .expect("reshape")
            .expect("servable");
        assert_eq!(
            reshaped.servable,
            Some(Criterion::Entity(
                EntityCriterion::new().with("id", Criterion::in_array([5]))
            ))
        );
        assert_eq!(
            reshaped.open,
            Some(Criterion::Entity(EntityCriterion::new().with("name", name)))
        );
    }

    #[test]
    fn reshape_criterion_without_capability_is_all_open() {
        let criterion = Criterion::Entity(EntityCriterion::new().with("id", eq(5)));
        let reshaped = reshape_criterion(None, Some(&criterion))
            .expect("reshape")
            .expect("servable");
        assert_eq!(reshaped.servable, None);
        assert_eq!(reshaped.open, Some(criterion));
        assert_eq!(reshape_criterion(Some(&id_shape()), None).expect("reshape"), None);
    }

    fn owner(nested: EntityCriterion) -> Criterion {
        Criterion::Entity(EntityCriterion::new().with("owner", Criterion::Entity(nested)))
    }

    fn owner_capability(id: FieldShape) -> EntityCriterionShape {
        let user = EntityCriterionShape::new().field("id", id);
        EntityCriterionShape::new().relation("owner", user, true)
    }

    #[test]
    fn reshape_relation_disjunction_from_subtract_residual() {
        let what = owner(
            EntityCriterion::new()
                .with("id", Criterion::in_array([1, 2]))
                .with("name", Criterion::in_array([1, 2])),
        );
        let by = owner(EntityCriterion::new().with("id", eq(1)).with("name", eq(1)));
        let residual = match subtract_criterion(&what, &by) {
            CriterionDifference::Residual(residual) => Some(residual),
            _ => None,
        }
        .expect("residual");
        assert!(matches!(
            residual.as_entity().and_then(|e| e.get("owner")),
            Some(Criterion::Or(_))
        ));

        let capability =
            owner_capability(FieldShape::optional([Operator::Equals, Operator::InArray]));
        let reshaped = reshape_criterion(Some(&capability), Some(&residual))
            .expect("reshape")
            .expect("servable");
        let served_ids = EntityCriterion::new().with("id", Criterion::in_array([1, 2]));
        assert_eq!(reshaped.servable, Some(owner(served_ids)));
        assert_eq!(reshaped.open, Some(residual));
    }

    #[test]
    fn reshape_relation_disjunction_keeps_unserved_parts_open() {
        let criterion = Criterion::Entity(EntityCriterion::new().with(
            "owner",
            Criterion::Or(vec![
                Criterion::Entity(
                    EntityCriterion::new()
                        .with("id", eq(1))
                        .with("name", Criterion::Equals(Value::from("a"))),
                ),
                Criterion::Entity(
                    EntityCriterion::new().with("name", Criterion::Equals(Value::from("b"))),
                ),
            ]),
        ));

        let optional =
            owner_capability(FieldShape::optional([Operator::Equals, Operator::InArray]));
        let reshaped = reshape_criterion(Some(&optional), Some(&criterion))
            .expect("reshape")
            .expect("servable");
        assert_eq!(reshaped.servable, None);
        assert_eq!(reshaped.open, Some(criterion.clone()));

        let required = owner_capability(FieldShape::required([Operator::Equals]));
        let reshaped = reshape_criterion(Some(&required), Some(&criterion))
            .expect("reshape")
            .expect("servable");
        assert_eq!(reshaped.servable, None);
        assert_eq!(reshaped.open, Some(criterion));
    }

    #[test]
    fn derived_shape_of_or_marks_partial_fields_optional() {
        let criterion = Criterion::Or(vec![
            Criterion::Entity(EntityCriterion::new().with("id", eq(1))),
            Criterion::Entity(
                EntityCriterion::new()
                    .with("id", Criterion::in_array([2, 3]))
                    .with("kind", eq(4)),
            ),
        ]);
        let shape = criterion.shape().expect("shape").expect("entity");
        assert_eq!(shape.to_string(), "{ id: $equals|$inArray, kind?: $equals }");
        assert_eq!(shape.get("id").map(ShapeEntry::is_optional), Some(false));
    }

    #[test]
    fn unique_count_scores_ids_and_unique_keys() {
        let catalog = SchemaCatalog::new()
            .with_schema(
                EntitySchema::new("User")
                    .with_id(["id"])
                    .with_property("id", Property::primitive())
                    .with_property("email", Property::primitive().unique())
                    .with_property("name", Property::primitive()),
            )
            .with_schema(
                EntitySchema::new("Membership")
                    .with_id(["userId", "groupId"])
                    .with_property("userId", Property::primitive())
                    .with_property("groupId", Property::primitive()),
            );
        let user = id_shape()
            .field("email", FieldShape::required([Operator::Equals]))
            .field("name", FieldShape::required([Operator::Equals]));
        assert_eq!(criterion_shape_unique_count(&catalog, "User", &user).expect("count"), 2);

        let membership = EntityCriterionShape::new()
            .field("userId", FieldShape::required([Operator::Equals]))
            .field("groupId", FieldShape::required([Operator::InArray]));
        assert_eq!(
            criterion_shape_unique_count(&catalog, "Membership", &membership).expect("count"),
            1
        );

        let partial =
            EntityCriterionShape::new().field("userId", FieldShape::required([Operator::Equals]));
        assert_eq!(
            criterion_shape_unique_count(&catalog, "Membership", &partial).expect("count"),
            0
        );
    }

    #[test]
    fn validate_checks_fields_and_recursion() {
        let catalog = SchemaCatalog::new().with_schema(
            EntitySchema::new("Branch")
                .with_id(["id"])
                .with_property("id", Property::primitive())
                .with_property("parent", Property::relation("Branch")),
        );
        let tree = id_shape().recursive("parent", true);
        assert!(validate_criterion_shape(&catalog, "Branch", &tree).is_ok());
        let bad =
            EntityCriterionShape::new().field("parent", FieldShape::optional([Operator::Equals]));
        assert!(validate_criterion_shape(&catalog, "Branch", &bad).is_err());
        let unknown =
            EntityCriterionShape::new().field("color", FieldShape::optional([Operator::Equals]));
        assert!(matches!(
            validate_criterion_shape(&catalog, "Branch", &unknown),
            Err(QuarryError::UnknownProperty { .. })
        ));
    }
}
