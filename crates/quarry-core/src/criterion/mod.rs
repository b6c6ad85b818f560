//! # Criteria
//!
//! Concrete filter predicates over entities.
//!
//! A criterion is either a value criterion (`$equals`, `$notEquals`,
//! `$inArray`, `$notInArray`, `$inRange`) applied to one field, an entity
//! criterion (conjunction over fields, `$entity`), or a combinator (`$and`,
//! `$or`) over criteria of the same subject.
//!
//! A field absent from an entity criterion is unconstrained. The canonical
//! "matches everything" value criterion is `$notInArray()` with no values.

pub mod algebra;
pub mod shape;

use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

pub use shape::{EntityCriterionShape, FieldShape, ShapeEntry};

// =============================================================================
// OPERATORS
// =============================================================================

/// Value operators a criterion shape can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "$equals")]
    Equals,
    #[serde(rename = "$notEquals")]
    NotEquals,
    #[serde(rename = "$inArray")]
    InArray,
    #[serde(rename = "$notInArray")]
    NotInArray,
    #[serde(rename = "$inRange")]
    InRange,
}

impl Operator {
    pub const ALL: [Self; 5] = [
        Self::Equals,
        Self::NotEquals,
        Self::InArray,
        Self::NotInArray,
        Self::InRange,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Equals => "$equals",
            Self::NotEquals => "$notEquals",
            Self::InArray => "$inArray",
            Self::NotInArray => "$notInArray",
            Self::InRange => "$inRange",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// RANGES
// =============================================================================

/// One end of a range.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RangeBound {
    pub value: Value,
    #[serde(default = "inclusive_default")]
    pub inclusive: bool,
}

const fn inclusive_default() -> bool {
    true
}

impl RangeBound {
    #[must_use]
    pub fn inclusive(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            inclusive: true,
        }
    }

    #[must_use]
    pub fn exclusive(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            inclusive: false,
        }
    }
}

/// A range of values; a missing end is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ValueRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<RangeBound>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<RangeBound>,
}

impl ValueRange {
    #[must_use]
    pub const fn new(from: Option<RangeBound>, to: Option<RangeBound>) -> Self {
        Self { from, to }
    }

    /// `[from, to]`.
    #[must_use]
    pub fn closed(from: impl Into<Value>, to: impl Into<Value>) -> Self {
        Self::new(Some(RangeBound::inclusive(from)), Some(RangeBound::inclusive(to)))
    }

    /// `[value, value]`.
    #[must_use]
    pub fn point(value: Value) -> Self {
        Self::new(
            Some(RangeBound::inclusive(value.clone())),
            Some(RangeBound::inclusive(value)),
        )
    }
}

impl fmt::Display for ValueRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.from, &self.to) {
            (None, None) => f.write_str(".."),
            (from, to) => {
                if let Some(bound) = from {
                    let op = if bound.inclusive { ">=" } else { ">" };
                    write!(f, "{op} {}", bound.value)?;
                }
                if from.is_some() && to.is_some() {
                    f.write_str(", ")?;
                }
                if let Some(bound) = to {
                    let op = if bound.inclusive { "<=" } else { "<" };
                    write!(f, "{op} {}", bound.value)?;
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// CRITERION
// =============================================================================

/// A filter predicate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Criterion {
    #[serde(rename = "$equals")]
    Equals(Value),
    #[serde(rename = "$notEquals")]
    NotEquals(Value),
    #[serde(rename = "$inArray")]
    InArray(BTreeSet<Value>),
    #[serde(rename = "$notInArray")]
    NotInArray(BTreeSet<Value>),
    #[serde(rename = "$inRange")]
    InRange(ValueRange),
    /// Conjunction over fields of an entity.
    #[serde(rename = "$entity")]
    Entity(EntityCriterion),
    /// Conjunction of criteria of the same subject.
    #[serde(rename = "$and")]
    And(Vec<Criterion>),
    /// Disjunction of criteria of the same subject.
    #[serde(rename = "$or")]
    Or(Vec<Criterion>),
}

impl Criterion {
    /// `$inArray` over the given values.
    pub fn in_array<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::InArray(values.into_iter().map(Into::into).collect())
    }

    /// `$notInArray` over the given values.
    pub fn not_in_array<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::NotInArray(values.into_iter().map(Into::into).collect())
    }

    /// The criterion that accepts every value.
    #[must_use]
    pub fn everything() -> Self {
        Self::NotInArray(BTreeSet::new())
    }

    /// Whether the criterion is trivially satisfied by everything.
    #[must_use]
    pub fn matches_everything(&self) -> bool {
        match self {
            Self::NotInArray(values) => values.is_empty(),
            Self::InRange(range) => range.from.is_none() && range.to.is_none(),
            Self::Entity(entity) => entity.is_empty(),
            Self::And(parts) => parts.iter().all(Self::matches_everything),
            Self::Or(parts) => parts.iter().any(Self::matches_everything),
            _ => false,
        }
    }

    /// The operator of a value criterion.
    #[must_use]
    pub const fn operator(&self) -> Option<Operator> {
        match self {
            Self::Equals(_) => Some(Operator::Equals),
            Self::NotEquals(_) => Some(Operator::NotEquals),
            Self::InArray(_) => Some(Operator::InArray),
            Self::NotInArray(_) => Some(Operator::NotInArray),
            Self::InRange(_) => Some(Operator::InRange),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_entity(&self) -> Option<&EntityCriterion> {
        match self {
            Self::Entity(entity) => Some(entity),
            _ => None,
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equals(v) | Self::NotEquals(v) => {
                write!(f, "{}({v})", self.operator().map_or("", Operator::as_str))
            }
            Self::InArray(values) | Self::NotInArray(values) => {
                write!(f, "{}(", self.operator().map_or("", Operator::as_str))?;
                write_joined(f, values, ", ")?;
                f.write_str(")")
            }
            Self::InRange(range) => write!(f, "$inRange({range})"),
            Self::Entity(entity) => write!(f, "{entity}"),
            Self::And(parts) => {
                f.write_str("$and(")?;
                write_joined(f, parts, " & ")?;
                f.write_str(")")
            }
            Self::Or(parts) => {
                f.write_str("$or(")?;
                write_joined(f, parts, " | ")?;
                f.write_str(")")
            }
        }
    }
}

fn write_joined<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    items: impl IntoIterator<Item = T>,
    separator: &str,
) -> fmt::Result {
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            f.write_str(separator)?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl From<EntityCriterion> for Criterion {
    fn from(entity: EntityCriterion) -> Self {
        Self::Entity(entity)
    }
}

// =============================================================================
// ENTITY CRITERION
// =============================================================================

/// Conjunction of per-field criteria. Relation fields hold nested entity
/// criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityCriterion {
    fields: BTreeMap<String, Criterion>,
}

impl EntityCriterion {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: constrain `key`.
    #[must_use]
    pub fn with(mut self, key: &str, criterion: Criterion) -> Self {
        self.insert(key, criterion);
        self
    }

    pub fn insert(&mut self, key: &str, criterion: Criterion) {
        self.fields.insert(key.to_string(), criterion);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Criterion> {
        self.fields.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Criterion)> {
        self.fields.iter().map(|(k, c)| (k.as_str(), c))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Criterion> {
        self.fields.remove(key)
    }
}

impl FromIterator<(String, Criterion)> for EntityCriterion {
    fn from_iter<T: IntoIterator<Item = (String, Criterion)>>(iter: T) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for EntityCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            return f.write_str("{}");
        }
        f.write_str("{ ")?;
        for (i, (key, criterion)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}: {criterion}")?;
        }
        f.write_str(" }")
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_forms() {
        let criterion = Criterion::Entity(
            EntityCriterion::new()
                .with("id", Criterion::in_array([1, 2]))
                .with("name", Criterion::Equals(Value::from("a")))
                .with(
                    "age",
                    Criterion::InRange(ValueRange::new(Some(RangeBound::exclusive(18)), None)),
                ),
        );
        assert_eq!(
            criterion.to_string(),
            "{ age: $inRange(> 18), id: $inArray(1, 2), name: $equals(\"a\") }"
        );
        let either =
            Criterion::Or(vec![Criterion::Equals(Value::from(1)), Criterion::everything()]);
        assert_eq!(either.to_string(), "$or($equals(1) | $notInArray())");
    }

    #[test]
    fn everything_forms() {
        assert!(Criterion::everything().matches_everything());
        assert!(Criterion::InRange(ValueRange::default()).matches_everything());
        assert!(Criterion::Entity(EntityCriterion::new()).matches_everything());
        assert!(!Criterion::in_array([1]).matches_everything());
    }

    #[test]
    fn json_uses_dollar_operators() {
        let json =
            r#"{"$entity": {"id": {"$inArray": [1, 2]}, "age": {"$inRange": {"from": {"value": 3}}}}}"#;
        let criterion: Criterion = serde_json::from_str(json).expect("parse");
        let entity = criterion.as_entity().expect("entity");
        assert_eq!(entity.get("id"), Some(&Criterion::in_array([1, 2])));
        assert_eq!(
            entity.get("age"),
            Some(&Criterion::InRange(ValueRange::new(Some(RangeBound::inclusive(3)), None)))
        );
    }

    #[test]
    fn operator_names() {
        let names: Vec<_> = Operator::ALL.iter().map(|op| op.as_str()).collect();
        assert_eq!(names, vec!["$equals", "$notEquals", "$inArray", "$notInArray", "$inRange"]);
        let parsed: Operator = serde_json::from_str("\"$notInArray\"").expect("operator");
        assert_eq!(parsed, Operator::NotInArray);
    }
}
