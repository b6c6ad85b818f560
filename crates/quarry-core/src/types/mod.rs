//! # Core Type Definitions
//!
//! This module contains the scalar types shared by every algebra:
//! - Operand values (`Value`)
//! - Error types (`QuarryError`)
//!
//! ## Determinism Guarantees
//!
//! All types in this module:
//! - Use integer arithmetic only (no floating-point)
//! - Implement `Ord` for deterministic ordering in `BTreeMap`/`BTreeSet`

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// =============================================================================
// VALUE
// =============================================================================

/// An operand of a criterion (`$equals 1`, `$inArray ["a", "b"]`, ...).
///
/// The derived ordering (`Null < Bool < Integer < Text`) is what range
/// criteria compare with. Ranges over mixed variants are legal but rarely
/// meaningful.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// JSON `null`.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Integer(i64),
    /// A string.
    Text(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors raised by the algebra, the catalog and the cache.
///
/// These are caller bugs (comparing unrelated trees, unknown schemas, ...).
/// "No overlap" and "fully covered" are NOT errors; they are returned as
/// outcome enums by the algebra functions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuarryError {
    /// One operand selects `key` as a leaf, the other as a nested selection.
    #[error("incompatible selections on key {key}")]
    IncompatibleSelection { key: String },

    /// One operand describes `key` as a field, the other as a relation.
    #[error("incompatible criterion shapes on key {key}")]
    IncompatibleCriterionShape { key: String },

    /// The schema is not registered in the catalog.
    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    /// The property does not exist on the schema.
    #[error("unknown property {property} on schema {schema}")]
    UnknownProperty { schema: String, property: String },

    /// More than one recursive anchor among sibling keys.
    #[error("ambiguous recursion: both {first} and {second} recurse at the same level")]
    AmbiguousRecursion { first: String, second: String },

    /// A recursive back-reference that cannot be expressed.
    #[error("invalid recursion on {property} of schema {schema}")]
    InvalidRecursion { schema: String, property: String },

    /// A packed selection text could not be parsed.
    #[error("invalid selection at offset {offset}: {message}")]
    InvalidSelection { offset: usize, message: String },

    /// A scoped cache was handed a query outside its identity kind.
    #[error("query out of scope for {0} cache")]
    OutOfScope(&'static str),

    /// Too many index fields for subset enumeration.
    #[error("index combination of {fields} fields exceeds maximum {max}")]
    IndexCombinationTooLarge { fields: usize, max: usize },

    /// A shared cache lock was poisoned by a panicking writer.
    #[error("query cache lock poisoned")]
    LockPoisoned,

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    IoError(String),
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_ordering_is_deterministic() {
        let mut values = vec![
            Value::from("b"),
            Value::from(2),
            Value::Null,
            Value::from(true),
            Value::from(1),
        ];
        values.sort();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Integer(1),
                Value::Integer(2),
                Value::Text("b".to_string()),
            ]
        );
    }

    #[test]
    fn value_display_quotes_text() {
        assert_eq!(Value::from("x").to_string(), "\"x\"");
        assert_eq!(Value::from(7).to_string(), "7");
        assert_eq!(Value::Null.to_string(), "null");
    }

    #[test]
    fn value_deserializes_untagged() {
        let values: Vec<Value> = serde_json::from_str(r#"[null, true, 3, "s"]"#).expect("parse");
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Integer(3),
                Value::from("s")
            ]
        );
    }

    #[test]
    fn incompatible_selection_names_key() {
        let err = QuarryError::IncompatibleSelection {
            key: "foo".to_string(),
        };
        assert_eq!(err.to_string(), "incompatible selections on key foo");
    }
}
