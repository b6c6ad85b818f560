//! # Queries
//!
//! An [`EntityQuery`] is a concrete ask: which schema, which selection, an
//! optional criterion and optional parameters. An [`EntityQueryShape`] is
//! the matching capability description a data source advertises.

pub mod algebra;

use crate::criterion::{Criterion, EntityCriterionShape};
use crate::selection::Selection;
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// PARAMETERS
// =============================================================================

/// Named parameter values checked against a parameter schema.
///
/// Queries with different parameters never merge or cover each other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Parameters {
    /// Name of the parameter schema.
    pub schema: String,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl Parameters {
    #[must_use]
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            values: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.schema)?;
        for (i, (key, value)) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}: {value}")?;
        }
        f.write_str(")")
    }
}

// =============================================================================
// ENTITY QUERY
// =============================================================================

/// What to fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityQuery {
    schema: String,
    selection: Selection,
    criterion: Option<Criterion>,
    parameters: Option<Parameters>,
}

impl EntityQuery {
    /// An unfiltered query.
    #[must_use]
    pub fn new(schema: impl Into<String>, selection: Selection) -> Self {
        Self {
            schema: schema.into(),
            selection,
            criterion: None,
            parameters: None,
        }
    }

    /// Builder: filter by `criterion`. A criterion matching everything
    /// leaves the query unfiltered.
    #[must_use]
    pub fn with_criterion(mut self, criterion: Criterion) -> Self {
        self.criterion = (!criterion.matches_everything()).then_some(criterion);
        self
    }

    #[must_use]
    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = Some(parameters);
        self
    }

    /// The same query with another selection.
    #[must_use]
    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    #[must_use]
    pub const fn selection(&self) -> &Selection {
        &self.selection
    }

    #[must_use]
    pub const fn criterion(&self) -> Option<&Criterion> {
        self.criterion.as_ref()
    }

    #[must_use]
    pub const fn parameters(&self) -> Option<&Parameters> {
        self.parameters.as_ref()
    }

    #[must_use]
    pub const fn is_filtered(&self) -> bool {
        self.criterion.is_some()
    }

    /// Key grouping queries that fetch the same expansion: the rendered
    /// selection plus parameters.
    #[must_use]
    pub fn signature(&self) -> String {
        match &self.parameters {
            Some(parameters) => format!("{} {parameters}", self.selection),
            None => self.selection.to_string(),
        }
    }
}

impl fmt::Display for EntityQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.schema, self.selection)?;
        if let Some(criterion) = &self.criterion {
            write!(f, " where {criterion}")?;
        }
        if let Some(parameters) = &self.parameters {
            write!(f, " with {parameters}")?;
        }
        Ok(())
    }
}

// =============================================================================
// QUERY SHAPE
// =============================================================================

/// What a source can serve: a selection mask, an optional filter capability
/// and an optional parameter schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityQueryShape {
    schema: String,
    selection: Selection,
    criterion_shape: Option<EntityCriterionShape>,
    parameters_schema: Option<String>,
}

impl EntityQueryShape {
    /// A capability without filtering.
    #[must_use]
    pub fn new(schema: impl Into<String>, selection: Selection) -> Self {
        Self {
            schema: schema.into(),
            selection,
            criterion_shape: None,
            parameters_schema: None,
        }
    }

    #[must_use]
    pub fn with_criterion_shape(mut self, shape: EntityCriterionShape) -> Self {
        self.criterion_shape = Some(shape);
        self
    }

    #[must_use]
    pub fn with_parameters_schema(mut self, schema: impl Into<String>) -> Self {
        self.parameters_schema = Some(schema.into());
        self
    }

    #[must_use]
    pub fn schema(&self) -> &str {
        &self.schema
    }

    #[must_use]
    pub const fn selection(&self) -> &Selection {
        &self.selection
    }

    #[must_use]
    pub const fn criterion_shape(&self) -> Option<&EntityCriterionShape> {
        self.criterion_shape.as_ref()
    }

    #[must_use]
    pub fn parameters_schema(&self) -> Option<&str> {
        self.parameters_schema.as_deref()
    }
}

impl fmt::Display for EntityQueryShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.schema, self.selection)?;
        if let Some(shape) = &self.criterion_shape {
            write!(f, " where {shape}")?;
        }
        if let Some(schema) = &self.parameters_schema {
            write!(f, " with {schema}")?;
        }
        Ok(())
    }
}
