//! # quarry-core
//!
//! The selection, criterion and query algebra for Quarry - THE LOGIC.
//!
//! A client describes *what* entity data it wants: which fields, which
//! related entities, to what depth, under which filter. This crate decides
//! how such descriptions combine, how much of one is already covered by
//! another, and how much a data source can serve.
//!
//! ## Layers
//!
//! - `selection`: recursive field trees (`{ id, parent: * }`) with merge,
//!   intersect, subtract and reshape, all terminating on cyclic input.
//! - `criterion`: filter predicates and filter capabilities with the same
//!   four operations.
//! - `query`: schema-qualified pairing of both.
//! - `cache`: remembers resolved queries and reduces new ones.
//!
//! ## Architectural Constraints
//!
//! - Has NO async, NO I/O (pure Rust)
//! - Deterministic: ordered maps only, no floating point values
//! - Schemas come from an explicit [`SchemaCatalog`], never from globals

// =============================================================================
// MODULES
// =============================================================================

pub mod cache;
pub mod criterion;
pub mod primitives;
pub mod query;
pub mod schema;
pub mod selection;
pub mod types;

// =============================================================================
// RE-EXPORTS: Core Types
// =============================================================================

pub use types::{QuarryError, Value};

pub use schema::{EntitySchema, Property, Relation, SchemaCatalog};

// =============================================================================
// RE-EXPORTS: Trees
// =============================================================================

pub use criterion::{
    Criterion, EntityCriterion, EntityCriterionShape, FieldShape, Operator, RangeBound,
    ShapeEntry, ValueRange,
};
pub use query::{EntityQuery, EntityQueryShape, Parameters};
pub use selection::{NodeId, PackedSelection, PackedValue, Selection, Slot};

// =============================================================================
// RE-EXPORTS: Algebra
// =============================================================================

pub use criterion::algebra::{
    CriterionDifference, intersect_criterion, is_criterion_subset_of, merge_criterion,
    negate_criterion, subtract_criterion,
};
pub use criterion::shape::{
    CriterionShapeDifference, ReshapedCriterion, ReshapedCriterionShape,
    criterion_shape_unique_count, intersect_criterion_shape, merge_criterion_shape,
    reshape_criterion, reshape_criterion_shape, subtract_criterion_shape,
    validate_criterion_shape,
};
pub use query::algebra::{
    QueryDifference, ReshapedQuery, ReshapedQueryShape, is_query_subset_of, merge_queries,
    merge_query, reshape_query, reshape_query_shape, subtract_queries, subtract_query,
};
pub use selection::algebra::{
    SelectionDifference, intersect_selection, is_selection_subset_of, merge_selection,
    reshape_selection, reshape_selection_by, subtract_selection,
};
pub use selection::pack::{pack_selection, unpack_selection, validate_selection};

// =============================================================================
// RE-EXPORTS: Cache
// =============================================================================

pub use cache::scoped::{IndexCombinationCache, KeyedCache, ScopedQueryCache, UnboundedCache};
pub use cache::{CacheScope, IdentityKind, QueryCache, SharedQueryCache};
