//! # Query Algebra
//!
//! Merge, subtract and reshape of whole queries, composed from the
//! selection and criterion algebras. Queries of different schemas or with
//! different parameters never interact.

use super::{EntityQuery, EntityQueryShape};
use crate::QuarryError;
use crate::criterion::algebra::{
    CriterionDifference, disjunction, merge_criterion, negate_criterion, subtract_criterion,
};
use crate::criterion::shape::{
    criterion_shape_unique_count, reshape_criterion, reshape_criterion_shape,
};
use crate::criterion::{Criterion, EntityCriterionShape};
use crate::schema::SchemaCatalog;
use crate::selection::Selection;
use crate::selection::algebra::{
    SelectionDifference, is_selection_subset_of, merge_selection, reshape_selection_by,
    subtract_selection,
};

// =============================================================================
// OUTCOMES
// =============================================================================

/// Result of [`subtract_query`] and [`subtract_queries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryDifference {
    /// Nothing is left to fetch.
    FullyCovered,
    /// The subtrahend covers none of the query.
    NoOverlap,
    /// Queries that together fetch what is left.
    Residual(Vec<EntityQuery>),
}

/// Result of [`reshape_query_shape`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshapedQueryShape {
    /// The servable part of the desired shape.
    pub shape: EntityQueryShape,
    /// Selection the capability cannot serve.
    pub open_selection: Option<Selection>,
    /// Criterion shape the capability cannot serve.
    pub open_criterion_shape: Option<EntityCriterionShape>,
    /// Unique-count of the servable criterion shape.
    pub unique_count: usize,
}

/// Result of [`reshape_query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReshapedQuery {
    /// The query to send to the source.
    pub query: EntityQuery,
    /// Selection to fetch elsewhere.
    pub open_selection: Option<Selection>,
    /// Criterion to apply after fetching.
    pub open_criterion: Option<Criterion>,
    /// Unique-count of the servable criterion.
    pub unique_count: usize,
}

fn same_scope(a: &EntityQuery, b: &EntityQuery) -> bool {
    a.schema == b.schema && a.parameters == b.parameters
}

// =============================================================================
// MERGE
// =============================================================================

/// Single query fetching everything `a` and `b` fetch, if one exists.
///
/// When exactly one side is unfiltered the selections are NOT unioned: the
/// unfiltered query is returned only if its selection already covers the
/// filtered one, otherwise the pair does not merge. A union would claim
/// the filtered query's extra fields for every entity.
pub fn merge_query(
    a: &EntityQuery,
    b: &EntityQuery,
) -> Result<Option<EntityQuery>, QuarryError> {
    if !same_scope(a, b) {
        return Ok(None);
    }
    Ok(match (&a.criterion, &b.criterion) {
        (None, None) => {
            let selection = merge_selection(&a.selection, &b.selection)?;
            Some(a.clone().with_selection(selection))
        }
        (None, Some(_)) => {
            is_selection_subset_of(&b.selection, &a.selection)?.then(|| a.clone())
        }
        (Some(_), None) => {
            is_selection_subset_of(&a.selection, &b.selection)?.then(|| b.clone())
        }
        (Some(x), Some(y)) => (a.selection == b.selection).then(|| {
            let combined =
                merge_criterion(x, y).unwrap_or_else(|| disjunction([x.clone(), y.clone()]));
            a.clone().with_criterion(combined)
        }),
    })
}

/// Coalesce a list pairwise until no two queries merge.
///
/// Restarts from the front after every merge. `None` when nothing merged.
/// The order of the result is unspecified.
pub fn merge_queries(queries: &[EntityQuery]) -> Result<Option<Vec<EntityQuery>>, QuarryError> {
    let mut items = queries.to_vec();
    let mut merged_any = false;
    let mut i = 0;
    'scan: while i < items.len() {
        for j in (i + 1)..items.len() {
            if let Some(merged) = merge_query(&items[i], &items[j])? {
                items[i] = merged;
                items.remove(j);
                merged_any = true;
                i = 0;
                continue 'scan;
            }
        }
        i += 1;
    }
    Ok(merged_any.then_some(items))
}

// =============================================================================
// SUBTRACT
// =============================================================================

/// What of `what` is not fetched by `by`.
///
/// The residual holds up to two queries: the criterion complement at the
/// original selection (entities `by` did not fetch) and the selection
/// complement at the original criterion (fields `by` did not load).
pub fn subtract_query(
    what: &EntityQuery,
    by: &EntityQuery,
) -> Result<QueryDifference, QuarryError> {
    if !same_scope(what, by) {
        return Ok(QueryDifference::NoOverlap);
    }
    let selection = subtract_selection(&what.selection, &by.selection)?;
    if selection == SelectionDifference::NoOverlap {
        return Ok(QueryDifference::NoOverlap);
    }
    let criterion = match (&what.criterion, &by.criterion) {
        (_, None) => CriterionDifference::FullyCovered,
        (None, Some(filter)) => match negate_criterion(filter) {
            None => CriterionDifference::FullyCovered,
            Some(complement) => CriterionDifference::Residual(complement),
        },
        (Some(wanted), Some(filter)) => subtract_criterion(wanted, filter),
    };

    let mut residual = Vec::new();
    match criterion {
        CriterionDifference::NoOverlap => return Ok(QueryDifference::NoOverlap),
        CriterionDifference::FullyCovered => {}
        CriterionDifference::Residual(rest) => residual.push(what.clone().with_criterion(rest)),
    }
    if let SelectionDifference::Residual(rest) = selection {
        residual.push(what.clone().with_selection(rest));
    }
    Ok(if residual.is_empty() {
        QueryDifference::FullyCovered
    } else {
        QueryDifference::Residual(residual)
    })
}

/// Subtract every query of `by` from `what` in turn.
pub fn subtract_queries(
    what: &EntityQuery,
    by: &[EntityQuery],
) -> Result<QueryDifference, QuarryError> {
    let mut pending = vec![what.clone()];
    let mut touched = false;
    for subtrahend in by {
        let mut next = Vec::new();
        for query in pending {
            match subtract_query(&query, subtrahend)? {
                QueryDifference::FullyCovered => touched = true,
                QueryDifference::NoOverlap => next.push(query),
                QueryDifference::Residual(rest) => {
                    touched = true;
                    next.extend(rest);
                }
            }
        }
        if next.is_empty() {
            return Ok(QueryDifference::FullyCovered);
        }
        pending = next;
    }
    if !touched {
        return Ok(QueryDifference::NoOverlap);
    }
    Ok(QueryDifference::Residual(merge_queries(&pending)?.unwrap_or(pending)))
}

/// Whether `of` fetches everything `what` fetches.
pub fn is_query_subset_of(what: &EntityQuery, of: &EntityQuery) -> Result<bool, QuarryError> {
    Ok(subtract_query(what, of)? == QueryDifference::FullyCovered)
}

// =============================================================================
// RESHAPE
// =============================================================================

fn open_selection(
    wanted: &Selection,
    servable: &Selection,
) -> Result<Option<Selection>, QuarryError> {
    Ok(match subtract_selection(wanted, servable)? {
        SelectionDifference::FullyCovered => None,
        SelectionDifference::NoOverlap => Some(wanted.clone()),
        SelectionDifference::Residual(rest) => Some(rest),
    })
}

/// How much of the desired shape `what` the capability `by` can serve.
///
/// `None` when schemas or parameter schemas differ, when no part of the
/// selection is servable, or when `by` requires a filter `what` lacks.
pub fn reshape_query_shape(
    catalog: &SchemaCatalog,
    what: &EntityQueryShape,
    by: &EntityQueryShape,
) -> Result<Option<ReshapedQueryShape>, QuarryError> {
    if what.schema != by.schema || what.parameters_schema != by.parameters_schema {
        return Ok(None);
    }
    let Some(selection) = reshape_selection_by(&by.selection, &what.selection)? else {
        return Ok(None);
    };
    let open_selection = open_selection(&what.selection, &selection)?;

    let (servable, open_criterion_shape) = match (&by.criterion_shape, &what.criterion_shape) {
        (None, desired) => (None, desired.clone()),
        (Some(capability), None) => {
            if capability.has_required() {
                return Ok(None);
            }
            (None, None)
        }
        (Some(capability), Some(desired)) => match reshape_criterion_shape(capability, desired)? {
            None => return Ok(None),
            Some(reshaped) => (
                (!reshaped.servable.is_empty()).then_some(reshaped.servable),
                reshaped.open,
            ),
        },
    };
    let unique_count = match &servable {
        Some(shape) => criterion_shape_unique_count(catalog, &what.schema, shape)?,
        None => 0,
    };

    let mut shape = EntityQueryShape::new(what.schema.clone(), selection);
    shape.criterion_shape = servable;
    shape.parameters_schema.clone_from(&what.parameters_schema);
    Ok(Some(ReshapedQueryShape {
        shape,
        open_selection,
        open_criterion_shape,
        unique_count,
    }))
}

/// How much of `query` the capability `shape` can serve.
pub fn reshape_query(
    catalog: &SchemaCatalog,
    shape: &EntityQueryShape,
    query: &EntityQuery,
) -> Result<Option<ReshapedQuery>, QuarryError> {
    let parameters_schema = query.parameters.as_ref().map(|p| p.schema.as_str());
    if shape.schema != query.schema || shape.parameters_schema.as_deref() != parameters_schema {
        return Ok(None);
    }
    let Some(selection) = reshape_selection_by(&shape.selection, &query.selection)? else {
        return Ok(None);
    };
    let open_selection = open_selection(&query.selection, &selection)?;
    let Some(reshaped) =
        reshape_criterion(shape.criterion_shape.as_ref(), query.criterion.as_ref())?
    else {
        return Ok(None);
    };
    let servable_shape = reshaped
        .servable
        .as_ref()
        .map(Criterion::shape)
        .transpose()?
        .flatten();
    let unique_count = match servable_shape {
        Some(servable_shape) => {
            criterion_shape_unique_count(catalog, &query.schema, &servable_shape)?
        }
        None => 0,
    };

    let mut served = query.clone().with_selection(selection);
    served.criterion = reshaped.servable;
    Ok(Some(ReshapedQuery {
        query: served,
        open_selection,
        open_criterion: reshaped.open,
        unique_count,
    }))
}

// =============================================================================
// TESTS
// =============================================================================
