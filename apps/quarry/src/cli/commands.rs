//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands. Every
//! command returns its rendered output; `main` prints it.
//!
//! Whole selections (merge and intersect results, served queries) are
//! written packed relative to the schema defaults. Residuals and open parts
//! are written literally, because they deliberately leave out defaults that
//! were already fetched.

use crate::documents::{QueryDocument, ShapeDocument, load_catalog, load_json};
use quarry_core::{
    CacheScope, EntityQuery, PackedSelection, QuarryError, QueryCache, QueryDifference,
    SchemaCatalog, Selection, SelectionDifference, intersect_selection, merge_queries,
    merge_selection, pack_selection, reshape_query, subtract_query, subtract_selection,
    unpack_selection, validate_selection,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// RENDERING
// =============================================================================

fn to_json(value: &serde_json::Value) -> Result<String, QuarryError> {
    serde_json::to_string_pretty(value).map_err(|e| QuarryError::SerializationError(e.to_string()))
}

/// Literal JSON form of a residual query.
fn residual_json(query: &EntityQuery) -> serde_json::Value {
    json!({
        "schema": query.schema(),
        "selection": query.selection().to_packed(),
        "criterion": query.criterion(),
        "parameters": query.parameters(),
    })
}

fn render_difference(
    difference: &QueryDifference,
    json_mode: bool,
) -> Result<String, QuarryError> {
    let (outcome, residual) = match difference {
        QueryDifference::FullyCovered => ("fully_covered", &[][..]),
        QueryDifference::NoOverlap => ("no_overlap", &[][..]),
        QueryDifference::Residual(queries) => ("residual", queries.as_slice()),
    };
    if json_mode {
        let queries: Vec<_> = residual.iter().map(residual_json).collect();
        return to_json(&json!({ "outcome": outcome, "queries": queries }));
    }
    let mut out = outcome.replace('_', " ");
    for query in residual {
        out.push_str(&format!("\n  {}", query));
    }
    Ok(out)
}

// =============================================================================
// SELECTION COMMANDS
// =============================================================================

/// Binary selection operations offered by `quarry selection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionAction {
    Merge,
    Intersect,
    Subtract,
}

fn unpack_text(
    catalog: &SchemaCatalog,
    schema: &str,
    text: &str,
) -> Result<Selection, QuarryError> {
    let packed: PackedSelection = text.parse()?;
    let selection = unpack_selection(catalog, schema, &packed)?;
    validate_selection(catalog, schema, &selection)?;
    Ok(selection)
}

/// Run a binary selection operation on two packed selections of `schema`.
pub fn cmd_selection(
    catalog_path: &Path,
    json_mode: bool,
    action: SelectionAction,
    schema: &str,
    left: &str,
    right: &str,
) -> Result<String, QuarryError> {
    let catalog = load_catalog(catalog_path)?;
    let left = unpack_text(&catalog, schema, left)?;
    let right = unpack_text(&catalog, schema, right)?;
    tracing::debug!("selection {:?} on {}: {} / {}", action, schema, left, right);

    let (outcome, packed) = match action {
        SelectionAction::Merge => {
            let merged = merge_selection(&left, &right)?;
            ("merged", Some(pack_selection(&catalog, schema, &merged)?))
        }
        SelectionAction::Intersect => match intersect_selection(&left, &right)? {
            Some(shared) => ("shared", Some(pack_selection(&catalog, schema, &shared)?)),
            None => ("no_overlap", None),
        },
        SelectionAction::Subtract => match subtract_selection(&left, &right)? {
            SelectionDifference::FullyCovered => ("fully_covered", None),
            SelectionDifference::NoOverlap => ("no_overlap", None),
            SelectionDifference::Residual(rest) => ("residual", Some(rest.to_packed())),
        },
    };

    if json_mode {
        return to_json(&json!({ "outcome": outcome, "selection": packed }));
    }
    Ok(match packed {
        Some(packed) => packed.to_string(),
        None => outcome.replace('_', " "),
    })
}

/// Pack a full selection of `schema` relative to its defaults.
pub fn cmd_pack(
    catalog_path: &Path,
    json_mode: bool,
    schema: &str,
    selection: &str,
) -> Result<String, QuarryError> {
    let catalog = load_catalog(catalog_path)?;
    let selection = Selection::parse(selection)?;
    validate_selection(&catalog, schema, &selection)?;
    let packed = pack_selection(&catalog, schema, &selection)?;

    if json_mode {
        return to_json(&json!({ "schema": schema, "selection": packed }));
    }
    Ok(packed.to_string())
}

// =============================================================================
// QUERY COMMANDS
// =============================================================================

fn load_query(catalog: &SchemaCatalog, path: &Path) -> Result<EntityQuery, QuarryError> {
    load_json::<QueryDocument>(path)?.to_query(catalog)
}

/// Coalesce the queries in `files`.
pub fn cmd_query_merge(
    catalog_path: &Path,
    json_mode: bool,
    files: &[PathBuf],
) -> Result<String, QuarryError> {
    let catalog = load_catalog(catalog_path)?;
    let queries = files
        .iter()
        .map(|path| load_query(&catalog, path))
        .collect::<Result<Vec<_>, _>>()?;

    let merged = merge_queries(&queries)?;
    let changed = merged.is_some();
    let result = merged.unwrap_or(queries);
    tracing::debug!("merged {} queries into {}", files.len(), result.len());

    if json_mode {
        let documents = result
            .iter()
            .map(|query| QueryDocument::from_query(&catalog, query))
            .collect::<Result<Vec<_>, _>>()?;
        return to_json(&json!({ "merged": changed, "queries": documents }));
    }
    let mut out = String::from(if changed { "merged" } else { "nothing merged" });
    for query in &result {
        out.push_str(&format!("\n  {}", query));
    }
    Ok(out)
}

/// Subtract query `by` from query `what`.
pub fn cmd_query_subtract(
    catalog_path: &Path,
    json_mode: bool,
    what: &Path,
    by: &Path,
) -> Result<String, QuarryError> {
    let catalog = load_catalog(catalog_path)?;
    let what = load_query(&catalog, what)?;
    let by = load_query(&catalog, by)?;
    render_difference(&subtract_query(&what, &by)?, json_mode)
}

/// Reshape a query against a source's query shape.
pub fn cmd_query_reshape(
    catalog_path: &Path,
    json_mode: bool,
    shape: &Path,
    query: &Path,
) -> Result<String, QuarryError> {
    let catalog = load_catalog(catalog_path)?;
    let shape = load_json::<ShapeDocument>(shape)?.to_shape(&catalog)?;
    let query = load_query(&catalog, query)?;

    let Some(reshaped) = reshape_query(&catalog, &shape, &query)? else {
        if json_mode {
            return to_json(&json!({ "servable": false }));
        }
        return Ok("not servable".to_string());
    };

    if json_mode {
        return to_json(&json!({
            "servable": true,
            "query": QueryDocument::from_query(&catalog, &reshaped.query)?,
            "open_selection": reshaped.open_selection.as_ref().map(Selection::to_packed),
            "open_criterion": reshaped.open_criterion,
            "unique_count": reshaped.unique_count,
        }));
    }
    let none = || "none".to_string();
    Ok(format!(
        "served: {}\nopen selection: {}\nopen criterion: {}\nunique count: {}",
        reshaped.query,
        reshaped.open_selection.map_or_else(none, |s| s.to_string()),
        reshaped.open_criterion.map_or_else(none, |c| c.to_string()),
        reshaped.unique_count
    ))
}

// =============================================================================
// CACHE COMMANDS
// =============================================================================

/// Load resolved queries into a cache and reduce `query` against it.
pub fn cmd_cache_reduce(
    catalog_path: &Path,
    json_mode: bool,
    cached: &Path,
    query: &Path,
) -> Result<String, QuarryError> {
    let catalog = Arc::new(load_catalog(catalog_path)?);
    let documents: Vec<QueryDocument> = load_json(cached)?;

    let mut cache = QueryCache::new(Arc::clone(&catalog));
    for document in &documents {
        cache.add(document.to_query(&catalog)?)?;
    }
    let query = load_query(&catalog, query)?;
    tracing::info!(
        "Reducing against {} cached queries ({} loaded)",
        cache.num_cached(CacheScope::All),
        documents.len()
    );
    render_difference(&cache.reduce(&query)?, json_mode)
}

// =============================================================================
// CATALOG COMMAND
// =============================================================================

/// Show every schema with its id paths and default selection.
pub fn cmd_catalog(catalog_path: &Path, json_mode: bool) -> Result<String, QuarryError> {
    let catalog = load_catalog(catalog_path)?;

    if json_mode {
        let mut schemas = serde_json::Map::new();
        for schema in catalog.schemas() {
            let defaults = catalog.default_selection(schema.name())?;
            schemas.insert(
                schema.name().to_string(),
                json!({ "id": schema.id_paths(), "default_selection": defaults.to_packed() }),
            );
        }
        return to_json(&serde_json::Value::Object(schemas));
    }

    let mut out = String::from("Quarry Catalog\n==============");
    for schema in catalog.schemas() {
        let defaults = catalog.default_selection(schema.name())?;
        out.push_str(&format!(
            "\n{} (id: {})\n  defaults: {}",
            schema.name(),
            schema.id_paths().join(", "),
            defaults
        ));
    }
    Ok(out)
}
