//! # Documents
//!
//! File formats read and written by the CLI: the TOML catalog and the JSON
//! query and query-shape documents. Selections in documents use the packed
//! form, relative to the catalog defaults.

use quarry_core::{
    Criterion, EntityCriterionShape, EntityQuery, EntityQueryShape, PackedSelection, Parameters,
    QuarryError, SchemaCatalog, pack_selection, schema::CatalogDefinition, unpack_selection,
    validate_criterion_shape, validate_selection,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// FILE LIMITS
// =============================================================================

/// Maximum size of any input document (16 MB).
const MAX_INPUT_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Resolve `path` to an existing regular file within the size limit.
fn validate_input_path(path: &Path) -> Result<PathBuf, QuarryError> {
    let canonical = path.canonicalize().map_err(|e| {
        QuarryError::IoError(format!("Invalid file path '{}': {}", path.display(), e))
    })?;
    if !canonical.is_file() {
        return Err(QuarryError::IoError(format!(
            "Path '{}' is not a regular file",
            path.display()
        )));
    }
    let metadata = std::fs::metadata(&canonical)
        .map_err(|e| QuarryError::IoError(format!("Cannot read file metadata: {}", e)))?;
    if metadata.len() > MAX_INPUT_FILE_SIZE {
        return Err(QuarryError::SerializationError(format!(
            "File size {} bytes exceeds maximum allowed {} bytes",
            metadata.len(),
            MAX_INPUT_FILE_SIZE
        )));
    }
    Ok(canonical)
}

fn read_input(path: &Path) -> Result<String, QuarryError> {
    let validated = validate_input_path(path)?;
    std::fs::read_to_string(&validated)
        .map_err(|e| QuarryError::IoError(format!("Read file '{}': {}", path.display(), e)))
}

/// Load and validate a TOML catalog.
pub fn load_catalog(path: &Path) -> Result<SchemaCatalog, QuarryError> {
    let text = read_input(path)?;
    let definition: CatalogDefinition = toml::from_str(&text)
        .map_err(|e| QuarryError::SerializationError(format!("Catalog: {}", e)))?;
    let catalog = SchemaCatalog::try_from(definition)?;
    catalog.validate()?;
    tracing::debug!(
        "Loaded catalog from {:?} ({} schemas)",
        path,
        catalog.schemas().count()
    );
    Ok(catalog)
}

/// Load any JSON document.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, QuarryError> {
    let text = read_input(path)?;
    serde_json::from_str(&text)
        .map_err(|e| QuarryError::SerializationError(format!("{}: {}", path.display(), e)))
}

// =============================================================================
// QUERY DOCUMENT
// =============================================================================

/// JSON form of an [`EntityQuery`]:
///
/// ```json
/// {
///   "schema": "Branch",
///   "selection": { "name": true, "branches": "*" },
///   "criterion": { "$entity": { "id": { "$inArray": [1, 2] } } }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryDocument {
    pub schema: String,
    #[serde(default)]
    pub selection: PackedSelection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criterion: Option<Criterion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Parameters>,
}

impl QueryDocument {
    /// Unpack against the catalog into a query.
    pub fn to_query(&self, catalog: &SchemaCatalog) -> Result<EntityQuery, QuarryError> {
        let selection = unpack_selection(catalog, &self.schema, &self.selection)?;
        validate_selection(catalog, &self.schema, &selection)?;
        let mut query = EntityQuery::new(self.schema.clone(), selection);
        if let Some(criterion) = &self.criterion {
            query = query.with_criterion(criterion.clone());
        }
        if let Some(parameters) = &self.parameters {
            query = query.with_parameters(parameters.clone());
        }
        Ok(query)
    }

    /// Pack a query relative to the catalog.
    pub fn from_query(catalog: &SchemaCatalog, query: &EntityQuery) -> Result<Self, QuarryError> {
        Ok(Self {
            schema: query.schema().to_string(),
            selection: pack_selection(catalog, query.schema(), query.selection())?,
            criterion: query.criterion().cloned(),
            parameters: query.parameters().cloned(),
        })
    }
}

// =============================================================================
// SHAPE DOCUMENT
// =============================================================================

/// JSON form of an [`EntityQueryShape`]. `criterion_shape` entries are
/// tagged by `kind`:
///
/// ```json
/// {
///   "schema": "Branch",
///   "selection": { "name": true, "branches": "*" },
///   "criterion_shape": {
///     "id": { "kind": "field", "operators": ["$inArray"] }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeDocument {
    pub schema: String,
    #[serde(default)]
    pub selection: PackedSelection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criterion_shape: Option<EntityCriterionShape>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters_schema: Option<String>,
}

impl ShapeDocument {
    /// Unpack against the catalog into a query shape.
    pub fn to_shape(&self, catalog: &SchemaCatalog) -> Result<EntityQueryShape, QuarryError> {
        let selection = unpack_selection(catalog, &self.schema, &self.selection)?;
        validate_selection(catalog, &self.schema, &selection)?;
        let mut shape = EntityQueryShape::new(self.schema.clone(), selection);
        if let Some(criterion_shape) = &self.criterion_shape {
            validate_criterion_shape(catalog, &self.schema, criterion_shape)?;
            shape = shape.with_criterion_shape(criterion_shape.clone());
        }
        if let Some(parameters_schema) = &self.parameters_schema {
            shape = shape.with_parameters_schema(parameters_schema.clone());
        }
        Ok(shape)
    }
}
