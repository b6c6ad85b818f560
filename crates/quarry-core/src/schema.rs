//! # Schema Catalog
//!
//! The schema provider consumed by the algebra.
//!
//! The algebra only needs to know, per schema:
//! - which properties exist, and whether each is a primitive or a relation
//! - the related schema of a relation, and whether it is to-many
//! - which properties are optional (the default selection skips them)
//! - the id paths and which properties are unique (for unique-count scoring)
//!
//! A `SchemaCatalog` is an explicit value passed by reference into every
//! operation that needs it. There is no process-wide registry.

use crate::QuarryError;
use crate::selection::{NodeId, Selection, Slot};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// PROPERTY
// =============================================================================

/// Target of a relation property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Name of the related schema.
    pub target: String,
    /// Whether the relation holds many entities.
    pub to_many: bool,
}

/// A property of an entity schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    relation: Option<Relation>,
    optional: bool,
    unique: bool,
}

impl Property {
    /// A required primitive property.
    #[must_use]
    pub fn primitive() -> Self {
        Self {
            relation: None,
            optional: false,
            unique: false,
        }
    }

    /// A to-one relation to `target`. Relations are optional by default.
    #[must_use]
    pub fn relation(target: impl Into<String>) -> Self {
        Self {
            relation: Some(Relation {
                target: target.into(),
                to_many: false,
            }),
            optional: true,
            unique: false,
        }
    }

    /// A to-many relation to `target`.
    #[must_use]
    pub fn to_many(target: impl Into<String>) -> Self {
        Self {
            relation: Some(Relation {
                target: target.into(),
                to_many: true,
            }),
            optional: true,
            unique: false,
        }
    }

    /// Mark the property optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Mark the property required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.optional = false;
        self
    }

    /// Mark the property unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// The relation target, if this is a relation.
    #[must_use]
    pub fn as_relation(&self) -> Option<&Relation> {
        self.relation.as_ref()
    }

    #[must_use]
    pub fn is_relation(&self) -> bool {
        self.relation.is_some()
    }

    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

// =============================================================================
// ENTITY SCHEMA
// =============================================================================

/// A named entity schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitySchema {
    name: String,
    properties: BTreeMap<String, Property>,
    id_paths: Vec<String>,
}

impl EntitySchema {
    /// Create a schema with no properties.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
            id_paths: Vec::new(),
        }
    }

    /// Declare the id paths. Missing id properties are added as required
    /// primitives.
    #[must_use]
    pub fn with_id<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.id_paths = paths.into_iter().map(Into::into).collect();
        for path in &self.id_paths {
            self.properties
                .entry(path.clone())
                .or_insert_with(Property::primitive);
        }
        self
    }

    /// Add or replace a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, property: Property) -> Self {
        self.properties.insert(key.into(), property);
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id_paths(&self) -> &[String] {
        &self.id_paths
    }

    /// Iterate properties in key order.
    pub fn properties(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.properties.iter().map(|(k, p)| (k.as_str(), p))
    }

    /// Look up a property, failing with `UnknownProperty`.
    pub fn property(&self, key: &str) -> Result<&Property, QuarryError> {
        self.properties
            .get(key)
            .ok_or_else(|| QuarryError::UnknownProperty {
                schema: self.name.clone(),
                property: key.to_string(),
            })
    }

    /// Whether a value of `key` identifies at most one entity.
    ///
    /// A single id path is unique even when not flagged.
    #[must_use]
    pub fn is_unique(&self, key: &str) -> bool {
        let flagged = self.properties.get(key).is_some_and(|p| p.unique);
        flagged || (self.id_paths.len() == 1 && self.id_paths[0] == key)
    }

    /// Keys selected by default: id paths and required primitives.
    pub fn default_keys(&self) -> impl Iterator<Item = &str> {
        self.properties
            .iter()
            .filter(move |(key, p)| {
                p.relation.is_none() && (!p.optional || self.id_paths.contains(*key))
            })
            .map(|(k, _)| k.as_str())
    }

    /// Whether `key` is part of the default selection.
    #[must_use]
    pub fn is_default_key(&self, key: &str) -> bool {
        self.default_keys().any(|k| k == key)
    }
}

// =============================================================================
// CATALOG
// =============================================================================

/// The set of schemas known to the algebra.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaCatalog {
    schemas: BTreeMap<String, EntitySchema>,
}

impl SchemaCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with_schema(mut self, schema: EntitySchema) -> Self {
        self.insert(schema);
        self
    }

    /// Insert or replace a schema.
    pub fn insert(&mut self, schema: EntitySchema) {
        self.schemas.insert(schema.name.clone(), schema);
    }

    /// Look up a schema, failing with `UnknownSchema`.
    pub fn get(&self, name: &str) -> Result<&EntitySchema, QuarryError> {
        self.schemas
            .get(name)
            .ok_or_else(|| QuarryError::UnknownSchema(name.to_string()))
    }

    /// Iterate schemas in name order.
    pub fn schemas(&self) -> impl Iterator<Item = &EntitySchema> {
        self.schemas.values()
    }

    /// Check that every relation targets a known schema and every id path
    /// names a primitive.
    pub fn validate(&self) -> Result<(), QuarryError> {
        for schema in self.schemas.values() {
            for (key, property) in &schema.properties {
                if let Some(relation) = &property.relation {
                    self.get(&relation.target)?;
                    if schema.id_paths.contains(key) {
                        return Err(QuarryError::UnknownProperty {
                            schema: schema.name.clone(),
                            property: key.clone(),
                        });
                    }
                }
            }
            for path in &schema.id_paths {
                schema.property(path)?;
            }
        }
        Ok(())
    }

    /// The default selection of a schema: every required primitive plus the
    /// id paths. Relations are never selected by default.
    pub fn default_selection(&self, name: &str) -> Result<Selection, QuarryError> {
        let schema = self.get(name)?;
        let mut selection = Selection::new();
        let root = selection.root();
        write_defaults(schema, &mut selection, root);
        Ok(selection)
    }
}

/// Write the default leaves of `schema` into `node`.
pub(crate) fn write_defaults(schema: &EntitySchema, selection: &mut Selection, node: NodeId) {
    for key in schema.default_keys() {
        selection.set(node, key, Slot::Leaf);
    }
}

// =============================================================================
// CATALOG DEFINITION (serde boundary)
// =============================================================================

/// Serialisable catalog description, e.g. loaded from a TOML file:
///
/// ```toml
/// [[schemas]]
/// name = "Branch"
/// id = ["id"]
///
/// [schemas.properties]
/// id = {}
/// name = { optional = true }
/// branches = { relation = "Branch", to_many = true }
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDefinition {
    #[serde(default)]
    pub schemas: Vec<SchemaDefinition>,
}

/// Serialisable schema description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub name: String,
    #[serde(default)]
    pub id: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDefinition>,
}

/// Serialisable property description. A property with `relation` set is a
/// relation; anything else is a primitive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertyDefinition {
    #[serde(default)]
    pub relation: Option<String>,
    #[serde(default)]
    pub to_many: bool,
    #[serde(default)]
    pub optional: Option<bool>,
    #[serde(default)]
    pub unique: bool,
}

impl TryFrom<CatalogDefinition> for SchemaCatalog {
    type Error = QuarryError;

    fn try_from(definition: CatalogDefinition) -> Result<Self, Self::Error> {
        let mut catalog = Self::new();
        for schema_def in definition.schemas {
            let mut schema = EntitySchema::new(schema_def.name);
            for (key, def) in schema_def.properties {
                let mut property = match def.relation {
                    Some(target) if def.to_many => Property::to_many(target),
                    Some(target) => Property::relation(target),
                    None => Property::primitive(),
                };
                property.optional = def.optional.unwrap_or(property.optional);
                property.unique = def.unique;
                schema = schema.with_property(key, property);
            }
            catalog.insert(schema.with_id(schema_def.id));
        }
        catalog.validate()?;
        Ok(catalog)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::new()
            .with_schema(
                EntitySchema::new("Branch")
                    .with_id(["id"])
                    .with_property("name", Property::primitive())
                    .with_property("note", Property::primitive().optional())
                    .with_property("branches", Property::to_many("Branch")),
            )
            .with_schema(
                EntitySchema::new("Membership")
                    .with_id(["userId", "groupId"])
                    .with_property("email", Property::primitive().unique()),
            )
    }

    #[test]
    fn default_keys_skip_optional_and_relations() {
        let catalog = catalog();
        let branch = catalog.get("Branch").expect("schema");
        let keys: Vec<_> = branch.default_keys().collect();
        assert_eq!(keys, vec!["id", "name"]);
    }

    #[test]
    fn default_selection_renders_sorted() {
        let catalog = catalog();
        let selection = catalog.default_selection("Branch").expect("default");
        assert_eq!(selection.to_string(), "{ id, name }");
    }

    #[test]
    fn single_id_is_unique_composite_is_not() {
        let catalog = catalog();
        assert!(catalog.get("Branch").expect("schema").is_unique("id"));
        let membership = catalog.get("Membership").expect("schema");
        assert!(!membership.is_unique("userId"));
        assert!(membership.is_unique("email"));
    }

    #[test]
    fn unknown_schema_and_property_are_errors() {
        let catalog = catalog();
        assert_eq!(
            catalog.get("Nope"),
            Err(QuarryError::UnknownSchema("Nope".to_string()))
        );
        let branch = catalog.get("Branch").expect("schema");
        assert!(matches!(
            branch.property("nope"),
            Err(QuarryError::UnknownProperty { .. })
        ));
    }

    #[test]
    fn validate_rejects_dangling_relation() {
        let catalog = SchemaCatalog::new().with_schema(
            EntitySchema::new("A")
                .with_id(["id"])
                .with_property("b", Property::relation("B")),
        );
        assert_eq!(
            catalog.validate(),
            Err(QuarryError::UnknownSchema("B".to_string()))
        );
    }

    #[test]
    fn definition_converts_into_catalog() {
        let definition: CatalogDefinition = serde_json::from_str(
            r#"{"schemas": [{
                "name": "Branch",
                "id": ["id"],
                "properties": {
                    "id": {},
                    "name": {"optional": true},
                    "branches": {"relation": "Branch", "to_many": true}
                }
            }]}"#,
        )
        .expect("parse");
        let catalog = SchemaCatalog::try_from(definition).expect("catalog");
        let branch = catalog.get("Branch").expect("schema");
        assert!(branch.property("branches").expect("prop").is_relation());
        assert!(branch.property("name").expect("prop").is_optional());
        assert_eq!(branch.default_keys().collect::<Vec<_>>(), vec!["id"]);
    }
}
