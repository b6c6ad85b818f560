//! # Schema-Relative Packing
//!
//! Converts between [`Selection`] and the compact [`PackedSelection`] form
//! relative to the catalog's default selections.
//!
//! - `unpack` fills in defaults, expands a relation leaf into the related
//!   schema's default selection and turns `*` into a self-reference.
//! - `pack` omits default leaves, writes default-only relations as leaves and
//!   turns a self-reference back into `*`.
//!
//! `unpack(pack(s)) == s` holds for every selection that contains its
//! defaults, which is every selection produced by `unpack`.

use super::{NodeId, PackedSelection, PackedValue, Selection, Slot};
use crate::QuarryError;
use crate::schema::{EntitySchema, SchemaCatalog, write_defaults};
use std::collections::BTreeMap;

fn recursion_error(schema: &EntitySchema, key: &str) -> QuarryError {
    QuarryError::InvalidRecursion {
        schema: schema.name().to_string(),
        property: key.to_string(),
    }
}

// =============================================================================
// UNPACK
// =============================================================================

/// Expand a packed selection of `schema` into a full selection.
pub fn unpack_selection(
    catalog: &SchemaCatalog,
    schema: &str,
    packed: &PackedSelection,
) -> Result<Selection, QuarryError> {
    let schema = catalog.get(schema)?;
    let mut out = Selection::arena();
    unpack_node(catalog, schema, packed, &mut out)?;
    Ok(out)
}

fn unpack_node(
    catalog: &SchemaCatalog,
    schema: &EntitySchema,
    packed: &PackedSelection,
    out: &mut Selection,
) -> Result<NodeId, QuarryError> {
    let node = out.alloc();
    write_defaults(schema, out, node);

    let mut anchor: Option<&str> = None;
    for (key, value) in packed.iter() {
        let property = schema.property(key)?;
        match (value, property.as_relation()) {
            (PackedValue::Leaf, None) => out.set(node, key, Slot::Leaf),
            (PackedValue::Leaf, Some(relation)) => {
                let target = catalog.get(&relation.target)?;
                let child = out.alloc();
                write_defaults(target, out, child);
                out.set(node, key, Slot::Node(child));
            }
            (PackedValue::Nested(inner), Some(relation)) => {
                let target = catalog.get(&relation.target)?;
                let child = unpack_node(catalog, target, inner, out)?;
                out.set(node, key, Slot::Node(child));
            }
            (PackedValue::Wildcard, Some(relation)) => {
                if relation.target != schema.name() {
                    return Err(recursion_error(schema, key));
                }
                if let Some(first) = anchor {
                    return Err(QuarryError::AmbiguousRecursion {
                        first: first.to_string(),
                        second: key.to_string(),
                    });
                }
                anchor = Some(key);
                out.set(node, key, Slot::Node(node));
            }
            (PackedValue::Wildcard, None) => return Err(recursion_error(schema, key)),
            (PackedValue::Nested(_), None) => {
                return Err(QuarryError::IncompatibleSelection {
                    key: key.to_string(),
                });
            }
        }
    }
    Ok(node)
}

// =============================================================================
// PACK
// =============================================================================

/// Compress a selection of `schema` relative to the catalog defaults.
///
/// Fails with `InvalidRecursion` on a back-reference to anything other than
/// the containing node, which `*` cannot express.
pub fn pack_selection(
    catalog: &SchemaCatalog,
    schema: &str,
    selection: &Selection,
) -> Result<PackedSelection, QuarryError> {
    let schema = catalog.get(schema)?;
    let mut stack = Vec::new();
    pack_node(catalog, schema, selection, selection.root(), &mut stack)
}

fn pack_node(
    catalog: &SchemaCatalog,
    schema: &EntitySchema,
    selection: &Selection,
    node: NodeId,
    stack: &mut Vec<NodeId>,
) -> Result<PackedSelection, QuarryError> {
    stack.push(node);
    let mut packed = PackedSelection::new();
    for (key, slot) in selection.slots(node) {
        let property = schema.property(key)?;
        match (slot, property.as_relation()) {
            (Slot::Leaf, None) => {
                if !schema.is_default_key(key) {
                    packed.insert(key, PackedValue::Leaf);
                }
            }
            (Slot::Leaf, Some(_)) => packed.insert(key, PackedValue::Leaf),
            (Slot::Node(child), Some(relation)) => {
                if child == node {
                    if relation.target != schema.name() {
                        return Err(recursion_error(schema, key));
                    }
                    packed.insert(key, PackedValue::Wildcard);
                } else if stack.contains(&child) {
                    return Err(recursion_error(schema, key));
                } else {
                    let target = catalog.get(&relation.target)?;
                    let inner = pack_node(catalog, target, selection, child, stack)?;
                    if inner.is_empty() {
                        packed.insert(key, PackedValue::Leaf);
                    } else {
                        packed.insert(key, PackedValue::Nested(inner));
                    }
                }
            }
            (Slot::Node(_), None) => {
                return Err(QuarryError::IncompatibleSelection {
                    key: key.to_string(),
                });
            }
        }
    }
    stack.pop();
    Ok(packed)
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Check every key of `selection` against the catalog.
///
/// Primitive keys must be leaves, nested nodes must sit on relations, and a
/// shared or recursive node must always be reached with the same schema.
pub fn validate_selection(
    catalog: &SchemaCatalog,
    schema: &str,
    selection: &Selection,
) -> Result<(), QuarryError> {
    let schema = catalog.get(schema)?;
    let mut seen = BTreeMap::new();
    validate_node(catalog, schema, selection, selection.root(), &mut seen)
}

fn validate_node<'c>(
    catalog: &'c SchemaCatalog,
    schema: &'c EntitySchema,
    selection: &Selection,
    node: NodeId,
    seen: &mut BTreeMap<NodeId, &'c str>,
) -> Result<(), QuarryError> {
    seen.insert(node, schema.name());
    for (key, slot) in selection.slots(node) {
        let property = schema.property(key)?;
        let Slot::Node(child) = slot else {
            continue;
        };
        let Some(relation) = property.as_relation() else {
            return Err(QuarryError::IncompatibleSelection {
                key: key.to_string(),
            });
        };
        match seen.get(&child) {
            Some(reached) if *reached == relation.target => {}
            Some(_) => return Err(recursion_error(schema, key)),
            None => {
                let target = catalog.get(&relation.target)?;
                validate_node(catalog, target, selection, child, seen)?;
            }
        }
    }
    Ok(())
}

// =============================================================================
// TESTS
// =============================================================================
