//! # Scoped Caches
//!
//! Single-bucket caches, one per lookup pattern. Each implements
//! [`ScopedQueryCache`] against its own storage and rejects queries of
//! another schema or lookup pattern with [`QuarryError::OutOfScope`].
//!
//! - [`UnboundedCache`]: unfiltered queries.
//! - [`KeyedCache`]: lookups by id, ids, unique key or keys.
//! - [`IndexCombinationCache`]: `$equals` lookups on any combination of
//!   index fields.

use crate::QuarryError;
use crate::criterion::algebra::disjunction;
use crate::criterion::{Criterion, EntityCriterion};
use crate::primitives::MAX_INDEX_COMBINATION_FIELDS;
use crate::query::algebra::{QueryDifference, merge_queries, subtract_queries};
use crate::query::{EntityQuery, Parameters};
use crate::schema::SchemaCatalog;
use crate::selection::algebra::{SelectionDifference, merge_selection, subtract_selection};
use crate::selection::{Selection, Slot};
use crate::types::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// The three-operation cache contract.
pub trait ScopedQueryCache {
    /// Whether everything `query` fetches is cached.
    fn is_cached(&self, query: &EntityQuery) -> Result<bool, QuarryError>;

    /// What of `query` still has to be fetched.
    fn reduce(&self, query: &EntityQuery) -> Result<QueryDifference, QuarryError>;

    /// Record `query` as resolved.
    fn merge(&mut self, query: &EntityQuery) -> Result<(), QuarryError>;
}

fn check_schema(
    schema: &str,
    query: &EntityQuery,
    scope: &'static str,
) -> Result<(), QuarryError> {
    if query.schema() == schema {
        Ok(())
    } else {
        Err(QuarryError::OutOfScope(scope))
    }
}

/// Residual selection left after subtracting `cached`.
fn remaining(
    wanted: &Selection,
    cached: Option<&Selection>,
) -> Result<Option<Selection>, QuarryError> {
    let Some(cached) = cached else {
        return Ok(Some(wanted.clone()));
    };
    Ok(match subtract_selection(wanted, cached)? {
        SelectionDifference::FullyCovered => None,
        SelectionDifference::NoOverlap => Some(wanted.clone()),
        SelectionDifference::Residual(rest) => Some(rest),
    })
}

// =============================================================================
// UNBOUNDED
// =============================================================================

/// Cache of unfiltered queries of one schema.
#[derive(Debug, Clone, Default)]
pub struct UnboundedCache {
    schema: String,
    entries: Vec<EntityQuery>,
}

impl UnboundedCache {
    #[must_use]
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ScopedQueryCache for UnboundedCache {
    fn is_cached(&self, query: &EntityQuery) -> Result<bool, QuarryError> {
        Ok(self.reduce(query)? == QueryDifference::FullyCovered)
    }

    fn reduce(&self, query: &EntityQuery) -> Result<QueryDifference, QuarryError> {
        check_schema(&self.schema, query, "unbounded")?;
        if self.entries.is_empty() {
            return Ok(QueryDifference::NoOverlap);
        }
        subtract_queries(query, &self.entries)
    }

    fn merge(&mut self, query: &EntityQuery) -> Result<(), QuarryError> {
        check_schema(&self.schema, query, "unbounded")?;
        if query.is_filtered() {
            return Err(QuarryError::OutOfScope("unbounded"));
        }
        self.entries.push(query.clone());
        if let Some(merged) = merge_queries(&self.entries)? {
            self.entries = merged;
        }
        Ok(())
    }
}

// =============================================================================
// KEYED
// =============================================================================

type KeyTuple = Vec<Value>;

/// Cache of lookups pinning a fixed set of key paths.
///
/// [`KeyedCache::for_ids`] keys on the schema's id paths,
/// [`KeyedCache::for_key`] on one unique field. Every key tuple remembers
/// the selection fetched for it.
#[derive(Debug, Clone)]
pub struct KeyedCache {
    schema: String,
    paths: Vec<String>,
    entries: BTreeMap<Option<Parameters>, BTreeMap<KeyTuple, Selection>>,
}

impl KeyedCache {
    /// Id and ids lookups.
    pub fn for_ids(catalog: &SchemaCatalog, schema: &str) -> Result<Self, QuarryError> {
        let paths = catalog.get(schema)?.id_paths().to_vec();
        Ok(Self {
            schema: schema.to_string(),
            paths,
            entries: BTreeMap::new(),
        })
    }

    /// Key and keys lookups on a unique primitive field.
    pub fn for_key(catalog: &SchemaCatalog, schema: &str, key: &str) -> Result<Self, QuarryError> {
        let entity = catalog.get(schema)?;
        let property = entity.property(key)?;
        if property.is_relation() || !entity.is_unique(key) {
            return Err(QuarryError::OutOfScope("keyed"));
        }
        Ok(Self {
            schema: schema.to_string(),
            paths: vec![key.to_string()],
            entries: BTreeMap::new(),
        })
    }

    /// Number of cached key tuples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key tuples pinned by `query`; cartesian product over composite keys.
    fn tuples(&self, query: &EntityQuery) -> Result<Vec<KeyTuple>, QuarryError> {
        check_schema(&self.schema, query, "keyed")?;
        let Some(Criterion::Entity(entity)) = query.criterion() else {
            return Err(QuarryError::OutOfScope("keyed"));
        };
        if entity.len() != self.paths.len() {
            return Err(QuarryError::OutOfScope("keyed"));
        }
        let mut tuples: Vec<KeyTuple> = vec![Vec::new()];
        for path in &self.paths {
            let values: Vec<&Value> = match entity.get(path) {
                Some(Criterion::Equals(value)) => vec![value],
                Some(Criterion::InArray(values)) => values.iter().collect(),
                _ => return Err(QuarryError::OutOfScope("keyed")),
            };
            tuples = tuples
                .into_iter()
                .flat_map(|prefix| {
                    values.iter().map(move |value| {
                        let mut tuple = prefix.clone();
                        tuple.push((*value).clone());
                        tuple
                    })
                })
                .collect();
        }
        Ok(tuples)
    }

    /// Criterion pinning exactly `tuples`.
    fn criterion_for(&self, tuples: &[KeyTuple]) -> Criterion {
        disjunction(tuples.iter().map(|tuple| {
            let entity: EntityCriterion = self
                .paths
                .iter()
                .cloned()
                .zip(tuple.iter().cloned().map(Criterion::Equals))
                .collect();
            Criterion::Entity(entity)
        }))
    }
}

impl ScopedQueryCache for KeyedCache {
    fn is_cached(&self, query: &EntityQuery) -> Result<bool, QuarryError> {
        Ok(self.reduce(query)? == QueryDifference::FullyCovered)
    }

    fn reduce(&self, query: &EntityQuery) -> Result<QueryDifference, QuarryError> {
        let tuples = self.tuples(query)?;
        let cached = self.entries.get(&query.parameters().cloned());

        let mut groups: BTreeMap<String, (Selection, Vec<KeyTuple>)> = BTreeMap::new();
        let mut touched = false;
        for tuple in tuples {
            let stored = cached.and_then(|entries| entries.get(&tuple));
            let rest = remaining(query.selection(), stored)?;
            touched |= rest.as_ref() != Some(query.selection());
            if let Some(rest) = rest {
                groups
                    .entry(rest.to_string())
                    .or_insert_with(|| (rest, Vec::new()))
                    .1
                    .push(tuple);
            }
        }

        if groups.is_empty() {
            return Ok(QueryDifference::FullyCovered);
        }
        if !touched {
            return Ok(QueryDifference::NoOverlap);
        }
        let residual = groups
            .into_values()
            .map(|(selection, tuples)| {
                query
                    .clone()
                    .with_selection(selection)
                    .with_criterion(self.criterion_for(&tuples))
            })
            .collect();
        Ok(QueryDifference::Residual(residual))
    }

    fn merge(&mut self, query: &EntityQuery) -> Result<(), QuarryError> {
        let tuples = self.tuples(query)?;
        let entries = self.entries.entry(query.parameters().cloned()).or_default();
        for tuple in tuples {
            let selection = match entries.get(&tuple) {
                Some(existing) => merge_selection(existing, query.selection())?,
                None => query.selection().clone(),
            };
            entries.insert(tuple, selection);
        }
        Ok(())
    }
}

// =============================================================================
// INDEX COMBINATION
// =============================================================================

type Assignment = BTreeMap<String, Value>;

/// Cache of `$equals` lookups over arbitrary index field combinations.
///
/// A cached lookup on a subset of the requested fields fetched a superset
/// of the requested entities, so its selection serves the request. Every
/// non-empty subset of the requested fields is tried and the one leaving
/// the fewest selection leaves to fetch wins. Ties go to the candidate
/// leaving the fewest to-many relations to expand.
///
/// Leaves are counted without regard to cardinality: a leaf behind a
/// one-to-many relation weighs the same as one behind a many-to-one
/// relation, so the pick is not optimal for asymmetric expansions.
#[derive(Debug, Clone)]
pub struct IndexCombinationCache {
    catalog: Arc<SchemaCatalog>,
    schema: String,
    entries: BTreeMap<Option<Parameters>, BTreeMap<Assignment, Selection>>,
}

impl IndexCombinationCache {
    pub fn new(catalog: Arc<SchemaCatalog>, schema: &str) -> Result<Self, QuarryError> {
        catalog.get(schema)?;
        Ok(Self {
            catalog,
            schema: schema.to_string(),
            entries: BTreeMap::new(),
        })
    }

    /// Number of cached index combinations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn assignment(&self, query: &EntityQuery) -> Result<Assignment, QuarryError> {
        check_schema(&self.schema, query, "index combination")?;
        let Some(Criterion::Entity(entity)) = query.criterion() else {
            return Err(QuarryError::OutOfScope("index combination"));
        };
        let mut assignment = Assignment::new();
        for (key, criterion) in entity.iter() {
            let Criterion::Equals(value) = criterion else {
                return Err(QuarryError::OutOfScope("index combination"));
            };
            assignment.insert(key.to_string(), value.clone());
        }
        if assignment.len() > MAX_INDEX_COMBINATION_FIELDS {
            return Err(QuarryError::IndexCombinationTooLarge {
                fields: assignment.len(),
                max: MAX_INDEX_COMBINATION_FIELDS,
            });
        }
        Ok(assignment)
    }

    /// Remaining selection after the best cached candidate; `Some(None)`
    /// when that candidate covers everything.
    fn best(&self, query: &EntityQuery) -> Result<Option<Option<Selection>>, QuarryError> {
        let assignment = self.assignment(query)?;
        let Some(cached) = self.entries.get(&query.parameters().cloned()) else {
            return Ok(None);
        };
        let fields: Vec<(&String, &Value)> = assignment.iter().collect();
        let mut best: Option<((usize, usize), Option<Selection>)> = None;
        for mask in 1_u32..(1 << fields.len()) {
            let subset: Assignment = fields
                .iter()
                .enumerate()
                .filter(|(bit, _)| mask & (1 << *bit) != 0)
                .map(|(_, (key, value))| ((*key).clone(), (*value).clone()))
                .collect();
            let Some(stored) = cached.get(&subset) else {
                continue;
            };
            let rest = remaining(query.selection(), Some(stored))?;
            let cost = match &rest {
                Some(rest) => (
                    rest.leaf_count(),
                    to_many_expansions(&self.catalog, &self.schema, rest)?,
                ),
                None => (0, 0),
            };
            if best.as_ref().is_none_or(|(lowest, _)| cost < *lowest) {
                tracing::trace!(
                    subset = subset.len(),
                    leaves = cost.0,
                    to_many = cost.1,
                    "index combination candidate"
                );
                best = Some((cost, rest));
            }
        }
        Ok(best.map(|(_, rest)| rest))
    }
}

/// Number of to-many relations `selection` expands, each edge counted once.
fn to_many_expansions(
    catalog: &SchemaCatalog,
    schema: &str,
    selection: &Selection,
) -> Result<usize, QuarryError> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![(selection.root(), catalog.get(schema)?)];
    let mut count = 0;
    while let Some((node, schema)) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        for (key, slot) in selection.slots(node) {
            let Slot::Node(child) = slot else {
                continue;
            };
            let Some(relation) = schema.property(key)?.as_relation() else {
                continue;
            };
            if relation.to_many {
                count += 1;
            }
            stack.push((child, catalog.get(&relation.target)?));
        }
    }
    Ok(count)
}

impl ScopedQueryCache for IndexCombinationCache {
    fn is_cached(&self, query: &EntityQuery) -> Result<bool, QuarryError> {
        Ok(matches!(self.best(query)?, Some(None)))
    }

    fn reduce(&self, query: &EntityQuery) -> Result<QueryDifference, QuarryError> {
        Ok(match self.best(query)? {
            None => QueryDifference::NoOverlap,
            Some(None) => QueryDifference::FullyCovered,
            Some(Some(rest)) if &rest == query.selection() => QueryDifference::NoOverlap,
            Some(Some(rest)) => QueryDifference::Residual(vec![query.clone().with_selection(rest)]),
        })
    }

    fn merge(&mut self, query: &EntityQuery) -> Result<(), QuarryError> {
        let assignment = self.assignment(query)?;
        let entries = self.entries.entry(query.parameters().cloned()).or_default();
        let selection = match entries.get(&assignment) {
            Some(existing) => merge_selection(existing, query.selection())?,
            None => query.selection().clone(),
        };
        entries.insert(assignment, selection);
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySchema, Property};

    fn catalog() -> SchemaCatalog {
        SchemaCatalog::new()
            .with_schema(
                EntitySchema::new("User")
                    .with_id(["id"])
                    .with_property("id", Property::primitive())
                    .with_property("email", Property::primitive().unique())
                    .with_property("name", Property::primitive())
                    .with_property("city", Property::primitive())
                    .with_property("team", Property::relation("Team"))
                    .with_property("projects", Property::to_many("Project")),
            )
            .with_schema(EntitySchema::new("Team").with_id(["id"]))
            .with_schema(EntitySchema::new("Project").with_id(["id"]))
    }

    fn sel(text: &str) -> Selection {
        Selection::parse(text).expect("selection")
    }

    fn lookup(selection: &str, fields: &[(&str, Criterion)]) -> EntityQuery {
        let entity: EntityCriterion = fields
            .iter()
            .map(|(key, criterion)| ((*key).to_string(), criterion.clone()))
            .collect();
        EntityQuery::new("User", sel(selection)).with_criterion(Criterion::Entity(entity))
    }

    fn eq(value: impl Into<Value>) -> Criterion {
        Criterion::Equals(value.into())
    }

    #[test]
    fn unbounded_merges_selections() {
        let mut cache = UnboundedCache::new("User");
        cache.merge(&EntityQuery::new("User", sel("{ id }"))).expect("merge");
        cache.merge(&EntityQuery::new("User", sel("{ name }"))).expect("merge");
        assert_eq!(cache.len(), 1);
        assert!(cache.is_cached(&lookup("{ id, name }", &[("city", eq("Oslo"))])).expect("cached"));
        assert_eq!(
            cache.merge(&lookup("{ id }", &[("id", eq(1))])),
            Err(QuarryError::OutOfScope("unbounded"))
        );
    }

    #[test]
    fn keyed_by_ids_splits_residual_per_selection() {
        let mut cache = KeyedCache::for_ids(&catalog(), "User").expect("cache");
        cache
            .merge(&lookup("{ id, name }", &[("id", Criterion::in_array([1, 2]))]))
            .expect("merge");
        cache.merge(&lookup("{ id }", &[("id", eq(3))])).expect("merge");
        assert_eq!(cache.len(), 3);

        assert!(cache.is_cached(&lookup("{ name }", &[("id", eq(2))])).expect("cached"));
        let wanted = lookup("{ id, name }", &[("id", Criterion::in_array([1, 3, 4]))]);
        assert_eq!(
            cache.reduce(&wanted).expect("reduce"),
            QueryDifference::Residual(vec![
                lookup("{ id, name }", &[("id", eq(4))]),
                lookup("{ name }", &[("id", eq(3))]),
            ])
        );
    }

    #[test]
    fn keyed_rejects_other_lookups() {
        let cache = KeyedCache::for_key(&catalog(), "User", "email").expect("cache");
        assert_eq!(
            cache.reduce(&lookup("{ id }", &[("name", eq("a"))])),
            Err(QuarryError::OutOfScope("keyed"))
        );
        assert_eq!(
            cache.reduce(&lookup("{ id }", &[("email", eq("a@x"))])).expect("reduce"),
            QueryDifference::NoOverlap
        );
        assert!(KeyedCache::for_key(&catalog(), "User", "name").is_err());
    }

    #[test]
    fn index_combination_picks_fewest_remaining() {
        let mut cache = IndexCombinationCache::new(Arc::new(catalog()), "User").expect("cache");
        cache.merge(&lookup("{ id }", &[("city", eq("Oslo"))])).expect("merge");
        cache.merge(&lookup("{ id, name }", &[("name", eq("Ada"))])).expect("merge");

        let wanted = lookup("{ id, name, email }", &[("city", eq("Oslo")), ("name", eq("Ada"))]);
        assert_eq!(
            cache.reduce(&wanted).expect("reduce"),
            QueryDifference::Residual(vec![lookup(
                "{ email }",
                &[("city", eq("Oslo")), ("name", eq("Ada"))]
            )])
        );
        let narrow = lookup("{ id }", &[("city", eq("Oslo")), ("name", eq("Bob"))]);
        assert!(cache.is_cached(&narrow).expect("cached"));
        let elsewhere = lookup("{ id }", &[("city", eq("Rome"))]);
        assert_eq!(cache.reduce(&elsewhere).expect("reduce"), QueryDifference::NoOverlap);
    }

    #[test]
    fn index_combination_tie_prefers_fewer_to_many_expansions() {
        let mut cache = IndexCombinationCache::new(Arc::new(catalog()), "User").expect("cache");
        cache.merge(&lookup("{ id, team: { id } }", &[("city", eq("Oslo"))])).expect("merge");
        cache.merge(&lookup("{ id, projects: { id } }", &[("name", eq("Ada"))])).expect("merge");

        let fields = [("city", eq("Oslo")), ("name", eq("Ada"))];
        let wanted = lookup("{ id, team: { id }, projects: { id } }", &fields);
        assert_eq!(
            cache.reduce(&wanted).expect("reduce"),
            QueryDifference::Residual(vec![lookup("{ team: { id } }", &fields)])
        );
    }

    #[test]
    fn index_combination_is_bounded() {
        let cache = IndexCombinationCache::new(Arc::new(catalog()), "User").expect("cache");
        let fields: Vec<(String, Criterion)> = (0..=MAX_INDEX_COMBINATION_FIELDS)
            .map(|i| (format!("f{i}"), eq(1)))
            .collect();
        let entity: EntityCriterion = fields.into_iter().collect();
        let query =
            EntityQuery::new("User", sel("{ id }")).with_criterion(Criterion::Entity(entity));
        assert_eq!(
            cache.reduce(&query),
            Err(QuarryError::IndexCombinationTooLarge {
                fields: MAX_INDEX_COMBINATION_FIELDS + 1,
                max: MAX_INDEX_COMBINATION_FIELDS,
            })
        );
    }
}
