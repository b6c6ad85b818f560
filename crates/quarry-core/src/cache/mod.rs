//! # Query Cache
//!
//! Remembers which queries have been resolved so that a new query can be
//! answered from cache, or reduced to the part that still has to be fetched.
//!
//! ## Layout
//!
//! ```text
//! schema -> IdentityKind -> signature -> [EntityQuery]
//! ```
//!
//! The identity kind classifies a query by its lookup pattern. The signature
//! groups queries fetching the same expansion (selection and parameters).
//!
//! [`QueryCache`] is a plain value mutated through `&mut self`.
//! [`SharedQueryCache`] wraps it for concurrent readers and one writer.

pub mod scoped;

use crate::QuarryError;
use crate::criterion::Criterion;
use crate::query::EntityQuery;
use crate::query::algebra::{
    QueryDifference, is_query_subset_of, merge_queries, subtract_queries,
};
use crate::schema::SchemaCatalog;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, RwLock};

// =============================================================================
// IDENTITY KIND
// =============================================================================

/// Lookup pattern of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    /// Every id path pinned by `$equals`.
    Point,
    /// The id pinned by `$equals` or `$inArray`.
    Batch,
    /// One unique field pinned by `$equals` or `$inArray`.
    IndexedSingle,
    /// Any other filter.
    IndexedMulti,
    /// No filter.
    Unbounded,
}

/// Buckets in the order [`QueryCache::is_cached`] checks them.
const LOOKUP_ORDER: [IdentityKind; 4] = [
    IdentityKind::Batch,
    IdentityKind::IndexedSingle,
    IdentityKind::IndexedMulti,
    IdentityKind::Unbounded,
];

impl IdentityKind {
    /// Classify `query` against the id paths and unique flags of its schema.
    pub fn classify(catalog: &SchemaCatalog, query: &EntityQuery) -> Result<Self, QuarryError> {
        let schema = catalog.get(query.schema())?;
        let Some(criterion) = query.criterion() else {
            return Ok(Self::Unbounded);
        };
        let Criterion::Entity(entity) = criterion else {
            return Ok(Self::IndexedMulti);
        };

        let ids = schema.id_paths();
        let only_ids = !ids.is_empty()
            && entity.len() == ids.len()
            && ids.iter().all(|path| entity.get(path).is_some());
        if only_ids {
            let equals = ids
                .iter()
                .all(|path| matches!(entity.get(path), Some(Criterion::Equals(_))));
            if equals {
                return Ok(Self::Point);
            }
            if ids.len() == 1 && matches!(entity.get(&ids[0]), Some(Criterion::InArray(_))) {
                return Ok(Self::Batch);
            }
        }

        let mut fields = entity.iter();
        if let (Some((key, pin)), None) = (fields.next(), fields.next()) {
            let pinned = matches!(pin, Criterion::Equals(_) | Criterion::InArray(_));
            let primitive = schema.property(key).is_ok_and(|p| !p.is_relation());
            if pinned && primitive && schema.is_unique(key) {
                return Ok(Self::IndexedSingle);
            }
        }
        Ok(Self::IndexedMulti)
    }

    /// Bucket a kind is stored in. Point lookups share the batch bucket.
    #[must_use]
    pub const fn bucket(self) -> Self {
        match self {
            Self::Point => Self::Batch,
            other => other,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Point => "point",
            Self::Batch => "batch",
            Self::IndexedSingle => "indexed_single",
            Self::IndexedMulti => "indexed_multi",
            Self::Unbounded => "unbounded",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Part of the cache addressed by [`QueryCache::clear`] and
/// [`QueryCache::num_cached`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheScope<'a> {
    All,
    Schema(&'a str),
    Bucket(&'a str, IdentityKind),
}

// =============================================================================
// QUERY CACHE
// =============================================================================

type Bucket = BTreeMap<String, Vec<EntityQuery>>;

/// Cache of resolved queries.
#[derive(Debug, Clone)]
pub struct QueryCache {
    catalog: Arc<SchemaCatalog>,
    buckets: BTreeMap<String, BTreeMap<IdentityKind, Bucket>>,
}

impl QueryCache {
    #[must_use]
    pub const fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self {
            catalog,
            buckets: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    fn bucket(&self, schema: &str, kind: IdentityKind) -> impl Iterator<Item = &EntityQuery> {
        self.buckets
            .get(schema)
            .and_then(|kinds| kinds.get(&kind))
            .into_iter()
            .flat_map(|bucket| bucket.values().flatten())
    }

    /// Whether one stored query fetches everything `query` fetches.
    ///
    /// Checks the batch, indexed-single, indexed-multi and unbounded
    /// buckets in that order.
    pub fn is_cached(&self, query: &EntityQuery) -> Result<bool, QuarryError> {
        self.catalog.get(query.schema())?;
        for kind in LOOKUP_ORDER {
            for stored in self.bucket(query.schema(), kind) {
                if is_query_subset_of(query, stored)? {
                    tracing::trace!(query = %query, kind = %kind, "cache hit");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Record `query` as resolved. Returns `false` when it was already
    /// covered.
    ///
    /// The query is folded into its bucket with `merge_query`. An unbounded
    /// query also evicts every stored query of the schema it covers.
    pub fn add(&mut self, query: EntityQuery) -> Result<bool, QuarryError> {
        if self.is_cached(&query)? {
            tracing::debug!(query = %query, "query already cached");
            return Ok(false);
        }
        let kind = IdentityKind::classify(&self.catalog, &query)?.bucket();
        let schema = query.schema().to_string();

        if kind == IdentityKind::Unbounded {
            self.evict_covered(&query)?;
        }

        let mut entries: Vec<EntityQuery> = self.bucket(&schema, kind).cloned().collect();
        entries.push(query);
        let entries = merge_queries(&entries)?.unwrap_or(entries);

        let bucket = self.buckets.entry(schema).or_default().entry(kind).or_default();
        bucket.clear();
        for entry in entries {
            bucket.entry(entry.signature()).or_default().push(entry);
        }
        tracing::debug!(kind = %kind, entries = bucket.len(), "query added to cache");
        Ok(true)
    }

    fn evict_covered(&mut self, by: &EntityQuery) -> Result<(), QuarryError> {
        let Some(kinds) = self.buckets.get(by.schema()) else {
            return Ok(());
        };
        let mut covered: BTreeMap<(IdentityKind, String), BTreeSet<usize>> = BTreeMap::new();
        for (kind, bucket) in kinds {
            for (signature, entries) in bucket {
                for (index, entry) in entries.iter().enumerate() {
                    if is_query_subset_of(entry, by)? {
                        tracing::trace!(evicted = %entry, "superseded by unbounded query");
                        covered
                            .entry((*kind, signature.clone()))
                            .or_default()
                            .insert(index);
                    }
                }
            }
        }

        let Some(kinds) = self.buckets.get_mut(by.schema()) else {
            return Ok(());
        };
        for ((kind, signature), indices) in &covered {
            let Some(entries) = kinds.get_mut(kind).and_then(|b| b.get_mut(signature)) else {
                continue;
            };
            let mut index = 0;
            entries.retain(|_| {
                let keep = !indices.contains(&index);
                index += 1;
                keep
            });
        }
        for bucket in kinds.values_mut() {
            bucket.retain(|_, entries| !entries.is_empty());
        }
        kinds.retain(|_, bucket| !bucket.is_empty());
        Ok(())
    }

    /// Strip everything cached from `query`, leaving what must be fetched.
    pub fn reduce(&self, query: &EntityQuery) -> Result<QueryDifference, QuarryError> {
        self.catalog.get(query.schema())?;
        let stored: Vec<EntityQuery> = LOOKUP_ORDER
            .iter()
            .flat_map(|kind| self.bucket(query.schema(), *kind))
            .cloned()
            .collect();
        if stored.is_empty() {
            return Ok(QueryDifference::NoOverlap);
        }
        let difference = subtract_queries(query, &stored)?;
        tracing::debug!(
            query = %query,
            stored = stored.len(),
            outcome = ?difference,
            "query reduced"
        );
        Ok(difference)
    }

    /// Drop stored queries in `scope`.
    pub fn clear(&mut self, scope: CacheScope<'_>) {
        match scope {
            CacheScope::All => self.buckets.clear(),
            CacheScope::Schema(schema) => {
                self.buckets.remove(schema);
            }
            CacheScope::Bucket(schema, kind) => {
                if let Some(kinds) = self.buckets.get_mut(schema) {
                    kinds.remove(&kind.bucket());
                    if kinds.is_empty() {
                        self.buckets.remove(schema);
                    }
                }
            }
        }
    }

    /// Number of stored queries in `scope`.
    #[must_use]
    pub fn num_cached(&self, scope: CacheScope<'_>) -> usize {
        let count = |bucket: &Bucket| bucket.values().map(Vec::len).sum::<usize>();
        match scope {
            CacheScope::All => self
                .buckets
                .values()
                .flat_map(BTreeMap::values)
                .map(count)
                .sum(),
            CacheScope::Schema(schema) => self
                .buckets
                .get(schema)
                .map_or(0, |kinds| kinds.values().map(count).sum()),
            CacheScope::Bucket(schema, kind) => self
                .buckets
                .get(schema)
                .and_then(|kinds| kinds.get(&kind.bucket()))
                .map_or(0, count),
        }
    }

    /// Every stored query, in bucket order.
    pub fn entries(&self) -> impl Iterator<Item = &EntityQuery> {
        self.buckets
            .values()
            .flat_map(BTreeMap::values)
            .flat_map(|bucket| bucket.values().flatten())
    }
}

// =============================================================================
// SHARED CACHE
// =============================================================================

/// A [`QueryCache`] behind a reader-writer lock.
///
/// `is_cached`, `reduce` and `num_cached` take the read lock and may run
/// concurrently. `add` and `clear` take the write lock.
#[derive(Debug, Clone)]
pub struct SharedQueryCache {
    inner: Arc<RwLock<QueryCache>>,
}

impl SharedQueryCache {
    #[must_use]
    pub fn new(cache: QueryCache) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cache)),
        }
    }

    pub fn is_cached(&self, query: &EntityQuery) -> Result<bool, QuarryError> {
        self.inner
            .read()
            .map_err(|_| QuarryError::LockPoisoned)?
            .is_cached(query)
    }

    pub fn add(&self, query: EntityQuery) -> Result<bool, QuarryError> {
        self.inner
            .write()
            .map_err(|_| QuarryError::LockPoisoned)?
            .add(query)
    }

    pub fn reduce(&self, query: &EntityQuery) -> Result<QueryDifference, QuarryError> {
        self.inner
            .read()
            .map_err(|_| QuarryError::LockPoisoned)?
            .reduce(query)
    }

    pub fn clear(&self, scope: CacheScope<'_>) -> Result<(), QuarryError> {
        self.inner
            .write()
            .map_err(|_| QuarryError::LockPoisoned)?
            .clear(scope);
        Ok(())
    }

    pub fn num_cached(&self, scope: CacheScope<'_>) -> Result<usize, QuarryError> {
        Ok(self
            .inner
            .read()
            .map_err(|_| QuarryError::LockPoisoned)?
            .num_cached(scope))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criterion::EntityCriterion;
    use crate::schema::{EntitySchema, Property};
    use crate::selection::Selection;
    use crate::types::Value;
    use std::thread;

    fn catalog() -> Arc<SchemaCatalog> {
        Arc::new(
            SchemaCatalog::new().with_schema(
                EntitySchema::new("User")
                    .with_id(["id"])
                    .with_property("id", Property::primitive())
                    .with_property("email", Property::primitive().unique())
                    .with_property("name", Property::primitive())
                    .with_property("age", Property::primitive()),
            ),
        )
    }

    fn filtered(selection: &str, key: &str, criterion: Criterion) -> EntityQuery {
        EntityQuery::new("User", Selection::parse(selection).expect("selection"))
            .with_criterion(Criterion::Entity(EntityCriterion::new().with(key, criterion)))
    }

    fn ids(values: &[i64]) -> EntityQuery {
        let criterion = match values {
            [one] => Criterion::Equals(Value::Integer(*one)),
            many => Criterion::in_array(many.iter().copied()),
        };
        filtered("{ id, name }", "id", criterion)
    }

    #[test]
    fn classify_by_lookup_pattern() {
        let catalog = catalog();
        let kind = |query: &EntityQuery| IdentityKind::classify(&catalog, query).expect("classify");
        assert_eq!(kind(&ids(&[1])), IdentityKind::Point);
        assert_eq!(kind(&ids(&[1, 2])), IdentityKind::Batch);
        assert_eq!(
            kind(&filtered("{ id }", "email", Criterion::Equals(Value::from("a@x")))),
            IdentityKind::IndexedSingle
        );
        assert_eq!(
            kind(&filtered("{ id }", "name", Criterion::Equals(Value::from("a")))),
            IdentityKind::IndexedMulti
        );
        let all = EntityQuery::new("User", Selection::parse("{ id }").expect("selection"));
        assert_eq!(kind(&all), IdentityKind::Unbounded);
    }

    #[test]
    fn batch_covers_single_id() {
        let mut cache = QueryCache::new(catalog());
        assert!(cache.add(ids(&[1, 2, 3])).expect("add"));
        assert!(cache.is_cached(&ids(&[2])).expect("cached"));
        assert!(!cache.is_cached(&ids(&[4])).expect("cached"));
    }

    #[test]
    fn points_coalesce_into_batch() {
        let mut cache = QueryCache::new(catalog());
        for id in [1, 2, 3] {
            cache.add(ids(&[id])).expect("add");
        }
        assert_eq!(cache.num_cached(CacheScope::Bucket("User", IdentityKind::Batch)), 1);
        assert!(cache.is_cached(&ids(&[1, 2, 3])).expect("cached"));
    }

    #[test]
    fn add_of_covered_query_is_noop() {
        let mut cache = QueryCache::new(catalog());
        cache.add(ids(&[1, 2])).expect("add");
        assert!(!cache.add(ids(&[1])).expect("add"));
        assert_eq!(cache.num_cached(CacheScope::All), 1);
    }

    #[test]
    fn unbounded_evicts_covered_entries() {
        let mut cache = QueryCache::new(catalog());
        cache.add(ids(&[1, 2])).expect("add");
        cache
            .add(filtered("{ id }", "age", Criterion::Equals(Value::from(30))))
            .expect("add");
        assert_eq!(cache.num_cached(CacheScope::Schema("User")), 2);

        let all = EntityQuery::new("User", Selection::parse("{ id, name }").expect("selection"));
        cache.add(all).expect("add");
        assert_eq!(cache.num_cached(CacheScope::Schema("User")), 1);
        assert_eq!(cache.num_cached(CacheScope::Bucket("User", IdentityKind::Unbounded)), 1);
    }

    #[test]
    fn unbounded_keeps_entries_it_does_not_cover() {
        let mut cache = QueryCache::new(catalog());
        cache.add(ids(&[1, 2])).expect("add");
        cache
            .add(filtered("{ id }", "age", Criterion::Equals(Value::from(30))))
            .expect("add");

        let narrow = EntityQuery::new("User", Selection::parse("{ id }").expect("selection"));
        assert!(cache.add(narrow).expect("add"));
        assert_eq!(cache.num_cached(CacheScope::Schema("User")), 2);
        assert_eq!(cache.num_cached(CacheScope::Bucket("User", IdentityKind::Batch)), 1);
        assert_eq!(cache.num_cached(CacheScope::Bucket("User", IdentityKind::IndexedMulti)), 0);
        assert!(cache.is_cached(&ids(&[2])).expect("cached"));
    }

    #[test]
    fn failed_unbounded_add_evicts_nothing() {
        let mut cache = QueryCache::new(catalog());
        let clashing = EntityQuery::new(
            "User",
            Selection::parse("{ id, name: { first } }").expect("selection"),
        );
        cache
            .buckets
            .entry("User".to_string())
            .or_default()
            .entry(IdentityKind::Point)
            .or_default()
            .insert("seeded".to_string(), vec![ids(&[1]), clashing]);

        let all = EntityQuery::new("User", Selection::parse("{ id, name }").expect("selection"));
        assert_eq!(
            cache.add(all),
            Err(QuarryError::IncompatibleSelection {
                key: "name".to_string()
            })
        );
        assert_eq!(cache.num_cached(CacheScope::Schema("User")), 2);
    }

    #[test]
    fn reduce_leaves_uncached_ids() {
        let mut cache = QueryCache::new(catalog());
        cache.add(ids(&[1, 2])).expect("add");
        assert_eq!(
            cache.reduce(&ids(&[1, 2, 3])).expect("reduce"),
            QueryDifference::Residual(vec![ids(&[3])])
        );
        assert_eq!(cache.reduce(&ids(&[2])).expect("reduce"), QueryDifference::FullyCovered);
    }

    #[test]
    fn clear_by_scope() {
        let mut cache = QueryCache::new(catalog());
        cache.add(ids(&[1])).expect("add");
        cache
            .add(filtered("{ id }", "name", Criterion::Equals(Value::from("a"))))
            .expect("add");
        cache.clear(CacheScope::Bucket("User", IdentityKind::Point));
        assert_eq!(cache.num_cached(CacheScope::All), 1);
        cache.clear(CacheScope::All);
        assert_eq!(cache.num_cached(CacheScope::All), 0);
    }

    #[test]
    fn unknown_schema_is_an_error() {
        let cache = QueryCache::new(catalog());
        let query = EntityQuery::new("Ghost", Selection::new());
        assert_eq!(
            cache.is_cached(&query),
            Err(QuarryError::UnknownSchema("Ghost".to_string()))
        );
    }

    #[test]
    fn shared_cache_serves_concurrent_readers() {
        let shared = SharedQueryCache::new(QueryCache::new(catalog()));
        shared.add(ids(&[1, 2, 3])).expect("add");
        let handles: Vec<_> = (1..=3)
            .map(|id| {
                let cache = shared.clone();
                thread::spawn(move || cache.is_cached(&ids(&[id])))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().expect("join"), Ok(true));
        }
        assert_eq!(shared.num_cached(CacheScope::All), Ok(1));
    }
}
