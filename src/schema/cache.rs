//! TTL cache of schema descriptors.
//!
//! Reads are lock-free with respect to other keys: entries and in-flight
//! introspections live in sharded maps keyed by [`CacheKey`]. A miss starts
//! one spawned introspection task per key; concurrent misses await the same
//! task through a shared future, so a caller that is cancelled never aborts
//! work other callers depend on. Results are published by swapping in a new
//! `Arc<CacheEntry>`; entries are never mutated.
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::store::{PersistedEntry, SchemaStore};
use super::types::{CacheKey, SchemaDescriptor};
use crate::error::ConnectorError;

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub schema: Arc<SchemaDescriptor>,
    pub created_at: DateTime<Utc>,
    pub ttl_ms: u64,
    /// Only ever true on a copy handed out after a failed refresh.
    pub stale: bool,
}

impl CacheEntry {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        let age_ms = (now - self.created_at).num_milliseconds();
        let ttl_ms = i64::try_from(self.ttl_ms).unwrap_or(i64::MAX);
        ttl_ms > 0 && age_ms <= ttl_ms
    }

    fn stale_copy(&self) -> Arc<CacheEntry> {
        Arc::new(CacheEntry {
            stale: true,
            ..self.clone()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupOrigin {
    Hit,
    Fetched,
    Stale,
}

#[derive(Debug, Clone)]
pub struct SchemaLookup {
    pub entry: Arc<CacheEntry>,
    pub origin: LookupOrigin,
}

impl SchemaLookup {
    pub fn schema(&self) -> Arc<SchemaDescriptor> {
        Arc::clone(&self.entry.schema)
    }

    pub fn is_stale(&self) -> bool {
        self.entry.stale
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<CacheEntry>, ConnectorError>>>;

enum Flight {
    Ready(Arc<CacheEntry>),
    Pending(SharedFetch),
}

struct Inner {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    inflight: DashMap<CacheKey, SharedFetch>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    store: Option<SchemaStore>,
}

impl Inner {
    fn publish(&self, key: &CacheKey, schema: SchemaDescriptor) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            key: key.clone(),
            schema: Arc::new(schema),
            created_at: self.clock.now(),
            ttl_ms: u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX),
            stale: false,
        });
        self.entries.insert(key.clone(), Arc::clone(&entry));
        if let Some(store) = &self.store {
            let persisted = PersistedEntry {
                key: key.clone(),
                schema: (*entry.schema).clone(),
                created_at: entry.created_at,
                ttl_ms: entry.ttl_ms,
            };
            if let Err(e) = store.save(&persisted) {
                tracing::warn!(cache_key = %key, error = %e, "failed to persist schema");
            }
        }
        tracing::debug!(
            component = "schema_cache",
            cache_key = %key,
            collections = entry.schema.collection_count(),
            "published schema"
        );
        entry
    }

    fn in_memory(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Memory first, then the persistent store. Loaded entries are adopted
    /// into memory even when expired so they can back a stale fallback.
    fn lookup_any(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.in_memory(key) {
            return Some(entry);
        }
        let store = self.store.as_ref()?;
        match store.load(key) {
            Ok(Some(p)) => {
                let loaded = Arc::new(CacheEntry {
                    key: p.key,
                    schema: Arc::new(p.schema),
                    created_at: p.created_at,
                    ttl_ms: p.ttl_ms,
                    stale: false,
                });
                let adopted = self
                    .entries
                    .entry(key.clone())
                    .or_insert(loaded)
                    .value()
                    .clone();
                Some(adopted)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(cache_key = %key, error = %e, "ignoring unreadable cached schema");
                None
            }
        }
    }

    fn fresh(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let now = self.clock.now();
        self.lookup_any(key).filter(|e| e.is_fresh_at(now))
    }
}

pub struct SchemaCacheBuilder {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    store: Option<SchemaStore>,
}

impl SchemaCacheBuilder {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(mut self, store: SchemaStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> SchemaCache {
        SchemaCache {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                inflight: DashMap::new(),
                ttl: self.ttl,
                clock: self.clock,
                store: self.store,
            }),
        }
    }
}

/// Shared by every request; cheap to clone.
#[derive(Clone)]
pub struct SchemaCache {
    inner: Arc<Inner>,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SchemaCache {
    pub fn new(ttl: Duration) -> Self {
        Self::builder().ttl(ttl).build()
    }

    pub fn builder() -> SchemaCacheBuilder {
        SchemaCacheBuilder {
            ttl: DEFAULT_TTL,
            clock: Arc::new(SystemClock),
            store: None,
        }
    }

    /// Fresh entry for `key`, or `None`. Never returns an expired entry.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.inner.fresh(key)
    }

    pub fn put(&self, key: &CacheKey, schema: SchemaDescriptor) -> Arc<CacheEntry> {
        self.inner.publish(key, schema)
    }

    pub fn invalidate(&self, key: &CacheKey) {
        self.inner.entries.remove(key);
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.remove(key) {
                tracing::warn!(cache_key = %key, error = %e, "failed to delete cached schema");
            }
        }
        tracing::info!(component = "schema_cache", cache_key = %key, "invalidated");
    }

    pub fn clear(&self) {
        self.inner.entries.clear();
        if let Some(store) = &self.inner.store {
            if let Err(e) = store.clear() {
                tracing::warn!(error = %e, "failed to clear schema store");
            }
        }
    }

    /// Number of entries held in memory, fresh or expired.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Return the cached schema, introspecting on a miss or expiry.
    ///
    /// `fetch` is only invoked if this call starts the introspection; callers
    /// that arrive while one is running share its outcome. If the fresh
    /// attempt fails and an expired entry exists, that entry is returned
    /// with `stale = true`.
    pub async fn get_or_introspect<F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
    ) -> Result<SchemaLookup, ConnectorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SchemaDescriptor, ConnectorError>> + Send + 'static,
    {
        if let Some(entry) = self.get(key) {
            tracing::debug!(component = "schema_cache", cache_key = %key, "hit");
            return Ok(SchemaLookup {
                entry,
                origin: LookupOrigin::Hit,
            });
        }

        let shared = match self.join_or_start(key, fetch, false) {
            Flight::Ready(entry) => {
                return Ok(SchemaLookup {
                    entry,
                    origin: LookupOrigin::Hit,
                })
            }
            Flight::Pending(shared) => shared,
        };

        match shared.await {
            Ok(entry) => Ok(SchemaLookup {
                entry,
                origin: LookupOrigin::Fetched,
            }),
            Err(err) => match self.inner.lookup_any(key) {
                Some(entry) if entry.is_fresh_at(self.inner.clock.now()) => Ok(SchemaLookup {
                    entry,
                    origin: LookupOrigin::Hit,
                }),
                Some(expired) => {
                    tracing::warn!(
                        component = "schema_cache",
                        cache_key = %key,
                        error = %err,
                        "introspection failed, serving stale schema"
                    );
                    Ok(SchemaLookup {
                        entry: expired.stale_copy(),
                        origin: LookupOrigin::Stale,
                    })
                }
                None => Err(err),
            },
        }
    }

    /// Re-introspect regardless of freshness. The existing entry stays in
    /// place until the new one is ready, and is kept if the fetch fails.
    pub async fn refresh<F, Fut>(
        &self,
        key: &CacheKey,
        fetch: F,
    ) -> Result<Arc<CacheEntry>, ConnectorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SchemaDescriptor, ConnectorError>> + Send + 'static,
    {
        match self.join_or_start(key, fetch, true) {
            Flight::Ready(entry) => Ok(entry),
            Flight::Pending(shared) => shared.await,
        }
    }

    fn join_or_start<F, Fut>(&self, key: &CacheKey, fetch: F, force: bool) -> Flight
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SchemaDescriptor, ConnectorError>> + Send + 'static,
    {
        match self.inner.inflight.entry(key.clone()) {
            Entry::Occupied(running) => Flight::Pending(running.get().clone()),
            Entry::Vacant(slot) => {
                // A flight may have published between our miss and taking the slot.
                if !force {
                    if let Some(entry) = self.inner.fresh(key) {
                        return Flight::Ready(entry);
                    }
                }

                tracing::info!(component = "schema_cache", cache_key = %key, "introspecting");
                let inner = Arc::clone(&self.inner);
                let task_key = key.clone();
                let work = fetch();
                let handle = tokio::spawn(async move {
                    let outcome = match work.await {
                        Ok(schema) => Ok(inner.publish(&task_key, schema)),
                        Err(e) => Err(e),
                    };
                    inner.inflight.remove(&task_key);
                    outcome
                });

                let shared = async move {
                    match handle.await {
                        Ok(outcome) => outcome,
                        Err(e) => Err(ConnectorError::connection(format!(
                            "schema introspection task failed: {e}"
                        ))),
                    }
                }
                .boxed()
                .shared();

                slot.insert(shared.clone());
                Flight::Pending(shared)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::schema::types::{Field, Relation, RelationKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Utc::now())))
        }

        fn advance(&self, secs: i64) {
            self.advance_ms(secs * 1000);
        }

        fn advance_ms(&self, ms: i64) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::milliseconds(ms);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn key() -> CacheKey {
        CacheKey::new(Backend::Postgres, "localhost:5432", "shop")
    }

    fn orders_schema() -> SchemaDescriptor {
        SchemaDescriptor::new(
            Backend::Postgres,
            vec![Relation::new("orders", RelationKind::Table).with_fields(vec![
                Field::new("id", "integer"),
                Field::new("created_at", "timestamp"),
            ])],
        )
    }

    fn counting_fetch(
        calls: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<SchemaDescriptor, ConnectorError>> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(orders_schema())
            }
            .boxed()
        }
    }

    fn failing_fetch(
        calls: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<SchemaDescriptor, ConnectorError>> {
        let calls = Arc::clone(calls);
        move || {
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ConnectorError::connection("connection refused"))
            }
            .boxed()
        }
    }

    #[test]
    fn test_get_after_put() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        let schema = orders_schema();
        cache.put(&key(), schema.clone());
        let entry = cache.get(&key()).unwrap();
        assert_eq!(*entry.schema, schema);
        assert!(!entry.stale);
    }

    #[test]
    fn test_invalidate() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        cache.put(&key(), orders_schema());
        cache.invalidate(&key());
        assert!(cache.get(&key()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entry_not_returned() {
        let clock = ManualClock::new();
        let cache = SchemaCache::builder()
            .ttl(Duration::from_secs(1))
            .clock(clock.clone())
            .build();
        cache.put(&key(), orders_schema());
        assert!(cache.get(&key()).is_some());
        clock.advance(2);
        assert!(cache.get(&key()).is_none());
    }

    #[test]
    fn test_sub_second_ttl() {
        let clock = ManualClock::new();
        let cache = SchemaCache::builder()
            .ttl(Duration::from_millis(500))
            .clock(clock.clone())
            .build();
        cache.put(&key(), orders_schema());
        clock.advance_ms(400);
        assert!(cache.get(&key()).is_some());
        clock.advance_ms(200);
        assert!(cache.get(&key()).is_none());
    }

    #[test]
    fn test_empty_schema_is_cached() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        cache.put(&key(), SchemaDescriptor::new(Backend::Postgres, vec![]));
        let entry = cache.get(&key()).unwrap();
        assert!(entry.schema.is_empty());
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_introspect(&key(), counting_fetch(&calls))
            .await
            .unwrap();
        assert_eq!(first.origin, LookupOrigin::Fetched);

        let second = cache
            .get_or_introspect(&key(), counting_fetch(&calls))
            .await
            .unwrap();
        assert_eq!(second.origin, LookupOrigin::Hit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expiry_triggers_one_reintrospection() {
        let clock = ManualClock::new();
        let cache = SchemaCache::builder()
            .ttl(Duration::from_secs(1))
            .clock(clock.clone())
            .build();
        let calls = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_introspect(&key(), counting_fetch(&calls))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(2);
        assert!(cache.get(&key()).is_none());

        let lookup = cache
            .get_or_introspect(&key(), counting_fetch(&calls))
            .await
            .unwrap();
        assert_eq!(lookup.origin, LookupOrigin::Fetched);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_only_after_failed_refresh() {
        let clock = ManualClock::new();
        let cache = SchemaCache::builder()
            .ttl(Duration::from_secs(1))
            .clock(clock.clone())
            .build();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.put(&key(), orders_schema());
        clock.advance(5);

        let lookup = cache
            .get_or_introspect(&key(), failing_fetch(&calls))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "fresh attempt must come first");
        assert_eq!(lookup.origin, LookupOrigin::Stale);
        assert!(lookup.is_stale());
        assert_eq!(lookup.entry.schema.relations[0].name, "orders");

        // The stored entry itself is untouched.
        assert!(cache.get(&key()).is_none());
    }

    #[tokio::test]
    async fn test_failure_without_entry_surfaces_error() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let err = cache
            .get_or_introspect(&key(), failing_fetch(&calls))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::FailureKind::Connection);
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_misses_collapse() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let lookups = (0..16).map(|_| {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_introspect(&key(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(orders_schema())
                    })
                    .await
            })
        });

        let results = futures::future::join_all(lookups).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        for result in results {
            let lookup = result.unwrap().unwrap();
            assert_eq!(lookup.entry.schema.relations[0].name, "orders");
        }
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_failure() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let k = key();

        let lookups = (0..8).map(|_| {
            let calls = Arc::clone(&calls);
            cache.get_or_introspect(&k, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(ConnectorError::permission("denied"))
            })
        });

        let results = futures::future::join_all(lookups).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(e) if e.kind == crate::error::FailureKind::Permission)));
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_abort_shared_introspection() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = {
            let cache = cache.clone();
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_introspect(&key(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        started.notify_one();
                        release.notified().await;
                        Ok(orders_schema())
                    })
                    .await
            })
        };

        started.notified().await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let waiter = {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                cache
                    .get_or_introspect(&key(), counting_fetch(&calls))
                    .await
            })
        };
        tokio::task::yield_now().await;
        release.notify_one();

        let lookup = waiter.await.unwrap().unwrap();
        assert_ne!(lookup.origin, LookupOrigin::Stale);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.get(&key()).is_some());
    }

    #[tokio::test]
    async fn test_refresh_replaces_wholesale() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        let before = cache.put(&key(), orders_schema());

        let after = cache
            .refresh(&key(), || async {
                Ok(SchemaDescriptor::new(
                    Backend::Postgres,
                    vec![
                        Relation::new("customers", RelationKind::Table),
                        Relation::new("orders", RelationKind::Table),
                    ],
                ))
            })
            .await
            .unwrap();

        assert_eq!(before.schema.collection_count(), 1);
        assert_eq!(after.schema.collection_count(), 2);
        assert_eq!(cache.get(&key()).unwrap().schema.collection_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_existing_entry() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        cache.put(&key(), orders_schema());
        assert!(cache.refresh(&key(), failing_fetch(&calls)).await.is_err());
        assert_eq!(cache.get(&key()).unwrap().schema.relations[0].name, "orders");
    }

    #[test]
    fn test_persisted_entry_survives_new_cache() {
        let dir = tempfile::tempdir().unwrap();
        let first = SchemaCache::builder()
            .store(SchemaStore::new(dir.path()))
            .build();
        first.put(&key(), orders_schema());

        let second = SchemaCache::builder()
            .store(SchemaStore::new(dir.path()))
            .build();
        let entry = second.get(&key()).unwrap();
        assert_eq!(entry.schema.relations[0].name, "orders");

        second.invalidate(&key());
        let third = SchemaCache::builder()
            .store(SchemaStore::new(dir.path()))
            .build();
        assert!(third.get(&key()).is_none());
    }
}
