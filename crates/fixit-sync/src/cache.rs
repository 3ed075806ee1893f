//! Process-wide query cache.
//!
//! One [`QueryCache`] instance is constructed at startup and cloned
//! (cheap, `Arc` inside) wherever data access happens; there is no
//! module-level global. Entries are keyed by [`QueryKey`] and hold the
//! last fetched value untyped (`Arc<dyn Any>`); the typed surface goes
//! through [`TypedKey`] so a slot is only ever read and written as one
//! type.
//!
//! Consistency rules, enforced here and relied on everywhere else:
//!
//! - every entry mutation happens under the map's entry lock and
//!   publishes a snapshot through the entry's watch channel in the same
//!   critical section, so subscribers never observe value and status out
//!   of step;
//! - at most one fetch is in flight per key, gated by the `Fetching`
//!   status transition under that same lock;
//! - entry locks are never held across an await point.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fixit_store::StoreError;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::key::{KeyPattern, QueryKey, TypedKey};
use crate::policy::{PolicyTable, QueryPolicy};

const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) type StoredValue = Arc<dyn Any + Send + Sync>;

type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<StoredValue, StoreError>> + Send + Sync>;

/// Untyped projector used by the mutation engine; `None` means the
/// current value could not be projected and the patch is skipped.
pub(crate) type ProjectFn = dyn Fn(&StoredValue) -> Option<StoredValue> + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueryStatus {
    Idle,
    Fetching,
    Success,
    Error,
}

/// Point-in-time view of one entry, published on every change.
#[derive(Clone)]
pub(crate) struct EntrySnapshot {
    pub data: Option<StoredValue>,
    pub status: QueryStatus,
    pub error: Option<Arc<StoreError>>,
    pub is_optimistic: bool,
}

impl EntrySnapshot {
    fn empty() -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            is_optimistic: false,
        }
    }
}

/// Record of one optimistic patch, kept for the duration of a mutation.
/// `written` is the compare-and-restore witness: rollback and commit only
/// act on an entry still holding exactly this `Arc`.
pub(crate) struct AppliedPatch {
    pub key: QueryKey,
    pub previous: StoredValue,
    pub previous_optimistic: bool,
    pub written: StoredValue,
}

struct CacheEntry {
    data: Option<StoredValue>,
    status: QueryStatus,
    error: Option<Arc<StoreError>>,
    fetched_at: Option<Instant>,
    is_optimistic: bool,
    /// Marked by `invalidate`; cleared when a fetch settles.
    invalidated: bool,
    policy: QueryPolicy,
    subscribers: usize,
    /// Set when the last subscriber leaves; basis for eviction.
    idle_since: Option<Instant>,
    /// Retained so invalidation and focus revalidation can refetch
    /// without the original caller.
    fetcher: Option<Fetcher>,
    notify: watch::Sender<EntrySnapshot>,
}

impl CacheEntry {
    fn new(policy: QueryPolicy) -> Self {
        let (notify, _) = watch::channel(EntrySnapshot::empty());
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            fetched_at: None,
            is_optimistic: false,
            invalidated: false,
            policy,
            subscribers: 0,
            idle_since: Some(Instant::now()),
            fetcher: None,
            notify,
        }
    }

    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            is_optimistic: self.is_optimistic,
        }
    }

    /// Publish the current state. `send_replace` keeps the channel value
    /// current even with no receivers, so late subscribers start from the
    /// latest snapshot.
    fn publish(&self) {
        self.notify.send_replace(self.snapshot());
    }

    fn is_stale(&self) -> bool {
        self.invalidated
            || match self.fetched_at {
                Some(at) => at.elapsed() >= self.policy.stale_after,
                None => true,
            }
    }
}

struct CacheInner {
    entries: DashMap<QueryKey, CacheEntry>,
    policies: PolicyTable,
}

/// The cache service. Clone freely; all clones share one store.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheInner>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(PolicyTable::default())
    }
}

impl QueryCache {
    pub fn new(policies: PolicyTable) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                policies,
            }),
        }
    }

    /// Subscribe to a key, fetching as needed.
    ///
    /// Returns synchronously with whatever the entry currently holds. A
    /// fresh value schedules nothing; a stale value is served as-is while
    /// a background revalidation runs; a missing value leaves the entry
    /// in `Fetching` until the first resolution (await it via
    /// [`QueryRef::ready`]). Concurrent callers for the same key share
    /// one in-flight fetch.
    pub fn query<T, F, Fut>(&self, key: &TypedKey<T>, fetch: F) -> QueryRef<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        let policy = self.inner.policies.resolve(key.key());
        self.query_with_policy(key, policy, fetch)
    }

    /// [`QueryCache::query`] with an explicit policy instead of the
    /// table's.
    pub fn query_with_policy<T, F, Fut>(
        &self,
        key: &TypedKey<T>,
        policy: QueryPolicy,
        fetch: F,
    ) -> QueryRef<T>
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        let fetcher = wrap_fetch(fetch);
        let key = key.key().clone();

        let receiver = {
            let mut entry = self
                .inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(policy));
            entry.subscribers += 1;
            entry.idle_since = None;
            entry.policy = policy;
            entry.fetcher = Some(fetcher);
            let receiver = entry.notify.subscribe();

            let needs_fetch = entry.status != QueryStatus::Fetching && entry.is_stale();
            if needs_fetch {
                entry.status = QueryStatus::Fetching;
                entry.publish();
            } else {
                trace!(key = %key, "cache hit");
            }
            drop(entry);

            if needs_fetch {
                self.spawn_fetch(key.clone());
            }
            receiver
        };

        QueryRef {
            cache: self.clone(),
            key,
            receiver,
            _marker: std::marker::PhantomData,
        }
    }

    /// Populate a key without holding a subscription; used by route-level
    /// warmers. Fresh entries and in-flight fetches are left alone.
    pub fn prefetch<T, F, Fut>(&self, key: &TypedKey<T>, fetch: F)
    where
        T: Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        let policy = self.inner.policies.resolve(key.key());
        let fetcher = wrap_fetch(fetch);
        let key = key.key().clone();

        let needs_fetch = {
            let mut entry = self
                .inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(policy));
            entry.fetcher = Some(fetcher);
            let needs = entry.status != QueryStatus::Fetching && entry.is_stale();
            if needs {
                entry.status = QueryStatus::Fetching;
                entry.publish();
            }
            needs
        };

        if needs_fetch {
            trace!(key = %key, "prefetching");
            self.spawn_fetch(key);
        }
    }

    /// Mark matching entries stale. Entries with subscribers refetch
    /// immediately (coalesced with any in-flight fetch); the rest refetch
    /// on their next subscription.
    pub fn invalidate(&self, pattern: &KeyPattern) {
        let keys: Vec<QueryKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            let should_fetch = {
                let Some(mut entry) = self.inner.entries.get_mut(&key) else {
                    continue;
                };
                entry.invalidated = true;
                if entry.subscribers > 0
                    && entry.status != QueryStatus::Fetching
                    && entry.fetcher.is_some()
                {
                    entry.status = QueryStatus::Fetching;
                    entry.publish();
                    true
                } else {
                    false
                }
            };
            if should_fetch {
                debug!(key = %key, "invalidated, refetching");
                self.spawn_fetch(key);
            } else {
                trace!(key = %key, "invalidated");
            }
        }
    }

    /// Replace a slot's value with server-derived data. Creates the entry
    /// if absent; counts as fresh.
    pub fn set_query_data<T>(&self, key: &TypedKey<T>, value: T)
    where
        T: Send + Sync + 'static,
    {
        let policy = self.inner.policies.resolve(key.key());
        let mut entry = self
            .inner
            .entries
            .entry(key.key().clone())
            .or_insert_with(|| CacheEntry::new(policy));
        entry.data = Some(Arc::new(value) as StoredValue);
        entry.status = QueryStatus::Success;
        entry.error = None;
        entry.fetched_at = Some(Instant::now());
        entry.is_optimistic = false;
        entry.invalidated = false;
        entry.publish();
    }

    /// Transform a slot's current value in place. No-op (returns false)
    /// when the entry is absent or empty.
    pub fn update_query_data<T, F>(&self, key: &TypedKey<T>, update: F) -> bool
    where
        T: Send + Sync + 'static,
        F: FnOnce(&T) -> T,
    {
        let Some(mut entry) = self.inner.entries.get_mut(key.key()) else {
            return false;
        };
        let Some(current) = entry.data.clone() else {
            return false;
        };
        let Ok(typed) = current.downcast::<T>() else {
            return false;
        };
        entry.data = Some(Arc::new(update(&typed)) as StoredValue);
        entry.status = QueryStatus::Success;
        entry.error = None;
        entry.fetched_at = Some(Instant::now());
        entry.is_optimistic = false;
        entry.publish();
        true
    }

    /// Current value of a slot without subscribing.
    pub fn peek<T>(&self, key: &TypedKey<T>) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let entry = self.inner.entries.get(key.key())?;
        let data = entry.data.clone()?;
        data.downcast::<T>().ok()
    }

    /// Revalidate stale subscribed entries whose policy asks for it.
    pub fn focus_changed(&self) {
        let keys: Vec<QueryKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| {
                entry.subscribers > 0
                    && entry.policy.refetch_on_focus
                    && entry.status != QueryStatus::Fetching
                    && entry.fetcher.is_some()
                    && entry.is_stale()
            })
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            if self.begin_refetch(&key) {
                debug!(key = %key, "focus revalidation");
            }
        }
    }

    /// Evict entries that have had no subscribers for their
    /// `collect_after`. Driven by the maintenance task; public so tests
    /// and embedders can run a sweep directly.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut evicted = 0usize;
        self.inner.entries.retain(|_, entry| {
            let collectable = entry.subscribers == 0
                && entry.status != QueryStatus::Fetching
                && entry
                    .idle_since
                    .is_some_and(|idle| now.duration_since(idle) >= entry.policy.collect_after);
            if collectable {
                evicted += 1;
            }
            !collectable
        });
        if evicted > 0 {
            debug!(evicted, remaining = self.inner.entries.len(), "swept cache");
        }
    }

    /// Drop every entry. Used on sign-out.
    pub fn clear(&self) {
        let dropped = self.inner.entries.len();
        self.inner.entries.clear();
        debug!(dropped, "cache cleared");
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.inner
            .entries
            .get(key)
            .map(|entry| entry.subscribers)
            .unwrap_or(0)
    }

    /// Periodic sweep plus forced interval refetches. Spawn once per
    /// service.
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(MAINTENANCE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                cache.sweep();
                cache.drive_intervals();
            }
        })
    }

    /// Force refetches for subscribed entries whose `refetch_interval`
    /// has elapsed.
    fn drive_intervals(&self) {
        let now = Instant::now();
        let keys: Vec<QueryKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| {
                entry.subscribers > 0
                    && entry.status != QueryStatus::Fetching
                    && entry.fetcher.is_some()
                    && entry.policy.refetch_interval.is_some_and(|interval| {
                        entry
                            .fetched_at
                            .is_none_or(|at| now.duration_since(at) >= interval)
                    })
            })
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            if self.begin_refetch(&key) {
                trace!(key = %key, "interval refetch");
            }
        }
    }

    /// Transition a key to `Fetching` and spawn the fetch, unless one is
    /// already running. Returns whether a fetch was started.
    fn begin_refetch(&self, key: &QueryKey) -> bool {
        let started = {
            let Some(mut entry) = self.inner.entries.get_mut(key) else {
                return false;
            };
            if entry.status == QueryStatus::Fetching || entry.fetcher.is_none() {
                false
            } else {
                entry.status = QueryStatus::Fetching;
                entry.publish();
                true
            }
        };
        if started {
            self.spawn_fetch(key.clone());
        }
        started
    }

    fn spawn_fetch(&self, key: QueryKey) {
        let cache = self.clone();
        tokio::spawn(async move {
            cache.run_fetch(key).await;
        });
    }

    async fn run_fetch(&self, key: QueryKey) {
        let (fetcher, retry_count) = {
            let Some(entry) = self.inner.entries.get(&key) else {
                return;
            };
            let Some(fetcher) = entry.fetcher.clone() else {
                return;
            };
            (fetcher, entry.policy.retry_count)
        };

        let result = execute_with_retry(&key, fetcher, retry_count).await;

        let Some(mut entry) = self.inner.entries.get_mut(&key) else {
            return;
        };
        match result {
            Ok(value) => {
                entry.data = Some(value);
                entry.status = QueryStatus::Success;
                entry.error = None;
                entry.fetched_at = Some(Instant::now());
                entry.is_optimistic = false;
                entry.invalidated = false;
                trace!(key = %key, "fetch resolved");
            }
            Err(err) => {
                warn!(key = %key, error = %err, "fetch failed");
                entry.status = QueryStatus::Error;
                entry.error = Some(Arc::new(err));
                entry.invalidated = false;
            }
        }
        entry.publish();
    }

    fn release(&self, key: &QueryKey) {
        let Some(mut entry) = self.inner.entries.get_mut(key) else {
            return;
        };
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers == 0 {
            entry.idle_since = Some(Instant::now());
        }
    }

    /// Project a new optimistic value over the current one. Returns the
    /// record needed to commit or roll back, or `None` when the entry has
    /// nothing to patch.
    pub(crate) fn apply_optimistic(
        &self,
        key: &QueryKey,
        project: &ProjectFn,
    ) -> Option<AppliedPatch> {
        let mut entry = self.inner.entries.get_mut(key)?;
        let current = entry.data.clone()?;
        let next = project(&current)?;
        let patch = AppliedPatch {
            key: key.clone(),
            previous: current,
            previous_optimistic: entry.is_optimistic,
            written: next.clone(),
        };
        entry.data = Some(next);
        entry.is_optimistic = true;
        entry.publish();
        Some(patch)
    }

    /// Install a server-confirmed value. With a witness, applies only if
    /// the entry still holds that exact write; without one, only if the
    /// entry is not carrying some other mutation's unsettled write.
    /// `replace` returning `None` keeps the current value and just clears
    /// the optimistic tag.
    pub(crate) fn commit_value(
        &self,
        key: &QueryKey,
        witness: Option<&StoredValue>,
        replace: &dyn Fn(Option<&StoredValue>) -> Option<StoredValue>,
    ) -> bool {
        // A witnessed commit targets an entry this mutation patched; if
        // it is gone, there is nothing to take over. An unwitnessed one
        // may create the entry (warming a slot with server data), but
        // only when the commit actually produces a value for it.
        match self.inner.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                let ours = match witness {
                    Some(written) => entry
                        .data
                        .as_ref()
                        .is_some_and(|data| Arc::ptr_eq(data, written)),
                    None => !entry.is_optimistic,
                };
                if !ours {
                    debug!(key = %key, "skipping commit, entry overwritten since patch");
                    return false;
                }

                if let Some(next) = replace(entry.data.as_ref()) {
                    entry.data = Some(next);
                    entry.fetched_at = Some(Instant::now());
                }
                entry.is_optimistic = false;
                entry.status = QueryStatus::Success;
                entry.error = None;
                entry.publish();
                true
            }
            Entry::Vacant(vacant) => {
                if witness.is_some() {
                    return false;
                }
                let Some(value) = replace(None) else {
                    return false;
                };
                let policy = self.inner.policies.resolve(key);
                let mut entry = CacheEntry::new(policy);
                entry.data = Some(value);
                entry.status = QueryStatus::Success;
                entry.fetched_at = Some(Instant::now());
                entry.publish();
                vacant.insert(entry);
                true
            }
        }
    }

    /// Clear the optimistic tag after a successful write that had no
    /// authoritative replacement for this key.
    pub(crate) fn settle_optimistic(&self, key: &QueryKey, witness: &StoredValue) {
        let Some(mut entry) = self.inner.entries.get_mut(key) else {
            return;
        };
        if entry
            .data
            .as_ref()
            .is_some_and(|data| Arc::ptr_eq(data, witness))
        {
            entry.is_optimistic = false;
            entry.status = QueryStatus::Success;
            entry.publish();
        }
    }

    /// Compare-and-restore: put the pre-mutation value back, but only if
    /// the entry still holds this mutation's write. A later writer's
    /// value is left alone.
    pub(crate) fn restore(&self, patch: &AppliedPatch) {
        let Some(mut entry) = self.inner.entries.get_mut(&patch.key) else {
            return;
        };
        let still_ours = entry
            .data
            .as_ref()
            .is_some_and(|data| Arc::ptr_eq(data, &patch.written));
        if !still_ours {
            debug!(key = %patch.key, "rollback skipped, a later write owns the entry");
            return;
        }
        entry.data = Some(patch.previous.clone());
        entry.is_optimistic = patch.previous_optimistic;
        entry.publish();
    }
}

fn wrap_fetch<T, F, Fut>(fetch: F) -> Fetcher
where
    T: Send + Sync + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
{
    Arc::new(move || {
        let fut = fetch();
        Box::pin(async move { fut.await.map(|value| Arc::new(value) as StoredValue) })
            as BoxFuture<'static, Result<StoredValue, StoreError>>
    })
}

async fn execute_with_retry(
    key: &QueryKey,
    fetcher: Fetcher,
    retry_count: u32,
) -> Result<StoredValue, StoreError> {
    let mut attempt: u32 = 0;
    loop {
        match fetcher().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < retry_count => {
                attempt += 1;
                let delay = RETRY_BASE_DELAY * 2u32.saturating_pow(attempt - 1);
                debug!(key = %key, attempt, error = %err, "fetch attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Typed view of one query: the Subscription of the data model.
///
/// Holds a subscriber slot on the entry for its lifetime; dropping it
/// releases the slot (never cancels a fetch other subscribers share).
pub struct QueryRef<T> {
    cache: QueryCache,
    key: QueryKey,
    receiver: watch::Receiver<EntrySnapshot>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

/// What a consumer renders: the UI-boundary snapshot.
#[derive(Clone)]
pub struct QueryData<T> {
    pub data: Option<Arc<T>>,
    pub is_loading: bool,
    pub is_error: bool,
    /// True while `data` is an optimistic patch the server has not
    /// confirmed yet.
    pub is_optimistic: bool,
    pub error: Option<Arc<StoreError>>,
}

impl<T: Send + Sync + 'static> QueryRef<T> {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// The entry's current state, without waiting.
    pub fn snapshot(&self) -> QueryData<T> {
        typed_data(&self.receiver.borrow())
    }

    /// Wait for the first resolution. Returns immediately when the entry
    /// already has data (fresh or stale) or has settled in an error.
    pub async fn ready(&mut self) -> QueryData<T> {
        loop {
            {
                let snapshot = self.receiver.borrow_and_update();
                if snapshot.data.is_some()
                    || matches!(snapshot.status, QueryStatus::Success | QueryStatus::Error)
                {
                    return typed_data(&snapshot);
                }
            }
            if self.receiver.changed().await.is_err() {
                // Entry dropped out from under us (cache cleared).
                return typed_data(&self.receiver.borrow());
            }
        }
    }

    /// Wait for the next published change. Returns false if the entry is
    /// gone.
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    /// Force a revalidation regardless of freshness.
    pub fn refetch(&self) {
        if self.cache.begin_refetch(&self.key) {
            debug!(key = %self.key, "imperative refetch");
        }
    }
}

impl<T> Drop for QueryRef<T> {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

fn typed_data<T: Send + Sync + 'static>(snapshot: &EntrySnapshot) -> QueryData<T> {
    let data = snapshot
        .data
        .clone()
        .and_then(|value| value.downcast::<T>().ok());
    QueryData {
        is_loading: snapshot.status == QueryStatus::Fetching && data.is_none(),
        is_error: snapshot.status == QueryStatus::Error,
        is_optimistic: snapshot.is_optimistic,
        error: snapshot.error.clone(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::*;
    use crate::key::{KeyPart, keys};

    fn text_key(name: &str) -> TypedKey<String> {
        TypedKey::new(QueryKey::new(vec![KeyPart::Text(name.to_string())]))
    }

    #[tokio::test]
    async fn set_and_peek_round_trip() {
        let cache = QueryCache::default();
        let key = text_key("greeting");
        cache.set_query_data(&key, "hello".to_string());
        assert_eq!(cache.peek(&key).as_deref(), Some(&"hello".to_string()));
    }

    #[tokio::test]
    async fn update_on_absent_entry_is_a_noop() {
        let cache = QueryCache::default();
        let key = text_key("missing");
        assert!(!cache.update_query_data(&key, |s| s.clone()));
        assert!(!cache.contains(key.key()));
    }

    #[tokio::test]
    async fn subscriber_count_tracks_refs() {
        let cache = QueryCache::default();
        let key = text_key("counted");
        cache.set_query_data(&key, "v".to_string());

        let first = cache.query(&key, || async { Ok("v".to_string()) });
        let second = cache.query(&key, || async { Ok("v".to_string()) });
        assert_eq!(cache.subscriber_count(key.key()), 2);

        drop(first);
        assert_eq!(cache.subscriber_count(key.key()), 1);
        drop(second);
        assert_eq!(cache.subscriber_count(key.key()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_respects_collect_after_and_subscribers() {
        let cache = QueryCache::default();
        let chat = Uuid::from_u128(1);
        // realtime profile: collect_after is one minute
        let key = keys::messages(chat);
        cache.set_query_data(&key, Vec::<fixit_store::Message>::new());

        tokio::time::advance(Duration::from_secs(61)).await;
        let held = cache.query(&key, move || async { Ok(Vec::new()) });
        cache.sweep();
        assert!(cache.contains(key.key()), "subscribed entries survive");

        drop(held);
        cache.sweep();
        assert!(
            cache.contains(key.key()),
            "idle clock restarts when the last subscriber leaves"
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        cache.sweep();
        assert!(!cache.contains(key.key()));
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let cache = QueryCache::default();
        cache.set_query_data(&text_key("a"), 1u32.to_string());
        cache.set_query_data(&text_key("b"), 2u32.to_string());
        assert_eq!(cache.len(), 2);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn commit_without_witness_respects_foreign_optimistic_state() {
        let cache = QueryCache::default();
        let key = text_key("contended");
        cache.set_query_data(&key, "base".to_string());

        let patch = cache
            .apply_optimistic(key.key(), &|current| {
                current.clone().downcast::<String>().ok().map(|_| {
                    Arc::new("optimistic".to_string()) as StoredValue
                })
            })
            .unwrap();

        // Another mutation committing to the same key without having
        // patched it must not clobber the unsettled write.
        let replaced = cache.commit_value(key.key(), None, &|_| {
            Some(Arc::new("server".to_string()) as StoredValue)
        });
        assert!(!replaced);
        assert_eq!(cache.peek(&key).as_deref(), Some(&"optimistic".to_string()));

        cache.restore(&patch);
        assert_eq!(cache.peek(&key).as_deref(), Some(&"base".to_string()));
    }
}
