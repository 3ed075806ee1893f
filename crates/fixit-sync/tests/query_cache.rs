//! Behavior tests for the query cache: request dedup, staleness,
//! invalidation coalescing, retries, and garbage collection.
//!
//! Time-dependent paths run under a paused clock, so staleness windows
//! and retry backoff are exercised without wall-clock waits.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use fixit_store::{StoreError, User};
use fixit_sync::{KeyPattern, QueryCache, QueryPolicy, keys};
use tokio::sync::Notify;
use tokio::task::yield_now;
use uuid::Uuid;

fn user(version: usize) -> User {
    User {
        id: Uuid::from_u128(7),
        email: "avery@example.test".to_string(),
        full_name: format!("v{version}"),
        avatar_url: None,
        bio: None,
        phone: None,
        location: None,
        is_provider: false,
        created_at: Utc::now(),
        services: Vec::new(),
    }
}

type BoxedFetch = std::pin::Pin<Box<dyn Future<Output = Result<User, StoreError>> + Send>>;

/// Fetcher that reports how many times it ran and returns a value
/// encoding the call number, so tests can tell fetches apart.
fn counting_fetch(
    calls: &Arc<AtomicUsize>,
) -> impl Fn() -> BoxedFetch + Clone + Send + Sync + 'static {
    let calls = Arc::clone(calls);
    move || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move { Ok(user(n)) }) as BoxedFetch
    }
}

fn version_of(data: &fixit_sync::QueryData<User>) -> Option<String> {
    data.data.as_ref().map(|u| u.full_name.clone())
}

fn plain_policy(stale_after: Duration) -> QueryPolicy {
    QueryPolicy {
        stale_after,
        collect_after: Duration::from_secs(600),
        refetch_on_focus: false,
        refetch_interval: None,
        retry_count: 0,
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_subscribers_share_one_fetch() {
    let cache = QueryCache::default();
    let key = keys::profile(Uuid::from_u128(7));
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = counting_fetch(&calls);

    let mut first = cache.query(&key, fetch.clone());
    let mut second = cache.query(&key, fetch);

    let a = first.ready().await;
    let b = second.ready().await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(version_of(&a), Some("v1".to_string()));
    assert_eq!(version_of(&b), Some("v1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn fresh_entries_are_served_without_a_fetch() {
    let cache = QueryCache::default();
    let key = keys::profile(Uuid::from_u128(7));
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = counting_fetch(&calls);

    let mut first =
        cache.query_with_policy(&key, plain_policy(Duration::from_secs(60)), fetch.clone());
    first.ready().await;
    drop(first);

    tokio::time::advance(Duration::from_secs(10)).await;

    let second = cache.query_with_policy(&key, plain_policy(Duration::from_secs(60)), fetch);
    for _ in 0..5 {
        yield_now().await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1, "fresh value re-served");
    assert_eq!(version_of(&second.snapshot()), Some("v1".to_string()));
}

#[tokio::test(start_paused = true)]
async fn stale_entries_serve_old_data_while_revalidating() {
    let cache = QueryCache::default();
    let key = keys::profile(Uuid::from_u128(7));
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = plain_policy(Duration::from_secs(60));
    let fetch = counting_fetch(&calls);

    let mut first = cache.query_with_policy(&key, policy, fetch.clone());
    let loading = first.snapshot();
    assert!(loading.is_loading);
    assert!(loading.data.is_none());
    first.ready().await;
    drop(first);

    tokio::time::advance(Duration::from_secs(90)).await;

    // Stale: the cached row is served immediately, revalidation runs
    // behind it.
    let mut second = cache.query_with_policy(&key, policy, fetch);
    let served = second.snapshot();
    assert_eq!(version_of(&served), Some("v1".to_string()));
    assert!(!served.is_loading, "stale data is not a loading state");

    while version_of(&second.snapshot()) != Some("v2".to_string()) {
        assert!(second.changed().await);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn rapid_invalidations_coalesce_into_one_refetch() {
    let cache = QueryCache::default();
    let key = keys::profile(Uuid::from_u128(7));
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());

    let fetch = {
        let calls = Arc::clone(&calls);
        let gate = Arc::clone(&gate);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let gate = Arc::clone(&gate);
            Box::pin(async move {
                gate.notified().await;
                Ok(user(n))
            }) as BoxedFetch
        }
    };

    let mut profile = cache.query_with_policy(&key, plain_policy(Duration::from_secs(600)), fetch);
    gate.notify_one();
    profile.ready().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Burst of invalidations: the first starts a refetch, the rest find
    // it already in flight.
    for _ in 0..3 {
        cache.invalidate(&KeyPattern::exact(key.key().clone()));
    }
    yield_now().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    gate.notify_one();
    while version_of(&profile.snapshot()) != Some("v2".to_string()) {
        assert!(profile.changed().await);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2, "exactly one refetch");
}

#[tokio::test(start_paused = true)]
async fn invalidating_an_idle_entry_defers_the_refetch() {
    let cache = QueryCache::default();
    let key = keys::profile(Uuid::from_u128(7));
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = counting_fetch(&calls);

    cache.prefetch(&key, fetch.clone());
    while cache.peek(&key).is_none() {
        yield_now().await;
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    cache.invalidate(&KeyPattern::exact(key.key().clone()));
    for _ in 0..5 {
        yield_now().await;
    }
    assert_eq!(
        calls.load(Ordering::SeqCst),
        1,
        "no subscriber, so no background refetch"
    );

    // The next subscriber pays for the refresh.
    let mut reference = cache.query(&key, fetch);
    while version_of(&reference.snapshot()) != Some("v2".to_string()) {
        assert!(reference.changed().await);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn fetch_failure_keeps_last_good_data() {
    let cache = QueryCache::default();
    let key = keys::profile(Uuid::from_u128(7));
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = plain_policy(Duration::from_secs(60));

    let fetch = {
        let calls = Arc::clone(&calls);
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move {
                if n == 1 {
                    Ok(user(n))
                } else {
                    Err(StoreError::Unknown("backend down".to_string()))
                }
            }) as BoxedFetch
        }
    };

    let mut profile = cache.query_with_policy(&key, policy, fetch.clone());
    profile.ready().await;

    tokio::time::advance(Duration::from_secs(90)).await;
    profile.refetch();
    while !profile.snapshot().is_error {
        assert!(profile.changed().await);
    }

    let after = profile.snapshot();
    assert_eq!(version_of(&after), Some("v1".to_string()), "data survives the failure");
    assert!(after.error.as_ref().is_some_and(|e| e.to_string().contains("backend down")));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_fetches_retry_before_surfacing() {
    let cache = QueryCache::default();
    let key = keys::profile(Uuid::from_u128(7));
    let calls = Arc::new(AtomicUsize::new(0));
    let policy = QueryPolicy {
        retry_count: 2,
        ..plain_policy(Duration::from_secs(60))
    };

    let fetch = {
        let calls = Arc::clone(&calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Err(StoreError::Unknown("still down".to_string())) })
                as BoxedFetch
        }
    };

    let mut profile = cache.query_with_policy(&key, policy, fetch);
    let settled = profile.ready().await;

    assert!(settled.is_error);
    assert!(settled.data.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3, "initial attempt plus two retries");
}

#[tokio::test(start_paused = true)]
async fn imperative_refetch_ignores_freshness() {
    let cache = QueryCache::default();
    let key = keys::profile(Uuid::from_u128(7));
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = counting_fetch(&calls);

    let mut profile = cache.query_with_policy(&key, plain_policy(Duration::from_secs(3600)), fetch);
    profile.ready().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    profile.refetch();
    while version_of(&profile.snapshot()) != Some("v2".to_string()) {
        assert!(profile.changed().await);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn external_writes_reach_live_subscribers() {
    let cache = QueryCache::default();
    let key = keys::profile(Uuid::from_u128(7));
    let calls = Arc::new(AtomicUsize::new(0));
    let fetch = counting_fetch(&calls);

    let mut profile = cache.query(&key, fetch);
    profile.ready().await;

    let mut pushed = user(1);
    pushed.full_name = "pushed".to_string();
    cache.set_query_data(&key, pushed);

    while version_of(&profile.snapshot()) != Some("pushed".to_string()) {
        assert!(profile.changed().await);
    }
}

#[tokio::test(start_paused = true)]
async fn focus_revalidates_only_focus_sensitive_entries() {
    let cache = QueryCache::default();
    let watched_key = keys::profile(Uuid::from_u128(1));
    let ignored_key = keys::profile(Uuid::from_u128(2));
    let watched_calls = Arc::new(AtomicUsize::new(0));
    let ignored_calls = Arc::new(AtomicUsize::new(0));

    let on_focus = QueryPolicy {
        refetch_on_focus: true,
        ..plain_policy(Duration::from_secs(30))
    };
    let off_focus = plain_policy(Duration::from_secs(30));

    let mut watched =
        cache.query_with_policy(&watched_key, on_focus, counting_fetch(&watched_calls));
    let mut ignored =
        cache.query_with_policy(&ignored_key, off_focus, counting_fetch(&ignored_calls));
    watched.ready().await;
    ignored.ready().await;

    tokio::time::advance(Duration::from_secs(60)).await;
    cache.focus_changed();

    while version_of(&watched.snapshot()) != Some("v2".to_string()) {
        assert!(watched.changed().await);
    }
    for _ in 0..5 {
        yield_now().await;
    }
    assert_eq!(watched_calls.load(Ordering::SeqCst), 2);
    assert_eq!(ignored_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn maintenance_sweeps_entries_past_their_collect_window() {
    let cache = QueryCache::default();
    let key = keys::profile(Uuid::from_u128(7));
    let calls = Arc::new(AtomicUsize::new(0));

    cache.set_query_data(&key, user(1));
    let reference = cache.query(&key, counting_fetch(&calls));
    let maintenance = cache.spawn_maintenance();

    // Held subscription pins the entry far past its collect window.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(cache.len(), 1);

    drop(reference);
    tokio::time::sleep(Duration::from_secs(301)).await;
    assert!(cache.is_empty(), "idle entry collected");
    assert_eq!(calls.load(Ordering::SeqCst), 0, "fresh entry never refetched");

    maintenance.abort();
}
