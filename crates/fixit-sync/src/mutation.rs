//! Optimistic writes.
//!
//! A mutation is described by a [`MutationPlan`]: which cache slots to
//! patch before the network round-trip, how to install the server's
//! authoritative result afterwards, and which derived keys to invalidate.
//! [`MutationEngine::run`] executes the plan strictly in that order:
//! patch, write, then commit-or-restore.
//!
//! Overlapping mutations are safe without a global lock: each patch
//! snapshots from the value current at patch time (which may itself be
//! optimistic), and rollback/commit use compare-and-restore against the
//! exact value this mutation wrote. A slot taken over by a later writer
//! is left alone.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use fixit_store::StoreError;
use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cache::{QueryCache, StoredValue};
use crate::error::SyncError;
use crate::key::{KeyPattern, QueryKey, TypedKey};

struct OptimisticPatch {
    key: QueryKey,
    project: Box<dyn Fn(&StoredValue) -> Option<StoredValue> + Send + Sync>,
}

struct CommitStep<R> {
    key: QueryKey,
    apply: Box<dyn Fn(&R, Option<&StoredValue>) -> Option<StoredValue> + Send + Sync>,
}

/// Declarative description of one mutation's cache effects. `R` is the
/// write's result type.
pub struct MutationPlan<R> {
    patches: Vec<OptimisticPatch>,
    commits: Vec<CommitStep<R>>,
    invalidations: Vec<KeyPattern>,
}

impl<R> MutationPlan<R> {
    pub fn new() -> Self {
        Self {
            patches: Vec::new(),
            commits: Vec::new(),
            invalidations: Vec::new(),
        }
    }

    /// Patch a slot optimistically before the write. Skipped when the
    /// slot has no current value to project from.
    pub fn patch<T, F>(mut self, key: &TypedKey<T>, project: F) -> Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&T) -> T + Send + Sync + 'static,
    {
        let project = Box::new(move |current: &StoredValue| {
            let typed = current.clone().downcast::<T>().ok()?;
            Some(Arc::new(project(&typed)) as StoredValue)
        });
        self.patches.push(OptimisticPatch {
            key: key.key().clone(),
            project,
        });
        self
    }

    /// Install the server-confirmed result into a slot after a
    /// successful write. `apply` sees the write result and the slot's
    /// current value (absent entries pass `None`); returning `None`
    /// leaves the value as-is and just settles the optimistic tag.
    pub fn commit<T, F>(mut self, key: &TypedKey<T>, apply: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&R, Option<&T>) -> Option<T> + Send + Sync + 'static,
    {
        let apply = Box::new(move |result: &R, current: Option<&StoredValue>| {
            let typed: Option<Arc<T>> =
                current.and_then(|value| value.clone().downcast::<T>().ok());
            apply(result, typed.as_deref()).map(|value| Arc::new(value) as StoredValue)
        });
        self.commits.push(CommitStep {
            key: key.key().clone(),
            apply,
        });
        self
    }

    /// Invalidate derived keys after a successful write, refreshing views
    /// the commits did not patch directly.
    pub fn invalidate(mut self, pattern: KeyPattern) -> Self {
        self.invalidations.push(pattern);
        self
    }
}

impl<R> Default for MutationPlan<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes mutation plans against the cache.
#[derive(Clone)]
pub struct MutationEngine {
    cache: QueryCache,
}

impl MutationEngine {
    pub fn new(cache: QueryCache) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    /// Run one mutation: apply the plan's optimistic patches, perform the
    /// write, then commit on success or compare-and-restore on failure.
    ///
    /// Failures after at least one applied patch surface as
    /// [`SyncError::Stale`]; failures with nothing to roll back pass the
    /// store error through. Writes are never retried here.
    pub async fn run<R, F, Fut>(&self, plan: MutationPlan<R>, write: F) -> Result<R, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, StoreError>>,
    {
        let mut applied = Vec::with_capacity(plan.patches.len());
        for patch in &plan.patches {
            if let Some(record) = self.cache.apply_optimistic(&patch.key, patch.project.as_ref())
            {
                applied.push(record);
            }
        }
        if !applied.is_empty() {
            debug!(patched = applied.len(), "optimistic patches applied");
        }

        match write().await {
            Ok(result) => {
                for step in &plan.commits {
                    let witness = applied
                        .iter()
                        .find(|record| record.key == step.key)
                        .map(|record| &record.written);
                    self.cache.commit_value(&step.key, witness, &|current| {
                        (step.apply)(&result, current)
                    });
                }
                for record in &applied {
                    let committed = plan.commits.iter().any(|step| step.key == record.key);
                    if !committed {
                        self.cache.settle_optimistic(&record.key, &record.written);
                    }
                }
                for pattern in &plan.invalidations {
                    self.cache.invalidate(pattern);
                }
                Ok(result)
            }
            Err(err) => {
                if applied.is_empty() {
                    return Err(SyncError::Store(err));
                }
                warn!(
                    error = %err,
                    rolled_back = applied.len(),
                    "write failed, restoring previous values"
                );
                for record in applied.iter().rev() {
                    self.cache.restore(record);
                }
                Err(SyncError::Stale { source: err })
            }
        }
    }
}

/// The UI-boundary handle for one logical mutation: a callable plus
/// pending state and settled callbacks.
pub struct TrackedMutation<Args, R> {
    run: Arc<dyn Fn(Args) -> BoxFuture<'static, Result<R, SyncError>> + Send + Sync>,
    pending: Arc<AtomicUsize>,
    pending_tx: Arc<watch::Sender<bool>>,
    on_success: Option<Arc<dyn Fn(&R) + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&SyncError) + Send + Sync>>,
}

impl<Args, R> TrackedMutation<Args, R>
where
    Args: Send + 'static,
    R: Send + 'static,
{
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, SyncError>> + Send + 'static,
    {
        let (pending_tx, _) = watch::channel(false);
        Self {
            run: Arc::new(move |args| -> BoxFuture<'static, Result<R, SyncError>> {
                Box::pin(operation(args))
            }),
            pending: Arc::new(AtomicUsize::new(0)),
            pending_tx: Arc::new(pending_tx),
            on_success: None,
            on_error: None,
        }
    }

    pub fn on_success(mut self, callback: impl Fn(&R) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Whether any call is currently in flight.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    /// Watch the pending flag; flips to false only when the last
    /// concurrent call settles.
    pub fn pending_changes(&self) -> watch::Receiver<bool> {
        self.pending_tx.subscribe()
    }

    pub async fn call(&self, args: Args) -> Result<R, SyncError> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.pending_tx.send_replace(true);

        let result = (self.run)(args).await;

        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.pending_tx.send_replace(false);
        }
        match &result {
            Ok(value) => {
                if let Some(on_success) = &self.on_success {
                    on_success(value);
                }
            }
            Err(err) => {
                if let Some(on_error) = &self.on_error {
                    on_error(err);
                }
            }
        }
        result
    }
}

impl<Args, R> Clone for TrackedMutation<Args, R> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
            pending: self.pending.clone(),
            pending_tx: self.pending_tx.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::key::KeyPart;
    use crate::key::QueryKey;

    fn counter_key() -> TypedKey<u32> {
        TypedKey::new(QueryKey::new(vec![KeyPart::Text("counter".to_string())]))
    }

    fn engine() -> MutationEngine {
        MutationEngine::new(QueryCache::default())
    }

    #[tokio::test]
    async fn failed_write_restores_previous_value() {
        let engine = engine();
        let key = counter_key();
        engine.cache().set_query_data(&key, 1u32);

        let plan = MutationPlan::<u32>::new().patch(&key, |n| n + 1);
        let err = engine
            .run(plan, || async {
                Err(StoreError::Unknown("boom".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Stale { .. }));
        assert_eq!(engine.cache().peek(&key).as_deref(), Some(&1));
    }

    #[tokio::test]
    async fn successful_write_commits_server_value() {
        let engine = engine();
        let key = counter_key();
        engine.cache().set_query_data(&key, 1u32);

        let plan = MutationPlan::<u32>::new()
            .patch(&key, |n| n + 1)
            .commit(&key, |server, _| Some(*server));
        let result = engine.run(plan, || async { Ok(10u32) }).await.unwrap();

        assert_eq!(result, 10);
        assert_eq!(engine.cache().peek(&key).as_deref(), Some(&10));
    }

    #[tokio::test]
    async fn failure_without_patches_is_a_store_error() {
        let engine = engine();
        let err = engine
            .run(MutationPlan::<()>::new(), || async {
                Err(StoreError::Unknown("offline".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
    }

    #[tokio::test]
    async fn overlapping_rollbacks_unwind_in_order() {
        let engine = engine();
        let key = counter_key();
        engine.cache().set_query_data(&key, 1u32);

        // Two overlapping mutations: each snapshots from the value
        // current at patch time, so the second sees the first's
        // optimistic value.
        let (gate_a_tx, gate_a) = tokio::sync::oneshot::channel::<()>();
        let (gate_b_tx, gate_b) = tokio::sync::oneshot::channel::<()>();

        let engine_a = engine.clone();
        let key_a = key.clone();
        let a = tokio::spawn(async move {
            let plan = MutationPlan::<u32>::new().patch(&key_a, |_| 2);
            engine_a
                .run(plan, move || async move {
                    let _ = gate_a.await;
                    Err(StoreError::Unknown("a failed".to_string()))
                })
                .await
        });
        // Give A's patch time to land before B snapshots.
        tokio::task::yield_now().await;
        assert_eq!(engine.cache().peek(&key).as_deref(), Some(&2));

        let engine_b = engine.clone();
        let key_b = key.clone();
        let b = tokio::spawn(async move {
            let plan = MutationPlan::<u32>::new().patch(&key_b, |_| 3);
            engine_b
                .run(plan, move || async move {
                    let _ = gate_b.await;
                    Err(StoreError::Unknown("b failed".to_string()))
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(engine.cache().peek(&key).as_deref(), Some(&3));

        // A fails first: the slot holds B's write, so A's rollback is a
        // no-op.
        gate_a_tx.send(()).unwrap();
        assert!(a.await.unwrap().is_err());
        assert_eq!(engine.cache().peek(&key).as_deref(), Some(&3));

        // B fails next: restores A's optimistic value, which A had
        // written before B snapshotted.
        gate_b_tx.send(()).unwrap();
        assert!(b.await.unwrap().is_err());
        assert_eq!(engine.cache().peek(&key).as_deref(), Some(&2));
    }

    #[tokio::test]
    async fn tracked_mutation_counts_concurrent_calls() {
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();
        let gate_rx = std::sync::Mutex::new(Some(gate_rx));

        let mutation: TrackedMutation<u32, u32> = TrackedMutation::new(move |n| {
            let gate = gate_rx.lock().unwrap().take();
            async move {
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                Ok(n * 2)
            }
        });
        assert!(!mutation.is_pending());

        let first = {
            let mutation = mutation.clone();
            tokio::spawn(async move { mutation.call(21).await })
        };
        tokio::task::yield_now().await;
        assert!(mutation.is_pending());

        gate_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), 42);
        assert!(!mutation.is_pending());
    }

    #[tokio::test]
    async fn tracked_mutation_fires_callbacks() {
        let successes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let mutation: TrackedMutation<bool, ()> = {
            let successes = successes.clone();
            let errors = errors.clone();
            TrackedMutation::new(|should_fail: bool| async move {
                if should_fail {
                    Err(SyncError::Store(StoreError::Unknown("no".to_string())))
                } else {
                    Ok(())
                }
            })
            .on_success(move |_| {
                successes.fetch_add(1, Ordering::SeqCst);
            })
            .on_error(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            })
        };

        mutation.call(false).await.unwrap();
        mutation.call(true).await.unwrap_err();
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
