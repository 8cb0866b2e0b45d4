use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use keel_build_model::ResponseError;
use parking_lot::Mutex;
use tokio::task::AbortHandle;

/// A cached computation stopped before producing a value (every waiter went away, or the
/// computation panicked).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cached computation was abandoned before it produced a value")]
pub struct ComputeAbandoned;

impl From<ComputeAbandoned> for ResponseError {
    fn from(_: ComputeAbandoned) -> Self {
        ResponseError::cancelled()
    }
}

type SharedResult<V, E> = Shared<BoxFuture<'static, Result<V, E>>>;

struct Computation {
    /// Callers currently awaiting this computation. Only modified under the map lock.
    waiters: usize,
    abort: Option<AbortHandle>,
}

struct Entry<V, E> {
    generation: u64,
    result: SharedResult<V, E>,
    computation: Arc<Mutex<Computation>>,
}

type EntryMap<K, V, E> = Mutex<HashMap<K, Entry<V, E>>>;

/// Memoizes async computations by key.
///
/// Concurrent `get`s for the same key share one computation and its result, including a
/// failure, until the entry is cleared. A computation whose waiters have all gone away
/// before it finished is aborted and its entry dropped, so a later `get` starts over.
pub struct AsyncCache<K, V, E> {
    entries: Arc<EntryMap<K, V, E>>,
    next_generation: AtomicU64,
}

impl<K, V, E> Default for AsyncCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: From<ComputeAbandoned> + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> AsyncCache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: From<ComputeAbandoned> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Returns the cached result for `key`, starting `compute(key)` if there is none.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn get<F, Fut>(&self, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (result, _waiter) = {
            let mut entries = self.entries.lock();
            match self.join_locked(&mut entries, &key) {
                Some(joined) => joined,
                None => {
                    let future = compute(key.clone());
                    self.start_locked(&mut entries, key, future)
                }
            }
        };
        result.await
    }

    /// Like [`AsyncCache::get`], but when `key` has no entry an existing entry whose key
    /// satisfies `can_reuse` is used instead: a new entry for `key` is derived by applying
    /// `transform` to that entry's eventual value.
    ///
    /// Returns `None` if neither `key` nor a reusable key is cached.
    pub async fn get_derived<R, T>(
        &self,
        key: K,
        can_reuse: R,
        transform: T,
    ) -> Option<Result<V, E>>
    where
        R: Fn(&K) -> bool,
        T: FnOnce(V) -> V + Send + 'static,
    {
        let (result, _waiter) = {
            let mut entries = self.entries.lock();
            if let Some(joined) = self.join_locked(&mut entries, &key) {
                joined
            } else {
                let source_key = entries
                    .keys()
                    .find(|existing| can_reuse(existing))
                    .cloned()?;
                let (source, source_waiter) = self.join_locked(&mut entries, &source_key)?;
                let derived = async move {
                    let _source_waiter = source_waiter;
                    source.await.map(transform)
                };
                self.start_locked(&mut entries, key, derived)
            }
        };
        Some(result.await)
    }

    /// Force-overwrites the entry for `key` with a completed value.
    pub fn set(&self, key: K, value: V) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let result = futures::future::ready(Ok(value)).boxed().shared();
        self.entries.lock().insert(
            key,
            Entry {
                generation,
                result,
                computation: Arc::new(Mutex::new(Computation {
                    waiters: 0,
                    abort: None,
                })),
            },
        );
    }

    /// Removes every entry whose key matches `predicate`. Callers already waiting on a
    /// removed entry still receive its result.
    pub fn clear(&self, predicate: impl Fn(&K) -> bool) {
        self.entries.lock().retain(|key, _| !predicate(key));
    }

    pub fn clear_all(&self) {
        self.entries.lock().clear();
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn join_locked(
        &self,
        entries: &mut HashMap<K, Entry<V, E>>,
        key: &K,
    ) -> Option<(SharedResult<V, E>, Waiter<K, V, E>)> {
        let entry = entries.get(key)?;
        entry.computation.lock().waiters += 1;
        Some((
            entry.result.clone(),
            Waiter {
                entries: Arc::clone(&self.entries),
                key: key.clone(),
                generation: entry.generation,
                result: entry.result.clone(),
                computation: Arc::clone(&entry.computation),
            },
        ))
    }

    fn start_locked<Fut>(
        &self,
        entries: &mut HashMap<K, Entry<V, E>>,
        key: K,
        future: Fut,
    ) -> (SharedResult<V, E>, Waiter<K, V, E>)
    where
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(future);
        let computation = Arc::new(Mutex::new(Computation {
            waiters: 1,
            abort: Some(handle.abort_handle()),
        }));
        let result = async move {
            match handle.await {
                Ok(result) => result,
                Err(_) => Err(E::from(ComputeAbandoned)),
            }
        }
        .boxed()
        .shared();

        entries.insert(
            key.clone(),
            Entry {
                generation,
                result: result.clone(),
                computation: Arc::clone(&computation),
            },
        );
        let waiter = Waiter {
            entries: Arc::clone(&self.entries),
            key,
            generation,
            result: result.clone(),
            computation,
        };
        (result, waiter)
    }
}

/// Registration of one caller awaiting a cached computation.
struct Waiter<K, V, E>
where
    K: Eq + Hash,
    V: Clone,
    E: Clone,
{
    entries: Arc<EntryMap<K, V, E>>,
    key: K,
    generation: u64,
    result: SharedResult<V, E>,
    computation: Arc<Mutex<Computation>>,
}

impl<K, V, E> Drop for Waiter<K, V, E>
where
    K: Eq + Hash,
    V: Clone,
    E: Clone,
{
    fn drop(&mut self) {
        let abort = {
            let mut entries = self.entries.lock();
            let mut computation = self.computation.lock();
            computation.waiters = computation.waiters.saturating_sub(1);
            if computation.waiters > 0 || self.result.peek().is_some() {
                return;
            }
            let Some(abort) = computation.abort.take() else {
                return;
            };
            if entries
                .get(&self.key)
                .is_some_and(|entry| entry.generation == self.generation)
            {
                entries.remove(&self.key);
            }
            abort
        };
        abort.abort();
    }
}
