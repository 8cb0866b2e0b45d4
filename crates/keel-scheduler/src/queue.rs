use std::{future::Future, sync::Arc};

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Declares which queued operations an operation has to wait for.
///
/// `self.is_dependency(other)` returns `true` when an operation tagged `self` must not
/// start before an earlier-enqueued operation tagged `other` has finished.
pub trait DependencyTracker: Clone + Send + Sync + 'static {
    fn is_dependency(&self, other: &Self) -> bool;
}

type Completion = Shared<BoxFuture<'static, ()>>;

struct QueuedOperation<M> {
    id: u64,
    metadata: M,
    done: Completion,
}

struct QueueState<M> {
    next_id: u64,
    pending: Vec<QueuedOperation<M>>,
}

/// An ordered task queue.
///
/// Operations start in enqueue order with respect to the operations they depend on and
/// run concurrently with everything else. Finished operations are forgotten, so the queue
/// only tracks work that is still pending or running.
pub struct AsyncQueue<M> {
    state: Arc<Mutex<QueueState<M>>>,
}

impl<M> Clone for AsyncQueue<M> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<M: DependencyTracker> Default for AsyncQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: DependencyTracker> AsyncQueue<M> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                next_id: 0,
                pending: Vec::new(),
            })),
        }
    }

    /// Enqueues `operation`. It starts once every earlier operation it depends on has
    /// completed (or was aborted).
    ///
    /// The dependency snapshot is taken synchronously, so two calls made in order from the
    /// same task are ordered even if the returned handles are never awaited.
    pub fn spawn<F, Fut, T>(&self, metadata: M, operation: F) -> JoinHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done: Completion = async move {
            let _ = done_rx.await;
        }
        .boxed()
        .shared();

        let (id, dependencies) = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let dependencies = state
                .pending
                .iter()
                .filter(|queued| metadata.is_dependency(&queued.metadata))
                .map(|queued| queued.done.clone())
                .collect::<Vec<_>>();
            state.pending.push(QueuedOperation {
                id,
                metadata,
                done,
            });
            (id, dependencies)
        };

        let guard = CompletionGuard {
            id,
            state: Arc::clone(&self.state),
            done: Some(done_tx),
        };

        tokio::spawn(async move {
            let _guard = guard;
            join_all(dependencies).await;
            operation().await
        })
    }

    /// Waits until every currently queued operation that an operation tagged `metadata`
    /// would depend on has finished. Operations enqueued later are not waited for.
    pub async fn wait_for(&self, metadata: &M) {
        let dependencies = {
            let state = self.state.lock();
            state
                .pending
                .iter()
                .filter(|queued| metadata.is_dependency(&queued.metadata))
                .map(|queued| queued.done.clone())
                .collect::<Vec<_>>()
        };
        join_all(dependencies).await;
    }

    /// Number of operations that are queued or running.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Marks an operation finished when its task completes, panics or is aborted.
struct CompletionGuard<M> {
    id: u64,
    state: Arc<Mutex<QueueState<M>>>,
    done: Option<oneshot::Sender<()>>,
}

impl<M> Drop for CompletionGuard<M> {
    fn drop(&mut self) {
        self.state.lock().pending.retain(|queued| queued.id != self.id);
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}
