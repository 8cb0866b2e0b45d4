use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;

use crate::CancellationToken;

type Sink<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;
type Combine<T> = Box<dyn Fn(T, T) -> T + Send + Sync>;

struct PendingTimer {
    id: u64,
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

struct DebounceState<T> {
    batch: Option<T>,
    timer: Option<PendingTimer>,
}

struct DebouncerInner<T> {
    delay: Duration,
    next_id: AtomicU64,
    combine: Combine<T>,
    sink: Sink<T>,
    state: Mutex<DebounceState<T>>,
    /// Held while the sink runs so `flush` observes completed deliveries.
    delivery: tokio::sync::Mutex<()>,
}

/// Coalesces bursts of calls into a single delivery to an async sink.
///
/// Every [`Debouncer::schedule_call`] merges its payload into the pending batch and
/// restarts the timer; the batch is delivered once the timer elapses without new calls.
/// Deliveries never overlap.
pub struct Debouncer<T> {
    inner: Arc<DebouncerInner<T>>,
}

impl<T> Clone for Debouncer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debouncer<T>
where
    T: Send + 'static,
{
    pub fn new<C, S, Fut>(delay: Duration, combine: C, sink: S) -> Self
    where
        C: Fn(T, T) -> T + Send + Sync + 'static,
        S: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            inner: Arc::new(DebouncerInner {
                delay,
                next_id: AtomicU64::new(1),
                combine: Box::new(combine),
                sink: Arc::new(move |batch| sink(batch).boxed()),
                state: Mutex::new(DebounceState {
                    batch: None,
                    timer: None,
                }),
                delivery: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn delay(&self) -> Duration {
        self.inner.delay
    }

    /// Merges `payload` into the pending batch and restarts the timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule_call(&self, payload: T) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();

        let mut state = self.inner.state.lock();
        let batch = match state.batch.take() {
            Some(existing) => (self.inner.combine)(existing, payload),
            None => payload,
        };
        state.batch = Some(batch);

        if let Some(previous) = state.timer.take() {
            previous.token.cancel();
            previous.handle.abort();
        }

        let inner = Arc::clone(&self.inner);
        let token_for_task = token.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token_for_task.cancelled() => {}
                _ = tokio::time::sleep(inner.delay) => inner.deliver_if_current(id).await,
            }
        });

        // The timer task blocks on `state` until this entry is recorded.
        state.timer = Some(PendingTimer { id, token, handle });
    }

    /// Delivers the pending batch immediately (if any) and waits for the sink to finish,
    /// including a delivery that was already in progress.
    pub async fn flush(&self) {
        let _delivery = self.inner.delivery.lock().await;
        let batch = {
            let mut state = self.inner.state.lock();
            if let Some(timer) = state.timer.take() {
                timer.token.cancel();
                timer.handle.abort();
            }
            state.batch.take()
        };
        if let Some(batch) = batch {
            (self.inner.sink)(batch).await;
        }
    }

    /// Whether a batch is waiting for its timer.
    pub fn has_pending(&self) -> bool {
        self.inner.state.lock().batch.is_some()
    }
}

impl<T> DebouncerInner<T> {
    async fn deliver_if_current(&self, id: u64) {
        let _delivery = self.delivery.lock().await;
        let batch = {
            let mut state = self.state.lock();
            match &state.timer {
                Some(timer) if timer.id == id => {
                    state.timer = None;
                    state.batch.take()
                }
                _ => None,
            }
        };
        if let Some(batch) = batch {
            (self.sink)(batch).await;
        }
    }
}
