use std::fmt;

use keel_build_model::protocol::RequestId;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CancelState {
    /// Neither the request id nor a cancellation has been recorded yet.
    Pending,
    /// The request is in flight under this id.
    Registered(RequestId),
    /// Cancellation was requested before the id was known.
    Cancelled,
    /// The cancel message was sent, or the request resolved. Nothing happens anymore.
    Finished,
}

/// Sends a cancel message for an in-flight request at most once.
///
/// Registration of the request id and cancellation can happen in either order; whichever
/// of the two comes second triggers `on_cancel`. Once [`CancelOnce::finish`] has been
/// called (the response arrived), cancelling is a no-op. Dropping a `CancelOnce` counts as
/// cancellation, so a request future that is dropped mid-flight notifies the backend.
pub struct CancelOnce {
    state: Mutex<CancelState>,
    on_cancel: Box<dyn Fn(RequestId) + Send + Sync>,
}

impl fmt::Debug for CancelOnce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelOnce")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl CancelOnce {
    pub fn new(on_cancel: impl Fn(RequestId) + Send + Sync + 'static) -> Self {
        Self {
            state: Mutex::new(CancelState::Pending),
            on_cancel: Box::new(on_cancel),
        }
    }

    pub fn register(&self, id: RequestId) {
        let fire = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, CancelState::Finished) {
                CancelState::Pending => {
                    *state = CancelState::Registered(id);
                    None
                }
                CancelState::Cancelled => Some(id),
                previous @ (CancelState::Registered(_) | CancelState::Finished) => {
                    *state = previous;
                    None
                }
            }
        };
        if let Some(id) = fire {
            (self.on_cancel)(id);
        }
    }

    pub fn cancel(&self) {
        let fire = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, CancelState::Finished) {
                CancelState::Registered(id) => Some(id),
                CancelState::Pending | CancelState::Cancelled => {
                    *state = CancelState::Cancelled;
                    None
                }
                CancelState::Finished => None,
            }
        };
        if let Some(id) = fire {
            (self.on_cancel)(id);
        }
    }

    /// The request resolved; later cancellation must not reach the backend.
    pub fn finish(&self) {
        *self.state.lock() = CancelState::Finished;
    }
}

impl Drop for CancelOnce {
    fn drop(&mut self) {
        self.cancel();
    }
}
