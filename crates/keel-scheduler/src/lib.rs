//! Async scheduling primitives for the build-settings manager: a payload-merging
//! [`Debouncer`], an ordered [`AsyncQueue`] whose operations declare their conflicts
//! through a [`DependencyTracker`], and timeout races that never cancel the raced work.

mod debouncer;
mod queue;
mod timeout;

pub use debouncer::Debouncer;
pub use queue::{AsyncQueue, DependencyTracker};
pub use timeout::{race_with_timeout, with_timeout, TimedOut};

pub use tokio_util::sync::CancellationToken;
