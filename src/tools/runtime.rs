//! Helpers to run the shared tokio runtime from synchronous code.
//!
//! The cache core is thread-based, but everything that touches the network
//! is async. Fetch backends and the blocking client wrappers funnel their
//! futures through the runtime owned here, so the whole process shares one
//! reactor no matter which side of the divide a call originates on.

use std::future::Future;

use once_cell::sync::OnceCell;
use tokio::runtime::{self, Runtime};

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// Get a handle to the shared multi-threaded runtime, creating it on first
/// use.
pub fn get_runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| {
        runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("capfs-runtime")
            .build()
            .expect("failed to spawn tokio runtime")
    })
}

/// Block on a future from synchronous code.
///
/// Callable both from plain threads (the harvester, application threads
/// entering through the blocking API) and from inside a multi-threaded
/// tokio worker, where the slot is handed back to the scheduler first.
pub fn block_on<F: Future>(fut: F) -> F::Output {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => tokio::task::block_in_place(move || handle.block_on(fut)),
        Err(_) => get_runtime().block_on(fut),
    }
}
