//! Owned handles for background tasks.
//!
//! Every timer in the crate (retry backoff, stream polling, cache sweeping)
//! runs as a spawned tokio task held by a [`TaskGuard`]. Dropping or
//! cancelling the guard aborts the task; doing so twice is a no-op.

use std::future::Future;

use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct TaskGuard {
    handle: Option<JoinHandle<()>>,
}

impl TaskGuard {
    /// Spawn `future` on the current runtime and take ownership of it.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: Some(tokio::spawn(future)),
        }
    }

    /// Abort the task. Safe to call any number of times.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}
