//! Runtime abstraction for async executors.
//!
//! The core schedules its I/O tasks on whatever runtime the caller
//! provides. [`TokioRuntime`] delegates to the ambient Tokio runtime;
//! [`DedicatedIoRuntime`] owns a separate worker pool sized from
//! [`IoConfig`](crate::config::IoConfig) so socket I/O never competes with
//! application tasks.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::config::IoConfig;

/// Abstraction over an async runtime.
pub trait Runtime: Send + Sync + 'static {
    /// Spawns a future as a background task.
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns a future that completes after the given duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// The default [`Runtime`] implementation backed by the ambient Tokio
/// runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRuntime;

impl Runtime for TokioRuntime {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(future);
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// A runtime owning a dedicated multi-threaded worker pool for socket I/O.
///
/// Worker count defaults to the host CPU count. Each connection's tasks are
/// spawned onto this pool and stay there for the connection's lifetime.
#[derive(Debug)]
pub struct DedicatedIoRuntime {
    runtime: tokio::runtime::Runtime,
}

impl DedicatedIoRuntime {
    /// Builds a dedicated I/O runtime from the configuration.
    pub fn new(config: &IoConfig) -> std::io::Result<Self> {
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        builder.enable_all().thread_name("reef-io");
        if let Some(threads) = config.worker_threads() {
            builder.worker_threads(threads);
        }
        Ok(Self {
            runtime: builder.build()?,
        })
    }

    /// Returns a handle onto the dedicated pool.
    pub fn handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }

    /// Shuts the pool down without waiting for running tasks.
    pub fn shutdown(self) {
        self.runtime.shutdown_background();
    }
}

impl Runtime for DedicatedIoRuntime {
    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(future);
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokio_runtime_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TokioRuntime>();
        assert_send_sync::<DedicatedIoRuntime>();
    }

    #[tokio::test]
    async fn test_tokio_runtime_spawn() {
        let rt = TokioRuntime;
        let (tx, rx) = tokio::sync::oneshot::channel();
        rt.spawn(async move {
            let _ = tx.send(7);
        });
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[test]
    fn test_dedicated_runtime_runs_tasks() {
        let rt = DedicatedIoRuntime::new(&IoConfig::default().with_worker_threads(2)).unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        rt.spawn(async move {
            let _ = tx.send(42);
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
        rt.shutdown();
    }
}
