//! Abstraction for "run this action-loop continuation somewhere else."
//!
//! Mirrors the shape of hyper's `rt::Executor`/`common::exec::Exec`, but the
//! unit of work here is a boxed closure rather than a `Future`: the channel
//! action loop (`channel::channel`) is driven by blocking calls into the
//! `Parser`/`Handler`/`Endpoint` collaborators, not polled.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// A unit of work handed to an [`Executor`]: one pass of a channel's action
/// loop, or an acceptor's accept-and-dispatch step.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks handed to it by the connector, typically on a shared worker
/// thread pool.
///
/// Implementations must not block the calling thread waiting for the task
/// to finish; `execute` only *submits* work.
pub trait Executor {
    /// Submit `task` to run, now or soon, on some other thread.
    fn execute(&self, task: Task);
}

impl fmt::Debug for dyn Executor + Send + Sync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor").finish()
    }
}

/// A handle an embedder plugs into a [`Connector`](crate::connector::Connector).
///
/// Cloning an `Exec` is cheap; it's a reference-counted handle to the
/// underlying [`Executor`].
#[derive(Clone)]
pub struct Exec {
    inner: Arc<dyn Executor + Send + Sync>,
}

impl Exec {
    /// Wrap an [`Executor`] implementation for use by a connector.
    pub fn new<E: Executor + Send + Sync + 'static>(executor: E) -> Exec {
        Exec {
            inner: Arc::new(executor),
        }
    }

    pub(crate) fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.execute(Box::new(task));
    }
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exec").finish()
    }
}

#[cfg(feature = "runtime")]
mod pool {
    use super::{Executor, Task};
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};
    use std::thread;

    /// A fixed-size pool of worker threads implementing [`Executor`].
    ///
    /// Used when an embedder doesn't want to wire up their own async runtime
    /// or thread pool; built behind the `runtime` feature so it stays
    /// optional, the way hyper's own `runtime` feature gates its Tokio glue.
    pub struct ThreadPool {
        tx: mpsc::Sender<Task>,
        _workers: Vec<thread::JoinHandle<()>>,
    }

    impl std::fmt::Debug for ThreadPool {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ThreadPool")
                .field("workers", &self._workers.len())
                .finish()
        }
    }

    impl ThreadPool {
        /// Spawn `size` worker threads, each pulling tasks off a shared
        /// channel.
        pub fn new(size: usize) -> ThreadPool {
            let size = size.max(1);
            let (tx, rx) = mpsc::channel::<Task>();
            let rx = Arc::new(Mutex::new(rx));
            let mut workers = Vec::with_capacity(size);
            for idx in 0..size {
                let rx = rx.clone();
                workers.push(
                    thread::Builder::new()
                        .name(format!("httpcore-worker-{}", idx))
                        .spawn(move || loop {
                            let task = {
                                let guard = rx.lock().unwrap_or_else(|e| e.into_inner());
                                guard.recv()
                            };
                            match task {
                                Ok(task) => {
                                    let res = super::panic::catch_unwind(super::AssertUnwindSafe(task));
                                    if let Err(cause) = res {
                                        tracing::warn!(panic = ?cause, "worker task panicked");
                                    }
                                }
                                Err(_) => break,
                            }
                        })
                        .expect("failed to spawn httpcore worker thread"),
                );
            }
            ThreadPool {
                tx,
                _workers: workers,
            }
        }
    }

    impl Executor for ThreadPool {
        fn execute(&self, task: Task) {
            // If every worker has exited (e.g. during shutdown), drop the
            // task rather than panicking the submitting thread.
            let _ = self.tx.send(task);
        }
    }
}

#[cfg(feature = "runtime")]
pub use pool::ThreadPool;
