//! The Acceptor Pool: dedicated blocking threads that call into an
//! embedder-supplied [`Listener`], and hand each freshly accepted
//! [`Endpoint`](crate::endpoint::Endpoint) off to a callback for protocol
//! dispatch.
//!
//! Grounded on the blocking-thread acceptor model the concurrency design
//! calls for (§4.2/§5): unlike hyper's `server::Server`, which drives
//! admission off a single evented `Accept` stream polled by the reactor,
//! this design reserves `N` dedicated OS threads that each block in
//! `accept()` — matching a platform `accept(2)` loop rather than an async
//! one. The run/pause gate and countdown-latch shutdown below are the
//! `Condvar`/atomic equivalent of the java.util.concurrent primitives the
//! acceptor-pool design names.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::error::Error;

/// How long a failed `accept()` backs off before retrying, to avoid a
/// tight spin when the failure is persistent (e.g. "too many open
/// files").
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// What a [`Connector`](super::connector::Connector) blocks on to admit a
/// new transport connection.
///
/// An external collaborator: the actual listening socket, its address
/// family, and any pre-accept filtering are outside this crate's scope,
/// matching the `Endpoint`/`ConnectionFactory` boundary design.
pub trait Listener: Send + Sync {
    /// Block until a new connection is available (or a failure occurs),
    /// and return the `Endpoint` wrapping it. `acceptor_id` identifies
    /// which acceptor slot is calling, for diagnostics and per-slot
    /// affinity (e.g. `SO_REUSEPORT` sharding).
    fn accept(&self, acceptor_id: usize) -> Result<Box<dyn Endpoint>, Error>;
}

/// One configured acceptor slot: its id and the live thread handle, once
/// started.
pub struct AcceptorTask {
    id: usize,
    join: Option<JoinHandle<()>>,
}

impl fmt::Debug for AcceptorTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptorTask")
            .field("id", &self.id)
            .field("running", &self.join.is_some())
            .finish()
    }
}

struct Gate {
    accepting: Mutex<bool>,
    signal: Condvar,
}

impl Gate {
    fn new() -> Gate {
        Gate {
            accepting: Mutex::new(false),
            signal: Condvar::new(),
        }
    }

    fn set(&self, accepting: bool) {
        *self.accepting.lock().unwrap_or_else(|e| e.into_inner()) = accepting;
        self.signal.notify_all();
    }

    /// Block until the gate is open or `running` has been cleared.
    fn wait_until_open(&self, running: &AtomicBool) {
        let mut guard = self.accepting.lock().unwrap_or_else(|e| e.into_inner());
        while !*guard && running.load(Ordering::SeqCst) {
            guard = self
                .signal
                .wait_timeout(guard, Duration::from_millis(200))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }
}

struct Latch {
    remaining: Mutex<usize>,
    zero: Condvar,
}

impl Latch {
    fn new(count: usize) -> Latch {
        Latch {
            remaining: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    fn count_down(&self) {
        let mut remaining = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
        if *remaining > 0 {
            *remaining -= 1;
        }
        if *remaining == 0 {
            self.zero.notify_all();
        }
    }

    /// Wait up to `timeout` for the latch to reach zero; `true` if it did.
    fn await_zero(&self, timeout: Duration) -> bool {
        let guard = self.remaining.lock().unwrap_or_else(|e| e.into_inner());
        if *guard == 0 {
            return true;
        }
        let (guard, result) = self
            .zero
            .wait_timeout_while(guard, timeout, |remaining| *remaining > 0)
            .unwrap_or_else(|e| e.into_inner());
        !result.timed_out() && *guard == 0
    }
}

/// A fixed-size pool of acceptor threads, started and stopped as a unit by
/// the owning [`Connector`](super::connector::Connector).
pub struct AcceptorPool {
    tasks: Vec<AcceptorTask>,
    gate: Arc<Gate>,
    running: Arc<AtomicBool>,
    latch: Arc<Latch>,
}

impl fmt::Debug for AcceptorPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceptorPool")
            .field("tasks", &self.tasks)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl AcceptorPool {
    /// Launch `count` acceptor threads, each looping on `listener.accept`
    /// and handing the resulting `Endpoint` to `on_accept`. `priority_delta`
    /// is recorded for diagnostics; std::thread has no portable priority
    /// knob, so it is not applied to the OS thread (an embedder wanting
    /// real priority control supplies its own `Executor`/thread spawning
    /// upstream of this pool).
    pub fn start<L, F>(
        count: usize,
        priority_delta: i8,
        listener: Arc<L>,
        on_accept: F,
    ) -> AcceptorPool
    where
        L: Listener + 'static,
        F: Fn(usize, Box<dyn Endpoint>) + Send + Sync + 'static,
    {
        let count = count.max(1);
        let gate = Arc::new(Gate::new());
        let running = Arc::new(AtomicBool::new(true));
        let latch = Arc::new(Latch::new(count));
        let on_accept = Arc::new(on_accept);

        let _ = priority_delta; // recorded by the caller's config; see note above.

        let mut tasks = Vec::with_capacity(count);
        for id in 0..count {
            let listener = listener.clone();
            let on_accept = on_accept.clone();
            let gate = gate.clone();
            let running = running.clone();
            let latch = latch.clone();
            let join = thread::Builder::new()
                .name(format!("httpcore-acceptor-{}", id))
                .spawn(move || run(id, listener, gate, running, on_accept, latch))
                .expect("failed to spawn httpcore acceptor thread");
            tasks.push(AcceptorTask { id, join: Some(join) });
        }

        AcceptorPool {
            tasks,
            gate,
            running,
            latch,
        }
    }

    /// Open the gate so every acceptor thread proceeds into `accept()`.
    pub fn resume(&self) {
        self.gate.set(true);
    }

    /// Close the gate; acceptors already blocked in `accept()` finish that
    /// call, then pause before the next one.
    pub fn pause(&self) {
        self.gate.set(false);
    }

    /// How many acceptor slots this pool was started with.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// `true` if this pool has no acceptor slots (never constructed with
    /// `count = 0`; kept for API symmetry).
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Acceptor slot ids, for diagnostics.
    pub fn ids(&self) -> Vec<usize> {
        self.tasks.iter().map(|t| t.id).collect()
    }

    /// Signal every acceptor to stop, wait up to `stop_timeout` for the
    /// countdown latch, then join every thread.
    pub fn stop(&mut self, stop_timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);
        self.gate.set(true); // wake anything parked on the closed gate
        self.latch.await_zero(stop_timeout);
        for task in &mut self.tasks {
            if let Some(join) = task.join.take() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for AcceptorPool {
    fn drop(&mut self) {
        if self.tasks.iter().any(|t| t.join.is_some()) {
            self.stop(Duration::from_secs(5));
        }
    }
}

fn run<L, F>(
    id: usize,
    listener: Arc<L>,
    gate: Arc<Gate>,
    running: Arc<AtomicBool>,
    on_accept: Arc<F>,
    latch: Arc<Latch>,
) where
    L: Listener + 'static,
    F: Fn(usize, Box<dyn Endpoint>) + Send + Sync + 'static,
{
    while running.load(Ordering::SeqCst) {
        gate.wait_until_open(&running);
        if !running.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept(id) {
            Ok(endpoint) => on_accept(id, endpoint),
            Err(err) => {
                if !running.load(Ordering::SeqCst) {
                    // Expected during shutdown signaling: the listener was
                    // closed out from under a blocked accept().
                    break;
                }
                if err.is_invalid_state() {
                    // The listener itself reports it is closed for good
                    // (the "closed by interrupt" analog) — this acceptor
                    // is done.
                    break;
                }
                tracing::warn!(acceptor = id, error = %err, "acceptor failed to accept a connection");
                thread::sleep(FAILURE_BACKOFF);
            }
        }
    }
    latch.count_down();
}
