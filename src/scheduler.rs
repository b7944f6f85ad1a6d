//! A single dedicated thread servicing timer fires and the `Date` cache
//! tick, shared across every channel a `Connector` owns.
//!
//! Grounded on hyper's `common::time`/`common::timeout` (a generic
//! `Duration`-based deadline wrapper) generalized from "one timer per
//! future, polled by the reactor" to "one thread, one sorted queue of
//! deadlines, serviced in a loop" — the concurrency design calls for
//! exactly one scheduler thread per connector, not one timer task per
//! connection.

use std::collections::BinaryHeap;
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::date::DateCache;

type Callback = Box<dyn FnOnce() + Send>;

struct Timer {
    deadline: Instant,
    seq: u64,
    callback: Callback,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Timer {}
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline first,
        // so compare in reverse, breaking ties by insertion order.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Shared {
    queue: Mutex<BinaryHeap<Timer>>,
    wake: Condvar,
    next_seq: AtomicU64,
    stopped: Mutex<bool>,
    date: Arc<DateCache>,
}

/// A handle used to arm timer callbacks on the shared scheduler thread.
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("pending", &self.shared.queue.lock().unwrap_or_else(|e| e.into_inner()).len())
            .finish()
    }
}

impl Handle {
    /// Arm `callback` to run on the scheduler thread at `deadline`.
    /// Returns a token that can be used to attempt cancellation; firing is
    /// best-effort-cancellable, matching the channel design's "cancel a
    /// timeout" operation (a callback already being invoked cannot be
    /// un-invoked).
    pub fn arm_at(&self, deadline: Instant, callback: impl FnOnce() + Send + 'static) -> Token {
        let seq = self.shared.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.push(Timer {
            deadline,
            seq,
            callback: Box::new(callback),
        });
        drop(queue);
        self.shared.wake.notify_one();
        Token(seq)
    }

    /// Arm a callback to run after `delay`.
    pub fn arm_after(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> Token {
        self.arm_at(Instant::now() + delay, callback)
    }

    /// The shared `Date` header cache this scheduler keeps ticking.
    pub fn date_cache(&self) -> Arc<DateCache> {
        self.shared.date.clone()
    }
}

/// A token identifying an armed timer. Dropping it has no effect; cancel
/// semantics here are advisory only (see `Handle::arm_at`'s note).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Token(u64);

/// The scheduler's background thread, plus the handle used to arm timers
/// on it.
pub struct Scheduler {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.join.is_some())
            .finish()
    }
}

impl Scheduler {
    /// Spawn the scheduler thread.
    pub fn start() -> Scheduler {
        let shared = Arc::new(Shared {
            queue: Mutex::new(BinaryHeap::new()),
            wake: Condvar::new(),
            next_seq: AtomicU64::new(0),
            stopped: Mutex::new(false),
            date: Arc::new(DateCache::new()),
        });
        let worker_shared = shared.clone();
        let join = thread::Builder::new()
            .name("httpcore-scheduler".into())
            .spawn(move || run(worker_shared))
            .expect("failed to spawn httpcore scheduler thread");
        Scheduler {
            shared,
            join: Some(join),
        }
    }

    /// A cloneable handle for arming timers.
    pub fn handle(&self) -> Handle {
        Handle {
            shared: self.shared.clone(),
        }
    }

    /// Stop the scheduler thread. Queued callbacks that haven't fired yet
    /// are dropped without running.
    pub fn stop(&mut self) {
        *self.shared.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.shared.wake.notify_all();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>) {
    loop {
        if *shared.stopped.lock().unwrap_or_else(|e| e.into_inner()) {
            return;
        }
        shared.date.tick();

        let mut queue = shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let wait_for = match queue.peek() {
            Some(Timer { deadline, .. }) if *deadline <= now => None,
            Some(Timer { deadline, .. }) => Some((*deadline - now).min(Duration::from_secs(1))),
            None => Some(Duration::from_secs(1)),
        };

        match wait_for {
            None => {
                let timer = queue.pop().expect("peeked Some above");
                drop(queue);
                (timer.callback)();
            }
            Some(dur) => {
                let (guard, _) = shared
                    .wake
                    .wait_timeout(queue, dur)
                    .unwrap_or_else(|e| e.into_inner());
                drop(guard);
            }
        }
    }
}
