//! `AsyncContext`: the handle a `Handler` gets back from
//! `Request::start_async`, and the `AsyncListener` callback surface it can
//! register against.
//!
//! Grounded on the Channel State design's async-mode machinery in
//! [`state`](super::state) plus Servlet's `AsyncContext`/`AsyncListener`
//! pair, which this crate's async dispatch model otherwise has no
//! counterpart for in hyper (hyper's `Service::call` has no suspend/resume
//! primitive at all — a service either returns a `Future` or it doesn't).
//! Per Design Note 2, listener callbacks always run with the `ChannelState`
//! lock already released: `fire_timeout`/`fire_error` below take a snapshot
//! of the registered listeners under the listener-list lock, then invoke
//! them after dropping it.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::channel::state::ChannelState;
use crate::error::Error;
use crate::scheduler::{Handle as SchedulerHandle, Token};

/// Callbacks fired against a suspended exchange (Servlet's
/// `AsyncListener`). Every method has a no-op default so an implementor
/// only overrides the events it cares about.
pub trait AsyncListener: Send {
    /// The armed timeout fired and nobody had redispatched or completed
    /// the exchange yet. A listener may call `ctx.dispatch()` or
    /// `ctx.complete()` from within this callback to supersede the default
    /// error dispatch that otherwise follows.
    fn on_timeout(&self, ctx: &AsyncContext) {
        let _ = ctx;
    }

    /// A fault occurred while the exchange was suspended. As with
    /// `on_timeout`, a listener may redispatch or complete here instead of
    /// letting the default error dispatch run.
    fn on_error(&self, ctx: &AsyncContext, error: &Error) {
        let _ = (ctx, error);
    }

    /// The exchange is about to complete; purely informational, the
    /// response has already been finalized.
    fn on_complete(&self) {}
}

struct Shared {
    state: Arc<ChannelState>,
    scheduler: SchedulerHandle,
    listeners: Mutex<Vec<Box<dyn AsyncListener>>>,
    timeout: Mutex<Duration>,
    timer: Mutex<Option<Token>>,
}

/// A handle to one suspended exchange: register listeners, adjust the
/// timeout, or explicitly redispatch/complete. Cloning shares the same
/// underlying exchange — a listener registered through one clone is visible
/// to all of them.
#[derive(Clone)]
pub struct AsyncContext {
    shared: Arc<Shared>,
}

impl fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncContext")
            .field("listeners", &self.lock_listeners().len())
            .field("timeout", &*self.lock_timeout())
            .finish()
    }
}

impl AsyncContext {
    pub(crate) fn new(state: Arc<ChannelState>, scheduler: SchedulerHandle) -> AsyncContext {
        AsyncContext {
            shared: Arc::new(Shared {
                state,
                scheduler,
                listeners: Mutex::new(Vec::new()),
                timeout: Mutex::new(Duration::from_secs(0)),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Register a listener. Listeners fire in registration order.
    pub fn add_listener(&self, listener: Box<dyn AsyncListener>) {
        self.lock_listeners().push(listener);
    }

    /// Arm (or re-arm) how long this suspended exchange waits before its
    /// timeout fires. A zero duration (the default) disables the timeout
    /// entirely — the exchange then waits until something else
    /// (`dispatch`, `complete`, a read/write-ready notification, or an
    /// error) wakes it.
    pub fn set_timeout(&self, timeout: Duration) {
        *self.lock_timeout() = timeout;
        self.arm();
    }

    /// Explicitly redispatch the suspended exchange back into the handler
    /// chain, cancelling the pending timeout.
    pub fn dispatch(&self) -> Result<(), Error> {
        self.shared.state.async_dispatch()
    }

    /// Explicitly complete the suspended exchange without a redispatch,
    /// cancelling the pending timeout.
    pub fn complete(&self) -> Result<(), Error> {
        self.shared.state.async_complete()
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<Box<dyn AsyncListener>>> {
        self.shared.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_timeout(&self) -> std::sync::MutexGuard<'_, Duration> {
        self.shared.timeout.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn arm(&self) {
        let timeout = *self.lock_timeout();
        if timeout.is_zero() {
            return;
        }
        let shared = self.shared.clone();
        let token = self.shared.scheduler.arm_after(timeout, move || fire_timeout(&shared));
        *self.shared.timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);
    }

    /// Snapshot and run every registered `on_complete` listener. Called by
    /// the action loop once the response has been finalized for an
    /// exchange that went async at some point.
    pub(crate) fn fire_complete(&self) {
        let snapshot: Vec<_> = std::mem::take(&mut *self.lock_listeners());
        for listener in &snapshot {
            listener.on_complete();
        }
    }

    /// The action loop's surface for a fault raised while this exchange was
    /// suspended: runs every registered `on_error` listener and then, if
    /// none of them redispatched or completed, finalizes the exchange for a
    /// default error dispatch.
    pub(crate) fn fire_error(&self, error: &Error) {
        let snapshot: Vec<_> = std::mem::take(&mut *self.lock_listeners());
        let ctx = self.clone();
        for listener in &snapshot {
            listener.on_error(&ctx, error);
        }
        *self.lock_listeners() = snapshot;
        self.shared.state.finish_async_error();
    }
}

/// Runs on the scheduler thread when an armed timeout fires. A no-op if
/// the exchange was already redispatched, completed, or errored first.
fn fire_timeout(shared: &Arc<Shared>) {
    if !shared.state.begin_timeout() {
        return;
    }
    let ctx = AsyncContext { shared: shared.clone() };
    let snapshot: Vec<_> = std::mem::take(&mut *ctx.lock_listeners());
    for listener in &snapshot {
        listener.on_timeout(&ctx);
    }
    *ctx.lock_listeners() = snapshot;
    shared.state.finish_timeout();
}
