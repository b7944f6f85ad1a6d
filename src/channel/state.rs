//! `ChannelState`: the dispatch-state / async-mode pair that decides what
//! the action loop does next.
//!
//! Grounded on hyper's `proto::h1::conn::State` (the `Reading`/`Writing`/
//! `KA` triple deciding what `Conn` does on its next poll), generalized
//! from "what does the read/write half do next" to "what does the whole
//! exchange do next," since this design layers synchronous dispatch, Servlet-
//! style async dispatch, and error dispatch on top of the same loop. Per
//! Design Note 2, every public method here takes the lock only long enough
//! to compute the next `Action`; the action loop (`channel::channel`)
//! always drops the guard before invoking a listener callback.

use std::fmt;
use std::sync::Mutex;

use crate::error::Error;

/// Where a channel's exchange currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchState {
    /// No exchange in progress; ready to receive the next request.
    Idle,
    /// A handler dispatch is running (or about to run) on some thread.
    Dispatched,
    /// A handler threw while `Dispatched`; the next `unhandle()` resolves
    /// this into `ERROR_DISPATCH` rather than completing the exchange.
    Thrown,
    /// `startAsync` was called; the action loop has returned `WAIT` and no
    /// thread is currently running this exchange.
    AsyncWait,
    /// An async-wait exchange has been woken (by `dispatch()`, a read/
    /// write callback, a timeout, or an error) and is ready for the action
    /// loop to resume it.
    AsyncWoken,
    /// A blocking read or write callback is running.
    AsyncIo,
    /// An error occurred while idle or dispatched; error dispatch is
    /// pending.
    AsyncError,
    /// The handler chain has returned and the response is being finalized.
    Completing,
    /// The exchange is fully finished; the channel is eligible for
    /// `recycle()`.
    Completed,
    /// The connection has been handed off to a protocol upgrade and the
    /// channel no longer participates in HTTP framing.
    Upgraded,
    /// The channel (and its connection) are being torn down.
    Terminated,
}

/// Whether, and how, the current exchange is running asynchronously.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncMode {
    /// Synchronous dispatch; no async context has been started.
    NotAsync,
    /// `startAsync` was just called; not yet woken by anything.
    Started,
    /// Woken by an explicit `dispatch()` call.
    Dispatch,
    /// Woken by `complete()`.
    Complete,
    /// Woken by the async timeout firing with no listener re-dispatch.
    Expired,
    /// Woken by an error.
    Errored,
    /// Woken by a registered read-interest notification.
    ReadIo,
    /// Woken by a registered write-interest notification.
    WriteIo,
    /// Woken, but the listener chain itself is what's running (used while
    /// an `onTimeout`/`onError` callback is in flight, to prevent a second
    /// wake from re-entering the loop concurrently).
    Stateless,
}

/// The result of a state transition: what the action loop should do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Run the handler chain for the initial request.
    Dispatch,
    /// Run the handler chain again after an async dispatch.
    AsyncDispatch,
    /// Run the error-handling path.
    ErrorDispatch,
    /// Invoke a registered async read-ready listener.
    ReadCallback,
    /// Invoke a registered async write-ready listener.
    WriteCallback,
    /// Invoke a registered async error listener.
    AsyncError,
    /// Finalize the response and, if keep-alive, recycle for reuse.
    Complete,
    /// Nothing to do right now; the loop should return control to the
    /// caller (typically: the worker thread goes back to its pool).
    Wait,
    /// The channel is done for good; the connection should close.
    Terminated,
}

struct Inner {
    dispatch: DispatchState,
    async_mode: AsyncMode,
    error: Option<ErrorSlot>,
    read_interested: bool,
    write_interested: bool,
}

/// `Error` isn't `Clone`; stash just enough to reconstruct an equivalent
/// one for a deferred error-dispatch action.
struct ErrorSlot {
    status: u16,
}

/// The state machine a `Channel` consults before and after every pass
/// through the action loop.
pub struct ChannelState {
    inner: Mutex<Inner>,
}

impl fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ChannelState")
            .field("dispatch", &inner.dispatch)
            .field("async_mode", &inner.async_mode)
            .finish()
    }
}

impl ChannelState {
    /// A fresh channel state, `IDLE`/`NotAsync`.
    pub fn new() -> ChannelState {
        ChannelState {
            inner: Mutex::new(Inner {
                dispatch: DispatchState::Idle,
                async_mode: AsyncMode::NotAsync,
                error: None,
                read_interested: false,
                write_interested: false,
            }),
        }
    }

    /// Current dispatch state, for diagnostics/tests.
    pub fn dispatch_state(&self) -> DispatchState {
        self.lock().dispatch
    }

    /// Current async mode, for diagnostics/tests.
    pub fn async_mode(&self) -> AsyncMode {
        self.lock().async_mode
    }

    /// Parser-event surface: a complete request has arrived. Only valid
    /// from `IDLE`.
    pub fn on_request(&self) -> Result<Action, Error> {
        let mut inner = self.lock();
        match inner.dispatch {
            DispatchState::Idle => {
                inner.dispatch = DispatchState::Dispatched;
                inner.async_mode = AsyncMode::NotAsync;
                Ok(Action::Dispatch)
            }
            _ => Err(Error::invalid_state()),
        }
    }

    /// Parser-event surface: the request was malformed. Valid any time
    /// before completion; takes priority over whatever dispatch was
    /// already in flight.
    pub fn on_bad_message(&self, status: u16) -> Action {
        let mut inner = self.lock();
        inner.dispatch = DispatchState::AsyncError;
        inner.error = Some(ErrorSlot { status });
        Action::ErrorDispatch
    }

    /// Handler-chain surface: `startAsync` was called while a dispatch is
    /// running. Returns `WAIT`: the action loop hands control back without
    /// completing the response.
    pub fn start_async(&self) -> Result<Action, Error> {
        let mut inner = self.lock();
        match inner.dispatch {
            DispatchState::Dispatched => {
                inner.dispatch = DispatchState::AsyncWait;
                inner.async_mode = AsyncMode::Started;
                Ok(Action::Wait)
            }
            _ => Err(Error::invalid_state()),
        }
    }

    /// Handler-chain surface (or an external caller holding the async
    /// context): explicitly redispatch a waiting exchange.
    pub fn async_dispatch(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        match inner.dispatch {
            DispatchState::AsyncWait => {
                inner.dispatch = DispatchState::AsyncWoken;
                inner.async_mode = AsyncMode::Dispatch;
                Ok(())
            }
            _ => Err(Error::invalid_state()),
        }
    }

    /// Handler-chain surface: the async context was completed directly
    /// (no redispatch).
    pub fn async_complete(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        match inner.dispatch {
            DispatchState::AsyncWait => {
                inner.dispatch = DispatchState::AsyncWoken;
                inner.async_mode = AsyncMode::Complete;
                Ok(())
            }
            _ => Err(Error::invalid_state()),
        }
    }

    /// Scheduler surface: the armed async timeout fired. Returns `true` if
    /// the exchange is still `AsyncWait` and its `onTimeout` listeners
    /// should run; the caller (`AsyncContext::fire_timeout`) runs them
    /// outside this lock, per Design Note 2, then calls `finish_timeout`.
    pub fn begin_timeout(&self) -> bool {
        self.lock().dispatch == DispatchState::AsyncWait
    }

    /// Called once registered `onTimeout` listeners have returned. If
    /// nothing redispatched or completed the exchange in the meantime,
    /// finalizes it to `AsyncWoken`/`Expired` with a pending 500 status, so
    /// the next `unhandle()` runs `ERROR_DISPATCH`.
    pub fn finish_timeout(&self) {
        let mut inner = self.lock();
        if inner.dispatch == DispatchState::AsyncWait {
            inner.dispatch = DispatchState::AsyncWoken;
            inner.async_mode = AsyncMode::Expired;
            inner.error = Some(ErrorSlot { status: 500 });
        }
    }

    /// Scheduler/endpoint surface: the connection's idle timeout fired.
    /// Only takes effect while the channel is genuinely `IDLE` (no exchange
    /// in flight); returns `true` if it terminated the channel, in which
    /// case the connection driver should close the endpoint.
    pub fn idle_timeout_expired(&self) -> bool {
        let mut inner = self.lock();
        if inner.dispatch == DispatchState::Idle {
            inner.dispatch = DispatchState::Terminated;
            true
        } else {
            false
        }
    }

    /// Endpoint surface: a registered read-interest callback's data is
    /// ready.
    pub fn read_ready(&self) -> bool {
        let mut inner = self.lock();
        if !inner.read_interested {
            return false;
        }
        inner.read_interested = false;
        if inner.dispatch == DispatchState::AsyncWait {
            inner.dispatch = DispatchState::AsyncWoken;
            inner.async_mode = AsyncMode::ReadIo;
        }
        true
    }

    /// Endpoint surface: a registered write-interest callback may proceed.
    pub fn write_ready(&self) -> bool {
        let mut inner = self.lock();
        if !inner.write_interested {
            return false;
        }
        inner.write_interested = false;
        if inner.dispatch == DispatchState::AsyncWait {
            inner.dispatch = DispatchState::AsyncWoken;
            inner.async_mode = AsyncMode::WriteIo;
        }
        true
    }

    /// Register read interest so a later `read_ready()` call produces a
    /// wake.
    pub fn want_read(&self) {
        self.lock().read_interested = true;
    }

    /// Register write interest so a later `write_ready()` call produces a
    /// wake.
    pub fn want_write(&self) {
        self.lock().write_interested = true;
    }

    /// Any-state surface: a fault occurred. A handler throwing while
    /// `Dispatched` transitions to `THROWN`, deferring `ERROR_DISPATCH` to
    /// the caller's next `unhandle()` rather than handing it back directly,
    /// per the THROWN -> DISPATCHED, action=ERROR_DISPATCH transition.
    /// While async-waiting, wakes the exchange so its `onError` listener
    /// (and then, if nobody redispatches, error dispatch) can run. Any
    /// other state (a read/write-callback fault, a bad-message-adjacent
    /// state, etc.) goes straight to error dispatch, since there is no
    /// handler-chain frame on the stack above it to unwind through first.
    pub fn on_error(&self, status: u16) -> Action {
        let mut inner = self.lock();
        match inner.dispatch {
            DispatchState::AsyncWait => {
                // Stays AsyncWait: the caller runs onError listeners
                // outside this lock, then calls finish_async_error to
                // finalize if nobody redispatched/completed in the
                // meantime.
                inner.error = Some(ErrorSlot { status });
                Action::AsyncError
            }
            DispatchState::Terminated | DispatchState::Upgraded => Action::Wait,
            DispatchState::Dispatched => {
                inner.dispatch = DispatchState::Thrown;
                inner.error = Some(ErrorSlot { status });
                Action::Wait
            }
            _ => {
                inner.dispatch = DispatchState::AsyncError;
                inner.error = Some(ErrorSlot { status });
                Action::ErrorDispatch
            }
        }
    }

    /// Called once registered `onError` listeners have returned from an
    /// error raised during `AsyncWait`. If nothing redispatched or
    /// completed the exchange in the meantime, finalizes it to
    /// `AsyncWoken`/`Errored`.
    pub fn finish_async_error(&self) {
        let mut inner = self.lock();
        if inner.dispatch == DispatchState::AsyncWait {
            inner.dispatch = DispatchState::AsyncWoken;
            inner.async_mode = AsyncMode::Errored;
        }
    }

    /// The pending error status, if any (consumed by the action loop when
    /// running `ErrorDispatch`).
    pub fn take_error_status(&self) -> Option<u16> {
        self.lock().error.take().map(|e| e.status)
    }

    /// The pending error status without consuming it, for the action loop
    /// to build an `Error` to hand to `AsyncContext::fire_error` while the
    /// slot still needs to survive into a possible later `ErrorDispatch`.
    pub fn peek_error_status(&self) -> Option<u16> {
        self.lock().error.as_ref().map(|e| e.status)
    }

    /// What the action loop should run on its very first pass, reflecting
    /// whatever `on_request`/`on_bad_message` already transitioned the
    /// state to, or — when the connection driver is re-entering `run()` to
    /// resume a previously `WAIT`-ed exchange — whatever woke it since.
    /// Every subsequent pass within the same `run()` call uses `unhandle()`
    /// instead.
    pub fn initial_action(&self) -> Action {
        let mut inner = self.lock();
        match inner.dispatch {
            DispatchState::Dispatched => Action::Dispatch,
            DispatchState::AsyncError => Action::ErrorDispatch,
            DispatchState::AsyncWoken => resolve_async_woken(&mut inner),
            DispatchState::Thrown => {
                inner.dispatch = DispatchState::Dispatched;
                Action::ErrorDispatch
            }
            _ => Action::Wait,
        }
    }

    /// Called once the handler chain (or error handler) returns control.
    /// Decides what the loop should do next: resume an async-woken
    /// exchange, run a registered callback, finish up, or idle.
    pub fn unhandle(&self) -> Action {
        let mut inner = self.lock();
        match inner.dispatch {
            DispatchState::Dispatched | DispatchState::AsyncError => {
                inner.dispatch = DispatchState::Completing;
                Action::Complete
            }
            DispatchState::Thrown => {
                inner.dispatch = DispatchState::Dispatched;
                Action::ErrorDispatch
            }
            DispatchState::AsyncWait => Action::Wait,
            DispatchState::AsyncWoken => resolve_async_woken(&mut inner),
            DispatchState::AsyncIo => {
                inner.dispatch = DispatchState::AsyncWait;
                Action::Wait
            }
            DispatchState::Completing => {
                inner.dispatch = DispatchState::Completed;
                Action::Terminated
            }
            DispatchState::Completed
            | DispatchState::Idle
            | DispatchState::Upgraded
            | DispatchState::Terminated => Action::Wait,
        }
    }

    /// Reset to `IDLE`/`NotAsync` once a keep-alive exchange has fully
    /// completed. Only valid from `COMPLETED`.
    pub fn recycle(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        match inner.dispatch {
            DispatchState::Completed => {
                inner.dispatch = DispatchState::Idle;
                inner.async_mode = AsyncMode::NotAsync;
                inner.error = None;
                inner.read_interested = false;
                inner.write_interested = false;
                Ok(())
            }
            _ => Err(Error::invalid_state()),
        }
    }

    /// Hand the connection off to a protocol upgrade. Only valid from
    /// `COMPLETED` (the HTTP exchange that negotiated the upgrade must
    /// have finished first) or `IDLE` (a pre-negotiated upgrade with no
    /// exchange of its own).
    pub fn upgrade(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        match inner.dispatch {
            DispatchState::Completed | DispatchState::Idle => {
                inner.dispatch = DispatchState::Upgraded;
                Ok(())
            }
            _ => Err(Error::invalid_state()),
        }
    }

    /// Force the channel into its terminal state from any state.
    pub fn terminate(&self) {
        self.lock().dispatch = DispatchState::Terminated;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ChannelState {
    fn default() -> ChannelState {
        ChannelState::new()
    }
}

/// Shared by `initial_action` and `unhandle`: what to do with an
/// `AsyncWoken` exchange, keyed off what woke it. `Expired`/`Errored` run
/// `ERROR_DISPATCH` rather than completing straight away — by the time
/// either is reached, `AsyncContext::fire_timeout`/`fire_error` has already
/// run the listener chain and found nobody redispatched or completed. Per
/// §4.4, a read-ready wake takes `READ_CALLBACK` and a write-ready wake
/// takes `WRITE_CALLBACK`; `read_ready`/`write_ready` record which one woke
/// the exchange via `async_mode` before this runs.
fn resolve_async_woken(inner: &mut Inner) -> Action {
    match inner.async_mode {
        AsyncMode::Dispatch => {
            inner.dispatch = DispatchState::Dispatched;
            Action::AsyncDispatch
        }
        AsyncMode::ReadIo => {
            inner.dispatch = DispatchState::AsyncIo;
            Action::ReadCallback
        }
        AsyncMode::WriteIo => {
            inner.dispatch = DispatchState::AsyncIo;
            Action::WriteCallback
        }
        AsyncMode::Expired | AsyncMode::Errored => {
            inner.dispatch = DispatchState::Dispatched;
            Action::ErrorDispatch
        }
        AsyncMode::Complete
        | AsyncMode::Started
        | AsyncMode::NotAsync
        | AsyncMode::Stateless => {
            inner.dispatch = DispatchState::Completing;
            Action::Complete
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_request_from_idle_dispatches() {
        let state = ChannelState::new();
        assert_eq!(state.on_request().unwrap(), Action::Dispatch);
        assert_eq!(state.dispatch_state(), DispatchState::Dispatched);
    }

    #[test]
    fn on_request_while_dispatched_is_invalid() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        assert!(state.on_request().is_err());
    }

    #[test]
    fn unhandle_after_plain_dispatch_completes() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        assert_eq!(state.unhandle(), Action::Complete);
        assert_eq!(state.unhandle(), Action::Terminated);
        assert_eq!(state.dispatch_state(), DispatchState::Completed);
    }

    #[test]
    fn start_async_waits_then_dispatch_resumes_it() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        assert_eq!(state.start_async().unwrap(), Action::Wait);
        assert_eq!(state.dispatch_state(), DispatchState::AsyncWait);
        state.async_dispatch().unwrap();
        assert_eq!(state.unhandle(), Action::AsyncDispatch);
        assert_eq!(state.dispatch_state(), DispatchState::Dispatched);
        assert_eq!(state.unhandle(), Action::Complete);
    }

    #[test]
    fn async_complete_finishes_without_a_redispatch() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        state.start_async().unwrap();
        state.async_complete().unwrap();
        assert_eq!(state.unhandle(), Action::Complete);
    }

    #[test]
    fn timeout_with_no_listener_dispatch_leads_to_error_dispatch() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        state.start_async().unwrap();
        assert!(state.begin_timeout());
        // no listener redispatches in between
        state.finish_timeout();
        assert_eq!(state.unhandle(), Action::ErrorDispatch);
        assert_eq!(state.take_error_status(), Some(500));
        assert_eq!(state.unhandle(), Action::Complete);
    }

    #[test]
    fn timeout_is_a_no_op_once_something_else_already_woke_the_exchange() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        state.start_async().unwrap();
        state.async_complete().unwrap();
        assert!(!state.begin_timeout()); // already AsyncWoken, not AsyncWait
        state.finish_timeout(); // no-op: dispatch isn't AsyncWait
        assert_eq!(state.unhandle(), Action::Complete);
    }

    #[test]
    fn error_while_dispatched_transitions_through_thrown_to_error_dispatch() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        assert_eq!(state.on_error(500), Action::Wait);
        assert_eq!(state.dispatch_state(), DispatchState::Thrown);
        assert_eq!(state.unhandle(), Action::ErrorDispatch);
        assert_eq!(state.dispatch_state(), DispatchState::Dispatched);
        assert_eq!(state.take_error_status(), Some(500));
        assert_eq!(state.unhandle(), Action::Complete);
    }

    #[test]
    fn initial_action_resolves_a_thrown_exchange_to_error_dispatch() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        state.on_error(500);
        assert_eq!(state.initial_action(), Action::ErrorDispatch);
        assert_eq!(state.dispatch_state(), DispatchState::Dispatched);
    }

    #[test]
    fn error_during_async_wait_wakes_the_error_listener_first() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        state.start_async().unwrap();
        assert_eq!(state.on_error(500), Action::AsyncError);
        // Still AsyncWait here: listeners run outside the lock with a
        // chance to redispatch/complete before this finalizes.
        assert_eq!(state.dispatch_state(), DispatchState::AsyncWait);
        state.finish_async_error();
        assert_eq!(state.unhandle(), Action::ErrorDispatch);
        assert_eq!(state.take_error_status(), Some(500));
        assert_eq!(state.unhandle(), Action::Complete);
    }

    #[test]
    fn async_error_is_superseded_by_a_listener_that_redispatches() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        state.start_async().unwrap();
        assert_eq!(state.on_error(500), Action::AsyncError);
        // The onError listener itself redispatches instead of letting the
        // exchange fall through to a default error dispatch.
        state.async_dispatch().unwrap();
        state.finish_async_error(); // no-op: no longer AsyncWait
        assert_eq!(state.unhandle(), Action::AsyncDispatch);
    }

    #[test]
    fn recycle_only_valid_from_completed() {
        let state = ChannelState::new();
        assert!(state.recycle().is_err());
        state.on_request().unwrap();
        state.unhandle();
        state.unhandle();
        assert_eq!(state.dispatch_state(), DispatchState::Completed);
        state.recycle().unwrap();
        assert_eq!(state.dispatch_state(), DispatchState::Idle);
    }

    #[test]
    fn read_ready_only_wakes_when_interest_was_registered() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        state.start_async().unwrap();
        assert!(!state.read_ready()); // no interest registered yet
        state.want_read();
        assert!(state.read_ready());
        assert_eq!(state.dispatch_state(), DispatchState::AsyncWoken);
    }

    #[test]
    fn read_ready_wake_resolves_to_read_callback() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        state.start_async().unwrap();
        state.want_read();
        assert!(state.read_ready());
        assert_eq!(state.unhandle(), Action::ReadCallback);
        assert_eq!(state.dispatch_state(), DispatchState::AsyncIo);
    }

    #[test]
    fn write_ready_wake_resolves_to_write_callback() {
        let state = ChannelState::new();
        state.on_request().unwrap();
        state.start_async().unwrap();
        assert!(!state.write_ready()); // no interest registered yet
        state.want_write();
        assert!(state.write_ready());
        assert_eq!(state.dispatch_state(), DispatchState::AsyncWoken);
        assert_eq!(state.unhandle(), Action::WriteCallback);
        assert_eq!(state.dispatch_state(), DispatchState::AsyncIo);
    }
}
