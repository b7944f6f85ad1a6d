//! `HttpInput`: the interceptable, optionally-blocking request body stream.
//!
//! Grounded on hyper's `proto::h1::decode::Decoder` (which content arrives
//! as a sequence of framed chunks) composed with `Buffered<T, B>`'s
//! read-buffering strategy, generalized with the explicit state machine and
//! sentinel end markers the HTTP Input design calls for: unlike hyper's
//! body stream, bytes and the two flavors of stream-end both flow through
//! the same queue, since ordering between "last real content" and
//! "stream ended" matters to synchronous and asynchronous readers alike.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::Error;
use crate::io::interceptor::Chain;

/// The externally-visible state of a request body stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// A blocking reader may call `read` and block until content arrives.
    Stream,
    /// An async reader has registered interest; the next `onContent` or
    /// end marker must invoke its callback instead of merely waking a
    /// blocked thread.
    Async,
    /// The end-of-content marker has been both delivered and consumed.
    Eof,
    /// The end-of-content marker has been delivered but not yet consumed
    /// by a pending async reader.
    Aeof,
    /// The peer closed the connection before the declared content length
    /// was satisfied.
    EarlyEof,
    /// A fault (e.g. a minimum-data-rate violation) poisoned the stream.
    Error,
}

enum Content {
    Bytes(Bytes),
    Eof,
    EarlyEof,
}

/// Registered via [`HttpInput::set_read_listener`] in place of blocking
/// reads (Servlet's `ReadListener`). Every method has a no-op default so an
/// implementor only overrides the events it cares about.
///
/// At most one of `on_all_data_read`/`on_error` is ever invoked over the
/// lifetime of one input stream; `on_data_available` may fire any number of
/// times before whichever of those two ends it.
pub trait ReadListener: Send {
    /// A non-blocking `read()` will now return newly-arrived content.
    fn on_data_available(&self) {}

    /// The stream has reached its end; no further content will arrive.
    fn on_all_data_read(&self) {}

    /// The stream failed; `error` is the same failure a blocking `read()`
    /// would have raised for this fault.
    fn on_error(&self, error: &Error) {
        let _ = error;
    }
}

/// What `run()` found due the next time it's invoked.
enum ReadDue {
    Data,
    AllRead,
    Error,
}

struct Inner {
    queue: VecDeque<Content>,
    state: State,
    arrived: u64,
    consumed: u64,
    error: Option<Error>,
    interceptors: Chain,
    rate_window_start: Instant,
    rate_window_bytes: u64,
    read_listener: Option<Box<dyn ReadListener>>,
}

/// The request-body read side of one HTTP exchange.
pub struct HttpInput {
    inner: Mutex<Inner>,
    ready: Condvar,
    min_request_data_rate: u64,
    blocking_timeout: Duration,
}

impl fmt::Debug for HttpInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("HttpInput")
            .field("state", &inner.state)
            .field("arrived", &inner.arrived)
            .field("consumed", &inner.consumed)
            .finish()
    }
}

/// Configuration `HttpInput` needs from the surrounding `HttpConfig`.
#[derive(Clone, Copy, Debug, Default)]
pub struct InputConfig {
    /// Minimum sustained bytes/sec once reading has started; `0` disables.
    pub min_request_data_rate: u64,
    /// How long a blocking read may wait for more content; `0` disables.
    pub blocking_timeout_ms: u64,
}

impl HttpInput {
    /// A fresh, empty input stream in `STREAM` state.
    pub fn new(config: InputConfig) -> HttpInput {
        HttpInput {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                state: State::Stream,
                arrived: 0,
                consumed: 0,
                error: None,
                interceptors: Chain::new(),
                rate_window_start: Instant::now(),
                rate_window_bytes: 0,
                read_listener: None,
            }),
            ready: Condvar::new(),
            min_request_data_rate: config.min_request_data_rate,
            blocking_timeout: Duration::from_millis(config.blocking_timeout_ms),
        }
    }

    /// Install an interceptor at the end of the read-side chain. Must be
    /// called before any content arrives.
    pub fn add_interceptor(&self, interceptor: Box<dyn crate::io::interceptor::Interceptor>) {
        let mut inner = self.lock();
        inner.interceptors.push(interceptor);
    }

    /// The current externally-visible state.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Total bytes delivered by `onContent` so far.
    pub fn arrived(&self) -> u64 {
        self.lock().arrived
    }

    /// Total bytes handed back to a reader so far.
    pub fn consumed(&self) -> u64 {
        self.lock().consumed
    }

    /// Parser-event surface: a chunk of request body content arrived.
    pub fn on_content(&self, content: Bytes) {
        let mut inner = self.lock();
        if matches!(inner.state, State::Error) {
            return;
        }
        inner.arrived += content.len() as u64;
        inner.rate_window_bytes += content.len() as u64;
        inner.queue.push_back(Content::Bytes(content));
        if inner.state == State::Aeof {
            // unreachable in practice (Aeof implies no more content), kept
            // defensive against a misbehaving parser.
            inner.state = State::Async;
        }
        self.ready.notify_all();
    }

    /// Parser-event surface: the declared content length has been fully
    /// delivered.
    pub fn on_content_complete(&self) {
        let mut inner = self.lock();
        if matches!(inner.state, State::Error) {
            return;
        }
        inner.queue.push_back(Content::Eof);
        if inner.state == State::Async {
            inner.state = State::Aeof;
        }
        self.ready.notify_all();
    }

    /// Parser-event surface: the peer closed the connection before the
    /// declared content length was satisfied.
    pub fn on_early_eof(&self) {
        let mut inner = self.lock();
        inner.queue.push_back(Content::EarlyEof);
        inner.state = State::EarlyEof;
        self.ready.notify_all();
    }

    /// Poison the stream (e.g. a minimum-data-rate violation); subsequent
    /// reads fail with `error`.
    pub fn fail(&self, error: Error) {
        let mut inner = self.lock();
        inner.state = State::Error;
        inner.error = Some(error);
        self.ready.notify_all();
    }

    /// Switch to asynchronous read mode: a `read` call that would
    /// otherwise block instead returns `Ok(None)` immediately, and the
    /// caller is expected to be notified by a registered read-interest
    /// callback once content arrives (wired up by `channel::state`).
    pub fn set_async(&self) {
        let mut inner = self.lock();
        if inner.state == State::Stream {
            inner.state = State::Async;
        } else if inner.state == State::Eof {
            inner.state = State::Aeof;
        }
    }

    /// A blocking read of the next chunk of (post-interceptor) content.
    ///
    /// Returns `Ok(None)` at end of stream, after all real content has
    /// been consumed. In `Async` state, returns immediately with
    /// `Ok(None)` rather than blocking if nothing is queued yet; the
    /// caller must have already registered for a read-ready notification.
    pub fn read(&self) -> Result<Option<Bytes>, Error> {
        let mut inner = self.lock();
        loop {
            if let Some(ref err) = inner.error {
                return Err(clone_error(err));
            }
            if let Some(rate) = self.check_rate(&inner) {
                inner.state = State::Error;
                inner.error = Some(clone_error(&rate));
                return Err(rate);
            }
            match inner.queue.pop_front() {
                Some(Content::Bytes(bytes)) => {
                    let len = bytes.len() as u64;
                    // The request-body queue carries its own Eof/EarlyEof
                    // sentinels ahead of the interceptor chain, so no chunk
                    // reaching it is ever the stream's actual last one.
                    match inner.interceptors.run(bytes, false)? {
                        Some(out) => {
                            inner.consumed += len;
                            return Ok(Some(out));
                        }
                        None => continue, // interceptor swallowed it; try for more
                    }
                }
                Some(Content::Eof) => {
                    inner.state = State::Eof;
                    return Ok(None);
                }
                Some(Content::EarlyEof) => {
                    inner.state = State::EarlyEof;
                    return Err(Error::early_eof());
                }
                None => {
                    if inner.state == State::Eof {
                        return Ok(None);
                    }
                    if inner.state == State::Async || inner.state == State::Aeof {
                        return Ok(None);
                    }
                    if self.blocking_timeout.is_zero() {
                        inner = self.ready.wait(inner).unwrap_or_else(|e| e.into_inner());
                    } else {
                        let (guard, result) = self
                            .ready
                            .wait_timeout(inner, self.blocking_timeout)
                            .unwrap_or_else(|e| e.into_inner());
                        inner = guard;
                        if result.timed_out() && inner.queue.is_empty() {
                            let err = Error::timeout();
                            inner.state = State::Error;
                            inner.error = Some(clone_error(&err));
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Register an asynchronous read listener in place of blocking reads.
    /// Only valid from `STREAM`; atomically transitions to `ASYNC`. If
    /// content, EOF, or an error is already pending, the corresponding
    /// callback runs before this returns (mirroring `run()`'s own
    /// at-most-one-per-call contract) rather than waiting for the next
    /// `READ_CALLBACK` pass through the action loop.
    pub fn set_read_listener(&self, listener: Box<dyn ReadListener>) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            if inner.state != State::Stream {
                return Err(Error::invalid_state());
            }
            inner.state = State::Async;
            inner.read_listener = Some(listener);
        }
        self.run()
    }

    /// The action loop's `READ_CALLBACK` surface: invokes exactly one of
    /// `on_data_available`/`on_all_data_read`/`on_error` on the registered
    /// listener if one of those is currently due, per the queue's arrival
    /// order. A no-op if no listener is registered or nothing is ready yet
    /// (the caller is expected to have already registered read interest via
    /// the owning channel's state so a later arrival re-invokes `run()`).
    pub fn run(&self) -> Result<(), Error> {
        let (due, listener) = {
            let mut inner = self.lock();
            if inner.read_listener.is_none() {
                return Ok(());
            }
            let due = if inner.error.is_some() {
                Some(ReadDue::Error)
            } else {
                inner.queue.iter().find_map(|item| match item {
                    Content::Bytes(_) => Some(ReadDue::Data),
                    Content::Eof => Some(ReadDue::AllRead),
                    Content::EarlyEof => Some(ReadDue::Error),
                })
            };
            match due {
                None => return Ok(()),
                Some(due) => (due, inner.read_listener.take().expect("checked above")),
            }
        };
        match due {
            ReadDue::Data => {
                listener.on_data_available();
                self.lock().read_listener = Some(listener);
                Ok(())
            }
            ReadDue::AllRead => {
                // Terminal: the listener is consumed, not restored, so
                // on_all_data_read/on_error can never both fire.
                listener.on_all_data_read();
                Ok(())
            }
            ReadDue::Error => {
                let err = {
                    let inner = self.lock();
                    inner
                        .error
                        .as_ref()
                        .map(clone_error)
                        .unwrap_or_else(Error::early_eof)
                };
                listener.on_error(&err);
                Err(err)
            }
        }
    }

    /// Reset to a fresh `STREAM` state for reuse on the next exchange.
    pub fn recycle(&self) {
        let mut inner = self.lock();
        inner.queue.clear();
        inner.state = State::Stream;
        inner.arrived = 0;
        inner.consumed = 0;
        inner.error = None;
        inner.interceptors = Chain::new();
        inner.rate_window_start = Instant::now();
        inner.rate_window_bytes = 0;
        inner.read_listener = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_rate(&self, inner: &Inner) -> Option<Error> {
        if self.min_request_data_rate == 0 {
            return None;
        }
        let elapsed = inner.rate_window_start.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let actual = inner.rate_window_bytes as f64 / elapsed.as_secs_f64();
        if actual < self.min_request_data_rate as f64 {
            Some(Error::bad_message(408, "Request Timeout"))
        } else {
            None
        }
    }
}

fn clone_error(e: &Error) -> Error {
    // `Error` intentionally doesn't implement `Clone` (its cause may not
    // be); callers only need the kind/status for a second delivery.
    if e.is_timeout() {
        Error::timeout()
    } else if e.is_early_eof() {
        Error::early_eof()
    } else if e.is_bad_message() {
        Error::bad_message(e.status_code(), "Request Timeout")
    } else {
        Error::internal(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}
