//! `HttpOutput`: the aggregating, interceptable response body stream.
//!
//! Grounded on hyper's `proto::h1::io::WriteBuf`/`Buffered::write_head`:
//! small writes are aggregated into one buffer and flushed together, large
//! writes are sliced and sent directly, and a response's status-line/header
//! block always goes out ahead of any body bytes. The explicit seven-state
//! machine below (`OPEN`/`ASYNC`/`READY`/`PENDING`/`UNREADY`/`ERROR`/
//! `CLOSED`) has no equivalent in hyper — hyper only ever drives one write
//! path through `Buffered` — but is required so a caller can interleave
//! blocking and asynchronous writes on the same response the way the HTTP
//! Output design specifies.

use std::fmt;
use std::sync::{Condvar, Mutex};

use bytes::{Bytes, BytesMut};

use crate::error::Error;
use crate::io::interceptor::Chain;
use crate::transport::Transport;

/// The externally-visible state of a response body stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Nothing written yet, or between blocking writes; more writes are
    /// accepted immediately.
    Open,
    /// An async write-ready callback is registered; the next blocking
    /// write would have to wait for it.
    Async,
    /// The registered callback has fired: an async write may proceed
    /// without blocking.
    Ready,
    /// An async write has been issued and is in flight at the transport.
    Pending,
    /// A write was attempted while a previous async write was still
    /// `Pending`; the caller must wait for readiness.
    Unready,
    /// A fault aborted the stream; further writes fail.
    Error,
    /// `close()` has run; no further writes are accepted.
    Closed,
}

/// Registered via [`HttpOutput::set_write_listener`] in place of blocking
/// writes (Servlet's `WriteListener`). Every method has a no-op default so
/// an implementor only overrides the events it cares about.
pub trait WriteListener: Send {
    /// An async write may now proceed without blocking.
    fn on_writable(&self) {}

    /// The stream failed while a write was in flight.
    fn on_error(&self, error: &Error) {
        let _ = error;
    }
}

struct Inner {
    state: State,
    buffer: BytesMut,
    committed: bool,
    aggregation_size: usize,
    buffer_size: usize,
    interceptors: Chain,
    written: u64,
    write_listener: Option<Box<dyn WriteListener>>,
}

/// Configuration `HttpOutput` needs from the surrounding `HttpConfig`.
#[derive(Clone, Copy, Debug)]
pub struct OutputConfig {
    /// Writes smaller than this are aggregated before flushing.
    pub aggregation_size: usize,
    /// Ceiling on the aggregation buffer and the slice size used for
    /// large writes.
    pub buffer_size: usize,
}

impl Default for OutputConfig {
    fn default() -> OutputConfig {
        OutputConfig {
            aggregation_size: 8 * 1024,
            buffer_size: 32 * 1024,
        }
    }
}

/// The response-body write side of one HTTP exchange.
pub struct HttpOutput {
    inner: Mutex<Inner>,
    ready: Condvar,
    config: OutputConfig,
}

impl fmt::Debug for HttpOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("HttpOutput")
            .field("state", &inner.state)
            .field("committed", &inner.committed)
            .field("written", &inner.written)
            .finish()
    }
}

impl HttpOutput {
    /// A fresh, uncommitted output stream in `OPEN` state.
    pub fn new(config: OutputConfig) -> HttpOutput {
        HttpOutput {
            inner: Mutex::new(Inner {
                state: State::Open,
                buffer: BytesMut::new(),
                committed: false,
                aggregation_size: config.aggregation_size.min(config.buffer_size),
                buffer_size: config.buffer_size,
                interceptors: Chain::new(),
                written: 0,
                write_listener: None,
            }),
            ready: Condvar::new(),
            config,
        }
    }

    /// Install an interceptor at the end of the write-side chain. Must be
    /// called before the response is committed.
    pub fn add_interceptor(&self, interceptor: Box<dyn crate::io::interceptor::Interceptor>) {
        let mut inner = self.lock();
        inner.interceptors.push(interceptor);
    }

    /// The current externally-visible state.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Whether the response status line/headers have gone out.
    pub fn is_committed(&self) -> bool {
        self.lock().committed
    }

    /// Total body bytes handed to the transport so far (post-interceptor,
    /// excluding the still-buffered tail).
    pub fn written(&self) -> u64 {
        self.lock().written
    }

    /// Mark the response committed. Must be called once, before the first
    /// body write; a second call is a contract violation, except for 1xx
    /// responses which the channel is expected to commit-then-uncommit
    /// around (see `uncommit`).
    pub fn commit(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.committed {
            return Err(Error::already_committed());
        }
        inner.committed = true;
        Ok(())
    }

    /// Clear the committed flag after sending a 1xx informational
    /// response, so the eventual final response can still commit.
    pub fn uncommit(&self) {
        self.lock().committed = false;
    }

    /// Buffer (and, once the aggregation threshold is crossed, flush)
    /// `data` through the interceptor chain and out to `transport`.
    ///
    /// Writes larger than the configured buffer size are sliced into
    /// buffer-sized chunks and sent directly, bypassing aggregation, per
    /// the large-write slicing rule. Gated by the state table: legal from
    /// `OPEN` (stays `OPEN`) and `READY` (moves to `PENDING`); rejected
    /// from every other state.
    pub fn write(&self, data: &[u8], transport: &mut dyn Transport) -> Result<(), Error> {
        let mut inner = self.lock();
        gate_write(inner.state)?;
        if !inner.committed {
            return Err(Error::invalid_state());
        }
        let becomes_pending = inner.state == State::Ready;

        let buffer_size = inner.buffer_size;
        let aggregation_size = inner.aggregation_size;

        if data.len() > buffer_size {
            flush_locked(&mut inner, false, transport)?;
            for chunk in data.chunks(buffer_size) {
                send_through_chain(&mut inner, Bytes::copy_from_slice(chunk), false, transport)?;
            }
        } else {
            inner.buffer.extend_from_slice(data);
            if inner.buffer.len() >= aggregation_size {
                flush_locked(&mut inner, false, transport)?;
            }
        }
        if becomes_pending {
            inner.state = State::Pending;
        }
        Ok(())
    }

    /// Discard any buffered, not-yet-flushed body bytes. Only valid before
    /// the response is committed.
    pub fn reset_buffer(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.committed {
            return Err(Error::already_committed());
        }
        inner.buffer.clear();
        Ok(())
    }

    /// Flush any buffered bytes to `transport` without closing the stream.
    /// Gated the same way as `write` per the state table's shared
    /// `write/flush` row.
    pub fn flush(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        let mut inner = self.lock();
        gate_write(inner.state)?;
        let becomes_pending = inner.state == State::Ready;
        flush_locked(&mut inner, false, transport)?;
        if becomes_pending {
            inner.state = State::Pending;
        }
        Ok(())
    }

    /// Flush remaining buffered bytes and signal completion to
    /// `transport`. Always performs a final send with `last=true`, even
    /// with nothing left buffered, so the transport observes end-of-body;
    /// idempotent — calling `close` on an already-`Closed` stream is a
    /// no-op.
    pub fn close(&self, transport: &mut dyn Transport) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state == State::Closed {
            return Ok(());
        }
        flush_locked(&mut inner, true, transport)?;
        inner.state = State::Closed;
        transport.completed()
    }

    /// Abort the stream after a fault; flushes nothing further and
    /// notifies `transport`.
    pub fn abort(&self, error: &Error, transport: &mut dyn Transport) {
        let mut inner = self.lock();
        inner.state = State::Error;
        transport.abort(error);
    }

    /// Register an asynchronous write listener in place of blocking
    /// writes. Only valid from `OPEN`; per the state table this moves
    /// straight to `READY` and schedules an immediate `on_writable` (the
    /// stream is trivially ready since nothing has been written yet).
    pub fn set_write_listener(&self, listener: Box<dyn WriteListener>) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            if inner.state != State::Open {
                return Err(Error::invalid_state());
            }
            inner.state = State::Ready;
            inner.write_listener = Some(listener);
        }
        self.fire_writable();
        Ok(())
    }

    /// The action loop's `WRITE_CALLBACK` surface, invoked once a
    /// previously-issued async write has actually been observed complete at
    /// the transport. From `PENDING` this returns to `ASYNC` (the content
    /// producer must call `is_ready()` again before its next write); from
    /// `UNREADY` it moves straight to `READY` and re-fires `on_writable`,
    /// since the producer was already waiting on that notification.
    pub fn complete_async_write(&self) {
        let fire = {
            let mut inner = self.lock();
            match inner.state {
                State::Pending => {
                    inner.state = State::Async;
                    false
                }
                State::Unready => {
                    inner.state = State::Ready;
                    true
                }
                _ => false,
            }
        };
        self.ready.notify_all();
        if fire {
            self.fire_writable();
        }
    }

    fn fire_writable(&self) {
        let listener = self.lock().write_listener.take();
        if let Some(listener) = listener {
            listener.on_writable();
            self.lock().write_listener = Some(listener);
        }
    }

    /// Whether an async write may proceed without blocking right now. The
    /// only state-changing cases are `ASYNC` (the first poll after
    /// registering a listener always succeeds, moving to `READY`) and
    /// `PENDING` (a write is still in flight, so this moves to `UNREADY`
    /// and the caller must wait for `complete_async_write`).
    pub fn is_ready(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            State::Open | State::Ready | State::Error | State::Closed => true,
            State::Async => {
                inner.state = State::Ready;
                true
            }
            State::Pending => {
                inner.state = State::Unready;
                false
            }
            State::Unready => false,
        }
    }

    /// Reset to a fresh `OPEN` state for reuse on the next exchange.
    pub fn recycle(&self) {
        let mut inner = self.lock();
        inner.state = State::Open;
        inner.buffer.clear();
        inner.committed = false;
        inner.interceptors = Chain::new();
        inner.written = 0;
        inner.write_listener = None;
        inner.aggregation_size = self.config.aggregation_size.min(self.config.buffer_size);
        inner.buffer_size = self.config.buffer_size;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The `write`/`flush` row of the state table: `OPEN`/`READY` allow the
/// call through, every other state rejects it (`ASYNC` because `is_ready`
/// hasn't confirmed readiness yet, `PENDING`/`UNREADY` because a previous
/// async write hasn't completed, `ERROR`/`CLOSED` because the stream has
/// already ended).
fn gate_write(state: State) -> Result<(), Error> {
    match state {
        State::Open | State::Ready => Ok(()),
        State::Async | State::Pending | State::Unready | State::Error | State::Closed => {
            Err(Error::invalid_state())
        }
    }
}

fn flush_locked(inner: &mut Inner, last: bool, transport: &mut dyn Transport) -> Result<(), Error> {
    if inner.buffer.is_empty() && !last {
        return Ok(());
    }
    let data = inner.buffer.split().freeze();
    send_through_chain(inner, data, last, transport)
}

fn send_through_chain(
    inner: &mut Inner,
    data: Bytes,
    last: bool,
    transport: &mut dyn Transport,
) -> Result<(), Error> {
    let len = data.len() as u64;
    match inner.interceptors.run(data, last)? {
        Some(out) => {
            transport.send(None, out, last)?;
            inner.written += len;
            Ok(())
        }
        None => Ok(()),
    }
}
