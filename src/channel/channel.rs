//! `Channel`: one HTTP exchange's worth of request/response state plus the
//! action loop that drives it to completion.
//!
//! Grounded on hyper's `proto::h1::Dispatcher::poll_inner` loop (read →
//! dispatch → write → flush, repeated until the loop has nothing left to
//! do), adapted from poll-until-pending to run-until-`WAIT` since the
//! worker thread executing `run` blocks on each collaborator rather than
//! being re-polled by a reactor.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{Method, Uri, Version};

use crate::channel::async_context::AsyncContext;
use crate::channel::state::{Action, ChannelState};
use crate::error::Error;
use crate::handler::Chain as HandlerChain;
use crate::io::input::{HttpInput, InputConfig, ReadListener};
use crate::io::output::{HttpOutput, OutputConfig, WriteListener};
use crate::request::{AsyncSupport, DispatcherType, Request};
use crate::response::Response;
use crate::scheduler::{Handle as SchedulerHandle, Token};
use crate::transport::Transport;

/// How many times a single exchange may re-enter error dispatch before the
/// action loop gives up and forces the connection closed, guarding against
/// a handler that itself throws from error handling.
const DEFAULT_MAX_ERROR_DISPATCHES: u32 = 4;

/// One HTTP exchange: its request, its response, the state machine
/// governing dispatch, and enough bookkeeping to recycle for the next
/// exchange on a persistent connection.
pub struct Channel {
    state: Arc<ChannelState>,
    request: Request,
    response: Response,
    handlers: Arc<HandlerChain>,
    scheduler: SchedulerHandle,
    idle_timeout: Duration,
    max_error_dispatches: u32,
    error_dispatches: u32,
    timeout_token: Option<Token>,
    persistent: bool,
    request_count: u64,
    bytes_written: u64,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("state", &self.state)
            .field("persistent", &self.persistent)
            .field("error_dispatches", &self.error_dispatches)
            .field("request_count", &self.request_count)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

impl Channel {
    /// Build a fresh channel over a new request/response pair.
    pub fn new(
        handlers: Arc<HandlerChain>,
        scheduler: SchedulerHandle,
        input_config: InputConfig,
        output_config: OutputConfig,
        idle_timeout: Duration,
    ) -> Channel {
        let state = Arc::new(ChannelState::new());
        let async_support = AsyncSupport {
            state: state.clone(),
            scheduler: scheduler.clone(),
        };
        Channel {
            state,
            request: Request::new(HttpInput::new(input_config), async_support),
            response: Response::new(HttpOutput::new(output_config)),
            handlers,
            scheduler,
            idle_timeout,
            max_error_dispatches: DEFAULT_MAX_ERROR_DISPATCHES,
            error_dispatches: 0,
            timeout_token: None,
            persistent: true,
            request_count: 0,
            bytes_written: 0,
        }
    }

    /// Override the error-dispatch loop guard (defaults to 4).
    pub fn set_max_error_dispatches(&mut self, max: u32) {
        self.max_error_dispatches = max;
    }

    /// A handle to this channel's state machine, for wiring up endpoint
    /// read/write-ready notifications.
    pub fn state(&self) -> Arc<ChannelState> {
        self.state.clone()
    }

    /// Whether the connection should stay open for another exchange once
    /// this one completes (set to `false` by a `Connection: close` request
    /// or response header, or by a fault).
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Parser-event surface: the request line and headers have arrived.
    pub fn on_request(&mut self, method: Method, target: Uri, version: Version) -> Result<(), Error> {
        self.request.set_start_line(method, target, version);
        self.request.set_dispatcher_type(DispatcherType::Request);
        self.request_count += 1;
        match self.state.on_request() {
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// How many requests have been dispatched on this channel so far
    /// (across `recycle()` calls on a persistent connection).
    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Total response body bytes handed to the transport on this channel so
    /// far (across `recycle()` calls on a persistent connection).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Parser-event surface: a chunk of body content arrived.
    pub fn on_content(&mut self, content: bytes::Bytes) {
        self.request.input_mut().on_content(content);
        self.state.read_ready();
    }

    /// Parser-event surface: the request body finished.
    pub fn on_content_complete(&mut self) {
        self.request.input_mut().on_content_complete();
        self.state.read_ready();
    }

    /// Parser-event surface: the request body was cut short.
    pub fn on_early_eof(&mut self) {
        self.request.input_mut().on_early_eof();
        self.persistent = false;
        self.state.read_ready();
    }

    /// Handler-chain surface: register an asynchronous read listener in
    /// place of blocking reads, arming read interest so a later `on_content`/
    /// `on_content_complete`/`on_early_eof` wakes a suspended exchange into
    /// `ReadCallback`.
    pub fn set_read_listener(&mut self, listener: Box<dyn ReadListener>) -> Result<(), Error> {
        self.request.input().set_read_listener(listener)?;
        self.state.want_read();
        Ok(())
    }

    /// Handler-chain surface: register an asynchronous write listener in
    /// place of blocking writes, arming write interest so a later
    /// `on_write_possible` wakes a suspended exchange into `WriteCallback`.
    pub fn set_write_listener(&mut self, listener: Box<dyn WriteListener>) -> Result<(), Error> {
        self.response.output().set_write_listener(listener)?;
        self.state.want_write();
        Ok(())
    }

    /// Endpoint/transport surface: the underlying socket can accept more
    /// bytes without blocking. Wakes a suspended exchange into
    /// `WriteCallback` if write interest is currently registered.
    pub fn on_write_possible(&mut self) {
        self.state.write_ready();
    }

    /// Parser-event surface: the request was malformed before a start line
    /// could be established; `status`/`reason` describe the response the
    /// error dispatch should send.
    pub fn on_bad_message(&mut self, status: u16) -> Action {
        self.persistent = false;
        self.state.on_bad_message(status)
    }

    /// Endpoint/transport fault surface: a collaborator detected a failure
    /// (a dropped socket, a TLS handshake failure relayed from below) while
    /// this exchange may be suspended. If it is, this runs any registered
    /// `on_error` listeners immediately, mirroring how an armed timeout
    /// fires straight from the scheduler thread rather than waiting for the
    /// connection driver's next `run()` call. If the exchange was not
    /// suspended, the fault is simply queued as the next `ErrorDispatch`,
    /// which the next `run()` call resolves on its own.
    pub fn on_endpoint_error(&mut self, status: u16) {
        if self.state.on_error(status) == Action::AsyncError {
            if let Some(ctx) = self.request.async_context() {
                ctx.fire_error(&Error::from_status(status));
            }
        }
    }

    /// Run the action loop until it returns `WAIT` or `Terminated`,
    /// dispatching into the handler chain, error path, and any registered
    /// async callbacks along the way. Returns `true` if the loop reached
    /// `Terminated` (the exchange is fully finished and `recycle()` may be
    /// called once the response has been flushed to `transport`).
    pub fn run(&mut self, transport: &mut dyn Transport) -> Result<bool, Error> {
        let mut action = self.state.initial_action();
        loop {
            match action {
                Action::Wait => return Ok(false),
                Action::Terminated => return Ok(true),
                Action::Dispatch | Action::AsyncDispatch => {
                    self.request.set_dispatcher_type(if action == Action::Dispatch {
                        DispatcherType::Request
                    } else {
                        DispatcherType::Async
                    });
                    let result = self.handlers.handle(&mut self.request, &mut self.response, transport);
                    match result {
                        Err(err) => self.fail(err, transport)?,
                        Ok(()) if !self.request.is_handled() => {
                            self.send_default_not_found(transport)?
                        }
                        Ok(()) => {}
                    }
                    // A handler may have called `start_async()`, which
                    // already moved the state to `AsyncWait`; `unhandle()`
                    // below notices that and returns `Wait` instead of
                    // advancing to `Completing`.
                }
                Action::AsyncError => {
                    // `initial_action`/`unhandle` never produce this one —
                    // it's the direct return value `on_endpoint_error`
                    // already acts on before re-entering `run()`. Handled
                    // here too so the match stays exhaustive and correct if
                    // that ever changes.
                    if let Some(ctx) = self.request.async_context() {
                        let status = self.state.peek_error_status().unwrap_or(500);
                        ctx.fire_error(&Error::from_status(status));
                    } else if self.enter_error_dispatch(transport)? {
                        return Ok(true);
                    }
                }
                Action::ErrorDispatch => {
                    if self.enter_error_dispatch(transport)? {
                        return Ok(true);
                    }
                }
                Action::ReadCallback => {
                    if let Err(err) = self.request.input().run() {
                        self.fail(err, transport)?;
                    }
                }
                Action::WriteCallback => {
                    self.response.output().complete_async_write();
                }
                Action::Complete => {
                    if let Some(ctx) = self.request.async_context() {
                        ctx.fire_complete();
                    }
                    self.finish(transport)?;
                }
            }
            action = self.state.unhandle();
        }
    }

    /// Runs one pass of error dispatch. Per the action table, `ERROR_DISPATCH`
    /// re-enters the handler chain with `dispatcher_type=Error` just like a
    /// normal or async dispatch, so an application handler gets a chance to
    /// produce a custom error page; the built-in canned response only fires
    /// if the handler leaves the request unhandled or fails again itself.
    /// Returns `true` if the error-dispatch guard tripped and the loop
    /// should stop immediately rather than continue through `unhandle()`.
    fn enter_error_dispatch(&mut self, transport: &mut dyn Transport) -> Result<bool, Error> {
        self.error_dispatches += 1;
        if self.error_dispatches > self.max_error_dispatches {
            self.persistent = false;
            if !self.response.is_committed() {
                self.send_error_response(500, transport)?;
            }
            self.state.terminate();
            return Ok(true);
        }
        let status = self.state.take_error_status().unwrap_or(500);
        self.request.set_dispatcher_type(DispatcherType::Error);
        self.request.set_handled(false);
        if !self.response.is_committed() {
            let code = http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
            self.response.set_status(code)?;
        }
        match self.handlers.handle(&mut self.request, &mut self.response, transport) {
            Ok(()) if self.request.is_handled() => {}
            _ => self.send_error_response(status, transport)?,
        }
        Ok(false)
    }

    /// Reacts to a handler (or input-callback) failure. A response that has
    /// already started streaming can't be re-committed with an error status,
    /// so it's simply aborted; otherwise the fault is routed through
    /// `ChannelState::on_error`, whose returned `Action` decides what
    /// happens next. `Action::Wait` (the `Dispatched -> THROWN` case) is a
    /// no-op here: the action loop's own subsequent `unhandle()` call
    /// resolves `THROWN` into `ErrorDispatch` on its own. `Action::ErrorDispatch`
    /// (a fault with no handler-chain frame above it, e.g. a read-callback
    /// failure) has to be acted on immediately, since `unhandle()` would
    /// otherwise resolve the state straight to `Completing` without ever
    /// running error dispatch.
    fn fail(&mut self, err: Error, transport: &mut dyn Transport) -> Result<(), Error> {
        self.persistent = false;
        let status = err.status_code();
        if self.response.is_committed() {
            self.response.output().abort(&err, transport);
            self.state.on_error(status);
            return Ok(());
        }
        match self.state.on_error(status) {
            Action::AsyncError => {
                if let Some(ctx) = self.request.async_context() {
                    ctx.fire_error(&err);
                }
            }
            Action::ErrorDispatch => {
                self.enter_error_dispatch(transport)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn send_default_not_found(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        self.send_error_response(404, transport)
    }

    fn send_error_response(&mut self, status: u16, transport: &mut dyn Transport) -> Result<(), Error> {
        if self.response.is_committed() {
            return Ok(());
        }
        let code = http::StatusCode::from_u16(status).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
        self.response.set_status(code)?;
        self.response.commit(false, transport)?;
        let body = code.canonical_reason().unwrap_or("").as_bytes();
        self.response.output().write(body, transport)?;
        Ok(())
    }

    fn finish(&mut self, transport: &mut dyn Transport) -> Result<(), Error> {
        self.response.output().close(transport)?;
        Ok(())
    }

    /// Arm the idle timeout on the shared scheduler; re-armed by the
    /// connection driver between exchanges and before blocking reads.
    pub fn arm_idle_timeout(&mut self) {
        let state = self.state.clone();
        let token = self.scheduler.arm_after(self.idle_timeout, move || {
            if state.idle_timeout_expired() {
                // The connection driver polls `dispatch_state()`/`run()`
                // again on its next pass; nothing else to do from the
                // scheduler thread itself.
            }
        });
        self.timeout_token = Some(token);
    }

    /// When the idle timeout is currently due to fire, for diagnostics.
    pub fn idle_deadline(&self) -> Instant {
        Instant::now() + self.idle_timeout
    }

    /// Reset request/response/state for reuse on the next exchange of a
    /// persistent connection.
    pub fn recycle(&mut self) -> Result<(), Error> {
        self.bytes_written += self.response.output().written();
        self.request.recycle();
        self.response.recycle();
        self.error_dispatches = 0;
        self.timeout_token = None;
        self.state.recycle()
    }

    /// Borrow the request half (for tests and embedder introspection).
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Borrow the response half (for tests and embedder introspection).
    pub fn response(&self) -> &Response {
        &self.response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Handler;
    use crate::scheduler::Scheduler;
    use crate::transport::mock::MockTransport;

    struct Echo;
    impl Handler for Echo {
        fn handle(&self, req: &mut Request, resp: &mut Response, transport: &mut dyn Transport) -> Result<(), Error> {
            resp.set_status(http::StatusCode::OK).unwrap();
            resp.commit(false, transport).unwrap();
            req.set_handled(true);
            Ok(())
        }
    }

    fn channel_with(handlers: HandlerChain, scheduler: &Scheduler) -> Channel {
        Channel::new(
            Arc::new(handlers),
            scheduler.handle(),
            InputConfig::default(),
            OutputConfig::default(),
            Duration::from_secs(30),
        )
    }

    #[test]
    fn full_request_response_cycle_completes_and_recycles() {
        let scheduler = Scheduler::start();
        let mut handlers = HandlerChain::new();
        handlers.push(Box::new(Echo));
        let mut channel = channel_with(handlers, &scheduler);
        let mut transport = MockTransport::new();

        channel
            .on_request(Method::GET, Uri::from_static("/"), Version::HTTP_11)
            .unwrap();
        channel.on_content_complete();
        let terminated = channel.run(&mut transport).unwrap();
        assert!(terminated);
        assert_eq!(channel.response().status(), http::StatusCode::OK);
        assert!(*transport.completed.lock().unwrap());
        channel.recycle().unwrap();
    }

    #[test]
    fn unhandled_request_gets_a_default_404() {
        let scheduler = Scheduler::start();
        let handlers = HandlerChain::new();
        let mut channel = channel_with(handlers, &scheduler);
        let mut transport = MockTransport::new();

        channel
            .on_request(Method::GET, Uri::from_static("/missing"), Version::HTTP_11)
            .unwrap();
        channel.on_content_complete();
        channel.run(&mut transport).unwrap();
        assert_eq!(channel.response().status(), http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn bad_message_short_circuits_to_error_dispatch() {
        let scheduler = Scheduler::start();
        let handlers = HandlerChain::new();
        let mut channel = channel_with(handlers, &scheduler);
        let mut transport = MockTransport::new();

        channel.on_bad_message(400);
        channel.run(&mut transport).unwrap();
        assert_eq!(channel.response().status(), http::StatusCode::BAD_REQUEST);
        assert!(!channel.is_persistent());
    }

    struct Faulty;
    impl Handler for Faulty {
        fn handle(&self, _req: &mut Request, _resp: &mut Response, _transport: &mut dyn Transport) -> Result<(), Error> {
            Err(Error::internal(std::io::Error::new(std::io::ErrorKind::Other, "boom")))
        }
    }

    #[test]
    fn handler_failure_is_answered_with_a_500() {
        let scheduler = Scheduler::start();
        let mut handlers = HandlerChain::new();
        handlers.push(Box::new(Faulty));
        let mut channel = channel_with(handlers, &scheduler);
        let mut transport = MockTransport::new();

        channel
            .on_request(Method::GET, Uri::from_static("/"), Version::HTTP_11)
            .unwrap();
        channel.on_content_complete();
        channel.run(&mut transport).unwrap();
        assert_eq!(channel.response().status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    struct ErrorAwareHandler;
    impl Handler for ErrorAwareHandler {
        fn handle(&self, req: &mut Request, resp: &mut Response, transport: &mut dyn Transport) -> Result<(), Error> {
            if req.dispatcher_type() == DispatcherType::Error {
                resp.set_status(http::StatusCode::IM_A_TEAPOT).unwrap();
                resp.commit(false, transport).unwrap();
                req.set_handled(true);
                Ok(())
            } else {
                Err(Error::internal(std::io::Error::new(std::io::ErrorKind::Other, "boom")))
            }
        }
    }

    #[test]
    fn handler_error_reenters_the_chain_as_an_error_dispatch() {
        let scheduler = Scheduler::start();
        let mut handlers = HandlerChain::new();
        handlers.push(Box::new(ErrorAwareHandler));
        let mut channel = channel_with(handlers, &scheduler);
        let mut transport = MockTransport::new();

        channel
            .on_request(Method::GET, Uri::from_static("/"), Version::HTTP_11)
            .unwrap();
        channel.on_content_complete();
        channel.run(&mut transport).unwrap();
        // The first dispatch fails; the second, with dispatcher_type=Error,
        // is the same chain re-entered and gets a chance to answer itself
        // rather than falling through to the built-in 500.
        assert_eq!(channel.response().status(), http::StatusCode::IM_A_TEAPOT);
    }

    struct EchoWithBody;
    impl Handler for EchoWithBody {
        fn handle(&self, req: &mut Request, resp: &mut Response, transport: &mut dyn Transport) -> Result<(), Error> {
            resp.set_status(http::StatusCode::OK).unwrap();
            resp.commit(false, transport).unwrap();
            resp.output().write(b"hello", transport)?;
            req.set_handled(true);
            Ok(())
        }
    }

    #[test]
    fn handler_written_body_bytes_reach_the_transport() {
        let scheduler = Scheduler::start();
        let mut handlers = HandlerChain::new();
        handlers.push(Box::new(EchoWithBody));
        let mut channel = channel_with(handlers, &scheduler);
        let mut transport = MockTransport::new();

        channel
            .on_request(Method::GET, Uri::from_static("/"), Version::HTTP_11)
            .unwrap();
        channel.on_content_complete();
        let terminated = channel.run(&mut transport).unwrap();
        assert!(terminated);
        assert_eq!(transport.contents(), b"hello".to_vec());
    }

    struct SuspendWithShortTimeout;
    impl Handler for SuspendWithShortTimeout {
        fn handle(&self, req: &mut Request, _resp: &mut Response, _transport: &mut dyn Transport) -> Result<(), Error> {
            let ctx = req.start_async().unwrap();
            ctx.set_timeout(Duration::from_millis(20));
            Ok(())
        }
    }

    #[test]
    fn async_timeout_with_no_listener_dispatch_falls_through_to_a_500() {
        let scheduler = Scheduler::start();
        let mut handlers = HandlerChain::new();
        handlers.push(Box::new(SuspendWithShortTimeout));
        let mut channel = channel_with(handlers, &scheduler);
        let mut transport = MockTransport::new();

        channel
            .on_request(Method::GET, Uri::from_static("/"), Version::HTTP_11)
            .unwrap();
        channel.on_content_complete();

        // The handler suspends the exchange; the loop has nothing left to
        // do until the timeout fires (or something else wakes it).
        let terminated = channel.run(&mut transport).unwrap();
        assert!(!terminated);

        std::thread::sleep(Duration::from_millis(120));

        // The embedder's connection driver re-enters `run()` on its next
        // pass; the expired timeout has already woken the exchange into
        // the default error dispatch.
        let terminated = channel.run(&mut transport).unwrap();
        assert!(terminated);
        assert_eq!(channel.response().status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    }

    struct SuspendOnly;
    impl Handler for SuspendOnly {
        fn handle(&self, req: &mut Request, _resp: &mut Response, _transport: &mut dyn Transport) -> Result<(), Error> {
            req.start_async().unwrap();
            Ok(())
        }
    }

    struct CountingReadListener(std::sync::atomic::AtomicUsize);
    impl ReadListener for Arc<CountingReadListener> {
        fn on_data_available(&self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn read_callback_fires_registered_listener_once_content_arrives() {
        let scheduler = Scheduler::start();
        let mut handlers = HandlerChain::new();
        handlers.push(Box::new(SuspendOnly));
        let mut channel = channel_with(handlers, &scheduler);
        let mut transport = MockTransport::new();

        channel
            .on_request(Method::POST, Uri::from_static("/"), Version::HTTP_11)
            .unwrap();
        let terminated = channel.run(&mut transport).unwrap();
        assert!(!terminated);

        let counts = Arc::new(CountingReadListener(std::sync::atomic::AtomicUsize::new(0)));
        channel.set_read_listener(Box::new(counts.clone())).unwrap();
        assert_eq!(counts.0.load(std::sync::atomic::Ordering::SeqCst), 0);

        // Content arrives while the exchange is suspended: on_content wakes
        // it into ReadCallback, which the next run() resolves by invoking
        // HttpInput::run() and firing the listener.
        channel.on_content(bytes::Bytes::from_static(b"hi"));
        let terminated = channel.run(&mut transport).unwrap();
        assert!(!terminated);
        assert_eq!(counts.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    struct SuspendAndCommit;
    impl Handler for SuspendAndCommit {
        fn handle(&self, req: &mut Request, resp: &mut Response, transport: &mut dyn Transport) -> Result<(), Error> {
            req.start_async().unwrap();
            resp.set_status(http::StatusCode::OK).unwrap();
            resp.commit(false, transport).unwrap();
            Ok(())
        }
    }

    struct CountingWriteListener(std::sync::atomic::AtomicUsize);
    impl WriteListener for Arc<CountingWriteListener> {
        fn on_writable(&self) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn write_callback_resumes_a_pending_async_write_after_on_write_possible() {
        let scheduler = Scheduler::start();
        let mut handlers = HandlerChain::new();
        handlers.push(Box::new(SuspendAndCommit));
        let mut channel = channel_with(handlers, &scheduler);
        let mut transport = MockTransport::new();

        channel
            .on_request(Method::GET, Uri::from_static("/"), Version::HTTP_11)
            .unwrap();
        channel.on_content_complete();
        let terminated = channel.run(&mut transport).unwrap();
        assert!(!terminated);

        let counts = Arc::new(CountingWriteListener(std::sync::atomic::AtomicUsize::new(0)));
        channel.set_write_listener(Box::new(counts.clone())).unwrap();
        // Nothing written yet, so the listener fires immediately.
        assert_eq!(counts.0.load(std::sync::atomic::Ordering::SeqCst), 1);

        channel.response().output().write(b"hi", &mut transport).unwrap();
        assert_eq!(channel.response().output().state(), crate::io::output::State::Pending);

        // The endpoint reports the write completed; this wakes the
        // suspended exchange into WriteCallback, which the next run()
        // resolves by calling complete_async_write().
        channel.on_write_possible();
        let terminated = channel.run(&mut transport).unwrap();
        assert!(!terminated);
        assert_eq!(channel.response().output().state(), crate::io::output::State::Async);
    }

    #[test]
    fn exceeding_max_error_dispatches_sends_a_500_before_terminating() {
        let scheduler = Scheduler::start();
        let handlers = HandlerChain::new();
        let mut channel = channel_with(handlers, &scheduler);
        channel.set_max_error_dispatches(0);
        let mut transport = MockTransport::new();

        channel
            .on_request(Method::GET, Uri::from_static("/"), Version::HTTP_11)
            .unwrap();

        // The very first error dispatch already exceeds a zero-tolerance
        // guard; the response is still uncommitted at that point, so the
        // guard must still answer with a 500 rather than closing silently.
        let guard_tripped = channel.enter_error_dispatch(&mut transport).unwrap();
        assert!(guard_tripped);
        assert!(!channel.is_persistent());
        assert_eq!(channel.response().status(), http::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(channel.response().is_committed());
        assert!(!transport.contents().is_empty());
        assert_eq!(
            channel.state().dispatch_state(),
            crate::channel::state::DispatchState::Terminated
        );
    }

    #[test]
    fn request_count_and_bytes_written_accumulate_across_recycles() {
        let scheduler = Scheduler::start();
        let mut handlers = HandlerChain::new();
        handlers.push(Box::new(Echo));
        let mut channel = channel_with(handlers, &scheduler);
        let mut transport = MockTransport::new();

        channel
            .on_request(Method::GET, Uri::from_static("/"), Version::HTTP_11)
            .unwrap();
        channel.on_content_complete();
        channel.run(&mut transport).unwrap();
        assert_eq!(channel.request_count(), 1);
        channel.recycle().unwrap();
        assert_eq!(channel.bytes_written(), 0); // Echo never writes a body

        channel
            .on_request(Method::GET, Uri::from_static("/"), Version::HTTP_11)
            .unwrap();
        channel.on_content_complete();
        channel.run(&mut transport).unwrap();
        assert_eq!(channel.request_count(), 2);
    }

    struct ReadBodyThenRespond;
    impl Handler for ReadBodyThenRespond {
        fn handle(&self, req: &mut Request, resp: &mut Response, transport: &mut dyn Transport) -> Result<(), Error> {
            let body = req.input().read().unwrap();
            assert_eq!(body, Some(bytes::Bytes::from_static(b"hello")));
            assert_eq!(req.input().read().unwrap(), None);
            resp.set_status(http::StatusCode::OK).unwrap();
            resp.commit(false, transport).unwrap();
            req.set_handled(true);
            Ok(())
        }
    }

    #[test]
    fn full_body_delivered_before_completion_and_connection_stays_persistent() {
        let scheduler = Scheduler::start();
        let mut handlers = HandlerChain::new();
        handlers.push(Box::new(ReadBodyThenRespond));
        let mut channel = channel_with(handlers, &scheduler);
        let mut transport = MockTransport::new();

        channel
            .on_request(Method::POST, Uri::from_static("/"), Version::HTTP_11)
            .unwrap();
        channel.on_content(bytes::Bytes::from_static(b"hello"));
        channel.on_content_complete();
        let terminated = channel.run(&mut transport).unwrap();

        assert!(terminated);
        assert!(channel.is_persistent());
        assert_eq!(channel.response().status(), http::StatusCode::OK);
    }

    struct InformationalThenFinal;
    impl Handler for InformationalThenFinal {
        fn handle(&self, req: &mut Request, resp: &mut Response, transport: &mut dyn Transport) -> Result<(), Error> {
            resp.set_status(http::StatusCode::CONTINUE).unwrap();
            resp.commit(true, transport).unwrap(); // informational: leaves committed() false
            assert!(!resp.is_committed());

            let body = req.input().read().unwrap();
            assert_eq!(body, Some(bytes::Bytes::from_static(b"abc")));

            resp.set_status(http::StatusCode::NO_CONTENT).unwrap();
            resp.commit(false, transport).unwrap();
            req.set_handled(true);
            Ok(())
        }
    }

    #[test]
    fn informational_commit_precedes_the_final_response_once_the_body_arrives() {
        let scheduler = Scheduler::start();
        let mut handlers = HandlerChain::new();
        handlers.push(Box::new(InformationalThenFinal));
        let mut channel = channel_with(handlers, &scheduler);
        let mut transport = MockTransport::new();

        channel
            .on_request(Method::POST, Uri::from_static("/"), Version::HTTP_11)
            .unwrap();
        channel.on_content(bytes::Bytes::from_static(b"abc"));
        channel.on_content_complete();
        let terminated = channel.run(&mut transport).unwrap();

        assert!(terminated);
        assert_eq!(channel.response().status(), http::StatusCode::NO_CONTENT);
        assert!(channel.response().is_committed());
    }
}
