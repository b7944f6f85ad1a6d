//! The `Handler` boundary: the servlet-style request handler chain.
//!
//! An external collaborator (the actual application logic, sessions,
//! and routing are all out of scope per the purpose-and-scope design).
//! Grounded on hyper's `tower_service::Service<Request<Body>>` seam in
//! `server/service.rs`, adapted to the `handle`/set-handled contract the
//! action loop drives rather than a `poll_ready`/`call` future pair, since
//! the channel dispatches synchronously into the handler chain and relies
//! on `Request::set_handled` (not a returned `Response`) to know whether
//! the chain produced an answer.

use std::fmt;

use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::transport::Transport;

/// One link in the handler chain the action loop dispatches into on
/// `DISPATCH`, `ASYNC_DISPATCH`, and `ERROR_DISPATCH`.
///
/// `handle` is expected to call `request.set_handled(true)` once it has
/// written (or started writing) a response; a chain that leaves a request
/// unhandled falls through to the channel's built-in 404. `transport` is
/// the only way response body bytes (via `response.output().write(...)`)
/// actually reach the wire — `response.commit` also needs it to send the
/// status line/headers.
pub trait Handler: Send + Sync {
    /// Service one dispatch of `request`, writing to `response` (and, via
    /// it, to `transport`) as needed.
    fn handle(&self, request: &mut Request, response: &mut Response, transport: &mut dyn Transport) -> Result<(), Error>;
}

/// An ordered list of handlers, tried in sequence until one marks the
/// request handled.
pub struct Chain {
    handlers: Vec<Box<dyn Handler>>,
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").field("handlers", &self.handlers.len()).finish()
    }
}

impl Chain {
    /// An empty chain; every request falls through unhandled.
    pub fn new() -> Chain {
        Chain {
            handlers: Vec::new(),
        }
    }

    /// Append a handler to the end of the chain.
    pub fn push(&mut self, handler: Box<dyn Handler>) {
        self.handlers.push(handler);
    }

    /// Dispatch through the chain until a handler marks the request
    /// handled, or the chain is exhausted.
    pub fn handle(&self, request: &mut Request, response: &mut Response, transport: &mut dyn Transport) -> Result<(), Error> {
        for handler in &self.handlers {
            handler.handle(request, response, transport)?;
            if request.is_handled() {
                return Ok(());
            }
        }
        Ok(())
    }
}

impl Default for Chain {
    fn default() -> Chain {
        Chain::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::state::ChannelState;
    use crate::io::input::HttpInput;
    use crate::io::output::HttpOutput;
    use crate::request::AsyncSupport;
    use crate::scheduler::Scheduler;
    use crate::transport::mock::MockTransport;
    use std::sync::Arc;

    struct NotFoundAt404;
    impl Handler for NotFoundAt404 {
        fn handle(&self, _req: &mut Request, _resp: &mut Response, _transport: &mut dyn Transport) -> Result<(), Error> {
            Ok(())
        }
    }

    struct AlwaysHandles;
    impl Handler for AlwaysHandles {
        fn handle(&self, req: &mut Request, _resp: &mut Response, _transport: &mut dyn Transport) -> Result<(), Error> {
            req.set_handled(true);
            Ok(())
        }
    }

    struct WritesABody;
    impl Handler for WritesABody {
        fn handle(&self, req: &mut Request, resp: &mut Response, transport: &mut dyn Transport) -> Result<(), Error> {
            resp.commit(false, transport)?;
            resp.output().write(b"hi", transport)?;
            req.set_handled(true);
            Ok(())
        }
    }

    fn fixture() -> (Request, Response) {
        let scheduler = Scheduler::start();
        let handle = scheduler.handle();
        drop(scheduler);
        let support = AsyncSupport {
            state: Arc::new(ChannelState::new()),
            scheduler: handle,
        };
        (
            Request::new(HttpInput::new(Default::default()), support),
            Response::new(HttpOutput::new(Default::default())),
        )
    }

    #[test]
    fn empty_chain_leaves_request_unhandled() {
        let chain = Chain::new();
        let (mut req, mut resp) = fixture();
        let mut transport = MockTransport::new();
        chain.handle(&mut req, &mut resp, &mut transport).unwrap();
        assert!(!req.is_handled());
    }

    #[test]
    fn chain_stops_at_the_first_handler_that_handles() {
        let mut chain = Chain::new();
        chain.push(Box::new(NotFoundAt404));
        chain.push(Box::new(AlwaysHandles));
        let (mut req, mut resp) = fixture();
        let mut transport = MockTransport::new();
        chain.handle(&mut req, &mut resp, &mut transport).unwrap();
        assert!(req.is_handled());
    }

    #[test]
    fn a_handler_can_write_body_bytes_through_to_the_transport() {
        let mut chain = Chain::new();
        chain.push(Box::new(WritesABody));
        let (mut req, mut resp) = fixture();
        let mut transport = MockTransport::new();
        chain.handle(&mut req, &mut resp, &mut transport).unwrap();
        assert!(req.is_handled());
        assert_eq!(transport.contents(), b"hi".to_vec());
    }
}
