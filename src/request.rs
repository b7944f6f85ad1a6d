//! Per-exchange request state.
//!
//! Grounded on hyper's `proto::mod::MessageHead` and its internal
//! `http::message::RequestHead`, plus the fields the data model adds on top
//! (`attributes`, `handledFlag`, `dispatcherType`, `timeStamp`): those exist
//! on the Java-style request object this engine's action loop dispatches,
//! not on hyper's own (client-oriented) request head.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use http::{HeaderMap, Method, Uri, Version};

use crate::channel::async_context::AsyncContext;
use crate::channel::state::ChannelState;
use crate::error::Error;
use crate::io::input::HttpInput;
use crate::scheduler::Handle as SchedulerHandle;

/// What a `Request` needs on hand to let a handler call `start_async`,
/// without exposing the owning `Channel` itself to the handler chain.
#[derive(Clone)]
pub(crate) struct AsyncSupport {
    pub(crate) state: Arc<ChannelState>,
    pub(crate) scheduler: SchedulerHandle,
}

/// Which kind of dispatch produced the current pass through the handler:
/// the initial request, an async re-dispatch, or an error dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherType {
    /// The original synchronous/asynchronous request dispatch.
    Request,
    /// A re-entry after `startAsync`/`dispatch` resumed the exchange.
    Async,
    /// A dispatch into error handling (`onBadMessage` or handler failure).
    Error,
}

/// The request half of one HTTP exchange.
///
/// A `Request` is reused across persistent-connection exchanges:
/// `recycle()` resets every field back to its unset state rather than
/// allocating a new `Request` per request.
pub struct Request {
    method: Option<Method>,
    target: Option<Uri>,
    version: Version,
    fields: HeaderMap,
    attributes: HashMap<String, Box<dyn Any + Send>>,
    handled: bool,
    dispatcher_type: DispatcherType,
    time_stamp: Option<Instant>,
    input: HttpInput,
    async_support: AsyncSupport,
    async_ctx: Option<AsyncContext>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("target", &self.target)
            .field("version", &self.version)
            .field("handled", &self.handled)
            .field("dispatcher_type", &self.dispatcher_type)
            .finish()
    }
}

impl Request {
    /// An empty request, as handed to a freshly recycled `Channel`.
    pub(crate) fn new(input: HttpInput, async_support: AsyncSupport) -> Request {
        Request {
            method: None,
            target: None,
            version: Version::HTTP_11,
            fields: HeaderMap::new(),
            attributes: HashMap::new(),
            handled: false,
            dispatcher_type: DispatcherType::Request,
            time_stamp: None,
            input,
            async_support,
            async_ctx: None,
        }
    }

    /// Suspend this exchange (Servlet's `request.startAsync()`): the
    /// action loop returns `WAIT` once the handler chain returns, and the
    /// exchange stays suspended until something calls `dispatch()`/
    /// `complete()` on the returned `AsyncContext`, a registered read/write
    /// listener fires, or its timeout expires. Only valid while a
    /// synchronous or async dispatch is actually running.
    ///
    /// Calling this more than once for the same dispatch returns the same
    /// `AsyncContext` rather than erroring, so a handler and a later filter
    /// in the same chain can both reach for it.
    pub fn start_async(&mut self) -> Result<AsyncContext, Error> {
        if let Some(ctx) = &self.async_ctx {
            return Ok(ctx.clone());
        }
        self.async_support.state.start_async()?;
        let ctx = AsyncContext::new(self.async_support.state.clone(), self.async_support.scheduler.clone());
        self.async_ctx = Some(ctx.clone());
        Ok(ctx)
    }

    /// The `AsyncContext` this exchange suspended with, if any, for the
    /// action loop to drive timeout/error listener firing and `onComplete`
    /// notification.
    pub(crate) fn async_context(&self) -> Option<&AsyncContext> {
        self.async_ctx.as_ref()
    }

    /// The request method, once the parser has delivered a start line.
    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    /// The request target (origin-form or absolute-form URI).
    pub fn target(&self) -> Option<&Uri> {
        self.target.as_ref()
    }

    /// The declared HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The request header fields.
    pub fn fields(&self) -> &HeaderMap {
        &self.fields
    }

    /// Mutable access to the request header fields, used while folding
    /// trailers into the completed request.
    pub fn fields_mut(&mut self) -> &mut HeaderMap {
        &mut self.fields
    }

    /// Read-only access to the request body stream.
    pub fn input(&self) -> &HttpInput {
        &self.input
    }

    /// Mutable access to the request body stream.
    pub fn input_mut(&mut self) -> &mut HttpInput {
        &mut self.input
    }

    /// Whether a handler has marked this request as handled (Servlet's
    /// `Request.setHandled(true)`).
    pub fn is_handled(&self) -> bool {
        self.handled
    }

    /// Mark the request handled, so the channel doesn't fall through to a
    /// default 404 handler.
    pub fn set_handled(&mut self, handled: bool) {
        self.handled = handled;
    }

    /// Which kind of dispatch is currently running.
    pub fn dispatcher_type(&self) -> DispatcherType {
        self.dispatcher_type
    }

    /// Set the dispatch kind; called by the action loop before each
    /// `DISPATCH`/`ASYNC_DISPATCH`/`ERROR_DISPATCH` handler invocation.
    pub fn set_dispatcher_type(&mut self, kind: DispatcherType) {
        self.dispatcher_type = kind;
    }

    /// When the request line was parsed.
    pub fn time_stamp(&self) -> Option<Instant> {
        self.time_stamp
    }

    /// Set by the parser-event surface's `onRequest` callback.
    pub fn set_start_line(&mut self, method: Method, target: Uri, version: Version) {
        self.method = Some(method);
        self.target = Some(target);
        self.version = version;
        self.time_stamp = Some(Instant::now());
    }

    /// Attach an arbitrary, type-erased attribute (Servlet's
    /// `setAttribute`/`getAttribute` pair).
    pub fn set_attribute<T: Any + Send>(&mut self, name: &str, value: T) {
        self.attributes.insert(name.to_owned(), Box::new(value));
    }

    /// Look up a previously attached attribute by name and concrete type.
    pub fn attribute<T: Any + Send>(&self, name: &str) -> Option<&T> {
        self.attributes.get(name).and_then(|v| v.downcast_ref())
    }

    /// Remove a previously attached attribute.
    pub fn remove_attribute(&mut self, name: &str) {
        self.attributes.remove(name);
    }

    /// Reset every field to its unset state for reuse on the next exchange.
    pub fn recycle(&mut self) {
        self.method = None;
        self.target = None;
        self.version = Version::HTTP_11;
        self.fields.clear();
        self.attributes.clear();
        self.handled = false;
        self.dispatcher_type = DispatcherType::Request;
        self.time_stamp = None;
        self.input.recycle();
        self.async_ctx = None;
    }
}
