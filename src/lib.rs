#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # httpcore
//!
//! A blocking-thread HTTP/1.1 server engine core: per-connection channel
//! state machines, a pluggable connection-factory registry, and an
//! acceptor thread pool, sitting behind abstract [`Endpoint`],
//! [`Transport`], and [`handler::Handler`] boundaries so wire parsing, the
//! listening socket, and application logic are all supplied by the
//! embedder.
//!
//! ## Shape
//!
//! - [`connector`] — [`connector::Connector`], [`connector::registry::Registry`],
//!   and the acceptor pool that admits connections and dispatches them by
//!   protocol name.
//! - [`channel`] — one HTTP exchange's request/response state and the
//!   action loop (`channel::channel::Channel`) that drives it through
//!   dispatch, async re-entry, and error handling
//!   ([`channel::state::ChannelState`]).
//! - [`io`] — the request body read side ([`io::input::HttpInput`]) and
//!   response body write side ([`io::output::HttpOutput`]), including the
//!   output interceptor chain ([`io::interceptor`]).
//! - [`request`] / [`response`] — the per-exchange data model.
//! - [`handler`] — the servlet-style handler chain an embedder plugs
//!   application logic into.
//! - [`endpoint`] / [`transport`] — the duplex-connection and egress-sink
//!   boundaries.
//! - [`buffer`], [`scheduler`], [`date`], [`exec`], [`config`] — the shared
//!   ambient infrastructure: a sharded buffer pool, a single timer/`Date`
//!   scheduler thread, an executor abstraction (with an optional built-in
//!   thread pool behind the `runtime` feature), and the `HttpConfig`
//!   tunables builder.
//!
//! ## Non-goals
//!
//! This crate does not parse HTTP/1.x bytes off the wire, own a listening
//! socket, or provide TLS. Those sit on the other side of [`Endpoint`],
//! [`Transport`], and [`connector::registry::ConnectionFactory`] —
//! supplied by whatever embeds this engine.

pub use crate::error::{Error, Result};

pub mod buffer;
pub mod channel;
pub mod config;
pub mod connector;
pub mod date;
mod error;
pub mod endpoint;
pub mod exec;
pub mod handler;
pub mod io;
pub mod request;
pub mod response;
pub mod scheduler;
pub mod transport;
