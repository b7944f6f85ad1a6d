//! Connection admission: the connection-factory registry, the acceptor
//! thread pool, and the `Connector` that ties them together with a buffer
//! pool, an executor, and a scheduler.
//!
//! Grounded on hyper's `server::server::Server`/`Builder` (the `Accept`-
//! driven admission loop) and `server::conn::http1`'s per-protocol
//! connection builder, generalized from "one listener, one protocol" to
//! the registry-driven, multi-protocol dispatch the system overview calls
//! for.

pub mod acceptor;
pub mod connector;
pub mod registry;
