//! The per-connection HTTP channel: its action loop (`channel`) and the
//! dispatch/async-mode state machine driving it (`state`).
//!
//! Grounded on hyper's `proto::h1::{Conn, Dispatcher}` pair — `Conn` owns
//! the raw read/write state machine, `Dispatcher` owns the loop that
//! drives it and hands finished messages to the service — generalized from
//! hyper's always-polled, always-async model to one where a worker thread
//! runs the loop to completion or an explicit `WAIT`, and the loop may be
//! resumed later by a different thread (an async dispatch, a timeout fire,
//! a read/write-ready notification).

pub mod async_context;
pub mod channel;
pub mod state;
