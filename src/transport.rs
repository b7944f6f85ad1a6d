//! The `Transport` boundary: how `HttpOutput` hands finished bytes to
//! whatever is actually writing them to the wire.
//!
//! An external collaborator per the purpose-and-scope design (wire framing,
//! TLS, and the socket itself are all out of scope here); grounded on
//! hyper's `AsyncWrite`-based `Buffered<T, B>::flush`/`write_head` split,
//! generalized to a synchronous call contract since the channel's output
//! side is driven by the blocking worker-thread model rather than a poll
//! loop.

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

use crate::error::Error;

/// The status line/header block of a response, handed to [`Transport::send`]
/// exactly once per commit (the response head; see `Response::commit`).
/// `None` on every later `send` call for the same exchange, since the head
/// only goes out once.
#[derive(Clone, Debug)]
pub struct ResponseInfo {
    /// The status sent.
    pub status: StatusCode,
    /// The reason phrase sent (may differ from the status's canonical one).
    pub reason: String,
    /// The declared HTTP version.
    pub version: Version,
    /// The header fields sent.
    pub fields: HeaderMap,
}

/// The call-at-most-once / exactly-once contract `HttpOutput` expects from
/// whatever moves bytes onto the wire (a socket, a TLS session, an
/// in-memory sink for tests).
pub trait Transport: Send {
    /// Send a piece of the response: `info` is the status line/headers,
    /// present exactly once (on the call that commits the response) and
    /// `None` on every other call; `content` is this chunk's (possibly
    /// empty) body bytes; `last` marks the final call for this exchange's
    /// body, whether or not it carries content. May buffer internally;
    /// `completed` establishes durability, not this call returning.
    fn send(&mut self, info: Option<ResponseInfo>, content: Bytes, last: bool) -> Result<(), Error>;

    /// Offer a chunk the transport may choose to send ahead of normal
    /// ordering (used for 1xx informational responses interleaved with a
    /// not-yet-committed final response). Default: same as a mid-stream
    /// `send` (no head, not last). This is not request-push; this engine
    /// has no HTTP/2 framing.
    fn push(&mut self, data: Bytes) -> Result<(), Error> {
        self.send(None, data, false)
    }

    /// Called exactly once, after the last `send`/`push` for this
    /// exchange, once the transport has durably accepted (not necessarily
    /// flushed to the peer) everything written.
    fn completed(&mut self) -> Result<(), Error>;

    /// Called instead of `completed` if the exchange is abandoned (error
    /// dispatch after commit, or the channel is force-closed) — must be
    /// safe to call even if `send` was never invoked.
    fn abort(&mut self, error: &Error);
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// An in-memory `Transport` used by both `io::output`'s unit tests and
    /// the end-to-end scenario tests.
    #[derive(Clone, Default)]
    pub struct MockTransport {
        pub written: Arc<Mutex<Vec<u8>>>,
        pub completed: Arc<Mutex<bool>>,
        pub aborted: Arc<Mutex<Option<String>>>,
        pub send_calls: Arc<Mutex<u32>>,
        pub head: Arc<Mutex<Option<ResponseInfo>>>,
    }

    impl MockTransport {
        pub fn new() -> MockTransport {
            MockTransport::default()
        }

        pub fn contents(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }

        /// The `ResponseInfo` handed to the most recent `send` call that
        /// carried one, if any.
        pub fn head(&self) -> Option<ResponseInfo> {
            self.head.lock().unwrap().clone()
        }
    }

    impl Transport for MockTransport {
        fn send(&mut self, info: Option<ResponseInfo>, content: Bytes, _last: bool) -> Result<(), Error> {
            *self.send_calls.lock().unwrap() += 1;
            if let Some(info) = info {
                *self.head.lock().unwrap() = Some(info);
            }
            self.written.lock().unwrap().extend_from_slice(&content);
            Ok(())
        }

        fn completed(&mut self) -> Result<(), Error> {
            *self.completed.lock().unwrap() = true;
            Ok(())
        }

        fn abort(&mut self, error: &Error) {
            *self.aborted.lock().unwrap() = Some(error.to_string());
        }
    }
}
