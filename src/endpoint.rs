//! The `Endpoint` boundary: an accepted, duplex transport connection.
//!
//! An external collaborator (the actual socket/TLS session is out of
//! scope per the purpose-and-scope design); grounded on hyper's
//! `AsyncRead + AsyncWrite` bound used throughout `proto::h1::io`, adapted
//! to a blocking, idle-timeout-aware contract since admission here runs on
//! dedicated acceptor threads rather than a reactor.

use std::time::Duration;

use bytes::BytesMut;

use crate::error::Error;

/// One accepted connection, abstracted away from its actual transport
/// (TCP, Unix socket, an in-memory pipe for tests).
pub trait Endpoint: Send {
    /// Fill `buf` with whatever bytes are currently available, blocking up
    /// to the endpoint's current idle timeout. Returns the number of bytes
    /// read; `0` means the peer closed its write side.
    fn fill(&mut self, buf: &mut BytesMut) -> Result<usize, Error>;

    /// Write `data` to the peer.
    fn flush(&mut self, data: &[u8]) -> Result<(), Error>;

    /// Half- or fully-close the connection.
    fn close(&mut self);

    /// Change how long `fill` may block before timing out. The channel
    /// design raises this while a request/response is actively in flight
    /// and restores it afterward (the idle-timeout raise/restore rule).
    fn set_idle_timeout(&mut self, timeout: Duration);

    /// The address of the remote peer, if known, for diagnostics.
    fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        None
    }
}
