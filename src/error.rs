//! Error and Result types for the connection engine.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// A specialized `Result` for this crate's fallible operations.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// An error raised while admitting a connection or servicing a request.
///
/// This is deliberately opaque: match on the `is_*()` predicates or the
/// [`status_code`](Error::status_code) hint rather than on a public enum,
/// so new failure kinds can be added without breaking callers.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// Malformed request; carries the status the channel should answer with.
    BadMessage { status: u16, reason: &'static str },
    /// 404/503, permanent/temporary unavailability raised by the handler chain.
    Unavailable { permanent: bool },
    /// Peer closed mid-body.
    EarlyEof,
    /// Idle or async-dispatch timeout fired.
    Timeout,
    /// Underlying transport I/O failure.
    Io,
    /// The connector, registry, or acceptor pool was asked to mutate state
    /// while running.
    InvalidState,
    /// The response was already committed; a second `sendResponse` call for
    /// a non-informational response was rejected.
    AlreadyCommitted,
    /// Any other failure (maps to an internal-error dispatch).
    Internal,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with_cause<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn bad_message(status: u16, reason: &'static str) -> Error {
        Error::new(Kind::BadMessage { status, reason })
    }

    pub(crate) fn unavailable(permanent: bool) -> Error {
        Error::new(Kind::Unavailable { permanent })
    }

    pub(crate) fn early_eof() -> Error {
        Error::new(Kind::EarlyEof)
    }

    pub(crate) fn timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn invalid_state() -> Error {
        Error::new(Kind::InvalidState)
    }

    pub(crate) fn already_committed() -> Error {
        Error::new(Kind::AlreadyCommitted)
    }

    pub(crate) fn internal<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Internal).with_cause(cause)
    }

    /// Reconstructs an `Error` from a bare status code, for surfaces (like
    /// `ChannelState::on_error`) that only ever stashed the status, not the
    /// original cause.
    pub(crate) fn from_status(status: u16) -> Error {
        if status == 500 {
            Error::new(Kind::Internal)
        } else {
            Error::new(Kind::BadMessage { status, reason: "" })
        }
    }

    /// True if this was a malformed-request error.
    pub fn is_bad_message(&self) -> bool {
        matches!(self.inner.kind, Kind::BadMessage { .. })
    }

    /// True if this represents the handler chain being unavailable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self.inner.kind, Kind::Unavailable { .. })
    }

    /// True if the peer closed the connection mid-body.
    pub fn is_early_eof(&self) -> bool {
        matches!(self.inner.kind, Kind::EarlyEof)
    }

    /// True if this was an idle or async-dispatch timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    /// True if a mutating call was made on a running registry/connector.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidState)
    }

    /// True if a response was already committed when this error occurred.
    pub fn is_already_committed(&self) -> bool {
        matches!(self.inner.kind, Kind::AlreadyCommitted)
    }

    /// The HTTP status an uncommitted response should be answered with, if
    /// this error kind implies one (per the error-handling design's
    /// kind-to-status mapping).
    pub fn status_code(&self) -> u16 {
        match self.inner.kind {
            Kind::BadMessage { status, .. } => status,
            Kind::Unavailable { permanent: true } => 404,
            Kind::Unavailable { permanent: false } => 503,
            Kind::Timeout => 500,
            Kind::EarlyEof | Kind::Io | Kind::Internal | Kind::InvalidState => 500,
            Kind::AlreadyCommitted => 500,
        }
    }

    pub(crate) fn reason_phrase(&self) -> &'static str {
        match self.inner.kind {
            Kind::BadMessage { reason, .. } => reason,
            _ => "Internal Server Error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("Error");
        dbg.field("kind", &self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            dbg.field("cause", cause);
        }
        dbg.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::BadMessage { status, reason } => write!(f, "bad message ({}): {}", status, reason),
            Kind::Unavailable { permanent } => write!(
                f,
                "handler unavailable ({})",
                if permanent { "permanent" } else { "temporary" }
            ),
            Kind::EarlyEof => f.write_str("peer closed connection before body completed"),
            Kind::Timeout => f.write_str("timed out"),
            Kind::Io => f.write_str("transport I/O error"),
            Kind::InvalidState => f.write_str("invalid state for this operation"),
            Kind::AlreadyCommitted => f.write_str("response already committed"),
            Kind::Internal => f.write_str("internal error"),
        }?;
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|c| &**c as _)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Error::early_eof()
        } else {
            Error::new(Kind::Io).with_cause(e)
        }
    }
}
