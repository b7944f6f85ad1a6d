//! Shared interceptor-chain plumbing used by both `HttpInput` and
//! `HttpOutput`.
//!
//! Grounded on hyper's `Buffered<T, B>`, which layers a single transform
//! (vectored-write aggregation) between the connection and the socket;
//! here the chain is generalized to an arbitrary ordered list of
//! transforms, since the design calls for embedder-supplied content
//! interceptors (e.g. decompression, chunked framing) stacked in a fixed
//! order on both the read and write sides.

use std::fmt;

use bytes::Bytes;

use crate::error::Error;

/// A single link in an input or output interceptor chain.
///
/// Implementations see bytes flow through exactly once, in the order the
/// chain is built, and may transform, split, or buffer across calls.
pub trait Interceptor: Send {
    /// Transform a chunk of content moving through this link. `last` marks
    /// the final chunk of the stream; an interceptor that buffers across
    /// calls must flush everything it's holding once `last` is true, since
    /// no further chunk will arrive to prompt it.
    ///
    /// `None` signals that this link has no more output for the current
    /// chunk and the pipeline should ask it again after upstream makes
    /// progress (used by interceptors that buffer, e.g. a dechunker
    /// waiting on more input to complete a chunk boundary).
    fn intercept(&mut self, content: Bytes, last: bool) -> Result<Option<Bytes>, Error>;
}

/// An ordered stack of interceptors, exhausted front-to-back.
///
/// Exhaustion rule (per the HTTP Input design): a chain that returns
/// `Ok(None)` from its last-added interceptor without producing bytes is
/// not itself EOF; EOF is only signaled by the underlying source.
pub struct Chain {
    links: Vec<Box<dyn Interceptor>>,
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain").field("links", &self.links.len()).finish()
    }
}

impl Chain {
    /// An empty chain: content passes through unmodified.
    pub fn new() -> Chain {
        Chain { links: Vec::new() }
    }

    /// Append an interceptor to the end of the chain (applied last).
    pub fn push(&mut self, interceptor: Box<dyn Interceptor>) {
        self.links.push(interceptor);
    }

    /// True if no interceptors have been installed.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Run `content` through every link in order, short-circuiting if any
    /// link has no output yet. `last` is passed to every link unchanged —
    /// it marks the end of the whole stream, not of any one link's output.
    pub fn run(&mut self, mut content: Bytes, last: bool) -> Result<Option<Bytes>, Error> {
        for link in &mut self.links {
            match link.intercept(content, last)? {
                Some(next) => content = next,
                None => return Ok(None),
            }
        }
        Ok(Some(content))
    }
}

impl Default for Chain {
    fn default() -> Chain {
        Chain::new()
    }
}
