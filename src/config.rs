//! `HttpConfig`: the tunable parameters named in the external-interfaces
//! design, assembled with a fluent builder in the shape of hyper's
//! `server::conn::Http` builder.

/// How many acceptor threads a [`Connector`](crate::connector::Connector)
/// should run when [`HttpConfig::acceptor_count`] is left at its default.
fn auto_acceptor_count() -> usize {
    let cores = num_cpus::get();
    (cores / 8).clamp(1, 4)
}

/// Default priority delta (in OS scheduling-priority units, lower is more
/// favorable on most platforms) applied to acceptor threads relative to the
/// worker pool, so a burst of new connections can't starve in-flight
/// request processing.
pub const DEFAULT_ACCEPTOR_PRIORITY_DELTA: i8 = -2;

/// Builder for the tunables that govern idle/blocking timeouts, output
/// buffering, acceptor sizing, and which response headers are set
/// automatically.
///
/// Every setter takes and returns `self` by value, mirroring hyper's
/// `server::conn::Http` builder so the construction idiom stays familiar:
///
/// ```
/// use httpcore::config::HttpConfig;
///
/// let config = HttpConfig::new()
///     .idle_timeout_ms(30_000)
///     .output_aggregation_size(8 * 1024)
///     .send_server_version(false);
/// ```
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub(crate) idle_timeout_ms: u64,
    pub(crate) blocking_timeout_ms: u64,
    pub(crate) min_request_data_rate: u64,
    pub(crate) output_buffer_size: usize,
    pub(crate) output_aggregation_size: usize,
    pub(crate) acceptor_count: Option<usize>,
    pub(crate) acceptor_priority_delta: i8,
    pub(crate) default_protocol: Option<String>,
    pub(crate) max_error_dispatches: u32,
    pub(crate) send_date_header: bool,
    pub(crate) send_server_version: bool,
}

impl HttpConfig {
    /// Start from the defaults: 30s idle timeout, no blocking-read timeout,
    /// no minimum ingress rate, a 32 KiB output buffer aggregated at 8 KiB,
    /// an auto-sized acceptor pool, `Date` and `Server` headers both sent.
    pub fn new() -> HttpConfig {
        HttpConfig {
            idle_timeout_ms: 30_000,
            blocking_timeout_ms: 0,
            min_request_data_rate: 0,
            output_buffer_size: 32 * 1024,
            output_aggregation_size: 8 * 1024,
            acceptor_count: None,
            acceptor_priority_delta: DEFAULT_ACCEPTOR_PRIORITY_DELTA,
            default_protocol: None,
            max_error_dispatches: 4,
            send_date_header: true,
            send_server_version: true,
        }
    }

    /// How long a channel may sit with no read or write activity before it
    /// is closed.
    pub fn idle_timeout_ms(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    /// How long a blocking `HttpInput` read may wait for more bytes before
    /// failing with a timeout. `0` disables the guard.
    pub fn blocking_timeout_ms(mut self, ms: u64) -> Self {
        self.blocking_timeout_ms = ms;
        self
    }

    /// Minimum sustained bytes/sec a request body must arrive at once
    /// reading has started; slower than this fails the exchange with a 408.
    /// `0` disables the guard.
    pub fn min_request_data_rate(mut self, bytes_per_sec: u64) -> Self {
        self.min_request_data_rate = bytes_per_sec;
        self
    }

    /// Total capacity of the response output buffer.
    pub fn output_buffer_size(mut self, bytes: usize) -> Self {
        self.output_buffer_size = bytes;
        self
    }

    /// How large a single write may grow before it is flushed eagerly,
    /// clamped to at most [`HttpConfig::output_buffer_size`].
    pub fn output_aggregation_size(mut self, bytes: usize) -> Self {
        self.output_aggregation_size = bytes;
        self
    }

    /// Fix the number of acceptor threads. Leave unset to auto-size from
    /// the number of available cores (`clamp(cores / 8, 1, 4)`).
    pub fn acceptor_count(mut self, count: usize) -> Self {
        self.acceptor_count = Some(count);
        self
    }

    /// The acceptor thread priority offset applied relative to the worker
    /// pool's default priority.
    pub fn acceptor_priority_delta(mut self, delta: i8) -> Self {
        self.acceptor_priority_delta = delta;
        self
    }

    /// The protocol a bare (ALPN-less) connection is dispatched to.
    pub fn default_protocol<S: Into<String>>(mut self, protocol: S) -> Self {
        self.default_protocol = Some(protocol.into());
        self
    }

    /// How many times a single exchange may re-enter error dispatch before
    /// the connection is forcibly closed, guarding against a handler that
    /// throws from its own error handling.
    pub fn max_error_dispatches(mut self, count: u32) -> Self {
        self.max_error_dispatches = count;
        self
    }

    /// Whether committed responses get an automatic `Date` header.
    pub fn send_date_header(mut self, send: bool) -> Self {
        self.send_date_header = send;
        self
    }

    /// Whether committed responses get an automatic `Server` header.
    pub fn send_server_version(mut self, send: bool) -> Self {
        self.send_server_version = send;
        self
    }

    /// The effective acceptor count: the configured value, or the
    /// auto-sized default if none was set.
    pub fn resolved_acceptor_count(&self) -> usize {
        self.acceptor_count.unwrap_or_else(auto_acceptor_count)
    }
}

impl Default for HttpConfig {
    fn default() -> HttpConfig {
        HttpConfig::new()
    }
}
