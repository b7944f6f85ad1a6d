//! The connection-factory registry: which protocol a newly accepted
//! connection is dispatched to.
//!
//! Grounded on hyper's per-protocol `server::conn::{http1, http2}` builder
//! split, generalized into a runtime-mutable, name-keyed registry (rather
//! than a compile-time `cfg`-gated choice) since the system overview calls
//! for pluggable `ConnectionFactory` registration, protocol-name lookup,
//! and a configurable default protocol for ALPN-less connections.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::endpoint::Endpoint;
use crate::error::Error;

/// Something a `ConnectionFactory` hands back for a newly accepted
/// connection: whatever drives that connection's protocol to completion.
pub trait Connection: Send {
    /// Service the connection until it closes or its protocol hands off
    /// to something else (e.g. a `channel::state` upgrade).
    fn service(&mut self) -> Result<(), Error>;
}

/// Produces a `Connection` for a given accepted `Endpoint`, for one named
/// protocol.
pub trait ConnectionFactory: Send + Sync {
    /// The protocol name this factory answers to, compared
    /// case-insensitively (e.g. `"http/1.1"`).
    fn protocol(&self) -> &str;

    /// Build the connection driver for a freshly accepted endpoint.
    fn new_connection(&self, endpoint: Box<dyn Endpoint>) -> Box<dyn Connection>;

    /// Narrow to a concrete factory type, for `Registry::get_as`'s
    /// capability-lookup pattern.
    fn as_any(&self) -> &dyn Any;
}

struct Entry {
    key: String,
    factory: Box<dyn ConnectionFactory>,
}

struct Inner {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    default_protocol: Option<String>,
}

/// An insertion-order-preserving, case-insensitive-keyed table of
/// `ConnectionFactory`s.
///
/// Mutating methods refuse to run once the owning connector has started
/// accepting connections (`running` is shared with the connector so both
/// sides observe the same flag).
pub struct Registry {
    inner: Mutex<Inner>,
    running: std::sync::Arc<AtomicBool>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Registry")
            .field("protocols", &inner.entries.iter().map(|e| &e.key).collect::<Vec<_>>())
            .field("default_protocol", &inner.default_protocol)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl Registry {
    /// A registry sharing its "is the connector running" flag with the
    /// connector that owns it.
    pub(crate) fn new(running: std::sync::Arc<AtomicBool>) -> Registry {
        Registry {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                index: HashMap::new(),
                default_protocol: None,
            }),
            running,
        }
    }

    fn guard_mutation(&self) -> Result<(), Error> {
        if self.running.load(Ordering::SeqCst) {
            Err(Error::invalid_state())
        } else {
            Ok(())
        }
    }

    /// Append a factory, replacing any existing entry for the same
    /// (case-insensitively compared) protocol name in place.
    ///
    /// If no default protocol is currently set (either never set, or
    /// cleared because the previous default was removed), a newly
    /// *inserted* (not replaced) entry becomes the default — "defaults to
    /// the first inserted factory on next insert" per the registry design.
    pub fn add(&self, factory: Box<dyn ConnectionFactory>) -> Result<(), Error> {
        self.guard_mutation()?;
        let key = factory.protocol().to_ascii_lowercase();
        let mut inner = self.lock();
        if let Some(&idx) = inner.index.get(&key) {
            inner.entries[idx].factory = factory;
        } else {
            let idx = inner.entries.len();
            inner.entries.push(Entry { key: key.clone(), factory });
            inner.index.insert(key.clone(), idx);
            if inner.default_protocol.is_none() {
                inner.default_protocol = Some(key);
            }
        }
        Ok(())
    }

    /// Insert a factory ahead of every existing entry, and make it the
    /// default protocol unconditionally — `addFirst` is how a negotiated
    /// (e.g. ALPN) factory displaces whatever was previously preferred.
    pub fn add_first(&self, factory: Box<dyn ConnectionFactory>) -> Result<(), Error> {
        self.guard_mutation()?;
        let key = factory.protocol().to_ascii_lowercase();
        let mut inner = self.lock();
        inner.entries.retain(|e| e.key != key);
        inner.entries.insert(0, Entry { key: key.clone(), factory });
        rebuild_index(&mut inner);
        inner.default_protocol = Some(key);
        Ok(())
    }

    /// Add a factory only if no entry is already registered for its
    /// protocol name.
    pub fn add_if_absent(&self, factory: Box<dyn ConnectionFactory>) -> Result<(), Error> {
        self.guard_mutation()?;
        let key = factory.protocol().to_ascii_lowercase();
        let mut inner = self.lock();
        if inner.index.contains_key(&key) {
            return Ok(());
        }
        let idx = inner.entries.len();
        inner.entries.push(Entry { key: key.clone(), factory });
        inner.index.insert(key.clone(), idx);
        if inner.default_protocol.is_none() {
            inner.default_protocol = Some(key);
        }
        Ok(())
    }

    /// Remove the entry for `protocol`, if any. If it was the default
    /// protocol, the default is cleared too (orphan detachment).
    pub fn remove(&self, protocol: &str) -> Result<(), Error> {
        self.guard_mutation()?;
        let key = protocol.to_ascii_lowercase();
        let mut inner = self.lock();
        inner.entries.retain(|e| e.key != key);
        rebuild_index(&mut inner);
        if inner.default_protocol.as_deref() == Some(key.as_str()) {
            inner.default_protocol = None;
        }
        Ok(())
    }

    /// Replace the entire table, in the given order.
    pub fn set_all(&self, factories: Vec<Box<dyn ConnectionFactory>>) -> Result<(), Error> {
        self.guard_mutation()?;
        let mut inner = self.lock();
        inner.entries.clear();
        inner.index.clear();
        for factory in factories {
            let key = factory.protocol().to_ascii_lowercase();
            let idx = inner.entries.len();
            inner.entries.push(Entry { key: key.clone(), factory });
            inner.index.insert(key, idx);
        }
        if let Some(ref default) = inner.default_protocol {
            if !inner.index.contains_key(default) {
                inner.default_protocol = None;
            }
        }
        Ok(())
    }

    /// Remove every entry and clear the default protocol.
    pub fn clear(&self) -> Result<(), Error> {
        self.guard_mutation()?;
        let mut inner = self.lock();
        inner.entries.clear();
        inner.index.clear();
        inner.default_protocol = None;
        Ok(())
    }

    /// Protocol names, in insertion order.
    pub fn protocols(&self) -> Vec<String> {
        self.lock().entries.iter().map(|e| e.key.clone()).collect()
    }

    /// Whether a factory is registered for `protocol` (case-insensitive).
    pub fn contains(&self, protocol: &str) -> bool {
        self.lock().index.contains_key(&protocol.to_ascii_lowercase())
    }

    /// Run `f` against the first registered factory, in insertion order,
    /// whose concrete type downcasts to `T` — `get(classCapability)` in
    /// the registry design, used to find e.g. "whichever factory
    /// implements TLS/ALPN negotiation" without the caller needing to
    /// know its protocol name. `None` if no registered factory is a `T`.
    pub fn with_as<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.lock();
        inner
            .entries
            .iter()
            .find_map(|e| e.factory.as_any().downcast_ref::<T>())
            .map(f)
    }

    /// Set which protocol a bare connection (no ALPN/preface sniffing)
    /// should be dispatched to. Must already be registered.
    pub fn set_default_protocol(&self, protocol: &str) -> Result<(), Error> {
        self.guard_mutation()?;
        let key = protocol.to_ascii_lowercase();
        let mut inner = self.lock();
        if !inner.index.contains_key(&key) {
            return Err(Error::invalid_state());
        }
        inner.default_protocol = Some(key);
        Ok(())
    }

    /// The currently configured default protocol, if any and if it's
    /// still registered.
    pub fn default_protocol(&self) -> Option<String> {
        let inner = self.lock();
        inner.default_protocol.clone().filter(|p| inner.index.contains_key(p))
    }

    /// Build a connection for `endpoint` using the named protocol's
    /// factory, or the default protocol's if `protocol` is `None`.
    pub fn dispatch(
        &self,
        protocol: Option<&str>,
        endpoint: Box<dyn Endpoint>,
    ) -> Result<Box<dyn Connection>, Error> {
        let inner = self.lock();
        let key = match protocol {
            Some(p) => p.to_ascii_lowercase(),
            None => inner
                .default_protocol
                .clone()
                .ok_or_else(Error::invalid_state)?,
        };
        let idx = *inner.index.get(&key).ok_or_else(Error::invalid_state)?;
        Ok(inner.entries[idx].factory.new_connection(endpoint))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn rebuild_index(inner: &mut Inner) {
    inner.index.clear();
    for (idx, entry) in inner.entries.iter().enumerate() {
        inner.index.insert(entry.key.clone(), idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Stub(&'static str);
    struct StubConn;
    impl Connection for StubConn {
        fn service(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }
    impl ConnectionFactory for Stub {
        fn protocol(&self) -> &str {
            self.0
        }
        fn new_connection(&self, _endpoint: Box<dyn Endpoint>) -> Box<dyn Connection> {
            Box::new(StubConn)
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn registry() -> Registry {
        Registry::new(Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn keys_are_case_insensitively_lowercased() {
        let r = registry();
        r.add(Box::new(Stub("HTTP/1.1"))).unwrap();
        assert_eq!(r.protocols(), vec!["http/1.1".to_string()]);
    }

    #[test]
    fn insertion_order_is_preserved() {
        let r = registry();
        r.add(Box::new(Stub("a"))).unwrap();
        r.add(Box::new(Stub("b"))).unwrap();
        r.add(Box::new(Stub("c"))).unwrap();
        assert_eq!(r.protocols(), vec!["a", "b", "c"]);
    }

    #[test]
    fn add_first_puts_entry_ahead_of_the_rest() {
        let r = registry();
        r.add(Box::new(Stub("a"))).unwrap();
        r.add_first(Box::new(Stub("b"))).unwrap();
        assert_eq!(r.protocols(), vec!["b", "a"]);
    }

    #[test]
    fn add_if_absent_does_not_clobber_an_existing_entry() {
        let r = registry();
        r.add(Box::new(Stub("a"))).unwrap();
        r.add_if_absent(Box::new(Stub("a"))).unwrap();
        assert_eq!(r.protocols(), vec!["a"]);
    }

    #[test]
    fn removing_the_default_protocol_clears_it() {
        let r = registry();
        r.add(Box::new(Stub("a"))).unwrap();
        r.set_default_protocol("a").unwrap();
        r.remove("a").unwrap();
        assert_eq!(r.default_protocol(), None);
    }

    #[test]
    fn scenario_s5_add_first_becomes_default_then_reverts_on_removal() {
        let r = registry();
        r.add(Box::new(Stub("http/1.1"))).unwrap();
        assert_eq!(r.default_protocol().as_deref(), Some("http/1.1"));

        r.add_first(Box::new(Stub("alpn"))).unwrap();
        assert_eq!(r.default_protocol().as_deref(), Some("alpn"));

        r.remove("alpn").unwrap();
        assert_eq!(r.default_protocol(), None);

        r.add(Box::new(Stub("h2c"))).unwrap();
        assert_eq!(r.default_protocol().as_deref(), Some("h2c"));
    }

    #[test]
    fn with_as_finds_the_first_factory_of_a_concrete_type() {
        let r = registry();
        r.add(Box::new(Stub("a"))).unwrap();
        r.add(Box::new(Stub("b"))).unwrap();
        let found = r.with_as::<Stub, _>(|s| s.0);
        assert_eq!(found, Some("a"));
        assert_eq!(r.with_as::<StubConn, _>(|_| ()), None);
    }

    #[test]
    fn mutation_while_running_is_rejected() {
        let running = Arc::new(AtomicBool::new(true));
        let r = Registry::new(running);
        let err = r.add(Box::new(Stub("a"))).unwrap_err();
        assert!(err.is_invalid_state());
    }

    #[test]
    fn dispatch_uses_the_default_when_no_protocol_is_named() {
        let r = registry();
        r.add(Box::new(Stub("a"))).unwrap();
        r.set_default_protocol("a").unwrap();
        let endpoint = Box::new(crate::endpoint::mock::MockEndpoint::with_script(b""));
        assert!(r.dispatch(None, endpoint).is_ok());
    }

    #[test]
    fn dispatch_with_no_matching_protocol_is_invalid_state() {
        let r = registry();
        let endpoint = Box::new(crate::endpoint::mock::MockEndpoint::with_script(b""));
        let err = r.dispatch(Some("nope"), endpoint).unwrap_err();
        assert!(err.is_invalid_state());
    }
}
