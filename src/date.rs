//! Cached `Date` header value, refreshed about once a second.
//!
//! Grounded on hyper's `proto::h1::date` cache, which avoids formatting a
//! timestamp on every response by keeping a thread-local buffer and checking
//! a wall-clock deadline before reformatting. This crate's scheduler thread
//! (`scheduler.rs`) is shared across every channel on a `Connector`, so the
//! cache here is a single `Arc`-swapped value rather than thread-local:
//! `tick()` is called once a second by the scheduler, and every channel
//! reads the current value through a cheap `Arc` clone.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// A cell holding the most recently formatted RFC 7231 `Date` header value.
pub struct DateCache {
    value: Mutex<Arc<str>>,
    last_epoch_secs: AtomicU64,
}

impl fmt::Debug for DateCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DateCache").field("value", &self.value()).finish()
    }
}

impl DateCache {
    /// Create a cache pre-populated with the current time.
    pub fn new() -> DateCache {
        let cache = DateCache {
            value: Mutex::new(Arc::from(String::new())),
            last_epoch_secs: AtomicU64::new(u64::MAX),
        };
        cache.tick();
        cache
    }

    /// Recompute the cached value if at least a second has passed since the
    /// last tick. Safe to call more often than once a second; cheap no-op
    /// otherwise.
    pub fn tick(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if self.last_epoch_secs.swap(now, Ordering::SeqCst) == now {
            return;
        }
        let formatted = httpdate::fmt_http_date(UNIX_EPOCH + std::time::Duration::from_secs(now));
        let mut guard = self.value.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::from(formatted);
    }

    /// The current cached `Date` header value.
    pub fn value(&self) -> Arc<str> {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for DateCache {
    fn default() -> DateCache {
        DateCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cache_has_well_formed_http_date() {
        let cache = DateCache::new();
        let v = cache.value();
        // e.g. "Sun, 06 Nov 1994 08:49:37 GMT"
        assert_eq!(v.len(), 29);
        assert!(v.ends_with("GMT"));
    }

    #[test]
    fn tick_within_same_second_is_idempotent() {
        let cache = DateCache::new();
        let a = cache.value();
        cache.tick();
        let b = cache.value();
        assert_eq!(&*a, &*b);
    }
}
