//! Process-wide TTL cache for reputation verdicts.
//!
//! An explicit service object instead of ambient module state: the clock is
//! injected so tests can expire entries without sleeping, and the cache
//! lifecycle is bounded to whatever owns it (normally the engine).

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lru::LruCache;
use parking_lot::Mutex;

/// Default TTL for reputation lookups: 8 hours.
pub const DEFAULT_REPUTATION_TTL: Duration = Duration::from_secs(8 * 3600);

/// Default entry capacity.
pub const DEFAULT_CACHE_SIZE: usize = 4096;

/// Time source abstraction.
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<SystemTime>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(SystemTime::UNIX_EPOCH),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

/// Bounded cache whose entries expire after a fixed TTL.
///
/// Expiry is lazy: an expired entry is evicted on the lookup that finds it
/// and never returned. Shared across requests; the inner mutex makes every
/// operation atomic per cache instance.
pub struct TtlCache<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, (V, SystemTime)>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<K: Hash + Eq, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            clock,
        }
    }

    /// Live value for `key`, or `None` when absent or expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let expired = match inner.get(key) {
            Some((value, inserted_at)) => {
                let age = now.duration_since(*inserted_at).unwrap_or(Duration::ZERO);
                if age < self.ttl {
                    return Some(value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            inner.pop(key);
        }
        None
    }

    /// Insert or refresh `key`, stamping it with the current time.
    pub fn put(&self, key: K, value: V) {
        let now = self.clock.now();
        self.inner.lock().put(key, (value, now));
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
