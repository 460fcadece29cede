//! Generic ref-counted cache with TTL-based background eviction.
//!
//! Keys map to lazily created values. Every `get_or_create` raises the
//! entry's reference count; `release` lowers it. A background sweep removes
//! entries that are both unreferenced and idle for longer than the TTL.
//! Values are handed out as `Arc`s, so an evicted value stays alive for
//! holders that are still reading through it.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::debug;
use parking_lot::{Condvar, Mutex, RwLock, RwLockUpgradableReadGuard};

use crate::{Error, Result};

/// Lower bound for the eviction TTL. Guards against a misconfigured
/// near-zero TTL turning the sweep into a busy loop.
pub const MIN_TTL: Duration = Duration::from_secs(1);

pub struct Cache<K, V> {
    inner: Arc<CacheInner<K, V>>,
    sweeper: Mutex<Option<Sweeper>>,
}

struct CacheInner<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    clock: quanta::Clock,
    ttl: Duration,
    closed: AtomicBool,
}

struct CacheEntry<V> {
    value: Arc<V>,
    ref_count: AtomicI64,
    // raw quanta timestamp of the last get_or_create hit
    last_access: AtomicU64,
}

impl<V> CacheEntry<V> {
    fn new(value: Arc<V>, now: u64) -> Self {
        Self {
            value,
            ref_count: AtomicI64::new(1),
            last_access: AtomicU64::new(now),
        }
    }

    fn touch(&self, now: u64) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
        self.last_access.store(now, Ordering::Release);
    }
}

struct Sweeper {
    signal: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Signals the sweep loop and waits for it to exit, so no sweep can run
    /// once this returns.
    fn stop(self) {
        {
            let mut stopped = self.signal.0.lock();
            *stopped = true;
        }
        self.signal.1.notify_all();
        let _ = self.handle.join();
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a cache whose sweep runs every `ttl / 2`. TTLs below
    /// [`MIN_TTL`] are raised to it.
    pub fn new(ttl: Duration) -> Self {
        let ttl = ttl.max(MIN_TTL);
        let inner = Arc::new(CacheInner {
            entries: RwLock::new(HashMap::new()),
            clock: quanta::Clock::new(),
            ttl,
            closed: AtomicBool::new(false),
        });

        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        let sweep_inner = Arc::clone(&inner);
        let sweep_signal = Arc::clone(&signal);
        let interval = ttl / 2;
        let handle = std::thread::spawn(move || loop {
            {
                let mut stopped = sweep_signal.0.lock();
                if !*stopped {
                    sweep_signal.1.wait_for(&mut stopped, interval);
                }
                if *stopped {
                    break;
                }
            }
            sweep_inner.remove_expired();
        });

        Self {
            inner,
            sweeper: Mutex::new(Some(Sweeper { signal, handle })),
        }
    }

    /// Returns the cached value for `key`, creating it with `factory` if
    /// absent. The entry's reference count is incremented either way.
    ///
    /// At most one factory invocation happens per key, even under
    /// concurrent callers; a factory error inserts nothing.
    pub fn get_or_create<F>(&self, key: K, factory: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Result<V>,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let now = self.inner.clock.raw();

        let entries = self.inner.entries.upgradable_read();
        if let Some(entry) = entries.get(&key) {
            entry.touch(now);
            return Ok(Arc::clone(&entry.value));
        }

        let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
        // another caller may have created the entry while we waited for the
        // write lock
        if let Some(entry) = entries.get(&key) {
            entry.touch(now);
            return Ok(Arc::clone(&entry.value));
        }

        let value = Arc::new(factory()?);
        entries.insert(key, CacheEntry::new(Arc::clone(&value), now));
        Ok(value)
    }

    /// Drops one reference to `key`. Does not evict; it only makes the entry
    /// eligible for a future sweep.
    pub fn release(&self, key: &K) {
        let entries = self.inner.entries.read();
        if let Some(entry) = entries.get(key) {
            entry.ref_count.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Removes and returns the entry for `key` regardless of its reference
    /// count. The caller is responsible for disposing the value.
    pub fn try_remove(&self, key: &K) -> Option<Arc<V>> {
        let mut entries = self.inner.entries.write();
        entries.remove(key).map(|entry| entry.value)
    }

    /// Number of currently cached entries.
    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops the sweep loop, waits for it to exit, and drops every remaining
    /// entry. Idempotent; later operations fail with [`Error::Closed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        self.inner.entries.write().clear();
    }
}

impl<K, V> Drop for Cache<K, V> {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        self.inner.entries.write().clear();
    }
}

impl<K, V> CacheInner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn remove_expired(&self) {
        let now = self.clock.raw();
        let entries = self.entries.upgradable_read();

        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        if expired.is_empty() {
            return;
        }

        let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
        let mut evicted = 0usize;
        for key in expired {
            // a concurrent get_or_create may have revived the entry while we
            // waited for the write lock
            let still_idle = entries
                .get(&key)
                .map(|entry| entry.ref_count.load(Ordering::Acquire) <= 0)
                .unwrap_or(false);
            if still_idle {
                entries.remove(&key);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("cache sweep evicted {evicted} idle entries");
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: u64) -> bool {
        if entry.ref_count.load(Ordering::Acquire) > 0 {
            return false;
        }
        let last = entry.last_access.load(Ordering::Acquire);
        last <= now && self.clock.delta(last, now) >= self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counted {
        id: usize,
    }

    fn counted(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> Result<Counted> + '_ {
        move || {
            let id = counter.fetch_add(1, Ordering::SeqCst);
            Ok(Counted { id })
        }
    }

    #[test]
    fn distinct_keys_create_distinct_values() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache: Cache<u64, Counted> = Cache::new(Duration::from_secs(10));

        let first = cache.get_or_create(1, counted(&counter)).unwrap();
        let second = cache.get_or_create(2, counted(&counter)).unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn same_key_is_created_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache: Cache<u64, Counted> = Cache::new(Duration::from_secs(10));

        let first = cache.get_or_create(1, counted(&counter)).unwrap();
        let second = cache.get_or_create(1, counted(&counter)).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_callers_create_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache: Arc<Cache<u64, Counted>> = Arc::new(Cache::new(Duration::from_secs(10)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    cache.get_or_create(7, counted(&counter)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn factory_error_inserts_nothing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache: Cache<u64, Counted> = Cache::new(Duration::from_secs(10));

        let result = cache.get_or_create(1, || Err(Error::Closed));
        assert!(matches!(result, Err(Error::Closed)));
        assert!(cache.is_empty());

        // the lock was released; a later create succeeds
        cache.get_or_create(1, counted(&counter)).unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn try_remove_ignores_ref_count() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache: Cache<u64, Counted> = Cache::new(Duration::from_secs(10));

        let held = cache.get_or_create(1, counted(&counter)).unwrap();
        let removed = cache.try_remove(&1).expect("entry present");
        assert_eq!(held.id, removed.id);
        assert!(cache.is_empty());
        assert!(cache.try_remove(&1).is_none());

        // holders keep the value alive after removal
        assert_eq!(held.id, 0);
    }

    #[test]
    fn sweep_evicts_released_idle_entries() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache: Cache<u64, Counted> = Cache::new(Duration::from_secs(1));

        cache.get_or_create(1, counted(&counter)).unwrap();
        cache.release(&1);

        std::thread::sleep(Duration::from_millis(2200));
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_keeps_referenced_entries() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache: Cache<u64, Counted> = Cache::new(Duration::from_secs(1));

        let _held = cache.get_or_create(1, counted(&counter)).unwrap();

        std::thread::sleep(Duration::from_millis(2200));
        assert_eq!(cache.len(), 1);

        // still the same instance
        cache.get_or_create(1, counted(&counter)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_stops_operations() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache: Cache<u64, Counted> = Cache::new(Duration::from_secs(10));
        cache.get_or_create(1, counted(&counter)).unwrap();

        cache.close();
        cache.close();

        assert!(matches!(
            cache.get_or_create(2, counted(&counter)),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn ttl_floor_is_applied() {
        let cache: Cache<u64, Counted> = Cache::new(Duration::from_millis(1));
        assert_eq!(cache.inner.ttl, MIN_TTL);
    }
}
