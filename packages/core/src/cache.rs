//! Key/value cache with per-entry expiry.
//!
//! Expiry is always checked on access, so an expired entry is invisible to
//! `get`/`has` even before it is physically removed. [`ExpiringCache::sweep`]
//! and the optional background [`Sweeper`] only reclaim memory.
//!
//! A non-positive TTL means the entry never expires.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::sync::lock;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

fn expiry_from(ttl: Option<Duration>) -> Option<Instant> {
    ttl.filter(|ttl| !ttl.is_zero())
        .and_then(|ttl| Instant::now().checked_add(ttl))
}

fn ttl_from_ms(ttl_ms: i64) -> Option<Duration> {
    (ttl_ms > 0).then(|| Duration::from_millis(ttl_ms as u64))
}

/// Concurrent cache with lazy and optional active expiry.
#[derive(Debug)]
pub struct ExpiringCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V> Default for ExpiringCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone> ExpiringCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`. `None` or a zero TTL never expires.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        lock(&self.entries).insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: expiry_from(ttl),
            },
        );
    }

    /// [`set`](Self::set) with a script-style TTL in milliseconds.
    pub fn set_ms(&self, key: impl Into<String>, value: V, ttl_ms: i64) {
        self.set(key, value, ttl_from_ms(ttl_ms));
    }

    /// The live value under `key`. Expired entries are evicted on the way.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn has(&self, key: &str) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(entry) if entry.is_live(Instant::now()) => true,
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Rewrite the expiry of a live entry, leaving its value alone.
    ///
    /// Returns whether an entry was updated; a missing or already expired
    /// key is left absent.
    pub fn expire(&self, key: &str, ttl: Option<Duration>) -> bool {
        let mut entries = lock(&self.entries);
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = expiry_from(ttl);
                true
            }
            Some(_) => {
                entries.remove(key);
                false
            }
            None => false,
        }
    }

    pub fn expire_ms(&self, key: &str, ttl_ms: i64) -> bool {
        self.expire(key, ttl_from_ms(ttl_ms))
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut entries = lock(&self.entries);
        let entry = entries.remove(key)?;
        entry.is_live(Instant::now()).then_some(entry.value)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.entries)
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Physically remove expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        before - entries.len()
    }
}

impl<V: Clone + Send + 'static> ExpiringCache<V> {
    /// Start a background thread that sweeps every `interval`.
    ///
    /// The thread holds only a weak reference and exits once the cache is
    /// dropped or the returned [`Sweeper`] is stopped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> Result<Sweeper> {
        if interval.is_zero() {
            return Err(Error::illegal_state("sweep interval must be positive"));
        }

        let (stop, stopped) = mpsc::channel::<()>();
        let cache: Weak<Self> = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("capbridge-cache-sweeper".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "swept expired cache entries");
                }
            })
            .map_err(|e| Error::upstream("spawn cache sweeper", e))?;

        Ok(Sweeper {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

/// Stops a background sweep thread on [`stop`](Sweeper::stop) or drop.
/// Stopping wakes the thread at once rather than after its interval.
#[derive(Debug)]
pub struct Sweeper {
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Sweeper {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the channel the thread waits on.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
