//! Keyring cache keyed by derivation URI.
//!
//! Reconstructing an sr25519 keypair from a mnemonic costs a PBKDF2 run and
//! a hard derivation, so signing paths look keypairs up here instead. The
//! cache lives for the process lifetime and is unbounded unless
//! [`CacheConfig::max_entries`] is set, in which case the least recently
//! used entry is evicted.
//!
//! Cache keys embed the seed phrase, so the cache never prints them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::Keyring;
use crate::error::Result;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the keyring cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached keyrings. `None` leaves the cache unbounded.
    pub max_entries: Option<usize>,
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters for cache activity.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: AtomicU64,
    /// Lookups that had to derive a keyring.
    pub misses: AtomicU64,
    /// Keyrings inserted.
    pub inserts: AtomicU64,
    /// Keyrings evicted by the LRU bound.
    pub evictions: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that had to derive a keyring.
    pub misses: u64,
    /// Keyrings inserted.
    pub inserts: u64,
    /// Keyrings evicted by the LRU bound.
    pub evictions: u64,
}

// =============================================================================
// Cache
// =============================================================================

struct CacheEntry {
    keyring: Arc<Keyring>,
    last_used: Instant,
}

impl CacheEntry {
    fn new(keyring: Arc<Keyring>) -> Self {
        Self {
            keyring,
            last_used: Instant::now(),
        }
    }

    fn touch(&mut self) -> Arc<Keyring> {
        self.last_used = Instant::now();
        Arc::clone(&self.keyring)
    }
}

/// Process-wide memo of reconstructed keyrings.
pub struct KeyringCache {
    entries: DashMap<String, CacheEntry>,
    config: CacheConfig,
    stats: CacheStats,
}

impl KeyringCache {
    /// Create a cache with the given configuration.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            stats: CacheStats::default(),
        }
    }

    /// Return the keyring for `uri`, deriving and caching it on a miss.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDerivationInput`](crate::Error::InvalidDerivationInput)
    /// if `uri` cannot be turned into a keyring. Failures are not cached.
    pub fn get_or_create(&self, uri: &str) -> Result<Arc<Keyring>> {
        self.get_or_create_with(uri, Keyring::from_uri)
    }

    /// Like [`get_or_create`](Self::get_or_create) with a custom derivation.
    ///
    /// `derive` runs while the entry is locked, so concurrent callers for the
    /// same URI derive once.
    ///
    /// # Errors
    ///
    /// Propagates the error returned by `derive`.
    pub fn get_or_create_with<F>(&self, uri: &str, derive: F) -> Result<Arc<Keyring>>
    where
        F: FnOnce(&str) -> Result<Keyring>,
    {
        if let Some(mut entry) = self.entries.get_mut(uri) {
            self.stats.record_hit();
            return Ok(entry.touch());
        }

        // Eviction walks every shard, so it must happen before the entry
        // lock below is taken.
        if let Some(max) = self.config.max_entries
            && self.entries.len() >= max
        {
            self.evict_lru();
        }

        match self.entries.entry(uri.to_owned()) {
            Entry::Occupied(mut occupied) => {
                self.stats.record_hit();
                Ok(occupied.get_mut().touch())
            }
            Entry::Vacant(vacant) => {
                self.stats.record_miss();
                let keyring = Arc::new(derive(uri)?);
                vacant.insert(CacheEntry::new(Arc::clone(&keyring)));
                self.stats.record_insert();
                debug!(pkh = %keyring.pkh(), "keyring cached");
                Ok(keyring)
            }
        }
    }

    /// Drop every cached keyring.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached keyrings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the cache counters.
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    fn evict_lru(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().last_used)
            .map(|e| e.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.stats.record_eviction();
        }
    }
}

impl Default for KeyringCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl std::fmt::Debug for KeyringCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyringCache")
            .field("len", &self.entries.len())
            .field("config", &self.config)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
