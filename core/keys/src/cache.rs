//! Bounded, evictable cache of unsealed root keys.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use vaultline_common::{OrgId, RootKeyId};
use vaultline_crypto::RootKey;

struct CacheEntry {
    org: OrgId,
    key: RootKey,
    inserted_at: Instant,
}

/// In-process cache of root key material.
///
/// Entries expire after `ttl`. When full, the oldest entry is evicted. Data
/// keys are never cached here.
pub struct RootKeyCache {
    entries: Mutex<HashMap<RootKeyId, CacheEntry>>,
    capacity: usize,
    ttl: Duration,
}

impl RootKeyCache {
    /// Create a cache holding at most `capacity` keys for `ttl` each.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    // A poisoned lock only means another thread panicked mid-insert; the map
    // itself is still a valid cache.
    fn lock(&self) -> MutexGuard<'_, HashMap<RootKeyId, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fetch a live key.
    pub fn get(&self, id: &RootKeyId) -> Option<RootKey> {
        let mut entries = self.lock();
        match entries.get(id) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => Some(entry.key.clone()),
            Some(_) => {
                entries.remove(id);
                debug!(root_key = %id, "Root key cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Insert or refresh a key.
    pub fn insert(&self, org: &OrgId, id: RootKeyId, key: RootKey) {
        let mut entries = self.lock();
        if !entries.contains_key(&id) && entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(id, _)| *id);
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            id,
            CacheEntry {
                org: org.clone(),
                key,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Evict one key.
    pub fn invalidate_key(&self, id: &RootKeyId) {
        self.lock().remove(id);
    }

    /// Evict every key belonging to an organization.
    pub fn invalidate_org(&self, org: &OrgId) {
        self.lock().retain(|_, e| &e.org != org);
    }

    /// Evict everything.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of cached entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for RootKeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootKeyCache")
            .field("entries", &self.len())
            .field("capacity", &self.capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}
