//! # Read Cache
//!
//! LRU read-through cache in front of the profile store.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         CACHE COHERENCE                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  reader                              writer                             │
//! │  ──────                              ──────                             │
//! │  miss                                                                   │
//! │  load (snapshot @ gen g)                                                │
//! │                                      commit, gen := g+1  (db lock)      │
//! │                                      invalidate touched keys            │
//! │  insert only if gen == g  ✗ skipped                                     │
//! │                                                                         │
//! │  Entries are filed under the lookup address; every identifier of the   │
//! │  lookup and of the record found is an alias pointing back at them, so  │
//! │  invalidating any identifier drops every entry that depended on it.    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Absent records are cached too. Eviction only costs a reload.

use lru::LruCache;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;

use super::record::ProfileRecord;
use crate::address::Address;
use crate::error::Result;
use crate::storage::WriteGeneration;

/// Cached lookup result; `None` means the store had no record
type Cached = Option<Arc<ProfileRecord>>;

#[derive(Clone)]
struct CacheEntry {
    record: Cached,
    generation: u64,
    aliases: Vec<String>,
}

struct CacheInner {
    entries: LruCache<String, CacheEntry>,
    aliases: HashMap<String, HashSet<String>>,
}

impl CacheInner {
    fn register(&mut self, key: &str, aliases: &[String]) {
        for alias in aliases {
            self.aliases
                .entry(alias.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn unregister(&mut self, key: &str, aliases: &[String]) {
        for alias in aliases {
            if let Some(keys) = self.aliases.get_mut(alias) {
                keys.remove(key);
                if keys.is_empty() {
                    self.aliases.remove(alias);
                }
            }
        }
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        let aliases = entry.aliases.clone();
        if let Some((evicted_key, evicted)) = self.entries.push(key.clone(), entry) {
            self.unregister(&evicted_key, &evicted.aliases);
        }
        self.register(&key, &aliases);
    }
}

/// Read-through profile cache
pub struct ReadCache {
    inner: RwLock<CacheInner>,
    generation: WriteGeneration,
}

impl ReadCache {
    /// Create a cache holding at most `capacity` lookups
    pub fn new(capacity: usize, generation: WriteGeneration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: RwLock::new(CacheInner {
                entries: LruCache::new(capacity),
                aliases: HashMap::new(),
            }),
            generation,
        }
    }

    /// Look up an address, calling `load` on a miss
    ///
    /// `load` returns the record and the write generation its snapshot was
    /// taken at.
    pub fn get<F>(&self, address: &Address, load: F) -> Result<Cached>
    where
        F: FnOnce() -> Result<(Option<ProfileRecord>, u64)>,
    {
        let key = lookup_key(address);
        if let Some(hit) = self.peek(&key) {
            return Ok(hit);
        }

        let (record, loaded_at) = load()?;
        let record = record.map(Arc::new);
        self.insert(address, key, record.clone(), loaded_at);
        Ok(record)
    }

    fn peek(&self, key: &str) -> Option<Cached> {
        let hit = {
            let inner = self.inner.read();
            inner.entries.peek(key).map(|entry| entry.record.clone())
        }?;

        // Recency is best effort; skip it under contention
        if let Some(mut inner) = self.inner.try_write() {
            inner.entries.promote(key);
        }
        Some(hit)
    }

    fn insert(&self, address: &Address, key: String, record: Cached, loaded_at: u64) {
        let mut inner = self.inner.write();
        if self.generation.current() != loaded_at {
            tracing::trace!(key = %key, "Skipping cache fill from a stale snapshot");
            return;
        }

        let mut aliases = address.identifier_keys();
        if let Some(ref record) = record {
            for alias in record.address.identifier_keys() {
                if !aliases.contains(&alias) {
                    aliases.push(alias);
                }
            }
        }

        inner.insert(
            key,
            CacheEntry {
                record,
                generation: loaded_at,
                aliases,
            },
        );
    }

    /// Pre-load records under each address a caller may look them up by
    ///
    /// Skipped entirely if a commit landed after `loaded_at`.
    pub fn warm(&self, records: Vec<ProfileRecord>, loaded_at: u64) -> usize {
        let mut inner = self.inner.write();
        if self.generation.current() != loaded_at {
            return 0;
        }

        let mut warmed = 0;
        for record in records {
            let aliases = record.address.identifier_keys();
            let record = Arc::new(record);

            let mut lookups = vec![record.address.clone()];
            if record.address.is_complete() {
                if let Some(uuid) = record.address.uuid() {
                    lookups.push(Address::from_uuid(uuid));
                }
                if let Ok(phone) = Address::new(None, record.address.phone_number().map(String::from)) {
                    lookups.push(phone);
                }
            }

            for lookup in lookups {
                inner.insert(
                    lookup_key(&lookup),
                    CacheEntry {
                        record: Some(Arc::clone(&record)),
                        generation: loaded_at,
                        aliases: aliases.clone(),
                    },
                );
            }
            warmed += 1;
        }
        warmed
    }

    /// Drop every entry that depends on any of the identifier keys
    pub fn invalidate_keys<'a, I>(&self, keys: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut inner = self.inner.write();
        for alias in keys {
            let Some(dependents) = inner.aliases.remove(alias) else {
                continue;
            };
            for key in dependents {
                if let Some(entry) = inner.entries.pop(&key) {
                    inner.unregister(&key, &entry.aliases);
                }
            }
        }
    }

    /// Drop every entry that depends on the address
    pub fn invalidate(&self, address: &Address) {
        self.invalidate_keys(address.identifier_keys().iter());
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.aliases.clear();
    }

    /// Number of cached lookups
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Generation a cached lookup was loaded at, if present
    pub fn entry_generation(&self, address: &Address) -> Option<u64> {
        self.inner
            .read()
            .entries
            .peek(&lookup_key(address))
            .map(|entry| entry.generation)
    }
}

fn lookup_key(address: &Address) -> String {
    address.identifier_keys().join("|")
}

// ============================================================================
// TESTS
// ============================================================================
