//! Memory-bounded script cache with LRU-K eviction
//!
//! Entries are keyed by the SHA-256 of the instrumented source. Eviction ranks
//! entries by their K-th most recent access so that one-shot snippets are
//! dropped before scripts the user keeps re-running.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Fixed bookkeeping cost charged to every entry on top of its source size
pub const ENTRY_OVERHEAD_BYTES: usize = 512;

/// Cache sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Budget for the summed entry sizes
    #[serde(default = "CacheConfig::default_max_memory")]
    pub max_memory_bytes: usize,
    /// K of LRU-K
    #[serde(default = "CacheConfig::default_k")]
    pub k: usize,
}

impl CacheConfig {
    fn default_max_memory() -> usize {
        16 * 1024 * 1024
    }

    fn default_k() -> usize {
        2
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: Self::default_max_memory(),
            k: Self::default_k(),
        }
    }
}

/// Hex SHA-256 of a script
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn for_source(code: &str) -> Self {
        Self(hex::encode(Sha256::digest(code.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First characters of the hash, for log lines
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct CachedScript<A> {
    artifact: Arc<A>,
    size_bytes: usize,
    /// Logical access times, oldest first, at most K+1 long
    history: VecDeque<u64>,
}

impl<A> CachedScript<A> {
    /// Timestamp of the K-th most recent access, 0 when accessed fewer than K times
    fn kth_recent(&self, k: usize) -> u64 {
        if self.history.len() < k {
            0
        } else {
            self.history[self.history.len() - k]
        }
    }

    fn last_access(&self) -> u64 {
        self.history.back().copied().unwrap_or(0)
    }
}

/// Informational counters; they never influence eviction
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub current_memory: usize,
    pub max_memory: usize,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Outcome of a lookup
pub struct Lookup<A> {
    pub key: CacheKey,
    pub artifact: Arc<A>,
    pub hit: bool,
}

/// LRU-K cache of compiled scripts
pub struct ScriptCache<A> {
    entries: HashMap<CacheKey, CachedScript<A>>,
    k: usize,
    max_memory: usize,
    current_memory: usize,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<A> ScriptCache<A> {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: HashMap::new(),
            k: config.k.max(1),
            max_memory: config.max_memory_bytes,
            current_memory: 0,
            clock: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Return the cached artifact for `code`, compiling it on a miss.
    pub fn get_or_create<F>(&mut self, code: &str, compile: F) -> Lookup<A>
    where
        F: FnOnce(&CacheKey, &str) -> A,
    {
        let key = CacheKey::for_source(code);
        let now = self.tick();
        let history_limit = self.k + 1;

        if let Some(entry) = self.entries.get_mut(&key) {
            entry.history.push_back(now);
            while entry.history.len() > history_limit {
                entry.history.pop_front();
            }
            self.hits += 1;
            tracing::trace!(cache_key = key.short(), "Script cache hit");
            return Lookup {
                artifact: Arc::clone(&entry.artifact),
                key,
                hit: true,
            };
        }

        self.misses += 1;
        let artifact = Arc::new(compile(&key, code));
        let size_bytes = code.len() + ENTRY_OVERHEAD_BYTES;

        if size_bytes > self.max_memory {
            tracing::debug!(
                cache_key = key.short(),
                size_bytes,
                max_memory = self.max_memory,
                "Script larger than cache budget, not caching"
            );
            return Lookup {
                key,
                artifact,
                hit: false,
            };
        }

        while self.current_memory + size_bytes > self.max_memory {
            if !self.evict_one() {
                break;
            }
        }

        self.current_memory += size_bytes;
        self.entries.insert(
            key.clone(),
            CachedScript {
                artifact: Arc::clone(&artifact),
                size_bytes,
                history: VecDeque::from([now]),
            },
        );
        tracing::trace!(
            cache_key = key.short(),
            size_bytes,
            current_memory = self.current_memory,
            "Script cached"
        );

        Lookup {
            key,
            artifact,
            hit: false,
        }
    }

    /// Key the next eviction would remove
    pub fn eviction_candidate(&self) -> Option<&CacheKey> {
        self.entries
            .iter()
            .min_by_key(|(_, entry)| (entry.kth_recent(self.k), entry.last_access()))
            .map(|(key, _)| key)
    }

    fn evict_one(&mut self) -> bool {
        let Some(victim) = self.eviction_candidate().cloned() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&victim) {
            self.current_memory -= entry.size_bytes;
            self.evictions += 1;
            tracing::debug!(cache_key = victim.short(), "Evicted script");
        }
        true
    }

    pub fn contains(&self, code: &str) -> bool {
        self.entries.contains_key(&CacheKey::for_source(code))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_memory(&self) -> usize {
        self.current_memory
    }

    /// Drop every entry and reset memory accounting
    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_memory = 0;
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            entries: self.entries.len(),
            current_memory: self.current_memory,
            max_memory: self.max_memory,
        }
    }
}
