//! Bounded synthesis result cache
//!
//! Eviction is by insertion order: when full, the oldest inserted entry goes
//! first regardless of how often it was hit.

use std::sync::Arc;

use indexmap::IndexMap;

use super::BackendStage;
use super::request::{AudioFormat, CacheKey, RequestId, SynthesisResult};

/// Cached audio, shared between every result served from it
#[derive(Debug, Clone)]
pub struct CachedAudio {
    pub audio: Arc<[u8]>,
    pub duration_ms: u64,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub stage: BackendStage,
}

impl CachedAudio {
    /// Result for a request served from this entry
    #[must_use]
    pub fn to_result(&self, request_id: RequestId) -> SynthesisResult {
        SynthesisResult {
            request_id,
            audio: Arc::clone(&self.audio),
            duration_ms: self.duration_ms,
            format: self.format,
            sample_rate: self.sample_rate,
            stage: self.stage,
            degraded: false,
            cached: true,
        }
    }
}

impl From<&SynthesisResult> for CachedAudio {
    fn from(result: &SynthesisResult) -> Self {
        Self {
            audio: Arc::clone(&result.audio),
            duration_ms: result.duration_ms,
            format: result.format,
            sample_rate: result.sample_rate,
            stage: result.stage,
        }
    }
}

/// Insertion-ordered result cache with hit/miss counters
#[derive(Debug)]
pub struct SynthesisCache {
    entries: IndexMap<CacheKey, CachedAudio>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl SynthesisCache {
    /// Create a cache holding at most `capacity` results (0 disables it)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexMap::with_capacity(capacity.min(1024)),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up an entry, counting the hit or miss
    pub fn get(&mut self, key: &CacheKey) -> Option<CachedAudio> {
        let found = self.entries.get(key).cloned();
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    /// Look up an entry without touching the counters
    #[must_use]
    pub fn peek(&self, key: &CacheKey) -> Option<CachedAudio> {
        self.entries.get(key).cloned()
    }

    /// Store an entry, evicting the oldest ones when full
    pub fn insert(&mut self, key: CacheKey, value: CachedAudio) {
        if self.capacity == 0 {
            return;
        }
        if let Some(existing) = self.entries.get_mut(&key) {
            *existing = value;
            return;
        }
        while self.entries.len() >= self.capacity {
            if self.entries.shift_remove_index(0).is_none() {
                break;
            }
        }
        self.entries.insert(key, value);
    }

    /// Drop every entry; counters are kept
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn hits(&self) -> u64 {
        self.hits
    }

    #[must_use]
    pub const fn misses(&self) -> u64 {
        self.misses
    }
}
