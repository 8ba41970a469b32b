use std::sync::Arc;
use std::time::{Duration, Instant};

use actix_web::web::Bytes;
use dashmap::DashMap;

/// Whole-page response cache. Entries live for the TTL given at `set` and
/// are never invalidated by writes; `clear` is the only explicit eviction.
pub trait PageCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Bytes>;
    fn set(&self, key: &str, value: Bytes, ttl: Duration);
    fn clear(&self);
}

/// Past this many entries `set` first drops everything already expired.
const SWEEP_THRESHOLD: usize = 256;

struct CachedPage {
    body: Bytes,
    expires_at: Instant,
}

/// Process-local cache; each worker sees the same map through the shared `Arc`.
#[derive(Clone, Default)]
pub struct InMemoryPageCache {
    entries: Arc<DashMap<String, CachedPage>>,
}

impl InMemoryPageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PageCache for InMemoryPageCache {
    fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        let hit = self.entries.get(key).and_then(|e| (e.expires_at > now).then(|| e.body.clone()));
        match hit {
            Some(body) => {
                metrics::counter!("page_cache_hits_total").increment(1);
                Some(body)
            }
            None => {
                self.entries.remove_if(key, |_, e| e.expires_at <= now);
                metrics::counter!("page_cache_misses_total").increment(1);
                None
            }
        }
    }

    fn set(&self, key: &str, value: Bytes, ttl: Duration) {
        let now = Instant::now();
        if self.entries.len() >= SWEEP_THRESHOLD {
            self.entries.retain(|_, e| e.expires_at > now);
        }
        self.entries.insert(key.to_string(), CachedPage { body: value, expires_at: now + ttl });
    }

    fn clear(&self) {
        self.entries.clear();
    }
}
