//! Result cache for the tool surface: LRU bounded by entry count, with a
//! per-entry TTL.  Keys are `(operation, canonicalized params)`; any
//! write-class operation clears the whole cache, since a single ingest can
//! shift every ranking.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub capacity: usize,
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub hit_rate_pct: f32,
}

struct CachedValue {
    value: Value,
    stored_at: Instant,
}

pub struct ResultCache {
    entries: LruCache<String, CachedValue>,
    ttl: Duration,
    capacity: usize,
    hits: u64,
    misses: u64,
    invalidations: u64,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity).expect("capacity ≥ 1")),
            ttl,
            capacity,
            hits: 0,
            misses: 0,
            invalidations: 0,
        }
    }

    /// Canonical cache key: operation plus params re-serialized with sorted
    /// object keys, so `{a,b}` and `{b,a}` collide as they should.
    pub fn key(operation: &str, params: &Value) -> String {
        format!("{operation}:{}", canonicalize(params))
    }

    pub fn get(&mut self, key: &str) -> Option<Value> {
        match self.entries.get(key) {
            Some(cached) if cached.stored_at.elapsed() <= self.ttl => {
                self.hits += 1;
                Some(cached.value.clone())
            }
            Some(_) => {
                // Expired: drop it and report a miss.
                self.entries.pop(key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn put(&mut self, key: String, value: Value) {
        self.entries.put(
            key,
            CachedValue {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.invalidations += 1;
    }

    pub fn stats(&self) -> CacheStats {
        let total = self.hits + self.misses;
        CacheStats {
            capacity: self.capacity,
            len: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
            invalidations: self.invalidations,
            hit_rate_pct: if total == 0 {
                0.0
            } else {
                (self.hits as f32 / total as f32) * 100.0
            },
        }
    }
}

fn canonicalize(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", k, canonicalize(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_is_order_insensitive_for_objects() {
        let a = json!({"query": "x", "limit": 5});
        let b = json!({"limit": 5, "query": "x"});
        assert_eq!(ResultCache::key("search", &a), ResultCache::key("search", &b));
    }

    #[test]
    fn hit_returns_identical_value() {
        let mut cache = ResultCache::new(4, Duration::from_secs(60));
        let key = ResultCache::key("op", &json!({"a": 1}));
        cache.put(key.clone(), json!({"result": [1, 2, 3]}));

        let hit = cache.get(&key).unwrap();
        assert_eq!(hit, json!({"result": [1, 2, 3]}));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn expired_entries_miss() {
        let mut cache = ResultCache::new(4, Duration::from_millis(0));
        let key = "op:{}".to_string();
        cache.put(key.clone(), json!(1));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn clear_empties_and_counts_invalidations() {
        let mut cache = ResultCache::new(4, Duration::from_secs(60));
        cache.put("k".into(), json!(1));
        cache.clear();
        assert!(cache.get("k").is_none());
        assert_eq!(cache.stats().invalidations, 1);
        assert_eq!(cache.stats().len, 0);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut cache = ResultCache::new(2, Duration::from_secs(60));
        cache.put("a".into(), json!(1));
        cache.put("b".into(), json!(2));
        cache.get("a");
        cache.put("c".into(), json!(3));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
    }
}
