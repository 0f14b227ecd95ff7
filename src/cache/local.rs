use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub type CachedValue = Arc<dyn Any + Send + Sync>;

struct Entry {
    value: CachedValue,
    expires_at: Instant,
    tick: u64,
}

/// Bounded, in-process LRU with per-entry expiry.
///
/// Values are kept as typed `Arc`s, so a hit hands back the very value that
/// was stored. Expiry uses tokio's clock, which lets tests drive it with
/// `tokio::time::pause`.
pub struct LocalCache {
    capacity: usize,
    entries: HashMap<String, Entry>,
    // tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl LocalCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            next_tick: 0,
        }
    }

    pub fn get(&mut self, key: &str) -> Option<CachedValue> {
        let now = Instant::now();
        let tick = self.bump();

        let entry = self.entries.get_mut(key)?;
        if entry.expires_at <= now {
            self.remove(key);
            return None;
        }

        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key.to_string());

        Some(Arc::clone(&entry.value))
    }

    pub fn insert(&mut self, key: &str, value: CachedValue, ttl: Duration) {
        self.remove(key);

        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }

        let tick = self.bump();
        self.recency.insert(tick, key.to_string());
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
                tick,
            },
        );
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.recency.remove(&entry.tick);
                true
            }
            None => false,
        }
    }

    /// Remove every key `matches` accepts. Returns the ones that were still
    /// live; expired matches are dropped without being reported.
    pub fn remove_matching(&mut self, matches: impl Fn(&str) -> bool) -> Vec<String> {
        let now = Instant::now();
        let matched: Vec<(String, bool)> = self
            .entries
            .iter()
            .filter(|(k, _)| matches(k))
            .map(|(k, e)| (k.clone(), e.expires_at > now))
            .collect();

        let mut live = Vec::with_capacity(matched.len());
        for (key, is_live) in matched {
            self.remove(&key);
            if is_live {
                live.push(key);
            }
        }

        live
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(n: u32) -> CachedValue {
        Arc::new(n)
    }

    fn read(cache: &mut LocalCache, key: &str) -> Option<u32> {
        cache.get(key).and_then(|v| v.downcast_ref::<u32>().copied())
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let mut cache = LocalCache::new(4);
        cache.insert("a", value(1), Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(read(&mut cache, "a"), Some(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(read(&mut cache, "a"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicts_least_recently_used() {
        let mut cache = LocalCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.insert("a", value(1), ttl);
        cache.insert("b", value(2), ttl);

        assert_eq!(read(&mut cache, "a"), Some(1));
        cache.insert("c", value(3), ttl);

        assert_eq!(read(&mut cache, "b"), None);
        assert_eq!(read(&mut cache, "a"), Some(1));
        assert_eq!(read(&mut cache, "c"), Some(3));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_keeps_single_entry() {
        let mut cache = LocalCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.insert("a", value(1), ttl);
        cache.insert("a", value(2), ttl);
        cache.insert("b", value(3), ttl);

        assert_eq!(cache.len(), 2);
        assert_eq!(read(&mut cache, "a"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_matching() {
        let mut cache = LocalCache::new(8);
        let ttl = Duration::from_secs(60);
        cache.insert("x:1", value(1), ttl);
        cache.insert("x:2", value(2), ttl);
        cache.insert("y:1", value(3), ttl);

        let mut removed = cache.remove_matching(|k| k.starts_with("x:"));
        removed.sort();

        assert_eq!(removed, vec!["x:1", "x:2"]);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_matching_skips_expired() {
        let mut cache = LocalCache::new(4);
        cache.insert("x:1", value(1), Duration::from_secs(5));
        cache.insert("x:2", value(2), Duration::from_secs(60));

        tokio::time::advance(Duration::from_secs(6)).await;
        let removed = cache.remove_matching(|k| k.starts_with("x:"));

        assert_eq!(removed, vec!["x:2"]);
        assert!(cache.is_empty());
    }
}
