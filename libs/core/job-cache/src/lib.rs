//! Advisory TTL cache. Grounded in the teacher's ad hoc
//! `gmail.rs::CachedToken { expires_at }` pattern, generalized into a
//! reusable `TtlCache<K, V>` with lazy eviction on `get` plus an optional
//! periodic sweep task. A cache miss or a cache error never fails a job —
//! callers treat this purely as an optimization.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A TTL-bounded cache guarded by `std::sync::RwLock`, the way
/// `stream_worker::resilience` guards its circuit-breaker state.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Always `true` for the in-memory backend; a remote-backed cache
    /// would probe connectivity here.
    pub fn is_ready(&self) -> bool {
        true
    }

    /// Returns the cached value, evicting it first if its TTL has
    /// elapsed (lazy eviction on read).
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let entries = self.entries.read().expect("cache lock poisoned");
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        self.entries.write().expect("cache lock poisoned").remove(key);
        None
    }

    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drops every entry whose TTL has elapsed. Intended to be called
    /// periodically (see `spawn_sweeper`) so memory doesn't grow
    /// unbounded with entries nobody reads again.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .write()
            .expect("cache lock poisoned")
            .retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone, V: Clone> Default for TtlCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawns a background task that calls `cache.sweep()` every `interval`
/// until the returned handle is dropped/aborted.
pub fn spawn_sweeper<K, V>(cache: std::sync::Arc<TtlCache<K, V>>, interval: Duration) -> tokio::task::JoinHandle<()>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            cache.sweep();
        }
    })
}

/// Deterministic fingerprints for cache keys derived from content-addressed
/// inputs (spec §4.8: `CacheKeyGenerator.fileProcessing(...)`).
pub struct CacheKeyGenerator;

impl CacheKeyGenerator {
    /// Fingerprints a file-processing cache key from its path, size, and
    /// last-modified timestamp — the inputs that change iff the file's
    /// contents might have changed.
    pub fn file_processing(path: &str, size: u64, modified_unix: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(path.as_bytes());
        hasher.update(size.to_le_bytes());
        hasher.update(modified_unix.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_then_get_returns_cached_value() {
        let cache = TtlCache::new();
        cache.set("k1", "v1", Duration::from_secs(60));
        assert_eq!(cache.get(&"k1"), Some("v1"));
    }

    #[test]
    fn missing_key_returns_none() {
        let cache: TtlCache<&str, &str> = TtlCache::new();
        assert_eq!(cache.get(&"missing"), None);
    }

    #[test]
    fn expired_entry_is_evicted_lazily_on_get() {
        let cache = TtlCache::new();
        cache.set("k1", "v1", Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.get(&"k1"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn sweep_drops_expired_entries_without_a_read() {
        let cache = TtlCache::new();
        cache.set("k1", "v1", Duration::from_millis(1));
        cache.set("k2", "v2", Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(20));

        cache.sweep();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"k2"), Some("v2"));
    }

    #[tokio::test]
    async fn spawned_sweeper_evicts_in_the_background() {
        let cache = Arc::new(TtlCache::new());
        cache.set("k1", "v1", Duration::from_millis(1));

        let handle = spawn_sweeper(Arc::clone(&cache), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();

        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn file_processing_fingerprint_is_deterministic_and_content_sensitive() {
        let a = CacheKeyGenerator::file_processing("/tmp/note.html", 1024, 1_700_000_000);
        let b = CacheKeyGenerator::file_processing("/tmp/note.html", 1024, 1_700_000_000);
        let c = CacheKeyGenerator::file_processing("/tmp/note.html", 2048, 1_700_000_000);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
