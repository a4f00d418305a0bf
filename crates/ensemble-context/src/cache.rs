//! Layered cache keyed by request fingerprint
//!
//! Read order: in-process LRU, then the shared remote layer when the
//! `redis-cache` feature is enabled, then per-key JSON files on disk.
//! TTL is validated at every layer; expired entries are removed where
//! they are found. Hits in lower layers are promoted into the LRU.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    #[serde(default = "default_memory_size")]
    pub memory_size: usize,
    #[serde(default = "default_disk_dir")]
    pub disk_dir: PathBuf,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_memory_size() -> usize {
    1000
}

fn default_disk_dir() -> PathBuf {
    PathBuf::from("cache/context")
}

fn default_ttl_secs() -> u64 {
    3600
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memory_size: default_memory_size(),
            disk_dir: default_disk_dir(),
            ttl_secs: default_ttl_secs(),
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    value: Value,
    timestamp: f64,
    ttl: f64,
}

impl CacheEntry {
    fn new(value: Value, ttl: Duration) -> Self {
        Self {
            value,
            timestamp: unix_now(),
            ttl: ttl.as_secs_f64(),
        }
    }

    fn is_valid(&self) -> bool {
        unix_now() - self.timestamp < self.ttl
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub memory_entries: usize,
    pub memory_capacity: usize,
    pub disk_entries: usize,
    pub remote_enabled: bool,
}

pub struct ContextCache {
    memory: Mutex<LruCache<String, CacheEntry>>,
    disk_dir: PathBuf,
    default_ttl: Duration,
    #[cfg(feature = "redis-cache")]
    redis: Option<redis::Client>,
    #[cfg(not(feature = "redis-cache"))]
    redis: Option<()>,
}

impl ContextCache {
    pub fn new(settings: CacheSettings) -> Self {
        let capacity =
            NonZeroUsize::new(settings.memory_size).unwrap_or(NonZeroUsize::MIN);

        #[cfg(feature = "redis-cache")]
        let redis = settings.redis_url.as_deref().and_then(|url| {
            match redis::Client::open(url) {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(error = %err, "remote cache unavailable");
                    None
                }
            }
        });
        #[cfg(not(feature = "redis-cache"))]
        let redis: Option<()> = {
            if settings.redis_url.is_some() {
                warn!("redis_url configured but the redis-cache feature is disabled");
            }
            None
        };

        Self {
            memory: Mutex::new(LruCache::new(capacity)),
            disk_dir: settings.disk_dir,
            default_ttl: Duration::from_secs(settings.ttl_secs),
            redis,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        // 1. In-process LRU. A hit moves the entry to the MRU slot.
        {
            let mut memory = self.memory.lock();
            if let Some(entry) = memory.get(key) {
                if entry.is_valid() {
                    debug!(key = %short(key), "cache hit (memory)");
                    return Some(entry.value.clone());
                }
                memory.pop(key);
            }
        }

        // 2. Shared remote layer.
        if let Some(entry) = self.remote_get(key).await {
            if entry.is_valid() {
                debug!(key = %short(key), "cache hit (remote)");
                let value = entry.value.clone();
                self.memory.lock().put(key.to_string(), entry);
                return Some(value);
            }
        }

        // 3. Disk layer.
        let path = self.entry_path(key);
        if let Ok(raw) = tokio::fs::read_to_string(&path).await {
            match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) if entry.is_valid() => {
                    debug!(key = %short(key), "cache hit (disk)");
                    let value = entry.value.clone();
                    self.memory.lock().put(key.to_string(), entry);
                    return Some(value);
                }
                _ => {
                    let _ = tokio::fs::remove_file(&path).await;
                }
            }
        }

        debug!(key = %short(key), "cache miss");
        None
    }

    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry::new(value, ttl);

        self.memory.lock().put(key.to_string(), entry.clone());
        self.remote_set(key, &entry, ttl).await;

        if let Err(err) = self.write_disk(key, &entry).await {
            warn!(error = %err, "disk cache write failed");
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.memory.lock().pop(key);
        self.remote_del(key).await;
        let _ = tokio::fs::remove_file(self.entry_path(key)).await;
    }

    pub async fn clear(&self) {
        self.memory.lock().clear();
        if let Ok(mut entries) = tokio::fs::read_dir(&self.disk_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.path().extension().is_some_and(|e| e == "json") {
                    let _ = tokio::fs::remove_file(entry.path()).await;
                }
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let (memory_entries, memory_capacity) = {
            let memory = self.memory.lock();
            (memory.len(), memory.cap().get())
        };
        let mut disk_entries = 0;
        if let Ok(mut entries) = tokio::fs::read_dir(&self.disk_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.path().extension().is_some_and(|e| e == "json") {
                    disk_entries += 1;
                }
            }
        }
        CacheStats {
            memory_entries,
            memory_capacity,
            disk_entries,
            remote_enabled: self.redis.is_some(),
        }
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.disk_dir.join(format!("{}.json", key))
    }

    async fn write_disk(&self, key: &str, entry: &CacheEntry) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.disk_dir).await?;
        let raw = serde_json::to_string(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(self.entry_path(key), raw).await
    }

    #[cfg(feature = "redis-cache")]
    async fn remote_get(&self, key: &str) -> Option<CacheEntry> {
        let client = self.redis.as_ref()?;
        let mut conn = client.get_multiplexed_async_connection().await.ok()?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(format!("cache:{}", key))
            .query_async(&mut conn)
            .await
            .ok()?;
        raw.and_then(|r| serde_json::from_str(&r).ok())
    }

    #[cfg(feature = "redis-cache")]
    async fn remote_set(&self, key: &str, entry: &CacheEntry, ttl: Duration) {
        let Some(client) = self.redis.as_ref() else { return };
        let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
            return;
        };
        let Ok(raw) = serde_json::to_string(entry) else { return };
        let result: Result<(), _> = redis::cmd("SETEX")
            .arg(format!("cache:{}", key))
            .arg(ttl.as_secs().max(1))
            .arg(raw)
            .query_async(&mut conn)
            .await;
        if let Err(err) = result {
            warn!(error = %err, "remote cache set failed");
        }
    }

    #[cfg(feature = "redis-cache")]
    async fn remote_del(&self, key: &str) {
        let Some(client) = self.redis.as_ref() else { return };
        let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
            return;
        };
        let _: Result<(), _> = redis::cmd("DEL")
            .arg(format!("cache:{}", key))
            .query_async(&mut conn)
            .await;
    }

    #[cfg(not(feature = "redis-cache"))]
    async fn remote_get(&self, _key: &str) -> Option<CacheEntry> {
        None
    }

    #[cfg(not(feature = "redis-cache"))]
    async fn remote_set(&self, _key: &str, _entry: &CacheEntry, _ttl: Duration) {}

    #[cfg(not(feature = "redis-cache"))]
    async fn remote_del(&self, _key: &str) {}
}

fn short(key: &str) -> &str {
    &key[..key.len().min(16)]
}

/// Stable fingerprint over an ordered tuple of request parts.
pub fn fingerprint(parts: &[&str]) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in parts {
        for byte in part.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x100_0000_01b3);
        }
        // separator so ("ab","c") != ("a","bc")
        hash ^= 0x1f;
        hash = hash.wrapping_mul(0x100_0000_01b3);
    }
    format!("{:016x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache_in(dir: &tempfile::TempDir, memory_size: usize, ttl_secs: u64) -> ContextCache {
        ContextCache::new(CacheSettings {
            memory_size,
            disk_dir: dir.path().to_path_buf(),
            ttl_secs,
            redis_url: None,
        })
    }

    #[tokio::test]
    async fn set_then_get_hits_memory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir, 10, 60);
        cache.set("k1", json!("value"), None).await;
        assert_eq!(cache.get("k1").await, Some(json!("value")));
    }

    #[tokio::test]
    async fn disk_layer_survives_memory_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir, 1, 60);
        cache.set("k1", json!(1), None).await;
        cache.set("k2", json!(2), None).await; // evicts k1 from the LRU
        assert_eq!(cache.memory.lock().len(), 1);

        // k1 still comes back from disk and is promoted.
        assert_eq!(cache.get("k1").await, Some(json!(1)));
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir, 10, 3600);
        cache.set("k", json!("soon gone"), Some(Duration::from_millis(20))).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.get("k").await, None);
        // opportunistic removal cleaned the disk file too
        assert!(!dir.path().join("k.json").exists());
    }

    #[tokio::test]
    async fn invalidate_removes_all_layers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir, 10, 60);
        cache.set("k", json!("v"), None).await;
        cache.invalidate("k").await;
        assert_eq!(cache.get("k").await, None);
        assert!(!dir.path().join("k.json").exists());
    }

    #[tokio::test]
    async fn stats_count_layers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_in(&dir, 10, 60);
        cache.set("a", json!(1), None).await;
        cache.set("b", json!(2), None).await;
        let stats = cache.stats().await;
        assert_eq!(stats.memory_entries, 2);
        assert_eq!(stats.disk_entries, 2);
        assert!(!stats.remote_enabled);
    }

    #[test]
    fn fingerprint_is_stable_and_order_sensitive() {
        let a = fingerprint(&["query", "4000", "true", "false"]);
        let b = fingerprint(&["query", "4000", "true", "false"]);
        let c = fingerprint(&["4000", "query", "true", "false"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
    }
}
