//! A file-per-key cache of query results.
//!
//! Each entry is a JSON file `<key>.json` that records when it was written
//! and for how long it is valid. Entries are never rewritten on read, so an
//! expired entry stays expired until the next successful query replaces it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    key: String,
    written_at: f64,
    ttl_secs: f64,
    payload: Value,
}

impl CacheEntry {
    fn is_fresh(&self, now: f64) -> bool {
        now < self.written_at + self.ttl_secs
    }
}

/// Response cache rooted in a directory.
#[derive(Debug, Clone)]
pub(crate) struct ResponseCache {
    dir: PathBuf,
}

impl ResponseCache {
    pub(crate) fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The default cache directory, `overpass-engine` in the system's temp dir.
    pub(crate) fn default_dir() -> PathBuf {
        std::env::temp_dir().join("overpass-engine")
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    /// Reads a fresh payload. A missing or expired entry is `Ok(None)`.
    pub(crate) async fn get(&self, key: &str) -> io::Result<Option<Value>> {
        self.get_at(key, SystemTime::now()).await
    }

    pub(crate) async fn get_at(&self, key: &str, now: SystemTime) -> io::Result<Option<Value>> {
        let path = self.path(key);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No cache entry");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let entry: CacheEntry = serde_json::from_slice(&bytes)?;

        if entry.key != key {
            tracing::warn!(path = %path.display(), found = %entry.key, "Cache entry has a different key");
            return Ok(None);
        }

        if !entry.is_fresh(unix_secs(now)) {
            tracing::info!(cache_key = key, "Cache entry expired");
            return Ok(None);
        }

        Ok(Some(entry.payload))
    }

    /// Writes a payload that stays valid for `ttl`.
    pub(crate) async fn put(&self, key: &str, payload: &Value, ttl: Duration) -> io::Result<()> {
        self.put_at(key, payload, ttl, SystemTime::now()).await
    }

    pub(crate) async fn put_at(
        &self,
        key: &str,
        payload: &Value,
        ttl: Duration,
        now: SystemTime,
    ) -> io::Result<()> {
        let entry = CacheEntry {
            key: key.to_string(),
            written_at: unix_secs(now),
            ttl_secs: ttl.as_secs_f64(),
            payload: payload.clone(),
        };

        tokio::fs::create_dir_all(&self.dir).await?;

        // Readers only ever see a complete entry.
        let path = self.path(key);
        let tmp_path = self
            .dir
            .join(format!("{}.json.{:016x}.tmp", key, rand::random::<u64>()));
        tracing::debug!(path = %path.display(), "Writing cache entry");

        tokio::fs::write(&tmp_path, serde_json::to_vec(&entry)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        Ok(())
    }

    /// Removes an entry. Removing a missing entry is not an error.
    pub(crate) async fn delete(&self, key: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

fn unix_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_cache() -> ResponseCache {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        ResponseCache::new(
            std::env::temp_dir().join(format!("overpass-engine-test-{}-{}", std::process::id(), n)),
        )
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = temp_cache();
        let payload = json!({ "elements": [{ "id": 1 }] });

        assert_eq!(cache.get("abc").await.unwrap(), None);

        cache
            .put("abc", &payload, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("abc").await.unwrap(), Some(payload));

        cache.delete("abc").await.unwrap();
        assert_eq!(cache.get("abc").await.unwrap(), None);
        // deleting twice is fine
        cache.delete("abc").await.unwrap();

        let _ = tokio::fs::remove_dir_all(cache.dir()).await;
    }

    #[tokio::test]
    async fn test_expiry_uses_stored_ttl() {
        let cache = temp_cache();
        let payload = json!({ "elements": [] });
        let written = SystemTime::now();

        cache
            .put_at("k", &payload, Duration::from_secs(10), written)
            .await
            .unwrap();

        let before = tokio::fs::read(cache.path("k")).await.unwrap();

        let fresh = cache
            .get_at("k", written + Duration::from_secs(9))
            .await
            .unwrap();
        assert!(fresh.is_some());

        let expired = cache
            .get_at("k", written + Duration::from_secs(10))
            .await
            .unwrap();
        assert!(expired.is_none());

        // reads never touch the file
        let after = tokio::fs::read(cache.path("k")).await.unwrap();
        assert_eq!(before, after);

        let _ = tokio::fs::remove_dir_all(cache.dir()).await;
    }

    #[tokio::test]
    async fn test_concurrent_writes_leave_a_complete_entry() {
        let cache = std::sync::Arc::new(temp_cache());
        let payloads: Vec<Value> = (0..8)
            .map(|i| json!({ "elements": vec![json!({ "id": i }); 500] }))
            .collect();

        let writers: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .put("same", &payload, Duration::from_secs(60))
                        .await
                        .unwrap();
                })
            })
            .collect();

        for _ in 0..20 {
            if let Ok(Some(payload)) = cache.get("same").await {
                assert!(payloads.contains(&payload));
            }
            tokio::task::yield_now().await;
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let payload = cache.get("same").await.unwrap().unwrap();
        assert!(payloads.contains(&payload));

        let mut entries = tokio::fs::read_dir(cache.dir()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["same.json".to_string()]);

        let _ = tokio::fs::remove_dir_all(cache.dir()).await;
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_an_error() {
        let cache = temp_cache();
        tokio::fs::create_dir_all(cache.dir()).await.unwrap();
        tokio::fs::write(cache.path("bad"), b"{ not json").await.unwrap();

        assert!(cache.get("bad").await.is_err());

        let _ = tokio::fs::remove_dir_all(cache.dir()).await;
    }
}
