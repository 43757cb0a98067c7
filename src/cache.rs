//! Response cache keyed by conversation fingerprint
//!
//! A fingerprint is a SHA-256 digest over the ordered role and content of the
//! outbound messages. Model and sampling parameters are deliberately left
//! out, so identical conversations always map to the same key.
//!
//! Validity is decided by an entry's age at read time: an entry is expired
//! once `now - created_at >= ttl` (seven days by default). Expired entries
//! read as misses and are removed by [`ResponseCache::clear_expired`].
//!
//! Writes are last-writer-wins upserts, so the stores need no cross-call
//! coordination beyond their own interior locking.
//!
//! # Examples
//!
//! ```rust
//! use chat_pipeline::{ResponseCache, WireMessage, build_cache_key};
//!
//! # async fn example() -> chat_pipeline::Result<()> {
//! let cache = ResponseCache::in_memory();
//! let key = build_cache_key(&[WireMessage::system("sys"), WireMessage::user("hi")]);
//!
//! cache.put(&key, r#"{"id":"1","choices":[]}"#).await?;
//! assert!(cache.get(&key).await?.is_some());
//! # Ok(())
//! # }
//! ```

use crate::types::{ContentPart, WireContent, WireMessage};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

pub const DEFAULT_TTL_DAYS: i64 = 7;

// ============================================================================
// FINGERPRINT
// ============================================================================

/// Deterministic, order-sensitive digest of a message list.
///
/// Every field is length-prefixed before hashing so that no two distinct
/// sequences share an encoding.
pub fn build_cache_key(messages: &[WireMessage]) -> String {
    let mut hasher = Sha256::new();
    hasher.update((messages.len() as u64).to_le_bytes());

    for message in messages {
        update_field(&mut hasher, message.role.as_str().as_bytes());
        match &message.content {
            WireContent::Text(text) => {
                hasher.update(b"T");
                update_field(&mut hasher, text.as_bytes());
            }
            WireContent::Parts(parts) => {
                hasher.update(b"P");
                hasher.update((parts.len() as u64).to_le_bytes());
                for part in parts {
                    match part {
                        ContentPart::Text { text } => {
                            hasher.update(b"t");
                            update_field(&mut hasher, text.as_bytes());
                        }
                        ContentPart::ImageUrl { image_url } => {
                            hasher.update(b"i");
                            update_field(&mut hasher, image_url.url.as_bytes());
                        }
                    }
                }
            }
        }
    }

    format!("{:x}", hasher.finalize())
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

// ============================================================================
// CLOCK
// ============================================================================

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = now;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// STORES
// ============================================================================

/// A stored response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub cache_key: String,
    pub response: String,
    pub created_at: DateTime<Utc>,
}

/// Backing store for [`ResponseCache`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Insert or overwrite.
    async fn save(&self, entry: CacheEntry) -> Result<()>;

    /// Returns whether an entry was removed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// All readable entries. Unreadable ones are skipped.
    async fn entries(&self) -> Result<Vec<CacheEntry>>;

    async fn clear(&self) -> Result<()>;

    async fn len(&self) -> Result<usize> {
        Ok(self.entries().await?.len())
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::cache("cache lock poisoned")
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.get(key).cloned())
    }

    async fn save(&self, entry: CacheEntry) -> Result<()> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(entry.cache_key.clone(), entry);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        Ok(entries.remove(key).is_some())
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>> {
        let entries = self.entries.read().map_err(poisoned)?;
        Ok(entries.values().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.write().map_err(poisoned)?.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.entries.read().map_err(poisoned)?.len())
    }
}

/// One JSON file per entry under a directory.
///
/// Files that cannot be parsed are treated as absent.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    /// Open (and create if needed) a store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::cache(format!("create {}: {}", dir.display(), e)))?;
        Ok(Self { dir })
    }

    /// Directory holding the entry files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File for `key`, or `None` when the key cannot name a file here.
    fn path_for(&self, key: &str) -> Option<PathBuf> {
        let valid = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then(|| self.dir.join(format!("{}.json", key)))
    }

    async fn read_entry(path: &Path) -> Result<Option<CacheEntry>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::cache(format!("read {}: {}", path.display(), e))),
        };
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                log::warn!("Ignoring malformed cache entry {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    async fn json_files(&self) -> Result<Vec<PathBuf>> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::cache(format!("list {}: {}", self.dir.display(), e)))?;
        let mut files = Vec::new();
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|e| Error::cache(format!("list {}: {}", self.dir.display(), e)))?
        {
            let path = item.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>> {
        // Nothing can be stored under an invalid key.
        let Some(path) = self.path_for(key) else {
            return Ok(None);
        };
        Ok(Self::read_entry(&path)
            .await?
            .filter(|entry| entry.cache_key == key))
    }

    async fn save(&self, entry: CacheEntry) -> Result<()> {
        let path = self.path_for(&entry.cache_key).ok_or_else(|| {
            Error::invalid_input(format!("invalid cache key: {:?}", entry.cache_key))
        })?;
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec(&entry)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| Error::cache(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::cache(format!("rename {}: {}", path.display(), e)))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let Some(path) = self.path_for(key) else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::cache(format!("remove {}: {}", path.display(), e))),
        }
    }

    async fn entries(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        for path in self.json_files().await? {
            let Some(entry) = Self::read_entry(&path).await? else {
                continue;
            };
            // Only the file named after its key is reachable through `load`
            // and `remove`.
            if path.file_stem().and_then(|stem| stem.to_str()) != Some(entry.cache_key.as_str()) {
                log::warn!(
                    "Ignoring cache file {} holding key {}",
                    path.display(),
                    short_key(&entry.cache_key)
                );
                continue;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    async fn clear(&self) -> Result<()> {
        for path in self.json_files().await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(Error::cache(format!("remove {}: {}", path.display(), e))),
            }
        }
        Ok(())
    }
}

// ============================================================================
// CACHE
// ============================================================================

/// Time-expiring map from fingerprint to raw response text.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    ttl: TimeDelta,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    /// Create a cache over `store` with the default TTL and the system clock
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            ttl: TimeDelta::days(DEFAULT_TTL_DAYS),
        }
    }

    /// Cache backed by a fresh [`MemoryCacheStore`]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStore::new()))
    }

    /// Set the clock used for timestamps and expiry
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set entry lifetime
    pub fn with_ttl(mut self, ttl: TimeDelta) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> TimeDelta {
        self.ttl
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        now - entry.created_at >= self.ttl
    }

    /// Cached response for `key`, unless absent or expired.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let Some(entry) = self.store.load(key).await? else {
            log::debug!("Cache miss for {}", short_key(key));
            return Ok(None);
        };

        if self.is_expired(&entry, self.clock.now()) {
            log::debug!("Cache entry {} expired", short_key(key));
            return Ok(None);
        }

        log::debug!("Cache hit for {}", short_key(key));
        Ok(Some(entry.response))
    }

    /// Insert or overwrite the response for `key`, stamped with the current time.
    pub async fn put(&self, key: &str, response: impl Into<String>) -> Result<()> {
        self.store
            .save(CacheEntry {
                cache_key: key.to_string(),
                response: response.into(),
                created_at: self.clock.now(),
            })
            .await
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.store.remove(key).await
    }

    /// Evict everything.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear().await
    }

    /// Delete every expired entry and return how many were removed.
    pub async fn clear_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut removed = 0;
        for entry in self.store.entries().await? {
            if self.is_expired(&entry, now) && self.store.remove(&entry.cache_key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("Swept {} expired cache entr(ies)", removed);
        }
        Ok(removed)
    }
}

fn short_key(key: &str) -> &str {
    key.get(..12).unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImageRef, Role};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn cache_with_clock() -> (ResponseCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = ResponseCache::in_memory().with_clock(clock.clone());
        (cache, clock)
    }

    fn conversation() -> Vec<WireMessage> {
        vec![
            WireMessage::system("You are a tutor"),
            WireMessage::user("What is a lifetime?"),
            WireMessage::assistant("A scope for which a reference is valid."),
        ]
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let a = build_cache_key(&conversation());
        let b = build_cache_key(&conversation());
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_cache_key_is_order_sensitive() {
        let mut swapped = conversation();
        swapped.swap(1, 2);
        assert_ne!(build_cache_key(&conversation()), build_cache_key(&swapped));
    }

    #[test]
    fn test_cache_key_distinguishes_role() {
        let a = vec![WireMessage::user("hello")];
        let b = vec![WireMessage::assistant("hello")];
        assert_ne!(build_cache_key(&a), build_cache_key(&b));
    }

    #[test]
    fn test_cache_key_is_not_fooled_by_concatenation() {
        let a = vec![WireMessage::user("ab"), WireMessage::user("c")];
        let b = vec![WireMessage::user("a"), WireMessage::user("bc")];
        assert_ne!(build_cache_key(&a), build_cache_key(&b));
    }

    #[test]
    fn test_cache_key_covers_images() {
        let with_image = |data: &str| {
            let image = ImageRef::from_base64(data, "image/png").unwrap();
            vec![WireMessage {
                role: Role::User,
                content: WireContent::Parts(vec![
                    ContentPart::text("what is this"),
                    ContentPart::image(&image),
                ]),
            }]
        };
        assert_ne!(
            build_cache_key(&with_image("AAAA")),
            build_cache_key(&with_image("BBBB"))
        );
        assert_ne!(
            build_cache_key(&with_image("AAAA")),
            build_cache_key(&[WireMessage::user("what is this")])
        );
    }

    #[tokio::test]
    async fn test_get_after_put() {
        let (cache, _) = cache_with_clock();
        cache.put("k1", "response body").await.unwrap();
        assert_eq!(cache.get("k1").await.unwrap().as_deref(), Some("response body"));
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let (cache, clock) = cache_with_clock();
        cache.put("k1", "old").await.unwrap();
        clock.advance(TimeDelta::days(6));
        cache.put("k1", "new").await.unwrap();
        clock.advance(TimeDelta::days(6));

        // The overwrite restamped created_at
        assert_eq!(cache.get("k1").await.unwrap().as_deref(), Some("new"));
        assert_eq!(cache.store().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ttl_boundary() {
        let (cache, clock) = cache_with_clock();
        cache.put("k1", "v").await.unwrap();

        clock.set(start() + TimeDelta::days(7) - TimeDelta::milliseconds(1));
        assert!(cache.get("k1").await.unwrap().is_some());

        clock.set(start() + TimeDelta::days(7));
        assert!(cache.get("k1").await.unwrap().is_none());

        clock.set(start() + TimeDelta::days(8));
        assert!(cache.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_read_does_not_delete() {
        let (cache, clock) = cache_with_clock();
        cache.put("k1", "v").await.unwrap();
        clock.advance(TimeDelta::days(8));
        assert!(cache.get("k1").await.unwrap().is_none());
        assert_eq!(cache.store().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_expired_keeps_fresh_entries() {
        let (cache, clock) = cache_with_clock();
        cache.put("old-1", "a").await.unwrap();
        cache.put("old-2", "b").await.unwrap();
        clock.advance(TimeDelta::days(5));
        cache.put("fresh", "c").await.unwrap();
        clock.advance(TimeDelta::days(3));

        assert_eq!(cache.clear_expired().await.unwrap(), 2);
        assert_eq!(cache.store().len().await.unwrap(), 1);
        assert_eq!(cache.get("fresh").await.unwrap().as_deref(), Some("c"));

        // idempotent
        assert_eq!(cache.clear_expired().await.unwrap(), 0);
        assert_eq!(cache.store().len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_expired_on_empty_store() {
        let (cache, _) = cache_with_clock();
        assert_eq!(cache.clear_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_custom_ttl() {
        let (cache, clock) = cache_with_clock();
        let cache = cache.with_ttl(TimeDelta::hours(1));
        cache.put("k", "v").await.unwrap();
        clock.advance(TimeDelta::minutes(59));
        assert!(cache.get("k").await.unwrap().is_some());
        clock.advance(TimeDelta::minutes(1));
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let (cache, _) = cache_with_clock();
        cache.put("a", "1").await.unwrap();
        cache.put("b", "2").await.unwrap();

        assert!(cache.remove("a").await.unwrap());
        assert!(!cache.remove("a").await.unwrap());
        cache.clear().await.unwrap();
        assert_eq!(cache.store().len().await.unwrap(), 0);
    }
}
