//! Result cache for fetched images.
//!
//! Entries are immutable payloads keyed by content id, so concurrent writers
//! need no coordination: the last `put` wins.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use lru::LruCache;
use tokio::sync::Mutex;
use tracing::*;

use crate::ImagePayload;

/// Successful results are kept for a year, i.e. until invalidated.
pub const IMAGE_CACHE_TTL: Duration = Duration::from_secs(31_536_000);

pub fn image_key(file_id: &str) -> String {
    format!("gdrive_image_{file_id}")
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ImagePayload>, CacheError>;

    async fn put(&self, key: &str, entry: ImagePayload, ttl: Duration) -> Result<(), CacheError>;

    async fn forget(&self, key: &str) -> Result<(), CacheError>;

    async fn forget_many(&self, keys: &[String]) -> Result<(), CacheError> {
        for key in keys {
            self.forget(key).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<C: ResultCache + ?Sized> ResultCache for Arc<C> {
    async fn get(&self, key: &str) -> Result<Option<ImagePayload>, CacheError> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, entry: ImagePayload, ttl: Duration) -> Result<(), CacheError> {
        (**self).put(key, entry, ttl).await
    }

    async fn forget(&self, key: &str) -> Result<(), CacheError> {
        (**self).forget(key).await
    }

    async fn forget_many(&self, keys: &[String]) -> Result<(), CacheError> {
        (**self).forget_many(keys).await
    }
}

struct Stored {
    entry: ImagePayload,
    expires_at: Option<Instant>,
}

impl Stored {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |expires_at| now < expires_at)
    }
}

/// Entries a [`MemoryCache`] holds before evicting the least recently used.
pub const DEFAULT_CAPACITY: usize = 512;

/// Process-local cache, bounded by entry count. Expired entries are dropped
/// when read and swept on every write.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, Stored>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::with_capacity(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        MemoryCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .iter()
            .filter(|(_, stored)| stored.is_live(now))
            .count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn sweep_expired(entries: &mut LruCache<String, Stored>, now: Instant) {
    let expired: Vec<String> = entries
        .iter()
        .filter(|(_, stored)| !stored.is_live(now))
        .map(|(key, _)| key.clone())
        .collect();
    for key in expired {
        entries.pop(&key);
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<ImagePayload>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let found = entries
            .get(key)
            .map(|stored| stored.is_live(now).then(|| stored.entry.clone()));
        match found {
            Some(Some(entry)) => Ok(Some(entry)),
            Some(None) => {
                trace!(key, "Evicting expired entry");
                entries.pop(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, entry: ImagePayload, ttl: Duration) -> Result<(), CacheError> {
        let now = Instant::now();
        let expires_at = now.checked_add(ttl);
        let mut entries = self.entries.lock().await;
        sweep_expired(&mut entries, now);
        if let Some((evicted, _)) = entries.push(key.to_owned(), Stored { entry, expires_at }) {
            if evicted != key {
                debug!(key = %evicted, "Cache full, evicted least recently used entry");
            }
        }
        Ok(())
    }

    async fn forget(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().await.pop(key);
        Ok(())
    }

    async fn forget_many(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.pop(key);
        }
        Ok(())
    }
}

/// Image-level view of a [`ResultCache`]: applies the `gdrive_image_` key
/// convention and the invalidation rules for deleted or replaced images.
#[derive(Clone)]
pub struct ImageCache<C> {
    store: C,
}

impl<C: ResultCache> ImageCache<C> {
    pub fn new(store: C) -> Self {
        ImageCache { store }
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    /// Cached successful payload for `file_id`. Backend failures count as a miss.
    pub async fn get_image(&self, file_id: &str) -> Option<ImagePayload> {
        match self.store.get(&image_key(file_id)).await {
            Ok(entry) => entry.filter(|payload| payload.success),
            Err(err) => {
                warn!(file_id, error = %err, "Image cache read failed");
                None
            }
        }
    }

    /// Stores a successful payload; failed ones are never cached.
    pub async fn put_image(&self, file_id: &str, payload: ImagePayload) {
        if !payload.success {
            return;
        }
        if let Err(err) = self
            .store
            .put(&image_key(file_id), payload, IMAGE_CACHE_TTL)
            .await
        {
            warn!(file_id, error = %err, "Image cache write failed");
        }
    }

    pub async fn invalidate_image(&self, file_id: &str) -> Result<(), CacheError> {
        self.store.forget(&image_key(file_id)).await
    }

    pub async fn invalidate_images(&self, file_ids: &[String]) -> Result<(), CacheError> {
        let keys: Vec<String> = file_ids.iter().map(|id| image_key(id)).collect();
        self.store.forget_many(&keys).await
    }

    /// Drops every picture of a gallery from the cache. Pictures that never
    /// got a file id are skipped. Returns the ids that were invalidated so
    /// front ends can purge their own copies.
    pub async fn invalidate_gallery<I>(&self, picture_file_ids: I) -> Result<Vec<String>, CacheError>
    where
        I: IntoIterator<Item = Option<String>>,
    {
        let file_ids: Vec<String> = picture_file_ids.into_iter().flatten().collect();
        self.invalidate_images(&file_ids).await?;
        debug!(count = file_ids.len(), "Invalidated gallery images");
        Ok(file_ids)
    }
}
