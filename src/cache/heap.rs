//! In-memory derivative cache.
//!
//! Derivative images live in an LRU with a byte capacity; least recently
//! used entries are evicted once the total size exceeds it. Infos live in a
//! separate LRU bounded by the same entry limit.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use tokio::io::AsyncWrite;
use tokio::sync::RwLock;

use super::{CacheReader, CacheWriter, DerivativeCache};
use crate::error::CacheError;
use crate::image::{Identifier, Info, OperationList};

/// Default image capacity: 256MB
pub const DEFAULT_HEAP_CACHE_CAPACITY: usize = 256 * 1024 * 1024;

/// Default maximum number of images, and of infos (to bound LRU overhead)
const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Identifier plus operation list fingerprint.
type ImageKey = (Identifier, String);

fn image_key(ops: &OperationList) -> ImageKey {
    (ops.identifier().clone(), ops.fingerprint())
}

struct HeapStore {
    images: RwLock<LruCache<ImageKey, Bytes>>,
    current_size: RwLock<usize>,
    max_size: usize,
    infos: RwLock<LruCache<Identifier, Info>>,
}

impl HeapStore {
    async fn put_image(&self, key: ImageKey, data: Bytes) {
        let data_size = data.len();
        let mut images = self.images.write().await;
        let mut current_size = self.current_size.write().await;

        // replaced or evicted by the entry limit
        if let Some((_, evicted)) = images.push(key, data) {
            *current_size = current_size.saturating_sub(evicted.len());
        }
        *current_size += data_size;

        while *current_size > self.max_size {
            match images.pop_lru() {
                Some((_, evicted)) => *current_size = current_size.saturating_sub(evicted.len()),
                None => break,
            }
        }
    }
}

/// Derivative cache held in process memory.
///
/// Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct HeapCache {
    store: Arc<HeapStore>,
}

impl HeapCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HEAP_CACHE_CAPACITY)
    }

    /// Cache holding at most `max_size` bytes of derivative images.
    pub fn with_capacity(max_size: usize) -> Self {
        Self::with_capacity_and_entries(max_size, DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity_and_entries(max_size: usize, max_entries: usize) -> Self {
        let entries = std::num::NonZeroUsize::new(max_entries).unwrap_or(std::num::NonZeroUsize::MIN);
        Self {
            store: Arc::new(HeapStore {
                images: RwLock::new(LruCache::new(entries)),
                current_size: RwLock::new(0),
                max_size,
                infos: RwLock::new(LruCache::new(entries)),
            }),
        }
    }

    /// Total size of cached images in bytes.
    pub async fn size(&self) -> usize {
        *self.store.current_size.read().await
    }

    pub async fn image_count(&self) -> usize {
        self.store.images.read().await.len()
    }

    pub async fn info_count(&self) -> usize {
        self.store.infos.read().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.store.max_size
    }
}

impl Default for HeapCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DerivativeCache for HeapCache {
    fn name(&self) -> &'static str {
        "HeapCache"
    }

    async fn get_info(&self, identifier: &Identifier) -> Result<Option<Info>, CacheError> {
        Ok(self.store.infos.write().await.get(identifier).cloned())
    }

    async fn put_info(&self, identifier: &Identifier, info: &Info) -> Result<(), CacheError> {
        self.store
            .infos
            .write()
            .await
            .put(identifier.clone(), info.clone());
        Ok(())
    }

    async fn new_derivative_image_reader(
        &self,
        ops: &OperationList,
    ) -> Result<Option<CacheReader>, CacheError> {
        let mut images = self.store.images.write().await;
        Ok(images
            .get(&image_key(ops))
            .cloned()
            .map(|data| Box::new(io::Cursor::new(data)) as CacheReader))
    }

    async fn new_derivative_image_writer(
        &self,
        ops: &OperationList,
    ) -> Result<Box<dyn CacheWriter>, CacheError> {
        Ok(Box::new(HeapWriter {
            store: self.store.clone(),
            key: image_key(ops),
            buffer: Vec::new(),
        }))
    }

    async fn purge_operations(&self, ops: &OperationList) -> Result<(), CacheError> {
        let mut images = self.store.images.write().await;
        let mut current_size = self.store.current_size.write().await;
        if let Some(data) = images.pop(&image_key(ops)) {
            *current_size = current_size.saturating_sub(data.len());
        }
        Ok(())
    }

    async fn purge_identifier(&self, identifier: &Identifier) -> Result<(), CacheError> {
        self.store.infos.write().await.pop(identifier);

        let mut images = self.store.images.write().await;
        let mut current_size = self.store.current_size.write().await;
        let keys: Vec<ImageKey> = images
            .iter()
            .filter(|((id, _), _)| id == identifier)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(data) = images.pop(&key) {
                *current_size = current_size.saturating_sub(data.len());
            }
        }
        Ok(())
    }

    async fn purge_all(&self) -> Result<(), CacheError> {
        self.store.infos.write().await.clear();
        let mut images = self.store.images.write().await;
        let mut current_size = self.store.current_size.write().await;
        images.clear();
        *current_size = 0;
        Ok(())
    }
}

/// Buffers a derivative and inserts it on commit.
struct HeapWriter {
    store: Arc<HeapStore>,
    key: ImageKey,
    buffer: Vec<u8>,
}

impl AsyncWrite for HeapWriter {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut().buffer.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl CacheWriter for HeapWriter {
    async fn commit(self: Box<Self>) -> Result<(), CacheError> {
        let HeapWriter { store, key, buffer } = *self;
        store.put_image(key, Bytes::from(buffer)).await;
        Ok(())
    }
}
