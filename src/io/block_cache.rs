use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use tokio::sync::{Notify, RwLock};

use super::range_reader::check_bounds;
use super::RangeReader;
use crate::error::IoError;

/// Default block size: 256KB
pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;

/// Default capacity in blocks (16MB with the default block size).
pub const DEFAULT_BLOCK_CAPACITY: usize = 64;

/// Block-aligned read cache in front of a seekable source stream.
///
/// Used only when the stream performs true range requests. Format probes
/// and processors issue a few small reads near the start of an object and
/// then one large read; aligning them to blocks lets the large read reuse
/// the header block instead of fetching it twice.
///
/// - fixed-size blocks, LRU eviction
/// - concurrent requests for the same block share one fetch
/// - reads spanning several blocks are stitched together
pub struct BlockCache<R: ?Sized> {
    inner: Arc<R>,
    block_size: usize,
    blocks: RwLock<LruCache<u64, Bytes>>,
    in_flight: Mutex<HashMap<u64, Arc<Notify>>>,
}

/// Releases a block fetch when it completes or is cancelled.
struct FetchGuard<'a> {
    in_flight: &'a Mutex<HashMap<u64, Arc<Notify>>>,
    index: u64,
    notify: Arc<Notify>,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        lock(self.in_flight).remove(&self.index);
        self.notify.notify_waiters();
    }
}

fn lock(in_flight: &Mutex<HashMap<u64, Arc<Notify>>>) -> MutexGuard<'_, HashMap<u64, Arc<Notify>>> {
    in_flight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<R: RangeReader + ?Sized> BlockCache<R> {
    pub fn new(inner: Arc<R>) -> Self {
        Self::with_capacity(inner, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_CAPACITY)
    }

    /// `block_size` and `capacity` are clamped to at least 1.
    pub fn with_capacity(inner: Arc<R>, block_size: usize, capacity: usize) -> Self {
        Self {
            inner,
            block_size: block_size.max(1),
            blocks: RwLock::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn block(&self, index: u64) -> Result<Bytes, IoError> {
        loop {
            if let Some(data) = self.blocks.read().await.peek(&index) {
                return Ok(data.clone());
            }

            let existing = {
                let mut in_flight = lock(&self.in_flight);
                match in_flight.get(&index) {
                    Some(existing) => Some(existing.clone()),
                    None => {
                        in_flight.insert(index, Arc::new(Notify::new()));
                        None
                    }
                }
            };

            if let Some(existing) = existing {
                let notified = existing.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let still_running = lock(&self.in_flight)
                    .get(&index)
                    .is_some_and(|current| Arc::ptr_eq(current, &existing));
                if still_running {
                    notified.await;
                }
                continue;
            }

            let notify = match lock(&self.in_flight).get(&index) {
                Some(notify) => notify.clone(),
                None => continue,
            };
            let _guard = FetchGuard {
                in_flight: &self.in_flight,
                index,
                notify,
            };
            let result = self.fetch(index).await;
            if let Ok(ref data) = result {
                self.blocks.write().await.put(index, data.clone());
            }
            return result;
        }
    }

    async fn fetch(&self, index: u64) -> Result<Bytes, IoError> {
        let offset = index * self.block_size as u64;
        let remaining = self.inner.size().saturating_sub(offset);
        let len = std::cmp::min(self.block_size as u64, remaining) as usize;
        self.inner.read_exact_at(offset, len).await
    }
}

#[async_trait]
impl<R: RangeReader + ?Sized> RangeReader for BlockCache<R> {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        check_bounds(offset, len, self.inner.size())?;
        if len == 0 {
            return Ok(Bytes::new());
        }

        let block_size = self.block_size as u64;
        let first = offset / block_size;
        let last = (offset + len as u64 - 1) / block_size;

        if first == last {
            let block = self.block(first).await?;
            let start = (offset % block_size) as usize;
            return Ok(block.slice(start..start + len));
        }

        let mut out = BytesMut::with_capacity(len);
        let mut position = offset;
        for index in first..=last {
            let block = self.block(index).await?;
            let start = (position % block_size) as usize;
            let take = std::cmp::min(block.len() - start, len - out.len());
            out.extend_from_slice(&block[start..start + take]);
            position += take as u64;
        }
        Ok(out.freeze())
    }

    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn identifier(&self) -> &str {
        self.inner.identifier()
    }
}
