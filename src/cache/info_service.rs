use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::Mutex;

use crate::image::{Identifier, Info};

/// Default number of infos held in memory.
pub const DEFAULT_INFO_CACHE_CAPACITY: usize = 1000;

/// In-process LRU of [`Info`] records in front of the derivative cache.
pub struct InfoService {
    infos: Mutex<LruCache<Identifier, Info>>,
}

impl InfoService {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            infos: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub async fn get(&self, identifier: &Identifier) -> Option<Info> {
        self.infos.lock().await.get(identifier).cloned()
    }

    pub async fn put(&self, identifier: Identifier, info: Info) {
        self.infos.lock().await.put(identifier, info);
    }

    pub async fn purge(&self, identifier: &Identifier) {
        self.infos.lock().await.pop(identifier);
    }

    pub async fn purge_all(&self) {
        self.infos.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.infos.lock().await.len()
    }
}

impl Default for InfoService {
    fn default() -> Self {
        Self::new(DEFAULT_INFO_CACHE_CAPACITY)
    }
}
