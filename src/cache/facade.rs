use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::{CacheReader, CacheWriter, DerivativeCache, InfoService, SourceCache};
use crate::error::{CacheError, ProcessorError};
use crate::image::{Identifier, Info, OperationList};
use crate::processor::Processor;

/// Single entry point to the configured caches.
///
/// Every cache is optional. Read errors are logged and reported as misses,
/// so a faulty cache degrades to an uncached request instead of failing it.
#[derive(Clone, Default)]
pub struct CacheFacade {
    derivative: Option<Arc<dyn DerivativeCache>>,
    source: Option<Arc<dyn SourceCache>>,
    infos: Option<Arc<InfoService>>,
}

impl CacheFacade {
    /// Facade with every cache disabled.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_derivative_cache(mut self, cache: Arc<dyn DerivativeCache>) -> Self {
        self.derivative = Some(cache);
        self
    }

    pub fn with_source_cache(mut self, cache: Arc<dyn SourceCache>) -> Self {
        self.source = Some(cache);
        self
    }

    pub fn with_info_service(mut self, infos: Arc<InfoService>) -> Self {
        self.infos = Some(infos);
        self
    }

    pub fn derivative_cache(&self) -> Option<&Arc<dyn DerivativeCache>> {
        self.derivative.as_ref()
    }

    pub fn source_cache(&self) -> Option<&Arc<dyn SourceCache>> {
        self.source.as_ref()
    }

    pub fn is_derivative_cache_enabled(&self) -> bool {
        self.derivative.is_some()
    }

    pub fn is_source_cache_enabled(&self) -> bool {
        self.source.is_some()
    }

    /// Info for `identifier` from memory, then from the derivative cache.
    pub async fn get_info(&self, identifier: &Identifier) -> Option<Info> {
        if let Some(infos) = &self.infos {
            if let Some(info) = infos.get(identifier).await {
                debug!(identifier = %identifier, "Info found in memory");
                return Some(info);
            }
        }
        let cache = self.derivative.as_ref()?;
        match cache.get_info(identifier).await {
            Ok(Some(info)) => {
                debug!(identifier = %identifier, cache = cache.name(), "Info found in derivative cache");
                if let Some(infos) = &self.infos {
                    infos.put(identifier.clone(), info.clone()).await;
                }
                Some(info)
            }
            Ok(None) => None,
            Err(e) => {
                error!(identifier = %identifier, error = %e, "Failed to read info from derivative cache");
                None
            }
        }
    }

    /// Cached info for `identifier`, or the processor's freshly read one.
    ///
    /// A freshly read info is stored in memory immediately and written to the
    /// derivative cache in the background.
    pub async fn get_or_read_info(
        &self,
        identifier: &Identifier,
        processor: &mut dyn Processor,
    ) -> Result<Info, ProcessorError> {
        if let Some(info) = self.get_info(identifier).await {
            return Ok(info);
        }
        let info = processor.read_info().await?.with_identifier(identifier.clone());
        if let Some(infos) = &self.infos {
            infos.put(identifier.clone(), info.clone()).await;
        }
        if let Some(cache) = self.derivative.clone() {
            let identifier = identifier.clone();
            let info = info.clone();
            tokio::spawn(async move {
                if let Err(e) = cache.put_info(&identifier, &info).await {
                    error!(identifier = %identifier, error = %e, "Failed to write info to derivative cache");
                }
            });
        }
        Ok(info)
    }

    /// Stream over the cached derivative for `ops`, `None` on a miss.
    pub async fn new_derivative_image_reader(&self, ops: &OperationList) -> Option<CacheReader> {
        let cache = self.derivative.as_ref()?;
        match cache.new_derivative_image_reader(ops).await {
            Ok(reader) => reader,
            Err(e) => {
                error!(operations = %ops, error = %e, "Failed to open cached derivative");
                None
            }
        }
    }

    /// A writer for the derivative of `ops`, `None` when no derivative cache
    /// is configured.
    pub async fn new_derivative_image_writer(
        &self,
        ops: &OperationList,
    ) -> Result<Option<Box<dyn CacheWriter>>, CacheError> {
        match &self.derivative {
            Some(cache) => cache.new_derivative_image_writer(ops).await.map(Some),
            None => Ok(None),
        }
    }

    /// Path of the source cache copy of `identifier`, if any.
    pub async fn get_source_cache_file(&self, identifier: &Identifier) -> Option<PathBuf> {
        let cache = self.source.as_ref()?;
        match cache.get_source_image_file(identifier).await {
            Ok(path) => path,
            Err(e) => {
                error!(identifier = %identifier, error = %e, "Failed to query source cache");
                None
            }
        }
    }

    /// Remove everything cached for `identifier` from every cache.
    pub async fn purge(&self, identifier: &Identifier) -> Result<(), CacheError> {
        if let Some(infos) = &self.infos {
            infos.purge(identifier).await;
        }
        if let Some(cache) = &self.derivative {
            cache.purge_identifier(identifier).await?;
        }
        if let Some(cache) = &self.source {
            cache.purge_source(identifier).await?;
        }
        info!(identifier = %identifier, "Purged cached content");
        Ok(())
    }

    /// [`CacheFacade::purge`] on a background task.
    pub fn purge_async(self: &Arc<Self>, identifier: Identifier) -> JoinHandle<()> {
        let caches = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = caches.purge(&identifier).await {
                error!(identifier = %identifier, error = %e, "Purge failed");
            }
        })
    }

    /// Remove the derivative for `ops`.
    pub async fn purge_operations(&self, ops: &OperationList) -> Result<(), CacheError> {
        match &self.derivative {
            Some(cache) => cache.purge_operations(ops).await,
            None => Ok(()),
        }
    }

    pub async fn purge_all(&self) -> Result<(), CacheError> {
        if let Some(infos) = &self.infos {
            infos.purge_all().await;
        }
        if let Some(cache) = &self.derivative {
            cache.purge_all().await?;
        }
        if let Some(cache) = &self.source {
            cache.purge_all_sources().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FilesystemCache, HeapCache};
    use crate::image::{Crop, Encode, Format, ImageInfo, Operation};
    use tokio::io::AsyncWriteExt;

    fn sample_info() -> Info {
        Info::new(Format::Jpeg, vec![ImageInfo::untiled(64, 56)])
    }

    #[tokio::test]
    async fn test_disabled_facade_misses() {
        let caches = CacheFacade::new();
        let id = Identifier::from("a.jpg");
        assert!(caches.get_info(&id).await.is_none());
        assert!(caches.get_source_cache_file(&id).await.is_none());
        let ops = OperationList::new(id.clone()).with(Operation::Encode(Encode::new(Format::Png)));
        assert!(caches.new_derivative_image_reader(&ops).await.is_none());
        assert!(caches.new_derivative_image_writer(&ops).await.unwrap().is_none());
        caches.purge(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_info_is_promoted_into_memory() {
        let heap = Arc::new(HeapCache::new());
        let infos = Arc::new(InfoService::default());
        let caches = CacheFacade::new()
            .with_derivative_cache(heap.clone())
            .with_info_service(infos.clone());
        let id = Identifier::from("a.jpg");
        heap.put_info(&id, &sample_info()).await.unwrap();

        assert_eq!(caches.get_info(&id).await, Some(sample_info()));
        assert_eq!(infos.get(&id).await, Some(sample_info()));
    }

    #[tokio::test]
    async fn test_purge_reaches_every_cache() {
        let dir = tempfile::tempdir().unwrap();
        let fs = Arc::new(FilesystemCache::new(dir.path()));
        let infos = Arc::new(InfoService::default());
        let caches = Arc::new(
            CacheFacade::new()
                .with_derivative_cache(fs.clone())
                .with_source_cache(fs.clone())
                .with_info_service(infos.clone()),
        );
        let id = Identifier::from("a.jpg");
        fs.put_info(&id, &sample_info()).await.unwrap();
        infos.put(id.clone(), sample_info()).await;
        let mut writer = fs.new_source_image_writer(&id).await.unwrap();
        writer.write_all(b"source").await.unwrap();
        writer.commit().await.unwrap();

        let mut ops = OperationList::new(id.clone())
            .with(Operation::Crop(Crop::Square))
            .with(Operation::Encode(Encode::new(Format::Png)));
        ops.freeze();
        let mut writer = caches.new_derivative_image_writer(&ops).await.unwrap().unwrap();
        writer.write_all(b"derivative").await.unwrap();
        writer.commit().await.unwrap();

        caches.purge_async(id.clone()).await.unwrap();

        assert!(caches.get_info(&id).await.is_none());
        assert!(caches.get_source_cache_file(&id).await.is_none());
        assert!(caches.new_derivative_image_reader(&ops).await.is_none());
    }
}
