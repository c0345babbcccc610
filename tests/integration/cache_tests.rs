//! Cache behavior tests.
//!
//! Tests verify:
//! - Filesystem derivative cache survives a pipeline restart
//! - Source cache copies are served without touching the source
//! - A failing derivative cache never fails the request
//! - A client write failure leaves no cache entry

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use image_courier::cache::{CacheReader, CacheWriter, DerivativeCache, SourceCache};
use image_courier::error::{CacheError, RequestError};
use image_courier::image::{Crop, Format, Identifier, Info, OperationList, Scale};
use image_courier::{
    CacheFacade, FilesystemCache, ImageOutcome, ImageRequestHandler, InfoService, PipelineSettings,
};

use super::test_utils::{heap_caches, is_valid_png, operations, test_pipeline, SourceDir};

fn png_thumbnail(identifier: &str) -> OperationList {
    operations(identifier, Crop::Square, Scale::Width(24), Format::Png)
}

async fn render_into(
    pipeline: &Arc<image_courier::Pipeline>,
    ops: OperationList,
    out: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<ImageOutcome, RequestError> {
    let mut handler = ImageRequestHandler::builder(pipeline.clone())
        .operations(ops)
        .build()
        .unwrap();
    let result = handler.handle(out).await;
    handler.close();
    result
}

// =============================================================================
// Filesystem Caches
// =============================================================================

#[tokio::test]
async fn test_filesystem_derivative_cache_survives_restart() {
    let dir = SourceDir::new();
    let cache_dir = tempfile::tempdir().unwrap();
    let fs_caches = || {
        CacheFacade::new().with_derivative_cache(Arc::new(FilesystemCache::new(cache_dir.path())))
    };

    let first = test_pipeline(&dir, PipelineSettings::default(), fs_caches());
    let mut rendered = Vec::new();
    let outcome = render_into(&first.pipeline, png_thumbnail("cat.jpg"), &mut rendered)
        .await
        .unwrap();
    assert_eq!(outcome, ImageOutcome::Rendered);

    // The info is written in the background.
    let identifier = Identifier::from("cat.jpg");
    let mut stored = false;
    for _ in 0..100 {
        if first.pipeline.caches().get_info(&identifier).await.is_some() {
            stored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stored, "info was never written to the derivative cache");

    let second = test_pipeline(&dir, PipelineSettings::default(), fs_caches());
    let mut cached = Vec::new();
    let outcome = render_into(&second.pipeline, png_thumbnail("cat.jpg"), &mut cached)
        .await
        .unwrap();
    assert_eq!(outcome, ImageOutcome::FromCache);
    assert_eq!(cached, rendered);
    assert_eq!(second.sources_created(), 0);
}

#[tokio::test]
async fn test_source_cache_copy_is_served_without_source() {
    let dir = SourceDir::new();
    let cache_dir = tempfile::tempdir().unwrap();
    let fs = Arc::new(FilesystemCache::new(cache_dir.path()));

    // "ghost.jpg" only exists as a source cache copy.
    let identifier = Identifier::from("ghost.jpg");
    let mut writer = fs.new_source_image_writer(&identifier).await.unwrap();
    writer.write_all(&dir.jpeg).await.unwrap();
    writer.commit().await.unwrap();

    let caches = CacheFacade::new()
        .with_source_cache(fs.clone())
        .with_info_service(Arc::new(InfoService::new(10)));
    let test = test_pipeline(&dir, PipelineSettings::default(), caches);

    let mut out = Vec::new();
    let outcome = render_into(&test.pipeline, png_thumbnail("ghost.jpg"), &mut out)
        .await
        .unwrap();
    assert_eq!(outcome, ImageOutcome::Rendered);
    assert!(is_valid_png(&out));
    assert_eq!(test.sources_created(), 0);
}

#[tokio::test]
async fn test_resolve_first_ignores_source_cache_copy() {
    let dir = SourceDir::new();
    let cache_dir = tempfile::tempdir().unwrap();
    let fs = Arc::new(FilesystemCache::new(cache_dir.path()));

    let identifier = Identifier::from("ghost.jpg");
    let mut writer = fs.new_source_image_writer(&identifier).await.unwrap();
    writer.write_all(&dir.jpeg).await.unwrap();
    writer.commit().await.unwrap();

    let settings = PipelineSettings {
        resolve_first: true,
        ..Default::default()
    };
    let test = test_pipeline(&dir, settings, CacheFacade::new().with_source_cache(fs));

    let mut out = Vec::new();
    let result = render_into(&test.pipeline, png_thumbnail("ghost.jpg"), &mut out).await;
    assert!(matches!(result, Err(RequestError::NotFound(_))));
    assert_eq!(test.access_checks(), 1);
}

#[tokio::test]
async fn test_bypass_ignores_source_cache_copy() {
    let dir = SourceDir::new();
    let cache_dir = tempfile::tempdir().unwrap();
    let fs = Arc::new(FilesystemCache::new(cache_dir.path()));

    let identifier = Identifier::from("ghost.jpg");
    let mut writer = fs.new_source_image_writer(&identifier).await.unwrap();
    writer.write_all(&dir.jpeg).await.unwrap();
    writer.commit().await.unwrap();

    let test = test_pipeline(
        &dir,
        PipelineSettings::default(),
        CacheFacade::new().with_source_cache(fs),
    );

    let mut handler = ImageRequestHandler::builder(test.pipeline.clone())
        .operations(png_thumbnail("ghost.jpg"))
        .bypass_cache(true)
        .build()
        .unwrap();
    let mut out = Vec::new();
    let result = handler.handle(&mut out).await;
    handler.close();

    assert!(matches!(result, Err(RequestError::NotFound(_))));
    assert_eq!(test.access_checks(), 1);
}

// =============================================================================
// Write Failures
// =============================================================================

/// Derivative cache whose writers fail on the first write.
#[derive(Default)]
struct BrokenCache {
    purges: AtomicUsize,
}

struct BrokenWriter;

impl AsyncWrite for BrokenWriter {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "disk full")))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl CacheWriter for BrokenWriter {
    async fn commit(self: Box<Self>) -> Result<(), CacheError> {
        Err(CacheError::Io("disk full".into()))
    }
}

#[async_trait]
impl DerivativeCache for BrokenCache {
    fn name(&self) -> &'static str {
        "BrokenCache"
    }

    async fn get_info(&self, _identifier: &Identifier) -> Result<Option<Info>, CacheError> {
        Ok(None)
    }

    async fn put_info(&self, _identifier: &Identifier, _info: &Info) -> Result<(), CacheError> {
        Ok(())
    }

    async fn new_derivative_image_reader(
        &self,
        _ops: &OperationList,
    ) -> Result<Option<CacheReader>, CacheError> {
        Ok(None)
    }

    async fn new_derivative_image_writer(
        &self,
        _ops: &OperationList,
    ) -> Result<Box<dyn CacheWriter>, CacheError> {
        Ok(Box::new(BrokenWriter))
    }

    async fn purge_operations(&self, _ops: &OperationList) -> Result<(), CacheError> {
        self.purges.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn purge_identifier(&self, _identifier: &Identifier) -> Result<(), CacheError> {
        Ok(())
    }

    async fn purge_all(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_cache_write_failure_still_serves_client() {
    let dir = SourceDir::new();
    let cache = Arc::new(BrokenCache::default());
    let test = test_pipeline(
        &dir,
        PipelineSettings::default(),
        CacheFacade::new().with_derivative_cache(cache.clone()),
    );

    let mut out = Vec::new();
    let outcome = render_into(&test.pipeline, png_thumbnail("cat.jpg"), &mut out)
        .await
        .unwrap();
    assert_eq!(outcome, ImageOutcome::Rendered);
    assert!(is_valid_png(&out));
    assert_eq!(cache.purges.load(Ordering::SeqCst), 1);
}

/// Client connection that goes away on the first write.
struct HungUpClient;

impl AsyncWrite for HungUpClient {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone")))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[tokio::test]
async fn test_client_failure_leaves_no_derivative() {
    let dir = SourceDir::new();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());

    let mut client = HungUpClient;
    let result = render_into(&test.pipeline, png_thumbnail("cat.jpg"), &mut client).await;
    assert!(result.is_err());

    // Nothing was committed, so the next request renders again.
    let mut out = Vec::new();
    let outcome = render_into(&test.pipeline, png_thumbnail("cat.jpg"), &mut out)
        .await
        .unwrap();
    assert_eq!(outcome, ImageOutcome::Rendered);
    assert_eq!(test.processors.created(), 2);
}
