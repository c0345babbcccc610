//! Test utilities for integration tests.
//!
//! Builds pipelines over a temporary filesystem source, with factories that
//! count how often the source and processor sides are reached.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgb, RgbImage};
use tempfile::TempDir;

use image_courier::delegate::DelegateProxy;
use image_courier::error::{ProcessorError, SourceError};
use image_courier::image::{Crop, Encode, Format, Identifier, Operation, OperationList, Scale};
use image_courier::processor::{Processor, ProcessorFactory, RasterProcessorFactory};
use image_courier::source::{
    ConfiguredSourceFactory, FilesystemSourceSettings, FormatProbe, LookupStrategy, Source,
    SourceFactory, SourceSettings,
};
use image_courier::{CacheFacade, HeapCache, InfoService, Pipeline, PipelineSettings};

// =============================================================================
// Test Images
// =============================================================================

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 56;

/// A 64x56 gradient encoded as `format`.
pub fn encode_test_image(format: ImageFormat) -> Vec<u8> {
    let img = RgbImage::from_fn(WIDTH, HEIGHT, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 128]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

pub fn is_valid_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data[0] == 0xFF && data[1] == 0xD8
}

pub fn is_valid_png(data: &[u8]) -> bool {
    data.starts_with(&[0x89, b'P', b'N', b'G'])
}

/// Temporary source directory holding `cat.jpg`, `dog.png` and `blob.dat`
/// (JPEG content behind an extension that names no format).
pub struct SourceDir {
    pub dir: TempDir,
    pub jpeg: Vec<u8>,
}

impl SourceDir {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let jpeg = encode_test_image(ImageFormat::Jpeg);
        std::fs::write(dir.path().join("cat.jpg"), &jpeg).unwrap();
        std::fs::write(dir.path().join("blob.dat"), &jpeg).unwrap();
        std::fs::write(
            dir.path().join("dog.png"),
            encode_test_image(ImageFormat::Png),
        )
        .unwrap();
        Self { dir, jpeg }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn settings(&self) -> SourceSettings {
        SourceSettings::Filesystem(FilesystemSourceSettings {
            path_prefix: format!("{}/", self.path().display()),
            path_suffix: String::new(),
            lookup_strategy: LookupStrategy::Basic,
        })
    }
}

// =============================================================================
// Counting Factories
// =============================================================================

/// Source factory that counts sources and access checks.
pub struct SpySourceFactory {
    inner: ConfiguredSourceFactory,
    pub sources_created: Arc<AtomicUsize>,
    pub access_checks: Arc<AtomicUsize>,
    pub magic_reads: Arc<AtomicUsize>,
}

impl SpySourceFactory {
    pub fn new(settings: SourceSettings) -> Self {
        Self {
            inner: ConfiguredSourceFactory::new(settings),
            sources_created: Arc::new(AtomicUsize::new(0)),
            access_checks: Arc::new(AtomicUsize::new(0)),
            magic_reads: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl SourceFactory for SpySourceFactory {
    async fn new_source(
        &self,
        identifier: &Identifier,
        delegate: Arc<dyn DelegateProxy>,
    ) -> Result<Box<dyn Source>, SourceError> {
        self.sources_created.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.new_source(identifier, delegate).await?;
        Ok(Box::new(SpySource {
            inner,
            access_checks: self.access_checks.clone(),
            magic_reads: self.magic_reads.clone(),
        }))
    }
}

struct SpySource {
    inner: Box<dyn Source>,
    access_checks: Arc<AtomicUsize>,
    magic_reads: Arc<AtomicUsize>,
}

#[async_trait]
impl FormatProbe for SpySource {
    async fn object_name(&self) -> Result<Option<String>, SourceError> {
        self.inner.format_probe().object_name().await
    }

    fn raw_identifier(&self) -> Option<&Identifier> {
        self.inner.format_probe().raw_identifier()
    }

    async fn declared_media_type(&self) -> Result<Option<String>, SourceError> {
        self.inner.format_probe().declared_media_type().await
    }

    async fn read_magic_bytes(&self, len: usize) -> Result<Bytes, SourceError> {
        self.magic_reads.fetch_add(1, Ordering::SeqCst);
        self.inner.format_probe().read_magic_bytes(len).await
    }
}

#[async_trait]
impl Source for SpySource {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn set_identifier(&mut self, identifier: Identifier) {
        self.inner.set_identifier(identifier);
    }

    fn identifier(&self) -> Option<&Identifier> {
        self.inner.identifier()
    }

    fn set_delegate(&mut self, delegate: Arc<dyn DelegateProxy>) {
        self.inner.set_delegate(delegate);
    }

    async fn stat(&self) -> Result<image_courier::source::StatResult, SourceError> {
        self.inner.stat().await
    }

    async fn check_access(&self) -> Result<image_courier::source::StatResult, SourceError> {
        self.access_checks.fetch_add(1, Ordering::SeqCst);
        self.inner.check_access().await
    }

    fn format_probe(&self) -> &dyn FormatProbe {
        self
    }

    fn file_access(&self) -> Option<&dyn image_courier::source::FileAccess> {
        self.inner.file_access()
    }

    fn stream_access(&self) -> Option<&dyn image_courier::source::StreamAccess> {
        self.inner.stream_access()
    }
}

/// Processor factory that counts processors and remembers requested formats.
#[derive(Default)]
pub struct CountingProcessorFactory {
    pub created: AtomicUsize,
    pub requested: std::sync::Mutex<Vec<Format>>,
}

impl CountingProcessorFactory {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<Format> {
        self.requested.lock().unwrap().clone()
    }
}

impl ProcessorFactory for CountingProcessorFactory {
    fn new_processor(&self, format: Format) -> Result<Box<dyn Processor>, ProcessorError> {
        self.requested.lock().unwrap().push(format);
        let processor = RasterProcessorFactory.new_processor(format)?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(processor)
    }
}

// =============================================================================
// Pipelines
// =============================================================================

pub struct TestPipeline {
    pub pipeline: Arc<Pipeline>,
    pub sources: Arc<SpySourceFactory>,
    pub processors: Arc<CountingProcessorFactory>,
}

impl TestPipeline {
    pub fn access_checks(&self) -> usize {
        self.sources.access_checks.load(Ordering::SeqCst)
    }

    pub fn sources_created(&self) -> usize {
        self.sources.sources_created.load(Ordering::SeqCst)
    }

    pub fn magic_reads(&self) -> usize {
        self.sources.magic_reads.load(Ordering::SeqCst)
    }
}

/// Heap derivative cache plus in-memory info cache.
pub fn heap_caches() -> CacheFacade {
    CacheFacade::new()
        .with_derivative_cache(Arc::new(HeapCache::with_capacity(16 * 1024 * 1024)))
        .with_info_service(Arc::new(InfoService::new(100)))
}

pub fn test_pipeline(
    source_dir: &SourceDir,
    settings: PipelineSettings,
    caches: CacheFacade,
) -> TestPipeline {
    let sources = Arc::new(SpySourceFactory::new(source_dir.settings()));
    let processors = Arc::new(CountingProcessorFactory::default());
    let pipeline = Arc::new(Pipeline::new(
        settings,
        Arc::new(caches),
        sources.clone(),
        processors.clone(),
    ));
    TestPipeline {
        pipeline,
        sources,
        processors,
    }
}

/// `{identifier}/{crop}/{scale}/0/default.{format}` as an operation list.
pub fn operations(identifier: &str, crop: Crop, scale: Scale, format: Format) -> OperationList {
    OperationList::new(Identifier::from(identifier))
        .with(Operation::Crop(crop))
        .with(Operation::Scale(scale))
        .with(Operation::Encode(Encode::new(format)))
}
