//! Request handler tests over a real filesystem source.
//!
//! Tests verify:
//! - Missing sources and cache purging
//! - Format inference falling through to magic bytes
//! - Validation against the actual source size
//! - Pass-through of unchanged sources
//! - Derivative and info cache short circuits

use std::sync::{Arc, Mutex};

use image_courier::cache::DerivativeCache;
use image_courier::error::{RequestError, ValidationError};
use image_courier::handler::{ImageCallback, InformationCallback, RequestContext};
use image_courier::source::StatResult;
use image_courier::image::{Crop, Format, Identifier, ImageInfo, Info, Scale};
use image_courier::{ImageOutcome, ImageRequestHandler, InformationRequestHandler, PipelineSettings};

use super::test_utils::{
    heap_caches, is_valid_jpeg, is_valid_png, operations, test_pipeline, SourceDir, HEIGHT, WIDTH,
};

async fn render(
    pipeline: &Arc<image_courier::Pipeline>,
    ops: image_courier::OperationList,
) -> (Result<ImageOutcome, RequestError>, Vec<u8>) {
    let mut handler = ImageRequestHandler::builder(pipeline.clone())
        .operations(ops)
        .build()
        .unwrap();
    let mut out = Vec::new();
    let result = handler.handle(&mut out).await;
    handler.close();
    (result, out)
}

async fn read_info(
    pipeline: &Arc<image_courier::Pipeline>,
    identifier: &str,
) -> Result<Option<Info>, RequestError> {
    let mut handler = InformationRequestHandler::builder(pipeline.clone())
        .identifier(Identifier::from(identifier))
        .build()
        .unwrap();
    let result = handler.handle().await;
    handler.close();
    result
}

// =============================================================================
// Missing Sources
// =============================================================================

#[tokio::test]
async fn test_missing_source_purges_cached_content() {
    let dir = SourceDir::new();
    let settings = PipelineSettings {
        resolve_first: true,
        purge_missing: true,
        ..Default::default()
    };
    let test = test_pipeline(&dir, settings, heap_caches());
    let caches = test.pipeline.caches().clone();

    let identifier = Identifier::from("missing.jpg");
    let stale = Info::new(Format::Jpeg, vec![ImageInfo::untiled(10, 10)]);
    caches
        .derivative_cache()
        .unwrap()
        .put_info(&identifier, &stale)
        .await
        .unwrap();
    assert!(caches.get_info(&identifier).await.is_some());

    let result = read_info(&test.pipeline, "missing.jpg").await;
    assert!(matches!(result, Err(RequestError::NotFound(_))));
    assert_eq!(test.access_checks(), 1);
    assert_eq!(test.processors.created(), 0);

    assert!(caches.get_info(&identifier).await.is_none());
}

#[tokio::test]
async fn test_missing_source_without_purge_keeps_cache() {
    let dir = SourceDir::new();
    let settings = PipelineSettings {
        resolve_first: true,
        ..Default::default()
    };
    let test = test_pipeline(&dir, settings, heap_caches());
    let caches = test.pipeline.caches().clone();

    let identifier = Identifier::from("missing.jpg");
    let stale = Info::new(Format::Jpeg, vec![ImageInfo::untiled(10, 10)]);
    caches
        .derivative_cache()
        .unwrap()
        .put_info(&identifier, &stale)
        .await
        .unwrap();

    let (result, out) = render(
        &test.pipeline,
        operations("missing.jpg", Crop::Full, Scale::Max, Format::Jpeg),
    )
    .await;
    assert!(matches!(result, Err(RequestError::NotFound(_))));
    assert!(out.is_empty());
    assert!(caches.get_info(&identifier).await.is_some());
}

// =============================================================================
// Format Inference
// =============================================================================

#[tokio::test]
async fn test_format_inferred_from_magic_bytes() {
    let dir = SourceDir::new();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());

    let info = read_info(&test.pipeline, "blob.dat").await.unwrap().unwrap();
    assert_eq!(info.source_format(), Format::Jpeg);
    assert_eq!(info.size(0).unwrap().width, WIDTH);
    assert_eq!(info.size(0).unwrap().height, HEIGHT);
    assert_eq!(test.processors.requested(), vec![Format::Jpeg]);
}

#[tokio::test]
async fn test_named_format_needs_no_content_sniffing() {
    let dir = SourceDir::new();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());

    let info = read_info(&test.pipeline, "cat.jpg").await.unwrap().unwrap();
    assert_eq!(info.source_format(), Format::Jpeg);
    assert_eq!(test.magic_reads(), 0);
    assert_eq!(test.processors.requested(), vec![Format::Jpeg]);
}

#[tokio::test]
async fn test_unreadable_source_reports_source_format() {
    let dir = SourceDir::new();
    std::fs::write(dir.path().join("notes.txt"), b"just some text, not an image").unwrap();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());

    let result = read_info(&test.pipeline, "notes.txt").await;
    assert!(matches!(result, Err(RequestError::SourceFormat(_))));
}

#[tokio::test]
async fn test_misnamed_source_falls_through_to_content() {
    let dir = SourceDir::new();
    std::fs::write(dir.path().join("fake.png"), &dir.jpeg).unwrap();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());

    let info = read_info(&test.pipeline, "fake.png").await.unwrap().unwrap();
    assert_eq!(info.source_format(), Format::Jpeg);
    assert_eq!(test.processors.requested(), vec![Format::Png, Format::Jpeg]);
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn test_out_of_bounds_crop_is_rejected_and_not_cached() {
    let dir = SourceDir::new();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());

    let ops = operations(
        "cat.jpg",
        Crop::Pixels {
            x: 100,
            y: 0,
            width: 10,
            height: 10,
        },
        Scale::Max,
        Format::Png,
    );
    let (result, out) = render(&test.pipeline, ops.clone()).await;
    assert!(matches!(
        result,
        Err(RequestError::Validation(ValidationError::CropOutOfBounds { .. }))
    ));
    assert!(out.is_empty());

    let mut frozen = ops;
    frozen.freeze();
    assert!(test
        .pipeline
        .caches()
        .new_derivative_image_reader(&frozen)
        .await
        .is_none());
}

// =============================================================================
// Rendering and Pass-Through
// =============================================================================

#[tokio::test]
async fn test_unchanged_source_passes_through_byte_identical() {
    let dir = SourceDir::new();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());

    let (result, out) = render(
        &test.pipeline,
        operations("cat.jpg", Crop::Full, Scale::Max, Format::Jpeg),
    )
    .await;
    assert_eq!(result.unwrap(), ImageOutcome::PassedThrough);
    assert_eq!(out, dir.jpeg);
}

#[tokio::test]
async fn test_render_converts_format() {
    let dir = SourceDir::new();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());

    let (result, out) = render(
        &test.pipeline,
        operations("dog.png", Crop::Square, Scale::Width(20), Format::Jpeg),
    )
    .await;
    assert_eq!(result.unwrap(), ImageOutcome::Rendered);
    assert!(is_valid_jpeg(&out));
    assert_eq!(test.pipeline.health().len(), 1);
}

#[tokio::test]
async fn test_warm_derivative_skips_source_and_processor() {
    let dir = SourceDir::new();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());
    let ops = || operations("cat.jpg", Crop::Square, Scale::Width(16), Format::Png);

    let (first, rendered) = render(&test.pipeline, ops()).await;
    assert_eq!(first.unwrap(), ImageOutcome::Rendered);
    assert!(is_valid_png(&rendered));
    let sources = test.sources_created();
    let processors = test.processors.created();

    let (second, cached) = render(&test.pipeline, ops()).await;
    assert_eq!(second.unwrap(), ImageOutcome::FromCache);
    assert_eq!(cached, rendered);
    assert_eq!(test.sources_created(), sources);
    assert_eq!(test.processors.created(), processors);
}

#[tokio::test]
async fn test_bypass_cache_renders_every_time() {
    let dir = SourceDir::new();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());

    for _ in 0..2 {
        let mut handler = ImageRequestHandler::builder(test.pipeline.clone())
            .operations(operations("cat.jpg", Crop::Square, Scale::Max, Format::Png))
            .bypass_cache(true)
            .build()
            .unwrap();
        let mut out = Vec::new();
        assert_eq!(handler.handle(&mut out).await.unwrap(), ImageOutcome::Rendered);
        handler.close();
    }
    assert_eq!(test.processors.created(), 2);
}

// =============================================================================
// Info Cache
// =============================================================================

#[tokio::test]
async fn test_warm_info_skips_access_check() {
    let dir = SourceDir::new();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());

    let first = read_info(&test.pipeline, "cat.jpg").await.unwrap().unwrap();
    assert_eq!(test.access_checks(), 1);

    let second = read_info(&test.pipeline, "cat.jpg").await.unwrap().unwrap();
    assert_eq!(second, first);
    assert_eq!(test.access_checks(), 1);
    assert_eq!(test.processors.created(), 1);
}

#[tokio::test]
async fn test_resolve_first_always_checks_source() {
    let dir = SourceDir::new();
    let settings = PipelineSettings {
        resolve_first: true,
        ..Default::default()
    };
    let test = test_pipeline(&dir, settings, heap_caches());

    read_info(&test.pipeline, "cat.jpg").await.unwrap();
    read_info(&test.pipeline, "cat.jpg").await.unwrap();
    assert_eq!(test.access_checks(), 2);
}

// =============================================================================
// Authorization
// =============================================================================

struct DenyAll;

#[async_trait::async_trait]
impl ImageCallback for DenyAll {
    async fn pre_authorize(&self, _context: &RequestContext) -> bool {
        false
    }
}

#[tokio::test]
async fn test_denied_request_never_touches_source() {
    let dir = SourceDir::new();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());

    let mut handler = ImageRequestHandler::builder(test.pipeline.clone())
        .operations(operations("cat.jpg", Crop::Full, Scale::Max, Format::Png))
        .callback(Arc::new(DenyAll))
        .build()
        .unwrap();
    let mut out = Vec::new();
    assert_eq!(handler.handle(&mut out).await.unwrap(), ImageOutcome::Denied);
    handler.close();

    assert!(out.is_empty());
    assert_eq!(test.sources_created(), 0);
}

// =============================================================================
// Callback Hooks
// =============================================================================

/// Remembers what the handler reported about the source and processor.
#[derive(Default)]
struct Recorder {
    stats: Mutex<Vec<StatResult>>,
    output_formats: Mutex<Vec<Format>>,
}

#[async_trait::async_trait]
impl ImageCallback for Recorder {
    async fn source_accessed(&self, stat: &StatResult) {
        self.stats.lock().unwrap().push(*stat);
    }

    async fn know_available_output_formats(&self, formats: &[Format]) {
        self.output_formats.lock().unwrap().extend_from_slice(formats);
    }
}

#[async_trait::async_trait]
impl InformationCallback for Recorder {
    async fn source_accessed(&self, stat: &StatResult) {
        self.stats.lock().unwrap().push(*stat);
    }
}

#[tokio::test]
async fn test_image_callback_learns_source_and_outputs() {
    let dir = SourceDir::new();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());
    let recorder = Arc::new(Recorder::default());

    let mut handler = ImageRequestHandler::builder(test.pipeline.clone())
        .operations(operations("cat.jpg", Crop::Square, Scale::Max, Format::Png))
        .callback(recorder.clone())
        .build()
        .unwrap();
    let mut out = Vec::new();
    assert_eq!(handler.handle(&mut out).await.unwrap(), ImageOutcome::Rendered);
    handler.close();

    let stats = recorder.stats.lock().unwrap().clone();
    assert_eq!(stats.len(), 1);
    assert!(stats[0].last_modified.is_some());
    let formats = recorder.output_formats.lock().unwrap().clone();
    assert!(formats.contains(&Format::Png));
    assert!(formats.contains(&Format::Jpeg));
}

#[tokio::test]
async fn test_info_callback_skipped_on_cache_hit() {
    let dir = SourceDir::new();
    let test = test_pipeline(&dir, PipelineSettings::default(), heap_caches());
    let recorder = Arc::new(Recorder::default());

    for _ in 0..2 {
        let mut handler = InformationRequestHandler::builder(test.pipeline.clone())
            .identifier(Identifier::from("cat.jpg"))
            .callback(recorder.clone())
            .build()
            .unwrap();
        handler.handle().await.unwrap().unwrap();
        handler.close();
    }

    // The second request is answered from the info cache.
    assert_eq!(recorder.stats.lock().unwrap().len(), 1);
}
