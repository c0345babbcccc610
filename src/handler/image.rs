use std::sync::Arc;

use tempfile::TempPath;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use super::{ImageCallback, NoopCallback, RequestContext};
use crate::error::{ProcessorError, RequestError};
use crate::image::{Info, OperationList};
use crate::io::{TeeSide, TeeWriter};
use crate::pipeline::{Pipeline, Resolved};

/// How an image request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    /// Authorization denied the request; nothing was written
    Denied,
    /// Bytes came from the derivative cache
    FromCache,
    /// The source bytes were copied unchanged
    PassedThrough,
    /// A processor rendered the derivative
    Rendered,
}

/// Produces the derivative image described by an [`OperationList`].
///
/// Built once per request with [`ImageRequestHandler::builder`];
/// [`ImageRequestHandler::close`] must be called when the response has been
/// written.
pub struct ImageRequestHandler {
    pipeline: Arc<Pipeline>,
    operations: OperationList,
    context: RequestContext,
    callback: Arc<dyn ImageCallback>,
    bypass_cache: bool,
    temp_file: Option<TempPath>,
}

pub struct ImageRequestHandlerBuilder {
    pipeline: Arc<Pipeline>,
    operations: Option<OperationList>,
    context: RequestContext,
    callback: Arc<dyn ImageCallback>,
    bypass_cache: bool,
}

impl ImageRequestHandlerBuilder {
    /// The requested operations. Must not be frozen yet.
    pub fn operations(mut self, operations: OperationList) -> Self {
        self.operations = Some(operations);
        self
    }

    pub fn context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn callback(mut self, callback: Arc<dyn ImageCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Neither read nor write any cache.
    pub fn bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    pub fn build(self) -> Result<ImageRequestHandler, RequestError> {
        let operations = self
            .operations
            .ok_or_else(|| RequestError::IllegalArgument("operation list is not set".into()))?;
        if operations.is_frozen() {
            return Err(RequestError::IllegalArgument(
                "operation list is already frozen".into(),
            ));
        }
        let mut context = self.context;
        context.identifier = Some(operations.identifier().clone());
        Ok(ImageRequestHandler {
            pipeline: self.pipeline,
            operations,
            context,
            callback: self.callback,
            bypass_cache: self.bypass_cache,
            temp_file: None,
        })
    }
}

impl ImageRequestHandler {
    pub fn builder(pipeline: Arc<Pipeline>) -> ImageRequestHandlerBuilder {
        ImageRequestHandlerBuilder {
            pipeline,
            operations: None,
            context: RequestContext::default(),
            callback: Arc::new(NoopCallback),
            bypass_cache: false,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// The requested, unmutated operations.
    pub fn operations(&self) -> &OperationList {
        &self.operations
    }

    /// Write the derivative image to `out`.
    pub async fn handle(
        &mut self,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ImageOutcome, RequestError> {
        let identifier = self.operations.identifier().clone();
        if !self.callback.pre_authorize(&self.context).await {
            debug!(identifier = %identifier, "Image request denied before access");
            return Ok(ImageOutcome::Denied);
        }

        let use_cache = !self.bypass_cache;
        if use_cache && !self.pipeline.settings().resolve_first {
            if let Some(outcome) = self.try_derivative_cache(out).await? {
                return Ok(outcome);
            }
        }

        let mut resolved = self.pipeline.resolve(&identifier, use_cache).await?;
        self.temp_file = resolved.temp_file.take();
        let result = self.render(&mut resolved, out).await;
        resolved.processor.close();
        result
    }

    /// Serve from the derivative cache when both the info and the derivative
    /// are present.
    async fn try_derivative_cache(
        &mut self,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Option<ImageOutcome>, RequestError> {
        let caches = self.pipeline.caches().clone();
        let identifier = self.operations.identifier().clone();
        let Some(info) = caches.get_info(&identifier).await.filter(Info::is_complete) else {
            return Ok(None);
        };
        let ops = self.frozen_operations(&info).await?;
        let Some(mut reader) = caches.new_derivative_image_reader(&ops).await else {
            debug!(identifier = %identifier, "Info cached but derivative is not");
            return Ok(None);
        };

        if !self.callback.authorize(&self.context).await {
            return Ok(Some(ImageOutcome::Denied));
        }
        self.callback.will_stream_image_from_derivative_cache().await;
        let bytes = tokio::io::copy(&mut reader, out).await?;
        out.flush().await?;
        debug!(identifier = %identifier, bytes, "Streamed derivative from cache");
        Ok(Some(ImageOutcome::FromCache))
    }

    /// Apply the source-dependent mutations to a copy of the requested
    /// operations, freeze it and record it in the context.
    async fn frozen_operations(&mut self, info: &Info) -> Result<OperationList, RequestError> {
        self.context.set_info(info, self.operations.page());
        let full_size = info.size(self.operations.page())?;
        let xmp = self.pipeline.delegate().metadata(&self.context).await;

        let mut ops = self.operations.clone();
        ops.apply_non_endpoint_mutations(info, &self.pipeline.settings().encode_defaults, xmp)?;
        ops.freeze();
        self.context.set_operation_list(&ops, full_size);
        Ok(ops)
    }

    async fn render(
        &mut self,
        resolved: &mut Resolved,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<ImageOutcome, RequestError> {
        if let Some(stat) = &resolved.stat {
            self.callback.source_accessed(stat).await;
        }
        self.callback
            .know_available_output_formats(resolved.processor.available_output_formats())
            .await;
        let info = resolved.info.clone();
        self.callback.info_available(&info).await;
        let ops = self.frozen_operations(&info).await?;
        let full_size = info.size(ops.page())?;

        resolved.processor.validate(&ops, full_size)?;
        if !self.callback.authorize(&self.context).await {
            debug!(identifier = %ops.identifier(), "Image request denied");
            return Ok(ImageOutcome::Denied);
        }

        let source_name = resolved.origin.name();
        let processor_name = resolved.processor.name();

        if !ops.has_effect(full_size, info.source_format()) {
            let mut stream = resolved.origin.open_stream().await?;
            let bytes = tokio::io::copy(&mut stream, out).await?;
            out.flush().await?;
            info!(operations = %ops, bytes, "Passed source through unchanged");
            self.record_success(source_name, processor_name);
            return Ok(ImageOutcome::PassedThrough);
        }

        let caches = self.pipeline.caches().clone();
        let cache_writer = if self.bypass_cache {
            None
        } else {
            match caches.new_derivative_image_writer(&ops).await {
                Ok(writer) => writer,
                Err(e) => {
                    error!(operations = %ops, error = %e, "Failed to open derivative cache writer");
                    None
                }
            }
        };
        let caching = cache_writer.is_some();

        self.callback.will_process_image(&info).await;
        let mut tee = TeeWriter::new(&mut *out, cache_writer);
        let mut result = resolved.processor.process(&ops, &info, &mut tee).await;
        if result.is_ok() {
            result = tee.flush().await.map_err(ProcessorError::from);
        }

        match (result, tee.failed_side()) {
            (Err(e), failed) => {
                if caching {
                    warn!(operations = %ops, failed_side = ?failed, error = %e, "Render failed, purging derivative");
                    purge_derivative(&caches, &ops).await;
                }
                Err(e.into())
            }
            (Ok(()), Some(TeeSide::Secondary)) => {
                let cause = tee.take_secondary_error();
                warn!(operations = %ops, failed_side = ?TeeSide::Secondary, error = ?cause, "Derivative cache write failed, purging");
                purge_derivative(&caches, &ops).await;
                self.record_success(source_name, processor_name);
                Ok(ImageOutcome::Rendered)
            }
            (Ok(()), _) => {
                if let Some(writer) = tee.into_secondary() {
                    if let Err(e) = writer.commit().await {
                        error!(operations = %ops, error = %e, "Failed to commit derivative");
                        purge_derivative(&caches, &ops).await;
                    }
                }
                info!(operations = %ops, processor = processor_name, "Rendered derivative");
                self.record_success(source_name, processor_name);
                Ok(ImageOutcome::Rendered)
            }
        }
    }

    fn record_success(&self, source: &'static str, processor: &'static str) {
        self.pipeline
            .health()
            .record(source, processor, self.operations.clone());
    }

    /// Release the request's temp files.
    pub fn close(mut self) {
        if let Some(temp) = self.temp_file.take() {
            debug!(path = %temp.display(), "Deleting temp file");
        }
    }
}

async fn purge_derivative(caches: &crate::cache::CacheFacade, ops: &OperationList) {
    if let Err(e) = caches.purge_operations(ops).await {
        error!(operations = %ops, error = %e, "Failed to purge derivative");
    }
}
