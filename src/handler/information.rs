use std::sync::Arc;

use tempfile::TempPath;
use tracing::debug;

use super::{InformationCallback, NoopCallback, RequestContext};
use crate::error::RequestError;
use crate::image::{Identifier, Info};
use crate::pipeline::Pipeline;

/// Produces the [`Info`] of one source image.
///
/// Built once per request with [`InformationRequestHandler::builder`];
/// [`InformationRequestHandler::close`] must be called when the response has
/// been written.
pub struct InformationRequestHandler {
    pipeline: Arc<Pipeline>,
    identifier: Identifier,
    context: RequestContext,
    callback: Arc<dyn InformationCallback>,
    bypass_cache: bool,
    temp_file: Option<TempPath>,
}

pub struct InformationRequestHandlerBuilder {
    pipeline: Arc<Pipeline>,
    identifier: Option<Identifier>,
    context: RequestContext,
    callback: Arc<dyn InformationCallback>,
    bypass_cache: bool,
}

impl InformationRequestHandlerBuilder {
    pub fn identifier(mut self, identifier: Identifier) -> Self {
        self.identifier = Some(identifier);
        self
    }

    pub fn context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    pub fn callback(mut self, callback: Arc<dyn InformationCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Skip the info caches entirely.
    pub fn bypass_cache(mut self, bypass: bool) -> Self {
        self.bypass_cache = bypass;
        self
    }

    pub fn build(self) -> Result<InformationRequestHandler, RequestError> {
        let identifier = self
            .identifier
            .ok_or_else(|| RequestError::IllegalArgument("identifier is not set".into()))?;
        let mut context = self.context;
        context.identifier = Some(identifier.clone());
        Ok(InformationRequestHandler {
            pipeline: self.pipeline,
            identifier,
            context,
            callback: self.callback,
            bypass_cache: self.bypass_cache,
            temp_file: None,
        })
    }
}

impl InformationRequestHandler {
    pub fn builder(pipeline: Arc<Pipeline>) -> InformationRequestHandlerBuilder {
        InformationRequestHandlerBuilder {
            pipeline,
            identifier: None,
            context: RequestContext::default(),
            callback: Arc::new(NoopCallback),
            bypass_cache: false,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    /// The info of the source image, or `None` when authorization denied
    /// the request.
    pub async fn handle(&mut self) -> Result<Option<Info>, RequestError> {
        if !self.callback.authorize(&self.context).await {
            debug!(identifier = %self.identifier, "Info request denied");
            return Ok(None);
        }

        let use_cache = !self.bypass_cache;
        if use_cache && !self.pipeline.settings().resolve_first {
            let cached = self.pipeline.caches().get_info(&self.identifier).await;
            if let Some(info) = cached.filter(Info::is_complete) {
                debug!(identifier = %self.identifier, "Serving info from cache");
                self.context.set_info(&info, 0);
                return Ok(Some(info));
            }
        }

        let mut resolved = self.pipeline.resolve(&self.identifier, use_cache).await?;
        if let Some(stat) = &resolved.stat {
            self.callback.source_accessed(stat).await;
        }
        resolved.processor.close();
        self.temp_file = resolved.temp_file.take();
        self.context.set_info(&resolved.info, 0);
        Ok(Some(resolved.info))
    }

    /// Release the request's temp files.
    pub fn close(mut self) {
        if let Some(temp) = self.temp_file.take() {
            debug!(path = %temp.display(), "Deleting temp file");
        }
    }
}
