use std::sync::Arc;

use async_trait::async_trait;

use super::RequestContext;
use crate::delegate::DelegateProxy;
use crate::image::{Format, Info};
use crate::source::StatResult;

/// Hooks invoked by the information request handler.
///
/// Every method has a default, so an implementor overrides only what it
/// needs.
#[async_trait]
pub trait InformationCallback: Send + Sync {
    /// Called before any cache or source access. Returning `false` ends the
    /// request without a result.
    async fn authorize(&self, _context: &RequestContext) -> bool {
        true
    }

    /// Called after the source passed its access check.
    async fn source_accessed(&self, _stat: &StatResult) {}
}

/// Hooks invoked by the image request handler.
#[async_trait]
pub trait ImageCallback: Send + Sync {
    /// Called before any cache or source access.
    async fn pre_authorize(&self, _context: &RequestContext) -> bool {
        true
    }

    /// Called once the full size and the frozen operation list are known.
    async fn authorize(&self, _context: &RequestContext) -> bool {
        true
    }

    async fn will_stream_image_from_derivative_cache(&self) {}

    /// Called after the source passed its access check.
    async fn source_accessed(&self, _stat: &StatResult) {}

    /// Output formats the bound processor can produce.
    async fn know_available_output_formats(&self, _formats: &[Format]) {}

    async fn info_available(&self, _info: &Info) {}

    async fn will_process_image(&self, _info: &Info) {}
}

/// Callback that allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCallback;

impl InformationCallback for NoopCallback {}

impl ImageCallback for NoopCallback {}

/// Forwards authorization to a [`DelegateProxy`].
#[derive(Clone)]
pub struct DelegateCallback {
    delegate: Arc<dyn DelegateProxy>,
}

impl DelegateCallback {
    pub fn new(delegate: Arc<dyn DelegateProxy>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl InformationCallback for DelegateCallback {
    async fn authorize(&self, context: &RequestContext) -> bool {
        self.delegate.pre_authorize(context).await
    }
}

#[async_trait]
impl ImageCallback for DelegateCallback {
    async fn pre_authorize(&self, context: &RequestContext) -> bool {
        self.delegate.pre_authorize(context).await
    }

    async fn authorize(&self, context: &RequestContext) -> bool {
        self.delegate.authorize(context).await
    }
}
