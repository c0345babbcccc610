//! Per-request customization hooks.
//!
//! A [`DelegateProxy`] answers authorization questions and supplies
//! per-identifier lookups for sources configured with the delegate lookup
//! strategy. Every method has a permissive default, so [`NoopDelegate`] is
//! a complete implementation.

use async_trait::async_trait;

use crate::error::SourceError;
use crate::handler::RequestContext;
use crate::image::Identifier;
use crate::source::S3ObjectInfo;

#[async_trait]
pub trait DelegateProxy: Send + Sync {
    /// Called before any cache or source access.
    async fn pre_authorize(&self, _context: &RequestContext) -> bool {
        true
    }

    /// Called once the full size and operations of the request are known.
    async fn authorize(&self, _context: &RequestContext) -> bool {
        true
    }

    /// Pathname of the file backing `identifier`, for the filesystem source.
    async fn filesystem_pathname(
        &self,
        _identifier: &Identifier,
    ) -> Result<Option<String>, SourceError> {
        Ok(None)
    }

    /// Location of the object backing `identifier`, for the S3 source.
    async fn s3_object_info(
        &self,
        _identifier: &Identifier,
    ) -> Result<Option<S3ObjectInfo>, SourceError> {
        Ok(None)
    }

    /// XMP packet to embed in derivative images.
    async fn metadata(&self, _context: &RequestContext) -> Option<String> {
        None
    }
}

/// Delegate that allows everything and resolves nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopDelegate;

impl DelegateProxy for NoopDelegate {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_delegate_defaults() {
        let delegate = NoopDelegate;
        let context = RequestContext::default();
        assert!(delegate.pre_authorize(&context).await);
        assert!(delegate.authorize(&context).await);
        assert!(delegate.metadata(&context).await.is_none());
        let id = Identifier::from("a.jpg");
        assert!(delegate.filesystem_pathname(&id).await.unwrap().is_none());
        assert!(delegate.s3_object_info(&id).await.unwrap().is_none());
    }
}
