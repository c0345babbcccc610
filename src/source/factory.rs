use std::sync::Arc;

use async_trait::async_trait;

use super::{FilesystemSource, FilesystemSourceSettings, S3Source, S3SourceSettings, Source};
use crate::delegate::DelegateProxy;
use crate::error::SourceError;
use crate::image::Identifier;

/// Creates sources bound to an identifier.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    /// A new source bound to `identifier`, with `delegate` attached.
    async fn new_source(
        &self,
        identifier: &Identifier,
        delegate: Arc<dyn DelegateProxy>,
    ) -> Result<Box<dyn Source>, SourceError>;

    /// Release process-wide source resources. Called once at teardown.
    async fn shutdown(&self) {}
}

/// Which backend a [`ConfiguredSourceFactory`] creates.
#[derive(Debug, Clone)]
pub enum SourceSettings {
    Filesystem(FilesystemSourceSettings),
    S3(S3SourceSettings),
}

/// Source factory selecting its backend from settings.
#[derive(Debug, Clone)]
pub struct ConfiguredSourceFactory {
    settings: SourceSettings,
}

impl ConfiguredSourceFactory {
    pub fn new(settings: SourceSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &SourceSettings {
        &self.settings
    }
}

#[async_trait]
impl SourceFactory for ConfiguredSourceFactory {
    async fn new_source(
        &self,
        identifier: &Identifier,
        delegate: Arc<dyn DelegateProxy>,
    ) -> Result<Box<dyn Source>, SourceError> {
        let mut source: Box<dyn Source> = match &self.settings {
            SourceSettings::Filesystem(settings) => Box::new(FilesystemSource::new(settings.clone())),
            SourceSettings::S3(settings) => Box::new(S3Source::new(settings.clone())),
        };
        source.set_delegate(delegate);
        source.set_identifier(identifier.clone());
        Ok(source)
    }

    async fn shutdown(&self) {
        if let SourceSettings::S3(_) = self.settings {
            super::release_shared_client().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::NoopDelegate;

    #[tokio::test]
    async fn test_creates_bound_filesystem_source() {
        let factory = ConfiguredSourceFactory::new(SourceSettings::Filesystem(
            FilesystemSourceSettings {
                path_prefix: "/srv/images/".into(),
                ..Default::default()
            },
        ));
        let source = factory
            .new_source(&Identifier::from("a.jpg"), Arc::new(NoopDelegate))
            .await
            .unwrap();
        assert_eq!(source.name(), "FilesystemSource");
        assert_eq!(source.identifier().map(|id| id.as_str()), Some("a.jpg"));
        assert!(source.file_access().is_some());
    }

    #[tokio::test]
    async fn test_creates_s3_source() {
        let factory = ConfiguredSourceFactory::new(SourceSettings::S3(S3SourceSettings {
            bucket: "b".into(),
            ..Default::default()
        }));
        let source = factory
            .new_source(&Identifier::from("k"), Arc::new(NoopDelegate))
            .await
            .unwrap();
        assert_eq!(source.name(), "S3Source");
        assert!(source.file_access().is_none());
    }
}
