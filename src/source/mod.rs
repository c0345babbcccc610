//! Sources: where source image bytes come from.
//!
//! A [`Source`] is bound to one identifier at a time. It verifies that the
//! backing object is accessible, exposes a [`FormatInferenceChain`] over the
//! object, and offers byte access through either or both of two optional
//! capabilities:
//!
//! - [`FileAccess`]: a local path a processor can open directly
//! - [`StreamAccess`]: a [`StreamFactory`] producing independent streams
//!
//! Location lookups are computed lazily, once per identifier binding, and
//! are discarded by [`Source::set_identifier`].

mod factory;
mod filesystem;
mod format_chain;
mod s3;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::delegate::DelegateProxy;
use crate::error::SourceError;
use crate::image::Identifier;
use crate::io::{BufferedRangeReader, FileRangeReader, RangeReader};

pub use factory::{ConfiguredSourceFactory, SourceFactory, SourceSettings};
pub use filesystem::{FilesystemSource, FilesystemSourceSettings};
pub use format_chain::{
    CachedFileProbe, FormatCandidates, FormatInferenceChain, FormatProbe, InferenceStep,
};
pub use s3::{release_shared_client, S3ObjectInfo, S3Source, S3SourceSettings};

/// Freshness descriptor of a source object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatResult {
    pub last_modified: Option<SystemTime>,
}

/// How a source maps an identifier to a backend location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LookupStrategy {
    /// Prefix and suffix concatenation around the identifier
    #[default]
    Basic,
    /// Ask the delegate
    Delegate,
}

#[async_trait]
pub trait Source: Send + Sync {
    /// Short backend name, used in logs and health reports.
    fn name(&self) -> &'static str;

    /// Bind the source to `identifier`, discarding any cached lookup.
    fn set_identifier(&mut self, identifier: Identifier);

    fn identifier(&self) -> Option<&Identifier>;

    fn set_delegate(&mut self, delegate: Arc<dyn DelegateProxy>);

    /// Fetch the object's freshness descriptor.
    ///
    /// Fails with `NotFound` when the object is absent, `AccessDenied` when
    /// it exists but cannot be read, and `Io` otherwise.
    async fn stat(&self) -> Result<StatResult, SourceError>;

    /// Verify the object is readable, returning what was learned about it.
    /// Same failure kinds as [`Source::stat`].
    async fn check_access(&self) -> Result<StatResult, SourceError> {
        self.stat().await
    }

    /// The probe the format inference chain runs against.
    fn format_probe(&self) -> &dyn FormatProbe;

    /// A fresh format inference chain over the bound object.
    fn format_iterator(&self) -> FormatInferenceChain<'_> {
        FormatInferenceChain::new(self.format_probe())
    }

    fn file_access(&self) -> Option<&dyn FileAccess> {
        None
    }

    fn stream_access(&self) -> Option<&dyn StreamAccess> {
        None
    }

    /// Release process-wide resources. Called once at teardown.
    async fn shutdown(&self) {}
}

/// Direct access to a source object as a local file.
#[async_trait]
pub trait FileAccess: Send + Sync {
    async fn file(&self) -> Result<PathBuf, SourceError>;
}

/// Stream access to a source object.
#[async_trait]
pub trait StreamAccess: Send + Sync {
    async fn new_stream_factory(&self) -> Result<Arc<dyn StreamFactory>, SourceError>;
}

/// Produces independent streams over one source object.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    /// Location of the object, for logs.
    fn location(&self) -> &str;

    /// A new sequential stream positioned at the start of the object.
    async fn new_stream(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>, SourceError>;

    /// A new seekable stream. The default buffers a sequential stream.
    async fn new_seekable_stream(&self) -> Result<Arc<dyn RangeReader>, SourceError> {
        let stream = self.new_stream().await?;
        let reader = BufferedRangeReader::read_from(self.location(), stream).await?;
        Ok(Arc::new(reader))
    }

    /// Whether [`StreamFactory::new_seekable_stream`] performs true range
    /// reads rather than emulating them in memory.
    fn is_seeking_direct(&self) -> bool {
        false
    }
}

/// Streams over a local file.
#[derive(Debug, Clone)]
pub struct FileStreamFactory {
    path: PathBuf,
    location: String,
}

impl FileStreamFactory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let location = path.display().to_string();
        Self { path, location }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[async_trait]
impl StreamFactory for FileStreamFactory {
    fn location(&self) -> &str {
        &self.location
    }

    async fn new_stream(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>, SourceError> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(Box::new(file))
    }

    async fn new_seekable_stream(&self) -> Result<Arc<dyn RangeReader>, SourceError> {
        Ok(Arc::new(FileRangeReader::open(&self.path).await?))
    }

    fn is_seeking_direct(&self) -> bool {
        true
    }
}
