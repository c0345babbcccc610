//! Derivative and source caches.
//!
//! - [`DerivativeCache`]: rendered derivative images keyed by operation list
//!   fingerprint, plus [`Info`] records keyed by identifier
//! - [`SourceCache`]: verbatim source bytes keyed by identifier, exposed as
//!   local files
//!
//! Writes go through a [`CacheWriter`] and become visible to readers only on
//! [`CacheWriter::commit`]. A writer dropped without committing leaves no
//! trace, so readers never observe a partial entry.

mod facade;
mod filesystem;
mod heap;
mod info_service;

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::CacheError;
use crate::image::{Identifier, Info, OperationList};

pub use facade::CacheFacade;
pub use filesystem::FilesystemCache;
pub use heap::{HeapCache, DEFAULT_HEAP_CACHE_CAPACITY};
pub use info_service::{InfoService, DEFAULT_INFO_CACHE_CAPACITY};

/// Stream over a cached derivative image.
pub type CacheReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write side of a cache entry.
#[async_trait]
pub trait CacheWriter: AsyncWrite + Send + Unpin {
    /// Make everything written so far visible as a complete entry.
    async fn commit(self: Box<Self>) -> Result<(), CacheError>;
}

#[async_trait]
pub trait DerivativeCache: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_info(&self, identifier: &Identifier) -> Result<Option<Info>, CacheError>;

    async fn put_info(&self, identifier: &Identifier, info: &Info) -> Result<(), CacheError>;

    /// Stream over the derivative for `ops`, `None` on a miss.
    async fn new_derivative_image_reader(
        &self,
        ops: &OperationList,
    ) -> Result<Option<CacheReader>, CacheError>;

    async fn new_derivative_image_writer(
        &self,
        ops: &OperationList,
    ) -> Result<Box<dyn CacheWriter>, CacheError>;

    /// Remove the derivative for `ops`.
    async fn purge_operations(&self, ops: &OperationList) -> Result<(), CacheError>;

    /// Remove the info and every derivative of `identifier`.
    async fn purge_identifier(&self, identifier: &Identifier) -> Result<(), CacheError>;

    async fn purge_all(&self) -> Result<(), CacheError>;
}

#[async_trait]
pub trait SourceCache: Send + Sync {
    fn name(&self) -> &'static str;

    /// Path of the complete cached copy of `identifier`, `None` on a miss.
    async fn get_source_image_file(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<PathBuf>, CacheError>;

    async fn new_source_image_writer(
        &self,
        identifier: &Identifier,
    ) -> Result<Box<dyn CacheWriter>, CacheError>;

    async fn purge_source(&self, identifier: &Identifier) -> Result<(), CacheError>;

    async fn purge_all_sources(&self) -> Result<(), CacheError>;
}

/// Writer that accepts and drops everything. Handed out when another writer
/// already owns the key.
#[derive(Debug, Default)]
pub(crate) struct DiscardingWriter;

impl AsyncWrite for DiscardingWriter {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[async_trait]
impl CacheWriter for DiscardingWriter {
    async fn commit(self: Box<Self>) -> Result<(), CacheError> {
        Ok(())
    }
}
