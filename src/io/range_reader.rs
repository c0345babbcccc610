use async_trait::async_trait;
use bytes::Bytes;

use crate::error::IoError;

/// Trait for reading byte ranges from a local or remote resource.
///
/// This is the seekable side of a source's stream access: processors and
/// format probes read only the bytes they need instead of the whole object.
/// Implementations must be thread-safe.
#[async_trait]
pub trait RangeReader: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`.
    ///
    /// Returns an error if the range is out of bounds or if the read fails.
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError>;

    /// Get the total size of the resource in bytes.
    fn size(&self) -> u64;

    /// Get a unique identifier for this resource (for logging and cache keys).
    ///
    /// For S3, this would typically be `s3://bucket/key`.
    fn identifier(&self) -> &str;
}

/// Read up to `len` leading bytes, fewer if the resource is shorter.
pub async fn read_head(reader: &dyn RangeReader, len: usize) -> Result<Bytes, IoError> {
    let len = std::cmp::min(len as u64, reader.size()) as usize;
    reader.read_exact_at(0, len).await
}

/// Read the whole resource.
pub async fn read_all(reader: &dyn RangeReader) -> Result<Bytes, IoError> {
    let len = usize::try_from(reader.size()).map_err(|_| IoError::RangeOutOfBounds {
        offset: 0,
        requested: reader.size(),
        size: reader.size(),
    })?;
    reader.read_exact_at(0, len).await
}

/// Check a requested range against the resource size.
pub(crate) fn check_bounds(offset: u64, len: usize, size: u64) -> Result<(), IoError> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(IoError::RangeOutOfBounds {
            offset,
            requested: len as u64,
            size,
        }),
    }
}
