use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::range_reader::check_bounds;
use super::RangeReader;
use crate::error::IoError;

/// RangeReader that emulates seeking over a sequential stream by holding
/// the whole stream in memory.
///
/// Used for backends that cannot serve range requests. Callers should check
/// the stream factory's seeking flag and avoid block caching over this.
pub struct BufferedRangeReader {
    data: Bytes,
    identifier: String,
}

impl BufferedRangeReader {
    pub fn new(identifier: impl Into<String>, data: Bytes) -> Self {
        Self {
            data,
            identifier: identifier.into(),
        }
    }

    /// Drain `stream` into memory.
    pub async fn read_from<S>(identifier: impl Into<String>, mut stream: S) -> Result<Self, IoError>
    where
        S: AsyncRead + Unpin,
    {
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .await
            .map_err(|e| IoError::Connection(e.to_string()))?;
        Ok(Self::new(identifier, Bytes::from(buf)))
    }
}

#[async_trait]
impl RangeReader for BufferedRangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        check_bounds(offset, len, self.size())?;
        let start = offset as usize;
        Ok(self.data.slice(start..start + len))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
