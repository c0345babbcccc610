use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;

use super::range_reader::check_bounds;
use super::RangeReader;
use crate::error::IoError;

/// RangeReader over a local file. Seeks are direct.
pub struct FileRangeReader {
    file: Mutex<File>,
    size: u64,
    identifier: String,
}

impl FileRangeReader {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let file = File::open(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => IoError::NotFound(path.display().to_string()),
            _ => IoError::File(format!("{}: {}", path.display(), e)),
        })?;
        let size = file
            .metadata()
            .await
            .map_err(|e| IoError::File(e.to_string()))?
            .len();
        Ok(Self {
            file: Mutex::new(file),
            size,
            identifier: format!("file://{}", path.display()),
        })
    }
}

#[async_trait]
impl RangeReader for FileRangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        check_bounds(offset, len, self.size)?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = BytesMut::zeroed(len);
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| IoError::File(e.to_string()))?;
        file.read_exact(&mut buf)
            .await
            .map_err(|e| IoError::File(e.to_string()))?;
        Ok(buf.freeze())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}
