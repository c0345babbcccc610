//! Filesystem-backed derivative and source cache.
//!
//! Layout under the cache root:
//!
//! ```text
//! info/{sha256(identifier)}.json
//! image/{sha256(identifier)}_{sha256(fingerprint)}.{extension}
//! source/{sha256(identifier)}
//! ```
//!
//! Every write goes to a uniquely named temp file in the destination
//! directory and is renamed into place on commit, so readers see either the
//! previous entry or the complete new one. While a key has an open writer,
//! further writers for the same key discard their input.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tempfile::TempPath;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::{CacheReader, CacheWriter, DerivativeCache, DiscardingWriter, SourceCache};
use crate::error::CacheError;
use crate::image::{Identifier, Info, OperationList};

const INFO_DIR: &str = "info";
const IMAGE_DIR: &str = "image";
const SOURCE_DIR: &str = "source";

fn digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

type InProgress = Arc<Mutex<HashSet<PathBuf>>>;

/// Add `path` to the in-progress set. False if it was already there.
fn claim(in_progress: &InProgress, path: &Path) -> bool {
    let mut set = in_progress.lock().unwrap_or_else(|e| e.into_inner());
    set.insert(path.to_path_buf())
}

fn release(in_progress: &InProgress, path: &Path) {
    let mut set = in_progress.lock().unwrap_or_else(|e| e.into_inner());
    set.remove(path);
}

async fn remove_if_exists(path: &Path) -> Result<(), CacheError> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), CacheError> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

pub struct FilesystemCache {
    root: PathBuf,
    in_progress: InProgress,
}

impl FilesystemCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            in_progress: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn info_path(&self, identifier: &Identifier) -> PathBuf {
        self.root
            .join(INFO_DIR)
            .join(format!("{}.json", digest(identifier.as_str())))
    }

    fn image_path(&self, ops: &OperationList) -> PathBuf {
        self.root.join(IMAGE_DIR).join(format!(
            "{}_{}.{}",
            digest(ops.identifier().as_str()),
            digest(&ops.fingerprint()),
            ops.output_format().preferred_extension()
        ))
    }

    fn source_path(&self, identifier: &Identifier) -> PathBuf {
        self.root.join(SOURCE_DIR).join(digest(identifier.as_str()))
    }

    /// A writer for `destination`, or a discarding one if another writer
    /// holds it.
    async fn writer_for(&self, destination: PathBuf) -> Result<Box<dyn CacheWriter>, CacheError> {
        if !claim(&self.in_progress, &destination) {
            debug!(path = %destination.display(), "Cache entry already being written");
            return Ok(Box::new(DiscardingWriter));
        }
        match FileWriter::create(destination.clone(), self.in_progress.clone()).await {
            Ok(writer) => Ok(Box::new(writer)),
            Err(e) => {
                release(&self.in_progress, &destination);
                Err(e)
            }
        }
    }
}

#[async_trait]
impl DerivativeCache for FilesystemCache {
    fn name(&self) -> &'static str {
        "FilesystemCache"
    }

    async fn get_info(&self, identifier: &Identifier) -> Result<Option<Info>, CacheError> {
        let path = self.info_path(identifier);
        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match Info::from_json(&json) {
            Ok(info) => Ok(Some(info)),
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Ignoring unreadable cached info");
                Ok(None)
            }
        }
    }

    async fn put_info(&self, identifier: &Identifier, info: &Info) -> Result<(), CacheError> {
        let json = info.to_json()?;
        let mut writer = self.writer_for(self.info_path(identifier)).await?;
        writer.write_all(json.as_bytes()).await?;
        writer.commit().await
    }

    async fn new_derivative_image_reader(
        &self,
        ops: &OperationList,
    ) -> Result<Option<CacheReader>, CacheError> {
        match tokio::fs::File::open(self.image_path(ops)).await {
            Ok(file) => Ok(Some(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn new_derivative_image_writer(
        &self,
        ops: &OperationList,
    ) -> Result<Box<dyn CacheWriter>, CacheError> {
        self.writer_for(self.image_path(ops)).await
    }

    async fn purge_operations(&self, ops: &OperationList) -> Result<(), CacheError> {
        remove_if_exists(&self.image_path(ops)).await
    }

    async fn purge_identifier(&self, identifier: &Identifier) -> Result<(), CacheError> {
        remove_if_exists(&self.info_path(identifier)).await?;

        let prefix = format!("{}_", digest(identifier.as_str()));
        let mut entries = match tokio::fs::read_dir(self.root.join(IMAGE_DIR)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                remove_if_exists(&entry.path()).await?;
            }
        }
        Ok(())
    }

    async fn purge_all(&self) -> Result<(), CacheError> {
        remove_dir_if_exists(&self.root.join(INFO_DIR)).await?;
        remove_dir_if_exists(&self.root.join(IMAGE_DIR)).await
    }
}

#[async_trait]
impl SourceCache for FilesystemCache {
    fn name(&self) -> &'static str {
        "FilesystemCache"
    }

    async fn get_source_image_file(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<PathBuf>, CacheError> {
        let path = self.source_path(identifier);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(Some(path)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn new_source_image_writer(
        &self,
        identifier: &Identifier,
    ) -> Result<Box<dyn CacheWriter>, CacheError> {
        self.writer_for(self.source_path(identifier)).await
    }

    async fn purge_source(&self, identifier: &Identifier) -> Result<(), CacheError> {
        remove_if_exists(&self.source_path(identifier)).await
    }

    async fn purge_all_sources(&self) -> Result<(), CacheError> {
        remove_dir_if_exists(&self.root.join(SOURCE_DIR)).await
    }
}

// =============================================================================
// Writer
// =============================================================================

/// Writes into a temp file next to `destination` and renames it into place
/// on commit. Dropping without commit deletes the temp file.
struct FileWriter {
    file: tokio::fs::File,
    temp: Option<TempPath>,
    destination: PathBuf,
    in_progress: InProgress,
}

impl FileWriter {
    async fn create(destination: PathBuf, in_progress: InProgress) -> Result<Self, CacheError> {
        let dir = destination
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| CacheError::Io(format!("{} has no parent", destination.display())))?;
        tokio::fs::create_dir_all(&dir).await?;

        let named = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)
        })
        .await
        .map_err(|e| CacheError::Io(e.to_string()))??;
        let (file, temp) = named.into_parts();

        Ok(Self {
            file: tokio::fs::File::from_std(file),
            temp: Some(temp),
            destination,
            in_progress,
        })
    }
}

impl AsyncWrite for FileWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().file).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

#[async_trait]
impl CacheWriter for FileWriter {
    async fn commit(mut self: Box<Self>) -> Result<(), CacheError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        let temp = self
            .temp
            .take()
            .ok_or_else(|| CacheError::Io("writer already committed".into()))?;
        temp.persist(&self.destination)
            .map_err(|e| CacheError::Io(e.to_string()))?;
        debug!(path = %self.destination.display(), "Committed cache entry");
        Ok(())
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        release(&self.in_progress, &self.destination);
    }
}
