//! Local filesystem source.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::debug;

use super::{
    FileAccess, FileStreamFactory, FormatProbe, LookupStrategy, Source, StatResult, StreamAccess,
    StreamFactory,
};
use crate::delegate::{DelegateProxy, NoopDelegate};
use crate::error::SourceError;
use crate::image::Identifier;
use crate::io::{read_head, FileRangeReader};

/// Path fragments stripped from identifiers before basic lookup.
const TRAVERSAL_SEQUENCES: [&str; 4] = ["../", "..\\", "/..", "\\.."];

#[derive(Debug, Clone, Default)]
pub struct FilesystemSourceSettings {
    pub path_prefix: String,
    pub path_suffix: String,
    pub lookup_strategy: LookupStrategy,
}

/// Source over files on a local filesystem. Offers both file and stream
/// access.
pub struct FilesystemSource {
    settings: FilesystemSourceSettings,
    identifier: Option<Identifier>,
    delegate: Arc<dyn DelegateProxy>,
    /// Resolved path, computed on first use and reset on rebinding
    path: OnceCell<PathBuf>,
}

impl FilesystemSource {
    pub fn new(settings: FilesystemSourceSettings) -> Self {
        Self {
            settings,
            identifier: None,
            delegate: Arc::new(NoopDelegate),
            path: OnceCell::new(),
        }
    }

    /// The path backing the bound identifier.
    pub async fn path(&self) -> Result<&PathBuf, SourceError> {
        self.path.get_or_try_init(|| self.lookup()).await
    }

    async fn lookup(&self) -> Result<PathBuf, SourceError> {
        let identifier = self
            .identifier
            .as_ref()
            .ok_or_else(|| SourceError::Lookup("no identifier set".into()))?;

        let path = match self.settings.lookup_strategy {
            LookupStrategy::Basic => PathBuf::from(format!(
                "{}{}{}",
                self.settings.path_prefix,
                sanitize(identifier.as_str()),
                self.settings.path_suffix
            )),
            LookupStrategy::Delegate => self
                .delegate
                .filesystem_pathname(identifier)
                .await?
                .map(PathBuf::from)
                .ok_or_else(|| {
                    SourceError::NotFound(format!("delegate returned no pathname for {}", identifier))
                })?,
        };
        debug!(identifier = %identifier, path = %path.display(), "Resolved filesystem path");
        Ok(path)
    }
}

/// Remove every traversal sequence, repeating until none is left so that
/// overlapping sequences cannot reassemble one.
fn sanitize(identifier: &str) -> String {
    let mut clean = identifier.to_string();
    loop {
        let before = clean.len();
        for seq in TRAVERSAL_SEQUENCES {
            clean = clean.replace(seq, "");
        }
        if clean.len() == before {
            return clean;
        }
    }
}

fn io_error(path: &Path, err: std::io::Error) -> SourceError {
    let message = format!("{}: {}", path.display(), err);
    match err.kind() {
        std::io::ErrorKind::NotFound => SourceError::NotFound(message),
        std::io::ErrorKind::PermissionDenied => SourceError::AccessDenied(message),
        _ => SourceError::Io(message),
    }
}

#[async_trait]
impl Source for FilesystemSource {
    fn name(&self) -> &'static str {
        "FilesystemSource"
    }

    fn set_identifier(&mut self, identifier: Identifier) {
        self.identifier = Some(identifier);
        self.path = OnceCell::new();
    }

    fn identifier(&self) -> Option<&Identifier> {
        self.identifier.as_ref()
    }

    fn set_delegate(&mut self, delegate: Arc<dyn DelegateProxy>) {
        self.delegate = delegate;
        self.path = OnceCell::new();
    }

    async fn stat(&self) -> Result<StatResult, SourceError> {
        let path = self.path().await?;
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| io_error(path, e))?;
        if !metadata.is_file() {
            return Err(SourceError::NotFound(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        // metadata succeeds on unreadable files; opening does not
        tokio::fs::File::open(path)
            .await
            .map_err(|e| io_error(path, e))?;
        Ok(StatResult {
            last_modified: metadata.modified().ok(),
        })
    }

    fn format_probe(&self) -> &dyn FormatProbe {
        self
    }

    fn file_access(&self) -> Option<&dyn FileAccess> {
        Some(self)
    }

    fn stream_access(&self) -> Option<&dyn StreamAccess> {
        Some(self)
    }
}

#[async_trait]
impl FormatProbe for FilesystemSource {
    async fn object_name(&self) -> Result<Option<String>, SourceError> {
        let path = self.path().await?;
        Ok(path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned()))
    }

    fn raw_identifier(&self) -> Option<&Identifier> {
        self.identifier.as_ref()
    }

    async fn read_magic_bytes(&self, len: usize) -> Result<Bytes, SourceError> {
        let reader = FileRangeReader::open(self.path().await?).await?;
        Ok(read_head(&reader, len).await?)
    }
}

#[async_trait]
impl FileAccess for FilesystemSource {
    async fn file(&self) -> Result<PathBuf, SourceError> {
        self.path().await.cloned()
    }
}

#[async_trait]
impl StreamAccess for FilesystemSource {
    async fn new_stream_factory(&self) -> Result<Arc<dyn StreamFactory>, SourceError> {
        Ok(Arc::new(FileStreamFactory::new(self.path().await?)))
    }
}
