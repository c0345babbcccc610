//! Connects a source to a processor through the cheapest data path both
//! support.
//!
//! Precedence:
//!
//! 1. file source, file processor: the path is handed over
//! 2. file source, stream processor: the file is wrapped in a stream factory
//! 3. stream source, stream processor: per [`StreamRetrievalStrategy`]
//! 4. stream source, file-only processor: per [`FallbackRetrievalStrategy`]
//!
//! Temp files created on the way are returned to the caller, who keeps them
//! alive until the response is written. Dropping a [`TempPath`] deletes it.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::{Processor, ProcessorInput, SourceCacheDownloader};
use crate::cache::SourceCache;
use crate::error::RequestError;
use crate::image::{Format, Identifier};
use crate::source::{FileStreamFactory, Source, StreamFactory};

/// How a stream-only source reaches a processor that reads streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum StreamRetrievalStrategy {
    /// Hand the stream factory to the processor
    #[default]
    Stream,
    /// Download into a temp file first
    Download,
    /// Materialize into the source cache first
    Cache,
}

/// How a stream-only source reaches a processor that only reads files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FallbackRetrievalStrategy {
    /// Download into a temp file
    #[default]
    Download,
    /// Materialize into the source cache
    Cache,
    /// Refuse the request
    Abort,
}

#[derive(Debug, Clone, Default)]
pub struct BinderSettings {
    pub stream_retrieval: StreamRetrievalStrategy,
    pub fallback_retrieval: FallbackRetrievalStrategy,
    /// Directory for temp downloads, the system default when unset
    pub temp_dir: Option<PathBuf>,
}

pub struct ProcessorBinder {
    settings: BinderSettings,
    source_cache: Option<Arc<dyn SourceCache>>,
    downloader: Arc<SourceCacheDownloader>,
}

impl ProcessorBinder {
    pub fn new(settings: BinderSettings, source_cache: Option<Arc<dyn SourceCache>>) -> Self {
        Self {
            settings,
            source_cache,
            downloader: Arc::new(SourceCacheDownloader::new()),
        }
    }

    pub fn settings(&self) -> &BinderSettings {
        &self.settings
    }

    /// Set the processor's input from `source`.
    ///
    /// Returns the temp file backing the input, if one was created.
    pub async fn connect(
        &self,
        source: &dyn Source,
        processor: &mut dyn Processor,
        identifier: &Identifier,
        format: Format,
    ) -> Result<Option<TempPath>, RequestError> {
        if let Some(file_access) = source.file_access() {
            let path = file_access.file().await?;
            info!(
                identifier = %identifier,
                source = source.name(),
                processor = processor.name(),
                "Connecting file source"
            );
            return connect_file(processor, path).map(|_| None);
        }

        let stream_access = source.stream_access().ok_or_else(|| {
            RequestError::Incompatible(format!(
                "{} offers neither file nor stream access",
                source.name()
            ))
        })?;
        let factory = stream_access.new_stream_factory().await?;

        if processor.accepts_stream() {
            info!(
                identifier = %identifier,
                source = source.name(),
                processor = processor.name(),
                strategy = ?self.settings.stream_retrieval,
                "Connecting stream source"
            );
            match self.settings.stream_retrieval {
                StreamRetrievalStrategy::Stream => {
                    processor.set_input(ProcessorInput::Stream(factory));
                    Ok(None)
                }
                StreamRetrievalStrategy::Download => {
                    let temp = self.download_to_temp(factory.as_ref(), format).await?;
                    connect_file(processor, temp.to_path_buf())?;
                    Ok(Some(temp))
                }
                StreamRetrievalStrategy::Cache => {
                    let path = self
                        .materialize(identifier, factory.as_ref(), "stream retrieval strategy")
                        .await?;
                    connect_file(processor, path).map(|_| None)
                }
            }
        } else if processor.accepts_file() {
            info!(
                identifier = %identifier,
                source = source.name(),
                processor = processor.name(),
                strategy = ?self.settings.fallback_retrieval,
                "Connecting stream source to file processor"
            );
            match self.settings.fallback_retrieval {
                FallbackRetrievalStrategy::Download => {
                    let temp = self.download_to_temp(factory.as_ref(), format).await?;
                    processor.set_input(ProcessorInput::File(temp.to_path_buf()));
                    Ok(Some(temp))
                }
                FallbackRetrievalStrategy::Cache => {
                    let path = self
                        .materialize(identifier, factory.as_ref(), "fallback retrieval strategy")
                        .await?;
                    processor.set_input(ProcessorInput::File(path));
                    Ok(None)
                }
                FallbackRetrievalStrategy::Abort => Err(RequestError::Incompatible(format!(
                    "{} reads only files and {} only streams",
                    processor.name(),
                    source.name()
                ))),
            }
        } else {
            Err(RequestError::Incompatible(format!(
                "{} accepts no input",
                processor.name()
            )))
        }
    }

    /// Set the processor's input to a source cache copy.
    pub fn connect_cached_file(
        &self,
        processor: &mut dyn Processor,
        path: PathBuf,
    ) -> Result<(), RequestError> {
        connect_file(processor, path)
    }

    async fn materialize(
        &self,
        identifier: &Identifier,
        factory: &dyn StreamFactory,
        required_by: &str,
    ) -> Result<PathBuf, RequestError> {
        let cache = self
            .source_cache
            .as_ref()
            .ok_or_else(|| RequestError::SourceCacheDisabled(required_by.to_string()))?;
        self.downloader
            .get_or_download(cache.as_ref(), identifier, factory)
            .await
    }

    async fn download_to_temp(
        &self,
        factory: &dyn StreamFactory,
        format: Format,
    ) -> Result<TempPath, RequestError> {
        let dir = self
            .settings
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let suffix = format!(".{}", format.preferred_extension());
        let named = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix("courier-")
                .suffix(&suffix)
                .tempfile_in(dir)
        })
        .await
        .map_err(|e| RequestError::Io(e.to_string()))??;
        let (file, temp) = named.into_parts();

        let mut file = tokio::fs::File::from_std(file);
        let mut stream = factory.new_stream().await?;
        let bytes = tokio::io::copy(&mut stream, &mut file).await?;
        file.flush().await?;
        info!(location = factory.location(), path = %temp.display(), bytes, "Downloaded source to temp file");
        Ok(temp)
    }
}

/// Feed a local file, as a path or as a stream depending on what the
/// processor reads.
fn connect_file(processor: &mut dyn Processor, path: PathBuf) -> Result<(), RequestError> {
    if processor.accepts_file() {
        processor.set_input(ProcessorInput::File(path));
    } else if processor.accepts_stream() {
        processor.set_input(ProcessorInput::Stream(Arc::new(FileStreamFactory::new(path))));
    } else {
        return Err(RequestError::Incompatible(format!(
            "{} accepts no input",
            processor.name()
        )));
    }
    Ok(())
}
