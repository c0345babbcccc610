//! Processors: turn source bytes into an [`Info`] or a rendered derivative.
//!
//! A processor is created for one source format. It is fed either a local
//! file or a [`StreamFactory`] by the [`ProcessorBinder`], which picks the
//! cheapest data path the source and the processor have in common.

mod binder;
mod download;
mod raster;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ProcessorError, SourceError, ValidationError};
use crate::image::{Dimension, Format, Info, OperationList};
use crate::source::StreamFactory;

pub use binder::{
    BinderSettings, FallbackRetrievalStrategy, ProcessorBinder, StreamRetrievalStrategy,
};
pub use download::SourceCacheDownloader;
pub use raster::{RasterProcessor, RasterProcessorFactory};

/// Where a processor reads its source from.
#[derive(Clone)]
pub enum ProcessorInput {
    File(PathBuf),
    Stream(Arc<dyn StreamFactory>),
}

impl ProcessorInput {
    /// A fresh sequential stream over the input.
    pub async fn open_stream(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>, SourceError> {
        match self {
            ProcessorInput::File(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
            ProcessorInput::Stream(factory) => factory.new_stream().await,
        }
    }
}

impl fmt::Debug for ProcessorInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorInput::File(path) => f.debug_tuple("File").field(path).finish(),
            ProcessorInput::Stream(factory) => {
                f.debug_tuple("Stream").field(&factory.location()).finish()
            }
        }
    }
}

#[async_trait]
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    /// The format this processor was created for.
    fn source_format(&self) -> Format;

    fn accepts_file(&self) -> bool;

    fn accepts_stream(&self) -> bool;

    fn set_input(&mut self, input: ProcessorInput);

    fn available_output_formats(&self) -> &'static [Format];

    /// Read dimensions and embedded metadata.
    ///
    /// Fails with [`ProcessorError::SourceFormatMismatch`] when the content
    /// turns out not to be in [`Processor::source_format`].
    async fn read_info(&mut self) -> Result<Info, ProcessorError>;

    /// Reject operations that cannot be applied to a source of `full_size`.
    fn validate(&self, ops: &OperationList, full_size: Dimension) -> Result<(), ValidationError> {
        ops.validate(full_size)
    }

    /// Render `ops` and write the encoded result to `out`.
    async fn process(
        &mut self,
        ops: &OperationList,
        info: &Info,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), ProcessorError>;

    /// Release decoder state. Called once when the request is done.
    fn close(&mut self) {}
}

/// Creates processors for source formats.
pub trait ProcessorFactory: Send + Sync {
    /// A processor for `format`, or
    /// [`ProcessorError::UnsupportedSourceFormat`].
    fn new_processor(&self, format: Format) -> Result<Box<dyn Processor>, ProcessorError>;
}
