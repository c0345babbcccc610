//! Shared request machinery: source resolution, format inference and
//! processor binding.
//!
//! Both request handlers go through [`Pipeline::resolve`], which turns an
//! identifier into a processor bound to the source's bytes plus the
//! source's [`Info`]. Format candidates come from the inference chain one
//! step at a time; a processor that finds the content is in another
//! format is not an error, the next candidate is tried instead.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempPath;
use tokio::io::AsyncRead;
use tracing::{debug, error, info};

use crate::cache::CacheFacade;
use crate::delegate::{DelegateProxy, NoopDelegate};
use crate::error::{ProcessorError, RequestError, SourceError};
use crate::health::HealthLedger;
use crate::image::{EncodeDefaults, Format, Identifier, Info};
use crate::processor::{BinderSettings, Processor, ProcessorBinder, ProcessorFactory};
use crate::source::{
    CachedFileProbe, FormatCandidates, FormatInferenceChain, FormatProbe, Source, SourceFactory,
    StatResult,
};

/// Runtime settings shared by every request.
#[derive(Debug, Clone, Default)]
pub struct PipelineSettings {
    /// Check the source before consulting any cache
    pub resolve_first: bool,
    /// Purge cached content of identifiers whose source is gone
    pub purge_missing: bool,
    pub binder: BinderSettings,
    pub encode_defaults: EncodeDefaults,
}

pub struct Pipeline {
    settings: PipelineSettings,
    caches: Arc<CacheFacade>,
    sources: Arc<dyn SourceFactory>,
    processors: Arc<dyn ProcessorFactory>,
    delegate: Arc<dyn DelegateProxy>,
    binder: ProcessorBinder,
    health: HealthLedger,
}

impl Pipeline {
    pub fn new(
        settings: PipelineSettings,
        caches: Arc<CacheFacade>,
        sources: Arc<dyn SourceFactory>,
        processors: Arc<dyn ProcessorFactory>,
    ) -> Self {
        let binder = ProcessorBinder::new(settings.binder.clone(), caches.source_cache().cloned());
        Self {
            settings,
            caches,
            sources,
            processors,
            delegate: Arc::new(NoopDelegate),
            binder,
            health: HealthLedger::default(),
        }
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn DelegateProxy>) -> Self {
        self.delegate = delegate;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn caches(&self) -> &Arc<CacheFacade> {
        &self.caches
    }

    pub fn sources(&self) -> &Arc<dyn SourceFactory> {
        &self.sources
    }

    pub fn delegate(&self) -> &Arc<dyn DelegateProxy> {
        &self.delegate
    }

    pub fn health(&self) -> &HealthLedger {
        &self.health
    }

    /// Locate the source of `identifier`, infer its format and bind a
    /// processor to it.
    ///
    /// With `use_cache` false an existing source cache copy is ignored, the
    /// info is always read from the source and nothing is written to the
    /// info caches. The binder may still materialize the source into the
    /// source cache when the processor can only read files.
    pub(crate) async fn resolve(
        &self,
        identifier: &Identifier,
        use_cache: bool,
    ) -> Result<Resolved, RequestError> {
        let cached_copy = if self.settings.resolve_first || !use_cache {
            None
        } else {
            self.caches.get_source_cache_file(identifier).await
        };

        let mut stat_result = None;
        let origin = match cached_copy {
            Some(path) => {
                debug!(identifier = %identifier, path = %path.display(), "Resolving from source cache copy");
                Origin::Cached(path)
            }
            None => {
                let source = self.sources.new_source(identifier, self.delegate.clone()).await?;
                match source.check_access().await {
                    Ok(stat) => {
                        stat_result = Some(stat);
                        Origin::Source(source)
                    }
                    Err(e) => {
                        if matches!(e, SourceError::NotFound(_)) && self.settings.purge_missing {
                            info!(identifier = %identifier, "Source is gone, purging cached content");
                            if let Err(purge_error) = self.caches.purge(identifier).await {
                                error!(identifier = %identifier, error = %purge_error, "Purge failed");
                            }
                        }
                        return Err(e.into());
                    }
                }
            }
        };

        // A trusted cached info already knows the real format.
        let known = if use_cache {
            self.caches
                .get_info(identifier)
                .await
                .filter(Info::is_complete)
                .map(|info| info.source_format())
        } else {
            None
        };

        let cached_probe;
        let probe: &dyn FormatProbe = match &origin {
            Origin::Cached(path) => {
                cached_probe = CachedFileProbe::new(identifier.clone(), path.clone());
                &cached_probe
            }
            Origin::Source(source) => source.format_probe(),
        };
        let mut candidates = FormatCandidates::new(known, FormatInferenceChain::new(probe));

        while let Some(format) = candidates.next_candidate().await {
            match self.attempt(&origin, identifier, format, use_cache).await? {
                Attempt::Bound {
                    processor,
                    info,
                    temp_file,
                } => {
                    return Ok(Resolved {
                        origin,
                        stat: stat_result,
                        processor,
                        info,
                        temp_file,
                    })
                }
                Attempt::Mismatch(reason) => {
                    debug!(identifier = %identifier, format = %format, reason = %reason, "Trying next format");
                }
            }
        }

        Err(RequestError::SourceFormat(format!(
            "no processor could read {} (tried {:?})",
            identifier,
            candidates.tried()
        )))
    }

    async fn attempt(
        &self,
        origin: &Origin,
        identifier: &Identifier,
        format: Format,
        use_cache: bool,
    ) -> Result<Attempt, RequestError> {
        let mut processor = match self.processors.new_processor(format) {
            Ok(processor) => processor,
            Err(e @ ProcessorError::UnsupportedSourceFormat(_)) => {
                return Ok(Attempt::Mismatch(e.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let temp_file = match origin {
            Origin::Cached(path) => {
                self.binder.connect_cached_file(processor.as_mut(), path.clone())?;
                None
            }
            Origin::Source(source) => {
                self.binder
                    .connect(source.as_ref(), processor.as_mut(), identifier, format)
                    .await?
            }
        };

        let info = if use_cache {
            self.caches.get_or_read_info(identifier, processor.as_mut()).await
        } else {
            processor
                .read_info()
                .await
                .map(|info| info.with_identifier(identifier.clone()))
        };

        match info {
            Ok(info) => Ok(Attempt::Bound {
                processor,
                info,
                temp_file,
            }),
            Err(e @ ProcessorError::SourceFormatMismatch { .. }) => {
                processor.close();
                Ok(Attempt::Mismatch(e.to_string()))
            }
            Err(e) => {
                processor.close();
                Err(e.into())
            }
        }
    }
}

/// Where the bound bytes come from.
pub(crate) enum Origin {
    /// A complete copy in the source cache
    Cached(PathBuf),
    Source(Box<dyn Source>),
}

impl Origin {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Origin::Cached(_) => "SourceCache",
            Origin::Source(source) => source.name(),
        }
    }

    /// A fresh stream over the raw source bytes.
    pub(crate) async fn open_stream(
        &self,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, SourceError> {
        match self {
            Origin::Cached(path) => Ok(Box::new(tokio::fs::File::open(path).await?)),
            Origin::Source(source) => {
                if let Some(file_access) = source.file_access() {
                    let path = file_access.file().await?;
                    return Ok(Box::new(tokio::fs::File::open(path).await?));
                }
                match source.stream_access() {
                    Some(stream_access) => stream_access.new_stream_factory().await?.new_stream().await,
                    None => Err(SourceError::Io(format!(
                        "{} offers neither file nor stream access",
                        source.name()
                    ))),
                }
            }
        }
    }
}

enum Attempt {
    Bound {
        processor: Box<dyn Processor>,
        info: Info,
        temp_file: Option<TempPath>,
    },
    /// The candidate format turned out not to apply
    Mismatch(String),
}

/// A processor bound to the source of one identifier.
pub(crate) struct Resolved {
    pub origin: Origin,
    /// What the access check learned; `None` for a source cache copy
    pub stat: Option<StatResult>,
    pub processor: Box<dyn Processor>,
    pub info: Info,
    pub temp_file: Option<TempPath>,
}
