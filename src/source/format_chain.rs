//! Prioritized, lazily evaluated format inference.
//!
//! The chain asks its [`FormatProbe`] for one guess per step, cheapest
//! first. A step that fails is logged and yields `Unknown`; the chain itself
//! never fails. Callers try each guess against a processor and move on when
//! the processor reports a mismatch.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::image::{Format, Identifier, MAGIC_BYTES_LENGTH};
use crate::io::{read_head, FileRangeReader};

/// What a format inference chain asks of a source.
#[async_trait]
pub trait FormatProbe: Send + Sync {
    /// Name of the resolved object: file name, object key or similar.
    async fn object_name(&self) -> Result<Option<String>, SourceError>;

    /// The identifier the source is bound to.
    fn raw_identifier(&self) -> Option<&Identifier>;

    /// Media type declared by the backend, when it can be had without a
    /// full fetch.
    async fn declared_media_type(&self) -> Result<Option<String>, SourceError> {
        Ok(None)
    }

    /// Up to `len` leading bytes of the object.
    async fn read_magic_bytes(&self, len: usize) -> Result<Bytes, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferenceStep {
    ObjectName,
    IdentifierExtension,
    DeclaredMediaType,
    MagicBytes,
}

impl InferenceStep {
    pub const ALL: [InferenceStep; 4] = [
        InferenceStep::ObjectName,
        InferenceStep::IdentifierExtension,
        InferenceStep::DeclaredMediaType,
        InferenceStep::MagicBytes,
    ];
}

/// Finite, restartable sequence of format guesses.
pub struct FormatInferenceChain<'a> {
    probe: &'a dyn FormatProbe,
    position: usize,
}

impl<'a> FormatInferenceChain<'a> {
    pub fn new(probe: &'a dyn FormatProbe) -> Self {
        Self { probe, position: 0 }
    }

    pub fn has_next(&self) -> bool {
        self.position < InferenceStep::ALL.len()
    }

    /// Run the next step. `None` once every step has run.
    pub async fn next_format(&mut self) -> Option<Format> {
        let step = *InferenceStep::ALL.get(self.position)?;
        self.position += 1;
        let format = match run_step(self.probe, step).await {
            Ok(format) => format,
            Err(e) => {
                warn!(step = ?step, error = %e, "Format inference step failed");
                Format::Unknown
            }
        };
        debug!(step = ?step, format = %format, "Format inference step");
        Some(format)
    }

    /// Start over from the first step.
    pub fn restart(&mut self) {
        self.position = 0;
    }

    /// Run every remaining step and collect the guesses in order.
    pub async fn remaining(&mut self) -> Vec<Format> {
        let mut guesses = Vec::with_capacity(InferenceStep::ALL.len());
        while let Some(format) = self.next_format().await {
            guesses.push(format);
        }
        guesses
    }
}

/// Distinct formats worth trying, produced on demand.
///
/// A format already known from a trusted cached info comes first, then the
/// chain's guesses with `Unknown` and repeats skipped. The chain only
/// advances when the caller asks for another candidate, so a format named
/// by the object key never costs a metadata request or a byte fetch.
pub struct FormatCandidates<'a> {
    known: Option<Format>,
    chain: FormatInferenceChain<'a>,
    tried: Vec<Format>,
}

impl<'a> FormatCandidates<'a> {
    pub fn new(known: Option<Format>, chain: FormatInferenceChain<'a>) -> Self {
        Self {
            known,
            chain,
            tried: Vec::new(),
        }
    }

    pub async fn next_candidate(&mut self) -> Option<Format> {
        loop {
            let format = match self.known.take() {
                Some(format) => format,
                None => self.chain.next_format().await?,
            };
            if !format.is_unknown() && !self.tried.contains(&format) {
                self.tried.push(format);
                return Some(format);
            }
        }
    }

    /// Every candidate handed out so far.
    pub fn tried(&self) -> &[Format] {
        &self.tried
    }
}

async fn run_step(probe: &dyn FormatProbe, step: InferenceStep) -> Result<Format, SourceError> {
    Ok(match step {
        InferenceStep::ObjectName => probe
            .object_name()
            .await?
            .map(|name| Format::infer_from_path(&name))
            .unwrap_or(Format::Unknown),
        InferenceStep::IdentifierExtension => probe
            .raw_identifier()
            .map(|id| Format::infer_from_path(id.as_str()))
            .unwrap_or(Format::Unknown),
        InferenceStep::DeclaredMediaType => probe
            .declared_media_type()
            .await?
            .map(|media_type| Format::from_media_type(&media_type))
            .unwrap_or(Format::Unknown),
        InferenceStep::MagicBytes => {
            let bytes = probe.read_magic_bytes(MAGIC_BYTES_LENGTH).await?;
            Format::from_magic_bytes(&bytes)
        }
    })
}

/// Probe over a source-cache copy of an object.
///
/// The cached file name carries no format hint, so only the identifier and
/// the content are consulted.
pub struct CachedFileProbe {
    identifier: Identifier,
    path: PathBuf,
}

impl CachedFileProbe {
    pub fn new(identifier: Identifier, path: PathBuf) -> Self {
        Self { identifier, path }
    }
}

#[async_trait]
impl FormatProbe for CachedFileProbe {
    async fn object_name(&self) -> Result<Option<String>, SourceError> {
        Ok(None)
    }

    fn raw_identifier(&self) -> Option<&Identifier> {
        Some(&self.identifier)
    }

    async fn read_magic_bytes(&self, len: usize) -> Result<Bytes, SourceError> {
        let reader = FileRangeReader::open(&self.path).await?;
        Ok(read_head(&reader, len).await?)
    }
}
