//! Health checking.
//!
//! Successful renders are recorded per source/processor pair in a
//! [`HealthLedger`]. [`HealthChecker::check`] replays the latest request of
//! each pair without caching, then round-trips throwaway entries through
//! the configured caches.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::cache::{DerivativeCache, SourceCache};
use crate::error::CacheError;
use crate::handler::ImageRequestHandler;
use crate::image::{Encode, Format, Identifier, ImageInfo, Info, Operation, OperationList};
use crate::pipeline::Pipeline;

const PROBE_BYTES: &[u8] = b"health check payload";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthColor {
    Green,
    Yellow,
    Red,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub color: HealthColor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Default for Health {
    fn default() -> Self {
        Self {
            color: HealthColor::Green,
            message: None,
        }
    }
}

impl Health {
    /// Lower the health to `color` unless it is already worse. The first
    /// message at the worst color is kept.
    pub fn degrade(&mut self, color: HealthColor, message: impl Into<String>) {
        if color > self.color {
            self.color = color;
            self.message = Some(message.into());
        }
    }

    pub fn is_red(&self) -> bool {
        self.color == HealthColor::Red
    }
}

/// The most recent successful request per source/processor pair.
#[derive(Debug, Default)]
pub struct HealthLedger {
    entries: Mutex<HashMap<(&'static str, &'static str), OperationList>>,
}

impl HealthLedger {
    pub fn record(&self, source: &'static str, processor: &'static str, ops: OperationList) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert((source, processor), ops);
    }

    pub fn snapshot(&self) -> Vec<(&'static str, &'static str, OperationList)> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut snapshot: Vec<_> = entries
            .iter()
            .map(|(&(source, processor), ops)| (source, processor, ops.clone()))
            .collect();
        snapshot.sort_by_key(|(source, processor, _)| (*source, *processor));
        snapshot
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct HealthChecker {
    pipeline: Arc<Pipeline>,
}

impl HealthChecker {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    pub async fn check(&self) -> Health {
        let mut health = Health::default();

        for (source, processor, ops) in self.pipeline.health().snapshot() {
            if let Err(message) = self.replay(ops).await {
                warn!(source, processor, error = %message, "Health check request failed");
                health.degrade(HealthColor::Red, format!("{}/{}: {}", source, processor, message));
            }
        }

        let caches = self.pipeline.caches();
        if let Some(cache) = caches.derivative_cache() {
            if let Err(e) = check_derivative_cache(cache.as_ref()).await {
                warn!(cache = cache.name(), error = %e, "Derivative cache health check failed");
                health.degrade(HealthColor::Yellow, format!("{}: {}", cache.name(), e));
            }
        }
        if let Some(cache) = caches.source_cache() {
            if let Err(e) = check_source_cache(cache.as_ref()).await {
                warn!(cache = cache.name(), error = %e, "Source cache health check failed");
                health.degrade(HealthColor::Yellow, format!("{}: {}", cache.name(), e));
            }
        }

        debug!(color = ?health.color, "Health check complete");
        health
    }

    async fn replay(&self, ops: OperationList) -> Result<(), String> {
        let mut handler = ImageRequestHandler::builder(self.pipeline.clone())
            .operations(ops)
            .bypass_cache(true)
            .build()
            .map_err(|e| e.to_string())?;
        let mut sink = tokio::io::sink();
        let result = handler.handle(&mut sink).await;
        handler.close();
        result.map(|_| ()).map_err(|e| e.to_string())
    }
}

fn probe_identifier() -> Identifier {
    Identifier::from(format!("HealthCheck-{}", uuid::Uuid::new_v4()))
}

async fn check_derivative_cache(cache: &dyn DerivativeCache) -> Result<(), CacheError> {
    let identifier = probe_identifier();
    let info = Info::new(Format::Png, vec![ImageInfo::untiled(1, 1)]).with_identifier(identifier.clone());
    let mut ops = OperationList::new(identifier.clone())
        .with(Operation::Encode(Encode::new(Format::Png)));
    ops.freeze();

    let result = async {
        cache.put_info(&identifier, &info).await?;
        if cache.get_info(&identifier).await?.as_ref() != Some(&info) {
            return Err(CacheError::Io("info did not round-trip".into()));
        }

        let mut writer = cache.new_derivative_image_writer(&ops).await?;
        writer.write_all(PROBE_BYTES).await?;
        writer.commit().await?;
        let mut reader = cache
            .new_derivative_image_reader(&ops)
            .await?
            .ok_or_else(|| CacheError::Io("derivative did not round-trip".into()))?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        if buf != PROBE_BYTES {
            return Err(CacheError::Io("derivative content differs".into()));
        }
        Ok::<(), CacheError>(())
    }
    .await;

    cache.purge_identifier(&identifier).await?;
    result
}

async fn check_source_cache(cache: &dyn SourceCache) -> Result<(), CacheError> {
    let identifier = probe_identifier();
    let result = async {
        let mut writer = cache.new_source_image_writer(&identifier).await?;
        writer.write_all(PROBE_BYTES).await?;
        writer.commit().await?;
        let path = cache
            .get_source_image_file(&identifier)
            .await?
            .ok_or_else(|| CacheError::Io("source copy did not round-trip".into()))?;
        if tokio::fs::read(&path).await? != PROBE_BYTES {
            return Err(CacheError::Io("source copy content differs".into()));
        }
        Ok::<(), CacheError>(())
    }
    .await;

    cache.purge_source(&identifier).await?;
    result
}
