//! Materialization of stream-only sources into the source cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::cache::SourceCache;
use crate::error::RequestError;
use crate::image::Identifier;
use crate::source::StreamFactory;

/// State for an in-flight download.
struct InFlightDownload {
    notify: Notify,
    result: Mutex<Option<Result<PathBuf, RequestError>>>,
}

impl InFlightDownload {
    fn result(&self) -> Option<Result<PathBuf, RequestError>> {
        self.result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Copies source objects into the source cache, at most one download per
/// identifier at a time.
///
/// Concurrent callers for the same identifier wait for the download in
/// progress and share its result. If the downloading caller is cancelled,
/// the waiters wake up and one of them takes over.
#[derive(Default)]
pub struct SourceCacheDownloader {
    in_flight: Mutex<HashMap<Identifier, Arc<InFlightDownload>>>,
}

enum Role {
    Lead(Arc<InFlightDownload>),
    Wait(Arc<InFlightDownload>),
}

/// Held by the caller performing a download. Dropping it, on completion or
/// cancellation, releases the identifier and wakes the waiters.
struct LeaderGuard<'a> {
    downloader: &'a SourceCacheDownloader,
    identifier: Identifier,
    state: Arc<InFlightDownload>,
}

impl LeaderGuard<'_> {
    fn finish(&self, result: Result<PathBuf, RequestError>) {
        *self
            .state
            .result
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(result);
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if self.state.result().is_none() {
            warn!(identifier = %self.identifier, "Source cache download abandoned");
        }
        let mut in_flight = self.downloader.lock_in_flight();
        if in_flight
            .get(&self.identifier)
            .is_some_and(|current| Arc::ptr_eq(current, &self.state))
        {
            in_flight.remove(&self.identifier);
        }
        drop(in_flight);
        self.state.notify.notify_waiters();
    }
}

impl SourceCacheDownloader {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<Identifier, Arc<InFlightDownload>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of identifiers with a download in progress.
    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    /// Path of a complete source cache copy of `identifier`, downloading it
    /// through `factory` if there is none yet.
    pub async fn get_or_download(
        &self,
        cache: &dyn SourceCache,
        identifier: &Identifier,
        factory: &dyn StreamFactory,
    ) -> Result<PathBuf, RequestError> {
        loop {
            if let Some(path) = cache.get_source_image_file(identifier).await? {
                debug!(identifier = %identifier, path = %path.display(), "Source cache hit");
                return Ok(path);
            }

            let role = {
                let mut in_flight = self.lock_in_flight();
                match in_flight.get(identifier) {
                    Some(existing) => Role::Wait(existing.clone()),
                    None => {
                        let state = Arc::new(InFlightDownload {
                            notify: Notify::new(),
                            result: Mutex::new(None),
                        });
                        in_flight.insert(identifier.clone(), state.clone());
                        Role::Lead(state)
                    }
                }
            };

            let state = match role {
                Role::Lead(state) => state,
                Role::Wait(existing) => {
                    let notified = existing.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    // The leader may have finished between the map lookup
                    // and registering interest.
                    let still_running = self
                        .lock_in_flight()
                        .get(identifier)
                        .is_some_and(|current| Arc::ptr_eq(current, &existing));
                    if still_running {
                        notified.await;
                    }

                    if let Some(result) = existing.result() {
                        return result;
                    }
                    continue;
                }
            };

            let guard = LeaderGuard {
                downloader: self,
                identifier: identifier.clone(),
                state,
            };
            let result = download(cache, identifier, factory).await;
            guard.finish(result.clone());
            drop(guard);
            return result;
        }
    }
}

async fn download(
    cache: &dyn SourceCache,
    identifier: &Identifier,
    factory: &dyn StreamFactory,
) -> Result<PathBuf, RequestError> {
    info!(identifier = %identifier, location = factory.location(), "Downloading source into source cache");
    let mut stream = factory.new_stream().await?;
    let mut writer = cache.new_source_image_writer(identifier).await?;
    let bytes = tokio::io::copy(&mut stream, &mut writer).await?;
    writer.commit().await?;
    debug!(identifier = %identifier, bytes, "Source cache copy complete");

    cache
        .get_source_image_file(identifier)
        .await?
        .ok_or_else(|| RequestError::Io(format!("source cache has no copy of {}", identifier)))
}
