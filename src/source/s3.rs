//! S3-backed source.
//!
//! Objects are located either by prefix/suffix concatenation around the
//! identifier within a configured bucket, or by asking the delegate for a
//! bucket and key. Both the location and the `HeadObject` attributes are
//! looked up at most once per identifier binding.
//!
//! The S3 client is shared by every `S3Source` in the process. It is created
//! on first use and dropped by [`release_shared_client`].

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use super::{FormatProbe, LookupStrategy, Source, StatResult, StreamAccess, StreamFactory};
use crate::delegate::{DelegateProxy, NoopDelegate};
use crate::error::SourceError;
use crate::image::Identifier;
use crate::io::{create_s3_client, read_head, sdk_status, RangeReader, S3RangeReader};

/// Location of an object in S3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3ObjectInfo {
    pub bucket: String,
    pub key: String,
}

impl S3ObjectInfo {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    fn location(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Clone)]
pub struct S3SourceSettings {
    pub bucket: String,
    pub key_prefix: String,
    pub key_suffix: String,
    /// Custom endpoint for S3-compatible services
    pub endpoint: Option<String>,
    pub region: String,
    pub lookup_strategy: LookupStrategy,
}

impl Default for S3SourceSettings {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            key_prefix: String::new(),
            key_suffix: String::new(),
            endpoint: None,
            region: "us-east-1".to_string(),
            lookup_strategy: LookupStrategy::Basic,
        }
    }
}

// =============================================================================
// Shared client
// =============================================================================

static SHARED_CLIENT: Mutex<Option<Client>> = Mutex::const_new(None);

async fn shared_client(settings: &S3SourceSettings) -> Client {
    let mut slot = SHARED_CLIENT.lock().await;
    if let Some(client) = slot.as_ref() {
        return client.clone();
    }
    info!(
        endpoint = settings.endpoint.as_deref().unwrap_or("default"),
        region = %settings.region,
        "Creating shared S3 client"
    );
    let client = create_s3_client(settings.endpoint.as_deref(), &settings.region).await;
    *slot = Some(client.clone());
    client
}

/// Drop the process-wide S3 client. The next S3 request creates a new one.
pub async fn release_shared_client() {
    if SHARED_CLIENT.lock().await.take().is_some() {
        info!("Released shared S3 client");
    }
}

// =============================================================================
// S3Source
// =============================================================================

/// Attributes learned from `HeadObject`.
#[derive(Debug, Clone)]
struct ObjectAttributes {
    length: u64,
    content_type: Option<String>,
    last_modified: Option<SystemTime>,
}

/// Lookups cached for one identifier binding.
#[derive(Default)]
struct BindingState {
    object: OnceCell<S3ObjectInfo>,
    attributes: OnceCell<ObjectAttributes>,
}

/// Source over objects in S3 or S3-compatible storage. Stream access only.
pub struct S3Source {
    settings: S3SourceSettings,
    /// Overrides the shared client when set
    client: Option<Client>,
    identifier: Option<Identifier>,
    delegate: Arc<dyn DelegateProxy>,
    state: BindingState,
}

impl S3Source {
    pub fn new(settings: S3SourceSettings) -> Self {
        Self {
            settings,
            client: None,
            identifier: None,
            delegate: Arc::new(NoopDelegate),
            state: BindingState::default(),
        }
    }

    /// Use `client` instead of the process-wide shared client.
    pub fn with_client(settings: S3SourceSettings, client: Client) -> Self {
        Self {
            client: Some(client),
            ..Self::new(settings)
        }
    }

    async fn client(&self) -> Client {
        match &self.client {
            Some(client) => client.clone(),
            None => shared_client(&self.settings).await,
        }
    }

    /// Bucket and key of the bound identifier.
    pub async fn object_info(&self) -> Result<&S3ObjectInfo, SourceError> {
        self.state.object.get_or_try_init(|| self.lookup()).await
    }

    async fn lookup(&self) -> Result<S3ObjectInfo, SourceError> {
        let identifier = self
            .identifier
            .as_ref()
            .ok_or_else(|| SourceError::Lookup("no identifier set".into()))?;

        let object = match self.settings.lookup_strategy {
            LookupStrategy::Basic => S3ObjectInfo::new(
                self.settings.bucket.clone(),
                format!(
                    "{}{}{}",
                    self.settings.key_prefix, identifier, self.settings.key_suffix
                ),
            ),
            LookupStrategy::Delegate => self
                .delegate
                .s3_object_info(identifier)
                .await?
                .ok_or_else(|| {
                    SourceError::NotFound(format!("delegate returned no object for {}", identifier))
                })?,
        };
        debug!(identifier = %identifier, location = %object.location(), "Resolved S3 object");
        Ok(object)
    }

    async fn attributes(&self) -> Result<&ObjectAttributes, SourceError> {
        self.state
            .attributes
            .get_or_try_init(|| self.head())
            .await
    }

    async fn head(&self) -> Result<ObjectAttributes, SourceError> {
        let object = self.object_info().await?;
        let head = self
            .client()
            .await
            .head_object()
            .bucket(&object.bucket)
            .key(&object.key)
            .send()
            .await
            .map_err(|e| classify(&e, object))?;

        Ok(ObjectAttributes {
            length: head.content_length().unwrap_or(0).max(0) as u64,
            content_type: head.content_type().map(String::from),
            last_modified: head
                .last_modified()
                .cloned()
                .and_then(|t| SystemTime::try_from(t).ok()),
        })
    }

    async fn range_reader(&self) -> Result<S3RangeReader, SourceError> {
        let object = self.object_info().await?;
        let length = self.attributes().await?.length;
        Ok(S3RangeReader::with_size(
            self.client().await,
            object.bucket.clone(),
            object.key.clone(),
            length,
        ))
    }
}

fn classify<E>(err: &SdkError<E, HttpResponse>, object: &S3ObjectInfo) -> SourceError {
    match sdk_status(err) {
        Some(404) => SourceError::NotFound(object.location()),
        Some(401) | Some(403) => SourceError::AccessDenied(object.location()),
        _ => SourceError::Io(format!("{}: {}", object.location(), err)),
    }
}

#[async_trait]
impl Source for S3Source {
    fn name(&self) -> &'static str {
        "S3Source"
    }

    fn set_identifier(&mut self, identifier: Identifier) {
        self.identifier = Some(identifier);
        self.state = BindingState::default();
    }

    fn identifier(&self) -> Option<&Identifier> {
        self.identifier.as_ref()
    }

    fn set_delegate(&mut self, delegate: Arc<dyn DelegateProxy>) {
        self.delegate = delegate;
        self.state = BindingState::default();
    }

    async fn stat(&self) -> Result<StatResult, SourceError> {
        let attributes = self.attributes().await?;
        Ok(StatResult {
            last_modified: attributes.last_modified,
        })
    }

    fn format_probe(&self) -> &dyn FormatProbe {
        self
    }

    fn stream_access(&self) -> Option<&dyn StreamAccess> {
        Some(self)
    }

    async fn shutdown(&self) {
        release_shared_client().await;
    }
}

#[async_trait]
impl FormatProbe for S3Source {
    async fn object_name(&self) -> Result<Option<String>, SourceError> {
        Ok(Some(self.object_info().await?.key.clone()))
    }

    fn raw_identifier(&self) -> Option<&Identifier> {
        self.identifier.as_ref()
    }

    async fn declared_media_type(&self) -> Result<Option<String>, SourceError> {
        Ok(self.attributes().await?.content_type.clone())
    }

    async fn read_magic_bytes(&self, len: usize) -> Result<Bytes, SourceError> {
        let reader = self.range_reader().await?;
        Ok(read_head(&reader, len).await?)
    }
}

#[async_trait]
impl StreamAccess for S3Source {
    async fn new_stream_factory(&self) -> Result<Arc<dyn StreamFactory>, SourceError> {
        let object = self.object_info().await?.clone();
        let length = self.attributes().await?.length;
        Ok(Arc::new(S3StreamFactory {
            client: self.client().await,
            location: object.location(),
            object,
            length,
        }))
    }
}

/// Streams over one S3 object. Seekable streams issue ranged `GetObject`
/// requests.
struct S3StreamFactory {
    client: Client,
    object: S3ObjectInfo,
    length: u64,
    location: String,
}

#[async_trait]
impl StreamFactory for S3StreamFactory {
    fn location(&self) -> &str {
        &self.location
    }

    async fn new_stream(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>, SourceError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.object.bucket)
            .key(&self.object.key)
            .send()
            .await
            .map_err(|e| classify(&e, &self.object))?;
        Ok(Box::new(Box::pin(response.body.into_async_read())))
    }

    async fn new_seekable_stream(&self) -> Result<Arc<dyn RangeReader>, SourceError> {
        Ok(Arc::new(S3RangeReader::with_size(
            self.client.clone(),
            self.object.bucket.clone(),
            self.object.key.clone(),
            self.length,
        )))
    }

    fn is_seeking_direct(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_client() -> Client {
        Client::from_conf(
            aws_sdk_s3::Config::builder()
                .behavior_version_latest()
                .region(aws_sdk_s3::config::Region::new("us-east-1"))
                .build(),
        )
    }

    struct BucketDelegate;

    #[async_trait]
    impl DelegateProxy for BucketDelegate {
        async fn s3_object_info(
            &self,
            identifier: &Identifier,
        ) -> Result<Option<S3ObjectInfo>, SourceError> {
            if identifier.as_str() == "unknown" {
                return Ok(None);
            }
            Ok(Some(S3ObjectInfo::new(
                "delegated-bucket",
                format!("objects/{}", identifier),
            )))
        }
    }

    #[tokio::test]
    async fn test_basic_lookup_composes_key() {
        let settings = S3SourceSettings {
            bucket: "images".into(),
            key_prefix: "originals/".into(),
            key_suffix: ".jp2".into(),
            ..Default::default()
        };
        let mut source = S3Source::with_client(settings, offline_client());
        source.set_identifier(Identifier::from("page-1"));

        let object = source.object_info().await.unwrap();
        assert_eq!(object, &S3ObjectInfo::new("images", "originals/page-1.jp2"));
        assert_eq!(
            source.object_name().await.unwrap().as_deref(),
            Some("originals/page-1.jp2")
        );
    }

    #[tokio::test]
    async fn test_delegate_lookup() {
        let settings = S3SourceSettings {
            lookup_strategy: LookupStrategy::Delegate,
            ..Default::default()
        };
        let mut source = S3Source::with_client(settings, offline_client());
        source.set_delegate(Arc::new(BucketDelegate));
        source.set_identifier(Identifier::from("cat.jpg"));
        assert_eq!(
            source.object_info().await.unwrap(),
            &S3ObjectInfo::new("delegated-bucket", "objects/cat.jpg")
        );

        source.set_identifier(Identifier::from("unknown"));
        assert!(matches!(
            source.object_info().await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rebinding_discards_lookup() {
        let settings = S3SourceSettings {
            bucket: "b".into(),
            ..Default::default()
        };
        let mut source = S3Source::with_client(settings, offline_client());
        source.set_identifier(Identifier::from("one"));
        assert_eq!(source.object_info().await.unwrap().key, "one");
        source.set_identifier(Identifier::from("two"));
        assert_eq!(source.object_info().await.unwrap().key, "two");
    }

    #[test]
    fn test_capabilities() {
        let source = S3Source::with_client(S3SourceSettings::default(), offline_client());
        assert!(source.file_access().is_none());
        assert!(source.stream_access().is_some());
        assert_eq!(source.name(), "S3Source");
    }
}
