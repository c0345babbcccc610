use async_trait::async_trait;
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::range_reader::check_bounds;
use super::RangeReader;
use crate::error::IoError;

/// S3-backed implementation of RangeReader.
///
/// Reads byte ranges from objects in S3 or S3-compatible storage using HTTP
/// range requests. Seeks are direct: every read is one ranged `GetObject`.
#[derive(Clone)]
pub struct S3RangeReader {
    client: Client,
    bucket: String,
    key: String,
    size: u64,
    identifier: String,
}

impl S3RangeReader {
    /// Create a reader for an object whose size is already known, e.g. from
    /// an earlier `HeadObject`.
    pub fn with_size(client: Client, bucket: String, key: String, size: u64) -> Self {
        let identifier = format!("s3://{}/{}", bucket, key);
        Self {
            client,
            bucket,
            key,
            size,
            identifier,
        }
    }
}

#[async_trait]
impl RangeReader for S3RangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        check_bounds(offset, len, self.size)?;
        if len == 0 {
            return Ok(Bytes::new());
        }

        // inclusive on both ends
        let range = format!("bytes={}-{}", offset, offset + len as u64 - 1);
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .range(range)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e, &self.bucket, &self.key))?;

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| IoError::Connection(e.to_string()))?
            .into_bytes();
        Ok(data)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

/// HTTP status of the response behind an SDK error, if one was received.
pub(crate) fn sdk_status<E>(
    err: &aws_sdk_s3::error::SdkError<E, aws_sdk_s3::config::http::HttpResponse>,
) -> Option<u16> {
    err.raw_response().map(|r| r.status().as_u16())
}

fn classify_sdk_error<E>(
    err: &aws_sdk_s3::error::SdkError<E, aws_sdk_s3::config::http::HttpResponse>,
    bucket: &str,
    key: &str,
) -> IoError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = sdk_status(err);
    let text = err.to_string();
    if status == Some(404) || text.contains("NoSuchKey") || text.contains("NotFound") {
        return IoError::NotFound(format!("s3://{}/{}", bucket, key));
    }
    IoError::S3(text)
}

/// Create an S3 client with optional custom endpoint and region.
///
/// Use a custom endpoint for S3-compatible services like MinIO:
/// ```ignore
/// let client = create_s3_client(Some("http://localhost:9000"), "us-east-1").await;
/// ```
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);
    if let Some(endpoint) = endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    let sdk_config = loader.load().await;

    // S3-compatible services usually need path-style addressing
    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
        .force_path_style(endpoint_url.is_some())
        .build();
    Client::from_conf(s3_config)
}
