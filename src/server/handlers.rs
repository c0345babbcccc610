//! HTTP request handlers.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /{identifier}/info.json` - Source image info
//! - `GET /{identifier}/{region}/{size}/{rotation}/{filename}` - Derivative image

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::params;
use crate::error::RequestError;
use crate::handler::{
    DelegateCallback, ImageOutcome, ImageRequestHandler, InformationRequestHandler, RequestContext,
};
use crate::health::{Health, HealthChecker};
use crate::image::{Format, Info};
use crate::pipeline::Pipeline;

// =============================================================================
// Application State
// =============================================================================

/// Shared application state, passed to handlers via Axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub health: Arc<HealthChecker>,
    /// Cache-Control max-age in seconds
    pub cache_max_age: u32,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self::with_cache_max_age(pipeline, 3600)
    }

    pub fn with_cache_max_age(pipeline: Arc<Pipeline>, cache_max_age: u32) -> Self {
        Self {
            health: Arc::new(HealthChecker::new(pipeline.clone())),
            pipeline,
            cache_max_age,
        }
    }

    fn callback(&self) -> Arc<DelegateCallback> {
        Arc::new(DelegateCallback::new(self.pipeline.delegate().clone()))
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Path parameters of the image endpoint.
#[derive(Debug, Deserialize)]
pub struct ImagePathParams {
    pub identifier: String,
    pub region: String,
    pub size: String,
    pub rotation: String,
    /// `{quality}.{format}`
    pub filename: String,
}

/// Query parameters shared by the info and image endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct CacheQueryParams {
    /// `false` bypasses every cache for this request
    #[serde(default)]
    pub cache: Option<String>,
}

impl CacheQueryParams {
    pub fn bypass(&self) -> bool {
        matches!(self.cache.as_deref(), Some("false") | Some("nocache"))
    }
}

// =============================================================================
// Response Types
// =============================================================================

/// JSON error response returned for all error conditions.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error type identifier (e.g., "not_found", "invalid_request")
    pub error: String,

    /// Human-readable error message
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorResponse {
    pub fn with_status(
        error: impl Into<String>,
        message: impl Into<String>,
        status: StatusCode,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            status: Some(status.as_u16()),
        }
    }
}

/// Size of one page of a source image.
#[derive(Debug, Serialize)]
pub struct PageResponse {
    pub width: u32,
    pub height: u32,
}

/// Body of the info endpoint.
#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub identifier: String,
    pub width: u32,
    pub height: u32,
    pub format: Option<Format>,
    pub media_type: Option<String>,
    pub num_resolutions: u32,
    pub pages: Vec<PageResponse>,
}

impl InfoResponse {
    fn new(identifier: &str, info: &Info) -> Self {
        let pages: Vec<PageResponse> = info
            .images
            .iter()
            .map(|image| {
                let size = image.size();
                PageResponse {
                    width: size.width,
                    height: size.height,
                }
            })
            .collect();
        let (width, height) = pages.first().map(|p| (p.width, p.height)).unwrap_or((0, 0));
        Self {
            identifier: identifier.to_string(),
            width,
            height,
            format: info.source_format,
            media_type: info.media_type.clone(),
            num_resolutions: info.num_resolutions,
            pages,
        }
    }
}

// =============================================================================
// Error Mapping
// =============================================================================

/// Client errors are logged at WARN (404 at DEBUG), server errors at ERROR.
impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            RequestError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            RequestError::AccessDenied(_) => (StatusCode::FORBIDDEN, "access_denied"),
            RequestError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
            RequestError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            RequestError::IllegalArgument(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            RequestError::SourceFormat(_) => (StatusCode::NOT_IMPLEMENTED, "unsupported_format"),
            RequestError::Processing(_) => (StatusCode::INTERNAL_SERVER_ERROR, "processing_error"),
            RequestError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "io_error"),
            RequestError::Incompatible(_) | RequestError::SourceCacheDisabled(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error")
            }
            RequestError::Cache(_) => (StatusCode::INTERNAL_SERVER_ERROR, "cache_error"),
        };
        let message = self.to_string();

        if status.is_server_error() {
            error!(error_type, status = status.as_u16(), "Server error: {}", message);
        } else if status == StatusCode::NOT_FOUND {
            debug!(error_type, status = status.as_u16(), "Resource not found: {}", message);
        } else {
            warn!(error_type, status = status.as_u16(), "Client error: {}", message);
        }

        let body = ErrorResponse::with_status(error_type, message, status);
        (status, Json(body)).into_response()
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Request facts a delegate may authorize on.
fn request_context(headers: &HeaderMap) -> RequestContext {
    let mut context = RequestContext::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            context = context.with_header(name.as_str(), value);
        }
    }
    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        context = context.with_client_ip(ip.trim());
    }
    for cookie in headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
    {
        if let Some((name, value)) = cookie.trim().split_once('=') {
            context = context.with_cookie(name, value);
        }
    }
    context
}

/// Handle info requests.
///
/// `GET /{identifier}/info.json`
pub async fn info_handler(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
    Query(query): Query<CacheQueryParams>,
    headers: HeaderMap,
) -> Result<Response, RequestError> {
    let (id, _) = params::parse_identifier(&identifier)?;
    let mut handler = InformationRequestHandler::builder(state.pipeline.clone())
        .identifier(id)
        .context(request_context(&headers))
        .callback(state.callback())
        .bypass_cache(query.bypass())
        .build()?;

    let result = handler.handle().await;
    handler.close();
    let info = result?.ok_or_else(|| RequestError::Forbidden(identifier.clone()))?;

    let headers = [(
        header::CACHE_CONTROL,
        format!("public, max-age={}", state.cache_max_age),
    )];
    Ok((headers, Json(InfoResponse::new(&identifier, &info))).into_response())
}

/// Handle image requests.
///
/// `GET /{identifier}/{region}/{size}/{rotation}/{quality}.{format}`
///
/// # Headers
///
/// - `Content-Type` of the requested output format
/// - `Cache-Control: public, max-age={cache_max_age}`
/// - `X-Derivative-Cache-Hit: true|false`
pub async fn image_handler(
    State(state): State<AppState>,
    Path(params): Path<ImagePathParams>,
    Query(query): Query<CacheQueryParams>,
    headers: HeaderMap,
) -> Result<Response, RequestError> {
    let ops = params::operation_list(
        &params.identifier,
        &params.region,
        &params.size,
        &params.rotation,
        &params.filename,
    )?;
    let media_type = ops.output_format().preferred_media_type();

    let mut handler = ImageRequestHandler::builder(state.pipeline.clone())
        .operations(ops)
        .context(request_context(&headers))
        .callback(state.callback())
        .bypass_cache(query.bypass())
        .build()?;

    let mut body = Vec::new();
    let result = handler.handle(&mut body).await;
    handler.close();

    let cache_hit = match result? {
        ImageOutcome::Denied => return Err(RequestError::Forbidden(params.identifier)),
        ImageOutcome::FromCache => true,
        ImageOutcome::PassedThrough | ImageOutcome::Rendered => false,
    };

    let headers = [
        (header::CONTENT_TYPE, media_type.to_string()),
        (
            header::CACHE_CONTROL,
            format!("public, max-age={}", state.cache_max_age),
        ),
        (
            HeaderName::from_static("x-derivative-cache-hit"),
            cache_hit.to_string(),
        ),
    ];
    Ok((StatusCode::OK, headers, body).into_response())
}

/// Handle health check requests.
///
/// `GET /health` answers 200 unless the health is red.
pub async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<Health>) {
    let health = state.health.check().await;
    let status = if health.is_red() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    (status, Json(health))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::image::ImageInfo;

    #[test]
    fn test_request_error_to_status_code() {
        let cases = [
            (RequestError::NotFound("a".into()), StatusCode::NOT_FOUND),
            (RequestError::AccessDenied("a".into()), StatusCode::FORBIDDEN),
            (RequestError::Forbidden("a".into()), StatusCode::FORBIDDEN),
            (
                RequestError::Validation(ValidationError::EmptyRegion),
                StatusCode::BAD_REQUEST,
            ),
            (RequestError::SourceFormat("a".into()), StatusCode::NOT_IMPLEMENTED),
            (RequestError::Io("a".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                RequestError::Incompatible("a".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn test_error_response_serialization() {
        let body = ErrorResponse::with_status("not_found", "gone", StatusCode::NOT_FOUND);
        let json = serde_json::to_string(&body).unwrap();
        assert_eq!(json, r#"{"error":"not_found","message":"gone","status":404}"#);
    }

    #[test]
    fn test_cache_query_bypass() {
        let query: CacheQueryParams = serde_json::from_str(r#"{"cache":"false"}"#).unwrap();
        assert!(query.bypass());
        assert!(!CacheQueryParams::default().bypass());
    }

    #[test]
    fn test_request_context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.0.0.1, 10.0.0.2".parse().unwrap());
        headers.insert(header::COOKIE, "session=abc; theme=dark".parse().unwrap());
        let context = request_context(&headers);
        assert_eq!(context.client_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(context.cookies.get("theme").map(String::as_str), Some("dark"));
        assert!(context.request_headers.contains_key("x-forwarded-for"));
    }

    #[test]
    fn test_info_response() {
        let info = Info::new(Format::Png, vec![ImageInfo::untiled(64, 56), ImageInfo::untiled(32, 28)]);
        let body = InfoResponse::new("a.png", &info);
        assert_eq!((body.width, body.height), (64, 56));
        assert_eq!(body.pages.len(), 2);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["format"], "png");
    }
}
