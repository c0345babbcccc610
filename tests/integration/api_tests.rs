//! API integration tests through the HTTP router.
//!
//! Tests verify:
//! - Info and image endpoints over a filesystem source
//! - Error responses (missing source, bad path segments, bad regions)
//! - Cache headers and cache bypass

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use image_courier::{create_router, PipelineSettings, RouterConfig};

use super::test_utils::{heap_caches, is_valid_jpeg, is_valid_png, test_pipeline, SourceDir};

async fn get(router: axum::Router, uri: &str) -> axum::response::Response {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    router.oneshot(request).await.unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn router_for(dir: &SourceDir) -> axum::Router {
    let test = test_pipeline(dir, PipelineSettings::default(), heap_caches());
    create_router(test.pipeline, RouterConfig::new().with_tracing(false))
}

// =============================================================================
// Info Endpoint
// =============================================================================

#[tokio::test]
async fn test_info_endpoint() {
    let dir = SourceDir::new();
    let router = router_for(&dir);

    let response = get(router, "/cat.jpg/info.json").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "public, max-age=3600"
    );

    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["identifier"], "cat.jpg");
    assert_eq!(json["width"], 64);
    assert_eq!(json["height"], 56);
    assert_eq!(json["format"], "jpeg");
    assert_eq!(json["pages"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_info_missing_source() {
    let dir = SourceDir::new();
    let router = router_for(&dir);

    let response = get(router, "/missing.jpg/info.json").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["error"], "not_found");
}

// =============================================================================
// Image Endpoint
// =============================================================================

#[tokio::test]
async fn test_image_rendered() {
    let dir = SourceDir::new();
    let router = router_for(&dir);

    let response = get(router, "/cat.jpg/square/32,/90/default.png").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("content-type").unwrap(), "image/png");
    assert_eq!(
        response.headers().get("x-derivative-cache-hit").unwrap(),
        "false"
    );
    assert!(is_valid_png(&body_bytes(response).await));
}

#[tokio::test]
async fn test_image_pass_through() {
    let dir = SourceDir::new();
    let router = router_for(&dir);

    let response = get(router, "/cat.jpg/full/max/0/default.jpg").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_bytes(response).await;
    assert!(is_valid_jpeg(&body));
    assert_eq!(body.as_ref(), dir.jpeg.as_slice());
}

#[tokio::test]
async fn test_second_request_is_cache_hit() {
    let dir = SourceDir::new();
    let router = router_for(&dir);
    let uri = "/dog.png/0,0,32,32/max/0/default.jpg";

    let first = get(router.clone(), uri).await;
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_bytes(first).await;

    let second = get(router.clone(), uri).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(
        second.headers().get("x-derivative-cache-hit").unwrap(),
        "true"
    );
    assert_eq!(body_bytes(second).await, first_body);

    let bypassed = get(router, &format!("{}?cache=false", uri)).await;
    assert_eq!(
        bypassed.headers().get("x-derivative-cache-hit").unwrap(),
        "false"
    );
}

#[tokio::test]
async fn test_image_errors() {
    let dir = SourceDir::new();
    let router = router_for(&dir);

    let cases = [
        ("/missing.jpg/full/max/0/default.jpg", StatusCode::NOT_FOUND),
        ("/cat.jpg/100,0,10,10/max/0/default.jpg", StatusCode::BAD_REQUEST),
        ("/cat.jpg/bogus/max/0/default.jpg", StatusCode::BAD_REQUEST),
        ("/cat.jpg/full/0,/0/default.jpg", StatusCode::BAD_REQUEST),
        ("/cat.jpg/full/max/45/default.jpg", StatusCode::BAD_REQUEST),
        ("/cat.jpg/full/max/0/gray.jpg", StatusCode::BAD_REQUEST),
        ("/cat.jpg/full/max/0/default.xyz", StatusCode::BAD_REQUEST),
    ];
    for (uri, status) in cases {
        let response = get(router.clone(), uri).await;
        assert_eq!(response.status(), status, "{}", uri);
    }
}

#[tokio::test]
async fn test_unreadable_source_is_not_implemented() {
    let dir = SourceDir::new();
    std::fs::write(dir.path().join("notes.txt"), b"plain text").unwrap();
    let router = router_for(&dir);

    let response = get(router, "/notes.txt/full/max/0/default.jpg").await;
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let dir = SourceDir::new();
    let router = router_for(&dir);

    get(router.clone(), "/cat.jpg/square/16,/0/default.png").await;

    let response = get(router, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(json["color"], "GREEN");
}
