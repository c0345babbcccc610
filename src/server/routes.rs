//! Router configuration.
//!
//! # Route Structure
//!
//! ```text
//! /health                                                 - Health check
//! /{identifier}/info.json                                 - Source image info
//! /{identifier}/{region}/{size}/{rotation}/{filename}     - Derivative image
//! ```
//!
//! Identifiers containing `/` must be percent-encoded (`%2F`).

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{health_handler, image_handler, info_handler, AppState};
use crate::pipeline::Pipeline;

// =============================================================================
// Router Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Allowed CORS origins (None = allow any origin)
    pub cors_origins: Option<Vec<String>>,

    /// Cache-Control max-age in seconds
    pub cache_max_age: u32,

    pub enable_tracing: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cors_origins: None,
            cache_max_age: 3600,
            enable_tracing: true,
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass an empty vec to disallow all cross-origin requests.
    pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
        self.cors_origins = Some(origins);
        self
    }

    pub fn with_cache_max_age(mut self, seconds: u32) -> Self {
        self.cache_max_age = seconds;
        self
    }

    pub fn with_tracing(mut self, enabled: bool) -> Self {
        self.enable_tracing = enabled;
        self
    }
}

// =============================================================================
// Router Builder
// =============================================================================

pub fn create_router(pipeline: Arc<Pipeline>, config: RouterConfig) -> Router {
    let state = AppState::with_cache_max_age(pipeline, config.cache_max_age);
    let cors = build_cors_layer(&config);

    let router = Router::new()
        .route("/health", get(health_handler))
        .route("/{identifier}/info.json", get(info_handler))
        .route(
            "/{identifier}/{region}/{size}/{rotation}/{filename}",
            get(image_handler),
        )
        .with_state(state)
        .layer(cors);

    if config.enable_tracing {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

fn build_cors_layer(config: &RouterConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::HEAD, Method::OPTIONS])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE])
        .max_age(Duration::from_secs(86400));

    match &config.cors_origins {
        None => cors.allow_origin(Any),
        Some(origins) if origins.is_empty() => cors,
        Some(origins) => {
            let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
            cors.allow_origin(parsed)
        }
    }
}
