//! HTTP adapter over the request handlers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         HTTP Layer                              │
//! │   GET /{identifier}/{region}/{size}/{rotation}/{filename}       │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │  handlers   │  │   params    │  │        routes           │  │
//! │  │ (requests)  │  │ (path ops)  │  │  (router config)        │  │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                   ImageRequestHandler / InformationRequestHandler
//! ```

pub mod handlers;
pub mod params;
pub mod routes;

pub use handlers::{
    health_handler, image_handler, info_handler, AppState, CacheQueryParams, ErrorResponse,
    ImagePathParams, InfoResponse, PageResponse,
};
pub use params::operation_list;
pub use routes::{create_router, RouterConfig};
