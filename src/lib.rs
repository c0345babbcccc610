//! # Image Courier
//!
//! Request-handling core of an image server. An image request names a source
//! image by identifier plus a list of operations (crop, scale, rotate,
//! encode). The pipeline resolves the identifier against a storage backend,
//! detects the source format, binds a processor to the source and streams the
//! derivative image to the client while filling a derivative cache.
//!
//! ## Features
//!
//! - **Caching**: derivative images, source copies and image infos are cached
//!   and consulted before the source is touched
//! - **Format inference**: format is inferred from names, content types and
//!   magic bytes, with a fallback chain over candidate formats
//! - **Retrieval strategies**: stream-capable sources are streamed, downloaded
//!   to a temporary file, or materialized in the source cache
//! - **Delegate hooks**: authorization, metadata and lookup decisions can be
//!   delegated to a user-supplied [`DelegateProxy`]
//!
//! ## Architecture
//!
//! - [`image`] - identifiers, formats, infos and operation lists
//! - [`source`] - filesystem and S3 sources, format inference
//! - [`cache`] - derivative, source and info caches
//! - [`processor`] - processors and the source/processor binder
//! - [`handler`] - information and image request handlers
//! - [`pipeline`] - shared request pipeline
//! - [`server`] - Axum-based HTTP adapter
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use image_courier::{create_router, Config, Cli, RouterConfig};
//! use clap::Parser;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: Config = Cli::parse().serve;
//!     let pipeline = Arc::new(config.build_pipeline());
//!     let router = create_router(pipeline, RouterConfig::default());
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8182").await.unwrap();
//!     axum::serve(listener, router).await.unwrap();
//! }
//! ```

pub mod cache;
pub mod config;
pub mod delegate;
pub mod error;
pub mod handler;
pub mod health;
pub mod image;
pub mod io;
pub mod pipeline;
pub mod processor;
pub mod server;
pub mod source;

// Re-export commonly used types
pub use cache::{CacheFacade, DerivativeCache, FilesystemCache, HeapCache, InfoService, SourceCache};
pub use config::{CheckConfig, Cli, Command, Config};
pub use delegate::{DelegateProxy, NoopDelegate};
pub use error::{
    CacheError, IoError, OperationError, ProcessorError, RequestError, SourceError,
    ValidationError,
};
pub use handler::{
    ImageCallback, ImageOutcome, ImageRequestHandler, InformationCallback,
    InformationRequestHandler, RequestContext,
};
pub use health::{Health, HealthChecker, HealthColor};
pub use image::{Format, Identifier, Info, OperationList};
pub use pipeline::{Pipeline, PipelineSettings};
pub use processor::{Processor, ProcessorFactory, RasterProcessorFactory};
pub use server::{create_router, RouterConfig};
pub use source::{ConfiguredSourceFactory, Source, SourceFactory};
