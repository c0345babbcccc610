//! Configuration management.
//!
//! Every option can be given on the command line or through an environment
//! variable with the `COURIER_` prefix, e.g.:
//!
//! - `COURIER_HOST` - Server bind address (default: 0.0.0.0)
//! - `COURIER_PORT` - Server port (default: 8182)
//! - `COURIER_SOURCE` - `filesystem` or `s3` (default: filesystem)
//! - `COURIER_PATH_PREFIX` - Filesystem source path prefix
//! - `COURIER_S3_BUCKET` - S3 bucket name (required for the s3 source)
//! - `COURIER_DERIVATIVE_CACHE` - `none`, `heap` or `filesystem`
//! - `COURIER_CACHE_DIR` - Root of the filesystem caches
//! - `CACHE_SERVER_PURGE_MISSING` - Purge cached content of missing sources
//! - `COURIER_STREAM_RETRIEVAL_STRATEGY` - `stream`, `download` or `cache`
//! - `COURIER_FALLBACK_RETRIEVAL_STRATEGY` - `download`, `cache` or `abort`

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::cache::{
    CacheFacade, FilesystemCache, HeapCache, InfoService, DEFAULT_HEAP_CACHE_CAPACITY,
    DEFAULT_INFO_CACHE_CAPACITY,
};
use crate::image::{Color, EncodeDefaults};
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::processor::{
    BinderSettings, FallbackRetrievalStrategy, RasterProcessorFactory, StreamRetrievalStrategy,
};
use crate::server::RouterConfig;
use crate::source::{
    ConfiguredSourceFactory, FilesystemSourceSettings, LookupStrategy, S3SourceSettings,
    SourceSettings,
};

// =============================================================================
// Default Values
// =============================================================================

pub const DEFAULT_HOST: &str = "0.0.0.0";

pub const DEFAULT_PORT: u16 = 8182;

pub const DEFAULT_REGION: &str = "us-east-1";

pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Default HTTP cache max-age in seconds (1 hour).
pub const DEFAULT_CACHE_MAX_AGE: u32 = 3600;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Image Courier - resolves, renders and caches derivative images.
#[derive(Parser, Debug, Clone)]
#[command(name = "image-courier")]
#[command(author, version, about, long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Server options, used when no subcommand is given.
    #[command(flatten)]
    pub serve: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP server (default).
    Serve(Config),

    /// Build the pipeline, run one health check and exit.
    Check(CheckConfig),
}

impl Cli {
    /// The selected command, `serve` when none was given.
    pub fn into_command(self) -> Command {
        self.command.unwrap_or(Command::Serve(self.serve))
    }
}

/// Options of the `check` command.
#[derive(Args, Debug, Clone)]
pub struct CheckConfig {
    #[command(flatten)]
    pub config: Config,

    /// Also read the info of this identifier.
    #[arg(long)]
    pub identifier: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SourceKind {
    #[default]
    Filesystem,
    S3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DerivativeCacheKind {
    #[default]
    None,
    Heap,
    Filesystem,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Host address to bind the server to.
    #[arg(long, default_value = DEFAULT_HOST, env = "COURIER_HOST")]
    pub host: String,

    /// Port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_PORT, env = "COURIER_PORT")]
    pub port: u16,

    // =========================================================================
    // Source Configuration
    // =========================================================================
    /// Where source images live.
    #[arg(long, value_enum, default_value_t = SourceKind::Filesystem, env = "COURIER_SOURCE")]
    pub source: SourceKind,

    /// How identifiers map to source locations.
    #[arg(long, value_enum, default_value_t = LookupStrategy::Basic, env = "COURIER_LOOKUP_STRATEGY")]
    pub lookup_strategy: LookupStrategy,

    /// Prepended to identifiers by the filesystem source.
    #[arg(long, default_value = "", env = "COURIER_PATH_PREFIX")]
    pub path_prefix: String,

    /// Appended to identifiers by the filesystem source.
    #[arg(long, default_value = "", env = "COURIER_PATH_SUFFIX")]
    pub path_suffix: String,

    /// S3 bucket containing the source images.
    #[arg(long, env = "COURIER_S3_BUCKET")]
    pub s3_bucket: Option<String>,

    /// Custom S3 endpoint URL for S3-compatible services (MinIO, etc.).
    #[arg(long, env = "COURIER_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,

    #[arg(long, default_value = DEFAULT_REGION, env = "COURIER_S3_REGION")]
    pub s3_region: String,

    #[arg(long, default_value = "", env = "COURIER_S3_KEY_PREFIX")]
    pub s3_key_prefix: String,

    #[arg(long, default_value = "", env = "COURIER_S3_KEY_SUFFIX")]
    pub s3_key_suffix: String,

    // =========================================================================
    // Cache Configuration
    // =========================================================================
    /// Derivative cache backend.
    #[arg(long, value_enum, default_value_t = DerivativeCacheKind::None, env = "COURIER_DERIVATIVE_CACHE")]
    pub derivative_cache: DerivativeCacheKind,

    /// Enable the source cache (requires --cache-dir).
    #[arg(long, default_value_t = false, env = "COURIER_SOURCE_CACHE_ENABLED")]
    pub source_cache_enabled: bool,

    /// Root directory of the filesystem derivative and source caches.
    #[arg(long, env = "COURIER_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Byte capacity of the heap derivative cache.
    #[arg(long, default_value_t = DEFAULT_HEAP_CACHE_CAPACITY, env = "COURIER_HEAP_CACHE_CAPACITY")]
    pub heap_cache_capacity: usize,

    /// Keep recently read infos in memory.
    #[arg(long, default_value_t = true, env = "COURIER_INFO_CACHE_ENABLED", action = clap::ArgAction::Set)]
    pub info_cache_enabled: bool,

    #[arg(long, default_value_t = DEFAULT_INFO_CACHE_CAPACITY, env = "COURIER_INFO_CACHE_CAPACITY")]
    pub info_cache_capacity: usize,

    /// Check the source before consulting any cache.
    #[arg(long, default_value_t = false, env = "COURIER_RESOLVE_FIRST")]
    pub resolve_first: bool,

    /// Purge cached content of identifiers whose source is gone.
    #[arg(long, default_value_t = false, env = "CACHE_SERVER_PURGE_MISSING")]
    pub purge_missing: bool,

    // =========================================================================
    // Processing Configuration
    // =========================================================================
    #[arg(long, value_enum, default_value_t = StreamRetrievalStrategy::Stream, env = "COURIER_STREAM_RETRIEVAL_STRATEGY")]
    pub stream_retrieval_strategy: StreamRetrievalStrategy,

    #[arg(long, value_enum, default_value_t = FallbackRetrievalStrategy::Download, env = "COURIER_FALLBACK_RETRIEVAL_STRATEGY")]
    pub fallback_retrieval_strategy: FallbackRetrievalStrategy,

    /// Directory for temporary source downloads.
    #[arg(long, env = "COURIER_TEMP_DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Default JPEG quality (1-100).
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, env = "COURIER_JPEG_QUALITY")]
    pub jpeg_quality: u8,

    /// Fill color for transparent pixels in opaque outputs, e.g. `#ffffff`.
    #[arg(long, env = "COURIER_BACKGROUND_COLOR")]
    pub background_color: Option<String>,

    // =========================================================================
    // HTTP Configuration
    // =========================================================================
    /// HTTP Cache-Control max-age in seconds.
    #[arg(long, default_value_t = DEFAULT_CACHE_MAX_AGE, env = "COURIER_CACHE_MAX_AGE")]
    pub cache_max_age: u32,

    /// Allowed CORS origins (comma-separated). Any origin when unset.
    #[arg(long, env = "COURIER_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Option<Vec<String>>,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Enable verbose logging (debug level).
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,

    /// Disable request tracing.
    #[arg(long, default_value_t = false)]
    pub no_tracing: bool,
}

impl Config {
    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.source == SourceKind::S3
            && self.s3_bucket.as_deref().map_or(true, str::is_empty)
        {
            return Err(
                "The s3 source needs a bucket. Set --s3-bucket or COURIER_S3_BUCKET".to_string(),
            );
        }

        let needs_cache_dir =
            self.derivative_cache == DerivativeCacheKind::Filesystem || self.source_cache_enabled;
        if needs_cache_dir && self.cache_dir.is_none() {
            return Err(
                "The filesystem caches need a directory. Set --cache-dir or COURIER_CACHE_DIR"
                    .to_string(),
            );
        }

        if self.derivative_cache == DerivativeCacheKind::Heap && self.heap_cache_capacity == 0 {
            return Err("heap_cache_capacity must be greater than 0".to_string());
        }
        if self.info_cache_enabled && self.info_cache_capacity == 0 {
            return Err("info_cache_capacity must be greater than 0".to_string());
        }

        let needs_source_cache = self.stream_retrieval_strategy == StreamRetrievalStrategy::Cache
            || self.fallback_retrieval_strategy == FallbackRetrievalStrategy::Cache;
        if needs_source_cache && !self.source_cache_enabled {
            return Err(
                "The cache retrieval strategy needs the source cache. Set --source-cache-enabled"
                    .to_string(),
            );
        }

        if self.jpeg_quality == 0 || self.jpeg_quality > 100 {
            return Err("jpeg_quality must be between 1 and 100".to_string());
        }

        if let Some(color) = &self.background_color {
            if Color::parse(color).is_none() {
                return Err(format!("Invalid background color: {}", color));
            }
        }

        Ok(())
    }

    /// Get the server bind address as "host:port".
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn to_pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            resolve_first: self.resolve_first,
            purge_missing: self.purge_missing,
            binder: BinderSettings {
                stream_retrieval: self.stream_retrieval_strategy,
                fallback_retrieval: self.fallback_retrieval_strategy,
                temp_dir: self.temp_dir.clone(),
            },
            encode_defaults: EncodeDefaults {
                jpeg_quality: self.jpeg_quality,
                background_color: self.background_color.as_deref().and_then(Color::parse),
            },
        }
    }

    pub fn to_source_settings(&self) -> SourceSettings {
        match self.source {
            SourceKind::Filesystem => SourceSettings::Filesystem(FilesystemSourceSettings {
                path_prefix: self.path_prefix.clone(),
                path_suffix: self.path_suffix.clone(),
                lookup_strategy: self.lookup_strategy,
            }),
            SourceKind::S3 => SourceSettings::S3(S3SourceSettings {
                bucket: self.s3_bucket.clone().unwrap_or_default(),
                key_prefix: self.s3_key_prefix.clone(),
                key_suffix: self.s3_key_suffix.clone(),
                endpoint: self.s3_endpoint.clone(),
                region: self.s3_region.clone(),
                lookup_strategy: self.lookup_strategy,
            }),
        }
    }

    /// The caches this configuration enables. Call `validate()` first.
    pub fn build_caches(&self) -> CacheFacade {
        let mut caches = CacheFacade::new();
        let filesystem = self
            .cache_dir
            .as_ref()
            .map(|dir| Arc::new(FilesystemCache::new(dir)));

        match (self.derivative_cache, &filesystem) {
            (DerivativeCacheKind::Heap, _) => {
                caches = caches
                    .with_derivative_cache(Arc::new(HeapCache::with_capacity(self.heap_cache_capacity)));
            }
            (DerivativeCacheKind::Filesystem, Some(fs)) => {
                caches = caches.with_derivative_cache(fs.clone());
            }
            _ => {}
        }
        if self.source_cache_enabled {
            if let Some(fs) = &filesystem {
                caches = caches.with_source_cache(fs.clone());
            }
        }
        if self.info_cache_enabled {
            caches = caches.with_info_service(Arc::new(InfoService::new(self.info_cache_capacity)));
        }
        caches
    }

    /// The request pipeline this configuration describes.
    pub fn build_pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.to_pipeline_settings(),
            Arc::new(self.build_caches()),
            Arc::new(ConfiguredSourceFactory::new(self.to_source_settings())),
            Arc::new(RasterProcessorFactory),
        )
    }

    pub fn to_router_config(&self) -> RouterConfig {
        let mut router_config = RouterConfig::new()
            .with_cache_max_age(self.cache_max_age)
            .with_tracing(!self.no_tracing);
        if let Some(ref origins) = self.cors_origins {
            router_config = router_config.with_cors_origins(origins.clone());
        }
        router_config
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["image-courier"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv).serve
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.bind_address(), "0.0.0.0:8182");
        assert_eq!(config.source, SourceKind::Filesystem);
        assert_eq!(config.derivative_cache, DerivativeCacheKind::None);
        assert!(config.info_cache_enabled);
        assert!(!config.resolve_first);
        assert!(!config.purge_missing);
        assert!(config.validate().is_ok());

        let settings = config.to_pipeline_settings();
        assert_eq!(settings.binder.stream_retrieval, StreamRetrievalStrategy::Stream);
        assert_eq!(settings.binder.fallback_retrieval, FallbackRetrievalStrategy::Download);
        assert_eq!(settings.encode_defaults.jpeg_quality, 80);
    }

    #[test]
    fn test_s3_requires_bucket() {
        let config = parse(&["--source", "s3"]);
        assert!(config.validate().unwrap_err().contains("bucket"));

        let config = parse(&["--source", "s3", "--s3-bucket", "images"]);
        assert!(config.validate().is_ok());
        assert!(matches!(
            config.to_source_settings(),
            SourceSettings::S3(ref s) if s.bucket == "images"
        ));
    }

    #[test]
    fn test_filesystem_caches_require_dir() {
        let config = parse(&["--derivative-cache", "filesystem"]);
        assert!(config.validate().is_err());
        let config = parse(&["--source-cache-enabled"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cache_strategy_requires_source_cache() {
        let config = parse(&["--fallback-retrieval-strategy", "cache"]);
        assert!(config.validate().unwrap_err().contains("source cache"));

        let config = parse(&[
            "--fallback-retrieval-strategy",
            "cache",
            "--source-cache-enabled",
            "--cache-dir",
            "/tmp/courier",
        ]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_values() {
        assert!(parse(&["--jpeg-quality", "0"]).validate().is_err());
        assert!(parse(&["--background-color", "chartreuse?"]).validate().is_err());
        assert!(parse(&["--info-cache-capacity", "0"]).validate().is_err());
    }

    #[test]
    fn test_build_caches() {
        let dir = tempfile::tempdir().unwrap();
        let dir_arg = dir.path().to_str().unwrap();
        let config = parse(&[
            "--derivative-cache",
            "filesystem",
            "--source-cache-enabled",
            "--cache-dir",
            dir_arg,
        ]);
        let caches = config.build_caches();
        assert!(caches.is_derivative_cache_enabled());
        assert!(caches.is_source_cache_enabled());

        let caches = parse(&["--derivative-cache", "heap"]).build_caches();
        assert!(caches.is_derivative_cache_enabled());
        assert!(!caches.is_source_cache_enabled());
    }

    #[test]
    fn test_check_subcommand() {
        let cli = Cli::parse_from(["image-courier", "check", "--identifier", "a.jpg"]);
        match cli.into_command() {
            Command::Check(check) => assert_eq!(check.identifier.as_deref(), Some("a.jpg")),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
