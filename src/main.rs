//! Image Courier - an image delivery server.
//!
//! This binary parses the configuration, wires the pipeline and serves HTTP.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use image_courier::{
    config::{CheckConfig, Cli, Command, Config},
    create_router, HealthChecker, Identifier, InformationRequestHandler, Pipeline,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.into_command() {
        Command::Serve(config) => run_serve(config).await,
        Command::Check(config) => run_check(config).await,
    }
}

// =============================================================================
// Serve Command
// =============================================================================

async fn run_serve(config: Config) -> ExitCode {
    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    log_configuration(&config);

    let pipeline = Arc::new(config.build_pipeline());
    let router = create_router(pipeline.clone(), config.to_router_config());

    let addr = config.bind_address();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };
    info!("Server listening on: http://{}", addr);

    let result = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutting down");
    pipeline.sources().shutdown().await;

    if let Err(e) = result {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn log_configuration(config: &Config) {
    info!("Image Courier v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration:");
    info!("  Source: {:?} ({:?} lookup)", config.source, config.lookup_strategy);
    if let Some(ref bucket) = config.s3_bucket {
        info!("  S3 bucket: {}", bucket);
    }
    if let Some(ref endpoint) = config.s3_endpoint {
        info!("  S3 endpoint: {}", endpoint);
    }
    info!("  Derivative cache: {:?}", config.derivative_cache);
    info!("  Source cache: {}", config.source_cache_enabled);
    info!(
        "  Retrieval: {:?} (stream), {:?} (fallback)",
        config.stream_retrieval_strategy, config.fallback_retrieval_strategy
    );
    if config.resolve_first {
        info!("  Resolve first: enabled");
    }
    if config.purge_missing {
        warn!("  Purge missing: enabled, cached content of missing sources will be deleted");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "image_courier=debug,tower_http=debug"
    } else {
        "image_courier=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// =============================================================================
// Check Command
// =============================================================================

async fn run_check(check: CheckConfig) -> ExitCode {
    if check.config.verbose {
        init_logging(true);
    }

    println!("Image Courier Configuration Check");
    println!("═════════════════════════════════");
    println!();

    if let Err(e) = check.config.validate() {
        println!("✗ Configuration: {}", e);
        return ExitCode::FAILURE;
    }
    println!("✓ Configuration");

    let pipeline = Arc::new(check.config.build_pipeline());
    let mut code = ExitCode::SUCCESS;

    if let Some(ref identifier) = check.identifier {
        print!("Reading info of '{}'... ", identifier);
        match read_info(pipeline.clone(), identifier).await {
            Ok(summary) => println!("✓ {}", summary),
            Err(e) => {
                println!("✗ {}", e);
                code = ExitCode::FAILURE;
            }
        }
    }

    let health = HealthChecker::new(pipeline.clone()).check().await;
    match serde_json::to_string_pretty(&health) {
        Ok(json) => println!("Health: {}", json),
        Err(_) => println!("Health: {:?}", health.color),
    }
    if health.is_red() {
        code = ExitCode::FAILURE;
    }

    pipeline.sources().shutdown().await;
    code
}

async fn read_info(pipeline: Arc<Pipeline>, identifier: &str) -> Result<String, String> {
    let mut handler = InformationRequestHandler::builder(pipeline)
        .identifier(Identifier::from(identifier))
        .build()
        .map_err(|e| e.to_string())?;
    let result = handler.handle().await;
    handler.close();

    match result.map_err(|e| e.to_string())? {
        Some(info) => {
            let size = info.size(0).map_err(|e| e.to_string())?;
            Ok(format!(
                "{}x{} {}",
                size.width,
                size.height,
                info.source_format
                    .map(|f| f.preferred_media_type())
                    .unwrap_or("unknown")
            ))
        }
        None => Err("access denied".to_string()),
    }
}
