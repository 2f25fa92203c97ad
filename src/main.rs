//! Pdfer Conversion Service
//!
//! Accepts document uploads over HTTP and converts them to PDF one at a time
//! through a supervised unoconv/LibreOffice listener.
//!
//! ## Architecture
//!
//! - **Queue**: in-memory FIFO, one conversion in flight at a time
//! - **Engine**: `unoconv --listener` on a private port, relaunched on crash
//! - **HTTP**: `POST /convert`, `GET /status`, `GET /reset`
//! - **Telemetry**: OpenTelemetry OTLP export
//!
//! ## Configuration
//!
//! Environment variables (see `config.rs` for the full list):
//! - `PDFER_PORT`: HTTP port (default: 8084)
//! - `PDFER_ENGINE_PORT`: engine listener port (default: 8085)
//! - `PDFER_API_KEY`: API key for `/convert` and `/reset` (default: none)
//! - `PDFER_LOG_FORMAT`: `json` for JSON logs (default: text)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP collector endpoint
//! - `RUST_LOG`: Log level (default: info)

use anyhow::{Context, Result};
use pdfer::config::{Config, LogFormat};
use pdfer::converter::UnoconvConverter;
use pdfer::engine::{EngineSupervisor, SweepTarget, SystemProcessTable, UnoconvListener};
use pdfer::queue::ConversionQueue;
use pdfer::retry::RetryPolicy;
use pdfer::server::{self, AppContext};
use pdfer::telemetry;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    // Initialize OpenTelemetry
    if let Err(e) = telemetry::init_telemetry() {
        warn!("Failed to initialize telemetry: {}", e);
    }

    info!("Starting PDF conversion service");
    info!(
        "Configuration: server_port={}, engine_port={}, max_retries={}, auth={}",
        config.server_port,
        config.engine_port,
        config.max_retries,
        config.api_key.is_some()
    );

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("Failed to create upload dir {}", config.upload_dir.display()))?;

    let converter = UnoconvConverter::new(config.unoconv_command.clone(), config.engine_port)
        .with_timeout(config.conversion_timeout);
    let queue = ConversionQueue::with_drain_delay(
        Arc::new(converter),
        RetryPolicy::new(config.max_retries),
        config.drain_delay,
    );

    let supervisor = EngineSupervisor::new(
        Arc::new(
            UnoconvListener::new(config.unoconv_command.clone(), config.engine_port)
                .with_ready_timeout(config.engine_ready_timeout),
        ),
        Arc::new(SystemProcessTable::new()),
        queue.clone(),
        SweepTarget::new(&config.engine_process_pattern, config.engine_port),
        config.relaunch_delay,
    );
    let shutdown = CancellationToken::new();
    let engine = tokio::spawn(supervisor.run(shutdown.clone()));

    let ctx = AppContext {
        queue,
        config: Arc::new(config),
    };
    let served = server::serve(ctx, async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    })
    .await;

    info!("Stopping conversion engine...");
    shutdown.cancel();
    if let Err(e) = engine.await {
        warn!("Engine supervisor ended abnormally: {}", e);
    }

    telemetry::shutdown_telemetry();
    info!("PDF conversion service shutdown complete");
    served
}
