//! ASR server entry point

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use asr_config::{load_settings, Settings};
use asr_pipeline::{Recognizer, RecognizerConfig};
use asr_server::{create_router, init_metrics, AppState, ServerError};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), ServerError> {
    // Load configuration first (tracing init needs observability settings)
    let config = load_settings()?;
    init_tracing(&config);

    tracing::info!("ASR server v{}", env!("CARGO_PKG_VERSION"));

    let _metrics_handle = init_metrics();
    tracing::info!("Initialized Prometheus metrics at /metrics");

    tracing::info!(model_dir = %config.models.asr_dir, "Loading recognizer models...");
    let recognizer_config = RecognizerConfig {
        model_dir: config.models.asr_dir.clone(),
        num_threads: config.asr.num_threads,
        pool_size: config.asr.recognizer_pool_size,
        sample_rate: config.asr.sample_rate,
        feature_dim: config.asr.feature_dim,
    };
    let recognizer = Arc::new(Recognizer::new(&recognizer_config)?);
    tracing::info!(
        pool_size = recognizer.pool_size(),
        threads = config.asr.num_threads,
        "Recognizer pool ready"
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::new(config, recognizer);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ServerError::Startup(format!("Failed to bind {}: {}", addr, e)))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ServerError::Startup(format!("Server error: {}", e)))?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

fn init_tracing(config: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.observability.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.observability.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
