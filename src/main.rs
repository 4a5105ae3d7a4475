//! # STT Gateway - Main Application Entry Point
//!
//! HTTP and WebSocket front end for a pool of Whisper speech-to-text engines.
//!
//! ## Routes:
//! - `POST /webhook/audio`: transcribe one uploaded file (multipart field `file`)
//! - `GET /ws/transcribe`: streaming session, one reply per binary audio frame
//! - `GET /health`, `GET /version`, `GET /metrics`
//!
//! ## Application Architecture:
//! - **config**: layered settings (defaults, `config.toml`, environment)
//! - **audio**: ffmpeg-backed transcoding to 16 kHz mono PCM
//! - **transcription**: Whisper engines and the arbiter that hands them out
//! - **pipeline**: validate → transcode → acquire → infer, shared by both transports
//! - **session** / **websocket**: the streaming protocol and its actor
//! - **handlers**, **health**: HTTP endpoints
//! - **middleware**: request logging and per-address rate limiting
//! - **metrics**: Prometheus registry
//! - **error**: domain errors and their HTTP mapping
//!
//! ## Startup Order:
//! The converter is probed and every engine instance is loaded before the socket
//! is bound, so the service never accepts traffic it cannot serve.

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod metrics;
mod middleware;
mod models;
mod pipeline;
mod session;
mod state;
#[cfg(test)]
mod testing;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{http::header, web, App, HttpServer};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::audio::FfmpegTranscoder;
use crate::config::AppConfig;
use crate::metrics::MetricsRegistry;
use crate::middleware::{FixedWindowLimiter, RateLimit, RequestLogging};
use crate::pipeline::{ChunkPipeline, PipelineSettings};
use crate::state::AppState;
use crate::transcription::{load_engine_pool, EngineArbiter};

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load().context("failed to load configuration")?;
    config.validate()?;

    info!(
        "Starting {} v{} ({})",
        config.server.name, config.server.version, config.server.env
    );

    // The converter is a hard dependency: refuse to start without it.
    let transcoder = FfmpegTranscoder::new(
        config.transcoder.ffmpeg_path.clone(),
        config.transcoder_timeout(),
    );
    if let Err(err) = transcoder.ensure_available().await {
        error!("Audio converter unavailable: {}", err);
        return Err(anyhow::anyhow!("audio converter unavailable: {}", err));
    }

    let engines = load_engine_pool(&config).await?;
    let arbiter = Arc::new(EngineArbiter::new(engines));
    info!("Engine pool ready with {} instance(s)", arbiter.pool_size());

    let metrics = Arc::new(MetricsRegistry::new().context("failed to build metrics registry")?);
    metrics.set_slots_available(arbiter.available());

    let pipeline = Arc::new(ChunkPipeline::new(
        Arc::new(transcoder),
        arbiter.clone(),
        metrics.clone(),
        PipelineSettings {
            max_upload_bytes: config.max_upload_bytes(),
            slot_wait: Some(config.slot_wait()),
            defaults: config.default_session_config(),
        },
    ));

    let limiter = RateLimit::new(Arc::new(FixedWindowLimiter::per_minute(
        config.limits.requests_per_minute,
    )));
    if config.limits.requests_per_minute == 0 {
        warn!("Rate limiting disabled");
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let app_state = AppState::new(config, pipeline, metrics);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let config = &app_state.config;
        let mut cors = Cors::default()
            .allowed_methods(vec!["GET", "POST", "OPTIONS"])
            .allow_any_header()
            .expose_headers(vec![header::RETRY_AFTER])
            .max_age(3600);
        for origin in config.cors_origins() {
            cors = cors.allowed_origin(&origin);
        }
        if config.cors.allow_credentials {
            cors = cors.supports_credentials();
        }

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(RequestLogging)
            .service(
                web::resource("/webhook/audio")
                    .wrap(limiter.clone())
                    .route(web::post().to(handlers::transcribe_upload)),
            )
            .service(
                web::resource("/ws/transcribe")
                    .wrap(limiter.clone())
                    .route(web::get().to(websocket::transcribe_socket)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/version", web::get().to(health::version))
            .route("/metrics", web::get().to(health::metrics))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
            }
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received, stopping server...");
            arbiter.close();
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls verbosity; defaults to `stt_gateway=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stt_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
