//! # PCM Transcode Gateway - Main Entry Point
//!
//! Real-time audio transcoding over WebSockets: clients stream a RIFF/WAVE
//! header plus raw PCM to `/ws`, an external transcoder (ffmpeg) encodes it,
//! and the encoded stream flows back over the same connection.
//!
//! ## Startup sequence:
//! 1. Load `.env`, initialize tracing
//! 2. Load and validate configuration
//! 3. Build shared state and the HTTP server
//! 4. Serve until SIGINT/SIGTERM, then stop gracefully
//!
//! ## Routes:
//! - `GET /ws`: WebSocket transcoding session
//! - `GET /health`, `GET /api/v1/health`: liveness + transcoder info
//! - `GET /api/v1/metrics`: session counters
//! - `GET /api/v1/config`, `PUT /api/v1/config`: inspect / update configuration

mod audio; // Container header + stream framer (audio/)
mod config; // Configuration management (config.rs)
mod error; // Error handling types (error.rs)
mod handlers; // HTTP request handlers (handlers/)
mod health; // Health check endpoints (health.rs)
mod session; // Per-connection streaming bridge (session/)
mod state; // Application state management (state.rs)
mod transcoder; // External transcoder process (transcoder/)
mod websocket; // WebSocket actor and endpoint (websocket.rs)

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use crate::config::AppConfig;
use crate::state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[actix_web::main]
async fn main() -> Result<()> {
    // Missing .env is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting {} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        transcoder = %config.transcoder.ffmpeg_path,
        codec = config.transcoder.codec.as_str(),
        "Configuration loaded"
    );
    if !std::path::Path::new(&config.transcoder.ffmpeg_path).exists() {
        warn!(
            path = %config.transcoder.ffmpeg_path,
            "Transcoder executable not found; sessions will fail until it is installed"
        );
    }

    let app_state = AppState::new(config.clone());
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        // The gateway accepts connections from any origin
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws", web::get().to(websocket::gateway_websocket))
    })
    .bind(&bind_addr)?
    .disable_signals()
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
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Set up structured logging.
///
/// `RUST_LOG` overrides the default filter, e.g.
/// `RUST_LOG=pcm_transcode_gateway=info,transcoder=debug`. The transcoder's own
/// diagnostic output is logged under the `transcoder` target.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pcm_transcode_gateway=debug,transcoder=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = sigint.recv() => info!("Received SIGINT"),
                }
                return;
            }
            _ => warn!("Failed to install Unix signal handlers, falling back to Ctrl-C"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received Ctrl-C");
}
