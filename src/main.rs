//! # Voice Bridge - Main Application Entry Point
//!
//! Relays live phone calls between a telephony provider's media-stream
//! WebSocket and an upstream real-time speech endpoint.
//!
//! ## Application Architecture:
//! - **codec**: G.711 / linear PCM frame conversion
//! - **bridge**: per-call sessions, both leg adapters and the session registry
//! - **websocket**: the telephony media socket actor and its upgrade handler
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared application state and HTTP metrics
//! - **health**: health and metrics endpoints
//! - **middleware**: request logging and per-endpoint metrics
//! - **handlers**: config, session and voice-webhook endpoints
//! - **error**: bridge and HTTP error types

mod bridge;
mod codec;
mod config;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// ## Startup sequence:
/// 1. Load `.env`, set up tracing
/// 2. Load and validate configuration
/// 3. Build shared state (registry, codecs, notifier)
/// 4. Serve until SIGINT/SIGTERM, then hang up every live call and stop
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting voice-bridge v{}", env!("CARGO_PKG_VERSION"));
    info!(
        media_path = %config.bridge.media_path,
        max_sessions = config.bridge.max_concurrent_sessions,
        upstream = %config.upstream.url,
        "Configuration loaded: {}:{}",
        config.server.host,
        config.server.port
    );
    if config.upstream.api_key.is_empty() {
        warn!("No upstream API key configured; the upstream will be dialed without credentials");
    }

    let app_state = AppState::new(config.clone());
    let sessions = app_state.sessions.clone();
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let media_path = config.bridge.media_path.clone();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::get().to(handlers::get_session))
                    .route("/sessions/{id}", web::delete().to(handlers::shutdown_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/incoming-call", web::post().to(handlers::incoming_call))
            .route(&media_path, web::get().to(websocket::media_stream))
    })
    .disable_signals()
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            let count = sessions.shutdown_all();
            info!(sessions = count, "Shutdown signal received, hanging up calls and stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Structured logging to stdout.
///
/// `RUST_LOG` controls the filter; without it the default is
/// `voice_bridge=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_bridge=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
///
/// If a handler cannot be installed that signal is ignored rather than
/// ending the process.
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let sigterm = signal(SignalKind::terminate());
    let sigint = signal(SignalKind::interrupt());

    let (mut sigterm, mut sigint) = match (sigterm, sigint) {
        (Ok(term), Ok(int)) => (term, int),
        (term, int) => {
            error!(
                sigterm_ok = term.is_ok(),
                sigint_ok = int.is_ok(),
                "Failed to install signal handlers, falling back to Ctrl+C"
            );
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}
