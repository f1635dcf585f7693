//! Session Coordinator
//!
//! Signaling-plane coordinator for live classroom sessions.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:8443, path `/ws`)
//! - HTTP server for health and metrics endpoints (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing and the Prometheus metrics recorder
//! 3. Connect the projection store (Redis, or in-memory when unset)
//! 4. Create the media engine client
//! 5. Build the room registry and its supervisor
//! 6. Start health and signaling servers, then mark ready
//! 7. Wait for shutdown signal and drain rooms

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use session_coordinator::config::{Config, LogFormat};
use session_coordinator::media_engine::{HttpMediaEngine, MediaEngine};
use session_coordinator::negotiator::SessionNegotiator;
use session_coordinator::observability::{health_router, init_metrics_recorder, HealthState};
use session_coordinator::permissions::PermissionController;
use session_coordinator::persistence::{
    InMemoryProjectionStore, ProjectionStore, RedisProjectionStore,
};
use session_coordinator::presence::PresenceGateway;
use session_coordinator::registry::RoomRegistry;
use session_coordinator::signaling::{signaling_router, SignalingState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long rooms get to drain on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "session_coordinator=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Configuration first: the log format is part of it
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;
    init_tracing(config.log_format);

    info!("Starting Session Coordinator");
    info!(
        coordinator_id = %config.coordinator_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        media_engine_url = %config.media_engine_url,
        max_rooms = config.max_rooms,
        max_participants_per_room = config.max_participants_per_room,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());

    let store: Arc<dyn ProjectionStore> = match &config.redis_url {
        Some(redis_url) => {
            info!("Connecting to Redis...");
            let store = RedisProjectionStore::connect(redis_url).await.map_err(|e| {
                error!(error = %e, "Failed to connect to Redis");
                e
            })?;
            info!("Redis connection established");
            Arc::new(store)
        }
        None => {
            warn!("REDIS_URL not set, using in-memory class records and projections");
            Arc::new(InMemoryProjectionStore::new())
        }
    };

    let engine: Arc<dyn MediaEngine> = Arc::new(
        HttpMediaEngine::new(&config.media_engine_url, config.media_engine_timeout()).map_err(
            |e| {
                error!(error = %e, "Failed to create media engine client");
                e
            },
        )?,
    );

    let shutdown_token = CancellationToken::new();
    let presence = Arc::new(PresenceGateway::new());
    let registry = Arc::new(RoomRegistry::new(
        Arc::clone(&engine),
        store,
        Arc::clone(&presence),
        config.registry_settings(),
        shutdown_token.child_token(),
    ));
    let supervisor = tokio::spawn(Arc::clone(&registry).run_supervisor());
    info!("Room registry initialized");

    // Health server (liveness, readiness, /metrics)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listeners before spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;
    let signaling_state = Arc::new(SignalingState {
        negotiator: SessionNegotiator::new(Arc::clone(&registry), Arc::clone(&engine)),
        permissions: PermissionController::new(Arc::clone(&registry), Arc::clone(&engine)),
        registry: Arc::clone(&registry),
        presence,
        cancel_token: shutdown_token.child_token(),
    });
    let signaling_app = signaling_router(signaling_state).layer(TraceLayer::new_for_http());
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("Session Coordinator running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so load balancers stop routing joins
    health_state.set_not_ready();

    registry.shutdown(SHUTDOWN_DEADLINE).await;
    shutdown_token.cancel();
    if let Err(e) = supervisor.await {
        warn!(error = ?e, "Supervisor task ended abnormally");
    }

    info!("Session Coordinator shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. Without them the service
/// cannot shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
