//! Call Signaling Service
//!
//! Signaling server and room coordinator for peer-to-peer video calls.
//!
//! # Servers
//!
//! - WebSocket server for client channels (default: 0.0.0.0:8080)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Build the identity verifier from the auth public key
//! 4. Build the ICE configuration provider
//! 5. Initialize actor system (`RoomRegistryHandle`)
//! 6. Start health HTTP server (liveness, readiness, metrics)
//! 7. Start WebSocket server
//! 8. Mark ready and wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use call_signaling::actors::{ActorMetrics, RoomRegistryHandle};
use call_signaling::config::Config;
use call_signaling::coordinator::CallCoordinator;
use call_signaling::gateway::{signaling_router, GatewayState, JwtIdentityVerifier};
use call_signaling::ice::provider_from_config;
use call_signaling::observability::{init_metrics_recorder, operational_router, HealthState};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Deadline for draining rooms on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "call_signaling=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Call Signaling Service");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        default_max_participants = config.default_max_participants,
        disconnect_grace_period_seconds = config.disconnect_grace_period_seconds,
        empty_room_idle_seconds = config.empty_room_idle_seconds,
        ice_provider = if config.ice_provider_url.is_some() { "http" } else { "static" },
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());

    let verifier = JwtIdentityVerifier::new(&config.auth_public_key, config.jwt_clock_skew())
        .map_err(|e| {
            error!(error = %e, "Invalid auth public key");
            e
        })?;

    let ice_provider = provider_from_config(&config).map_err(|e| {
        error!(error = %e, "Failed to build ICE configuration provider");
        e
    })?;

    // Initialize actor system
    info!("Initializing actor system...");
    let actor_metrics = ActorMetrics::new();
    let registry = RoomRegistryHandle::new(
        config.instance_id.clone(),
        config.room_settings(),
        Arc::clone(&actor_metrics),
    );
    let coordinator = CallCoordinator::new(registry.clone(), ice_provider, actor_metrics);
    info!("Actor system initialized");

    // Servers stop after the registry has drained
    let shutdown_token = tokio_util::sync::CancellationToken::new();

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let health_app = operational_router(Arc::clone(&health_state), prometheus_handle);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    let health_task = tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start WebSocket server
    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let gateway_state = Arc::new(GatewayState {
        coordinator: coordinator.clone(),
        verifier: Arc::new(verifier),
        heartbeat_interval: config.heartbeat_interval(),
        idle_timeout: config.idle_timeout(),
    });
    let signaling_app = signaling_router(gateway_state);

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;
    info!(addr = %signaling_addr, "Signaling server bound successfully");

    let signaling_shutdown_token = shutdown_token.child_token();
    let signaling_task = tokio::spawn(async move {
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
    info!("Call Signaling Service running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();

    // Stop accepting joins and cancel rooms; open channels close through
    // the registry's token
    if let Err(e) = coordinator.shutdown(SHUTDOWN_DEADLINE).await {
        warn!(error = %e, "Actor system shutdown error");
    }
    registry.cancel();

    shutdown_token.cancel();

    for (name, task) in [("signaling", signaling_task), ("health", health_task)] {
        if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
            warn!(server = name, "Server did not stop in time");
        }
    }

    info!("Call Signaling Service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
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
