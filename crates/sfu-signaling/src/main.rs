//! SFU Signaling Server
//!
//! Stateful TCP signaling server for multi-party conferencing over an SFU.
//!
//! # Architecture
//!
//! Uses an actor model hierarchy:
//! - `RoomRegistryActor` (singleton): Supervises rooms
//! - `RoomActor` (per room): Owns room membership and the producer index
//! - One connection task per peer: Drives the signaling protocol
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Create the media engine adapter (in-process engine)
//! 3. Initialize the global router with the server codec set
//! 4. Initialize actor system (`RoomRegistryActorHandle`)
//! 5. Bind and start the signaling gateway
//! 6. Wait for shutdown signal

#![warn(clippy::pedantic)]

use std::sync::Arc;
use std::time::Duration;

use media_engine::{LocalMediaEngine, MediaEngineAdapter};
use sfu_signaling::actors::{RoomRegistryActor, SignalMetrics};
use sfu_signaling::config::{default_media_codecs, Config};
use sfu_signaling::gateway::{GatewayContext, SignalingGateway};
use sfu_signaling::router::RouterRegistry;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long graceful shutdown waits for the registry to drain rooms.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between periodic status log lines.
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_signaling=debug,media_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU Signaling Server");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        server_id = %config.server_id,
        bind_address = %config.bind_address,
        device_ready_timeout_seconds = config.device_ready_timeout_seconds,
        transport_connect_timeout_seconds = config.transport_connect_timeout_seconds,
        max_peers_per_room = config.max_peers_per_room,
        "Configuration loaded successfully"
    );

    // Create the media engine adapter. The in-process engine fabricates
    // ICE/DTLS parameters; signaling semantics do not depend on it.
    let adapter: Arc<dyn MediaEngineAdapter> = Arc::new(LocalMediaEngine::new());

    // Initialize the global router before accepting any connection, so
    // capability negotiation never races startup.
    info!("Initializing global router...");
    let routers = Arc::new(RouterRegistry::new(Arc::clone(&adapter)));
    routers
        .initialize(default_media_codecs())
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to initialize global router");
            e
        })?;
    info!("Global router initialized");

    // Initialize actor system
    info!("Initializing actor system...");
    let metrics = SignalMetrics::new();
    let (registry, registry_task) = RoomRegistryActor::spawn(
        Arc::clone(&adapter),
        Arc::clone(&routers),
        Arc::clone(&metrics),
        config.max_peers_per_room,
    );
    info!("Actor system initialized");

    // Create shutdown token as child of the registry's token
    // This ensures all tasks are cancelled when the registry shuts down
    let shutdown_token = registry.child_token();

    // Bind listener BEFORE spawning to fail fast on bind errors
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %config.bind_address, "Failed to bind signaling listener");
            format!("Failed to bind signaling listener to {}: {e}", config.bind_address)
        })?;
    info!(addr = %config.bind_address, "Signaling listener bound successfully");

    let ctx = GatewayContext {
        config: Arc::new(config),
        adapter,
        routers,
        registry: registry.clone(),
        metrics: Arc::clone(&metrics),
    };

    // Spawn the gateway task
    let gateway_token = shutdown_token.child_token();
    tokio::spawn(async move {
        SignalingGateway::new(ctx).run(listener, gateway_token).await;
    });
    info!("Signaling gateway started");

    // Spawn periodic status logging
    let status_token = shutdown_token.child_token();
    let status_metrics = Arc::clone(&metrics);
    tokio::spawn(async move {
        run_status_task(status_metrics, status_token).await;
    });

    // Wait for shutdown signal
    info!("SFU Signaling Server running - press Ctrl+C to shutdown");
    shutdown_signal().await;

    // Trigger graceful shutdown via cancellation token
    // This propagates to all child tokens (gateway, connections, rooms)
    info!("Shutdown signal received, initiating graceful shutdown...");
    registry.cancel();

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, registry_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Registry task ended abnormally"),
        Err(_) => warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Registry shutdown timed out"
        ),
    }

    info!("SFU Signaling Server shutdown complete");
    Ok(())
}

/// Periodic status line with the live counters.
async fn run_status_task(metrics: Arc<SignalMetrics>, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // Skip the immediate first tick so startup logs stay clean.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = metrics.snapshot();
                info!(
                    rooms = snapshot.rooms,
                    peers = snapshot.peers,
                    producers = snapshot.producers,
                    consumers = snapshot.consumers,
                    messages_processed = snapshot.messages_processed,
                    "Status"
                );
            }
        }
    }
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
