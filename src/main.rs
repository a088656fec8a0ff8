//! # Device Fleet Backend - Main Application Entry Point
//!
//! This service dials out to a fleet of remote voice devices and keeps every
//! enabled device connected: one persistent WebSocket session per device,
//! carrying JSON control events and compressed audio in both directions.
//!
//! ## Application Architecture:
//! - **config**: Application settings (TOML file + environment variables)
//! - **devices**: Device registry - which devices to dial and how
//! - **connection**: Per-device reconnect state machine + duplex session
//! - **supervisor**: Fleet-level lifecycle and status aggregation
//! - **session / audio**: Capability boundaries for the conversational
//!   engine and the audio codec
//! - **state / health / handlers / middleware**: The HTTP control plane
//!   (status, counts, manual reconnect)
//!
//! The supervisor is constructed here and handed to the HTTP layer through
//! `AppState` - there is deliberately no global supervisor instance.

mod audio;
mod config;
mod connection;
mod devices;
mod error;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod session;
mod state;
mod supervisor;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use devices::DeviceRegistry;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use supervisor::FleetSupervisor;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Global shutdown signal set by the signal handlers.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting device-fleet-backend v{}", env!("CARGO_PKG_VERSION"));

    // Load the device registry. When an explicit source is configured and
    // broken we fail hard, but leave an example config behind so the
    // operator has something to edit.
    let registry = match load_registry(&config) {
        Ok(registry) => registry,
        Err(e) => {
            error!("Failed to load device registry: {}", e);
            info!("Creating example configuration file...");
            match devices::create_example_config("devices.example.json") {
                Ok(()) => {
                    info!("Edit devices.example.json, rename it to devices.json and restart")
                }
                Err(write_err) => warn!("Could not write example config: {}", write_err),
            }
            return Err(e.into());
        }
    };

    info!("Loaded configuration with {} devices", registry.devices.len());
    for device in &registry.devices {
        let status = if device.enabled { "enabled" } else { "disabled" };
        info!(
            "Device '{}': {}:{} ({})",
            device.name, device.host, device.port, status
        );
    }

    // Build and start the fleet supervisor. The placeholder handler/codec
    // pair keeps sessions fully operational until the real conversational
    // engine and compression stack are plugged in behind their traits.
    let supervisor = Arc::new(FleetSupervisor::new(
        registry,
        Arc::new(session::PlaceholderSessionFactory),
        Arc::new(audio::PassthroughCodec),
    ));
    supervisor.start().await;

    let app_state = AppState::new(config.clone(), Arc::clone(&supervisor));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

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
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/devices", web::get().to(handlers::list_devices))
                    .route("/devices/status", web::get().to(handlers::get_device_status))
                    .route(
                        "/devices/{name}/reconnect",
                        web::post().to(handlers::reconnect_device),
                    )
                    .route("/config/example", web::get().to(handlers::get_example_config)),
            )
            // Convenience health check at the root for probes
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    // Race the server against the shutdown signal
    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    // The HTTP surface is gone; now take down the fleet.
    info!("Stopping device connections...");
    supervisor.stop().await;

    info!("Server stopped gracefully");
    Ok(())
}

/// Load the device registry from the configured source.
///
/// An explicit path in the config file takes precedence over the
/// environment-based lookup (REMOTE_DEVICES_CONFIG, then default paths,
/// then the built-in disabled default set).
fn load_registry(config: &AppConfig) -> crate::error::AppResult<DeviceRegistry> {
    match &config.fleet.devices_config {
        Some(path) => DeviceRegistry::load_from_file(path),
        None => DeviceRegistry::load_from_env(),
    }
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` controls verbosity; the default keeps our own modules at debug
/// and actix at info.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "device_fleet_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Listen for SIGTERM/SIGINT and flip the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Resolve once the shutdown flag has been set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
