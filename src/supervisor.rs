//! # Fleet Supervisor
//!
//! Owns the set of device connections: starts one per enabled device, stops
//! them all on shutdown, and answers status queries without touching the
//! network.
//!
//! ## Failure Isolation:
//! One device failing to start (or flapping forever) never affects any other
//! device - partial fleet availability beats all-or-nothing. The supervisor
//! itself never dials anything; all transport work happens inside the
//! individual connections.
//!
//! ## Concurrency:
//! `start` / `stop` / `reconnect` are serialized through an async mutex so
//! two callers can never interleave lifecycle changes; `status` and `counts`
//! only read atomic flags and return immediately.

use crate::audio::CodecFactory;
use crate::connection::DeviceConnection;
use crate::devices::DeviceRegistry;
use crate::error::{AppError, AppResult};
use crate::session::SessionHandlerFactory;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Point-in-time connection status for one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    pub connected: bool,
    pub host: String,
    pub port: u16,
    pub voice: String,
    pub auto_reconnect: bool,
    pub enabled: bool,
}

/// Fleet-wide summary counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FleetCounts {
    /// All configured devices, including disabled ones
    pub total: usize,
    /// Devices under management (the enabled set at start time)
    pub enabled: usize,
    /// Managed devices currently connected
    pub connected: usize,
}

/// Manages connections to multiple remote devices.
pub struct FleetSupervisor {
    registry: DeviceRegistry,
    handler_factory: Arc<dyn SessionHandlerFactory>,
    codec: Arc<dyn CodecFactory>,

    connections: RwLock<HashMap<String, Arc<DeviceConnection>>>,
    running: AtomicBool,
    /// Serializes start/stop/reconnect; status queries never take it
    lifecycle: Mutex<()>,
}

impl FleetSupervisor {
    pub fn new(
        registry: DeviceRegistry,
        handler_factory: Arc<dyn SessionHandlerFactory>,
        codec: Arc<dyn CodecFactory>,
    ) -> Self {
        Self {
            registry,
            handler_factory,
            codec,
            connections: RwLock::new(HashMap::new()),
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    /// The registry this supervisor was configured with.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start connecting to all enabled devices.
    ///
    /// Starting is per-device: a device that can't be reached fails inside
    /// its own connection loop and never aborts the rest of the fleet.
    /// Calling start on a running supervisor is a logged no-op.
    pub async fn start(&self) {
        let _guard = self.lifecycle.lock().await;

        if self.running.load(Ordering::SeqCst) {
            warn!("Fleet supervisor already running");
            return;
        }
        self.running.store(true, Ordering::SeqCst);

        let enabled: Vec<_> = self
            .registry
            .enabled_devices()
            .into_iter()
            .cloned()
            .collect();

        if enabled.is_empty() {
            warn!("No enabled devices found in configuration");
            return;
        }

        info!("Starting connections to {} devices", enabled.len());

        for device in enabled {
            let name = device.name.clone();
            let connection = Arc::new(DeviceConnection::new(
                device,
                Arc::clone(&self.handler_factory),
                Arc::clone(&self.codec),
            ));
            Arc::clone(&connection).start();
            self.connections
                .write()
                .unwrap()
                .insert(name.clone(), connection);
            info!("Started connection manager for {}", name);
        }

        info!("All device connection managers started");
    }

    /// Stop all device connections and clear the registry of managed
    /// connections. Each stop is awaited independently: one connection
    /// misbehaving cannot keep the others alive.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;

        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        self.running.store(false, Ordering::SeqCst);

        info!("Stopping all device connections");

        let connections: Vec<Arc<DeviceConnection>> =
            self.connections.read().unwrap().values().cloned().collect();

        futures_util::future::join_all(connections.iter().map(|conn| conn.stop())).await;

        self.connections.write().unwrap().clear();
        info!("All device connections stopped");
    }

    /// Manually trigger reconnection for a specific device.
    ///
    /// A connection never dials again once stopped, so the entry is replaced
    /// with a freshly-built connection for the same device rather than
    /// restarted in place.
    pub async fn reconnect(&self, name: &str) -> AppResult<()> {
        let _guard = self.lifecycle.lock().await;

        let existing = self.connections.read().unwrap().get(name).cloned();
        let existing = existing
            .ok_or_else(|| AppError::NotFound(format!("Device '{}' not found", name)))?;

        info!("Manual reconnect requested for {}", name);
        existing.stop().await;

        let replacement = Arc::new(DeviceConnection::new(
            existing.device().clone(),
            Arc::clone(&self.handler_factory),
            Arc::clone(&self.codec),
        ));
        Arc::clone(&replacement).start();
        self.connections
            .write()
            .unwrap()
            .insert(name.to_string(), replacement);

        Ok(())
    }

    /// Get detailed status of all managed connections. Non-blocking: reads
    /// only in-memory flags, never waits on the network.
    pub fn status(&self) -> HashMap<String, DeviceStatus> {
        let connections = self.connections.read().unwrap();

        connections
            .iter()
            .map(|(name, conn)| {
                let device = conn.device();
                (
                    name.clone(),
                    DeviceStatus {
                        connected: conn.is_connected(),
                        host: device.host.clone(),
                        port: device.port,
                        voice: device.voice.clone(),
                        auto_reconnect: device.auto_reconnect,
                        enabled: device.enabled,
                    },
                )
            })
            .collect()
    }

    /// Get count statistics for the fleet.
    pub fn counts(&self) -> FleetCounts {
        let connections = self.connections.read().unwrap();

        FleetCounts {
            total: self.registry.devices.len(),
            enabled: connections.len(),
            connected: connections
                .values()
                .filter(|conn| conn.is_connected())
                .count(),
        }
    }
}
