//! # Device Registry
//!
//! Configuration for the remote devices the backend dials automatically.
//! The registry is a JSON document (`devices.json`) holding an ordered list
//! of device records; only records with `enabled: true` ever get a
//! connection.
//!
//! ## Loading order:
//! 1. An explicit path (config file setting or REMOTE_DEVICES_CONFIG env var)
//!    - missing or malformed files are hard errors, we never silently run
//!    with an empty fleet when the operator pointed us at a registry
//! 2. Well-known default paths (./devices.json, /app/devices.json,
//!    /config/devices.json)
//! 3. A built-in default registry whose single example device is disabled,
//!    so a fresh install starts cleanly without dialing anything

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use tracing::info;

/// Configuration for a single remote device. Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteDevice {
    /// Unique name for the device (key in all maps and API routes)
    pub name: String,

    /// IP address or hostname of the device
    pub host: String,

    /// WebSocket port on the device
    #[serde(default = "default_port")]
    pub port: u16,

    /// Voice to use for this device
    #[serde(default = "default_voice")]
    pub voice: String,

    /// Instructions/system prompt payload, passed through to the session
    /// handler without interpretation
    #[serde(default = "default_instructions")]
    pub instructions: serde_json::Value,

    /// Whether to auto-reconnect on disconnect
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Delay in seconds before reconnecting
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: f64,

    /// Whether this device is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_port() -> u16 {
    8765
}

fn default_voice() -> String {
    "Watercooler".to_string()
}

fn default_instructions() -> serde_json::Value {
    serde_json::json!({"type": "smalltalk"})
}

fn default_true() -> bool {
    true
}

fn default_reconnect_delay() -> f64 {
    5.0
}

/// Ordered collection of device records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRegistry {
    pub devices: Vec<RemoteDevice>,
}

impl DeviceRegistry {
    /// Load the registry from a JSON file.
    ///
    /// Fails closed: a missing file, malformed JSON, duplicate device name or
    /// negative reconnect delay is an error, never a silent empty registry.
    pub fn load_from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();

        let data = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Config file not found: {}: {}", path.display(), e))
        })?;

        let registry: DeviceRegistry = serde_json::from_str(&data)
            .map_err(|e| AppError::Config(format!("Invalid registry {}: {}", path.display(), e)))?;

        registry.validate()?;
        Ok(registry)
    }

    /// Load the registry from the environment.
    ///
    /// `REMOTE_DEVICES_CONFIG` names an explicit source and fails closed when
    /// missing; otherwise the default paths are probed, and if none exists
    /// the built-in default registry is returned.
    pub fn load_from_env() -> AppResult<Self> {
        if let Ok(config_path) = env::var("REMOTE_DEVICES_CONFIG") {
            return Self::load_from_file(config_path);
        }

        let default_paths = [
            PathBuf::from("devices.json"),
            PathBuf::from("/app/devices.json"),
            PathBuf::from("/config/devices.json"),
        ];

        for path in &default_paths {
            if path.exists() {
                return Self::load_from_file(path);
            }
        }

        Ok(Self::default_registry())
    }

    /// Built-in registry used when no configuration source exists.
    ///
    /// The single example device is disabled so a fresh deployment doesn't
    /// try to dial a placeholder address.
    pub fn default_registry() -> Self {
        Self {
            devices: vec![RemoteDevice {
                name: "test_device".to_string(),
                host: "192.168.1.100".to_string(),
                port: 8765,
                voice: "Watercooler".to_string(),
                instructions: serde_json::json!({"type": "smalltalk"}),
                auto_reconnect: true,
                reconnect_delay: 5.0,
                enabled: false,
            }],
        }
    }

    /// Get only enabled devices, preserving registry order.
    pub fn enabled_devices(&self) -> Vec<&RemoteDevice> {
        self.devices.iter().filter(|device| device.enabled).collect()
    }

    /// Check registry invariants: unique names, sane delays.
    fn validate(&self) -> AppResult<()> {
        let mut seen = std::collections::HashSet::new();

        for device in &self.devices {
            if device.name.is_empty() {
                return Err(AppError::Config("Device name cannot be empty".to_string()));
            }

            if !seen.insert(device.name.as_str()) {
                return Err(AppError::Config(format!(
                    "Duplicate device name '{}' in registry",
                    device.name
                )));
            }

            if device.reconnect_delay < 0.0 {
                return Err(AppError::Config(format!(
                    "Device '{}' has negative reconnect_delay ({})",
                    device.name, device.reconnect_delay
                )));
            }
        }

        Ok(())
    }
}

/// Write a fully-populated example registry for bootstrapping.
///
/// Refuses to overwrite: if the target already exists, the existing file
/// wins and nothing is written.
pub fn create_example_config(output_path: impl AsRef<Path>) -> AppResult<()> {
    let output_path = output_path.as_ref();

    if output_path.exists() {
        return Err(AppError::Config(format!(
            "Refusing to overwrite existing config: {}",
            output_path.display()
        )));
    }

    let example = DeviceRegistry {
        devices: vec![
            RemoteDevice {
                name: "living_room".to_string(),
                host: "192.168.1.100".to_string(),
                port: 8765,
                voice: "Watercooler".to_string(),
                instructions: serde_json::json!({"type": "smalltalk"}),
                auto_reconnect: true,
                reconnect_delay: 5.0,
                enabled: true,
            },
            RemoteDevice {
                name: "kitchen".to_string(),
                host: "192.168.1.101".to_string(),
                port: 8765,
                voice: "Gertrude".to_string(),
                instructions: serde_json::json!({
                    "type": "constant",
                    "text": "You are a helpful kitchen assistant. Keep responses brief and practical."
                }),
                auto_reconnect: true,
                reconnect_delay: 3.0,
                enabled: true,
            },
            RemoteDevice {
                name: "office".to_string(),
                host: "192.168.1.102".to_string(),
                port: 8765,
                voice: "Dev (news)".to_string(),
                instructions: serde_json::json!({
                    "type": "constant",
                    "text": "You are a professional assistant for office work. Be concise and helpful."
                }),
                auto_reconnect: true,
                reconnect_delay: 5.0,
                enabled: false,
            },
        ],
    };

    let json = serde_json::to_string_pretty(&example)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    std::fs::write(output_path, json)
        .map_err(|e| AppError::Config(format!("Failed to write example config: {}", e)))?;

    info!("Example configuration created at: {}", output_path.display());
    Ok(())
}
