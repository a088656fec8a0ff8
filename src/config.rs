//! # Configuration Management
//!
//! This module handles loading and managing application configuration from
//! multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! Note that the *device registry* (which devices to dial and how) lives in
//! its own JSON document and is handled by the `devices` module; this module
//! covers the service's own settings.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SERVER_PORT, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub fleet: FleetConfig,
    pub audio: AudioConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Fleet-level settings for the device supervisor.
///
/// ## Fields:
/// - `devices_config`: Optional explicit path to the device registry JSON.
///   When set, loading fails hard if the file is missing or malformed; when
///   unset, the registry falls back to the REMOTE_DEVICES_CONFIG environment
///   variable and the well-known default paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    pub devices_config: Option<String>,
}

/// Audio format settings shared by every device session.
///
/// These mirror the process-wide constants in the `audio` module; they exist
/// in the config so deployments can see (and sanity-check) what the service
/// was built for, but every device on the fleet uses the same values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub samples_per_frame: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            fleet: FleetConfig {
                devices_config: None,
            },
            audio: AudioConfig {
                sample_rate: crate::audio::SAMPLE_RATE,
                samples_per_frame: crate::audio::SAMPLES_PER_FRAME,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST and PORT environment variables
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_SERVER_PORT=3000`: Override server port
    /// - `APP_FLEET_DEVICES_CONFIG=/etc/fleet/devices.json`: Override registry path
    /// - `HOST` / `PORT`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0 (port 0 is reserved and can't be bound)
    /// - Sample rate and frame size are non-zero
    /// - Frame size is shorter than one second of audio (a frame longer than
    ///   the sample rate means someone swapped the two values)
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.samples_per_frame == 0 {
            return Err(anyhow::anyhow!("Audio frame size must be greater than 0"));
        }

        if self.audio.samples_per_frame as u32 > self.audio.sample_rate {
            return Err(anyhow::anyhow!(
                "Audio frame size ({}) exceeds one second of audio at {} Hz",
                self.audio.samples_per_frame,
                self.audio.sample_rate
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.sample_rate, 24000);
        assert_eq!(config.audio.samples_per_frame, 1920);
        assert!(config.fleet.devices_config.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_frame_larger_than_sample_rate_rejected() {
        let mut config = AppConfig::default();
        config.audio.samples_per_frame = 48_000;
        config.audio.sample_rate = 24_000;
        assert!(config.validate().is_err());
    }
}
