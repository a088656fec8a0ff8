//! # Device Fleet API Handlers
//!
//! The HTTP query surface over the supervisor: listing configured devices,
//! live connection status, manual reconnect, and a bootstrap example config.
//! None of these endpoints touch the network - they only read supervisor
//! snapshots, so they stay fast even when the whole fleet is flapping.

use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/devices` - all configured devices with their settings.
pub async fn list_devices(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let registry = state.supervisor.registry();

    let devices_info: Vec<_> = registry
        .devices
        .iter()
        .map(|device| {
            json!({
                "name": device.name,
                "host": device.host,
                "port": device.port,
                "voice": device.voice,
                "enabled": device.enabled,
                "auto_reconnect": device.auto_reconnect,
                "reconnect_delay": device.reconnect_delay
            })
        })
        .collect();

    Ok(HttpResponse::Ok().json(json!({
        "devices": devices_info,
        "total_count": devices_info.len()
    })))
}

/// `GET /api/v1/devices/status` - detailed connection status and summary.
pub async fn get_device_status(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let status = state.supervisor.status();
    let summary = state.supervisor.counts();

    Ok(HttpResponse::Ok().json(json!({
        "devices": status,
        "summary": summary,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// `POST /api/v1/devices/{name}/reconnect` - manually reconnect one device.
pub async fn reconnect_device(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let device_name = path.into_inner();

    state.supervisor.reconnect(&device_name).await?;

    Ok(HttpResponse::Ok().json(json!({
        "message": format!("Reconnection initiated for device '{}'", device_name),
        "device": device_name
    })))
}

/// `GET /api/v1/config/example` - an example registry document for
/// bootstrapping a deployment.
pub async fn get_example_config() -> Result<HttpResponse, AppError> {
    let example = crate::devices::DeviceRegistry::default_registry();

    Ok(HttpResponse::Ok().json(json!({
        "example_config": example,
        "description": "Example configuration for devices.json",
        "note": "Set 'enabled': true and update host/port for your devices"
    })))
}
