use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Fleet health check.
///
/// The fleet is healthy when at least one enabled device is connected, or
/// when no devices are enabled at all (an idle fleet is not a broken fleet).
/// Degraded fleets answer 503 so load balancers and probes can react.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let counts = state.supervisor.counts();
    let config = state.get_config();

    let is_healthy = counts.connected > 0 || counts.enabled == 0;

    let body = json!({
        "status": if is_healthy { "healthy" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "device-fleet-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "devices": counts,
        "message": format!("{}/{} devices connected", counts.connected, counts.enabled)
    });

    if is_healthy {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

/// Request metrics for observability tooling.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            },
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "fleet": {
            "running": state.supervisor.is_running(),
            "counts": state.supervisor.counts()
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::PassthroughCodec;
    use crate::config::AppConfig;
    use crate::devices::DeviceRegistry;
    use crate::session::PlaceholderSessionFactory;
    use crate::supervisor::FleetSupervisor;
    use actix_web::http::StatusCode;
    use std::sync::Arc;

    fn state_with_registry(registry: DeviceRegistry) -> web::Data<AppState> {
        let supervisor = Arc::new(FleetSupervisor::new(
            registry,
            Arc::new(PlaceholderSessionFactory),
            Arc::new(PassthroughCodec),
        ));
        web::Data::new(AppState::new(AppConfig::default(), supervisor))
    }

    #[tokio::test]
    async fn test_idle_fleet_is_healthy() {
        // Default registry has zero enabled devices
        let state = state_with_registry(DeviceRegistry::default_registry());
        let response = health_check(state).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_enabled_but_disconnected_fleet_is_degraded() {
        let mut registry = DeviceRegistry::default_registry();
        registry.devices[0].enabled = true;
        registry.devices[0].host = "127.0.0.1".to_string();
        registry.devices[0].port = 1; // nothing listens here
        registry.devices[0].reconnect_delay = 5.0;

        let state = state_with_registry(registry);
        state.supervisor.start().await;

        let response = health_check(state.clone()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.supervisor.stop().await;
    }
}
