//! Per-request metrics collection feeding `AppState`.
//!
//! Device names are collapsed out of the endpoint key so the per-endpoint
//! map stays bounded by the API surface, not by the size of the fleet.

use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService { service }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: S,
}

/// Collapse the device-name segment of per-device routes into a placeholder
/// so `POST /api/v1/devices/kitchen/reconnect` and
/// `POST /api/v1/devices/office/reconnect` share one metrics bucket.
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = path.split('/').collect();

    if segments.len() >= 2 && segments[segments.len() - 1] == "reconnect" {
        let name_idx = segments.len() - 2;
        if name_idx >= 1 && segments[name_idx - 1] == "devices" {
            segments[name_idx] = "{name}";
        }
    }

    segments.join("/")
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let start_time = Instant::now();
        let endpoint = format!("{} {}", req.method(), normalize_path(req.uri().path()));

        if let Some(app_state) = req.app_data::<web::Data<AppState>>() {
            app_state.increment_request_count();
        }

        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = start_time.elapsed().as_millis() as u64;

            let is_error = match &result {
                Ok(response) => {
                    response.status().is_client_error() || response.status().is_server_error()
                }
                Err(_) => true,
            };

            if let Ok(response) = &result {
                if let Some(app_state) = response.request().app_data::<web::Data<AppState>>() {
                    app_state.record_endpoint_request(&endpoint, duration_ms, is_error);

                    if is_error {
                        app_state.increment_error_count();
                    }
                }
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_reconnect_paths_share_a_bucket() {
        assert_eq!(
            normalize_path("/api/v1/devices/kitchen/reconnect"),
            "/api/v1/devices/{name}/reconnect"
        );
        assert_eq!(
            normalize_path("/api/v1/devices/living_room/reconnect"),
            "/api/v1/devices/{name}/reconnect"
        );
    }

    #[test]
    fn test_other_paths_untouched() {
        assert_eq!(normalize_path("/api/v1/devices/status"), "/api/v1/devices/status");
        assert_eq!(normalize_path("/api/v1/health"), "/api/v1/health");
        assert_eq!(normalize_path("/reconnect"), "/reconnect");
    }
}
