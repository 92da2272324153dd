use crate::state::AppState;
use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::{Method, StatusCode},
    web, Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};

/// Per-endpoint request counters, written into [`AppState`] metrics.
///
/// Endpoints are keyed by the matched route pattern, so
/// `/api/v1/sessions/{id}` is one entry however many calls are live.
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
        let started = Instant::now();
        let state = req.app_data::<web::Data<AppState>>().cloned();
        let method = req.method().clone();
        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let Some(state) = state else { return result };

            let (endpoint, failed) = match &result {
                Ok(response) => (
                    endpoint_key(&method, response.request().match_pattern()),
                    is_failure(response.status()),
                ),
                Err(_) => (endpoint_key(&method, None), true),
            };
            state.record_request(&endpoint, started.elapsed().as_millis() as u64, failed);

            result
        })
    }
}

fn endpoint_key(method: &Method, pattern: Option<String>) -> String {
    format!("{} {}", method, pattern.as_deref().unwrap_or("unmatched"))
}

fn is_failure(status: StatusCode) -> bool {
    status.is_client_error() || status.is_server_error()
}
