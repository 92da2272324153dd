use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::{header, StatusCode},
    Error,
};
use futures_util::future::LocalBoxFuture;
use std::{
    future::{ready, Ready},
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Logs each request once it completes.
///
/// Server errors log at error, client errors at warn and the rest at info.
/// Health checks from load balancers drop to debug. WebSocket upgrades are
/// tagged so the long-lived media connections stand out.
pub struct RequestLogging;

impl<S, B> Transform<S, ServiceRequest> for RequestLogging
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error>,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggingMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequestLoggingMiddleware { service }))
    }
}

pub struct RequestLoggingMiddleware<S> {
    service: S,
}

/// What is known about a request before the handler runs.
struct RequestLine {
    method: String,
    uri: String,
    peer: String,
    websocket: bool,
    quiet: bool,
}

impl RequestLine {
    fn from_request(req: &ServiceRequest) -> Self {
        Self {
            method: req.method().to_string(),
            uri: req.uri().to_string(),
            peer: req
                .connection_info()
                .realip_remote_addr()
                .unwrap_or("unknown")
                .to_string(),
            websocket: is_websocket_upgrade(req),
            quiet: req.path().ends_with("/health"),
        }
    }

    fn completed(&self, status: StatusCode, duration_ms: u64) {
        macro_rules! log_at {
            ($level:ident, $line:expr) => {
                $level!(
                    method = %$line.method,
                    uri = %$line.uri,
                    peer = %$line.peer,
                    status = status.as_u16(),
                    duration_ms,
                    websocket = $line.websocket,
                    "Request completed"
                )
            };
        }

        if status.is_server_error() {
            log_at!(error, self);
        } else if status.is_client_error() {
            log_at!(warn, self);
        } else if self.quiet {
            log_at!(debug, self);
        } else {
            log_at!(info, self);
        }
    }

    fn failed(&self, err: &Error, duration_ms: u64) {
        error!(
            method = %self.method,
            uri = %self.uri,
            peer = %self.peer,
            duration_ms,
            error = %err,
            "Request failed"
        );
    }
}

impl<S, B> Service<ServiceRequest> for RequestLoggingMiddleware<S>
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
        let line = RequestLine::from_request(&req);
        let fut = self.service.call(req);

        Box::pin(async move {
            let result = fut.await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match &result {
                Ok(response) => line.completed(response.status(), duration_ms),
                Err(err) => line.failed(err, duration_ms),
            }

            result
        })
    }
}

fn is_websocket_upgrade(req: &ServiceRequest) -> bool {
    req.headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}
