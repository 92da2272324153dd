//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket upgrade.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every worker thread holds a reference to the same data
//! - **RwLock**: many readers (handlers reading config) or one writer
//!   (a config update, the metrics middleware)
//!
//! Locks are held only for the duration of a copy or a counter update and
//! never across an await. A poisoned lock is recovered rather than
//! propagated; the data behind it is plain counters and settings.

use crate::bridge::{CallEventNotifier, SessionRegistry, TracingNotifier};
use crate::codec::CodecRegistry;
use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Current settings. New sessions read them at upgrade time.
    pub config: Arc<RwLock<AppConfig>>,

    /// HTTP request counters, updated by the metrics middleware.
    pub metrics: Arc<RwLock<AppMetrics>>,

    pub start_time: Instant,

    /// Live sessions. The limit is fixed when the state is built.
    pub sessions: SessionRegistry,

    /// Codecs shared by every session's transcoders.
    pub codecs: Arc<CodecRegistry>,

    /// Call start/end hook passed to each new session.
    pub notifier: Arc<dyn CallEventNotifier>,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Telephony WebSocket upgrades accepted since startup.
    pub sessions_started: u64,
    /// Upgrades turned away because the registry was full.
    pub sessions_rejected: u64,
    /// Key: "METHOD /route/pattern"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Build state with the default codecs and the logging notifier.
    pub fn new(config: AppConfig) -> Self {
        Self::with_notifier(config, Arc::new(TracingNotifier))
    }

    pub fn with_notifier(config: AppConfig, notifier: Arc<dyn CallEventNotifier>) -> Self {
        let sessions = SessionRegistry::new(config.bridge.max_concurrent_sessions);
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            sessions,
            codecs: Arc::new(CodecRegistry::default()),
            notifier,
        }
    }

    /// Copy of the current configuration; the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self
                    .config
                    .write()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn record_session_started(&self) {
        self.metrics_mut().sessions_started += 1;
    }

    pub fn record_session_rejected(&self) {
        self.metrics_mut().sessions_rejected += 1;
    }

    /// Count one finished request. Totals and the endpoint entry are
    /// updated under one lock.
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, failed: bool) {
        let mut metrics = self.metrics_mut();
        metrics.request_count += 1;
        if failed {
            metrics.error_count += 1;
        }

        let entry = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        entry.request_count += 1;
        entry.total_duration_ms += duration_ms;
        if failed {
            entry.error_count += 1;
        }
    }

    /// Point-in-time copy of the request metrics.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics_ref();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            sessions_started: metrics.sessions_started,
            sessions_rejected: metrics.sessions_rejected,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = AppState::new(AppConfig::default());
        state.record_request("GET /health", 10, false);
        state.record_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.error_count, 1);
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
        assert_eq!(EndpointMetric::default().error_rate(), 0.0);
    }

    #[test]
    fn test_registry_limit_comes_from_config() {
        let mut config = AppConfig::default();
        config.bridge.max_concurrent_sessions = 3;
        let state = AppState::new(config);
        assert_eq!(state.sessions.max_sessions(), 3);
        assert!(state.sessions.is_empty());
    }

    #[test]
    fn test_invalid_config_update_is_rejected() {
        let state = AppState::new(AppConfig::default());
        let mut bad = state.get_config();
        bad.bridge.queue_capacity = 0;
        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().bridge.queue_capacity, 50);
    }
}
