//! Collaborator interfaces handed to a session at creation time.

use crate::bridge::CloseReason;
use crate::bridge::handle::SessionStatsSnapshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tracing::info;

/// Where to dial the upstream speech endpoint and how to authenticate.
///
/// Treated as an opaque value by the session; it is never read from the
/// environment inside the bridge.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamCredentials {
    pub url: String,
    pub token: String,
}

impl UpstreamCredentials {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
        }
    }

    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }
}

impl fmt::Debug for UpstreamCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamCredentials")
            .field("url", &self.url)
            .field("token", &if self.has_token() { "<redacted>" } else { "<empty>" })
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStarted {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallEnded {
    pub session_id: String,
    pub stream_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub reason: CloseReason,
    pub stats: SessionStatsSnapshot,
}

/// Call-log bookkeeping hook. Fired once when a session starts and once when
/// it ends; implementations must not block.
pub trait CallEventNotifier: Send + Sync {
    fn call_started(&self, event: &CallStarted);
    fn call_ended(&self, event: &CallEnded);
}

/// Default notifier: emits the events as structured log lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl CallEventNotifier for TracingNotifier {
    fn call_started(&self, event: &CallStarted) {
        info!(session_id = %event.session_id, "Call started");
    }

    fn call_ended(&self, event: &CallEnded) {
        let duration_ms = event
            .ended_at
            .signed_duration_since(event.started_at)
            .num_milliseconds();
        info!(
            session_id = %event.session_id,
            stream_id = event.stream_id.as_deref().unwrap_or("-"),
            reason = %event.reason,
            duration_ms,
            frames_from_caller = event.stats.frames_from_caller,
            frames_to_caller = event.stats.frames_to_caller,
            "Call ended"
        );
    }
}
