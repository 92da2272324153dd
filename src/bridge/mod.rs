//! # Voice Bridge
//!
//! Connects a telephony media stream to an upstream AI speech endpoint for
//! the lifetime of one call.
//!
//! ## Key Components:
//! - **handle**: the shared, observable record of one session
//! - **queue**: bounded drop-oldest frame queue between a leg and a pump
//! - **telephony**: the telephony envelope protocol (`start`/`media`/`stop`)
//! - **upstream**: the speech endpoint protocol and its socket
//! - **session**: the orchestrator that owns one call and its two pumps
//! - **registry**: process-wide index of live sessions
//! - **hooks**: collaborator interfaces (call notifications, credentials)
//!
//! ## Session Lifecycle:
//! `Connecting → Negotiating → Streaming → Draining → Closed`, strictly forward.

pub mod handle;
pub mod hooks;
pub mod queue;
pub mod registry;
pub mod session;
pub mod telephony;
pub mod upstream;

use serde::Serialize;
use std::fmt;

pub use handle::SessionHandle;
pub use hooks::{CallEventNotifier, TracingNotifier, UpstreamCredentials};
pub use registry::{RegistrySummary, SessionRegistry};
pub use session::{Session, SessionConfig};
pub use telephony::{TelephonyCommand, TelephonyEndpoint};
pub use upstream::AgentProfile;

/// One side of a bridged call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Telephony,
    Upstream,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Telephony => f.write_str("telephony"),
            Leg::Upstream => f.write_str("upstream"),
        }
    }
}

/// Where a session is in its lifecycle.
///
/// The derive order is the lifecycle order, so `PartialOrd` tells whether a
/// transition moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Dialing the upstream endpoint.
    Connecting,
    /// Configuration sent; waiting for the telephony `start` and upstream readiness.
    Negotiating,
    /// Audio is flowing both ways.
    Streaming,
    /// Shutdown requested; queued frames are being flushed.
    Draining,
    /// Both sockets closed. Absorbing.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Negotiating => "negotiating",
            SessionState::Streaming => "streaming",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended. Recorded once, on the first terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CloseReason {
    /// The telephony socket closed.
    TelephonyClosed,
    /// The upstream socket closed.
    UpstreamClosed,
    /// The upstream socket failed mid-call.
    UpstreamError(String),
    /// The upstream endpoint could not be reached.
    UpstreamUnavailable(String),
    /// `start` and upstream readiness did not both arrive in time.
    NegotiationTimeout,
    /// The two legs' formats have no conversion path.
    UnsupportedFormat(String),
    /// Shut down through the registry.
    ForcedShutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::TelephonyClosed => f.write_str("telephony leg closed"),
            CloseReason::UpstreamClosed => f.write_str("upstream leg closed"),
            CloseReason::UpstreamError(e) => write!(f, "upstream error: {}", e),
            CloseReason::UpstreamUnavailable(e) => write!(f, "upstream unavailable: {}", e),
            CloseReason::NegotiationTimeout => f.write_str("negotiation timed out"),
            CloseReason::UnsupportedFormat(e) => write!(f, "unsupported format: {}", e),
            CloseReason::ForcedShutdown => f.write_str("forced shutdown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order_is_lifecycle_order() {
        assert!(SessionState::Connecting < SessionState::Negotiating);
        assert!(SessionState::Negotiating < SessionState::Streaming);
        assert!(SessionState::Streaming < SessionState::Draining);
        assert!(SessionState::Draining < SessionState::Closed);
    }

    #[test]
    fn test_close_reason_serialization() {
        let json = serde_json::to_value(CloseReason::UpstreamError("reset".into())).unwrap();
        assert_eq!(json["kind"], "upstream_error");
        assert_eq!(json["detail"], "reset");
        assert_eq!(serde_json::to_value(CloseReason::TelephonyClosed).unwrap()["kind"], "telephony_closed");
    }
}
