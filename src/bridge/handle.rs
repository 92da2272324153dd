//! Shared, observable record of one session.
//!
//! The orchestrator owns the legs; everything else (registry, HTTP views,
//! telephony socket) only ever sees this handle. Diagnostics fields are
//! write-once and the state only moves forward.

use crate::bridge::{CloseReason, SessionState};
use crate::codec::AudioFormat;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, RwLock};
use tokio::sync::watch;

/// Formats fixed for the life of the call once negotiation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NegotiatedFormats {
    /// What the caller's media stream carries.
    pub telephony: AudioFormat,
    /// What the upstream expects for appended input audio.
    pub upstream_input: AudioFormat,
    /// What the upstream produces in audio deltas.
    pub upstream_output: AudioFormat,
}

/// Per-session frame counters.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_from_caller: AtomicU64,
    pub frames_to_upstream: AtomicU64,
    pub frames_from_upstream: AtomicU64,
    pub frames_to_caller: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub commits: AtomicU64,
}

impl SessionStats {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionStatsSnapshot {
        SessionStatsSnapshot {
            frames_from_caller: self.frames_from_caller.load(Ordering::Relaxed),
            frames_to_upstream: self.frames_to_upstream.load(Ordering::Relaxed),
            frames_from_upstream: self.frames_from_upstream.load(Ordering::Relaxed),
            frames_to_caller: self.frames_to_caller.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStatsSnapshot {
    pub frames_from_caller: u64,
    pub frames_to_upstream: u64,
    pub frames_from_upstream: u64,
    pub frames_to_caller: u64,
    pub frames_dropped: u64,
    pub malformed_frames: u64,
    pub commits: u64,
}

/// Point-in-time view of a session for logs and the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub state: SessionState,
    pub stream_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub negotiated: Option<NegotiatedFormats>,
    pub duration_seconds: f64,
    /// Hang-up was requested and teardown is in progress.
    pub shutdown_requested: bool,
    pub stats: SessionStatsSnapshot,
}

pub struct SessionHandle {
    id: String,
    created_at: DateTime<Utc>,
    state: RwLock<SessionState>,
    stream_id: OnceLock<String>,
    negotiated: OnceLock<NegotiatedFormats>,
    closed_at: OnceLock<DateTime<Utc>>,
    close_reason: OnceLock<CloseReason>,
    shutdown: watch::Sender<bool>,
    pub stats: SessionStats,
}

impl SessionHandle {
    pub fn new(id: String) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            state: RwLock::new(SessionState::Connecting),
            stream_id: OnceLock::new(),
            negotiated: OnceLock::new(),
            closed_at: OnceLock::new(),
            close_reason: OnceLock::new(),
            shutdown: watch::channel(false).0,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Move to `next` if it is later in the lifecycle. Returns whether the
    /// state changed; backwards or repeated transitions are ignored.
    pub fn advance(&self, next: SessionState) -> bool {
        let mut state = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if next > *state {
            *state = next;
            true
        } else {
            false
        }
    }

    pub fn stream_id(&self) -> Option<&str> {
        self.stream_id.get().map(String::as_str)
    }

    pub fn set_stream_id(&self, stream_id: String) {
        let _ = self.stream_id.set(stream_id);
    }

    pub fn negotiated(&self) -> Option<NegotiatedFormats> {
        self.negotiated.get().copied()
    }

    /// Record the negotiated formats. Only the first call has any effect.
    pub fn set_negotiated(&self, formats: NegotiatedFormats) -> bool {
        self.negotiated.set(formats).is_ok()
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.get()
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.closed_at.get().copied()
    }

    /// Record the terminal outcome and enter `Closed`.
    pub fn finish(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        let _ = self.closed_at.set(Utc::now());
        self.advance(SessionState::Closed);
    }

    /// Ask the orchestrator to tear the session down.
    pub fn request_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn duration_seconds(&self) -> f64 {
        let end = self.closed_at().unwrap_or_else(Utc::now);
        end.signed_duration_since(self.created_at).num_milliseconds() as f64 / 1000.0
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            state: self.state(),
            stream_id: self.stream_id().map(str::to_string),
            created_at: self.created_at,
            closed_at: self.closed_at(),
            close_reason: self.close_reason().cloned(),
            negotiated: self.negotiated(),
            duration_seconds: self.duration_seconds(),
            shutdown_requested: self.shutdown_requested(),
            stats: self.stats.snapshot(),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}
