//! # Session Registry
//!
//! Process-wide index of live sessions, keyed by session id. Used for
//! capacity limits, metrics and forced shutdown only; sessions never reach
//! each other through it.
//!
//! ## Thread Safety:
//! A `RwLock` around the map: many concurrent readers (metrics, HTTP views)
//! or one writer (insert/remove). The lock is never held across an await.

use crate::bridge::handle::{SessionHandle, SessionSnapshot};
use crate::error::BridgeError;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

type SessionMap = HashMap<String, Arc<SessionHandle>>;

/// Live sessions plus the concurrency limit.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<SessionMap>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
        }
    }

    /// Add a session. Fails when the registry is full or the id is taken.
    ///
    /// The returned guard removes the entry when dropped, so a session task
    /// that is aborted or panics still leaves the registry consistent.
    pub fn register(&self, handle: Arc<SessionHandle>) -> Result<Registration, BridgeError> {
        let mut sessions = self.write();

        if sessions.len() >= self.max_sessions {
            return Err(BridgeError::CapacityExceeded(self.max_sessions));
        }
        if sessions.contains_key(handle.id()) {
            return Err(BridgeError::DuplicateSession(handle.id().to_string()));
        }

        let id = handle.id().to_string();
        sessions.insert(id.clone(), handle);
        debug!(session_id = %id, active = sessions.len(), "Session registered");

        Ok(Registration {
            registry: self.clone(),
            id,
        })
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.write().remove(id).is_some();
        if removed {
            debug!(session_id = %id, "Session removed from registry");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Snapshots of every live session, oldest first.
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<SessionSnapshot> = self.read().values().map(|s| s.snapshot()).collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Ask one session to tear down. Returns false for an unknown id.
    pub fn shutdown(&self, id: &str) -> bool {
        match self.get(id) {
            Some(handle) => {
                info!(session_id = %id, "Forced shutdown requested");
                handle.request_shutdown();
                true
            }
            None => false,
        }
    }

    /// Ask every live session to tear down. Returns how many were signalled.
    pub fn shutdown_all(&self) -> usize {
        let handles: Vec<Arc<SessionHandle>> = self.read().values().cloned().collect();
        for handle in &handles {
            handle.request_shutdown();
        }
        if !handles.is_empty() {
            info!(count = handles.len(), "Forced shutdown of all sessions");
        }
        handles.len()
    }

    /// Aggregate view for metrics.
    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.read();

        let mut state_counts = HashMap::new();
        let mut frames_from_caller = 0;
        let mut frames_to_caller = 0;
        let mut frames_dropped = 0;
        let mut malformed_frames = 0;

        for session in sessions.values() {
            *state_counts.entry(session.state().as_str().to_string()).or_insert(0) += 1;

            let stats = &session.stats;
            frames_from_caller += stats.frames_from_caller.load(Ordering::Relaxed);
            frames_to_caller += stats.frames_to_caller.load(Ordering::Relaxed);
            frames_dropped += stats.frames_dropped.load(Ordering::Relaxed);
            malformed_frames += stats.malformed_frames.load(Ordering::Relaxed);
        }

        RegistrySummary {
            total_sessions: sessions.len(),
            max_sessions: self.max_sessions,
            state_counts,
            frames_from_caller,
            frames_to_caller,
            frames_dropped,
            malformed_frames,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionMap> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionMap> {
        self.sessions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Registry membership of one session; removes the entry on drop.
pub struct Registration {
    registry: SessionRegistry,
    id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// Summary of registry state, totals over live sessions only.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub state_counts: HashMap<String, usize>,
    pub frames_from_caller: u64,
    pub frames_to_caller: u64,
    pub frames_dropped: u64,
    pub malformed_frames: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::handle::SessionStats;
    use crate::bridge::SessionState;

    fn handle(id: &str) -> Arc<SessionHandle> {
        Arc::new(SessionHandle::new(id.to_string()))
    }

    #[test]
    fn test_register_and_drop_guard() {
        let registry = SessionRegistry::new(4);
        let guard = registry.register(handle("a")).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("a").is_some());

        drop(guard);
        assert!(registry.is_empty());
        assert!(registry.get("a").is_none());
    }

    #[test]
    fn test_capacity_limit() {
        let registry = SessionRegistry::new(2);
        let _a = registry.register(handle("a")).unwrap();
        let _b = registry.register(handle("b")).unwrap();
        assert_eq!(registry.len(), registry.max_sessions());

        let err = registry.register(handle("c")).err().unwrap();
        assert!(matches!(err, BridgeError::CapacityExceeded(2)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let registry = SessionRegistry::new(4);
        let _a = registry.register(handle("a")).unwrap();
        let err = registry.register(handle("a")).err().unwrap();
        assert!(matches!(err, BridgeError::DuplicateSession(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_explicit_remove_then_guard_drop() {
        let registry = SessionRegistry::new(4);
        let guard = registry.register(handle("a")).unwrap();
        assert!(registry.remove("a"));
        assert!(!registry.remove("a"));
        drop(guard);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_shutdown_signals_sessions() {
        let registry = SessionRegistry::new(4);
        let a = handle("a");
        let b = handle("b");
        let _ga = registry.register(a.clone()).unwrap();
        let _gb = registry.register(b.clone()).unwrap();

        assert!(registry.shutdown("a"));
        assert!(!registry.shutdown("missing"));
        assert!(a.shutdown_requested());
        assert!(!b.shutdown_requested());

        assert_eq!(registry.shutdown_all(), 2);
        assert!(b.shutdown_requested());
    }

    #[test]
    fn test_summary_aggregates_live_sessions() {
        let registry = SessionRegistry::new(8);
        let a = handle("a");
        let b = handle("b");
        a.advance(SessionState::Streaming);
        SessionStats::incr(&a.stats.frames_from_caller);
        SessionStats::incr(&b.stats.frames_from_caller);
        SessionStats::incr(&b.stats.frames_dropped);
        let _ga = registry.register(a).unwrap();
        let _gb = registry.register(b).unwrap();

        let summary = registry.summary();
        assert_eq!(summary.total_sessions, 2);
        assert_eq!(summary.max_sessions, 8);
        assert_eq!(summary.state_counts.get("streaming"), Some(&1));
        assert_eq!(summary.state_counts.get("connecting"), Some(&1));
        assert_eq!(summary.frames_from_caller, 2);
        assert_eq!(summary.frames_dropped, 1);
        assert_eq!(registry.snapshots().len(), 2);
    }

    #[test]
    fn test_concurrent_insert_remove() {
        let registry = SessionRegistry::new(1000);
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let id = format!("{}-{}", t, i);
                        let _guard = registry.register(handle(&id)).unwrap();
                        assert!(registry.get(&id).is_some());
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
