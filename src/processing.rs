//! Per-session, per-operation mutual exclusion for LLM pipelines.
//!
//! A slot exists per `(session, kind)` while that pipeline is running. The
//! map lock is held only for O(1) bookkeeping; it is never held across an
//! LLM call or any other suspension point.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// The two LLM-derived artifacts a session can be processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Summary,
    MindMap,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Summary => write!(f, "summary"),
            OperationKind::MindMap => write!(f, "mind_map"),
        }
    }
}

/// Snapshot of a session's processing state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionProcessingStatus {
    pub summary_processing: bool,
    pub mind_map_processing: bool,
    pub any_processing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mind_map_start_time: Option<DateTime<Utc>>,
}

/// Central concurrency gate: at most one in-flight pipeline per
/// `(session, kind)`. Kinds are independent; both may run simultaneously
/// for one session.
pub struct ProcessingStateManager {
    slots: Mutex<HashMap<String, HashMap<OperationKind, DateTime<Utc>>>>,
}

impl ProcessingStateManager {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically claim the `(session, kind)` slot. Returns false when the
    /// slot is already busy. There is no timeout-based auto-release: a stuck
    /// pipeline keeps its slot until it returns.
    pub fn try_start(&self, session_id: &str, kind: OperationKind) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let session = slots.entry(session_id.to_string()).or_default();
        if session.contains_key(&kind) {
            return false;
        }
        session.insert(kind, Utc::now());
        debug!("Claimed {} slot for session {}", kind, session_id);
        true
    }

    /// Release the `(session, kind)` slot. Removes the session's entry
    /// entirely once no slots remain busy.
    pub fn stop(&self, session_id: &str, kind: OperationKind) {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = slots.get_mut(session_id) {
            session.remove(&kind);
            if session.is_empty() {
                slots.remove(session_id);
            }
        }
        debug!("Released {} slot for session {}", kind, session_id);
    }

    /// Snapshot read of one slot.
    pub fn is_busy(&self, session_id: &str, kind: OperationKind) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(session_id)
            .is_some_and(|s| s.contains_key(&kind))
    }

    /// Snapshot read: is any kind busy for this session?
    pub fn is_any_busy(&self, session_id: &str) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(session_id).is_some_and(|s| !s.is_empty())
    }

    /// Full status snapshot for one session.
    pub fn status(&self, session_id: &str) -> SessionProcessingStatus {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let session = slots.get(session_id);

        let summary_start_time =
            session.and_then(|s| s.get(&OperationKind::Summary).copied());
        let mind_map_start_time =
            session.and_then(|s| s.get(&OperationKind::MindMap).copied());

        SessionProcessingStatus {
            summary_processing: summary_start_time.is_some(),
            mind_map_processing: mind_map_start_time.is_some(),
            any_processing: summary_start_time.is_some() || mind_map_start_time.is_some(),
            summary_start_time,
            mind_map_start_time,
        }
    }

    /// Number of sessions currently holding at least one busy slot.
    pub fn tracked_sessions(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.len()
    }
}

impl Default for ProcessingStateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that releases a claimed slot on every exit path, including panics.
pub struct SlotGuard<'a> {
    manager: &'a ProcessingStateManager,
    session_id: String,
    kind: OperationKind,
}

impl<'a> SlotGuard<'a> {
    /// Claim a slot, returning a releasing guard, or None when busy.
    pub fn claim(
        manager: &'a ProcessingStateManager,
        session_id: &str,
        kind: OperationKind,
    ) -> Option<Self> {
        if manager.try_start(session_id, kind) {
            Some(Self {
                manager,
                session_id: session_id.to_string(),
                kind,
            })
        } else {
            None
        }
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.manager.stop(&self.session_id, self.kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_mutual_exclusion() {
        let manager = ProcessingStateManager::new();

        assert!(manager.try_start("s1", OperationKind::Summary));
        assert!(!manager.try_start("s1", OperationKind::Summary));

        manager.stop("s1", OperationKind::Summary);
        assert!(manager.try_start("s1", OperationKind::Summary));
    }

    #[test]
    fn test_kinds_are_independent() {
        let manager = ProcessingStateManager::new();

        assert!(manager.try_start("s1", OperationKind::Summary));
        assert!(manager.try_start("s1", OperationKind::MindMap));

        let status = manager.status("s1");
        assert!(status.summary_processing);
        assert!(status.mind_map_processing);
        assert!(status.any_processing);
        assert!(status.summary_start_time.is_some());
    }

    #[test]
    fn test_sessions_are_independent() {
        let manager = ProcessingStateManager::new();

        assert!(manager.try_start("s1", OperationKind::Summary));
        assert!(manager.try_start("s2", OperationKind::Summary));
    }

    #[test]
    fn test_clean_release_removes_session() {
        let manager = ProcessingStateManager::new();

        manager.try_start("s1", OperationKind::Summary);
        manager.try_start("s1", OperationKind::MindMap);
        manager.stop("s1", OperationKind::Summary);
        assert_eq!(manager.tracked_sessions(), 1);

        manager.stop("s1", OperationKind::MindMap);
        assert_eq!(manager.tracked_sessions(), 0);
        assert!(!manager.is_any_busy("s1"));
    }

    #[test]
    fn test_concurrent_try_start_single_winner() {
        let manager = Arc::new(ProcessingStateManager::new());

        for _ in 0..200 {
            let wins = Arc::new(AtomicUsize::new(0));
            let mut handles = Vec::new();

            for _ in 0..16 {
                let manager = manager.clone();
                let wins = wins.clone();
                handles.push(std::thread::spawn(move || {
                    if manager.try_start("s1", OperationKind::Summary) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                }));
            }
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(wins.load(Ordering::SeqCst), 1);
            manager.stop("s1", OperationKind::Summary);
        }

        assert_eq!(manager.tracked_sessions(), 0);
    }

    #[test]
    fn test_slot_guard_releases_on_drop() {
        let manager = ProcessingStateManager::new();

        {
            let guard = SlotGuard::claim(&manager, "s1", OperationKind::Summary);
            assert!(guard.is_some());
            assert!(manager.is_busy("s1", OperationKind::Summary));
            assert!(SlotGuard::claim(&manager, "s1", OperationKind::Summary).is_none());
        }

        assert!(!manager.is_busy("s1", OperationKind::Summary));
        assert_eq!(manager.tracked_sessions(), 0);
    }
}
