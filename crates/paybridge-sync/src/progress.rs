//! Process-wide progress sessions for long-running operations. Counters
//! live in memory only; a restart forgets every session.

use std::collections::HashMap;
use std::sync::Arc;

use paybridge_core::{ProgressSnapshot, ProgressStatus};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy)]
struct ProgressState {
    total: usize,
    processed: usize,
    errors: usize,
    status: ProgressStatus,
}

/// Keyed session counters shared between background workers and pollers.
/// Cloning the tracker clones the handle, not the state; every advance is
/// a counter add under the lock, so concurrent workers lose no updates.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<Mutex<HashMap<String, ProgressState>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initialize (or re-initialize) a session with zeroed counters.
    pub async fn create(&self, session_id: &str, total: usize) {
        let mut sessions = self.inner.lock().await;
        sessions.insert(
            session_id.to_string(),
            ProgressState {
                total,
                processed: 0,
                errors: 0,
                status: ProgressStatus::Running,
            },
        );
    }

    /// Advance counters for a session. Unknown sessions are ignored.
    pub async fn advance(&self, session_id: &str, processed: usize, errors: usize) {
        let mut sessions = self.inner.lock().await;
        if let Some(state) = sessions.get_mut(session_id) {
            state.processed += processed;
            state.errors += errors;
        }
    }

    pub async fn finish(&self, session_id: &str, status: ProgressStatus) {
        let mut sessions = self.inner.lock().await;
        if let Some(state) = sessions.get_mut(session_id) {
            state.status = status;
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<ProgressSnapshot> {
        let sessions = self.inner.lock().await;
        sessions.get(session_id).map(|state| ProgressSnapshot {
            session_id: session_id.to_string(),
            total: state.total,
            processed: state.processed,
            errors: state.errors,
            status: state.status,
        })
    }

    /// Snapshot every live session, most-processed first. Used by the
    /// dashboard.
    pub async fn sessions(&self) -> Vec<ProgressSnapshot> {
        let sessions = self.inner.lock().await;
        let mut out: Vec<ProgressSnapshot> = sessions
            .iter()
            .map(|(session_id, state)| ProgressSnapshot {
                session_id: session_id.clone(),
                total: state.total,
                processed: state.processed,
                errors: state.errors,
                status: state.status,
            })
            .collect();
        out.sort_by(|a, b| b.processed.cmp(&a.processed).then(a.session_id.cmp(&b.session_id)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_zeroes_counters_and_get_snapshots() {
        let tracker = ProgressTracker::new();
        tracker.create("s1", 10).await;

        let snapshot = tracker.get("s1").await.expect("session exists");
        assert_eq!(snapshot.total, 10);
        assert_eq!(snapshot.processed, 0);
        assert_eq!(snapshot.errors, 0);
        assert_eq!(snapshot.status, ProgressStatus::Running);

        assert!(tracker.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn advance_accumulates_and_finish_marks_status() {
        let tracker = ProgressTracker::new();
        tracker.create("s1", 3).await;
        tracker.advance("s1", 1, 0).await;
        tracker.advance("s1", 1, 1).await;
        tracker.finish("s1", ProgressStatus::Completed).await;

        let snapshot = tracker.get("s1").await.expect("session exists");
        assert_eq!(snapshot.processed, 2);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.status, ProgressStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_advances_lose_no_updates() {
        let tracker = ProgressTracker::new();
        tracker.create("s1", 10).await;

        let mut handles = Vec::new();
        for _ in 0..10 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.advance("s1", 1, 0).await;
            }));
        }
        for handle in handles {
            handle.await.expect("task completes");
        }

        let snapshot = tracker.get("s1").await.expect("session exists");
        assert_eq!(snapshot.processed, 10);
    }

    #[tokio::test]
    async fn recreating_a_session_resets_it() {
        let tracker = ProgressTracker::new();
        tracker.create("s1", 5).await;
        tracker.advance("s1", 5, 2).await;
        tracker.create("s1", 7).await;

        let snapshot = tracker.get("s1").await.expect("session exists");
        assert_eq!(snapshot.total, 7);
        assert_eq!(snapshot.processed, 0);
        assert_eq!(snapshot.errors, 0);
    }
}
