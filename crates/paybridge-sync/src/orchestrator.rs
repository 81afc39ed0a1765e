//! Payment sync orchestrator: walks the persisted id list, fetches each
//! record from the source, and upserts it locally. One bad id never aborts
//! the batch; failures land on the problem list and the run continues.

use std::collections::HashSet;

use anyhow::Context;
use paybridge_core::{ExternalId, ProblemEntry, ProgressStatus, SyncSummary};
use paybridge_records::map_payment;
use paybridge_source::RecordSource;
use tracing::{debug, warn};

use crate::progress::ProgressTracker;
use crate::store::BridgeStore;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub object_type: String,
    /// Clear the id list after a run that completed without a setup
    /// failure.
    pub clear_list_after: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            object_type: "payment".to_string(),
            clear_list_after: false,
        }
    }
}

/// Run one sync pass over the persisted id list. A failure to load the
/// list aborts the run; everything after that is per-item isolated.
/// Exactly one progress increment is recorded per processed id.
pub async fn run_payment_sync(
    source: &dyn RecordSource,
    store: &dyn BridgeStore,
    tracker: &ProgressTracker,
    session_id: &str,
    options: &SyncOptions,
) -> anyhow::Result<SyncSummary> {
    // Register the session before the list load so pollers can see a
    // failed setup as a failed session rather than a missing one.
    tracker.create(session_id, 0).await;

    let ids = store
        .load_id_list()
        .await
        .context("loading the sync id list")?;
    tracker.create(session_id, ids.len()).await;

    let mut summary = SyncSummary::default();
    let mut seen: HashSet<ExternalId> = HashSet::with_capacity(ids.len());

    for id in &ids {
        if !seen.insert(id.clone()) {
            summary.skipped += 1;
            tracker.advance(session_id, 1, 0).await;
            continue;
        }

        match sync_one(source, store, &options.object_type, id).await {
            Ok(()) => {
                summary.updated += 1;
                tracker.advance(session_id, 1, 0).await;
            }
            Err(reason) => {
                let entry = ProblemEntry::new(id.clone(), reason);
                if let Err(error) = store.append_problem(&entry).await {
                    warn!(id = %entry.id, %error, "failed to record sync problem");
                }
                summary.errored += 1;
                summary.problems.push(entry);
                tracker.advance(session_id, 1, 1).await;
            }
        }
    }

    if options.clear_list_after {
        store
            .clear_id_list()
            .await
            .context("clearing the sync id list")?;
    }

    tracker.finish(session_id, ProgressStatus::Completed).await;
    debug!(
        session_id,
        updated = summary.updated,
        skipped = summary.skipped,
        errored = summary.errored,
        "payment sync finished"
    );
    Ok(summary)
}

async fn sync_one(
    source: &dyn RecordSource,
    store: &dyn BridgeStore,
    object_type: &str,
    id: &ExternalId,
) -> Result<(), String> {
    let payload = source
        .fetch_object(object_type, id)
        .await
        .map_err(|error| format!("fetch failed: {error}"))?;
    let record = map_payment(id, &payload).map_err(|error| format!("map failed: {error}"))?;
    store
        .upsert_payment(&record)
        .await
        .map_err(|error| format!("upsert failed: {error}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemoryStore, ScriptedSource};
    use serde_json::json;

    fn payment_payload(id: &str, amount: f64) -> serde_json::Value {
        json!({ "_id": id, "Amount": amount, "Invoice": "inv-1" })
    }

    async fn seed_list(store: &MemoryStore, ids: &[&str]) {
        let ids: Vec<ExternalId> = ids.iter().copied().map(ExternalId::from).collect();
        store.save_id_list(&ids).await.expect("save list");
    }

    #[tokio::test]
    async fn one_failing_id_does_not_abort_the_batch() {
        let store = MemoryStore::new();
        seed_list(&store, &["p1", "p2", "p3", "p4", "p5"]).await;
        let source = ScriptedSource::new()
            .with_payload("p1", payment_payload("p1", 10.0))
            .with_payload("p2", payment_payload("p2", 20.0))
            .with_failure("p3")
            .with_payload("p4", payment_payload("p4", 40.0))
            .with_payload("p5", payment_payload("p5", 50.0));
        let tracker = ProgressTracker::new();

        let summary = run_payment_sync(&source, &store, &tracker, "s1", &SyncOptions::default())
            .await
            .expect("run");

        assert_eq!(summary.updated, 4);
        assert_eq!(summary.errored, 1);
        assert_eq!(summary.skipped, 0);

        let payments = store.payments();
        assert_eq!(payments.len(), 4);
        assert!(payments.contains_key("p1"));
        assert!(payments.contains_key("p4"));
        assert!(!payments.contains_key("p3"));

        let problems = store.problems();
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].id, ExternalId::from("p3"));
        assert!(problems[0].reason.contains("fetch failed"));

        let snapshot = tracker.get("s1").await.expect("session exists");
        assert_eq!(snapshot.processed, 5);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.status, ProgressStatus::Completed);
    }

    #[tokio::test]
    async fn rerunning_the_same_list_converges_to_the_same_state() {
        let store = MemoryStore::new();
        seed_list(&store, &["p1", "p2"]).await;
        let source = ScriptedSource::new()
            .with_payload("p1", payment_payload("p1", 10.0))
            .with_payload("p2", payment_payload("p2", 20.0));
        let tracker = ProgressTracker::new();

        let first = run_payment_sync(&source, &store, &tracker, "s1", &SyncOptions::default())
            .await
            .expect("first run");
        let after_first = store.payments();

        let second = run_payment_sync(&source, &store, &tracker, "s2", &SyncOptions::default())
            .await
            .expect("second run");
        let after_second = store.payments();

        assert_eq!(first.updated, 2);
        assert_eq!(second.updated, 2);
        assert_eq!(after_first, after_second);
        assert_eq!(after_second.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_ids_within_a_run_are_skipped() {
        let store = MemoryStore::new();
        seed_list(&store, &["p1", "p1", "p2"]).await;
        let source = ScriptedSource::new()
            .with_payload("p1", payment_payload("p1", 10.0))
            .with_payload("p2", payment_payload("p2", 20.0));
        let tracker = ProgressTracker::new();

        let summary = run_payment_sync(&source, &store, &tracker, "s1", &SyncOptions::default())
            .await
            .expect("run");

        assert_eq!(summary.updated, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.errored, 0);

        let snapshot = tracker.get("s1").await.expect("session exists");
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.processed, 3);
    }

    #[tokio::test]
    async fn malformed_payload_is_recorded_as_a_problem() {
        let store = MemoryStore::new();
        seed_list(&store, &["p1"]).await;
        let source =
            ScriptedSource::new().with_payload("p1", json!({ "_id": "p1", "Amount": "oops" }));
        let tracker = ProgressTracker::new();

        let summary = run_payment_sync(&source, &store, &tracker, "s1", &SyncOptions::default())
            .await
            .expect("run");

        assert_eq!(summary.errored, 1);
        assert!(store.payments().is_empty());
        assert!(store.problems()[0].reason.contains("map failed"));
    }

    #[tokio::test]
    async fn clear_list_after_empties_the_id_list() {
        let store = MemoryStore::new();
        seed_list(&store, &["p1"]).await;
        let source = ScriptedSource::new().with_payload("p1", payment_payload("p1", 10.0));
        let tracker = ProgressTracker::new();
        let options = SyncOptions {
            clear_list_after: true,
            ..Default::default()
        };

        run_payment_sync(&source, &store, &tracker, "s1", &options)
            .await
            .expect("run");

        assert!(store.load_id_list().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn empty_list_completes_with_zero_counts() {
        let store = MemoryStore::new();
        let source = ScriptedSource::new();
        let tracker = ProgressTracker::new();

        let summary = run_payment_sync(&source, &store, &tracker, "s1", &SyncOptions::default())
            .await
            .expect("run");

        assert_eq!(summary.updated, 0);
        assert_eq!(summary.errored, 0);
        let snapshot = tracker.get("s1").await.expect("session exists");
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.status, ProgressStatus::Completed);
    }
}
