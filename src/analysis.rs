use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use crate::errors::{SyncError, SyncResult};
use crate::models::{AiResult, AiStatus, Item, ItemId, RemoteId};
use crate::remote::RemoteStore;
use crate::store::ItemStore;

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, raw_text: &str) -> SyncResult<AiResult>;
}

/// Per-item analysis state machine. Runs detached from the primary write path;
/// outcomes land on the durable record as patches and reach the UI through the
/// ordinary change stream. Transitions are monotonic except the explicit retry
/// edge `Failed -> Processing`.
#[derive(Clone)]
pub struct AnalysisOrchestrator {
    analyzer: Arc<dyn Analyzer>,
    remote: Arc<dyn RemoteStore>,
    store: Arc<ItemStore>,
    analysis_timeout: Duration,
    in_flight: Arc<Mutex<HashSet<RemoteId>>>,
}

impl AnalysisOrchestrator {
    pub fn new(
        analyzer: Arc<dyn Analyzer>,
        remote: Arc<dyn RemoteStore>,
        store: Arc<ItemStore>,
        analysis_timeout: Duration,
    ) -> Self {
        Self {
            analyzer,
            remote,
            store,
            analysis_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Fire-and-forget initial run, scheduled right after the durable create.
    /// The record was created with `aiStatus = Processing`.
    pub fn spawn_initial(&self, item: Item) {
        let Some(remote_id) = item.id.as_remote().cloned() else {
            tracing::warn!(id = %item.id, "analysis requested before the durable id exists");
            return;
        };
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, remote_id.clone()) else {
            tracing::warn!(item_id = %remote_id, "analysis already in flight; skipping duplicate");
            return;
        };
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run(&remote_id, &item).await;
            drop(guard);
        });
    }

    /// Explicit user-triggered retry. Only `Failed` items are retryable and at
    /// most one retry per item may be in flight; violations are rejected here
    /// rather than trusted to the caller. The `Processing` patch is awaited so
    /// a transport failure surfaces before anything is scheduled.
    pub async fn retry(&self, id: &ItemId) -> SyncResult<()> {
        let item = self
            .store
            .get(id)
            .ok_or_else(|| SyncError::NotFound(format!("item {id}")))?;
        let Some(remote_id) = item.id.as_remote().cloned() else {
            return Err(SyncError::Rejected(
                "item is still uploading; analysis retry needs a durable record".to_string(),
            ));
        };
        if item.ai_status != AiStatus::Failed {
            return Err(SyncError::Rejected(format!(
                "analysis retry is only valid from the failed state (currently {})",
                item.ai_status.as_str()
            )));
        }
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, remote_id.clone()) else {
            return Err(SyncError::Rejected(
                "an analysis retry for this item is already in flight".to_string(),
            ));
        };

        self.remote
            .patch(
                item.kind().collection(),
                &remote_id,
                serde_json::json!({"aiStatus": AiStatus::Processing}),
            )
            .await?;
        tracing::info!(item_id = %remote_id, "analysis retry accepted");

        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run(&remote_id, &item).await;
            drop(guard);
        });
        Ok(())
    }

    async fn run(&self, remote_id: &RemoteId, item: &Item) {
        let collection = item.kind().collection();
        let outcome = timeout(
            self.analysis_timeout,
            self.analyzer.analyze(&item.details.content_text()),
        )
        .await;
        let patch = match outcome {
            Ok(Ok(result)) if result.is_substantive() => {
                tracing::debug!(item_id = %remote_id, "analysis completed");
                match serde_json::to_value(&result) {
                    Ok(result_fields) => serde_json::json!({
                        "aiStatus": AiStatus::Completed,
                        "aiResult": result_fields,
                    }),
                    Err(error) => {
                        tracing::warn!(item_id = %remote_id, error = %error, "analysis result not serializable");
                        serde_json::json!({"aiStatus": AiStatus::Failed})
                    }
                }
            }
            Ok(Ok(_)) => {
                tracing::warn!(item_id = %remote_id, "analysis returned an empty result");
                serde_json::json!({"aiStatus": AiStatus::Failed})
            }
            Ok(Err(error)) => {
                tracing::warn!(item_id = %remote_id, error = %error, "analysis failed");
                serde_json::json!({"aiStatus": AiStatus::Failed})
            }
            Err(_) => {
                tracing::warn!(item_id = %remote_id, "analysis timed out");
                serde_json::json!({"aiStatus": AiStatus::Failed})
            }
        };
        if let Err(error) = self.remote.patch(collection, remote_id, patch).await {
            tracing::warn!(item_id = %remote_id, error = %error, "failed to record analysis outcome");
        }
    }
}

struct InFlightGuard {
    set: Arc<Mutex<HashSet<RemoteId>>>,
    id: RemoteId,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<RemoteId>>>, id: RemoteId) -> Option<Self> {
        let mut entries = set.lock().unwrap_or_else(PoisonError::into_inner);
        if !entries.insert(id.clone()) {
            return None;
        }
        Some(Self {
            set: Arc::clone(set),
            id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        document_fields, AiResult, ItemDetails, ItemSetSnapshot, ObservationDetails, ScopeFilter,
        StoreEvent,
    };
    use crate::remote::memory::MemoryRemoteStore;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedAnalyzer {
        calls: AtomicUsize,
        outcomes: Vec<SyncResult<AiResult>>,
    }

    impl ScriptedAnalyzer {
        fn new(outcomes: Vec<SyncResult<AiResult>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                outcomes,
            }
        }
    }

    #[async_trait]
    impl Analyzer for ScriptedAnalyzer {
        async fn analyze(&self, _raw_text: &str) -> SyncResult<AiResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.outcomes.get(call) {
                Some(Ok(result)) => Ok(result.clone()),
                Some(Err(error)) => Err(SyncError::Analysis(error.to_string())),
                None => Err(SyncError::Analysis("unscripted call".to_string())),
            }
        }
    }

    struct HangingAnalyzer;

    #[async_trait]
    impl Analyzer for HangingAnalyzer {
        async fn analyze(&self, _raw_text: &str) -> SyncResult<AiResult> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(AiResult::default())
        }
    }

    fn scope() -> ScopeFilter {
        ScopeFilter::Project {
            project_id: "p-1".to_string(),
        }
    }

    fn substantive() -> AiResult {
        AiResult {
            summary: "Two pinch-point risks near the conveyor".to_string(),
            risks: vec!["Pinch point".to_string()],
            suggested_actions: vec!["Install guarding".to_string()],
        }
    }

    async fn seed_item(
        remote: &Arc<dyn RemoteStore>,
        store: &Arc<ItemStore>,
        ai_status: AiStatus,
    ) -> ItemId {
        let item = Item {
            id: ItemId::Remote(RemoteId::new("seed")),
            reference_id: "OBS-260601-TEST".to_string(),
            date: Utc::now(),
            scope_id: "p-1".to_string(),
            submitted_by: "u-1".to_string(),
            submitter_name: "Sam Birch".to_string(),
            responsible_person_uid: None,
            photo: None,
            ai_status,
            ai_result: None,
            optimistic_state: None,
            details: ItemDetails::Observation(ObservationDetails {
                findings: "Exposed conveyor belt".to_string(),
                company: "Acme".to_string(),
                location: "Line 4".to_string(),
                ..Default::default()
            }),
        };
        let fields = document_fields(&item).expect("fields");
        let remote_id = remote.create("observations", fields).await.expect("create");
        let id = ItemId::Remote(remote_id);
        wait_until(|| store.get(&id).is_some()).await;
        id
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within two seconds");
    }

    fn drain(events: &mut tokio::sync::mpsc::UnboundedReceiver<StoreEvent>) -> Vec<ItemSetSnapshot> {
        let mut snapshots = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let StoreEvent::Snapshot(snapshot) = event {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }

    #[tokio::test]
    async fn retry_moves_failed_item_through_processing_to_completed() {
        let memory = Arc::new(MemoryRemoteStore::new());
        let remote: Arc<dyn RemoteStore> = memory.clone();
        let (store, mut events) = ItemStore::open(&remote, scope()).expect("open");
        let id = seed_item(&remote, &store, AiStatus::Failed).await;

        let orchestrator = AnalysisOrchestrator::new(
            Arc::new(ScriptedAnalyzer::new(vec![Ok(substantive())])),
            remote.clone(),
            store.clone(),
            Duration::from_secs(5),
        );
        orchestrator.retry(&id).await.expect("retry accepted");

        wait_until(|| {
            store
                .get(&id)
                .map(|item| item.ai_status == AiStatus::Completed)
                .unwrap_or(false)
        })
        .await;
        let item = store.get(&id).expect("item");
        let result = item.ai_result.expect("result recorded");
        assert_eq!(result.summary, substantive().summary);

        // The observed status sequence stays within the allowed transitions.
        let mut statuses: Vec<AiStatus> = drain(&mut events)
            .into_iter()
            .filter_map(|snapshot| snapshot.items.first().map(|item| item.ai_status))
            .collect();
        statuses.dedup();
        assert!(statuses
            .windows(2)
            .all(|pair| matches!(
                (pair[0], pair[1]),
                (AiStatus::Failed, AiStatus::Processing)
                    | (AiStatus::Processing, AiStatus::Completed)
            )));
    }

    #[tokio::test]
    async fn failed_analysis_patches_status_only() {
        let memory = Arc::new(MemoryRemoteStore::new());
        let remote: Arc<dyn RemoteStore> = memory.clone();
        let (store, _events) = ItemStore::open(&remote, scope()).expect("open");
        let id = seed_item(&remote, &store, AiStatus::Failed).await;

        let orchestrator = AnalysisOrchestrator::new(
            Arc::new(ScriptedAnalyzer::new(vec![Err(SyncError::Analysis(
                "model unavailable".to_string(),
            ))])),
            remote.clone(),
            store.clone(),
            Duration::from_secs(5),
        );
        orchestrator.retry(&id).await.expect("retry accepted");

        wait_until(|| {
            store
                .get(&id)
                .map(|item| item.ai_status == AiStatus::Failed)
                .unwrap_or(false)
        })
        .await;
        let item = store.get(&id).expect("item");
        assert_eq!(item.ai_status, AiStatus::Failed);
        assert!(item.ai_result.is_none(), "failure must not set result fields");
    }

    #[tokio::test]
    async fn empty_result_counts_as_failure() {
        let memory = Arc::new(MemoryRemoteStore::new());
        let remote: Arc<dyn RemoteStore> = memory.clone();
        let (store, _events) = ItemStore::open(&remote, scope()).expect("open");
        let id = seed_item(&remote, &store, AiStatus::Failed).await;

        let orchestrator = AnalysisOrchestrator::new(
            Arc::new(ScriptedAnalyzer::new(vec![Ok(AiResult::default())])),
            remote.clone(),
            store.clone(),
            Duration::from_secs(5),
        );
        orchestrator.retry(&id).await.expect("retry accepted");
        wait_until(|| {
            store
                .get(&id)
                .map(|item| item.ai_status == AiStatus::Failed && item.ai_result.is_none())
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn timeout_records_failure() {
        let memory = Arc::new(MemoryRemoteStore::new());
        let remote: Arc<dyn RemoteStore> = memory.clone();
        let (store, _events) = ItemStore::open(&remote, scope()).expect("open");
        let id = seed_item(&remote, &store, AiStatus::Failed).await;

        let orchestrator = AnalysisOrchestrator::new(
            Arc::new(HangingAnalyzer),
            remote.clone(),
            store.clone(),
            Duration::from_millis(20),
        );
        orchestrator.retry(&id).await.expect("retry accepted");
        wait_until(|| {
            store
                .get(&id)
                .map(|item| item.ai_status == AiStatus::Failed)
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn retry_rejected_unless_failed() {
        let memory = Arc::new(MemoryRemoteStore::new());
        let remote: Arc<dyn RemoteStore> = memory.clone();
        let (store, _events) = ItemStore::open(&remote, scope()).expect("open");
        let id = seed_item(&remote, &store, AiStatus::Processing).await;

        let orchestrator = AnalysisOrchestrator::new(
            Arc::new(ScriptedAnalyzer::new(Vec::new())),
            remote.clone(),
            store.clone(),
            Duration::from_secs(5),
        );
        let error = orchestrator.retry(&id).await.expect_err("must reject");
        assert!(matches!(error, SyncError::Rejected(_)));

        let missing = ItemId::Remote(RemoteId::new("nope"));
        let error = orchestrator.retry(&missing).await.expect_err("must reject");
        assert!(matches!(error, SyncError::NotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_retry_is_rejected_while_in_flight() {
        let memory = Arc::new(MemoryRemoteStore::new());
        let remote: Arc<dyn RemoteStore> = memory.clone();
        let (store, _events) = ItemStore::open(&remote, scope()).expect("open");
        let id = seed_item(&remote, &store, AiStatus::Failed).await;

        let orchestrator = AnalysisOrchestrator::new(
            Arc::new(HangingAnalyzer),
            remote.clone(),
            store.clone(),
            Duration::from_secs(3600),
        );
        orchestrator.retry(&id).await.expect("first retry accepted");

        // Whether or not the `processing` echo has landed yet, a second retry
        // must not start another run.
        let error = orchestrator.retry(&id).await.expect_err("second retry");
        assert!(matches!(error, SyncError::Rejected(_)));
    }
}
