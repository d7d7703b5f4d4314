use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::analysis::{AnalysisOrchestrator, Analyzer};
use crate::dispatch::{Dispatcher, NotificationRouter, RosterProvider};
use crate::errors::{SyncError, SyncResult};
use crate::models::{
    Actor, Item, ItemDetails, ItemDraft, ItemId, ItemSetSnapshot, ScopeFilter, StoreEvent,
    SyncSettings,
};
use crate::mutation::{MutationManager, PendingSubmit, PendingWrite};
use crate::remote::{AttachmentUploader, RemoteStore};
use crate::store::ItemStore;

/// Collaborators the host application provides when opening a scope.
pub struct ScopeServices {
    pub analyzer: Arc<dyn Analyzer>,
    pub roster: Arc<dyn RosterProvider>,
    pub router: Arc<dyn NotificationRouter>,
    pub uploader: Option<Arc<dyn AttachmentUploader>>,
}

/// Session parameters for one open scope.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub scope: ScopeFilter,
    pub actor: Actor,
    pub settings: SyncSettings,
}

/// One live scope: the synchronized item set plus every mutation and
/// background pipeline hanging off it. Reads are served locally; writes go
/// through the optimistic path. After `close` all mutations are rejected and
/// no further snapshots are published.
pub struct SyncCore {
    store: Arc<ItemStore>,
    mutations: MutationManager,
    analysis: AnalysisOrchestrator,
    closed: AtomicBool,
}

impl SyncCore {
    pub fn open(
        remote: Arc<dyn RemoteStore>,
        services: ScopeServices,
        config: SyncConfig,
    ) -> SyncResult<(Arc<Self>, mpsc::UnboundedReceiver<StoreEvent>)> {
        let (store, events) = ItemStore::open(&remote, config.scope.clone())?;
        let analysis = AnalysisOrchestrator::new(
            services.analyzer,
            Arc::clone(&remote),
            Arc::clone(&store),
            config.settings.analysis_timeout(),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&remote),
            services.roster,
            services.router,
            config.scope.clone(),
        );
        let mutations = MutationManager::new(
            remote,
            Arc::clone(&store),
            services.uploader,
            analysis.clone(),
            dispatcher,
            config.actor.clone(),
        );
        tracing::info!(
            scope = %config.scope.scope_id(),
            actor = %config.actor.uid,
            "sync core opened"
        );
        let core = Arc::new(Self {
            store,
            mutations,
            analysis,
            closed: AtomicBool::new(false),
        });
        Ok((core, events))
    }

    pub fn submit(&self, draft: ItemDraft) -> SyncResult<PendingSubmit> {
        self.ensure_open()?;
        validate_draft(&draft)?;
        self.mutations.submit(draft)
    }

    pub fn mark_completed(&self, id: &ItemId, note: Option<String>) -> SyncResult<PendingWrite> {
        self.ensure_open()?;
        self.mutations.mark_completed(id, note)
    }

    pub fn delete(&self, id: &ItemId) -> SyncResult<PendingWrite> {
        self.ensure_open()?;
        self.mutations.delete(id)
    }

    pub async fn retry_analysis(&self, id: &ItemId) -> SyncResult<()> {
        self.ensure_open()?;
        self.analysis.retry(id).await
    }

    pub fn snapshot(&self) -> ItemSetSnapshot {
        self.store.snapshot()
    }

    pub fn get(&self, id: &ItemId) -> Option<Item> {
        self.store.get(id)
    }

    pub fn find_by_reference(&self, reference_id: &str) -> Option<Item> {
        self.store.find_by_reference(reference_id)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.store.close();
        tracing::info!("sync core closed");
    }

    fn ensure_open(&self) -> SyncResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::Rejected("sync core is closed".to_string()));
        }
        Ok(())
    }
}

impl Drop for SyncCore {
    fn drop(&mut self) {
        self.close();
    }
}

/// Drafts whose primary content field is blank never leave the process.
fn validate_draft(draft: &ItemDraft) -> SyncResult<()> {
    let blank = match &draft.details {
        ItemDetails::Observation(details) => details.findings.trim().is_empty(),
        ItemDetails::Inspection(details) => details.equipment_name.trim().is_empty(),
        ItemDetails::PermitToWork(details) => details.work_description.trim().is_empty(),
    };
    if blank {
        return Err(SyncError::Rejected(format!(
            "a {} needs its primary content field filled in",
            draft.details.kind().as_str()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AiResult, InspectionDetails, ObservationDetails, PermitDetails, Person, RoutedMessage,
    };
    use crate::remote::memory::MemoryRemoteStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    struct NoopAnalyzer;

    #[async_trait]
    impl Analyzer for NoopAnalyzer {
        async fn analyze(&self, _raw_text: &str) -> SyncResult<AiResult> {
            Ok(AiResult::default())
        }
    }

    struct NoopRoster;

    #[async_trait]
    impl RosterProvider for NoopRoster {
        async fn roster(&self, _scope: &ScopeFilter) -> SyncResult<Vec<Person>> {
            Ok(Vec::new())
        }
    }

    struct NoopRouter;

    #[async_trait]
    impl NotificationRouter for NoopRouter {
        async fn route(
            &self,
            _item: &Item,
            _roster: &[Person],
        ) -> SyncResult<Vec<RoutedMessage>> {
            Ok(Vec::new())
        }
    }

    fn services() -> ScopeServices {
        ScopeServices {
            analyzer: Arc::new(NoopAnalyzer),
            roster: Arc::new(NoopRoster),
            router: Arc::new(NoopRouter),
            uploader: None,
        }
    }

    fn config() -> SyncConfig {
        SyncConfig {
            scope: ScopeFilter::Project {
                project_id: "p-1".to_string(),
            },
            actor: Actor {
                uid: "u-1".to_string(),
                display_name: "Sam Birch".to_string(),
                ai_enabled: false,
            },
            settings: SyncSettings::default(),
        }
    }

    fn observation_draft(findings: &str) -> ItemDraft {
        ItemDraft {
            date: Utc::now(),
            details: ItemDetails::Observation(ObservationDetails {
                findings: findings.to_string(),
                ..Default::default()
            }),
            photo: None,
            responsible_person_uid: None,
        }
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

    #[tokio::test]
    async fn submit_settles_into_a_durable_snapshot() {
        let memory = Arc::new(MemoryRemoteStore::new());
        let (core, _events) =
            SyncCore::open(memory.clone(), services(), config()).expect("open");

        let pending = core
            .submit(observation_draft("Exposed conveyor belt"))
            .expect("submit");
        let reference_id = pending.reference_id.clone();
        let remote_id = pending.wait().await.expect("durable write");

        let id = ItemId::Remote(remote_id);
        wait_until(|| core.get(&id).is_some()).await;
        assert_eq!(core.snapshot().items.len(), 1);
        let found = core.find_by_reference(&reference_id).expect("by reference");
        assert_eq!(found.id, id);
    }

    #[tokio::test]
    async fn blank_primary_content_is_rejected_per_kind() {
        let memory = Arc::new(MemoryRemoteStore::new());
        let (core, _events) =
            SyncCore::open(memory.clone(), services(), config()).expect("open");

        let blank_observation = observation_draft("   ");
        let blank_inspection = ItemDraft {
            date: Utc::now(),
            details: ItemDetails::Inspection(InspectionDetails::default()),
            photo: None,
            responsible_person_uid: None,
        };
        let blank_permit = ItemDraft {
            date: Utc::now(),
            details: ItemDetails::PermitToWork(PermitDetails::default()),
            photo: None,
            responsible_person_uid: None,
        };
        for draft in [blank_observation, blank_inspection, blank_permit] {
            let error = core.submit(draft).expect_err("must reject blanks");
            assert!(matches!(error, SyncError::Rejected(_)));
        }
        assert!(core.snapshot().items.is_empty());
    }

    #[tokio::test]
    async fn closed_core_rejects_every_mutation() {
        let memory = Arc::new(MemoryRemoteStore::new());
        let (core, _events) =
            SyncCore::open(memory.clone(), services(), config()).expect("open");
        core.close();

        let error = core
            .submit(observation_draft("Exposed conveyor belt"))
            .expect_err("closed");
        assert!(matches!(error, SyncError::Rejected(_)));

        let id = ItemId::new_local();
        assert!(core.mark_completed(&id, None).is_err());
        assert!(core.delete(&id).is_err());
        assert!(core.retry_analysis(&id).await.is_err());

        // Reads still answer from the last local state.
        assert!(core.snapshot().items.is_empty());
    }
}
