use std::sync::Arc;

use chrono::Utc;
use tokio::sync::oneshot;

use crate::analysis::AnalysisOrchestrator;
use crate::dispatch::Dispatcher;
use crate::errors::{SyncError, SyncResult};
use crate::models::{
    document_fields, new_reference_id, Actor, AiStatus, Item, ItemDraft, ItemId, OptimisticState,
    PhotoRef, RemoteId,
};
use crate::remote::{AttachmentUploader, RemoteStore};
use crate::store::ItemStore;

/// Handle returned by `submit`. The placeholder is already visible in the
/// local store by the time the handle exists; `wait` resolves once the durable
/// write settled either way.
#[derive(Debug)]
pub struct PendingSubmit {
    pub item_id: ItemId,
    pub reference_id: String,
    outcome: oneshot::Receiver<SyncResult<RemoteId>>,
}

impl PendingSubmit {
    pub async fn wait(self) -> SyncResult<RemoteId> {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(SyncError::Internal("submission task dropped".to_string())))
    }
}

/// Handle for a mutation whose local effect is already applied. `wait` resolves
/// once the remote write settled.
#[derive(Debug)]
pub struct PendingWrite {
    outcome: oneshot::Receiver<SyncResult<()>>,
}

impl PendingWrite {
    pub async fn wait(self) -> SyncResult<()> {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(SyncError::Internal("write task dropped".to_string())))
    }
}

/// Entry point for user-initiated writes. Every mutation lands in the local
/// store first and settles against the remote store in a detached task, so
/// callers never wait on the network to see their own change.
#[derive(Clone)]
pub struct MutationManager {
    remote: Arc<dyn RemoteStore>,
    store: Arc<ItemStore>,
    uploader: Option<Arc<dyn AttachmentUploader>>,
    analysis: AnalysisOrchestrator,
    dispatcher: Dispatcher,
    actor: Actor,
}

impl MutationManager {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<ItemStore>,
        uploader: Option<Arc<dyn AttachmentUploader>>,
        analysis: AnalysisOrchestrator,
        dispatcher: Dispatcher,
        actor: Actor,
    ) -> Self {
        Self {
            remote,
            store,
            uploader,
            analysis,
            dispatcher,
            actor,
        }
    }

    /// Inserts a placeholder synchronously and schedules the durable write.
    /// The reference id on the returned handle is final; the item id is the
    /// placeholder's and is replaced by the remote id on reconciliation.
    pub fn submit(&self, draft: ItemDraft) -> SyncResult<PendingSubmit> {
        if draft.photo.is_some() && self.uploader.is_none() {
            return Err(SyncError::Rejected(
                "draft carries a photo but no attachment uploader is configured".to_string(),
            ));
        }
        let kind = draft.details.kind();
        let reference_id = new_reference_id(kind, Utc::now());
        let item_id = ItemId::new_local();
        let placeholder = Item {
            id: item_id.clone(),
            reference_id: reference_id.clone(),
            date: draft.date,
            scope_id: self.store.scope().scope_id(),
            submitted_by: self.actor.uid.clone(),
            submitter_name: self.actor.display_name.clone(),
            responsible_person_uid: draft.responsible_person_uid,
            photo: draft.photo.map(PhotoRef::Preview),
            ai_status: if self.actor.ai_enabled {
                AiStatus::Processing
            } else {
                AiStatus::NotApplicable
            },
            ai_result: None,
            optimistic_state: Some(OptimisticState::Uploading),
            details: draft.details,
        };
        self.store.insert_placeholder(placeholder.clone());
        tracing::info!(
            reference_id = %reference_id,
            kind = kind.as_str(),
            "item submitted; durable write scheduled"
        );

        let (tx, rx) = oneshot::channel();
        let manager = self.clone();
        tokio::spawn(async move {
            let result = manager.finish_submit(placeholder).await;
            let _ = tx.send(result);
        });
        Ok(PendingSubmit {
            item_id,
            reference_id,
            outcome: rx,
        })
    }

    async fn finish_submit(&self, placeholder: Item) -> SyncResult<RemoteId> {
        let local_id = placeholder.id.clone();
        match self.write_durable(placeholder).await {
            Ok(durable) => {
                let Some(remote_id) = durable.id.as_remote().cloned() else {
                    return Err(SyncError::Internal(
                        "durable item missing its remote id".to_string(),
                    ));
                };
                self.store.reconcile_placeholder(&local_id, durable.clone());
                if self.actor.ai_enabled {
                    self.analysis.spawn_initial(durable.clone());
                }
                self.dispatcher.spawn_dispatch(durable, self.actor.clone());
                Ok(remote_id)
            }
            Err(error) => {
                tracing::warn!(
                    id = %local_id,
                    error = %error,
                    "durable write failed; retracting placeholder"
                );
                self.store.retract_placeholder(&local_id);
                Err(error)
            }
        }
    }

    /// Uploads the photo if present, creates the remote document, and rebinds
    /// the item to its durable identity.
    async fn write_durable(&self, mut item: Item) -> SyncResult<Item> {
        if let Some(PhotoRef::Preview(photo)) = &item.photo {
            let uploader = self.uploader.as_ref().ok_or_else(|| {
                SyncError::Rejected("no attachment uploader configured".to_string())
            })?;
            let url = uploader.upload(photo).await?;
            item.photo = Some(PhotoRef::Uploaded { url });
        }
        let fields = document_fields(&item)?;
        let remote_id = self.remote.create(item.kind().collection(), fields).await?;
        // Registered before reconciliation so an eager echo drops the
        // placeholder instead of landing next to it.
        self.store.note_durable(&item.id, &remote_id);
        item.id = ItemId::Remote(remote_id);
        item.optimistic_state = Some(OptimisticState::Reconciled);
        Ok(item)
    }

    /// Applies the terminal status for the item's kind locally, then patches
    /// just the changed fields on the durable record. A failed patch restores
    /// the pre-update state unless a newer change already landed.
    pub fn mark_completed(&self, id: &ItemId, note: Option<String>) -> SyncResult<PendingWrite> {
        let item = self
            .store
            .get(id)
            .ok_or_else(|| SyncError::NotFound(format!("item {id}")))?;
        let Some(remote_id) = item.id.as_remote().cloned() else {
            return Err(SyncError::Rejected(
                "item is still uploading; completion needs a durable record".to_string(),
            ));
        };
        let mut details = item.details.clone();
        let fields = details.mark_completed(note);
        let (previous, stamp) = self.store.apply_local_update(id, {
            let details = details.clone();
            move |item| item.details = details
        })?;

        let (tx, rx) = oneshot::channel();
        let manager = self.clone();
        let id = id.clone();
        let collection = item.kind().collection();
        tokio::spawn(async move {
            match manager.remote.patch(collection, &remote_id, fields).await {
                Ok(()) => {
                    let _ = tx.send(Ok(()));
                }
                Err(error) => {
                    tracing::warn!(
                        id = %id,
                        error = %error,
                        "completion patch failed; restoring previous state"
                    );
                    manager.store.restore_unless_changed(&id, previous, stamp);
                    let _ = tx.send(Err(error));
                }
            }
        });
        Ok(PendingWrite { outcome: rx })
    }

    /// Removes a durable item. The remote delete runs detached and the local
    /// entry disappears when the confirming `removed` event arrives, so the
    /// entry never vanishes ahead of the remote truth. Items still uploading
    /// are rejected: until the pending create settles there is no durable
    /// record to delete, and a local retraction would not survive it.
    pub fn delete(&self, id: &ItemId) -> SyncResult<PendingWrite> {
        let item = self
            .store
            .get(id)
            .ok_or_else(|| SyncError::NotFound(format!("item {id}")))?;
        let Some(remote_id) = item.id.as_remote().cloned() else {
            return Err(SyncError::Rejected(
                "item is still uploading; deletion needs a durable record".to_string(),
            ));
        };
        let remote = Arc::clone(&self.remote);
        let collection = item.kind().collection();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = remote.delete(collection, &remote_id).await;
            if let Err(error) = &result {
                tracing::warn!(
                    item_id = %remote_id,
                    error = %error,
                    "delete failed; item stays visible"
                );
            }
            let _ = tx.send(result);
        });
        Ok(PendingWrite { outcome: rx })
    }
}
