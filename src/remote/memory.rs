use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{ChangeEvent, ChangeKind, ChangeStream, RemoteStore};
use crate::errors::{SyncError, SyncResult};
use crate::models::{merge_fields, RemoteId, ScopeFilter};

/// In-memory document store with live change feeds. Backs the test suite and
/// lets embedders run the engine without a real backend. Subscribing replays
/// every matching document as an `added` event; document ids are sequential so
/// assertions stay deterministic.
#[derive(Default)]
pub struct MemoryRemoteStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<String, serde_json::Value>>,
    subscribers: Vec<Subscriber>,
    next_doc: u64,
    fail_create: VecDeque<String>,
    fail_patch: VecDeque<String>,
    fail_delete: VecDeque<String>,
}

struct Subscriber {
    collection: String,
    scope: ScopeFilter,
    tx: mpsc::UnboundedSender<SyncResult<ChangeEvent>>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_create(&self, message: impl Into<String>) {
        self.lock().fail_create.push_back(message.into());
    }

    pub fn fail_next_patch(&self, message: impl Into<String>) {
        self.lock().fail_patch.push_back(message.into());
    }

    pub fn fail_next_delete(&self, message: impl Into<String>) {
        self.lock().fail_delete.push_back(message.into());
    }

    /// Feeds a synthetic event to every live subscription on `collection`
    /// without touching the stored documents or matching scopes. Lets tests
    /// exercise partial and out-of-order deliveries a real backend can produce.
    pub fn inject(&self, collection: &str, event: ChangeEvent) {
        let mut state = self.lock();
        state.subscribers.retain(|sub| {
            if sub.collection != collection {
                return true;
            }
            sub.tx.send(Ok(event.clone())).is_ok()
        });
    }

    /// Sends a transport error to every live subscription on `collection` and
    /// closes their streams.
    pub fn break_subscriptions(&self, collection: &str, message: impl Into<String>) {
        let message = message.into();
        let mut state = self.lock();
        state.subscribers.retain(|sub| {
            if sub.collection != collection {
                return true;
            }
            let _ = sub.tx.send(Err(SyncError::Transport(message.clone())));
            false
        });
    }

    pub fn document(&self, collection: &str, id: &RemoteId) -> Option<serde_json::Value> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id.as_str()))
            .cloned()
    }

    pub fn documents(&self, collection: &str) -> Vec<(RemoteId, serde_json::Value)> {
        self.lock()
            .collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, doc)| (RemoteId::new(id.clone()), doc.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn fan_out(
    state: &mut MemoryState,
    collection: &str,
    kind: ChangeKind,
    id: &RemoteId,
    doc: &serde_json::Value,
) {
    state.subscribers.retain(|sub| {
        if sub.collection != collection || !sub.scope.matches(doc) {
            return true;
        }
        sub.tx
            .send(Ok(ChangeEvent {
                kind,
                id: id.clone(),
                doc: doc.clone(),
            }))
            .is_ok()
    });
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    fn subscribe(&self, collection: &str, scope: &ScopeFilter) -> SyncResult<ChangeStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        if let Some(docs) = state.collections.get(collection) {
            for (id, doc) in docs {
                if scope.matches(doc) {
                    let _ = tx.send(Ok(ChangeEvent {
                        kind: ChangeKind::Added,
                        id: RemoteId::new(id.clone()),
                        doc: doc.clone(),
                    }));
                }
            }
        }
        state.subscribers.push(Subscriber {
            collection: collection.to_string(),
            scope: scope.clone(),
            tx,
        });
        Ok(rx)
    }

    async fn create(&self, collection: &str, fields: serde_json::Value) -> SyncResult<RemoteId> {
        let mut state = self.lock();
        if let Some(message) = state.fail_create.pop_front() {
            return Err(SyncError::Transport(message));
        }
        state.next_doc += 1;
        let id = RemoteId::new(format!("mem-{:06}", state.next_doc));
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.as_str().to_string(), fields.clone());
        fan_out(&mut state, collection, ChangeKind::Added, &id, &fields);
        Ok(id)
    }

    async fn patch(
        &self,
        collection: &str,
        id: &RemoteId,
        fields: serde_json::Value,
    ) -> SyncResult<()> {
        let mut state = self.lock();
        if let Some(message) = state.fail_patch.pop_front() {
            return Err(SyncError::Transport(message));
        }
        let doc = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id.as_str()))
            .ok_or_else(|| SyncError::NotFound(format!("{collection}/{id}")))?;
        merge_fields(doc, fields);
        let doc = doc.clone();
        fan_out(&mut state, collection, ChangeKind::Modified, id, &doc);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &RemoteId) -> SyncResult<()> {
        let mut state = self.lock();
        if let Some(message) = state.fail_delete.pop_front() {
            return Err(SyncError::Transport(message));
        }
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|docs| docs.remove(id.as_str()));
        if let Some(doc) = removed {
            fan_out(&mut state, collection, ChangeKind::Removed, id, &doc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ScopeFilter {
        ScopeFilter::Project {
            project_id: "p-1".to_string(),
        }
    }

    fn doc(scope_id: &str, findings: &str) -> serde_json::Value {
        serde_json::json!({"scopeId": scope_id, "findings": findings})
    }

    #[tokio::test]
    async fn subscribe_replays_matching_documents_as_added() {
        let store = MemoryRemoteStore::new();
        store
            .create("observations", doc("p-1", "a"))
            .await
            .expect("create");
        store
            .create("observations", doc("p-2", "other scope"))
            .await
            .expect("create");
        store
            .create("observations", doc("p-1", "b"))
            .await
            .expect("create");

        let mut stream = store.subscribe("observations", &scope()).expect("subscribe");
        let first = stream.recv().await.expect("event").expect("ok");
        let second = stream.recv().await.expect("event").expect("ok");
        assert_eq!(first.kind, ChangeKind::Added);
        assert_eq!(first.id.as_str(), "mem-000001");
        assert_eq!(second.doc["findings"], "b");
        assert!(stream.try_recv().is_err(), "out-of-scope doc must not replay");
    }

    #[tokio::test]
    async fn patch_merges_fields_and_emits_modified() {
        let store = MemoryRemoteStore::new();
        let id = store
            .create("observations", doc("p-1", "before"))
            .await
            .expect("create");
        let mut stream = store.subscribe("observations", &scope()).expect("subscribe");
        stream.recv().await.expect("replay").expect("ok");

        store
            .patch(
                "observations",
                &id,
                serde_json::json!({"findings": "after", "aiStatus": "failed"}),
            )
            .await
            .expect("patch");
        let event = stream.recv().await.expect("event").expect("ok");
        assert_eq!(event.kind, ChangeKind::Modified);
        assert_eq!(event.doc["findings"], "after");
        assert_eq!(event.doc["scopeId"], "p-1");
        assert_eq!(event.doc["aiStatus"], "failed");
    }

    #[tokio::test]
    async fn queued_failures_fire_once() {
        let store = MemoryRemoteStore::new();
        store.fail_next_create("offline");
        let err = store
            .create("observations", doc("p-1", "x"))
            .await
            .expect_err("queued failure");
        assert!(matches!(err, SyncError::Transport(_)));
        store
            .create("observations", doc("p-1", "x"))
            .await
            .expect("second create succeeds");
    }

    #[tokio::test]
    async fn break_subscriptions_errors_then_closes_stream() {
        let store = MemoryRemoteStore::new();
        let mut stream = store.subscribe("permits", &scope()).expect("subscribe");
        store.break_subscriptions("permits", "connection reset");
        let event = stream.recv().await.expect("error event");
        assert!(matches!(event, Err(SyncError::Transport(_))));
        assert!(stream.recv().await.is_none(), "stream closes after the error");
    }

    #[tokio::test]
    async fn injected_events_skip_storage_and_scope_matching() {
        let store = MemoryRemoteStore::new();
        let mut stream = store.subscribe("observations", &scope()).expect("subscribe");
        store.inject(
            "observations",
            ChangeEvent {
                kind: ChangeKind::Modified,
                id: RemoteId::new("ghost"),
                doc: serde_json::json!({"status": "completed"}),
            },
        );
        let event = stream.recv().await.expect("event").expect("ok");
        assert_eq!(event.kind, ChangeKind::Modified);
        assert_eq!(event.id.as_str(), "ghost");
        assert!(store.document("observations", &RemoteId::new("ghost")).is_none());
    }

    #[tokio::test]
    async fn delete_emits_removed_with_last_document() {
        let store = MemoryRemoteStore::new();
        let id = store
            .create("inspections", doc("p-1", "unused"))
            .await
            .expect("create");
        let mut stream = store.subscribe("inspections", &scope()).expect("subscribe");
        stream.recv().await.expect("replay").expect("ok");

        store.delete("inspections", &id).await.expect("delete");
        let event = stream.recv().await.expect("event").expect("ok");
        assert_eq!(event.kind, ChangeKind::Removed);
        assert_eq!(event.id, id);
        assert!(store.document("inspections", &id).is_none());
        store.delete("inspections", &id).await.expect("idempotent");
    }
}
