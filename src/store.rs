use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::errors::{SyncError, SyncResult};
use crate::models::{
    item_from_document, merge_fields, Item, ItemId, ItemKind, ItemSetSnapshot, RemoteId,
    ScopeFilter, StoreEvent,
};
use crate::remote::{ChangeEvent, ChangeKind, ChangeStream, RemoteStore};

/// Canonical in-memory collection for one scope. One pump task per item kind
/// feeds the kind buffers; every applied change republishes the merged snapshot,
/// ordered by date descending. Mutated only by the pump tasks and by the
/// mutation manager's insert/retract/reconcile calls.
pub struct ItemStore {
    state: Arc<Mutex<StoreState>>,
    events: mpsc::UnboundedSender<StoreEvent>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    scope: ScopeFilter,
}

#[derive(Default)]
struct StoreState {
    kinds: HashMap<ItemKind, HashMap<ItemId, Slot>>,
    index: HashMap<ItemId, ItemKind>,
    // durable id -> placeholder id, registered by the mutation manager once the
    // create returns, so the echo removes the placeholder even if the manager's
    // own swap never ran.
    pending_durable: HashMap<RemoteId, ItemId>,
    // partial `modified` payloads seen before their `added`; merged once the
    // full document arrives.
    staged: HashMap<RemoteId, serde_json::Value>,
    changes: u64,
    revision: u64,
    closed: bool,
}

struct Slot {
    item: Item,
    doc: serde_json::Value,
    change: u64,
}

impl ItemStore {
    /// Opens one change stream per item kind and starts the pump tasks. Returns
    /// the store handle and the consumer event stream.
    pub fn open(
        remote: &Arc<dyn RemoteStore>,
        scope: ScopeFilter,
    ) -> SyncResult<(Arc<Self>, mpsc::UnboundedReceiver<StoreEvent>)> {
        let mut streams: Vec<(ItemKind, ChangeStream)> = Vec::new();
        for kind in ItemKind::all() {
            streams.push((kind, remote.subscribe(kind.collection(), &scope)?));
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(StoreState::default()));
        let pumps = streams
            .into_iter()
            .map(|(kind, stream)| spawn_pump(kind, stream, Arc::clone(&state), events_tx.clone()))
            .collect();
        let store = Arc::new(Self {
            state,
            events: events_tx,
            pumps: Mutex::new(pumps),
            scope,
        });
        Ok((store, events_rx))
    }

    pub fn scope(&self) -> &ScopeFilter {
        &self.scope
    }

    pub fn snapshot(&self) -> ItemSetSnapshot {
        assemble(&self.lock())
    }

    pub fn get(&self, id: &ItemId) -> Option<Item> {
        let state = self.lock();
        let kind = state.index.get(id)?;
        state
            .kinds
            .get(kind)
            .and_then(|buffer| buffer.get(id))
            .map(|slot| slot.item.clone())
    }

    pub fn find_by_reference(&self, reference_id: &str) -> Option<Item> {
        let state = self.lock();
        state
            .kinds
            .values()
            .flat_map(|buffer| buffer.values())
            .find(|slot| slot.item.reference_id == reference_id)
            .map(|slot| slot.item.clone())
    }

    /// Synchronous optimistic insert; the caller sees the placeholder in the
    /// very next snapshot.
    pub fn insert_placeholder(&self, item: Item) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        upsert(&mut state, item.id.clone(), item, serde_json::Value::Null);
        publish(&mut state, &self.events);
    }

    /// Rollback for a failed submission. Clears any durable-id mapping that
    /// pointed at the placeholder.
    pub fn retract_placeholder(&self, id: &ItemId) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.pending_durable.retain(|_, placeholder| placeholder != id);
        if remove_entry(&mut state, id) {
            publish(&mut state, &self.events);
        }
    }

    /// Registers the durable id for a placeholder so the confirming change event
    /// removes it even if `reconcile_placeholder` never runs.
    pub fn note_durable(&self, placeholder: &ItemId, durable: &RemoteId) {
        let mut state = self.lock();
        state
            .pending_durable
            .insert(durable.clone(), placeholder.clone());
    }

    /// Immediate placeholder swap once the durable id is known. If the echo
    /// already landed, the authoritative entry is kept untouched.
    pub fn reconcile_placeholder(&self, placeholder: &ItemId, durable: Item) {
        let Some(remote_id) = durable.id.as_remote().cloned() else {
            tracing::warn!(id = %durable.id, "reconcile called without a durable id");
            return;
        };
        let mut state = self.lock();
        if state.closed {
            return;
        }
        remove_entry(&mut state, placeholder);
        state.pending_durable.remove(&remote_id);
        let id = ItemId::Remote(remote_id);
        if !state.index.contains_key(&id) {
            let doc = crate::models::document_fields(&durable)
                .unwrap_or(serde_json::Value::Null);
            upsert(&mut state, id, durable, doc);
        }
        publish(&mut state, &self.events);
    }

    /// Eager local write for the update-in-place path. Returns the pre-mutation
    /// item and the change stamp of the eager write, for a later
    /// `restore_unless_changed`.
    pub fn apply_local_update(
        &self,
        id: &ItemId,
        update: impl FnOnce(&mut Item),
    ) -> SyncResult<(Item, u64)> {
        let mut state = self.lock();
        if state.closed {
            return Err(SyncError::Rejected("store is closed".to_string()));
        }
        state.changes += 1;
        let stamp = state.changes;
        let kind = *state
            .index
            .get(id)
            .ok_or_else(|| SyncError::NotFound(format!("item {id}")))?;
        let slot = state
            .kinds
            .get_mut(&kind)
            .and_then(|buffer| buffer.get_mut(id))
            .ok_or_else(|| SyncError::NotFound(format!("item {id}")))?;
        let previous = slot.item.clone();
        update(&mut slot.item);
        slot.change = stamp;
        publish(&mut state, &self.events);
        Ok((previous, stamp))
    }

    /// Revert after a failed durable patch. Skipped when a newer change (remote
    /// echo or another update) already landed on the entry.
    pub fn restore_unless_changed(&self, id: &ItemId, previous: Item, stamp: u64) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        let Some(kind) = state.index.get(id).copied() else {
            return;
        };
        let current = state
            .kinds
            .get(&kind)
            .and_then(|buffer| buffer.get(id))
            .map(|slot| slot.change);
        if current != Some(stamp) {
            return;
        }
        state.changes += 1;
        let change = state.changes;
        if let Some(slot) = state
            .kinds
            .get_mut(&kind)
            .and_then(|buffer| buffer.get_mut(id))
        {
            slot.item = previous;
            slot.change = change;
        }
        publish(&mut state, &self.events);
    }

    /// Synchronously stops all pump tasks; no store mutation or event can be
    /// observed from them afterwards. In-flight optimistic writes finish against
    /// a closed store as silent no-ops.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
        }
        let handles = match self.pumps.lock() {
            Ok(mut pumps) => std::mem::take(&mut *pumps),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in &handles {
            handle.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ItemStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_pump(
    kind: ItemKind,
    mut stream: ChangeStream,
    state: Arc<Mutex<StoreState>>,
    events: mpsc::UnboundedSender<StoreEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            match event {
                Ok(change) => apply_change(kind, change, &state, &events),
                Err(error) => {
                    tracing::warn!(kind = kind.as_str(), error = %error, "change stream failed");
                    let _ = events.send(StoreEvent::SubscriptionLost {
                        kind,
                        message: error.to_string(),
                    });
                    return;
                }
            }
        }
        let closed = state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed;
        if !closed {
            tracing::warn!(kind = kind.as_str(), "change stream closed unexpectedly");
            let _ = events.send(StoreEvent::SubscriptionLost {
                kind,
                message: "change stream closed".to_string(),
            });
        }
    })
}

fn apply_change(
    kind: ItemKind,
    change: ChangeEvent,
    state: &Arc<Mutex<StoreState>>,
    events: &mpsc::UnboundedSender<StoreEvent>,
) {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if state.closed {
        return;
    }
    match change.kind {
        ChangeKind::Added | ChangeKind::Modified => {
            if let Some(placeholder) = state.pending_durable.remove(&change.id) {
                remove_entry(&mut state, &placeholder);
            }
            let id = ItemId::Remote(change.id.clone());
            let doc = match materialize(&mut state, kind, &id, &change) {
                Some(doc) => doc,
                None => return,
            };
            match item_from_document(kind, change.id.clone(), &doc) {
                Ok(item) => {
                    upsert(&mut state, id, item, doc);
                    publish(&mut state, events);
                }
                Err(error) if change.kind == ChangeKind::Modified
                    && !state.index.contains_key(&id) =>
                {
                    // Partial payload ahead of its `added`; stage it until the
                    // full document arrives.
                    tracing::debug!(
                        kind = kind.as_str(),
                        id = %change.id,
                        error = %error,
                        "staging early modified payload"
                    );
                    state.staged.insert(change.id.clone(), change.doc.clone());
                }
                Err(error) => {
                    tracing::warn!(
                        kind = kind.as_str(),
                        id = %change.id,
                        error = %error,
                        "skipping malformed document"
                    );
                }
            }
        }
        ChangeKind::Removed => {
            if let Some(placeholder) = state.pending_durable.remove(&change.id) {
                remove_entry(&mut state, &placeholder);
            }
            state.staged.remove(&change.id);
            let id = ItemId::Remote(change.id);
            if remove_entry(&mut state, &id) {
                publish(&mut state, events);
            }
        }
    }
}

/// Computes the document an upsert should materialize. A first-sight `added`
/// installs the document; a redelivered `added` only fills fields the merged
/// view lacks, so a replay never rolls back modifications already applied.
/// `modified` merges onto the known document so partial payloads compose.
/// Staged early payloads win over both.
fn materialize(
    state: &mut StoreState,
    kind: ItemKind,
    id: &ItemId,
    change: &ChangeEvent,
) -> Option<serde_json::Value> {
    let existing = state
        .index
        .get(id)
        .copied()
        .filter(|entry_kind| *entry_kind == kind)
        .and_then(|entry_kind| {
            state
                .kinds
                .get(&entry_kind)
                .and_then(|buffer| buffer.get(id))
        })
        .map(|slot| slot.doc.clone())
        // A `Null` doc is the placeholder sentinel, not mergeable state.
        .filter(|doc| !doc.is_null());
    match change.kind {
        ChangeKind::Added => {
            let mut doc = change.doc.clone();
            if let Some(existing) = existing {
                merge_fields(&mut doc, existing);
            }
            if let Some(staged) = state.staged.remove(&change.id) {
                merge_fields(&mut doc, staged);
            }
            Some(doc)
        }
        ChangeKind::Modified => match existing {
            Some(mut doc) => {
                merge_fields(&mut doc, change.doc.clone());
                Some(doc)
            }
            None => Some(change.doc.clone()),
        },
        ChangeKind::Removed => None,
    }
}

fn upsert(state: &mut StoreState, id: ItemId, item: Item, doc: serde_json::Value) {
    state.changes += 1;
    let change = state.changes;
    let kind = item.kind();
    state.index.insert(id.clone(), kind);
    state
        .kinds
        .entry(kind)
        .or_default()
        .insert(id, Slot { item, doc, change });
}

fn remove_entry(state: &mut StoreState, id: &ItemId) -> bool {
    match state.index.remove(id) {
        Some(kind) => state
            .kinds
            .get_mut(&kind)
            .and_then(|buffer| buffer.remove(id))
            .is_some(),
        None => false,
    }
}

fn assemble(state: &StoreState) -> ItemSetSnapshot {
    let mut slots: Vec<&Slot> = state
        .kinds
        .values()
        .flat_map(|buffer| buffer.values())
        .collect();
    // Date descending; equal dates keep observation order, most recent change last.
    slots.sort_by(|a, b| {
        b.item
            .date
            .cmp(&a.item.date)
            .then(a.change.cmp(&b.change))
    });
    ItemSetSnapshot {
        revision: state.revision,
        items: slots.into_iter().map(|slot| slot.item.clone()).collect(),
    }
}

fn publish(state: &mut StoreState, events: &mpsc::UnboundedSender<StoreEvent>) {
    state.revision += 1;
    let snapshot = assemble(state);
    let _ = events.send(StoreEvent::Snapshot(snapshot));
}
