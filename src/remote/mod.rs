pub mod memory;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::SyncResult;
use crate::models::{LocalPhoto, RemoteId, ScopeFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Removed => "removed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub id: RemoteId,
    pub doc: serde_json::Value,
}

/// Server-ordered feed for one collection. An `Err` element means the
/// subscription broke; the sender closes the channel afterwards.
pub type ChangeStream = mpsc::UnboundedReceiver<SyncResult<ChangeEvent>>;

#[async_trait]
pub trait RemoteStore: Send + Sync {
    fn subscribe(&self, collection: &str, scope: &ScopeFilter) -> SyncResult<ChangeStream>;
    async fn create(&self, collection: &str, fields: serde_json::Value) -> SyncResult<RemoteId>;
    async fn patch(
        &self,
        collection: &str,
        id: &RemoteId,
        fields: serde_json::Value,
    ) -> SyncResult<()>;
    async fn delete(&self, collection: &str, id: &RemoteId) -> SyncResult<()>;
}

#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    /// Uploads the binary and returns the durable asset URL.
    async fn upload(&self, photo: &LocalPhoto) -> SyncResult<String>;
}
