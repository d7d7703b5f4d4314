use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::errors::SyncResult;
use crate::models::{Actor, Item, NotificationRecord, Person, RoutedMessage, ScopeFilter};
use crate::remote::RemoteStore;

const NOTIFICATIONS: &str = "notifications";

#[async_trait]
pub trait RosterProvider: Send + Sync {
    async fn roster(&self, scope: &ScopeFilter) -> SyncResult<Vec<Person>>;
}

#[async_trait]
pub trait NotificationRouter: Send + Sync {
    async fn route(&self, item: &Item, roster: &[Person]) -> SyncResult<Vec<RoutedMessage>>;
}

/// Writes notification records for a freshly created item. Two stages run in
/// order: a deterministic assignment notification for the responsible person,
/// then router-proposed recipients. The submitter never receives either kind
/// and each recipient gets at most one record per item. Every failure in here
/// is logged and swallowed; dispatch never disturbs the item write path.
#[derive(Clone)]
pub struct Dispatcher {
    remote: Arc<dyn RemoteStore>,
    roster: Arc<dyn RosterProvider>,
    router: Arc<dyn NotificationRouter>,
    scope: ScopeFilter,
}

impl Dispatcher {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        roster: Arc<dyn RosterProvider>,
        router: Arc<dyn NotificationRouter>,
        scope: ScopeFilter,
    ) -> Self {
        Self {
            remote,
            roster,
            router,
            scope,
        }
    }

    pub fn spawn_dispatch(&self, item: Item, submitter: Actor) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(&item, &submitter).await;
        });
    }

    pub async fn dispatch(&self, item: &Item, submitter: &Actor) {
        let Some(remote_id) = item.id.as_remote() else {
            tracing::warn!(id = %item.id, "dispatch requested before the durable id exists");
            return;
        };
        let item_id = remote_id.as_str().to_string();
        let mut written: HashSet<String> = HashSet::new();

        if let Some(responsible) = &item.responsible_person_uid {
            if responsible != &submitter.uid {
                let record = NotificationRecord {
                    recipient_id: responsible.clone(),
                    item_id: item_id.clone(),
                    item_type: item.kind(),
                    scope_id: item.scope_id.clone(),
                    message: format!(
                        "You have been assigned responsibility for {}",
                        item.reference_id
                    ),
                    is_read: false,
                    created_at: Utc::now(),
                };
                match self.write(&record).await {
                    Ok(()) => {
                        written.insert(responsible.clone());
                    }
                    Err(error) => {
                        tracing::warn!(
                            recipient = %responsible,
                            item_id = %item_id,
                            error = %error,
                            "assignment notification failed"
                        );
                    }
                }
            }
        }

        if !submitter.ai_enabled {
            return;
        }
        let roster = match self.roster.roster(&self.scope).await {
            Ok(roster) => roster,
            Err(error) => {
                tracing::warn!(item_id = %item_id, error = %error, "roster lookup failed; skipping smart routing");
                return;
            }
        };
        let routed = match self.router.route(item, &roster).await {
            Ok(routed) => routed,
            Err(error) => {
                tracing::warn!(item_id = %item_id, error = %error, "notification routing failed");
                return;
            }
        };
        for message in routed {
            if message.recipient_id == submitter.uid {
                continue;
            }
            if !written.insert(message.recipient_id.clone()) {
                continue;
            }
            let record = NotificationRecord {
                recipient_id: message.recipient_id.clone(),
                item_id: item_id.clone(),
                item_type: item.kind(),
                scope_id: item.scope_id.clone(),
                message: message.message,
                is_read: false,
                created_at: Utc::now(),
            };
            if let Err(error) = self.write(&record).await {
                tracing::warn!(
                    recipient = %message.recipient_id,
                    item_id = %item_id,
                    error = %error,
                    "routed notification failed"
                );
            }
        }
    }

    async fn write(&self, record: &NotificationRecord) -> SyncResult<()> {
        let fields = serde_json::to_value(record)?;
        self.remote.create(NOTIFICATIONS, fields).await?;
        Ok(())
    }
}
