use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::SyncResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemKind {
    Observation,
    Inspection,
    PermitToWork,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Observation => "observation",
            Self::Inspection => "inspection",
            Self::PermitToWork => "permit-to-work",
        }
    }

    pub fn collection(self) -> &'static str {
        match self {
            Self::Observation => "observations",
            Self::Inspection => "inspections",
            Self::PermitToWork => "permits",
        }
    }

    pub fn reference_prefix(self) -> &'static str {
        match self {
            Self::Observation => "OBS",
            Self::Inspection => "INS",
            Self::PermitToWork => "PTW",
        }
    }

    pub fn all() -> [ItemKind; 3] {
        [Self::Observation, Self::Inspection, Self::PermitToWork]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalId(Uuid);

impl LocalId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// A placeholder carries a Local id until the durable create returns; reconciliation
// swaps it for the Remote id exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemId {
    Local(LocalId),
    Remote(RemoteId),
}

impl ItemId {
    pub fn new_local() -> Self {
        Self::Local(LocalId::new())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn as_remote(&self) -> Option<&RemoteId> {
        match self {
            Self::Remote(id) => Some(id),
            Self::Local(_) => None,
        }
    }
}

impl From<RemoteId> for ItemId {
    fn from(value: RemoteId) -> Self {
        Self::Remote(value)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => id.fmt(f),
            Self::Remote(id) => id.fmt(f),
        }
    }
}

// ─── Statuses ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObservationStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl ObservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InspectionStatus {
    #[default]
    Scheduled,
    Passed,
    Failed,
}

impl InspectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Passed => "passed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermitStatus {
    #[default]
    Requested,
    Approved,
    Closed,
}

impl PermitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Approved => "approved",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AiStatus {
    #[default]
    NotApplicable,
    Processing,
    Completed,
    Failed,
}

impl AiStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotApplicable => "not-applicable",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimisticState {
    Uploading,
    Reconciled,
}

impl OptimisticState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Reconciled => "reconciled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AiResult {
    pub summary: String,
    pub risks: Vec<String>,
    pub suggested_actions: Vec<String>,
}

impl AiResult {
    pub fn is_substantive(&self) -> bool {
        !self.summary.trim().is_empty()
            || !self.risks.is_empty()
            || !self.suggested_actions.is_empty()
    }
}

// ─── Item ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalPhoto {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    pub data_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PhotoRef {
    Preview(LocalPhoto),
    Uploaded { url: String },
}

impl PhotoRef {
    pub fn uploaded_url(&self) -> Option<&str> {
        match self {
            Self::Uploaded { url } => Some(url),
            Self::Preview(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ObservationDetails {
    pub findings: String,
    pub company: String,
    pub location: String,
    pub status: ObservationStatus,
    pub action_taken: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InspectionDetails {
    pub equipment_name: String,
    pub equipment_id: String,
    pub location: String,
    pub notes: Option<String>,
    pub status: InspectionStatus,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PermitDetails {
    pub contractor: String,
    pub work_description: String,
    pub valid_from: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
    pub status: PermitStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemDetails {
    Observation(ObservationDetails),
    Inspection(InspectionDetails),
    PermitToWork(PermitDetails),
}

impl ItemDetails {
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::Observation(_) => ItemKind::Observation,
            Self::Inspection(_) => ItemKind::Inspection,
            Self::PermitToWork(_) => ItemKind::PermitToWork,
        }
    }

    pub fn status_label(&self) -> &'static str {
        match self {
            Self::Observation(details) => details.status.as_str(),
            Self::Inspection(details) => details.status.as_str(),
            Self::PermitToWork(details) => details.status.as_str(),
        }
    }

    /// Raw text handed to the analyzer; composed from the variant's content fields.
    pub fn content_text(&self) -> String {
        match self {
            Self::Observation(details) => format!(
                "Observation at {} ({}): {}",
                details.location, details.company, details.findings
            ),
            Self::Inspection(details) => {
                let mut text = format!(
                    "Inspection of {} [{}] at {}",
                    details.equipment_name, details.equipment_id, details.location
                );
                if let Some(notes) = &details.notes {
                    text.push_str(": ");
                    text.push_str(notes);
                }
                text
            }
            Self::PermitToWork(details) => format!(
                "Permit to work for {}: {}",
                details.contractor, details.work_description
            ),
        }
    }

    /// Applies the terminal status for the kind and returns only the wire
    /// fields it changed, ready to patch into the durable document.
    pub fn mark_completed(&mut self, note: Option<String>) -> serde_json::Value {
        match self {
            Self::Observation(details) => {
                details.status = ObservationStatus::Completed;
                let mut delta = serde_json::json!({ "status": details.status.as_str() });
                if let Some(note) = note {
                    delta["actionTaken"] = serde_json::json!(&note);
                    details.action_taken = Some(note);
                }
                delta
            }
            Self::Inspection(details) => {
                details.status = InspectionStatus::Passed;
                let mut delta = serde_json::json!({ "status": details.status.as_str() });
                if let Some(note) = note {
                    delta["notes"] = serde_json::json!(&note);
                    details.notes = Some(note);
                }
                delta
            }
            Self::PermitToWork(details) => {
                details.status = PermitStatus::Closed;
                serde_json::json!({ "status": details.status.as_str() })
            }
        }
    }

    /// The variant's fields as a flat JSON object, ready to merge into a document.
    pub fn fields(&self) -> SyncResult<serde_json::Value> {
        let fields = match self {
            Self::Observation(details) => serde_json::to_value(details)?,
            Self::Inspection(details) => serde_json::to_value(details)?,
            Self::PermitToWork(details) => serde_json::to_value(details)?,
        };
        Ok(fields)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    pub reference_id: String,
    pub date: DateTime<Utc>,
    pub scope_id: String,
    pub submitted_by: String,
    pub submitter_name: String,
    pub responsible_person_uid: Option<String>,
    pub photo: Option<PhotoRef>,
    pub ai_status: AiStatus,
    pub ai_result: Option<AiResult>,
    pub optimistic_state: Option<OptimisticState>,
    pub details: ItemDetails,
}

impl Item {
    pub fn kind(&self) -> ItemKind {
        self.details.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDraft {
    pub date: DateTime<Utc>,
    pub details: ItemDetails,
    pub photo: Option<LocalPhoto>,
    pub responsible_person_uid: Option<String>,
}

// ─── Wire documents ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeDoc {
    reference_id: String,
    date: DateTime<Utc>,
    #[serde(default)]
    scope_id: String,
    #[serde(default)]
    submitted_by: String,
    #[serde(default)]
    submitter_name: String,
    #[serde(default)]
    responsible_person_uid: Option<String>,
    #[serde(default)]
    photo_url: Option<String>,
    #[serde(default)]
    ai_status: Option<AiStatus>,
    #[serde(default)]
    ai_result: Option<AiResult>,
}

/// Flattens an item into the document shape stored remotely. The collection name
/// implies the kind, so no type tag is written; `optimisticState` never leaves the
/// process.
pub fn document_fields(item: &Item) -> SyncResult<serde_json::Value> {
    let mut doc = serde_json::json!({
        "referenceId": item.reference_id,
        "date": item.date,
        "scopeId": item.scope_id,
        "submittedBy": item.submitted_by,
        "submitterName": item.submitter_name,
    });
    if let Some(uid) = &item.responsible_person_uid {
        doc["responsiblePersonUid"] = serde_json::json!(uid);
    }
    if let Some(url) = item.photo.as_ref().and_then(PhotoRef::uploaded_url) {
        doc["photoUrl"] = serde_json::json!(url);
    }
    if item.ai_status != AiStatus::NotApplicable {
        doc["aiStatus"] = serde_json::to_value(item.ai_status)?;
    }
    if let Some(result) = &item.ai_result {
        doc["aiResult"] = serde_json::to_value(result)?;
    }
    merge_fields(&mut doc, item.details.fields()?);
    Ok(doc)
}

pub fn item_from_document(
    kind: ItemKind,
    id: RemoteId,
    doc: &serde_json::Value,
) -> SyncResult<Item> {
    let envelope: EnvelopeDoc = serde_json::from_value(doc.clone())?;
    let details = match kind {
        ItemKind::Observation => ItemDetails::Observation(serde_json::from_value(doc.clone())?),
        ItemKind::Inspection => ItemDetails::Inspection(serde_json::from_value(doc.clone())?),
        ItemKind::PermitToWork => ItemDetails::PermitToWork(serde_json::from_value(doc.clone())?),
    };
    Ok(Item {
        id: ItemId::Remote(id),
        reference_id: envelope.reference_id,
        date: envelope.date,
        scope_id: envelope.scope_id,
        submitted_by: envelope.submitted_by,
        submitter_name: envelope.submitter_name,
        responsible_person_uid: envelope.responsible_person_uid,
        photo: envelope.photo_url.map(|url| PhotoRef::Uploaded { url }),
        ai_status: envelope.ai_status.unwrap_or_default(),
        ai_result: envelope.ai_result,
        optimistic_state: None,
        details,
    })
}

pub fn merge_fields(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_fields(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

const REFERENCE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Client-generated human-readable reference: kind prefix, short date code, random
/// suffix. Assigned once at submission and never reassigned.
pub fn new_reference_id(kind: ItemKind, date: DateTime<Utc>) -> String {
    let suffix: String = (0..4)
        .map(|_| {
            let idx = rand::random_range(0..REFERENCE_ALPHABET.len());
            REFERENCE_ALPHABET[idx] as char
        })
        .collect();
    format!("{}-{}-{}", kind.reference_prefix(), date.format("%y%m%d"), suffix)
}

// ─── Scope, people, notifications ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeFilter {
    Project { project_id: String },
    Private { owner_uid: String },
    Public,
}

impl ScopeFilter {
    pub fn scope_id(&self) -> String {
        match self {
            Self::Project { project_id } => project_id.clone(),
            Self::Private { owner_uid } => format!("private:{owner_uid}"),
            Self::Public => "public".to_string(),
        }
    }

    pub fn matches(&self, doc: &serde_json::Value) -> bool {
        doc.get("scopeId").and_then(serde_json::Value::as_str)
            == Some(self.scope_id().as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub uid: String,
    pub display_name: String,
    pub ai_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    pub uid: String,
    pub display_name: String,
    pub role: String,
    pub company: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutedMessage {
    pub recipient_id: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub recipient_id: String,
    pub item_id: String,
    pub item_type: ItemKind,
    pub scope_id: String,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

// ─── Snapshots and settings ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemSetSnapshot {
    pub revision: u64,
    pub items: Vec<Item>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreEvent {
    Snapshot(ItemSetSnapshot),
    SubscriptionLost { kind: ItemKind, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncSettings {
    pub analysis_timeout_ms: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            analysis_timeout_ms: 30_000,
        }
    }
}

impl SyncSettings {
    pub fn analysis_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.analysis_timeout_ms)
    }
}
