//! Offline-tolerant synchronization engine for field safety records:
//! observations, inspections, and permits to work. A scope is opened against a
//! remote document store; reads are answered from a local merged cache fed by
//! change streams, and writes apply locally first and settle in the background.

mod analysis;
mod dispatch;
mod engine;
mod errors;
mod models;
mod mutation;
pub mod remote;
mod store;
pub mod telemetry;

pub use analysis::{AnalysisOrchestrator, Analyzer};
pub use dispatch::{Dispatcher, NotificationRouter, RosterProvider};
pub use engine::{ScopeServices, SyncConfig, SyncCore};
pub use errors::{SyncError, SyncResult};
pub use models::{
    Actor, AiResult, AiStatus, InspectionDetails, InspectionStatus, Item, ItemDetails, ItemDraft,
    ItemId, ItemKind, ItemSetSnapshot, LocalId, LocalPhoto, NotificationRecord,
    ObservationDetails, ObservationStatus, OptimisticState, PermitDetails, PermitStatus, Person,
    PhotoRef, RemoteId, RoutedMessage, ScopeFilter, StoreEvent, SyncSettings,
};
pub use mutation::{MutationManager, PendingSubmit, PendingWrite};
pub use store::ItemStore;
