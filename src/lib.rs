//! # Docket
//!
//! A real-time change-stream reconciliation engine for a record-review
//! dashboard. It keeps in-memory views of remote tables consistent with the
//! mutations streamed from them.
//!
//! ## Core Concepts
//!
//! - **Keyed stores**: one entry per entity, most recent insert first
//! - **Log buffers**: bounded, append-only tails, oldest evicted
//! - **Reconciler**: applies each change event to the store bound to its table
//! - **Edit sessions**: local working copies that never lose unsaved edits
//! - **Views**: own their subscriptions from activation to deactivation
//!
//! ## Example
//!
//! ```ignore
//! use docket::{Engine, EngineConfig, ViewKey};
//!
//! let engine = Engine::new(EngineConfig::default(), collaborators)?;
//!
//! let view = engine.activate(ViewKey::InvoiceList)?;
//! view.wait_for_loads(Duration::from_secs(5));
//!
//! loop {
//!     let summary = view.dispatch_timeout(Duration::from_millis(250));
//!     if !summary.is_idle() {
//!         render(view.invoices());
//!     }
//! }
//!
//! engine.deactivate(&ViewKey::InvoiceList);
//! ```

pub mod collaborators;
pub mod collections;
pub mod config;
pub mod engine;
pub mod entities;
pub mod error;
pub mod reconcile;
pub mod session;
pub mod subscriptions;
pub mod types;
pub mod upload;
pub mod views;

// Re-exports
pub use collaborators::{
    AuthProvider, BulkFetch, Collaborators, CommitSink, FetchRequest, OrderBy, UploadClient,
};
pub use collections::{ApplyOutcome, KeyedStore, LogBuffer};
pub use config::EngineConfig;
pub use engine::Engine;
pub use entities::{
    FieldConfiguration, FieldType, IntegrationLogEntry, Invoice, InvoiceStatus, LogEntry,
};
pub use error::{EngineError, Result};
pub use reconcile::{ChangeTarget, LoadReport, LoadTicket, Reconciled, Reconciler};
pub use session::{
    CommitRequest, ConflictReport, EditSession, EditState, RemoteOutcome, Resolution,
};
pub use subscriptions::{
    ChangeFeed, DropReason, FeedMessage, RowPredicate, SubscriptionConfig, SubscriptionFilter,
    SubscriptionHandle, SubscriptionId, SubscriptionManager,
};
pub use types::{ChangeEvent, ChangeKind, Entity, EntityId, FieldValue, Payload, Source, UserId};
pub use upload::{Document, UploadReceipt, UploadStatus, UploadSummary};
pub use views::{
    ActiveView, DispatchSummary, StreamLoss, ViewContext, ViewKey, ViewManager, ViewMode,
    ViewNotice,
};
