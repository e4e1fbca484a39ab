//! View lifecycle: which subscriptions are open, and for whom.
//!
//! A view is a dashboard screen whose data the engine keeps live. Activating
//! a view sources the current user once, opens one subscription per stream
//! the view needs and starts the bulk loads. Deactivating closes every
//! subscription it opened, whether or not the loads have resolved.

mod active;
mod manager;
mod plan;

pub use active::ActiveView;
pub use manager::ViewManager;
pub use plan::{plan_for, StreamPlan};

use crate::error::EngineError;
use crate::reconcile::LoadReport;
use crate::session::ConflictReport;
use crate::subscriptions::DropReason;
use crate::types::{EntityId, Source, UserId};
use std::fmt;

/// Identity of a view.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ViewKey {
    /// The current user's invoices.
    InvoiceList,
    /// One invoice, with an edit session on its extracted fields.
    InvoiceDetail(EntityId),
    /// System and integration log tails.
    SystemStatus,
    /// Extraction field configuration.
    FieldSettings,
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewKey::InvoiceList => f.write_str("invoice-list"),
            ViewKey::InvoiceDetail(id) => write!(f, "invoice-{}", id),
            ViewKey::SystemStatus => f.write_str("system-status"),
            ViewKey::FieldSettings => f.write_str("field-settings"),
        }
    }
}

/// Explicit per-activation context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewContext {
    pub user: UserId,
    /// Distinguishes this activation from earlier ones of the same view.
    pub generation: u64,
}

/// Whether a view receives live events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewMode {
    Live,
    /// At least one stream is not live; data only changes on refresh.
    FetchOnly,
}

/// Something the presentation layer should know about.
#[derive(Clone, Debug)]
pub enum ViewNotice {
    /// A bulk load was applied.
    Loaded { source: Source, report: LoadReport },
    /// A bulk load failed.
    FetchFailed(EngineError),
    /// A stream could not be opened or stopped delivering.
    StreamLost { source: Source, reason: StreamLoss },
    /// A remote update collided with unsaved local edits.
    Conflict(ConflictReport),
    /// The entity under edit was deleted remotely.
    EntityRemoved(EntityId),
}

/// Why a stream stopped.
#[derive(Clone, Debug)]
pub enum StreamLoss {
    OpenFailed(EngineError),
    Dropped(DropReason),
}

/// What one dispatch pass did.
#[derive(Clone, Debug, Default)]
pub struct DispatchSummary {
    /// Change events applied to stores.
    pub events: usize,
    /// Bulk loads applied.
    pub loads: usize,
    /// Non-fatal errors (protocol violations, fetch failures).
    pub errors: Vec<EngineError>,
}

impl DispatchSummary {
    pub fn is_idle(&self) -> bool {
        self.events == 0 && self.loads == 0 && self.errors.is_empty()
    }

    fn absorb(&mut self, other: DispatchSummary) {
        self.events += other.events;
        self.loads += other.loads;
        self.errors.extend(other.errors);
    }
}
