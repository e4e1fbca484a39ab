//! Boundaries to the systems the engine depends on but does not implement.

use crate::error::Result;
use crate::session::CommitRequest;
use crate::subscriptions::{ChangeFeed, RowPredicate};
use crate::types::{Source, UserId};
use crate::upload::{Document, UploadReceipt};
use std::sync::Arc;

/// Supplies the authenticated user, if any.
pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<UserId>;
}

/// Sort order of a bulk fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderBy {
    /// Newest rows first; the order every watched view is loaded in.
    pub fn newest_first() -> Self {
        Self {
            column: "created_at".to_string(),
            descending: true,
        }
    }
}

/// Parameters of an initial bulk load.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub source: Source,
    pub predicate: RowPredicate,
    pub order_by: OrderBy,
    /// Maximum rows (None = all).
    pub limit: Option<usize>,
}

impl FetchRequest {
    pub fn new(source: Source, predicate: RowPredicate) -> Self {
        Self {
            source,
            predicate,
            order_by: OrderBy::newest_first(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Loads the initial, ordered batch of rows for a view.
///
/// Implementations may block; the engine calls this off the consumer thread.
/// Failures should be reported as [`EngineError::Fetch`](crate::EngineError::Fetch).
pub trait BulkFetch: Send + Sync {
    fn fetch(&self, request: &FetchRequest) -> Result<Vec<serde_json::Value>>;
}

/// Persists an edit session's staged copy.
///
/// Failures should be reported as [`EngineError::Commit`](crate::EngineError::Commit).
pub trait CommitSink: Send + Sync {
    fn commit(&self, request: &CommitRequest) -> Result<()>;
}

/// Transfers documents to the extraction pipeline.
pub trait UploadClient: Send + Sync {
    fn upload(&self, owner: &UserId, documents: &[Document]) -> Result<Vec<UploadReceipt>>;
}

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub auth: Arc<dyn AuthProvider>,
    pub feed: Arc<dyn ChangeFeed>,
    pub fetcher: Arc<dyn BulkFetch>,
    pub committer: Arc<dyn CommitSink>,
    /// Absent when the host does not upload through the engine.
    pub uploader: Option<Arc<dyn UploadClient>>,
}
