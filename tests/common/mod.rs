//! Test doubles for the engine's collaborators.

#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver, Sender};
use docket::{
    AuthProvider, BulkFetch, ChangeFeed, Collaborators, CommitRequest, CommitSink, Document,
    EngineError, FetchRequest, Result, Source, SubscriptionConfig, SubscriptionHandle,
    SubscriptionId, SubscriptionManager, UploadClient, UploadReceipt, UploadStatus, UserId,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub const USER: &str = "user-1";

/// Install a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub struct FixedAuth(pub Mutex<Option<UserId>>);

impl FixedAuth {
    pub fn signed_in(user: &str) -> Arc<Self> {
        Arc::new(Self(Mutex::new(Some(UserId::new(user)))))
    }

    pub fn signed_out() -> Arc<Self> {
        Arc::new(Self(Mutex::new(None)))
    }

    pub fn sign_out(&self) {
        *self.0.lock() = None;
    }
}

impl AuthProvider for FixedAuth {
    fn current_user(&self) -> Option<UserId> {
        self.0.lock().clone()
    }
}

/// Serves rows per source, filtered and limited like the remote would.
///
/// When gated, every fetch blocks until [`release`](Self::release) is called
/// once for it.
pub struct ScriptedFetch {
    rows: Mutex<HashMap<Source, Vec<Value>>>,
    failures: Mutex<HashMap<Source, String>>,
    requests: Mutex<Vec<FetchRequest>>,
    gate: Option<(Sender<()>, Receiver<()>)>,
    started: (Sender<Source>, Receiver<Source>),
}

impl ScriptedFetch {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(false))
    }

    pub fn gated() -> Arc<Self> {
        Arc::new(Self::build(true))
    }

    fn build(gated: bool) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            gate: if gated { Some(unbounded()) } else { None },
            started: unbounded(),
        }
    }

    pub fn set_rows(&self, source: Source, rows: Vec<Value>) {
        self.rows.lock().insert(source, rows);
    }

    pub fn fail(&self, source: Source, message: &str) {
        self.failures.lock().insert(source, message.to_string());
    }

    /// Let one blocked fetch proceed.
    pub fn release(&self) {
        if let Some((tx, _)) = &self.gate {
            let _ = tx.send(());
        }
    }

    /// Block until a fetch has started (and, if gated, is waiting).
    pub fn wait_started(&self) -> Source {
        self.started
            .1
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("fetch never started")
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }
}

impl BulkFetch for ScriptedFetch {
    fn fetch(&self, request: &FetchRequest) -> Result<Vec<Value>> {
        self.requests.lock().push(request.clone());
        let _ = self.started.0.send(request.source);
        if let Some((_, rx)) = &self.gate {
            let _ = rx.recv();
        }

        if let Some(message) = self.failures.lock().get(&request.source) {
            return Err(EngineError::Fetch {
                table: request.source,
                message: message.clone(),
            });
        }

        let rows = self.rows.lock().get(&request.source).cloned().unwrap_or_default();
        let mut matching: Vec<Value> = rows
            .into_iter()
            .filter(|row| request.predicate.matches(row))
            .collect();
        if let Some(limit) = request.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

/// Records commits and answers them from a script (default: success).
#[derive(Default)]
pub struct ScriptedCommit {
    pub requests: Mutex<Vec<CommitRequest>>,
    results: Mutex<VecDeque<Result<()>>>,
}

impl ScriptedCommit {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, message: &str, key: &str) {
        self.results.lock().push_back(Err(EngineError::Commit {
            key: key.into(),
            message: message.to_string(),
        }));
    }
}

impl CommitSink for ScriptedCommit {
    fn commit(&self, request: &CommitRequest) -> Result<()> {
        self.requests.lock().push(request.clone());
        self.results.lock().pop_front().unwrap_or(Ok(()))
    }
}

/// A feed that refuses every subscription.
pub struct RefusingFeed;

impl ChangeFeed for RefusingFeed {
    fn open(&self, config: SubscriptionConfig) -> Result<SubscriptionHandle> {
        Err(EngineError::Subscription {
            table: config.source,
            message: "realtime unavailable".to_string(),
        })
    }

    fn close(&self, _id: SubscriptionId) -> bool {
        false
    }
}

/// Accepts every document whose name does not contain "bad".
#[derive(Default)]
pub struct RecordingUpload {
    pub batches: Mutex<Vec<(UserId, Vec<String>)>>,
}

impl UploadClient for RecordingUpload {
    fn upload(&self, owner: &UserId, documents: &[Document]) -> Result<Vec<UploadReceipt>> {
        let names: Vec<String> = documents.iter().map(|d| d.name.clone()).collect();
        self.batches.lock().push((owner.clone(), names.clone()));
        Ok(names
            .into_iter()
            .map(|file_name| UploadReceipt {
                status: if file_name.contains("bad") {
                    UploadStatus::Rejected {
                        code: "unreadable".to_string(),
                    }
                } else {
                    UploadStatus::Pending
                },
                file_name,
            })
            .collect())
    }
}

/// Everything a test needs to drive an engine.
pub struct Harness {
    pub auth: Arc<FixedAuth>,
    pub feed: Arc<SubscriptionManager>,
    pub fetch: Arc<ScriptedFetch>,
    pub commit: Arc<ScriptedCommit>,
    pub upload: Arc<RecordingUpload>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_fetch(ScriptedFetch::new())
    }

    pub fn gated() -> Self {
        Self::with_fetch(ScriptedFetch::gated())
    }

    fn with_fetch(fetch: Arc<ScriptedFetch>) -> Self {
        init_tracing();
        Self {
            auth: FixedAuth::signed_in(USER),
            feed: Arc::new(SubscriptionManager::new()),
            fetch,
            commit: ScriptedCommit::new(),
            upload: Arc::new(RecordingUpload::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            auth: self.auth.clone(),
            feed: self.feed.clone(),
            fetcher: self.fetch.clone(),
            committer: self.commit.clone(),
            uploader: Some(self.upload.clone()),
        }
    }
}

pub fn invoice_row(id: &str, status: &str, data: Value) -> Value {
    json!({
        "id": id,
        "user_id": USER,
        "file_path": format!("{}/{}.png", USER, id),
        "status": status,
        "extracted_data": data,
        "confidence_scores": {},
        "validation_errors": null,
        "created_at": "2024-05-01T10:00:00Z"
    })
}

pub fn log_row(id: &str, message: &str) -> Value {
    json!({
        "id": id,
        "invoice_id": null,
        "log_type": "info",
        "message": message,
        "log_metadata": {},
        "created_at": "2024-05-01T10:00:00Z"
    })
}

pub fn integration_row(id: &str, status_code: u16) -> Value {
    json!({
        "id": id,
        "invoice_id": "inv-1",
        "request_payload": {"invoice": "inv-1"},
        "response_payload": null,
        "status_code": status_code,
        "error_message": null,
        "created_at": "2024-05-01T10:00:00Z"
    })
}
