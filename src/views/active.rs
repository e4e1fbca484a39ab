//! One activation of a view: its subscriptions, stores and edit session.

use crate::collaborators::{BulkFetch, Collaborators, CommitSink, FetchRequest};
use crate::collections::{ApplyOutcome, KeyedStore, LogBuffer};
use crate::config::EngineConfig;
use crate::entities::{FieldConfiguration, IntegrationLogEntry, Invoice, LogEntry};
use crate::error::{EngineError, Result};
use crate::reconcile::{LoadTicket, Reconciled, Reconciler, Shared};
use crate::session::{EditSession, EditState, RemoteOutcome, Resolution};
use crate::subscriptions::{ChangeFeed, DropReason, FeedMessage, SubscriptionHandle, SubscriptionId};
use crate::types::{ChangeKind, EntityId, FieldValue, Source};
use crossbeam_channel::{unbounded, Receiver, Select, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::plan::StreamPlan;
use super::{DispatchSummary, StreamLoss, ViewContext, ViewKey, ViewMode, ViewNotice};

/// A resolved bulk fetch, handed back from the fetch thread.
struct LoadCompletion {
    ticket: LoadTicket,
    result: Result<Vec<serde_json::Value>>,
}

/// A planned stream and its subscription, if currently open.
struct Stream {
    plan: StreamPlan,
    handle: Option<SubscriptionHandle>,
}

/// Stores bound for this view, by source.
#[derive(Default)]
struct ViewStores {
    invoices: Option<Shared<KeyedStore<Invoice>>>,
    field_configurations: Option<Shared<KeyedStore<FieldConfiguration>>>,
    system_logs: Option<Shared<LogBuffer<LogEntry>>>,
    integration_logs: Option<Shared<LogBuffer<IntegrationLogEntry>>>,
}

impl ViewStores {
    fn bind(&mut self, source: Source, log_capacity: usize, reconciler: &mut Reconciler) {
        match source {
            Source::Invoices => {
                let store: Shared<KeyedStore<Invoice>> =
                    Arc::new(RwLock::new(KeyedStore::new()));
                reconciler.bind(source, Box::new(Arc::clone(&store)));
                self.invoices = Some(store);
            }
            Source::FieldConfigurations => {
                let store: Shared<KeyedStore<FieldConfiguration>> =
                    Arc::new(RwLock::new(KeyedStore::new()));
                reconciler.bind(source, Box::new(Arc::clone(&store)));
                self.field_configurations = Some(store);
            }
            Source::SystemLogs => {
                let buffer: Shared<LogBuffer<LogEntry>> =
                    Arc::new(RwLock::new(LogBuffer::new(log_capacity)));
                reconciler.bind(source, Box::new(Arc::clone(&buffer)));
                self.system_logs = Some(buffer);
            }
            Source::IntegrationLogs => {
                let buffer: Shared<LogBuffer<IntegrationLogEntry>> =
                    Arc::new(RwLock::new(LogBuffer::new(log_capacity)));
                reconciler.bind(source, Box::new(Arc::clone(&buffer)));
                self.integration_logs = Some(buffer);
            }
        }
    }
}

/// A live view.
///
/// All events and bulk loads of the view are applied by whichever thread
/// calls [`dispatch_pending`](Self::dispatch_pending) (or one of the waiting
/// variants), one at a time under the view's reconciler lock. Readers get
/// owned snapshots.
///
/// Lock order: streams, reconciler, session, notices.
pub struct ActiveView {
    key: ViewKey,
    context: ViewContext,
    feed: Arc<dyn ChangeFeed>,
    fetcher: Arc<dyn BulkFetch>,
    committer: Arc<dyn CommitSink>,
    fetch_thread_prefix: String,
    streams: Mutex<Vec<Stream>>,
    reconciler: Mutex<Reconciler>,
    stores: ViewStores,
    session: Mutex<Option<EditSession>>,
    notices: Mutex<Vec<ViewNotice>>,
    load_tx: Sender<LoadCompletion>,
    /// Taken on close so late fetch results have nowhere to go.
    load_rx: Mutex<Option<Receiver<LoadCompletion>>>,
    closed: AtomicBool,
}

impl ActiveView {
    /// Bind stores, open subscriptions and start the bulk loads.
    pub(crate) fn start(
        key: ViewKey,
        context: ViewContext,
        plans: Vec<StreamPlan>,
        collaborators: &Collaborators,
        config: &EngineConfig,
    ) -> Arc<Self> {
        let mut reconciler = Reconciler::with_journal_limit(config.subscription_buffer);
        let mut stores = ViewStores::default();
        let mut fetches = Vec::with_capacity(plans.len());
        for plan in &plans {
            stores.bind(plan.source(), config.log_capacity, &mut reconciler);
            if let Some(ticket) = reconciler.begin_load(plan.source()) {
                fetches.push((ticket, plan.fetch.clone()));
            }
        }

        let (load_tx, load_rx) = unbounded();
        let view = Arc::new(Self {
            key,
            context,
            feed: Arc::clone(&collaborators.feed),
            fetcher: Arc::clone(&collaborators.fetcher),
            committer: Arc::clone(&collaborators.committer),
            fetch_thread_prefix: config.fetch_thread_prefix.clone(),
            streams: Mutex::new(Vec::new()),
            reconciler: Mutex::new(reconciler),
            stores,
            session: Mutex::new(None),
            notices: Mutex::new(Vec::new()),
            load_tx,
            load_rx: Mutex::new(Some(load_rx)),
            closed: AtomicBool::new(false),
        });

        view.open_streams(plans);
        for (ticket, request) in fetches {
            view.spawn_fetch(ticket, request);
        }

        info!(
            view = %view.key,
            generation = view.context.generation,
            mode = ?view.mode(),
            "view activated"
        );
        view
    }

    /// Open one subscription per plan. Any failure drops the view to
    /// fetch-only: a view is either fully live or not live at all.
    fn open_streams(&self, plans: Vec<StreamPlan>) {
        let mut streams = self.streams.lock();
        let mut failure = None;

        for plan in plans {
            let handle = if failure.is_none() {
                match self.feed.open(plan.subscription.clone()) {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        failure = Some((plan.source(), e));
                        None
                    }
                }
            } else {
                None
            };
            streams.push(Stream { plan, handle });
        }

        if let Some((source, e)) = failure {
            warn!(view = %self.key, table = %source, error = %e, "falling back to fetch-only");
            for stream in streams.iter_mut() {
                if let Some(handle) = stream.handle.take() {
                    self.release(handle);
                }
            }
            self.notice(ViewNotice::StreamLost {
                source,
                reason: StreamLoss::OpenFailed(e),
            });
        }
    }

    /// Run a bulk fetch on its own thread and post the result back.
    fn spawn_fetch(&self, ticket: LoadTicket, request: FetchRequest) {
        let source = ticket.source();
        let fetcher = Arc::clone(&self.fetcher);
        let tx = self.load_tx.clone();
        let name = format!("{}-{}", self.fetch_thread_prefix, source);

        let spawned = thread::Builder::new().name(name).spawn(move || {
            let result = fetcher.fetch(&request);
            if tx.send(LoadCompletion { ticket, result }).is_err() {
                debug!(table = %source, "view closed before fetch resolved; result discarded");
            }
        });

        if let Err(e) = spawned {
            let _ = self.load_tx.send(LoadCompletion {
                ticket,
                result: Err(EngineError::Fetch {
                    table: source,
                    message: format!("could not start fetch: {}", e),
                }),
            });
        }
    }

    pub fn key(&self) -> &ViewKey {
        &self.key
    }

    pub fn context(&self) -> &ViewContext {
        &self.context
    }

    pub fn generation(&self) -> u64 {
        self.context.generation
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Live only while open and every planned stream has a subscription.
    pub fn mode(&self) -> ViewMode {
        if self.is_closed() {
            return ViewMode::FetchOnly;
        }
        let streams = self.streams.lock();
        if streams.iter().all(|s| s.handle.is_some()) {
            ViewMode::Live
        } else {
            ViewMode::FetchOnly
        }
    }

    /// Ids of the subscriptions currently held.
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.streams
            .lock()
            .iter()
            .filter_map(|s| s.handle.as_ref().map(|h| h.id))
            .collect()
    }

    /// Whether any bulk load is still outstanding.
    pub fn is_loading(&self) -> bool {
        let reconciler = self.reconciler.lock();
        reconciler.sources().into_iter().any(|s| reconciler.is_pending(s))
    }

    // --- Dispatch ---

    /// Apply every message and completed load already waiting.
    ///
    /// Never blocks on the network. A closed view does nothing.
    pub fn dispatch_pending(&self) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let mut streams = self.streams.lock();
        if self.is_closed() {
            return summary;
        }
        let mut reconciler = self.reconciler.lock();
        let mut lost = Vec::new();

        for (index, stream) in streams.iter_mut().enumerate() {
            while let Some(handle) = stream.handle.as_ref() {
                match handle.try_recv() {
                    Ok(FeedMessage::Change { event }) => match reconciler.reconcile(&event) {
                        Ok(reconciled) => {
                            summary.events += 1;
                            self.after_reconcile(&reconciled);
                        }
                        Err(e) => summary.errors.push(e),
                    },
                    Ok(FeedMessage::Dropped { reason }) => {
                        lost.push((index, reason));
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        lost.push((index, DropReason::Disconnected));
                        break;
                    }
                }
            }
        }

        for (index, reason) in lost {
            self.recover_stream(&mut streams[index], &mut reconciler, reason);
        }

        summary.absorb(self.apply_completed_loads(&streams, &mut reconciler));
        summary
    }

    /// Wait up to `timeout` for anything to arrive, then dispatch.
    pub fn dispatch_timeout(&self, timeout: Duration) -> DispatchSummary {
        let receivers: Vec<Receiver<FeedMessage>> = self
            .streams
            .lock()
            .iter()
            .filter_map(|s| s.handle.as_ref().map(|h| h.receiver.clone()))
            .collect();
        let loads = self.load_rx.lock().clone();
        if self.is_closed() {
            return DispatchSummary::default();
        }

        {
            let mut select = Select::new();
            for rx in &receivers {
                select.recv(rx);
            }
            if let Some(rx) = loads.as_ref() {
                select.recv(rx);
            }
            let _ = select.ready_timeout(timeout);
        }

        self.dispatch_pending()
    }

    /// Block until every outstanding bulk load has resolved, or `timeout`.
    ///
    /// Returns true if nothing is loading any more. Live events are left
    /// queued for the next dispatch.
    pub fn wait_for_loads(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let rx = match self.load_rx.lock().as_ref() {
            Some(rx) => rx.clone(),
            None => return false,
        };

        loop {
            if self.is_closed() {
                return false;
            }
            if !self.is_loading() {
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let done = match rx.recv_timeout(remaining) {
                Ok(done) => done,
                Err(_) => return false,
            };

            let streams = self.streams.lock();
            if self.is_closed() {
                return false;
            }
            let mut reconciler = self.reconciler.lock();
            self.apply_load(&streams, &mut reconciler, done);
        }
    }

    /// Re-fetch every stream's data, merging with live events as on activation.
    pub fn refresh(&self) {
        let streams = self.streams.lock();
        if self.is_closed() {
            debug!(view = %self.key, "refresh on closed view ignored");
            return;
        }
        let mut reconciler = self.reconciler.lock();
        for stream in streams.iter() {
            self.refetch(&mut reconciler, &stream.plan);
        }
    }

    /// Issue a new bulk fetch for one planned stream.
    fn refetch(&self, reconciler: &mut Reconciler, plan: &StreamPlan) {
        if let Some(ticket) = reconciler.begin_load(plan.source()) {
            self.spawn_fetch(ticket, plan.fetch.clone());
        }
    }

    fn apply_completed_loads(
        &self,
        streams: &[Stream],
        reconciler: &mut Reconciler,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let rx = self.load_rx.lock();
        if let Some(rx) = rx.as_ref() {
            while let Ok(done) = rx.try_recv() {
                summary.absorb(self.apply_load(streams, reconciler, done));
            }
        }
        summary
    }

    fn apply_load(
        &self,
        streams: &[Stream],
        reconciler: &mut Reconciler,
        done: LoadCompletion,
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let source = done.ticket.source();
        match reconciler.load(done.ticket, done.result) {
            Ok(report) if report.resync => {
                debug!(view = %self.key, table = %source, "load discarded; fetching again");
                if let Some(stream) = streams.iter().find(|s| s.plan.source() == source) {
                    self.refetch(reconciler, &stream.plan);
                }
            }
            Ok(report) => {
                summary.loads += 1;
                if source == Source::Invoices {
                    self.sync_session();
                }
                self.notice(ViewNotice::Loaded { source, report });
            }
            Err(e) => {
                summary.errors.push(e.clone());
                self.notice(ViewNotice::FetchFailed(e));
            }
        }
        summary
    }

    /// A stream stopped delivering. Slow or disconnected streams are
    /// re-opened and re-fetched; anything else leaves the view fetch-only.
    fn recover_stream(&self, stream: &mut Stream, reconciler: &mut Reconciler, reason: DropReason) {
        let source = stream.plan.source();
        if let Some(handle) = stream.handle.take() {
            self.release(handle);
        }
        warn!(view = %self.key, table = %source, reason = ?reason, "stream lost");
        self.notice(ViewNotice::StreamLost {
            source,
            reason: StreamLoss::Dropped(reason.clone()),
        });

        if !matches!(reason, DropReason::BufferOverflow | DropReason::Disconnected) {
            return;
        }

        match self.feed.open(stream.plan.subscription.clone()) {
            Ok(handle) => {
                info!(view = %self.key, table = %source, subscription = %handle.id, "stream re-opened");
                stream.handle = Some(handle);
                self.refetch(reconciler, &stream.plan);
            }
            Err(e) => {
                warn!(view = %self.key, table = %source, error = %e, "stream stays fetch-only");
                self.notice(ViewNotice::StreamLost {
                    source,
                    reason: StreamLoss::OpenFailed(e),
                });
            }
        }
    }

    /// Hand reconciled changes of the edited invoice to its session.
    fn after_reconcile(&self, reconciled: &Reconciled) {
        let watched = match &self.key {
            ViewKey::InvoiceDetail(id) => id,
            _ => return,
        };
        if reconciled.source != Source::Invoices || reconciled.key.as_ref() != Some(watched) {
            return;
        }

        match (reconciled.kind, reconciled.outcome) {
            (ChangeKind::Delete, ApplyOutcome::Removed) => {
                self.notice(ViewNotice::EntityRemoved(watched.clone()));
            }
            (_, ApplyOutcome::Inserted) | (_, ApplyOutcome::Replaced) => self.sync_session(),
            _ => {}
        }
    }

    /// Open the edit session on first sight of the invoice, or feed it the
    /// latest remote value.
    fn sync_session(&self) {
        let watched = match &self.key {
            ViewKey::InvoiceDetail(id) => id,
            _ => return,
        };
        let remote = match self.invoice(watched) {
            Some(invoice) => invoice.extracted_data,
            None => return,
        };

        let mut session = self.session.lock();
        match session.as_mut() {
            None => {
                debug!(key = %watched, "edit session opened");
                *session = Some(EditSession::new(watched.clone(), remote));
            }
            Some(s) => {
                if let RemoteOutcome::Conflict(report) = s.on_remote_update(remote) {
                    self.notice(ViewNotice::Conflict(report));
                }
            }
        }
    }

    // --- Reads ---

    pub fn invoices(&self) -> Vec<Invoice> {
        self.stores
            .invoices
            .as_ref()
            .map(|s| s.read().snapshot())
            .unwrap_or_default()
    }

    pub fn invoice(&self, id: &EntityId) -> Option<Invoice> {
        self.stores
            .invoices
            .as_ref()
            .and_then(|s| s.read().get(id).cloned())
    }

    pub fn field_configurations(&self) -> Vec<FieldConfiguration> {
        self.stores
            .field_configurations
            .as_ref()
            .map(|s| s.read().snapshot())
            .unwrap_or_default()
    }

    pub fn system_logs(&self) -> Vec<LogEntry> {
        self.stores
            .system_logs
            .as_ref()
            .map(|s| s.read().snapshot())
            .unwrap_or_default()
    }

    pub fn integration_logs(&self) -> Vec<IntegrationLogEntry> {
        self.stores
            .integration_logs
            .as_ref()
            .map(|s| s.read().snapshot())
            .unwrap_or_default()
    }

    /// Notices accumulated since the last call.
    pub fn take_notices(&self) -> Vec<ViewNotice> {
        std::mem::take(&mut *self.notices.lock())
    }

    fn notice(&self, notice: ViewNotice) {
        self.notices.lock().push(notice);
    }

    // --- Edit session ---

    /// Copy of the edit session, once the invoice has loaded.
    pub fn session(&self) -> Option<EditSession> {
        self.session.lock().clone()
    }

    pub fn edit_state(&self) -> Option<EditState> {
        self.session.lock().as_ref().map(EditSession::state)
    }

    pub fn set_field(&self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        self.with_session("edit", |s| s.set_field(name, value))
    }

    pub fn discard_edits(&self) -> Result<()> {
        self.with_session("discard", EditSession::discard)
    }

    pub fn resolve_conflict(&self, resolution: Resolution) -> Result<()> {
        self.with_session("resolve", |s| s.resolve(resolution))
    }

    /// Commit the staged copy through the commit collaborator.
    ///
    /// The session lock is released while the commit runs so remote updates
    /// can still be dispatched; they are held until the save resolves.
    pub fn save(&self) -> Result<()> {
        let request = self.with_session("save", EditSession::begin_save)?;
        let result = self.committer.commit(&request);
        self.with_session("finish save", |s| s.finish_save(result))
    }

    fn with_session<T>(
        &self,
        action: &str,
        f: impl FnOnce(&mut EditSession) -> Result<T>,
    ) -> Result<T> {
        let mut session = self.session.lock();
        match session.as_mut() {
            Some(s) => f(s),
            None => Err(EngineError::InvalidTransition {
                state: "no edit session".to_string(),
                action: action.to_string(),
            }),
        }
    }

    // --- Teardown ---

    /// Close a subscription through the feed. A handle the feed already
    /// dropped is a no-op.
    fn release(&self, handle: SubscriptionHandle) -> bool {
        if self.feed.close(handle.id) {
            return true;
        }
        let stale = EngineError::StaleHandle(handle.id);
        debug!(view = %self.key, error = %stale, "close ignored");
        false
    }

    /// Close every subscription and discard outstanding loads.
    ///
    /// Idempotent; returns the number of subscriptions released by this call.
    pub(crate) fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let mut released = 0;
        {
            let mut streams = self.streams.lock();
            for stream in streams.iter_mut() {
                if let Some(handle) = stream.handle.take() {
                    if self.release(handle) {
                        released += 1;
                    }
                }
            }
        }
        self.load_rx.lock().take();

        info!(
            view = %self.key,
            generation = self.context.generation,
            released,
            "view deactivated"
        );
        released
    }
}

impl Drop for ActiveView {
    fn drop(&mut self) {
        self.close();
    }
}
