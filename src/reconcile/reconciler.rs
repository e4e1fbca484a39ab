//! Routing of change events to the stores bound to their source.

use crate::collections::ApplyOutcome;
use crate::error::{EngineError, Result};
use crate::subscriptions::DEFAULT_BUFFER_SIZE;
use crate::types::{ChangeEvent, ChangeKind, EntityId, Source};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use super::target::{ChangeTarget, JournaledEvent, LoadReport};

/// One bulk fetch issued for a bound source.
///
/// Hand it back to [`Reconciler::load`] with the fetch result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadTicket {
    source: Source,
    /// Journal position when the fetch was issued.
    mark: u64,
}

impl LoadTicket {
    pub fn source(&self) -> Source {
        self.source
    }
}

struct Binding {
    target: Box<dyn ChangeTarget>,
    /// Marks of fetches that have not resolved yet.
    outstanding: Vec<u64>,
    /// Live events applied while any fetch is outstanding, oldest first.
    journal: VecDeque<JournaledEvent>,
    /// Sequence number of the journal's front entry.
    first_seq: u64,
    /// Newest sequence number evicted from a full journal.
    evicted: Option<u64>,
}

impl Binding {
    fn new(target: Box<dyn ChangeTarget>) -> Self {
        Self {
            target,
            outstanding: Vec::new(),
            journal: VecDeque::new(),
            first_seq: 0,
            evicted: None,
        }
    }

    fn next_seq(&self) -> u64 {
        self.first_seq + self.journal.len() as u64
    }

    /// Forget journal entries no outstanding fetch needs.
    fn prune(&mut self) {
        match self.outstanding.iter().min().copied() {
            Some(oldest) => {
                while self.first_seq < oldest && self.journal.pop_front().is_some() {
                    self.first_seq += 1;
                }
            }
            None => {
                self.first_seq = self.next_seq();
                self.journal.clear();
                self.evicted = None;
            }
        }
    }
}

/// Outcome of one reconciled event.
#[derive(Clone, Debug, PartialEq)]
pub struct Reconciled {
    pub source: Source,
    pub kind: ChangeKind,
    pub key: Option<EntityId>,
    pub outcome: ApplyOutcome,
}

/// Pure routing and merge layer between change events and stores.
///
/// Performs no validation of payload contents beyond decoding rows into the
/// bound entity type; the remote framing of `kind` is trusted.
///
/// Every bulk fetch is issued through [`begin_load`](Self::begin_load). While
/// any fetch of a source is outstanding, its live events are journaled so
/// each load can replay what arrived after its own fetch was issued. The
/// journal holds at most `journal_limit` events per source; a load whose
/// events were evicted is discarded and reported with `resync` set.
pub struct Reconciler {
    bindings: HashMap<Source, Binding>,
    journal_limit: usize,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::with_journal_limit(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_journal_limit(journal_limit: usize) -> Self {
        Self {
            bindings: HashMap::new(),
            journal_limit: journal_limit.max(1),
        }
    }

    /// Bind a store to a source. Replaces any earlier binding.
    pub fn bind(&mut self, source: Source, target: Box<dyn ChangeTarget>) {
        self.bindings.insert(source, Binding::new(target));
    }

    pub fn is_bound(&self, source: Source) -> bool {
        self.bindings.contains_key(&source)
    }

    /// Sources with a bound store.
    pub fn sources(&self) -> Vec<Source> {
        self.bindings.keys().copied().collect()
    }

    /// Whether any bulk fetch for `source` is still outstanding.
    pub fn is_pending(&self, source: Source) -> bool {
        self.bindings
            .get(&source)
            .map_or(false, |b| !b.outstanding.is_empty())
    }

    /// Journaled events held for `source`.
    pub fn journal_len(&self, source: Source) -> usize {
        self.bindings.get(&source).map_or(0, |b| b.journal.len())
    }

    /// Record that a bulk fetch for `source` is being issued.
    ///
    /// Returns `None` when nothing is bound to the source.
    pub fn begin_load(&mut self, source: Source) -> Option<LoadTicket> {
        let binding = self.bindings.get_mut(&source)?;
        let mark = binding.next_seq();
        binding.outstanding.push(mark);
        debug!(table = %source, outstanding = binding.outstanding.len(), "bulk load issued");
        Some(LoadTicket { source, mark })
    }

    /// Apply a live event to the store bound to its source.
    ///
    /// Unsupported kinds, unbound sources and undecodable rows come back as
    /// [`EngineError::ProtocolViolation`]; the store is left untouched.
    pub fn reconcile(&mut self, event: &ChangeEvent) -> Result<Reconciled> {
        let binding = match self.bindings.get_mut(&event.source) {
            Some(binding) => binding,
            None => {
                let err = violation(event, "no store bound to source");
                warn!(error = %err, "dropping event");
                return Err(err);
            }
        };

        if event.source.is_append_only() && event.kind != ChangeKind::Insert {
            let err = violation(event, "append-only source");
            warn!(error = %err, "dropping event");
            return Err(err);
        }

        let outcome = match binding.target.apply(event.kind, &event.record) {
            Ok(outcome) => outcome,
            Err(EngineError::Decode(reason)) => {
                let err = violation(event, &reason);
                warn!(error = %err, "dropping event");
                return Err(err);
            }
            Err(e) => {
                warn!(error = %e, "dropping event");
                return Err(e);
            }
        };

        if !binding.outstanding.is_empty() {
            binding.journal.push_back(JournaledEvent {
                kind: event.kind,
                record: event.record.clone(),
            });
            if binding.journal.len() > self.journal_limit {
                binding.journal.pop_front();
                if binding.evicted.is_none() {
                    warn!(
                        table = %event.source,
                        limit = self.journal_limit,
                        "load journal full; outstanding loads will be fetched again"
                    );
                }
                binding.evicted = Some(binding.first_seq);
                binding.first_seq += 1;
            }
        }

        let key = event.key();
        debug!(
            table = %event.source,
            kind = %event.kind,
            key = ?key,
            outcome = ?outcome,
            "event reconciled"
        );

        Ok(Reconciled {
            source: event.source,
            kind: event.kind,
            key,
            outcome,
        })
    }

    /// Apply a resolved bulk fetch.
    ///
    /// On success the store is loaded from the rows and every live event that
    /// arrived since the fetch was issued is replayed on top. On failure the
    /// store keeps whatever live events produced and the error is returned.
    /// If the journal lost events this fetch needed, the rows are discarded
    /// and the report asks for a fresh fetch.
    pub fn load(
        &mut self,
        ticket: LoadTicket,
        fetched: Result<Vec<serde_json::Value>>,
    ) -> Result<LoadReport> {
        let source = ticket.source;
        let binding = match self.bindings.get_mut(&source) {
            Some(binding) => binding,
            None => {
                debug!(table = %source, "load for unbound source ignored");
                return Ok(LoadReport::default());
            }
        };
        let position = match binding.outstanding.iter().position(|m| *m == ticket.mark) {
            Some(position) => position,
            None => {
                debug!(table = %source, "load for a fetch that is not outstanding ignored");
                return Ok(LoadReport::default());
            }
        };
        binding.outstanding.swap_remove(position);

        let result = match fetched {
            Err(e) => {
                warn!(table = %source, error = %e, "bulk load failed");
                Err(e)
            }
            Ok(_) if binding.evicted.map_or(false, |seq| seq >= ticket.mark) => {
                warn!(table = %source, "bulk load discarded; journal overflowed while fetching");
                Ok(LoadReport {
                    resync: true,
                    ..LoadReport::default()
                })
            }
            Ok(rows) => {
                let still_pending = binding.outstanding.len();
                let start = ticket.mark.saturating_sub(binding.first_seq) as usize;
                let early = &binding.journal.make_contiguous()[start..];
                binding.target.load(&rows, early).map(|report| {
                    info!(
                        table = %source,
                        loaded = report.loaded,
                        skipped = report.skipped,
                        replayed = report.replayed,
                        still_pending,
                        "bulk load applied"
                    );
                    report
                })
            }
        };

        binding.prune();
        result
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

fn violation(event: &ChangeEvent, reason: &str) -> EngineError {
    EngineError::ProtocolViolation {
        table: event.source,
        kind: event.kind,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::{KeyedStore, LogBuffer};
    use crate::entities::{Invoice, InvoiceStatus, LogEntry};
    use crate::reconcile::target::Shared;
    use parking_lot::RwLock;
    use serde_json::json;
    use std::sync::Arc;

    fn setup() -> (
        Reconciler,
        Shared<KeyedStore<Invoice>>,
        Shared<LogBuffer<LogEntry>>,
    ) {
        let invoices: Shared<KeyedStore<Invoice>> = Arc::new(RwLock::new(KeyedStore::new()));
        let logs: Shared<LogBuffer<LogEntry>> = Arc::new(RwLock::new(LogBuffer::new(100)));
        let mut reconciler = Reconciler::new();
        reconciler.bind(Source::Invoices, Box::new(invoices.clone()));
        reconciler.bind(Source::SystemLogs, Box::new(logs.clone()));
        (reconciler, invoices, logs)
    }

    fn log_row(id: &str) -> serde_json::Value {
        json!({"id": id, "log_type": "upload", "message": "received"})
    }

    fn invoice(id: &str) -> serde_json::Value {
        json!({"id": id, "status": "uploaded"})
    }

    fn ids(store: &Shared<KeyedStore<Invoice>>) -> Vec<String> {
        store.read().keys().into_iter().map(|k| k.0).collect()
    }

    fn fetch_failed() -> EngineError {
        EngineError::Fetch {
            table: Source::Invoices,
            message: "timeout".to_string(),
        }
    }

    #[test]
    fn test_routes_by_source() {
        let (mut reconciler, invoices, logs) = setup();
        assert!(!reconciler.is_pending(Source::Invoices));

        reconciler
            .reconcile(&ChangeEvent::insert(Source::Invoices, invoice("1")))
            .unwrap();
        reconciler
            .reconcile(&ChangeEvent::insert(Source::SystemLogs, log_row("l1")))
            .unwrap();

        assert_eq!(invoices.read().len(), 1);
        assert_eq!(logs.read().len(), 1);
        assert_eq!(reconciler.journal_len(Source::Invoices), 0);
    }

    #[test]
    fn test_update_reports_key() {
        let (mut reconciler, invoices, _) = setup();
        let ticket = reconciler.begin_load(Source::Invoices).unwrap();
        reconciler
            .load(ticket, Ok(vec![json!({"id": "1", "status": "processing"})]))
            .unwrap();

        let reconciled = reconciler
            .reconcile(&ChangeEvent::update(
                Source::Invoices,
                json!({"id": "1", "status": "validated"}),
            ))
            .unwrap();

        assert_eq!(reconciled.key, Some(EntityId::from("1")));
        assert_eq!(reconciled.outcome, ApplyOutcome::Replaced);
        assert_eq!(
            invoices.read().get(&EntityId::from("1")).unwrap().status,
            InvoiceStatus::Validated
        );
    }

    #[test]
    fn test_delete_on_log_is_violation() {
        let (mut reconciler, _, logs) = setup();
        let ticket = reconciler.begin_load(Source::SystemLogs).unwrap();
        reconciler.load(ticket, Ok(vec![log_row("l1")])).unwrap();

        let result = reconciler.reconcile(&ChangeEvent::delete(Source::SystemLogs, "l1"));
        assert!(matches!(result, Err(EngineError::ProtocolViolation { .. })));
        assert_eq!(logs.read().len(), 1);
    }

    #[test]
    fn test_unbound_source_is_violation() {
        let (mut reconciler, _, _) = setup();
        let result = reconciler.reconcile(&ChangeEvent::insert(
            Source::IntegrationLogs,
            json!({"id": "s1"}),
        ));
        assert!(matches!(result, Err(EngineError::ProtocolViolation { .. })));
        assert!(reconciler.begin_load(Source::IntegrationLogs).is_none());
    }

    #[test]
    fn test_undecodable_row_is_violation() {
        let (mut reconciler, invoices, _) = setup();
        let result = reconciler.reconcile(&ChangeEvent::insert(
            Source::Invoices,
            json!({"id": "1", "status": "teleported"}),
        ));
        assert!(matches!(result, Err(EngineError::ProtocolViolation { .. })));
        assert!(invoices.read().is_empty());
    }

    #[test]
    fn test_load_does_not_clobber_early_events() {
        let (mut reconciler, invoices, _) = setup();
        let ticket = reconciler.begin_load(Source::Invoices).unwrap();
        assert!(reconciler.is_pending(Source::Invoices));

        reconciler
            .reconcile(&ChangeEvent::insert(Source::Invoices, invoice("live")))
            .unwrap();
        reconciler
            .reconcile(&ChangeEvent::delete(Source::Invoices, "gone"))
            .unwrap();

        let report = reconciler
            .load(
                ticket,
                Ok(vec![
                    json!({"id": "gone", "status": "processing"}),
                    json!({"id": "old", "status": "integrated"}),
                ]),
            )
            .unwrap();

        assert_eq!(report.replayed, 2);
        assert!(!report.resync);
        assert!(!reconciler.is_pending(Source::Invoices));
        assert_eq!(reconciler.journal_len(Source::Invoices), 0);
        assert_eq!(ids(&invoices), vec!["live", "old"]);
    }

    #[test]
    fn test_failed_load_keeps_live_events() {
        let (mut reconciler, invoices, _) = setup();
        let ticket = reconciler.begin_load(Source::Invoices).unwrap();
        reconciler
            .reconcile(&ChangeEvent::insert(Source::Invoices, invoice("live")))
            .unwrap();

        let result = reconciler.load(ticket, Err(fetch_failed()));
        assert!(matches!(result, Err(EngineError::Fetch { .. })));
        assert_eq!(invoices.read().len(), 1);
        assert!(!reconciler.is_pending(Source::Invoices));
    }

    #[test]
    fn test_refresh_journals_again() {
        let (mut reconciler, _, _) = setup();
        let ticket = reconciler.begin_load(Source::Invoices).unwrap();
        reconciler.load(ticket, Ok(vec![])).unwrap();
        assert!(!reconciler.is_pending(Source::Invoices));

        reconciler.begin_load(Source::Invoices).unwrap();
        assert!(reconciler.is_pending(Source::Invoices));
        reconciler
            .reconcile(&ChangeEvent::insert(Source::Invoices, invoice("live")))
            .unwrap();
        assert_eq!(reconciler.journal_len(Source::Invoices), 1);
    }

    #[test]
    fn test_overlapping_loads_keep_live_events() {
        let (mut reconciler, invoices, _) = setup();
        let first = reconciler.begin_load(Source::Invoices).unwrap();
        let second = reconciler.begin_load(Source::Invoices).unwrap();

        reconciler
            .load(first, Ok(vec![json!({"id": "old", "status": "processing"})]))
            .unwrap();
        // The second fetch is still out; live events must keep being journaled.
        assert!(reconciler.is_pending(Source::Invoices));

        reconciler
            .reconcile(&ChangeEvent::insert(Source::Invoices, invoice("live")))
            .unwrap();
        assert_eq!(ids(&invoices), vec!["live", "old"]);

        let report = reconciler
            .load(second, Ok(vec![json!({"id": "old", "status": "processing"})]))
            .unwrap();
        assert_eq!(report.replayed, 1);
        assert!(!reconciler.is_pending(Source::Invoices));
        assert_eq!(ids(&invoices), vec!["live", "old"]);
    }

    #[test]
    fn test_late_fetch_replays_only_its_own_window() {
        let (mut reconciler, invoices, _) = setup();
        let first = reconciler.begin_load(Source::Invoices).unwrap();
        reconciler
            .reconcile(&ChangeEvent::insert(Source::Invoices, invoice("a")))
            .unwrap();
        let second = reconciler.begin_load(Source::Invoices).unwrap();
        reconciler
            .reconcile(&ChangeEvent::insert(Source::Invoices, invoice("b")))
            .unwrap();

        // The second fetch resolves first and already saw "a".
        let report = reconciler.load(second, Ok(vec![invoice("a")])).unwrap();
        assert_eq!(report.replayed, 1);
        assert_eq!(ids(&invoices), vec!["b", "a"]);
        assert_eq!(reconciler.journal_len(Source::Invoices), 2);

        let report = reconciler.load(first, Ok(vec![])).unwrap();
        assert_eq!(report.replayed, 2);
        assert_eq!(ids(&invoices), vec!["b", "a"]);
        assert_eq!(reconciler.journal_len(Source::Invoices), 0);
    }

    #[test]
    fn test_failed_first_load_keeps_journal_for_second() {
        let (mut reconciler, invoices, _) = setup();
        let first = reconciler.begin_load(Source::Invoices).unwrap();
        let second = reconciler.begin_load(Source::Invoices).unwrap();
        reconciler
            .reconcile(&ChangeEvent::insert(Source::Invoices, invoice("live")))
            .unwrap();

        assert!(reconciler.load(first, Err(fetch_failed())).is_err());
        assert!(reconciler.is_pending(Source::Invoices));

        reconciler.load(second, Ok(vec![invoice("old")])).unwrap();
        assert_eq!(ids(&invoices), vec!["live", "old"]);
    }

    #[test]
    fn test_unknown_ticket_is_ignored() {
        let (mut reconciler, invoices, _) = setup();
        let ticket = reconciler.begin_load(Source::Invoices).unwrap();
        reconciler.load(ticket, Ok(vec![invoice("a")])).unwrap();

        // Resolving the same fetch twice must not reload the store.
        let report = reconciler.load(ticket, Ok(vec![])).unwrap();
        assert_eq!(report, LoadReport::default());
        assert_eq!(ids(&invoices), vec!["a"]);
    }

    #[test]
    fn test_full_journal_asks_for_resync() {
        let invoices: Shared<KeyedStore<Invoice>> = Arc::new(RwLock::new(KeyedStore::new()));
        let mut reconciler = Reconciler::with_journal_limit(2);
        reconciler.bind(Source::Invoices, Box::new(invoices.clone()));
        let ticket = reconciler.begin_load(Source::Invoices).unwrap();

        for id in ["a", "b", "c"] {
            reconciler
                .reconcile(&ChangeEvent::insert(Source::Invoices, invoice(id)))
                .unwrap();
        }
        assert_eq!(reconciler.journal_len(Source::Invoices), 2);

        // A fresh fetch issued now only needs events from here on.
        let retry = reconciler.begin_load(Source::Invoices).unwrap();

        let report = reconciler.load(ticket, Ok(vec![invoice("old")])).unwrap();
        assert!(report.resync);
        assert_eq!(report.loaded, 0);
        // Live state is kept as is.
        assert_eq!(ids(&invoices), vec!["c", "b", "a"]);

        reconciler
            .reconcile(&ChangeEvent::insert(Source::Invoices, invoice("d")))
            .unwrap();
        let report = reconciler
            .load(
                retry,
                Ok(vec![invoice("c"), invoice("b"), invoice("a"), invoice("old")]),
            )
            .unwrap();
        assert!(!report.resync);
        assert_eq!(report.replayed, 1);
        assert_eq!(ids(&invoices), vec!["d", "c", "b", "a", "old"]);
        assert!(!reconciler.is_pending(Source::Invoices));
    }
}
