//! Edit sessions: local, uncommitted copies of an entity's editable fields.
//!
//! A session tracks the last-known remote value (`base`) and the user's
//! working copy (`staged`). Remote updates never overwrite unsaved local
//! work: while the session is dirty they move it to
//! [`EditState::Conflicted`] and the caller decides how to resolve.

use crate::error::{EngineError, Result};
use crate::types::{EntityId, FieldValue, Payload, Source};
use std::fmt;
use tracing::{debug, info, warn};

/// Edit session state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditState {
    /// Staged copy equals the last-known remote value.
    Clean,
    /// Staged copy has unsaved local differences.
    Dirty,
    /// A commit is in flight.
    Saving,
    /// A remote update arrived while local changes were unsaved.
    Conflicted,
}

impl fmt::Display for EditState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EditState::Clean => "clean",
            EditState::Dirty => "dirty",
            EditState::Saving => "saving",
            EditState::Conflicted => "conflicted",
        };
        f.write_str(name)
    }
}

/// Both sides of a conflict, handed to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct ConflictReport {
    pub key: EntityId,
    /// The unsaved local copy (unchanged by the remote update).
    pub local: Payload,
    /// The remote value that arrived.
    pub remote: Payload,
}

/// How a remote update affected the session.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteOutcome {
    /// The editable fields did not change.
    Unchanged,
    /// Nothing local to lose; the staged copy now mirrors the remote value.
    Adopted,
    /// Remote value equals the local copy; the session is clean again.
    Converged,
    /// Arrived while saving; held until the save resolves.
    Deferred,
    /// Local work is preserved and the conflict must be resolved.
    Conflict(ConflictReport),
}

/// Caller's decision for a conflicted session.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// Keep the local copy; it stays dirty against the new remote value.
    KeepLocal,
    /// Drop local changes and take the remote value.
    TakeRemote,
    /// Use a caller-merged payload.
    Merged(Payload),
}

/// What to persist when a session saves.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitRequest {
    pub source: Source,
    pub key: EntityId,
    /// Partial row: only the editable column.
    pub partial: serde_json::Value,
}

/// Local working copy of one invoice's extracted fields.
#[derive(Clone, Debug)]
pub struct EditSession {
    key: EntityId,
    state: EditState,
    /// Last-known remote value.
    base: Payload,
    /// Working copy.
    staged: Payload,
    /// Remote value that caused the current conflict.
    conflicting: Option<Payload>,
    /// Value being committed while `Saving`.
    in_flight: Option<Payload>,
    /// Remote value that arrived while `Saving`.
    deferred: Option<Payload>,
}

impl EditSession {
    /// Open a clean session on the current remote value.
    pub fn new(key: EntityId, remote: Payload) -> Self {
        Self {
            key,
            state: EditState::Clean,
            staged: remote.clone(),
            base: remote,
            conflicting: None,
            in_flight: None,
            deferred: None,
        }
    }

    pub fn key(&self) -> &EntityId {
        &self.key
    }

    pub fn state(&self) -> EditState {
        self.state
    }

    pub fn staged(&self) -> &Payload {
        &self.staged
    }

    /// Last-known remote value.
    pub fn remote(&self) -> &Payload {
        &self.base
    }

    /// The pending conflict, if any.
    pub fn conflict(&self) -> Option<ConflictReport> {
        self.conflicting.as_ref().map(|remote| ConflictReport {
            key: self.key.clone(),
            local: self.staged.clone(),
            remote: remote.clone(),
        })
    }

    /// Fields whose staged value differs from the remote value.
    pub fn changed_fields(&self) -> Vec<String> {
        let mut changed: Vec<String> = self
            .staged
            .iter()
            .filter(|(name, value)| self.base.get(*name) != Some(*value))
            .map(|(name, _)| name.clone())
            .collect();
        changed.extend(
            self.base
                .keys()
                .filter(|name| !self.staged.contains_key(*name))
                .cloned(),
        );
        changed.sort();
        changed
    }

    /// Set one field of the working copy.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Result<()> {
        self.ensure_not_saving("edit")?;
        self.staged.insert(name.into(), value.into());
        self.settle_local();
        Ok(())
    }

    /// Remove one field from the working copy.
    pub fn clear_field(&mut self, name: &str) -> Result<()> {
        self.ensure_not_saving("edit")?;
        self.staged.remove(name);
        self.settle_local();
        Ok(())
    }

    /// Revert the working copy to the remote value.
    pub fn discard(&mut self) -> Result<()> {
        match self.state {
            EditState::Clean | EditState::Dirty => {
                self.staged = self.base.clone();
                self.state = EditState::Clean;
                Ok(())
            }
            state => Err(invalid(state, "discard")),
        }
    }

    /// Start committing the working copy: `Dirty -> Saving`.
    pub fn begin_save(&mut self) -> Result<CommitRequest> {
        if self.state != EditState::Dirty {
            return Err(invalid(self.state, "save"));
        }

        self.state = EditState::Saving;
        self.in_flight = Some(self.staged.clone());
        debug!(key = %self.key, fields = ?self.changed_fields(), "save started");

        Ok(CommitRequest {
            source: Source::Invoices,
            key: self.key.clone(),
            partial: serde_json::json!({ "extracted_data": self.staged }),
        })
    }

    /// Resolve an in-flight commit.
    ///
    /// Success makes the saved copy the new remote value. Failure keeps the
    /// edit and returns the error. A remote value that arrived during the save
    /// and differs from what was saved leaves the session conflicted.
    pub fn finish_save(&mut self, result: Result<()>) -> Result<()> {
        if self.state != EditState::Saving {
            return Err(invalid(self.state, "finish save"));
        }

        let saved = self.in_flight.take().unwrap_or_else(|| self.staged.clone());
        let deferred = self.deferred.take();

        match result {
            Ok(()) => {
                self.base = saved;
                match deferred {
                    Some(remote) if remote != self.base => {
                        self.enter_conflict(remote);
                    }
                    _ => {
                        self.state = if self.staged == self.base {
                            EditState::Clean
                        } else {
                            EditState::Dirty
                        };
                        info!(key = %self.key, "save committed");
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "save failed, keeping local edit");
                match deferred {
                    Some(remote) => {
                        self.enter_conflict(remote);
                    }
                    None => self.state = EditState::Dirty,
                }
                Err(e)
            }
        }
    }

    /// React to a reconciled remote update of this entity.
    ///
    /// Updates that leave the editable fields as already known (for example
    /// a status-only change) report [`RemoteOutcome::Unchanged`].
    pub fn on_remote_update(&mut self, remote: Payload) -> RemoteOutcome {
        match self.state {
            EditState::Clean => {
                if remote == self.base {
                    return RemoteOutcome::Unchanged;
                }
                self.staged = remote.clone();
                self.base = remote;
                RemoteOutcome::Adopted
            }
            EditState::Dirty | EditState::Conflicted => {
                let known = match self.state {
                    EditState::Conflicted => self.conflicting.as_ref(),
                    _ => Some(&self.base),
                };
                if known == Some(&remote) {
                    return RemoteOutcome::Unchanged;
                }
                if remote == self.staged {
                    self.base = remote;
                    self.conflicting = None;
                    self.state = EditState::Clean;
                    debug!(key = %self.key, "remote converged with local edit");
                    return RemoteOutcome::Converged;
                }
                RemoteOutcome::Conflict(self.enter_conflict(remote))
            }
            EditState::Saving => {
                // The row changed outside `extracted_data`; nothing to hold.
                if remote == self.base {
                    self.deferred = None;
                    return RemoteOutcome::Unchanged;
                }
                // Echo of our own commit.
                if self.in_flight.as_ref() == Some(&remote) {
                    self.deferred = None;
                } else {
                    self.deferred = Some(remote);
                }
                RemoteOutcome::Deferred
            }
        }
    }

    /// Resolve a conflict.
    pub fn resolve(&mut self, resolution: Resolution) -> Result<()> {
        if self.state != EditState::Conflicted {
            return Err(invalid(self.state, "resolve"));
        }
        let remote = self.conflicting.take().unwrap_or_else(|| self.base.clone());
        self.base = remote;

        match resolution {
            Resolution::KeepLocal => {}
            Resolution::TakeRemote => self.staged = self.base.clone(),
            Resolution::Merged(payload) => self.staged = payload,
        }
        self.state = if self.staged == self.base {
            EditState::Clean
        } else {
            EditState::Dirty
        };
        info!(key = %self.key, state = %self.state, "conflict resolved");
        Ok(())
    }

    fn enter_conflict(&mut self, remote: Payload) -> ConflictReport {
        self.conflicting = Some(remote.clone());
        self.state = EditState::Conflicted;
        warn!(key = %self.key, "remote update conflicts with unsaved edit");
        ConflictReport {
            key: self.key.clone(),
            local: self.staged.clone(),
            remote,
        }
    }

    /// Recompute Clean/Dirty after a local edit. Conflicts stay conflicted.
    fn settle_local(&mut self) {
        if self.state == EditState::Conflicted {
            return;
        }
        self.state = if self.staged == self.base {
            EditState::Clean
        } else {
            EditState::Dirty
        };
    }

    fn ensure_not_saving(&self, action: &str) -> Result<()> {
        if self.state == EditState::Saving {
            return Err(invalid(self.state, action));
        }
        Ok(())
    }
}

fn invalid(state: EditState, action: &str) -> EngineError {
    EngineError::InvalidTransition {
        state: state.to_string(),
        action: action.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(amount: f64) -> Payload {
        let mut p = Payload::new();
        p.insert("amount".to_string(), FieldValue::Number(amount));
        p
    }

    fn session() -> EditSession {
        EditSession::new(EntityId::from("inv-1"), payload(10.0))
    }

    fn commit_failed() -> EngineError {
        EngineError::Commit {
            key: EntityId::from("inv-1"),
            message: "503".to_string(),
        }
    }

    #[test]
    fn test_local_edit_makes_dirty() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        assert_eq!(s.state(), EditState::Dirty);
        assert_eq!(s.changed_fields(), vec!["amount"]);

        // Editing back to the remote value is clean again
        s.set_field("amount", 10.0).unwrap();
        assert_eq!(s.state(), EditState::Clean);
    }

    #[test]
    fn test_remote_update_while_clean_is_adopted() {
        let mut s = session();
        assert_eq!(s.on_remote_update(payload(11.0)), RemoteOutcome::Adopted);
        assert_eq!(s.state(), EditState::Clean);
        assert_eq!(s.staged(), &payload(11.0));
    }

    #[test]
    fn test_remote_update_while_dirty_conflicts() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();

        let outcome = s.on_remote_update(payload(11.0));
        match outcome {
            RemoteOutcome::Conflict(report) => {
                assert_eq!(report.local, payload(12.0));
                assert_eq!(report.remote, payload(11.0));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(s.state(), EditState::Conflicted);
        assert_eq!(s.staged(), &payload(12.0));
        assert!(s.conflict().is_some());
    }

    #[test]
    fn test_status_only_update_keeps_dirty() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();

        // Same extracted fields as the known remote value
        assert_eq!(s.on_remote_update(payload(10.0)), RemoteOutcome::Unchanged);
        assert_eq!(s.state(), EditState::Dirty);
        assert_eq!(s.staged(), &payload(12.0));
    }

    #[test]
    fn test_repeated_conflicting_update_is_unchanged() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        s.on_remote_update(payload(11.0));

        assert_eq!(s.on_remote_update(payload(11.0)), RemoteOutcome::Unchanged);
        assert_eq!(s.state(), EditState::Conflicted);

        // A newer remote value replaces the one in the conflict
        assert!(matches!(
            s.on_remote_update(payload(15.0)),
            RemoteOutcome::Conflict(_)
        ));
        assert_eq!(s.conflict().unwrap().remote, payload(15.0));
    }

    #[test]
    fn test_remote_equal_to_local_converges() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        assert_eq!(s.on_remote_update(payload(12.0)), RemoteOutcome::Converged);
        assert_eq!(s.state(), EditState::Clean);
    }

    #[test]
    fn test_save_success() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();

        let request = s.begin_save().unwrap();
        assert_eq!(request.partial["extracted_data"]["amount"], 12.0);
        assert_eq!(s.state(), EditState::Saving);

        s.finish_save(Ok(())).unwrap();
        assert_eq!(s.state(), EditState::Clean);
        assert_eq!(s.remote(), &payload(12.0));
    }

    #[test]
    fn test_save_failure_keeps_edit() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        s.begin_save().unwrap();

        let result = s.finish_save(Err(commit_failed()));
        assert!(matches!(result, Err(EngineError::Commit { .. })));
        assert_eq!(s.state(), EditState::Dirty);
        assert_eq!(s.staged(), &payload(12.0));
    }

    #[test]
    fn test_cannot_save_clean_or_edit_while_saving() {
        let mut s = session();
        assert!(matches!(
            s.begin_save(),
            Err(EngineError::InvalidTransition { .. })
        ));

        s.set_field("amount", 12.0).unwrap();
        s.begin_save().unwrap();
        assert!(s.set_field("amount", 13.0).is_err());
        assert!(s.discard().is_err());
    }

    #[test]
    fn test_echo_during_save_is_absorbed() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        s.begin_save().unwrap();

        assert_eq!(s.on_remote_update(payload(12.0)), RemoteOutcome::Deferred);
        s.finish_save(Ok(())).unwrap();
        assert_eq!(s.state(), EditState::Clean);
    }

    #[test]
    fn test_status_change_during_save_then_commit_succeeds() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        s.begin_save().unwrap();

        // Only the status moved; the data is still the pre-save value.
        assert_eq!(s.on_remote_update(payload(10.0)), RemoteOutcome::Unchanged);
        s.finish_save(Ok(())).unwrap();
        assert_eq!(s.state(), EditState::Clean);
        assert_eq!(s.remote(), &payload(12.0));
        assert!(s.conflict().is_none());
    }

    #[test]
    fn test_status_change_during_save_then_commit_fails() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        s.begin_save().unwrap();

        assert_eq!(s.on_remote_update(payload(10.0)), RemoteOutcome::Unchanged);
        assert!(s.finish_save(Err(commit_failed())).is_err());
        assert_eq!(s.state(), EditState::Dirty);
        assert_eq!(s.staged(), &payload(12.0));
        assert!(s.conflict().is_none());
    }

    #[test]
    fn test_update_back_to_base_during_save_clears_held_value() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        s.begin_save().unwrap();

        assert_eq!(s.on_remote_update(payload(99.0)), RemoteOutcome::Deferred);
        assert_eq!(s.on_remote_update(payload(10.0)), RemoteOutcome::Unchanged);
        s.finish_save(Ok(())).unwrap();
        assert_eq!(s.state(), EditState::Clean);
    }

    #[test]
    fn test_foreign_update_during_save_conflicts() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        s.begin_save().unwrap();

        s.on_remote_update(payload(99.0));
        s.finish_save(Ok(())).unwrap();
        assert_eq!(s.state(), EditState::Conflicted);
        assert_eq!(s.conflict().unwrap().remote, payload(99.0));
    }

    #[test]
    fn test_resolve_keep_local() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        s.on_remote_update(payload(11.0));

        s.resolve(Resolution::KeepLocal).unwrap();
        assert_eq!(s.state(), EditState::Dirty);
        assert_eq!(s.staged(), &payload(12.0));
        assert_eq!(s.remote(), &payload(11.0));
    }

    #[test]
    fn test_resolve_take_remote() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        s.on_remote_update(payload(11.0));

        s.resolve(Resolution::TakeRemote).unwrap();
        assert_eq!(s.state(), EditState::Clean);
        assert_eq!(s.staged(), &payload(11.0));
    }

    #[test]
    fn test_resolve_merged() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        s.on_remote_update(payload(11.0));

        let mut merged = payload(11.0);
        merged.insert("vendor".to_string(), FieldValue::from("ACME"));
        s.resolve(Resolution::Merged(merged.clone())).unwrap();
        assert_eq!(s.state(), EditState::Dirty);
        assert_eq!(s.staged(), &merged);
    }

    #[test]
    fn test_edit_while_conflicted_stays_conflicted() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        s.on_remote_update(payload(11.0));

        s.set_field("amount", 13.0).unwrap();
        assert_eq!(s.state(), EditState::Conflicted);
        assert!(s.begin_save().is_err());
    }

    #[test]
    fn test_discard() {
        let mut s = session();
        s.set_field("amount", 12.0).unwrap();
        s.clear_field("amount").unwrap();
        assert_eq!(s.changed_fields(), vec!["amount"]);

        s.discard().unwrap();
        assert_eq!(s.state(), EditState::Clean);
        assert_eq!(s.staged(), &payload(10.0));
    }
}
