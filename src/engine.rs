//! Engine facade tying configuration, collaborators and views together.

use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::upload::{prepare_batch, Document, UploadSummary};
use crate::views::{ActiveView, ViewKey, ViewManager};
use std::sync::Arc;
use tracing::{debug, info};

/// The reconciliation engine.
///
/// Thread-safe; share it behind an `Arc` between the presentation layer and
/// whatever threads drive dispatch.
pub struct Engine {
    config: EngineConfig,
    collaborators: Collaborators,
    views: ViewManager,
}

impl Engine {
    /// Create an engine. Fails if the configuration is invalid.
    pub fn new(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        info!(
            log_capacity = config.log_capacity,
            subscription_buffer = config.subscription_buffer,
            "engine started"
        );
        Ok(Self {
            views: ViewManager::new(collaborators.clone(), config.clone()),
            config,
            collaborators,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Activate a view. Idempotent while the view stays active.
    pub fn activate(&self, key: ViewKey) -> Result<Arc<ActiveView>> {
        self.views.activate(key)
    }

    pub fn deactivate(&self, key: &ViewKey) -> bool {
        self.views.deactivate(key)
    }

    pub fn deactivate_all(&self) -> usize {
        self.views.deactivate_all()
    }

    pub fn view(&self, key: &ViewKey) -> Option<Arc<ActiveView>> {
        self.views.view(key)
    }

    pub fn views(&self) -> &ViewManager {
        &self.views
    }

    /// Send documents to the extraction pipeline for the current user.
    ///
    /// Non-image documents are skipped; the rest are renamed with a content
    /// tag. An empty batch is not sent.
    pub fn upload(&self, documents: Vec<Document>) -> Result<UploadSummary> {
        let owner = self
            .collaborators
            .auth
            .current_user()
            .ok_or(EngineError::Unauthenticated)?;
        let uploader = self.collaborators.uploader.as_ref().ok_or_else(|| {
            EngineError::InvalidConfig("no upload client configured".to_string())
        })?;

        let offered = documents.len();
        let batch = prepare_batch(documents);
        if batch.is_empty() {
            debug!(offered, "no image documents to upload");
            return Ok(UploadSummary::default());
        }

        let receipts = uploader.upload(&owner, &batch)?;
        let summary = UploadSummary::tally(&receipts);
        info!(
            owner = %owner,
            offered,
            sent = batch.len(),
            accepted = summary.accepted,
            rejected = summary.rejected,
            "upload finished"
        );
        Ok(summary)
    }
}
