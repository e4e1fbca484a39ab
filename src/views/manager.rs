//! Activation registry: at most one live activation per view.

use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::active::ActiveView;
use super::plan::plan_for;
use super::{ViewContext, ViewKey};

/// Opens and closes views on behalf of the presentation layer.
pub struct ViewManager {
    collaborators: Collaborators,
    config: EngineConfig,
    active: Mutex<HashMap<ViewKey, Arc<ActiveView>>>,
    generation: AtomicU64,
}

impl ViewManager {
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        Self {
            collaborators,
            config,
            active: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(1),
        }
    }

    /// Activate `key`, or return the activation already running.
    ///
    /// The user is read once here and fixed for the life of the activation.
    pub fn activate(&self, key: ViewKey) -> Result<Arc<ActiveView>> {
        let mut active = self.active.lock();

        if let Some(view) = active.get(&key) {
            if !view.is_closed() {
                debug!(view = %key, generation = view.generation(), "view already active");
                return Ok(Arc::clone(view));
            }
        }

        let user = match self.collaborators.auth.current_user() {
            Some(user) => user,
            None => {
                warn!(view = %key, "activation without an authenticated user");
                return Err(EngineError::Unauthenticated);
            }
        };

        let context = ViewContext {
            user,
            generation: self.generation.fetch_add(1, Ordering::SeqCst),
        };
        let plans = plan_for(&key, &context, &self.config);
        let view = ActiveView::start(key.clone(), context, plans, &self.collaborators, &self.config);
        active.insert(key, Arc::clone(&view));
        Ok(view)
    }

    /// Deactivate `key`, closing every subscription it opened.
    ///
    /// Returns false if the view was not active.
    pub fn deactivate(&self, key: &ViewKey) -> bool {
        let view = self.active.lock().remove(key);
        match view {
            Some(view) => {
                view.close();
                true
            }
            None => false,
        }
    }

    /// Deactivate every view (e.g. on sign-out). Returns how many were closed.
    pub fn deactivate_all(&self) -> usize {
        let views: Vec<Arc<ActiveView>> = self.active.lock().drain().map(|(_, v)| v).collect();
        for view in &views {
            view.close();
        }
        views.len()
    }

    pub fn is_active(&self, key: &ViewKey) -> bool {
        self.active.lock().contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// The current activation of `key`, if any.
    pub fn view(&self, key: &ViewKey) -> Option<Arc<ActiveView>> {
        self.active.lock().get(key).cloned()
    }
}

impl Drop for ViewManager {
    fn drop(&mut self) {
        self.deactivate_all();
    }
}
