//! Trigger processor: the process-wide snapshot of active rules.
//!
//! `refresh` is the only operation that touches storage. Matching reads the
//! current snapshot and is pure. Rule authoring calls `refresh` after every
//! mutation; the worker may additionally refresh on a staleness bound.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use stockflow_automation::{AutomationRule, RuleSnapshot};
use stockflow_events::TriggerEvent;

use crate::rules::{RuleStore, RuleStoreError};

pub struct TriggerProcessor {
    store: Arc<dyn RuleStore>,
    snapshot: RwLock<Arc<RuleSnapshot>>,
}

impl TriggerProcessor {
    /// Start with an empty snapshot; call [`refresh`](Self::refresh) to load.
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(RuleSnapshot::empty())),
        }
    }

    /// Build a processor and load its first snapshot.
    pub fn load(store: Arc<dyn RuleStore>) -> Result<Self, RuleStoreError> {
        let processor = Self::new(store);
        processor.refresh()?;
        Ok(processor)
    }

    /// Reload active rules from storage and swap the snapshot.
    ///
    /// On failure the previous snapshot stays in place.
    pub fn refresh(&self) -> Result<usize, RuleStoreError> {
        let rules = self.store.list_active_rules()?;
        let snapshot = Arc::new(RuleSnapshot::build(rules));
        let count = snapshot.len();

        let mut current = self
            .snapshot
            .write()
            .map_err(|_| RuleStoreError::Storage("rule snapshot lock poisoned".into()))?;
        *current = snapshot;

        info!(active_rules = count, "rule snapshot refreshed");
        Ok(count)
    }

    /// Active rules accepting `event`; empty when nothing matches.
    pub fn matching(&self, event: &TriggerEvent) -> Vec<AutomationRule> {
        let rules = self.snapshot().matching(event);
        debug!(
            entity = event.entity_name(),
            event_type = %event.event_type(),
            matched = rules.len(),
            "matched trigger event"
        );
        rules
    }

    pub fn snapshot(&self) -> Arc<RuleSnapshot> {
        match self.snapshot.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => {
                warn!("rule snapshot lock poisoned; using last snapshot");
                poisoned.into_inner().clone()
            }
        }
    }

    /// Whether the snapshot is older than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let age = Utc::now() - self.snapshot().loaded_at();
        age.to_std().map(|age| age > max_age).unwrap_or(false)
    }

    /// Refresh only when the snapshot is older than `max_age`.
    pub fn refresh_if_stale(&self, max_age: Duration) -> Result<Option<usize>, RuleStoreError> {
        if self.is_stale(max_age) {
            self.refresh().map(Some)
        } else {
            Ok(None)
        }
    }
}

impl core::fmt::Debug for TriggerProcessor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("TriggerProcessor")
            .field("active_rules", &snapshot.len())
            .field("loaded_at", &snapshot.loaded_at())
            .finish()
    }
}
