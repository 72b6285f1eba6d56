//! In-memory event store.
//!
//! Owns the canonical local representation of appointments-as-events plus
//! the last-known external snapshots used for diffing. Pure data access -
//! no sync logic lives here. The external snapshot is a disposable cache:
//! it is read by the conflict detector and written only by the sync engine
//! after a successful write phase, and can be rebuilt from the provider at
//! any time.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::SyncConfiguration;
use crate::conflict::{AppliedResolution, ConflictDetails};
use crate::engine::SyncResult;
use crate::error::{EngineResult, SyncError};
use crate::event::SyncEvent;

/// Sync results kept per configuration before the oldest are dropped.
const MAX_HISTORY: usize = 100;

#[derive(Default)]
struct Inner {
    configurations: HashMap<Uuid, SyncConfiguration>,
    /// Local events per configuration, keyed by event id.
    local_events: HashMap<Uuid, HashMap<String, SyncEvent>>,
    /// Last-known remote state per configuration, keyed by external id.
    snapshots: HashMap<Uuid, HashMap<String, SyncEvent>>,
    conflicts: HashMap<Uuid, ConflictDetails>,
    history: HashMap<Uuid, Vec<SyncResult>>,
}

#[derive(Default)]
pub struct EventStore {
    inner: RwLock<Inner>,
}

impl EventStore {
    pub fn new() -> Self {
        EventStore::default()
    }

    // ------------------------------------------------------------------
    // Configurations
    // ------------------------------------------------------------------

    pub fn insert_config(&self, config: SyncConfiguration) {
        let mut inner = self.inner.write().unwrap();
        inner.configurations.insert(config.id, config);
    }

    pub fn get_config(&self, id: Uuid) -> EngineResult<SyncConfiguration> {
        let inner = self.inner.read().unwrap();
        inner
            .configurations
            .get(&id)
            .cloned()
            .ok_or(SyncError::ConfigNotFound(id))
    }

    /// Replace a stored configuration with an updated copy.
    pub fn save_config(&self, config: SyncConfiguration) -> EngineResult<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.configurations.contains_key(&config.id) {
            return Err(SyncError::ConfigNotFound(config.id));
        }
        inner.configurations.insert(config.id, config);
        Ok(())
    }

    pub fn list_configs(&self) -> Vec<SyncConfiguration> {
        let inner = self.inner.read().unwrap();
        let mut configs: Vec<_> = inner.configurations.values().cloned().collect();
        configs.sort_by_key(|c| c.created_at);
        configs
    }

    /// Enabled configurations whose `next_sync` has passed.
    pub fn due_configs(&self, now: DateTime<Utc>) -> Vec<SyncConfiguration> {
        let inner = self.inner.read().unwrap();
        inner
            .configurations
            .values()
            .filter(|c| c.is_due(now))
            .cloned()
            .collect()
    }

    /// Soft-disable: history and events are preserved.
    pub fn disable_config(&self, id: Uuid) -> EngineResult<()> {
        let mut inner = self.inner.write().unwrap();
        let config = inner
            .configurations
            .get_mut(&id)
            .ok_or(SyncError::ConfigNotFound(id))?;
        config.enabled = false;
        config.next_sync = None;
        config.updated_at = Utc::now();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local events
    // ------------------------------------------------------------------

    pub fn upsert_local_event(&self, config_id: Uuid, event: SyncEvent) {
        let mut inner = self.inner.write().unwrap();
        inner
            .local_events
            .entry(config_id)
            .or_default()
            .insert(event.id.clone(), event);
    }

    pub fn local_events(&self, config_id: Uuid) -> Vec<SyncEvent> {
        let inner = self.inner.read().unwrap();
        inner
            .local_events
            .get(&config_id)
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get_local_event(&self, config_id: Uuid, event_id: &str) -> Option<SyncEvent> {
        let inner = self.inner.read().unwrap();
        inner
            .local_events
            .get(&config_id)
            .and_then(|events| events.get(event_id))
            .cloned()
    }

    pub fn remove_local_event(&self, config_id: Uuid, event_id: &str) -> Option<SyncEvent> {
        let mut inner = self.inner.write().unwrap();
        inner
            .local_events
            .get_mut(&config_id)
            .and_then(|events| events.remove(event_id))
    }

    // ------------------------------------------------------------------
    // External snapshots
    // ------------------------------------------------------------------

    pub fn snapshot(&self, config_id: Uuid) -> HashMap<String, SyncEvent> {
        let inner = self.inner.read().unwrap();
        inner.snapshots.get(&config_id).cloned().unwrap_or_default()
    }

    /// Replace the snapshot wholesale. Only the sync engine calls this,
    /// after a successful write phase.
    pub fn replace_snapshot(&self, config_id: Uuid, snapshot: HashMap<String, SyncEvent>) {
        let mut inner = self.inner.write().unwrap();
        inner.snapshots.insert(config_id, snapshot);
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Insert a conflict, enforcing at most one open conflict per pair.
    ///
    /// If an open conflict for the same pair already exists, it is returned
    /// unchanged and the new record is dropped.
    pub fn insert_conflict(&self, conflict: ConflictDetails) -> ConflictDetails {
        let mut inner = self.inner.write().unwrap();
        let key = conflict.pair_key();
        if let Some(existing) = inner
            .conflicts
            .values()
            .find(|c| c.is_open() && c.config_id == conflict.config_id && c.pair_key() == key)
        {
            return existing.clone();
        }
        inner.conflicts.insert(conflict.id, conflict.clone());
        conflict
    }

    pub fn get_conflict(&self, id: Uuid) -> Option<ConflictDetails> {
        let inner = self.inner.read().unwrap();
        inner.conflicts.get(&id).cloned()
    }

    pub fn open_conflicts(&self, config_id: Option<Uuid>) -> Vec<ConflictDetails> {
        let inner = self.inner.read().unwrap();
        let mut conflicts: Vec<_> = inner
            .conflicts
            .values()
            .filter(|c| c.is_open() && config_id.is_none_or(|id| c.config_id == id))
            .cloned()
            .collect();
        conflicts.sort_by_key(|c| c.detected_at);
        conflicts
    }

    /// Mark a conflict resolved, recording the applied resolution.
    pub fn record_resolution(
        &self,
        conflict_id: Uuid,
        resolution: AppliedResolution,
    ) -> EngineResult<ConflictDetails> {
        let mut inner = self.inner.write().unwrap();
        let conflict = inner.conflicts.get_mut(&conflict_id).ok_or_else(|| {
            SyncError::Validation(format!("unknown conflict: {conflict_id}"))
        })?;
        if conflict.resolved_at.is_none() {
            conflict.resolved_at = Some(resolution.applied_at);
            conflict.resolution = Some(resolution);
            conflict.resolution_required = false;
        }
        Ok(conflict.clone())
    }

    // ------------------------------------------------------------------
    // Sync history
    // ------------------------------------------------------------------

    pub fn record_result(&self, result: SyncResult) {
        let mut inner = self.inner.write().unwrap();
        let history = inner.history.entry(result.config_id).or_default();
        history.push(result);
        if history.len() > MAX_HISTORY {
            let excess = history.len() - MAX_HISTORY;
            history.drain(..excess);
        }
    }

    /// Sync results for a configuration, oldest first.
    pub fn history(&self, config_id: Uuid) -> Vec<SyncResult> {
        let inner = self.inner.read().unwrap();
        inner.history.get(&config_id).cloned().unwrap_or_default()
    }
}
