//! Conflict detection and resolution.
//!
//! The detector classifies divergence between a local event and its remote
//! counterpart; the resolver applies the configured strategy to produce a
//! deterministic outcome or flags the conflict for manual resolution.

pub mod detector;
pub mod resolver;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConflictStrategy;
use crate::event::SyncEvent;

pub use detector::{ConflictDetector, PairState};
pub use resolver::{ConflictResolver, FieldAuthority, MergePolicy, ResolutionOutcome, Side};

/// Kind of divergence between a local and a remote event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// The local event's window intersects a different, unlinked remote
    /// event's window on the same calendar.
    TimeOverlap,
    /// A linked pair where both sides changed since the last sync.
    ContentMismatch,
    /// One side's linked event is gone while the other side was modified.
    DeletionConflict,
}

/// A detected conflict between one local and one remote event.
///
/// Either side may be absent for deletion conflicts, never both.
/// Conflicts are append-only until resolved; resolution is recorded on the
/// record, never silently discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictDetails {
    pub id: Uuid,
    pub config_id: Uuid,
    pub conflict_type: ConflictType,
    pub local: Option<SyncEvent>,
    pub remote: Option<SyncEvent>,
    pub detected_at: DateTime<Utc>,
    /// True when the strategy is `prompt` and a human must decide.
    pub resolution_required: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution: Option<AppliedResolution>,
}

impl ConflictDetails {
    pub fn new(
        config_id: Uuid,
        conflict_type: ConflictType,
        local: Option<SyncEvent>,
        remote: Option<SyncEvent>,
    ) -> Self {
        debug_assert!(local.is_some() || remote.is_some());
        ConflictDetails {
            id: Uuid::new_v4(),
            config_id,
            conflict_type,
            local,
            remote,
            detected_at: Utc::now(),
            resolution_required: false,
            resolved_at: None,
            resolution: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Key identifying the pair this conflict is about, used to guarantee at
    /// most one open conflict per pair.
    pub fn pair_key(&self) -> String {
        let linked = self
            .local
            .as_ref()
            .and_then(|e| e.external_id.as_deref())
            .or_else(|| self.remote.as_ref().and_then(|e| e.external_id.as_deref()));
        match linked {
            Some(ext) => format!("ext:{ext}"),
            None => {
                let local_id = self.local.as_ref().map(|e| e.id.as_str()).unwrap_or("");
                let remote_id = self.remote.as_ref().map(|e| e.id.as_str()).unwrap_or("");
                format!("ids:{local_id}:{remote_id}")
            }
        }
    }
}

/// Record of how a conflict was resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedResolution {
    pub strategy: ConflictStrategy,
    pub outcome: ResolutionOutcome,
    pub applied_at: DateTime<Utc>,
}
