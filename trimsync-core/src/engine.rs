//! Sync cycle orchestration.
//!
//! One cycle walks the state machine `idle -> fetching_remote -> diffing ->
//! resolving_conflicts -> applying_writes -> completed | failed`: pull the
//! remote delta through the provider adapter, diff against the store,
//! classify and resolve conflicts, apply writes partitioned by sync
//! direction, and record an immutable [`SyncResult`].
//!
//! Cycles are single-flight per configuration: overlapping triggers from
//! the scheduler and the webhook ingestor coalesce into one pending rerun.
//! All cycle state lives in an explicit plan passed through the stages -
//! there are no shared mutable globals.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{ConflictStrategy, SyncConfiguration};
use crate::conflict::{
    ConflictDetails, ConflictDetector, ConflictResolver, ConflictType, PairState,
    ResolutionOutcome,
};
use crate::error::{EngineResult, SyncError};
use crate::event::{EventStatus, SyncEvent, LINK_SIMILARITY_THRESHOLD};
use crate::monitor::{MonitorEvent, SyncMonitor};
use crate::providers::ProviderAdapter;
use crate::store::EventStore;

/// Wall-clock limit for one cycle before it is failed.
const DEFAULT_CYCLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Concurrent remote writes per provider within one cycle.
const DEFAULT_WRITE_CONCURRENCY: usize = 4;

/// States of the sync cycle state machine. `Idle` is the rest state
/// between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    FetchingRemote,
    Diffing,
    ResolvingConflicts,
    ApplyingWrites,
    Completed,
    Failed,
}

/// Immutable record of one sync cycle, returned to the caller and kept as
/// an audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub config_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub events_processed: usize,
    pub events_created: usize,
    pub events_updated: usize,
    pub events_deleted: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub next_sync_at: Option<DateTime<Utc>>,
}

impl SyncResult {
    pub fn empty(config_id: Uuid) -> Self {
        SyncResult {
            config_id,
            started_at: Utc::now(),
            duration_ms: 0,
            events_processed: 0,
            events_created: 0,
            events_updated: 0,
            events_deleted: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            next_sync_at: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        self.events_created > 0 || self.events_updated > 0 || self.events_deleted > 0
    }
}

/// Seam through which the engine obtains the adapter for a configuration.
pub trait AdapterFactory: Send + Sync {
    fn adapter(&self, config: &SyncConfiguration) -> EngineResult<Arc<dyn ProviderAdapter>>;
}

/// Default factory backed by per-user provider credentials.
#[derive(Default)]
pub struct CredentialFactory {
    credentials: StdMutex<HashMap<(Uuid, crate::config::CalendarProvider), crate::providers::ProviderCredentials>>,
}

impl CredentialFactory {
    pub fn new() -> Self {
        CredentialFactory::default()
    }

    pub fn set_credentials(
        &self,
        user_id: Uuid,
        provider: crate::config::CalendarProvider,
        credentials: crate::providers::ProviderCredentials,
    ) {
        self.credentials
            .lock()
            .unwrap()
            .insert((user_id, provider), credentials);
    }
}

impl AdapterFactory for CredentialFactory {
    fn adapter(&self, config: &SyncConfiguration) -> EngineResult<Arc<dyn ProviderAdapter>> {
        let credentials = self
            .credentials
            .lock()
            .unwrap()
            .get(&(config.user_id, config.provider))
            .cloned()
            .ok_or_else(|| {
                SyncError::Auth(format!(
                    "no {} credentials stored for user {}",
                    config.provider, config.user_id
                ))
            })?;
        crate::providers::adapter_for(config.provider, &credentials)
    }
}

#[derive(Default)]
struct FlightState {
    running: bool,
    pending: bool,
}

pub struct SyncEngine {
    store: Arc<EventStore>,
    monitor: Arc<SyncMonitor>,
    adapters: Arc<dyn AdapterFactory>,
    resolver: ConflictResolver,
    flights: StdMutex<HashMap<Uuid, FlightState>>,
    cycle_timeout: Duration,
    write_concurrency: usize,
}

impl SyncEngine {
    pub fn new(
        store: Arc<EventStore>,
        monitor: Arc<SyncMonitor>,
        adapters: Arc<dyn AdapterFactory>,
    ) -> Self {
        SyncEngine {
            store,
            monitor,
            adapters,
            resolver: ConflictResolver::default(),
            flights: StdMutex::new(HashMap::new()),
            cycle_timeout: DEFAULT_CYCLE_TIMEOUT,
            write_concurrency: DEFAULT_WRITE_CONCURRENCY,
        }
    }

    pub fn with_cycle_timeout(mut self, timeout: Duration) -> Self {
        self.cycle_timeout = timeout;
        self
    }

    pub fn with_write_concurrency(mut self, concurrency: usize) -> Self {
        self.write_concurrency = concurrency.max(1);
        self
    }

    /// Trigger a delta sync cycle for a configuration.
    ///
    /// Returns `Ok(None)` when a cycle is already in flight; the trigger is
    /// coalesced into one pending rerun executed by the flight holder.
    pub async fn trigger(&self, config_id: Uuid) -> EngineResult<Option<SyncResult>> {
        self.trigger_opts(config_id, false).await
    }

    /// Trigger a full resync, ignoring `last_sync` deltas.
    pub async fn trigger_full(&self, config_id: Uuid) -> EngineResult<Option<SyncResult>> {
        self.trigger_opts(config_id, true).await
    }

    /// Drop any pending (not yet started) coalesced trigger. Does not
    /// interrupt an in-flight cycle.
    pub fn cancel_pending(&self, config_id: Uuid) {
        if let Some(state) = self.flights.lock().unwrap().get_mut(&config_id) {
            state.pending = false;
        }
    }

    async fn trigger_opts(&self, config_id: Uuid, full: bool) -> EngineResult<Option<SyncResult>> {
        {
            let mut flights = self.flights.lock().unwrap();
            let state = flights.entry(config_id).or_default();
            if state.running {
                state.pending = true;
                tracing::debug!(%config_id, "cycle in flight, trigger coalesced");
                return Ok(None);
            }
            state.running = true;
        }

        let mut full = full;
        let mut last = None;
        loop {
            let cycle = self.run_cycle(config_id, full).await;
            let result = match cycle {
                Ok(result) => result,
                Err(err) => {
                    self.release_flight(config_id);
                    return Err(err);
                }
            };
            last = Some(result);

            let rerun = {
                let mut flights = self.flights.lock().unwrap();
                let state = flights.entry(config_id).or_default();
                if state.pending {
                    state.pending = false;
                    true
                } else {
                    state.running = false;
                    false
                }
            };
            if !rerun {
                break;
            }
            // Coalesced reruns are always deltas.
            full = false;
        }

        Ok(last)
    }

    fn release_flight(&self, config_id: Uuid) {
        if let Some(state) = self.flights.lock().unwrap().get_mut(&config_id) {
            state.running = false;
            state.pending = false;
        }
    }

    async fn run_cycle(&self, config_id: Uuid, full: bool) -> EngineResult<SyncResult> {
        let config = self.store.get_config(config_id)?;
        if !config.enabled {
            return Err(SyncError::Validation(format!(
                "configuration {config_id} is disabled"
            )));
        }

        let started = Utc::now();
        let clock = std::time::Instant::now();
        self.monitor.publish(MonitorEvent::SyncStarted {
            config_id,
            at: started,
        });

        let adapter = match self.adapters.adapter(&config) {
            Ok(adapter) => adapter,
            Err(err) => return Ok(self.fail_cycle(config, started, clock, err)),
        };

        let outcome = tokio::time::timeout(
            self.cycle_timeout,
            self.execute(&config, adapter.as_ref(), full, started),
        )
        .await;

        let result = match outcome {
            Ok(Ok(partial)) => self.complete_cycle(config, started, clock, partial),
            Ok(Err(err)) => self.fail_cycle(config, started, clock, err),
            Err(_) => self.fail_cycle(
                config,
                started,
                clock,
                SyncError::Timeout(self.cycle_timeout.as_secs()),
            ),
        };
        self.store.record_result(result.clone());
        Ok(result)
    }

    async fn execute(
        &self,
        config: &SyncConfiguration,
        adapter: &dyn ProviderAdapter,
        full: bool,
        started: DateTime<Utc>,
    ) -> EngineResult<SyncResult> {
        self.progress(config.id, CyclePhase::FetchingRemote);
        let full_fetch = full || config.last_sync.is_none() || !adapter.supports_delta();
        let since = if full_fetch { None } else { config.last_sync };
        let remote = adapter
            .fetch_events(&config.external_calendar_id, since)
            .await?;

        self.progress(config.id, CyclePhase::Diffing);
        let locals = self.store.local_events(config.id);
        let snapshot = self.store.snapshot(config.id);
        let open = open_conflict_index(&self.store.open_conflicts(Some(config.id)));
        let mut plan = build_plan(config, &locals, &snapshot, &remote, full_fetch, &open);

        let mut result = SyncResult::empty(config.id);
        result.started_at = started;
        result.events_processed = locals.len() + remote.len();

        self.progress(config.id, CyclePhase::ResolvingConflicts);
        for mut conflict in std::mem::take(&mut plan.conflicts) {
            let strategy = config.conflict_resolution;
            if strategy == ConflictStrategy::Prompt {
                conflict.resolution_required = true;
            }
            let stored = self.store.insert_conflict(conflict);
            result.conflicts_detected += 1;
            self.monitor.publish(MonitorEvent::ConflictDetected {
                config_id: config.id,
                conflict_id: stored.id,
                conflict_type: stored.conflict_type,
            });

            if strategy == ConflictStrategy::Prompt {
                // Held for a human; the pair is excluded from this cycle's
                // writes by construction.
                continue;
            }

            let outcome = self.resolver.resolve(&stored, strategy, started);
            plan.writes
                .extend(writes_for_resolution(&stored, &outcome));
            self.store
                .record_resolution(stored.id, ConflictResolver::applied(strategy, outcome, started))?;
            result.conflicts_resolved += 1;
        }

        self.progress(config.id, CyclePhase::ApplyingWrites);
        self.apply_writes(config, adapter, plan.writes, full_fetch, &remote, snapshot, &mut result)
            .await;

        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_writes(
        &self,
        config: &SyncConfiguration,
        adapter: &dyn ProviderAdapter,
        writes: Vec<WriteOp>,
        full_fetch: bool,
        remote_fetch: &[SyncEvent],
        old_snapshot: HashMap<String, SyncEvent>,
        result: &mut SyncResult,
    ) {
        // Fresh remote view that the write phase refines. Failed writes
        // leave the old entry in place so the next cycle retries them.
        let mut snapshot = if full_fetch {
            remote_fetch
                .iter()
                .filter(|r| r.status != EventStatus::Cancelled)
                .filter_map(|r| r.external_id.clone().map(|ext| (ext, r.clone())))
                .collect()
        } else {
            let mut snapshot = old_snapshot;
            for fresh in remote_fetch {
                let Some(ext) = fresh.external_id.clone() else {
                    continue;
                };
                if fresh.status == EventStatus::Cancelled {
                    snapshot.remove(&ext);
                } else {
                    snapshot.insert(ext, fresh.clone());
                }
            }
            snapshot
        };

        // Local writes are fast and applied inline.
        let mut remote_ops = Vec::new();
        for op in writes {
            match op {
                WriteOp::CreateLocal { event } => {
                    self.store.upsert_local_event(config.id, event);
                    result.events_created += 1;
                }
                WriteOp::UpdateLocal { event } => {
                    self.store.upsert_local_event(config.id, event);
                    result.events_updated += 1;
                }
                WriteOp::DeleteLocal { event_id } => {
                    if self.store.remove_local_event(config.id, &event_id).is_some() {
                        result.events_deleted += 1;
                    }
                }
                WriteOp::LinkLocal {
                    event_id,
                    external_id,
                } => {
                    if let Some(mut local) = self.store.get_local_event(config.id, &event_id) {
                        local.external_id = Some(external_id);
                        self.store.upsert_local_event(config.id, local);
                    }
                }
                remote_op => remote_ops.push(remote_op),
            }
        }

        // Remote writes run with bounded concurrency per provider; one
        // failed item never aborts the cycle.
        let calendar_id = config.external_calendar_id.as_str();
        let applied: Vec<Result<RemoteApplied, String>> = stream::iter(remote_ops)
            .map(|op| async move {
                match op {
                    WriteOp::CreateRemote { local_id, event } => adapter
                        .create_event(calendar_id, &event)
                        .await
                        .map(|created| RemoteApplied::Created {
                            local_id,
                            event: created,
                        })
                        .map_err(|e| format!("create '{}' failed: {e}", event.title)),
                    WriteOp::UpdateRemote { event } => adapter
                        .update_event(calendar_id, &event)
                        .await
                        .map(|updated| RemoteApplied::Updated { event: updated })
                        .map_err(|e| format!("update '{}' failed: {e}", event.title)),
                    WriteOp::DeleteRemote { external_id } => adapter
                        .delete_event(calendar_id, &external_id)
                        .await
                        .map(|()| RemoteApplied::Deleted { external_id })
                        .map_err(|e| format!("delete failed: {e}")),
                    // Local ops were split off above.
                    _ => unreachable!("local op in remote write set"),
                }
            })
            .buffer_unordered(self.write_concurrency)
            .collect()
            .await;

        for outcome in applied {
            match outcome {
                Ok(RemoteApplied::Created { local_id, event }) => {
                    if let Some(mut local) = self.store.get_local_event(config.id, &local_id) {
                        local.external_id = event.external_id.clone();
                        self.store.upsert_local_event(config.id, local);
                    }
                    if let Some(ext) = event.external_id.clone() {
                        snapshot.insert(ext, event);
                    }
                    result.events_created += 1;
                }
                Ok(RemoteApplied::Updated { event }) => {
                    if let Some(ext) = event.external_id.clone() {
                        snapshot.insert(ext, event);
                    }
                    result.events_updated += 1;
                }
                Ok(RemoteApplied::Deleted { external_id }) => {
                    snapshot.remove(&external_id);
                    result.events_deleted += 1;
                }
                Err(warning) => {
                    tracing::warn!(config_id = %config.id, %warning, "remote write failed");
                    result.warnings.push(warning);
                }
            }
        }

        self.store.replace_snapshot(config.id, snapshot);
    }

    fn complete_cycle(
        &self,
        mut config: SyncConfiguration,
        started: DateTime<Utc>,
        clock: std::time::Instant,
        mut result: SyncResult,
    ) -> SyncResult {
        config.record_success(started);
        result.duration_ms = clock.elapsed().as_millis() as i64;
        result.next_sync_at = config.next_sync;
        if let Err(err) = self.store.save_config(config) {
            result.warnings.push(format!("failed to save configuration: {err}"));
        }

        self.progress(result.config_id, CyclePhase::Completed);
        self.monitor.publish(MonitorEvent::SyncCompleted {
            config_id: result.config_id,
            result: result.clone(),
        });
        result
    }

    fn fail_cycle(
        &self,
        mut config: SyncConfiguration,
        started: DateTime<Utc>,
        clock: std::time::Instant,
        error: SyncError,
    ) -> SyncResult {
        let message = error.to_string();
        tracing::error!(config_id = %config.id, %message, "sync cycle failed");

        // Auth failures pause the configuration until re-auth; everything
        // else backs off exponentially.
        if matches!(error, SyncError::Auth(_)) {
            config.degrade(&message, started);
        } else {
            config.record_failure(&message, started);
        }

        let mut result = SyncResult::empty(config.id);
        result.started_at = started;
        result.duration_ms = clock.elapsed().as_millis() as i64;
        result.errors.push(message.clone());
        result.next_sync_at = config.next_sync;

        let config_id = config.id;
        if let Err(err) = self.store.save_config(config) {
            result.warnings.push(format!("failed to save configuration: {err}"));
        }

        self.progress(config_id, CyclePhase::Failed);
        self.monitor
            .publish(MonitorEvent::SyncError { config_id, message });
        result
    }

    fn progress(&self, config_id: Uuid, phase: CyclePhase) {
        self.monitor
            .publish(MonitorEvent::Progress { config_id, phase });
    }
}

// ---------------------------------------------------------------------------
// Cycle planning
// ---------------------------------------------------------------------------

/// A single write decided during diffing or conflict resolution.
#[derive(Debug, Clone)]
enum WriteOp {
    CreateRemote { local_id: String, event: SyncEvent },
    UpdateRemote { event: SyncEvent },
    DeleteRemote { external_id: String },
    CreateLocal { event: SyncEvent },
    UpdateLocal { event: SyncEvent },
    DeleteLocal { event_id: String },
    LinkLocal { event_id: String, external_id: String },
}

enum RemoteApplied {
    Created { local_id: String, event: SyncEvent },
    Updated { event: SyncEvent },
    Deleted { external_id: String },
}

#[derive(Default)]
struct CyclePlan {
    writes: Vec<WriteOp>,
    conflicts: Vec<ConflictDetails>,
}

/// Index of events involved in open conflicts: external ids of linked
/// pairs and event ids of unlinked pairs. Those pairs are excluded from
/// diffing until the conflict is resolved.
#[derive(Default)]
struct OpenConflictIndex {
    external_ids: HashSet<String>,
    event_ids: HashSet<String>,
}

fn open_conflict_index(open: &[ConflictDetails]) -> OpenConflictIndex {
    let mut index = OpenConflictIndex::default();
    for conflict in open {
        for event in conflict.local.iter().chain(conflict.remote.iter()) {
            index.event_ids.insert(event.id.clone());
            if let Some(ext) = &event.external_id {
                index.external_ids.insert(ext.clone());
            }
        }
    }
    index
}

/// Build the cycle plan: correspondence by `external_id`, best-effort
/// matching for first-time links, conflict classification, and directional
/// writes. O(local + remote) via the external-id index, except the
/// best-effort matching pass which only touches still-unlinked events.
fn build_plan(
    config: &SyncConfiguration,
    locals: &[SyncEvent],
    snapshot: &HashMap<String, SyncEvent>,
    remote: &[SyncEvent],
    full_fetch: bool,
    open: &OpenConflictIndex,
) -> CyclePlan {
    let mut plan = CyclePlan::default();
    let direction = config.sync_direction;
    let last_sync = config.last_sync;

    let remote_by_ext: HashMap<&str, &SyncEvent> = remote
        .iter()
        .filter_map(|r| r.external_id.as_deref().map(|ext| (ext, r)))
        .collect();
    let linked_exts: HashSet<&str> = locals
        .iter()
        .filter_map(|l| l.external_id.as_deref())
        .collect();

    // Linked pairs. Pairs with an open conflict are skipped until resolved.
    for local in locals.iter().filter(|l| l.is_linked()) {
        let ext = local.external_id.as_deref().unwrap_or_default();
        if open.external_ids.contains(ext) {
            continue;
        }
        let fresh = remote_by_ext.get(ext).copied();
        let snap = snapshot.get(ext);

        let fresh_cancelled = fresh.is_some_and(|r| r.status == EventStatus::Cancelled);
        let remote_current: Option<SyncEvent> = if fresh_cancelled {
            None
        } else if let Some(r) = fresh {
            Some(r.clone())
        } else if full_fetch {
            None
        } else {
            // Absent from a delta fetch means unchanged.
            snap.cloned()
        };

        if remote_current.is_none() && snap.is_none() && fresh.is_none() && !full_fetch {
            // Linked out of band and no baseline; a full fetch will settle it.
            tracing::debug!(event = %local.id, "linked pair without baseline, skipping until full fetch");
            continue;
        }

        match ConflictDetector::assess_pair(Some(local), snap, remote_current.as_ref(), last_sync) {
            PairState::InSync => {}
            PairState::LocalChanged => {
                if direction.exports() {
                    plan.writes.push(WriteOp::UpdateRemote {
                        event: local.clone(),
                    });
                }
            }
            PairState::RemoteChanged => {
                if direction.imports() {
                    if let Some(remote_event) = remote_current {
                        plan.writes.push(WriteOp::UpdateLocal {
                            event: content_as_local(&remote_event, Some(local), Some(ext)),
                        });
                    }
                }
            }
            PairState::BothChanged => {
                plan.conflicts.push(ConflictDetails::new(
                    config.id,
                    ConflictType::ContentMismatch,
                    Some(local.clone()),
                    remote_current,
                ));
            }
            PairState::RemoteDeleted { local_modified } => {
                if local_modified {
                    plan.conflicts.push(ConflictDetails::new(
                        config.id,
                        ConflictType::DeletionConflict,
                        Some(local.clone()),
                        None,
                    ));
                } else if direction.imports() {
                    plan.writes.push(WriteOp::DeleteLocal {
                        event_id: local.id.clone(),
                    });
                } else if direction.exports() {
                    // Export-only mirrors push deleted events back out.
                    let mut event = local.clone();
                    event.external_id = None;
                    plan.writes.push(WriteOp::CreateRemote {
                        local_id: local.id.clone(),
                        event,
                    });
                }
            }
            // Local presence is given in this pass.
            PairState::LocalDeleted { .. } => unreachable!(),
        }
    }

    // Snapshot entries whose local side is gone: local deletions.
    for (ext, snap) in snapshot {
        if linked_exts.contains(ext.as_str()) || open.external_ids.contains(ext.as_str()) {
            continue;
        }
        let fresh = remote_by_ext.get(ext.as_str()).copied();
        let fresh_cancelled = fresh.is_some_and(|r| r.status == EventStatus::Cancelled);
        let remote_current = if fresh_cancelled {
            None
        } else if let Some(r) = fresh {
            Some(r.clone())
        } else if full_fetch {
            None
        } else {
            Some(snap.clone())
        };

        let Some(remote_event) = remote_current else {
            // Deleted on both sides independently; nothing left to do.
            continue;
        };

        match ConflictDetector::assess_pair(None, Some(snap), Some(&remote_event), last_sync) {
            PairState::LocalDeleted { remote_modified } => {
                if remote_modified {
                    plan.conflicts.push(ConflictDetails::new(
                        config.id,
                        ConflictType::DeletionConflict,
                        None,
                        Some(remote_event),
                    ));
                } else if direction.exports() {
                    plan.writes.push(WriteOp::DeleteRemote {
                        external_id: ext.clone(),
                    });
                } else if direction.imports() {
                    // Import-only: the provider calendar is the source of
                    // truth, so the local deletion is undone.
                    plan.writes.push(WriteOp::CreateLocal {
                        event: content_as_local(&remote_event, None, Some(ext)),
                    });
                }
            }
            _ => unreachable!("pair without local side must classify as LocalDeleted"),
        }
    }

    // Brand-new remote events and unlinked locals: best-effort matching,
    // overlap detection, then directional creates.
    let mut unmatched_locals: Vec<&SyncEvent> = locals
        .iter()
        .filter(|l| !l.is_linked() && !open.event_ids.contains(&l.id))
        .collect();
    let new_remotes: Vec<&SyncEvent> = remote
        .iter()
        .filter(|r| r.status != EventStatus::Cancelled && !open.event_ids.contains(&r.id))
        .filter(|r| {
            r.external_id
                .as_deref()
                .map(|ext| {
                    !linked_exts.contains(ext)
                        && !snapshot.contains_key(ext)
                        && !open.external_ids.contains(ext)
                })
                .unwrap_or(false)
        })
        .collect();

    let mut unmatched_remotes: Vec<&SyncEvent> = Vec::new();
    for remote_event in new_remotes {
        let best = unmatched_locals
            .iter()
            .enumerate()
            .map(|(i, local)| (i, local.similarity(remote_event)))
            .filter(|(_, score)| *score >= LINK_SIMILARITY_THRESHOLD)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        let Some((index, _)) = best else {
            unmatched_remotes.push(remote_event);
            continue;
        };

        let local = unmatched_locals.remove(index);
        let ext = remote_event.external_id.as_deref().unwrap_or_default();
        plan.writes.push(WriteOp::LinkLocal {
            event_id: local.id.clone(),
            external_id: ext.to_string(),
        });

        // First-time links never conflict: the newer side wins.
        if local.checksum() != remote_event.checksum() {
            if local.modified_at > remote_event.modified_at && direction.exports() {
                let mut event = local.clone();
                event.external_id = Some(ext.to_string());
                plan.writes.push(WriteOp::UpdateRemote { event });
            } else if local.modified_at <= remote_event.modified_at && direction.imports() {
                plan.writes.push(WriteOp::UpdateLocal {
                    event: content_as_local(remote_event, Some(local), Some(ext)),
                });
            }
        }
    }

    // Time overlaps between what is left unlinked on both sides.
    let overlap_pairs: Vec<(String, String)> = {
        let local_refs: Vec<SyncEvent> = unmatched_locals.iter().map(|l| (*l).clone()).collect();
        let remote_refs: Vec<SyncEvent> = unmatched_remotes.iter().map(|r| (*r).clone()).collect();
        ConflictDetector::detect_time_overlaps(&local_refs, &remote_refs)
            .into_iter()
            .map(|(l, r)| (l.id.clone(), r.id.clone()))
            .collect()
    };
    let overlapping_locals: HashSet<&str> = overlap_pairs.iter().map(|(l, _)| l.as_str()).collect();
    let overlapping_remotes: HashSet<&str> = overlap_pairs.iter().map(|(_, r)| r.as_str()).collect();

    for (local_id, remote_id) in &overlap_pairs {
        let local = unmatched_locals.iter().find(|l| l.id == *local_id);
        let remote_event = unmatched_remotes.iter().find(|r| r.id == *remote_id);
        if let (Some(local), Some(remote_event)) = (local, remote_event) {
            plan.conflicts.push(ConflictDetails::new(
                config.id,
                ConflictType::TimeOverlap,
                Some((*local).clone()),
                Some((*remote_event).clone()),
            ));
        }
    }

    for remote_event in unmatched_remotes {
        if overlapping_remotes.contains(remote_event.id.as_str()) {
            continue;
        }
        if direction.imports() {
            plan.writes.push(WriteOp::CreateLocal {
                event: content_as_local(remote_event, None, remote_event.external_id.as_deref()),
            });
        }
    }

    for local in unmatched_locals {
        if overlapping_locals.contains(local.id.as_str()) {
            continue;
        }
        if direction.exports() {
            plan.writes.push(WriteOp::CreateRemote {
                local_id: local.id.clone(),
                event: local.clone(),
            });
        }
    }

    plan
}

/// Shape remote or resolved content for storage as the local copy,
/// preserving local identity fields when a local side exists.
fn content_as_local(
    content: &SyncEvent,
    local: Option<&SyncEvent>,
    external_id: Option<&str>,
) -> SyncEvent {
    let mut event = content.clone();
    if let Some(local) = local {
        event.id = local.id.clone();
        event.created_at = local.created_at;
        event.source = local.source;
    }
    event.external_id = external_id
        .map(str::to_string)
        .or_else(|| content.external_id.clone());
    event
}

/// Translate a resolution outcome into write operations.
///
/// Resolution writes are applied to both sides regardless of sync
/// direction: the strategy was configured explicitly and overrides the
/// directional partition for the conflicted pair.
fn writes_for_resolution(conflict: &ConflictDetails, outcome: &ResolutionOutcome) -> Vec<WriteOp> {
    let mut writes = Vec::new();
    let external_id = conflict
        .remote
        .as_ref()
        .and_then(|r| r.external_id.clone())
        .or_else(|| conflict.local.as_ref().and_then(|l| l.external_id.clone()));

    match outcome {
        ResolutionOutcome::Manual => {}
        ResolutionOutcome::Delete => {
            if let Some(local) = &conflict.local {
                writes.push(WriteOp::DeleteLocal {
                    event_id: local.id.clone(),
                });
            }
            if conflict.remote.is_some() {
                if let Some(ext) = external_id {
                    writes.push(WriteOp::DeleteRemote { external_id: ext });
                }
            }
        }
        ResolutionOutcome::Keep { content, .. } | ResolutionOutcome::Merged { content } => {
            let as_local =
                content_as_local(content, conflict.local.as_ref(), external_id.as_deref());
            let local_id = as_local.id.clone();
            writes.push(match conflict.local {
                Some(_) => WriteOp::UpdateLocal { event: as_local },
                None => WriteOp::CreateLocal { event: as_local },
            });

            match (&conflict.remote, external_id) {
                (Some(_), Some(ext)) => {
                    let mut event = content.clone();
                    event.external_id = Some(ext);
                    writes.push(WriteOp::UpdateRemote { event });
                }
                // Remote side was deleted: the winner is re-exported.
                (None, _) => {
                    let mut event = content.clone();
                    event.external_id = None;
                    writes.push(WriteOp::CreateRemote {
                        local_id,
                        event,
                    });
                }
                (Some(_), None) => {}
            }
        }
    }
    writes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CalendarProvider, SyncDirection};
    use crate::providers::ProviderAdapter;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory provider double that applies CRUD to a remote event map.
    struct MockAdapter {
        remote: StdMutex<HashMap<String, SyncEvent>>,
        next_id: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fetch_delay: Duration,
    }

    impl MockAdapter {
        fn new() -> Self {
            MockAdapter {
                remote: StdMutex::new(HashMap::new()),
                next_id: AtomicUsize::new(1),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fetch_delay: Duration::from_millis(0),
            }
        }

        fn with_fetch_delay(mut self, delay: Duration) -> Self {
            self.fetch_delay = delay;
            self
        }

        fn seed(&self, event: SyncEvent) {
            let ext = event.external_id.clone().expect("seeded event needs ext id");
            self.remote.lock().unwrap().insert(ext, event);
        }

        fn remote_event(&self, ext: &str) -> Option<SyncEvent> {
            self.remote.lock().unwrap().get(ext).cloned()
        }

        fn max_concurrent_fetches(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockAdapter {
        fn provider(&self) -> CalendarProvider {
            CalendarProvider::Google
        }

        fn supports_delta(&self) -> bool {
            true
        }

        async fn validate_access(&self, _calendar_id: &str) -> EngineResult<()> {
            Ok(())
        }

        async fn fetch_events(
            &self,
            _calendar_id: &str,
            since: Option<DateTime<Utc>>,
        ) -> EngineResult<Vec<SyncEvent>> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.fetch_delay.is_zero() {
                tokio::time::sleep(self.fetch_delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let remote = self.remote.lock().unwrap();
            Ok(remote
                .values()
                .filter(|e| since.is_none_or(|t| e.modified_at > t))
                .cloned()
                .collect())
        }

        async fn create_event(
            &self,
            _calendar_id: &str,
            event: &SyncEvent,
        ) -> EngineResult<SyncEvent> {
            let ext = format!("ext-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            let mut created = event.clone();
            created.external_id = Some(ext.clone());
            self.remote.lock().unwrap().insert(ext, created.clone());
            Ok(created)
        }

        async fn update_event(
            &self,
            _calendar_id: &str,
            event: &SyncEvent,
        ) -> EngineResult<SyncEvent> {
            let ext = event
                .external_id
                .clone()
                .ok_or_else(|| SyncError::Validation("missing external_id".into()))?;
            self.remote.lock().unwrap().insert(ext, event.clone());
            Ok(event.clone())
        }

        async fn delete_event(&self, _calendar_id: &str, external_id: &str) -> EngineResult<()> {
            self.remote.lock().unwrap().remove(external_id);
            Ok(())
        }
    }

    struct MockFactory(Arc<MockAdapter>);

    impl AdapterFactory for MockFactory {
        fn adapter(&self, _config: &SyncConfiguration) -> EngineResult<Arc<dyn ProviderAdapter>> {
            Ok(self.0.clone())
        }
    }

    fn harness(adapter: Arc<MockAdapter>) -> (Arc<EventStore>, Arc<SyncEngine>, SyncConfiguration) {
        let store = Arc::new(EventStore::new());
        let monitor = Arc::new(SyncMonitor::new(64));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            monitor,
            Arc::new(MockFactory(adapter)),
        ));
        let config = SyncConfiguration::new(Uuid::new_v4(), CalendarProvider::Google, "primary");
        store.insert_config(config.clone());
        (store, engine, config)
    }

    fn local_event(title: &str) -> SyncEvent {
        let start = Utc.with_ymd_and_hms(2025, 1, 10, 10, 0, 0).unwrap();
        SyncEvent::new(title, start, start + ChronoDuration::minutes(30))
    }

    #[tokio::test]
    async fn scenario_a_create_then_idempotent() {
        let adapter = Arc::new(MockAdapter::new());
        let (store, engine, config) = harness(adapter.clone());

        store.upsert_local_event(config.id, local_event("Haircut - Sam"));

        let first = engine.trigger(config.id).await.unwrap().unwrap();
        assert_eq!(first.events_created, 1);
        assert!(first.succeeded());

        // The local event is now linked to the created remote event.
        let local = &store.local_events(config.id)[0];
        assert!(local.is_linked());
        assert!(adapter.remote_event(local.external_id.as_deref().unwrap()).is_some());

        // Second cycle with no intervening change: no writes at all.
        let second = engine.trigger(config.id).await.unwrap().unwrap();
        assert!(!second.has_changes(), "second cycle should be a no-op: {second:?}");
        assert_eq!(second.conflicts_detected, 0);
    }

    #[tokio::test]
    async fn scenario_b_remote_edit_is_pulled_without_conflict() {
        let adapter = Arc::new(MockAdapter::new());
        let (store, engine, config) = harness(adapter.clone());

        store.upsert_local_event(config.id, local_event("Haircut - Sam"));
        engine.trigger(config.id).await.unwrap().unwrap();

        // Remote retitles the event after the sync.
        let ext = store.local_events(config.id)[0]
            .external_id
            .clone()
            .unwrap();
        let mut remote = adapter.remote_event(&ext).unwrap();
        remote.title = "Haircut - Sam (moved up)".into();
        remote.modified_at = Utc::now();
        adapter.seed(remote);

        let result = engine.trigger(config.id).await.unwrap().unwrap();
        assert_eq!(result.conflicts_detected, 0);
        assert_eq!(result.events_updated, 1);
        assert_eq!(
            store.local_events(config.id)[0].title,
            "Haircut - Sam (moved up)"
        );
    }

    #[tokio::test]
    async fn scenario_c_newest_wins_resolves_to_local() {
        let adapter = Arc::new(MockAdapter::new());
        let (store, engine, config) = harness(adapter.clone());

        store.upsert_local_event(config.id, local_event("Haircut - Sam"));
        engine.trigger(config.id).await.unwrap().unwrap();
        let ext = store.local_events(config.id)[0]
            .external_id
            .clone()
            .unwrap();

        // Remote edit first, local edit later.
        let mut remote = adapter.remote_event(&ext).unwrap();
        remote.title = "Remote title".into();
        remote.modified_at = Utc::now();
        adapter.seed(remote);

        let mut local = store.local_events(config.id)[0].clone();
        local.title = "Local title".into();
        local.modified_at = Utc::now() + ChronoDuration::seconds(5);
        store.upsert_local_event(config.id, local);

        let result = engine.trigger(config.id).await.unwrap().unwrap();
        assert_eq!(result.conflicts_detected, 1);
        assert_eq!(result.conflicts_resolved, 1);
        assert_eq!(store.local_events(config.id)[0].title, "Local title");
        assert_eq!(adapter.remote_event(&ext).unwrap().title, "Local title");
    }

    #[tokio::test]
    async fn scenario_d_prompt_holds_conflict_and_skips_writes() {
        let adapter = Arc::new(MockAdapter::new());
        let (store, engine, config) = harness(adapter.clone());

        let mut cfg = store.get_config(config.id).unwrap();
        cfg.conflict_resolution = ConflictStrategy::Prompt;
        store.save_config(cfg).unwrap();

        store.upsert_local_event(config.id, local_event("Haircut - Sam"));
        engine.trigger(config.id).await.unwrap().unwrap();
        let ext = store.local_events(config.id)[0]
            .external_id
            .clone()
            .unwrap();

        let mut remote = adapter.remote_event(&ext).unwrap();
        remote.title = "Remote title".into();
        remote.modified_at = Utc::now();
        adapter.seed(remote);

        let mut local = store.local_events(config.id)[0].clone();
        local.title = "Local title".into();
        local.modified_at = Utc::now() + ChronoDuration::seconds(5);
        store.upsert_local_event(config.id, local);

        let result = engine.trigger(config.id).await.unwrap().unwrap();
        assert_eq!(result.conflicts_detected, 1);
        assert_eq!(result.conflicts_resolved, 0);
        // Neither side was touched.
        assert_eq!(store.local_events(config.id)[0].title, "Local title");
        assert_eq!(adapter.remote_event(&ext).unwrap().title, "Remote title");

        let open = store.open_conflicts(Some(config.id));
        assert_eq!(open.len(), 1);
        assert!(open[0].resolution_required);

        // The pair stays excluded from sync until the conflict is resolved.
        let third = engine.trigger(config.id).await.unwrap().unwrap();
        assert_eq!(third.conflicts_detected, 0);
        assert_eq!(adapter.remote_event(&ext).unwrap().title, "Remote title");
        assert_eq!(store.open_conflicts(Some(config.id)).len(), 1);
    }

    #[tokio::test]
    async fn import_only_never_writes_remotely() {
        let adapter = Arc::new(MockAdapter::new());
        let (store, engine, config) = harness(adapter.clone());

        let mut cfg = store.get_config(config.id).unwrap();
        cfg.sync_direction = SyncDirection::ImportOnly;
        store.save_config(cfg).unwrap();

        // One unlinked local (would be pushed under export), one new remote.
        store.upsert_local_event(config.id, local_event("Local only"));
        let start = Utc.with_ymd_and_hms(2025, 1, 12, 9, 0, 0).unwrap();
        let mut remote = SyncEvent::new("Remote walk-in", start, start + ChronoDuration::minutes(30));
        remote.external_id = Some("ext-seeded".into());
        adapter.seed(remote);

        let result = engine.trigger(config.id).await.unwrap().unwrap();
        assert_eq!(result.events_created, 1); // the import
        assert_eq!(adapter.remote.lock().unwrap().len(), 1); // no push happened
        assert_eq!(store.local_events(config.id).len(), 2);
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_triggers() {
        let adapter =
            Arc::new(MockAdapter::new().with_fetch_delay(Duration::from_millis(100)));
        let (_store, engine, config) = harness(adapter.clone());

        let (a, b) = tokio::join!(engine.trigger(config.id), engine.trigger(config.id));
        let results = [a.unwrap(), b.unwrap()];

        // Exactly one caller ran the cycle; the other was coalesced.
        assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);
        assert_eq!(adapter.max_concurrent_fetches(), 1);
    }

    #[tokio::test]
    async fn cycle_timeout_fails_and_backs_off() {
        let adapter = Arc::new(MockAdapter::new().with_fetch_delay(Duration::from_millis(200)));
        let store = Arc::new(EventStore::new());
        let monitor = Arc::new(SyncMonitor::new(64));
        let engine = SyncEngine::new(store.clone(), monitor, Arc::new(MockFactory(adapter)))
            .with_cycle_timeout(Duration::from_millis(20));
        let config = SyncConfiguration::new(Uuid::new_v4(), CalendarProvider::Google, "primary");
        store.insert_config(config.clone());

        let result = engine.trigger(config.id).await.unwrap().unwrap();
        assert!(!result.succeeded());
        assert!(result.errors[0].contains("timed out"));

        let saved = store.get_config(config.id).unwrap();
        assert_eq!(saved.consecutive_failures, 1);
        assert!(saved.next_sync.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn auth_failure_degrades_configuration() {
        struct RejectingFactory;
        impl AdapterFactory for RejectingFactory {
            fn adapter(
                &self,
                _config: &SyncConfiguration,
            ) -> EngineResult<Arc<dyn ProviderAdapter>> {
                Err(SyncError::Auth("no credentials stored".into()))
            }
        }

        let store = Arc::new(EventStore::new());
        let monitor = Arc::new(SyncMonitor::new(64));
        let engine = SyncEngine::new(store.clone(), monitor, Arc::new(RejectingFactory));
        let config = SyncConfiguration::new(Uuid::new_v4(), CalendarProvider::Google, "primary");
        store.insert_config(config.clone());

        let result = engine.trigger(config.id).await.unwrap().unwrap();
        assert!(!result.succeeded());

        let saved = store.get_config(config.id).unwrap();
        assert!(!saved.enabled, "auth failure should pause the configuration");
        assert!(saved.last_error().unwrap().contains("credentials"));
    }

    #[tokio::test]
    async fn local_deletion_propagates_to_remote() {
        let adapter = Arc::new(MockAdapter::new());
        let (store, engine, config) = harness(adapter.clone());

        store.upsert_local_event(config.id, local_event("Haircut - Sam"));
        engine.trigger(config.id).await.unwrap().unwrap();
        let local = store.local_events(config.id)[0].clone();
        let ext = local.external_id.clone().unwrap();

        store.remove_local_event(config.id, &local.id);
        let result = engine.trigger(config.id).await.unwrap().unwrap();
        assert_eq!(result.events_deleted, 1);
        assert!(adapter.remote_event(&ext).is_none());
    }
}
