//! Divergence classification for linked pairs and overlap scanning for
//! unlinked events.

use chrono::{DateTime, Utc};

use crate::event::SyncEvent;

/// State of a linked local/remote pair after comparing both sides against
/// the last-known snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairState {
    /// Unmodified mirror of previously synced state; nothing to do.
    InSync,
    /// Only the local side changed - a directional push, not a conflict.
    LocalChanged,
    /// Only the remote side changed - a directional pull, not a conflict.
    RemoteChanged,
    /// Both sides changed since the last sync: `content_mismatch`.
    BothChanged,
    /// The remote event is gone. A conflict only if the local side has
    /// modifications newer than the last sync.
    RemoteDeleted { local_modified: bool },
    /// The local event is gone. A conflict only if the remote side has
    /// modifications newer than the last sync.
    LocalDeleted { remote_modified: bool },
}

pub struct ConflictDetector;

impl ConflictDetector {
    /// Classify one linked pair.
    ///
    /// `snapshot` is the last-known remote state for this pair (absent on
    /// first contact). `remote` is the freshly fetched remote event, `None`
    /// when the provider no longer has it. With `last_sync == None` (first
    /// ever sync) no conflict is raised: divergence degrades to a
    /// directional update decided by `modified_at`.
    pub fn assess_pair(
        local: Option<&SyncEvent>,
        snapshot: Option<&SyncEvent>,
        remote: Option<&SyncEvent>,
        last_sync: Option<DateTime<Utc>>,
    ) -> PairState {
        match (local, remote) {
            (Some(local), Some(remote)) => {
                if local.checksum() == remote.checksum() {
                    return PairState::InSync;
                }

                let local_modified = Self::modified_since(local, last_sync);
                // Prefer the snapshot for remote change detection: checksums
                // are stable where provider timestamps are not.
                let remote_modified = match snapshot {
                    Some(snap) => snap.checksum() != remote.checksum(),
                    None => Self::modified_since(remote, last_sync),
                };

                match (last_sync, local_modified, remote_modified) {
                    // First sync is link-only; fall back to newest side.
                    (None, _, _) => {
                        if local.modified_at > remote.modified_at {
                            PairState::LocalChanged
                        } else {
                            PairState::RemoteChanged
                        }
                    }
                    (Some(_), true, true) => PairState::BothChanged,
                    (Some(_), true, false) => PairState::LocalChanged,
                    (Some(_), false, true) => PairState::RemoteChanged,
                    // Checksums differ but neither side looks modified
                    // (e.g. pair relinked out of band): trust the remote.
                    (Some(_), false, false) => PairState::RemoteChanged,
                }
            }
            (Some(local), None) => PairState::RemoteDeleted {
                local_modified: last_sync.is_some() && Self::modified_since(local, last_sync),
            },
            (None, Some(remote)) => PairState::LocalDeleted {
                remote_modified: last_sync.is_some()
                    && match snapshot {
                        Some(snap) => snap.checksum() != remote.checksum(),
                        None => Self::modified_since(remote, last_sync),
                    },
            },
            (None, None) => PairState::InSync,
        }
    }

    /// Find `time_overlap` conflicts: unlinked local events whose windows
    /// intersect a different, unlinked remote event on the same calendar.
    ///
    /// Pairs that best-effort matched (same event created on both sides)
    /// must be excluded by the caller before this runs.
    pub fn detect_time_overlaps<'a>(
        unlinked_locals: &'a [SyncEvent],
        unlinked_remotes: &'a [SyncEvent],
    ) -> Vec<(&'a SyncEvent, &'a SyncEvent)> {
        let mut overlaps = Vec::new();
        for local in unlinked_locals {
            for remote in unlinked_remotes {
                if local.overlaps(remote) {
                    overlaps.push((local, remote));
                }
            }
        }
        overlaps
    }

    fn modified_since(event: &SyncEvent, last_sync: Option<DateTime<Utc>>) -> bool {
        last_sync.is_none_or(|t| event.modified_at > t)
    }
}
