//! Strategy application for detected conflicts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ConflictStrategy;
use crate::conflict::{AppliedResolution, ConflictDetails};
use crate::event::SyncEvent;

/// Which side a kept event originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

/// Deterministic outcome of applying a strategy to a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionOutcome {
    /// The winner's content replaces the loser on both sides.
    Keep { content: SyncEvent, origin: Side },
    /// Field-level combination of both sides.
    Merged { content: SyncEvent },
    /// The deletion wins; the surviving copy is removed too.
    Delete,
    /// Strategy is `prompt`: held for a human operator, excluded from the
    /// write phase until resolved.
    Manual,
}

/// Per-field authority for the `merge` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldAuthority {
    Local,
    Remote,
    NewestWins,
}

/// Field-level merge policy.
///
/// Defaults: the remote side is authoritative for title, time window, and
/// location (the provider calendar is where reschedules happen); the local
/// side is authoritative for attendees and description, which carry
/// billing-adjacent client notes. Status falls back to newest-wins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MergePolicy {
    pub title: FieldAuthority,
    pub time: FieldAuthority,
    pub location: FieldAuthority,
    pub description: FieldAuthority,
    pub attendees: FieldAuthority,
    pub status: FieldAuthority,
}

impl Default for MergePolicy {
    fn default() -> Self {
        MergePolicy {
            title: FieldAuthority::Remote,
            time: FieldAuthority::Remote,
            location: FieldAuthority::Remote,
            description: FieldAuthority::Local,
            attendees: FieldAuthority::Local,
            status: FieldAuthority::NewestWins,
        }
    }
}

pub struct ConflictResolver {
    policy: MergePolicy,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        ConflictResolver {
            policy: MergePolicy::default(),
        }
    }
}

impl ConflictResolver {
    pub fn new(policy: MergePolicy) -> Self {
        ConflictResolver { policy }
    }

    /// Apply `strategy` to `conflict`.
    ///
    /// Idempotent: a conflict that already carries a resolution returns the
    /// recorded outcome unchanged, regardless of the strategy passed in.
    pub fn resolve(
        &self,
        conflict: &ConflictDetails,
        strategy: ConflictStrategy,
        sync_time: DateTime<Utc>,
    ) -> ResolutionOutcome {
        if let Some(applied) = &conflict.resolution {
            return applied.outcome.clone();
        }

        match strategy {
            ConflictStrategy::Prompt => ResolutionOutcome::Manual,
            ConflictStrategy::LocalWins => self.prefer(conflict, Side::Local, sync_time),
            ConflictStrategy::RemoteWins => self.prefer(conflict, Side::Remote, sync_time),
            ConflictStrategy::NewestWins => self.newest_wins(conflict, sync_time),
            ConflictStrategy::Merge => self.merge(conflict, sync_time),
        }
    }

    /// Build the record stored on a resolved conflict.
    pub fn applied(
        strategy: ConflictStrategy,
        outcome: ResolutionOutcome,
        at: DateTime<Utc>,
    ) -> AppliedResolution {
        AppliedResolution {
            strategy,
            outcome,
            applied_at: at,
        }
    }

    fn prefer(
        &self,
        conflict: &ConflictDetails,
        side: Side,
        sync_time: DateTime<Utc>,
    ) -> ResolutionOutcome {
        let winner = match side {
            Side::Local => conflict.local.as_ref(),
            Side::Remote => conflict.remote.as_ref(),
        };
        match winner {
            // Winner side was deleted: the deletion wins.
            None => ResolutionOutcome::Delete,
            Some(event) => {
                let mut content = event.clone();
                content.modified_at = sync_time;
                ResolutionOutcome::Keep {
                    content,
                    origin: side,
                }
            }
        }
    }

    fn newest_wins(
        &self,
        conflict: &ConflictDetails,
        sync_time: DateTime<Utc>,
    ) -> ResolutionOutcome {
        match (&conflict.local, &conflict.remote) {
            (Some(local), Some(remote)) => {
                // Ties prefer local: it is authoritative for billing fields.
                let side = if remote.modified_at > local.modified_at {
                    Side::Remote
                } else {
                    Side::Local
                };
                self.prefer(conflict, side, sync_time)
            }
            // Deletion conflict: the survivor carries the only
            // modifications newer than last sync, so it wins.
            (Some(_), None) => self.prefer(conflict, Side::Local, sync_time),
            (None, _) => self.prefer(conflict, Side::Remote, sync_time),
        }
    }

    fn merge(&self, conflict: &ConflictDetails, sync_time: DateTime<Utc>) -> ResolutionOutcome {
        let (local, remote) = match (&conflict.local, &conflict.remote) {
            (Some(l), Some(r)) => (l, r),
            // Nothing to merge with; fall back to newest_wins semantics.
            _ => return self.newest_wins(conflict, sync_time),
        };

        let pick = |authority: FieldAuthority| -> &SyncEvent {
            match authority {
                FieldAuthority::Local => local,
                FieldAuthority::Remote => remote,
                FieldAuthority::NewestWins => {
                    if remote.modified_at > local.modified_at {
                        remote
                    } else {
                        local
                    }
                }
            }
        };

        let mut content = local.clone();
        content.title = pick(self.policy.title).title.clone();
        content.start = pick(self.policy.time).start;
        content.end = pick(self.policy.time).end;
        content.location = pick(self.policy.location).location.clone();
        content.description = pick(self.policy.description).description.clone();
        content.attendees = pick(self.policy.attendees).attendees.clone();
        content.status = pick(self.policy.status).status;
        content.modified_at = sync_time;

        ResolutionOutcome::Merged { content }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictType;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn conflicting_pair() -> ConflictDetails {
        let start = Utc.with_ymd_and_hms(2025, 1, 10, 10, 0, 0).unwrap();
        let mut local = SyncEvent::new("Haircut + beard", start, start + Duration::minutes(30));
        local.description = Some("Regular client, prefers scissors".into());
        local.modified_at = Utc::now();

        let mut remote = local.clone();
        remote.title = "Haircut (moved)".into();
        remote.start = start + Duration::hours(1);
        remote.end = remote.start + Duration::minutes(30);
        remote.description = None;
        remote.modified_at = Utc::now() - Duration::minutes(30);

        ConflictDetails::new(
            Uuid::new_v4(),
            ConflictType::ContentMismatch,
            Some(local),
            Some(remote),
        )
    }

    #[test]
    fn local_wins_keeps_local_content() {
        let resolver = ConflictResolver::default();
        let conflict = conflicting_pair();
        let now = Utc::now();

        match resolver.resolve(&conflict, ConflictStrategy::LocalWins, now) {
            ResolutionOutcome::Keep { content, origin } => {
                assert_eq!(origin, Side::Local);
                assert_eq!(content.title, "Haircut + beard");
                assert_eq!(content.modified_at, now);
            }
            other => panic!("expected Keep, got {other:?}"),
        }
    }

    #[test]
    fn newest_wins_prefers_later_modification() {
        let resolver = ConflictResolver::default();
        let conflict = conflicting_pair();

        // Local was modified later in conflicting_pair().
        match resolver.resolve(&conflict, ConflictStrategy::NewestWins, Utc::now()) {
            ResolutionOutcome::Keep { origin, .. } => assert_eq!(origin, Side::Local),
            other => panic!("expected Keep, got {other:?}"),
        }
    }

    #[test]
    fn newest_wins_tie_prefers_local() {
        let resolver = ConflictResolver::default();
        let mut conflict = conflicting_pair();
        let t = Utc::now();
        conflict.local.as_mut().unwrap().modified_at = t;
        conflict.remote.as_mut().unwrap().modified_at = t;

        match resolver.resolve(&conflict, ConflictStrategy::NewestWins, Utc::now()) {
            ResolutionOutcome::Keep { origin, .. } => assert_eq!(origin, Side::Local),
            other => panic!("expected Keep, got {other:?}"),
        }
    }

    #[test]
    fn merge_follows_field_policy() {
        let resolver = ConflictResolver::default();
        let conflict = conflicting_pair();

        match resolver.resolve(&conflict, ConflictStrategy::Merge, Utc::now()) {
            ResolutionOutcome::Merged { content } => {
                // Remote authoritative for title/time.
                assert_eq!(content.title, "Haircut (moved)");
                assert_eq!(content.start, conflict.remote.as_ref().unwrap().start);
                // Local authoritative for description.
                assert_eq!(
                    content.description.as_deref(),
                    Some("Regular client, prefers scissors")
                );
            }
            other => panic!("expected Merged, got {other:?}"),
        }
    }

    #[test]
    fn prompt_requires_manual_resolution() {
        let resolver = ConflictResolver::default();
        let conflict = conflicting_pair();
        assert_eq!(
            resolver.resolve(&conflict, ConflictStrategy::Prompt, Utc::now()),
            ResolutionOutcome::Manual
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let resolver = ConflictResolver::default();
        let conflict = conflicting_pair();
        let t = Utc::now();
        let first = resolver.resolve(&conflict, ConflictStrategy::Merge, t);
        let second = resolver.resolve(&conflict, ConflictStrategy::Merge, t);
        assert_eq!(first, second);
    }

    #[test]
    fn resolving_resolved_conflict_is_noop() {
        let resolver = ConflictResolver::default();
        let mut conflict = conflicting_pair();
        let t = Utc::now();

        let outcome = resolver.resolve(&conflict, ConflictStrategy::LocalWins, t);
        conflict.resolution = Some(ConflictResolver::applied(
            ConflictStrategy::LocalWins,
            outcome.clone(),
            t,
        ));
        conflict.resolved_at = Some(t);

        // A different strategy later must not change the recorded outcome.
        let again = resolver.resolve(&conflict, ConflictStrategy::RemoteWins, Utc::now());
        assert_eq!(again, outcome);
    }

    #[test]
    fn deletion_conflict_local_wins_on_deleted_local_deletes() {
        let resolver = ConflictResolver::default();
        let remote = conflicting_pair().remote;
        let conflict = ConflictDetails::new(
            Uuid::new_v4(),
            ConflictType::DeletionConflict,
            None,
            remote,
        );
        assert_eq!(
            resolver.resolve(&conflict, ConflictStrategy::LocalWins, Utc::now()),
            ResolutionOutcome::Delete
        );
    }
}
