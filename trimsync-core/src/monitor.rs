//! Sync lifecycle broadcasting and per-configuration health scoring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::SyncConfiguration;
use crate::conflict::ConflictType;
use crate::engine::{CyclePhase, SyncResult};

/// A typed sync lifecycle event pushed to subscribed observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    SyncStarted {
        config_id: Uuid,
        at: DateTime<Utc>,
    },
    Progress {
        config_id: Uuid,
        phase: CyclePhase,
    },
    ConflictDetected {
        config_id: Uuid,
        conflict_id: Uuid,
        conflict_type: ConflictType,
    },
    SyncCompleted {
        config_id: Uuid,
        result: SyncResult,
    },
    SyncError {
        config_id: Uuid,
        message: String,
    },
}

/// Publisher that fans sync lifecycle events out to a broadcast channel.
///
/// Publishing is fire-and-forget: with no subscribers the event is dropped.
#[derive(Clone)]
pub struct SyncMonitor {
    sender: broadcast::Sender<MonitorEvent>,
}

impl SyncMonitor {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        SyncMonitor { sender }
    }

    pub fn publish(&self, event: MonitorEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("no active monitor subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }
}

impl Default for SyncMonitor {
    fn default() -> Self {
        SyncMonitor::new(256)
    }
}

// ---------------------------------------------------------------------------
// Health scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Excellent,
    Good,
    Fair,
    Poor,
}

/// Health of one sync configuration, derived from its recent history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub config_id: Uuid,
    pub score: f64,
    pub status: HealthStatus,
    pub success_rate: f64,
    pub error_count: usize,
    pub avg_duration_ms: i64,
    pub hours_since_last_success: Option<f64>,
    pub recommendations: Vec<String>,
}

/// Score a configuration's health from its sync history.
///
/// Starts at 100 and deducts per factor: success-rate shortfall below 90%
/// (2 points per percentage point), error count beyond 5 (2 per error,
/// capped at 20), average duration beyond 30s (0.5 per second, capped at
/// 15), and staleness beyond 24h since the last success (0.5 per hour,
/// capped at 25).
pub fn health_report(
    config: &SyncConfiguration,
    history: &[SyncResult],
    now: DateTime<Utc>,
) -> HealthReport {
    let mut score: f64 = 100.0;
    let mut recommendations = Vec::new();

    let total = history.len();
    let successes = history.iter().filter(|r| r.succeeded()).count();
    let success_rate = if total == 0 {
        100.0
    } else {
        successes as f64 / total as f64 * 100.0
    };
    if success_rate < 90.0 {
        score -= (90.0 - success_rate) * 2.0;
        recommendations.push(format!(
            "Success rate is {success_rate:.0}%; inspect recent sync errors in the history"
        ));
    }

    let error_count: usize = history.iter().map(|r| r.errors.len()).sum();
    if error_count > 5 {
        score -= (((error_count - 5) * 2) as f64).min(20.0);
        recommendations.push(format!(
            "{error_count} errors recorded; recurring failures usually point at credentials or rate limits"
        ));
    }

    let avg_duration_ms = if total == 0 {
        0
    } else {
        history.iter().map(|r| r.duration_ms).sum::<i64>() / total as i64
    };
    let avg_secs = avg_duration_ms as f64 / 1000.0;
    if avg_secs > 30.0 {
        score -= ((avg_secs - 30.0) * 0.5).min(15.0);
        recommendations.push(format!(
            "Sync cycles average {avg_secs:.0}s; consider a narrower calendar or lower frequency"
        ));
    }

    let last_success = history
        .iter()
        .filter(|r| r.succeeded())
        .map(|r| r.started_at)
        .max();
    let hours_stale = last_success.map(|at| (now - at).num_minutes() as f64 / 60.0);
    if let Some(hours) = hours_stale {
        if hours > 24.0 {
            score -= ((hours - 24.0) * 0.5).min(25.0);
            recommendations.push(format!(
                "No successful sync for {hours:.0}h; check provider access for '{}'",
                config.external_calendar_id
            ));
        }
    } else if total > 0 {
        score -= 25.0;
        recommendations.push("No successful sync recorded yet; verify the configuration".into());
    }

    let score = score.max(0.0);
    let status = if score >= 90.0 {
        HealthStatus::Excellent
    } else if score >= 70.0 {
        HealthStatus::Good
    } else if score >= 50.0 {
        HealthStatus::Fair
    } else {
        HealthStatus::Poor
    };

    HealthReport {
        config_id: config.id,
        score,
        status,
        success_rate,
        error_count,
        avg_duration_ms,
        hours_since_last_success: hours_stale,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CalendarProvider;

    fn config() -> SyncConfiguration {
        SyncConfiguration::new(Uuid::new_v4(), CalendarProvider::Google, "primary")
    }

    fn result(config_id: Uuid, errors: usize, duration_ms: i64, at: DateTime<Utc>) -> SyncResult {
        let mut r = SyncResult::empty(config_id);
        r.started_at = at;
        r.duration_ms = duration_ms;
        r.errors = (0..errors).map(|i| format!("error {i}")).collect();
        r
    }

    #[test]
    fn healthy_history_scores_excellent() {
        let cfg = config();
        let now = Utc::now();
        let history: Vec<_> = (0..10)
            .map(|i| result(cfg.id, 0, 2_000, now - chrono::Duration::minutes(i * 15)))
            .collect();

        let report = health_report(&cfg, &history, now);
        assert_eq!(report.status, HealthStatus::Excellent);
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn failures_reduce_score_with_recommendations() {
        let cfg = config();
        let now = Utc::now();
        // Half the cycles failed: success rate 50% -> -80, floor at 0.
        let history: Vec<_> = (0..10)
            .map(|i| result(cfg.id, usize::from(i % 2 == 0), 2_000, now))
            .collect();

        let report = health_report(&cfg, &history, now);
        assert_eq!(report.status, HealthStatus::Poor);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("Success rate")));
    }

    #[test]
    fn slow_cycles_are_flagged() {
        let cfg = config();
        let now = Utc::now();
        let history: Vec<_> = (0..5).map(|_| result(cfg.id, 0, 45_000, now)).collect();

        let report = health_report(&cfg, &history, now);
        // 45s average: 15s over -> -7.5
        assert!(report.score <= 93.0);
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("average")));
    }

    #[test]
    fn staleness_degrades_score() {
        let cfg = config();
        let now = Utc::now();
        let history = vec![result(cfg.id, 0, 1_000, now - chrono::Duration::hours(48))];

        let report = health_report(&cfg, &history, now);
        // 24h over the threshold -> -12
        assert!(report.score <= 88.0 + f64::EPSILON);
        assert_eq!(report.status, HealthStatus::Good);
    }

    #[test]
    fn empty_history_is_excellent() {
        let cfg = config();
        let report = health_report(&cfg, &[], Utc::now());
        assert_eq!(report.status, HealthStatus::Excellent);
        assert_eq!(report.score, 100.0);
    }

    #[test]
    fn broadcast_reaches_subscribers() {
        let monitor = SyncMonitor::new(8);
        let mut rx = monitor.subscribe();
        monitor.publish(MonitorEvent::SyncStarted {
            config_id: Uuid::new_v4(),
            at: Utc::now(),
        });
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, MonitorEvent::SyncStarted { .. }));
    }
}
