//! Time-driven sync scheduling.
//!
//! Scans enabled configurations on a jittered interval and triggers a
//! cycle for each one whose `next_sync` has passed. Runs independently of
//! webhook triggers; both funnel into the engine's single-flight queue, so
//! overlapping triggers coalesce rather than race.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::backoff;
use crate::engine::SyncEngine;
use crate::store::EventStore;

/// Scan cadence in seconds.
const SCHEDULER_TICK_SECS: u64 = 30;

pub struct SyncScheduler {
    store: Arc<EventStore>,
    engine: Arc<SyncEngine>,
    tick: Duration,
}

impl SyncScheduler {
    pub fn new(store: Arc<EventStore>, engine: Arc<SyncEngine>) -> Self {
        SyncScheduler {
            store,
            engine,
            tick: Duration::from_secs(SCHEDULER_TICK_SECS),
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Trigger every due configuration once. Long cycles do not block the
    /// scan: each trigger runs on its own task.
    pub fn dispatch_due(&self) -> usize {
        let due = self.store.due_configs(Utc::now());
        let count = due.len();
        for config in due {
            let engine = self.engine.clone();
            let config_id = config.id;
            tokio::spawn(async move {
                match engine.trigger(config_id).await {
                    Ok(Some(result)) if !result.succeeded() => {
                        tracing::warn!(%config_id, errors = ?result.errors, "scheduled sync failed");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(%config_id, error = %err, "scheduled sync did not run");
                    }
                }
            });
        }
        count
    }

    /// Scheduling loop; spawn once per process. The tick is jittered so a
    /// fleet of instances does not hit providers in lockstep.
    pub async fn run(self: Arc<Self>) {
        loop {
            let jittered = backoff::with_jitter(self.tick.as_secs().max(1));
            tokio::time::sleep(jittered).await;
            let dispatched = self.dispatch_due();
            if dispatched > 0 {
                tracing::debug!(dispatched, "scheduler dispatched due configurations");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CalendarProvider, SyncConfiguration};
    use crate::engine::AdapterFactory;
    use crate::error::EngineResult;
    use crate::monitor::SyncMonitor;
    use crate::providers::ProviderAdapter;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use uuid::Uuid;

    struct NullAdapter;

    #[async_trait]
    impl ProviderAdapter for NullAdapter {
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
            _since: Option<DateTime<Utc>>,
        ) -> EngineResult<Vec<crate::event::SyncEvent>> {
            Ok(Vec::new())
        }
        async fn create_event(
            &self,
            _calendar_id: &str,
            event: &crate::event::SyncEvent,
        ) -> EngineResult<crate::event::SyncEvent> {
            Ok(event.clone())
        }
        async fn update_event(
            &self,
            _calendar_id: &str,
            event: &crate::event::SyncEvent,
        ) -> EngineResult<crate::event::SyncEvent> {
            Ok(event.clone())
        }
        async fn delete_event(&self, _calendar_id: &str, _external_id: &str) -> EngineResult<()> {
            Ok(())
        }
    }

    struct NullFactory;
    impl AdapterFactory for NullFactory {
        fn adapter(
            &self,
            _config: &SyncConfiguration,
        ) -> EngineResult<Arc<dyn ProviderAdapter>> {
            Ok(Arc::new(NullAdapter))
        }
    }

    #[tokio::test]
    async fn dispatches_only_due_configurations() {
        let store = Arc::new(EventStore::new());
        let monitor = Arc::new(SyncMonitor::new(16));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            monitor,
            Arc::new(NullFactory),
        ));
        let scheduler = SyncScheduler::new(store.clone(), engine);

        let due = SyncConfiguration::new(Uuid::new_v4(), CalendarProvider::Google, "due-cal");
        store.insert_config(due.clone());

        let mut later =
            SyncConfiguration::new(Uuid::new_v4(), CalendarProvider::Google, "later-cal");
        later.next_sync = Some(Utc::now() + ChronoDuration::hours(1));
        store.insert_config(later);

        let mut paused =
            SyncConfiguration::new(Uuid::new_v4(), CalendarProvider::Google, "paused-cal");
        paused.enabled = false;
        store.insert_config(paused);

        assert_eq!(scheduler.dispatch_due(), 1);

        // Let the spawned cycle finish, then the config is rescheduled.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let saved = store.get_config(due.id).unwrap();
        assert!(saved.last_sync.is_some());
        assert!(saved.next_sync.unwrap() > Utc::now());
    }
}
