//! Periodic eviction of stale connections.

use crate::handle::ReadyState;
use crate::metrics::{counters, gauges};
use crate::registry::Registry;
use std::sync::{Arc, PoisonError};
use tokio::time::{Instant, MissedTickBehavior};
use toolbridge_common::types::{close_code, close_reason};
use tracing::{debug, info, warn};

impl Registry {
    /// Run one sweep: evict every connection whose transport is closing or
    /// closed, or that has been idle longer than the stale threshold.
    ///
    /// Evicted connections that are still connecting or open are closed
    /// first; a failed close is logged and does not stop the sweep. Evicted
    /// entries leave both maps regardless of which connection is active for
    /// their identity. Returns the number of evicted entries.
    pub fn sweep_stale_connections(&self) -> usize {
        let threshold = self.config.stale_threshold;
        let now = Instant::now();
        let mut inner = self.lock();

        let stale: Vec<_> = inner
            .entries
            .iter()
            .filter(|(_, entry)| {
                matches!(
                    entry.handle.ready_state(),
                    ReadyState::Closing | ReadyState::Closed
                ) || now.saturating_duration_since(entry.meta.last_activity) > threshold
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            let Some(entry) = inner.entries.remove(id) else {
                continue;
            };
            let state = entry.handle.ready_state();
            warn!(
                identity = %entry.meta.identity,
                conn_id = id,
                state = %state,
                "evicting stale connection"
            );
            if matches!(state, ReadyState::Connecting | ReadyState::Open) {
                if let Err(e) = entry.handle.close(close_code::NORMAL, close_reason::STALE) {
                    warn!(conn_id = id, "failed to close stale connection: {}", e);
                }
            }
            inner.connections.remove(&entry.meta.identity);
            counters::stale_evictions_total();
        }

        // Identity mappings whose handle lost its metadata entry.
        let orphans: Vec<_> = inner
            .connections
            .iter()
            .filter(|(_, handle)| {
                !inner.entries.contains_key(&handle.id())
                    && matches!(handle.ready_state(), ReadyState::Closing | ReadyState::Closed)
            })
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in &orphans {
            inner.connections.remove(identity);
            debug!(identity = %identity, "dropped orphaned identity mapping");
        }

        gauges::set_connections_active(inner.connections.len());
        if !stale.is_empty() {
            info!(evicted = stale.len(), remaining = inner.connections.len(), "stale sweep complete");
        }
        stale.len()
    }

    /// Start the periodic sweep. Returns `false` if it is already running.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start_cleanup_interval(self: &Arc<Self>) -> bool {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }

        let period = self.config.sweep_interval;
        let registry = Arc::downgrade(self);
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.sweep_stale_connections();
            }
        }));
        info!(
            interval_secs = period.as_secs(),
            threshold_secs = self.config.stale_threshold.as_secs(),
            "stale connection sweep started"
        );
        true
    }

    /// Stop the periodic sweep. Returns `false` if it was not running.
    pub fn stop_cleanup_interval(&self) -> bool {
        let task = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match task {
            Some(task) => {
                task.abort();
                info!("stale connection sweep stopped");
                true
            }
            None => false,
        }
    }

    /// Returns `true` while the periodic sweep is running.
    #[must_use]
    pub fn is_cleanup_running(&self) -> bool {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::handle::{ConnHandle, ConnReceiver};
    use std::time::Duration;

    fn open_handle() -> (ConnHandle, ConnReceiver) {
        let (handle, rx) = ConnHandle::new(8);
        handle.set_ready_state(ReadyState::Open);
        (handle, rx)
    }

    fn registry(sweep: u64, threshold: u64) -> Arc<Registry> {
        Arc::new(Registry::new(RegistryConfig {
            sweep_interval: Duration::from_secs(sweep),
            stale_threshold: Duration::from_secs(threshold),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connection_is_closed_and_removed() {
        let registry = registry(300, 3600);
        let (handle, rx) = open_handle();
        registry.register("u1", handle.clone(), None);

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert_eq!(registry.sweep_stale_connections(), 1);

        assert!(registry.get_connection("u1").is_none());
        assert!(registry.connection_metadata(&handle).is_none());
        let close = rx.close.borrow().clone().unwrap();
        assert_eq!(close.code, close_code::NORMAL);
        assert_eq!(close.reason, close_reason::STALE);
    }

    #[tokio::test(start_paused = true)]
    async fn recent_ping_keeps_connection() {
        let registry = registry(300, 3600);
        let (handle, rx) = open_handle();
        registry.register("u1", handle.clone(), None);

        tokio::time::advance(Duration::from_secs(3000)).await;
        registry.update_last_ping(&handle);
        tokio::time::advance(Duration::from_secs(3000)).await;

        assert_eq!(registry.sweep_stale_connections(), 0);
        assert_eq!(registry.get_connection("u1"), Some(handle));
        assert!(rx.close.borrow().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn closed_transport_is_evicted_without_close_attempt() {
        let registry = registry(300, 3600);
        let (handle, rx) = open_handle();
        registry.register("u1", handle.clone(), None);
        handle.set_ready_state(ReadyState::Closed);

        assert_eq!(registry.sweep_stale_connections(), 1);
        assert!(rx.close.borrow().is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_failure_does_not_abort_sweep() {
        let registry = registry(300, 60);
        let (gone, gone_rx) = open_handle();
        let (alive, _alive_rx) = open_handle();
        registry.register("u1", gone, None);
        registry.register("u2", alive, None);
        drop(gone_rx);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.sweep_stale_connections(), 2);
        assert_eq!(registry.connection_stats().metadata_entries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_clears_identity_even_when_handle_not_active() {
        let registry = registry(300, 3600);
        let (handle, _rx) = open_handle();
        registry.register("u1", handle.clone(), None);
        handle.set_ready_state(ReadyState::Closing);

        registry.sweep_stale_connections();
        assert!(registry.get_connection("u1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_decrements_total() {
        let registry = registry(300, 3600);
        let (stale, _rx1) = open_handle();
        registry.register("stale", stale, None);
        assert!(registry.start_cleanup_interval());

        tokio::time::sleep(Duration::from_secs(3400)).await;
        let (fresh, _rx2) = open_handle();
        registry.register("fresh", fresh.clone(), None);
        assert_eq!(registry.connection_stats().total_connections, 2);

        // Sweeps run every 300s; the one at 3900s is the first past the threshold.
        tokio::time::sleep(Duration::from_secs(600)).await;
        let stats = registry.connection_stats();
        assert_eq!(stats.total_connections, 1);
        assert_eq!(registry.get_connection("fresh"), Some(fresh));
        registry.stop_cleanup_interval();
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_are_idempotent() {
        let registry = registry(300, 3600);
        assert!(registry.start_cleanup_interval());
        assert!(!registry.start_cleanup_interval());
        assert!(registry.is_cleanup_running());

        assert!(registry.stop_cleanup_interval());
        assert!(!registry.stop_cleanup_interval());
        assert!(!registry.is_cleanup_running());

        assert!(registry.start_cleanup_interval());
        registry.stop_cleanup_interval();
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_timer_is_cancelled_by_eviction() {
        let registry = registry(300, 60);
        let (handle, rx) = open_handle();
        registry.register("u1", handle.clone(), None);
        registry.set_jwt_expiry_timer(
            &handle,
            chrono::Utc::now() + chrono::Duration::seconds(600),
            None,
        );

        tokio::time::advance(Duration::from_secs(61)).await;
        registry.sweep_stale_connections();
        assert_eq!(registry.pending_expiry_count(), 0);
        assert_eq!(rx.close.borrow().as_ref().unwrap().reason, close_reason::STALE);
    }
}
