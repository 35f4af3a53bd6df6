//! Periodic background pruning of a [`TtlStore`].
//!
//! The sweeper runs detached from request handling on a Tokio task. It can
//! be cancelled and awaited for clean shutdown, and it never keeps the
//! runtime alive on its own.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::ttl::TtlStore;

/// Handle to a running sweep task.
pub struct Sweeper {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn a task that calls [`TtlStore::prune_expired`] every `every`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<V>(
        name: &'static str,
        store: Arc<dyn TtlStore<V>>,
        clock: SharedClock,
        every: Duration,
    ) -> Self
    where
        V: Clone + Send + Sync + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick fires immediately; skip it so a fresh store is
            // not swept at startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = child.cancelled() => {
                        debug!(store = name, "sweeper shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        match store.prune_expired(clock.now()).await {
                            Ok(0) => {}
                            Ok(removed) => info!(store = name, removed, "swept expired entries"),
                            Err(err) => warn!(store = name, %err, "sweep failed"),
                        }
                    }
                }
            }
        });

        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Stop the task and wait for it to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(%err, "sweeper task ended abnormally");
            }
        }
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::clock::{Clock, ManualClock, system_clock};
    use crate::ttl::{Expiring, MemoryTtlStore, TtlStore};

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_interval() {
        let clock = ManualClock::starting_now();
        let store: Arc<MemoryTtlStore<u32>> = Arc::new(MemoryTtlStore::new());
        store
            .put("gone", Expiring::new(1, clock.now() + chrono::Duration::minutes(1)))
            .await
            .unwrap();

        let shared: Arc<dyn TtlStore<u32>> = store.clone();
        let sweeper = Sweeper::spawn(
            "test",
            shared,
            Arc::new(clock.clone()),
            Duration::from_secs(300),
        );

        clock.advance(chrono::Duration::minutes(2));
        tokio::time::sleep(Duration::from_secs(301)).await;
        tokio::task::yield_now().await;

        assert!(store.get("gone").await.unwrap().is_none());
        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_task() {
        let store: Arc<MemoryTtlStore<u32>> = Arc::new(MemoryTtlStore::new());
        store
            .put("k", Expiring::new(1, Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        let shared: Arc<dyn TtlStore<u32>> = store;
        let sweeper = Sweeper::spawn("test", shared, system_clock(), Duration::from_secs(60));
        assert!(sweeper.is_running());
        sweeper.shutdown().await;
    }
}
