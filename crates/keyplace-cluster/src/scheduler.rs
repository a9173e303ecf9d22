//! Round scheduler — periodic trigger for demand collection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::manager::{PlacementManager, TickOutcome};

pub struct RoundScheduler {
    manager: Arc<PlacementManager>,
    initial_delay: Duration,
    interval: Duration,
}

/// A running scheduler task and its shutdown switch.
pub struct SchedulerHandle {
    pub handle: JoinHandle<u64>,
    pub shutdown_tx: watch::Sender<bool>,
}

impl SchedulerHandle {
    /// Stop the loop and return how many ticks it ran. A task that
    /// panicked or was aborted is logged and counts as zero.
    pub async fn stop(self) -> u64 {
        let _ = self.shutdown_tx.send(true);
        match self.handle.await {
            Ok(ticks) => ticks,
            Err(e) => {
                error!(error = %e, cancelled = e.is_cancelled(), "round scheduler task did not finish cleanly");
                0
            }
        }
    }
}

impl RoundScheduler {
    /// Schedule from the manager's configured delay and period.
    pub fn new(manager: Arc<PlacementManager>) -> Self {
        let config = manager.config();
        let initial_delay = config.initial_delay();
        let interval = config.round_interval();
        Self {
            manager,
            initial_delay,
            interval,
        }
    }

    pub fn with_timing(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.interval = interval;
        self
    }

    pub fn spawn(self) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { self.run(shutdown_rx).await });
        SchedulerHandle {
            handle,
            shutdown_tx,
        }
    }

    /// Tick until `shutdown` flips. Returns the number of ticks run.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> u64 {
        let node = self.manager.local_node().clone();
        info!(
            %node,
            initial_delay = ?self.initial_delay,
            interval = ?self.interval,
            "round scheduler started"
        );

        tokio::select! {
            _ = tokio::time::sleep(self.initial_delay) => {}
            _ = shutdown.changed() => {
                info!(%node, "round scheduler stopped before first tick");
                return 0;
            }
        }

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    ticks += 1;
                    match self.manager.tick().await {
                        Ok(TickOutcome::Sent { round, .. }) => debug!(%node, round, "tick sent demand"),
                        Ok(outcome) => debug!(%node, ?outcome, "tick sent nothing"),
                        Err(e) => error!(%node, error = %e, "demand collection failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!(%node, ticks, "round scheduler shutting down");
                    break;
                }
            }
        }
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use crate::sim::{LoopbackNetwork, RecordingExecutor, StaticResolver, StaticStats};
    use keyplace_core::{NodeId, PlacementConfig};

    fn manager() -> Arc<PlacementManager> {
        let net = Arc::new(LoopbackNetwork::new());
        let (transport, _inbox) = net.join(NodeId::from("a"));
        let peers = Collaborators {
            stats: Arc::new(StaticStats::new(10)),
            resolver: Arc::new(StaticResolver::new(net.clone())),
            transport,
            executor: Arc::new(RecordingExecutor::new()),
            store: None,
        };
        Arc::new(PlacementManager::new(PlacementConfig::default(), peers).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn first_tick_waits_for_the_initial_delay() {
        let handle = RoundScheduler::new(manager()).spawn();
        tokio::time::sleep(Duration::from_secs(899)).await;
        assert_eq!(handle.stop().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_task_stops_with_zero_ticks() {
        let handle = RoundScheduler::new(manager())
            .with_timing(Duration::from_secs(1), Duration::from_secs(1))
            .spawn();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        handle.handle.abort();
        assert_eq!(handle.stop().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_once_per_interval() {
        let handle = RoundScheduler::new(manager()).spawn();
        // Ticks at 900s, 1900s, 2900s and 3900s.
        tokio::time::sleep(Duration::from_secs(4_400)).await;
        assert_eq!(handle.stop().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_timing_overrides_config() {
        let handle = RoundScheduler::new(manager())
            .with_timing(Duration::from_secs(1), Duration::from_secs(2))
            .spawn();
        tokio::time::sleep(Duration::from_millis(6_500)).await;
        // 1s, 3s, 5s.
        assert_eq!(handle.stop().await, 3);
    }
}
