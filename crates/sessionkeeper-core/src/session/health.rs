use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use super::SessionController;

/// Background task that re-checks the session on an interval and whenever
/// it is woken (the page became visible again).
pub(crate) struct HealthMonitor {
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn spawn(controller: SessionController, period: Duration) -> Self {
        let wake = Arc::new(Notify::new());
        let woken = Arc::clone(&wake);

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => debug!("Periodic health check"),
                    _ = woken.notified() => debug!("Health check on visibility"),
                }
                controller.health_check().await;
            }
        });

        Self { wake, handle }
    }

    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
