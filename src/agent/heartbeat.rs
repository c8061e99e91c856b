use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::db::JobStore;

/// Periodic liveness write for a running job.
pub struct Heartbeat {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    /// Beat once immediately, then every `period` until stopped.
    pub fn spawn(store: JobStore, job_id: i64, period: Duration) -> Self {
        let token = CancellationToken::new();
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => store.beat(job_id).await,
                }
            }
            debug!("Heartbeat for job {} stopped", job_id);
        });

        Self { token, handle }
    }

    /// Stop beating. No write happens after this returns.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}
