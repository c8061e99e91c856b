//! Crash recovery: running jobs whose agent stopped heartbeating are given
//! back to the scheduler, or failed once they have used up their attempts.

use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::jobs::now_ms;
use crate::db::{JobStore, StoreError};

/// What one scan did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub revived: Vec<i64>,
    pub failed: Vec<i64>,
}

#[derive(Clone)]
pub struct CrashRecovery {
    store: JobStore,
    stale_threshold: Duration,
    max_attempts: u32,
}

impl CrashRecovery {
    pub fn new(store: JobStore, stale_threshold: Duration, max_attempts: u32) -> Self {
        Self {
            store,
            stale_threshold,
            max_attempts,
        }
    }

    pub fn scan(&self) -> Result<RecoveryReport, StoreError> {
        self.scan_at(now_ms())
    }

    /// Scan as if the current time were `now` (epoch ms).
    pub fn scan_at(&self, now: i64) -> Result<RecoveryReport, StoreError> {
        let mut report = RecoveryReport::default();

        for job in self.store.get_stale_running_at(now, self.stale_threshold)? {
            if job.attempts >= self.max_attempts {
                warn!(
                    "Job {} stale after {} attempt(s), giving up",
                    job.id, job.attempts
                );
                match self.store.mark_failed(job.id) {
                    Ok(()) => report.failed.push(job.id),
                    Err(e) => error!("Failed to fail stale job {}: {}", job.id, e),
                }
                continue;
            }

            match self.store.revive(job.id) {
                Ok(true) => {
                    info!(
                        "Reviving crashed job {} (attempt {} of {})",
                        job.id, job.attempts, self.max_attempts
                    );
                    report.revived.push(job.id);
                }
                Ok(false) => debug!("Job {} left running state before revive", job.id),
                Err(e) => error!("Failed to revive job {}: {}", job.id, e),
            }
        }

        Ok(report)
    }

    /// Scan every `interval` until `shutdown` is cancelled.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let recovery = self.clone();
                    if let Err(e) = self.store.blocking(move |_| recovery.scan()).await {
                        error!("Crash recovery scan failed: {}", e);
                    }
                }
            }
        }
        debug!("Crash recovery stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JobStatus;

    const STALE: Duration = Duration::from_secs(90);

    fn running_job(store: &JobStore, url: &str, claims: u32) -> i64 {
        let id = store.insert(url, 0).unwrap();
        for i in 0..claims {
            if i > 0 {
                assert!(store.revive(id).unwrap());
            }
            store.mark_running(id).unwrap();
        }
        id
    }

    #[test]
    fn test_revives_stale_job() {
        let store = JobStore::in_memory().unwrap();
        let id = running_job(&store, "https://meet.google.com/stale-one", 1);
        let recovery = CrashRecovery::new(store.clone(), STALE, 3);

        // Fresh heartbeat: nothing to do.
        assert_eq!(recovery.scan().unwrap(), RecoveryReport::default());

        let later = now_ms() + 91_000;
        let report = recovery.scan_at(later).unwrap();
        assert_eq!(report.revived, vec![id]);

        let job = store.get(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Scheduled);
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn test_fails_job_at_max_attempts() {
        let store = JobStore::in_memory().unwrap();
        let exhausted = running_job(&store, "https://meet.google.com/tried-three", 3);
        let retryable = running_job(&store, "https://meet.google.com/tried-two", 2);
        let recovery = CrashRecovery::new(store.clone(), STALE, 3);

        let report = recovery.scan_at(now_ms() + 120_000).unwrap();
        assert_eq!(report.failed, vec![exhausted]);
        assert_eq!(report.revived, vec![retryable]);

        assert_eq!(store.get(exhausted).unwrap().unwrap().status, JobStatus::Failed);
        assert_eq!(store.get(retryable).unwrap().unwrap().status, JobStatus::Scheduled);
    }

    #[test]
    fn test_ignores_finished_and_scheduled_jobs() {
        let store = JobStore::in_memory().unwrap();
        let done = running_job(&store, "https://meet.google.com/done-done", 1);
        store.mark_completed(done).unwrap();
        store.insert("https://meet.google.com/later-later", 0).unwrap();

        let recovery = CrashRecovery::new(store.clone(), STALE, 3);
        let report = recovery.scan_at(now_ms() + 600_000).unwrap();
        assert_eq!(report, RecoveryReport::default());
        assert_eq!(store.get(done).unwrap().unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = JobStore::in_memory().unwrap();
        let recovery = CrashRecovery::new(store, STALE, 3);
        let token = CancellationToken::new();

        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            recovery.run(Duration::from_millis(10), token),
        )
        .await
        .unwrap();
    }
}
