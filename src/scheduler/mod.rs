//! The scheduler loop: claims due jobs and supervises one agent per job.
//!
//! Claiming goes through [`JobStore::mark_running`], so any number of
//! schedulers can share a database and each job still starts once. The local
//! dispatch set only stops this process from launching a job twice while its
//! agent is alive.

pub mod launcher;
pub mod recovery;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::db::jobs::now_ms;
use crate::db::{JobStore, MeetingJob, StoreError};
use crate::pool::TaskPool;

pub use launcher::{AgentExit, AgentLauncher, ProcessLauncher};
pub use recovery::{CrashRecovery, RecoveryReport};

pub struct Scheduler {
    store: JobStore,
    launcher: Arc<dyn AgentLauncher>,
    pool: TaskPool<i64>,
    dispatched: Arc<Mutex<HashSet<i64>>>,
    max_parallel: usize,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(store: JobStore, launcher: Arc<dyn AgentLauncher>, config: &SchedulerConfig) -> Self {
        let max_parallel = config.max_parallel.max(1);
        Self {
            store,
            launcher,
            pool: TaskPool::new(max_parallel),
            dispatched: Arc::new(Mutex::new(HashSet::new())),
            max_parallel,
            poll_interval: config.poll_interval(),
        }
    }

    fn dispatched(&self) -> MutexGuard<'_, HashSet<i64>> {
        lock_set(&self.dispatched)
    }

    /// Jobs whose agent this scheduler is supervising.
    pub fn in_flight(&self) -> usize {
        self.dispatched().len()
    }

    pub fn is_dispatched(&self, job_id: i64) -> bool {
        self.dispatched().contains(&job_id)
    }

    /// One scheduling pass. Returns the number of agents launched.
    pub async fn tick(&self) -> Result<usize, StoreError> {
        if self.pool.is_shutdown_requested() {
            return Ok(0);
        }

        let in_flight = self.in_flight();
        if in_flight >= self.max_parallel {
            debug!("At capacity ({} agents), skipping poll", in_flight);
            return Ok(0);
        }

        let free = self.max_parallel - in_flight;
        let dispatched = Arc::clone(&self.dispatched);
        let claimed = self
            .store
            .blocking(move |store| claim_due(store, &dispatched, free))
            .await?;

        let mut launched = 0;
        for job in claimed {
            if self.dispatch(job).await {
                launched += 1;
            }
        }

        Ok(launched)
    }

    async fn dispatch(&self, job: MeetingJob) -> bool {
        let id = job.id;
        let url = job.meeting_url;
        info!("Launching agent for job {} ({})", id, url);

        let launcher = Arc::clone(&self.launcher);
        let store = self.store.clone();
        let dispatched = Arc::clone(&self.dispatched);

        let submitted = self.pool.submit(id, async move {
            let exit = launcher.launch(id, &url).await;
            lock_set(&dispatched).remove(&id);

            let failed = match exit {
                Ok(exit) if exit.success() => {
                    info!("Agent for job {} exited cleanly", id);
                    false
                }
                Ok(exit) => {
                    warn!("Agent for job {} ended with {}", id, exit);
                    true
                }
                Err(e) => {
                    error!("Agent for job {} could not run: {:#}", id, e);
                    true
                }
            };

            if failed {
                if let Err(e) = store.blocking(move |s| s.mark_failed(id)).await {
                    error!("Failed to mark job {} failed: {}", id, e);
                }
            }
        });

        if let Err(e) = submitted {
            warn!("Job {} not launched: {}", id, e);
            self.dispatched().remove(&id);
            // Hand the claim back so another scheduler can take it.
            if let Err(e) = self.store.blocking(move |s| s.revive(id)).await {
                error!("Failed to release claim on job {}: {}", id, e);
            }
            return false;
        }
        true
    }

    /// Poll until `shutdown` is cancelled, then wait for running agents.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Scheduler started (max {} agents, polling every {:?})",
            self.max_parallel, self.poll_interval
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Scheduler poll failed: {}", e);
                    }
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop launching and wait for every supervised agent to exit.
    pub async fn shutdown(&self) {
        self.pool.request_shutdown();
        let remaining = self.in_flight();
        if remaining > 0 {
            info!("Waiting for {} agent(s) to exit", remaining);
        }
        self.pool.wait_for_completion().await;
        info!("Scheduler stopped");
    }
}

fn lock_set(set: &Mutex<HashSet<i64>>) -> MutexGuard<'_, HashSet<i64>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Claim up to `limit` due jobs. Each id enters `dispatched` before its claim
/// is attempted and leaves it again if the claim is lost.
fn claim_due(
    store: &JobStore,
    dispatched: &Mutex<HashSet<i64>>,
    limit: usize,
) -> Result<Vec<MeetingJob>, StoreError> {
    let mut claimed = Vec::new();
    for job in store.get_next_due_jobs(now_ms(), limit)? {
        if !lock_set(dispatched).insert(job.id) {
            debug!("Job {} already has a live agent here", job.id);
            continue;
        }

        match store.mark_running(job.id) {
            Ok(()) => claimed.push(job),
            Err(StoreError::ClaimConflict { .. }) => {
                debug!("Job {} claimed elsewhere", job.id);
                lock_set(dispatched).remove(&job.id);
            }
            Err(e) => {
                error!("Failed to claim job {}: {}", job.id, e);
                lock_set(dispatched).remove(&job.id);
            }
        }
    }
    Ok(claimed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JobStatus;
    use async_trait::async_trait;

    /// Agent stand-in: exits with `code` once the gate is cancelled (or
    /// immediately when not gated).
    struct FakeLauncher {
        code: Option<i32>,
        gate: Option<CancellationToken>,
        launches: Mutex<Vec<i64>>,
    }

    impl FakeLauncher {
        fn exiting(code: Option<i32>) -> Arc<Self> {
            Arc::new(Self {
                code,
                gate: None,
                launches: Mutex::new(Vec::new()),
            })
        }

        fn gated(code: Option<i32>, gate: CancellationToken) -> Arc<Self> {
            Arc::new(Self {
                code,
                gate: Some(gate),
                launches: Mutex::new(Vec::new()),
            })
        }

        fn launches(&self) -> Vec<i64> {
            self.launches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AgentLauncher for FakeLauncher {
        async fn launch(&self, job_id: i64, _url: &str) -> anyhow::Result<AgentExit> {
            self.launches.lock().unwrap().push(job_id);
            if let Some(gate) = &self.gate {
                gate.cancelled().await;
            }
            Ok(AgentExit { code: self.code })
        }
    }

    struct BrokenLauncher;

    #[async_trait]
    impl AgentLauncher for BrokenLauncher {
        async fn launch(&self, _job_id: i64, _url: &str) -> anyhow::Result<AgentExit> {
            anyhow::bail!("no such file")
        }
    }

    fn config(max_parallel: usize) -> SchedulerConfig {
        SchedulerConfig {
            max_parallel,
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    async fn settle(scheduler: &Scheduler) {
        for _ in 0..200 {
            if scheduler.in_flight() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        scheduler.pool.wait_for_completion().await;
    }

    fn status(store: &JobStore, id: i64) -> JobStatus {
        store.get(id).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_tick_respects_max_parallel() {
        let store = JobStore::in_memory().unwrap();
        let ids: Vec<i64> = (0..5)
            .map(|i| store.insert(&format!("https://meet.google.com/job-{i}"), i).unwrap())
            .collect();

        let gate = CancellationToken::new();
        let launcher = FakeLauncher::gated(Some(0), gate.clone());
        let scheduler = Scheduler::new(store.clone(), launcher.clone(), &config(2));

        assert_eq!(scheduler.tick().await.unwrap(), 2);
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        assert_eq!(scheduler.in_flight(), 2);

        // Oldest join_at first.
        assert_eq!(status(&store, ids[0]), JobStatus::Running);
        assert_eq!(status(&store, ids[1]), JobStatus::Running);
        assert_eq!(status(&store, ids[2]), JobStatus::Scheduled);

        gate.cancel();
        settle(&scheduler).await;
        assert_eq!(scheduler.in_flight(), 0);

        // Clean exits leave the status to the agent.
        assert_eq!(status(&store, ids[0]), JobStatus::Running);
        assert_eq!(scheduler.tick().await.unwrap(), 2);
        gate.cancel();
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_future_jobs_wait() {
        let store = JobStore::in_memory().unwrap();
        let id = store
            .insert("https://meet.google.com/later-later", now_ms() + 60_000)
            .unwrap();
        let launcher = FakeLauncher::exiting(Some(0));
        let scheduler = Scheduler::new(store.clone(), launcher.clone(), &config(10));

        assert_eq!(scheduler.tick().await.unwrap(), 0);
        assert!(launcher.launches().is_empty());
        assert_eq!(status(&store, id), JobStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_nonzero_exit_marks_failed() {
        let store = JobStore::in_memory().unwrap();
        let crashed = store.insert("https://meet.google.com/crash-crash", 0).unwrap();
        let scheduler = Scheduler::new(store.clone(), FakeLauncher::exiting(Some(1)), &config(10));

        assert_eq!(scheduler.tick().await.unwrap(), 1);
        settle(&scheduler).await;
        assert_eq!(status(&store, crashed), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_signal_killed_agent_marks_failed() {
        let store = JobStore::in_memory().unwrap();
        let id = store.insert("https://meet.google.com/kill-kill", 0).unwrap();
        let scheduler = Scheduler::new(store.clone(), FakeLauncher::exiting(None), &config(10));

        scheduler.tick().await.unwrap();
        settle(&scheduler).await;
        assert_eq!(status(&store, id), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_launch_error_marks_failed() {
        let store = JobStore::in_memory().unwrap();
        let id = store.insert("https://meet.google.com/nope-nope", 0).unwrap();
        let scheduler = Scheduler::new(store.clone(), Arc::new(BrokenLauncher), &config(10));

        scheduler.tick().await.unwrap();
        settle(&scheduler).await;
        assert_eq!(status(&store, id), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_revived_job_not_relaunched_while_agent_alive() {
        let store = JobStore::in_memory().unwrap();
        let id = store.insert("https://meet.google.com/hung-hung", 0).unwrap();
        let gate = CancellationToken::new();
        let launcher = FakeLauncher::gated(Some(0), gate.clone());
        let scheduler = Scheduler::new(store.clone(), launcher.clone(), &config(10));

        scheduler.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.revive(id).unwrap());

        assert_eq!(scheduler.tick().await.unwrap(), 0);
        assert_eq!(launcher.launches(), vec![id]);
        assert_eq!(status(&store, id), JobStatus::Scheduled);

        gate.cancel();
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_launch_after_shutdown() {
        let store = JobStore::in_memory().unwrap();
        let scheduler = Scheduler::new(store.clone(), FakeLauncher::exiting(Some(0)), &config(10));
        scheduler.shutdown().await;

        let id = store.insert("https://meet.google.com/late-late", 0).unwrap();
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        assert_eq!(status(&store, id), JobStatus::Scheduled);
        assert!(!scheduler.is_dispatched(id));
    }

    #[tokio::test]
    async fn test_run_until_cancelled() {
        let store = JobStore::in_memory().unwrap();
        let id = store.insert("https://meet.google.com/loop-loop", 0).unwrap();
        let launcher = FakeLauncher::exiting(Some(0));
        let scheduler = Scheduler::new(store.clone(), launcher.clone(), &config(10));

        let token = CancellationToken::new();
        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stopper.cancel();
        });

        scheduler.run(token).await;
        assert_eq!(launcher.launches(), vec![id]);
        assert_eq!(status(&store, id), JobStatus::Running);
    }
}
