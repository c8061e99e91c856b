use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{Provider, SessionError, SessionSnapshot};

/// Handle on one live meeting session.
///
/// Methods take `&self` so the agent and the exit watcher can share one
/// driver behind an `Arc`.
#[async_trait]
pub trait SessionDriver: Send + Sync {
    /// Navigate to `url` and start the join flow.
    async fn open(&self, provider: Provider, url: &str) -> Result<(), SessionError>;

    /// Current state of the session. `SessionError::Closed` once the session
    /// can no longer be observed.
    async fn probe(&self) -> Result<SessionSnapshot, SessionError>;

    /// Leave and tear down. Safe to call more than once.
    async fn close(&self);
}

/// Open the session and wait until the bot is inside the meeting.
///
/// Probe errors other than `Closed` are treated as "not joined yet".
pub async fn join_session(
    driver: &dyn SessionDriver,
    provider: Provider,
    url: &str,
    timeout: Duration,
    poll: Duration,
) -> Result<(), SessionError> {
    info!("Joining {} meeting {}", provider, url);
    driver.open(provider, url).await?;

    let deadline = Instant::now() + timeout;
    loop {
        match driver.probe().await {
            Ok(snapshot) if snapshot.in_session(provider) => {
                info!("Inside meeting {}", url);
                return Ok(());
            }
            Ok(snapshot) => debug!("Not in meeting yet (url: {})", snapshot.url),
            Err(SessionError::Closed) => return Err(SessionError::Closed),
            Err(e) => debug!("Join probe failed: {}", e),
        }

        if Instant::now() + poll > deadline {
            return Err(SessionError::JoinTimeout(timeout));
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted driver shared by the session and agent tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Replays queued probe results; the last one repeats forever.
    pub struct ScriptedDriver {
        script: Mutex<VecDeque<Result<SessionSnapshot, String>>>,
        last: Mutex<Result<SessionSnapshot, String>>,
        pub probes: AtomicUsize,
        pub opened: AtomicBool,
        pub closed: AtomicBool,
    }

    impl ScriptedDriver {
        pub fn new(script: Vec<Result<SessionSnapshot, String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(Err("no snapshot".to_string())),
                probes: AtomicUsize::new(0),
                opened: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }
        }
    }

    pub fn joined(url: &str, participants: Option<u32>) -> SessionSnapshot {
        SessionSnapshot {
            url: url.to_string(),
            leave_control_visible: true,
            participant_count: participants,
            ..Default::default()
        }
    }

    pub fn lobby(url: &str) -> SessionSnapshot {
        SessionSnapshot {
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[async_trait]
    impl SessionDriver for ScriptedDriver {
        async fn open(&self, _provider: Provider, _url: &str) -> Result<(), SessionError> {
            self.opened.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn probe(&self) -> Result<SessionSnapshot, SessionError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.closed.load(Ordering::SeqCst) {
                return Err(SessionError::Closed);
            }
            let next = self.script.lock().unwrap().pop_front();
            let result = match next {
                Some(result) => {
                    *self.last.lock().unwrap() = result.clone();
                    result
                }
                None => self.last.lock().unwrap().clone(),
            };
            result.map_err(SessionError::Driver)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::atomic::Ordering;

    const URL: &str = "https://meet.google.com/abc-defg-hij";

    #[tokio::test(start_paused = true)]
    async fn test_join_after_lobby() {
        let driver = ScriptedDriver::new(vec![
            Ok(lobby(URL)),
            Err("page not ready".to_string()),
            Ok(joined(URL, Some(3))),
        ]);

        join_session(
            &driver,
            Provider::Google,
            URL,
            Duration::from_secs(300),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        assert!(driver.opened.load(Ordering::SeqCst));
        assert_eq!(driver.probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_times_out() {
        let driver = ScriptedDriver::new(vec![Ok(lobby(URL))]);

        let result = join_session(
            &driver,
            Provider::Google,
            URL,
            Duration::from_secs(10),
            Duration::from_secs(2),
        )
        .await;

        assert!(matches!(result, Err(SessionError::JoinTimeout(_))));
        assert!(driver.probes.load(Ordering::SeqCst) <= 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_fails_fast_when_closed() {
        let driver = ScriptedDriver::new(vec![Ok(lobby(URL))]);
        driver.close().await;

        let result = join_session(
            &driver,
            Provider::Google,
            URL,
            Duration::from_secs(300),
            Duration::from_secs(2),
        )
        .await;
        assert!(matches!(result, Err(SessionError::Closed)));
        assert_eq!(driver.probes.load(Ordering::SeqCst), 1);
    }
}
