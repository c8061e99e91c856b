//! Detects the end of a meeting by probing the session on a fixed period.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{Provider, SessionDriver, SessionSnapshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The page navigated off the provider's host.
    LeftProviderHost,
    /// A removal or meeting-ended banner is visible.
    Removed(String),
    /// The in-session leave control disappeared.
    LeaveControlGone,
    /// Only the bot is left.
    Alone(u32),
    /// The session could not be probed.
    SessionLost(String),
    /// The process was asked to terminate.
    Signal(&'static str),
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::LeftProviderHost => write!(f, "left the meeting host"),
            ExitReason::Removed(marker) => write!(f, "removed from meeting ({marker})"),
            ExitReason::LeaveControlGone => write!(f, "leave control disappeared"),
            ExitReason::Alone(count) => write!(f, "participant count dropped to {count}"),
            ExitReason::SessionLost(e) => write!(f, "session lost: {e}"),
            ExitReason::Signal(name) => write!(f, "received {name}"),
        }
    }
}

/// One-shot exit signal shared by every exit source of an agent. Only the
/// first `fire` wins; its reason is the one reported.
#[derive(Clone, Default)]
pub struct ExitNotifier {
    inner: Arc<NotifierInner>,
}

#[derive(Default)]
struct NotifierInner {
    fired: AtomicBool,
    reason: Mutex<Option<ExitReason>>,
    token: CancellationToken,
}

impl ExitNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the notifier had already fired.
    pub fn fire(&self, reason: ExitReason) -> bool {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            debug!("Exit already signalled, ignoring: {}", reason);
            return false;
        }
        info!("Exit triggered: {}", reason);
        *self
            .inner
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(reason);
        self.inner.token.cancel();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<ExitReason> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Resolves once fired.
    pub async fn wait(&self) -> Option<ExitReason> {
        self.inner.token.cancelled().await;
        self.reason()
    }
}

/// Decide from one snapshot whether the meeting is over for the bot.
///
/// Participant counts are ignored until `grace` has passed since joining,
/// since the page fills in the roster gradually.
pub fn evaluate(
    snapshot: &SessionSnapshot,
    provider: Provider,
    since_join: Duration,
    grace: Duration,
) -> Option<ExitReason> {
    if !snapshot.on_provider_host(provider) {
        return Some(ExitReason::LeftProviderHost);
    }
    if let Some(marker) = snapshot.removal_marker(provider) {
        return Some(ExitReason::Removed(marker.to_string()));
    }
    if !snapshot.leave_control_visible {
        return Some(ExitReason::LeaveControlGone);
    }
    if since_join < grace {
        return None;
    }
    match snapshot.participant_count {
        Some(count) if count < 2 => Some(ExitReason::Alone(count)),
        _ => None,
    }
}

pub struct ExitWatcher {
    pub provider: Provider,
    pub interval: Duration,
    pub grace: Duration,
}

impl ExitWatcher {
    pub fn new(provider: Provider, interval: Duration, grace: Duration) -> Self {
        Self {
            provider,
            interval,
            grace,
        }
    }

    /// Probe `driver` every `interval` until an exit condition holds or the
    /// notifier fires from elsewhere.
    pub fn spawn(self, driver: Arc<dyn SessionDriver>, notifier: ExitNotifier) -> JoinHandle<()> {
        tokio::spawn(async move {
            let joined_at = Instant::now();
            let mut last_count: Option<u32> = None;

            loop {
                tokio::select! {
                    _ = notifier.wait() => break,
                    _ = tokio::time::sleep(self.interval) => {}
                }

                let reason = match driver.probe().await {
                    Ok(snapshot) => {
                        if snapshot.participant_count.is_some()
                            && snapshot.participant_count != last_count
                        {
                            info!("Participants: {:?}", snapshot.participant_count);
                            last_count = snapshot.participant_count;
                        }
                        evaluate(&snapshot, self.provider, joined_at.elapsed(), self.grace)
                    }
                    Err(e) => Some(ExitReason::SessionLost(e.to_string())),
                };

                if let Some(reason) = reason {
                    notifier.fire(reason);
                    break;
                }
            }
            debug!("Exit watcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::driver::testing::{joined, lobby, ScriptedDriver};

    const URL: &str = "https://meet.google.com/abc-defg-hij";
    const GRACE: Duration = Duration::from_secs(30);

    #[test]
    fn test_evaluate_left_host() {
        let snapshot = joined("https://www.google.com/", Some(4));
        assert_eq!(
            evaluate(&snapshot, Provider::Google, GRACE, GRACE),
            Some(ExitReason::LeftProviderHost)
        );
    }

    #[test]
    fn test_evaluate_removed_banner() {
        let mut snapshot = joined(URL, Some(4));
        snapshot.page_text = "No one responded to your request to join".to_string();
        assert_eq!(
            evaluate(&snapshot, Provider::Google, Duration::ZERO, GRACE),
            Some(ExitReason::Removed("No one responded".to_string()))
        );
    }

    #[test]
    fn test_evaluate_leave_control_gone() {
        assert_eq!(
            evaluate(&lobby(URL), Provider::Google, Duration::ZERO, GRACE),
            Some(ExitReason::LeaveControlGone)
        );
    }

    #[test]
    fn test_evaluate_participants_after_grace_only() {
        let alone = joined(URL, Some(1));
        assert_eq!(
            evaluate(&alone, Provider::Google, Duration::from_secs(10), GRACE),
            None
        );
        assert_eq!(
            evaluate(&alone, Provider::Google, Duration::from_secs(31), GRACE),
            Some(ExitReason::Alone(1))
        );

        let busy = joined(URL, Some(2));
        assert_eq!(evaluate(&busy, Provider::Google, Duration::from_secs(31), GRACE), None);

        let unknown = joined(URL, None);
        assert_eq!(evaluate(&unknown, Provider::Google, Duration::from_secs(31), GRACE), None);
    }

    #[test]
    fn test_notifier_fires_once() {
        let notifier = ExitNotifier::new();
        let other = notifier.clone();

        assert!(notifier.fire(ExitReason::LeaveControlGone));
        assert!(!other.fire(ExitReason::Signal("SIGTERM")));
        assert!(other.is_fired());
        assert_eq!(other.reason(), Some(ExitReason::LeaveControlGone));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_fires_when_alone_after_grace() {
        let driver = Arc::new(ScriptedDriver::new(vec![Ok(joined(URL, Some(1)))]));
        let notifier = ExitNotifier::new();

        let handle = ExitWatcher::new(Provider::Google, Duration::from_secs(3), GRACE)
            .spawn(driver.clone(), notifier.clone());

        let reason = notifier.wait().await;
        handle.await.unwrap();

        assert_eq!(reason, Some(ExitReason::Alone(1)));
        // 3s period, 30s grace: no exit before the tenth probe.
        let probes = driver.probes.load(Ordering::SeqCst);
        assert!((10..=11).contains(&probes), "probes = {probes}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_reports_probe_error_as_session_lost() {
        let driver = Arc::new(ScriptedDriver::new(vec![
            Ok(joined(URL, Some(3))),
            Err("target closed".to_string()),
        ]));
        let notifier = ExitNotifier::new();

        ExitWatcher::new(Provider::Google, Duration::from_secs(3), GRACE)
            .spawn(driver, notifier.clone())
            .await
            .unwrap();

        assert!(matches!(notifier.reason(), Some(ExitReason::SessionLost(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_stops_when_fired_elsewhere() {
        let driver = Arc::new(ScriptedDriver::new(vec![Ok(joined(URL, Some(5)))]));
        let notifier = ExitNotifier::new();

        let handle = ExitWatcher::new(Provider::Google, Duration::from_secs(3), GRACE)
            .spawn(driver.clone(), notifier.clone());

        tokio::time::sleep(Duration::from_secs(7)).await;
        notifier.fire(ExitReason::Signal("SIGINT"));
        handle.await.unwrap();

        assert_eq!(notifier.reason(), Some(ExitReason::Signal("SIGINT")));
        assert_eq!(driver.probes.load(Ordering::SeqCst), 2);
    }
}
