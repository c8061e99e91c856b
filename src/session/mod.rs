//! The meeting session: joining it, observing it and noticing when it ends.
//!
//! The bot never drives a browser itself. A [`SessionDriver`] exposes the
//! session as a stream of [`SessionSnapshot`]s and everything here is decided
//! from those snapshots.

pub mod command_driver;
pub mod driver;
pub mod exit_watcher;
pub mod provider;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use command_driver::CommandSessionDriver;
pub use driver::{join_session, SessionDriver};
pub use exit_watcher::{ExitNotifier, ExitReason, ExitWatcher};
pub use provider::Provider;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("timed out after {0:?} waiting to join the meeting")]
    JoinTimeout(std::time::Duration),

    #[error("session driver error: {0}")]
    Driver(String),

    #[error("session closed")]
    Closed,
}

/// What the session looked like at one probe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSnapshot {
    /// Current page URL.
    pub url: String,
    /// Visible page text, searched for removal banners.
    pub page_text: String,
    /// The in-session "leave call" control is present.
    pub leave_control_visible: bool,
    /// Participants including the bot, when the page shows a count.
    pub participant_count: Option<u32>,
}

impl SessionSnapshot {
    pub fn on_provider_host(&self, provider: Provider) -> bool {
        self.url.contains(provider.host_marker())
    }

    /// The bot is inside the meeting.
    pub fn in_session(&self, provider: Provider) -> bool {
        self.on_provider_host(provider) && self.leave_control_visible
    }

    /// First removal banner visible on the page.
    pub fn removal_marker(&self, provider: Provider) -> Option<&'static str> {
        provider
            .removal_markers()
            .iter()
            .copied()
            .find(|marker| self.page_text.contains(marker))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_parses_partial_json() {
        let snapshot: SessionSnapshot = serde_json::from_str(
            r#"{"url":"https://meet.google.com/abc-defg-hij","leave_control_visible":true}"#,
        )
        .unwrap();
        assert!(snapshot.in_session(Provider::Google));
        assert_eq!(snapshot.participant_count, None);
        assert!(snapshot.page_text.is_empty());
    }

    #[test]
    fn test_in_session_requires_host_and_control() {
        let mut snapshot = SessionSnapshot {
            url: "https://meet.google.com/abc-defg-hij".to_string(),
            leave_control_visible: false,
            ..Default::default()
        };
        assert!(!snapshot.in_session(Provider::Google));

        snapshot.leave_control_visible = true;
        assert!(snapshot.in_session(Provider::Google));

        snapshot.url = "https://accounts.google.com/signin".to_string();
        assert!(!snapshot.in_session(Provider::Google));
    }

    #[test]
    fn test_removal_marker() {
        let snapshot = SessionSnapshot {
            page_text: "You were removed from the meeting\nReturn to home".to_string(),
            ..Default::default()
        };
        assert_eq!(
            snapshot.removal_marker(Provider::Google),
            Some("You were removed from the meeting")
        );
        assert_eq!(SessionSnapshot::default().removal_marker(Provider::Google), None);
    }
}
