use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// Meeting providers the bot knows how to join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Google,
    Microsoft,
    Zoom,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Google, Provider::Microsoft, Provider::Zoom];

    /// Provider whose URL pattern accepts `url`.
    pub fn from_url(url: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.matches(url))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Microsoft => "microsoft",
            Provider::Zoom => "zoom",
        }
    }

    /// Whether `url` is a joinable meeting link for this provider.
    pub fn matches(&self, url: &str) -> bool {
        self.url_pattern()
            .map(|re| re.is_match(url.trim()))
            .unwrap_or(false)
    }

    /// Substring every in-session page URL contains. A session whose URL
    /// loses it has navigated away from the meeting.
    pub fn host_marker(&self) -> &'static str {
        match self {
            Provider::Google => "meet.google.com",
            Provider::Microsoft => "teams.microsoft.com",
            Provider::Zoom => "zoom.us",
        }
    }

    /// Page text shown once the bot has been removed or the meeting ended.
    pub fn removal_markers(&self) -> &'static [&'static str] {
        match self {
            Provider::Google => &[
                "You were removed from the meeting",
                "Return to home",
                "No one responded",
            ],
            Provider::Microsoft => &[
                "You've been removed from this meeting",
                "The meeting has ended",
                "Rejoin",
            ],
            Provider::Zoom => &[
                "You have been removed from this meeting",
                "This meeting has been ended by host",
                "The meeting has ended",
            ],
        }
    }

    fn url_pattern(&self) -> Option<&'static Regex> {
        static GOOGLE: OnceLock<Option<Regex>> = OnceLock::new();
        static MICROSOFT: OnceLock<Option<Regex>> = OnceLock::new();
        static ZOOM: OnceLock<Option<Regex>> = OnceLock::new();

        let (cell, pattern) = match self {
            Provider::Google => (&GOOGLE, r"(?i)^https://meet\.google\.com/[a-z0-9\-]+$"),
            Provider::Microsoft => (
                &MICROSOFT,
                r"(?i)^https://teams\.microsoft\.com/(l/meetup-join|meet)/\S+$",
            ),
            Provider::Zoom => (
                &ZOOM,
                r"(?i)^https://([a-z0-9\-]+\.)?zoom\.us/(j|wc/join)/\d+(\?\S*)?$",
            ),
        };
        cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
