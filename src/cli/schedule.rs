use chrono::{Local, TimeZone};
use thiserror::Error;
use tracing::debug;

use crate::db::jobs::now_ms;
use crate::db::{JobStore, StoreError};
use crate::session::Provider;

use super::args::ScheduleCliArgs;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid meeting URL: {0}")]
    InvalidUrl(String),
    #[error("Delay minutes must be a positive integer, got {0:?}")]
    InvalidDelay(String),
}

/// Provider of a schedulable meeting link.
pub fn validate_url(url: &str) -> Result<Provider, ValidationError> {
    Provider::from_url(url).ok_or_else(|| ValidationError::InvalidUrl(url.to_string()))
}

/// Parse a strictly positive whole number of minutes.
pub fn parse_delay(raw: &str) -> Result<u32, ValidationError> {
    match raw.trim().parse::<u32>() {
        Ok(minutes) if minutes > 0 => Ok(minutes),
        _ => Err(ValidationError::InvalidDelay(raw.to_string())),
    }
}

/// Returns the process exit code: 0 when the meeting is (or already was)
/// scheduled, 1 otherwise.
pub fn handle_schedule_command(args: ScheduleCliArgs) -> i32 {
    let url = args.url.trim();

    let validated = validate_url(url).and_then(|provider| {
        parse_delay(&args.delay_minutes).map(|minutes| (provider, minutes))
    });
    let (provider, minutes) = match validated {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{e} (usage: meetbot schedule <MEETING_URL> <DELAY_MINUTES>)");
            return 1;
        }
    };

    let store = match JobStore::open_default() {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Failed to open job store: {e:#}");
            return 1;
        }
    };

    let join_at = now_ms() + i64::from(minutes) * 60_000;
    match store.insert(url, join_at) {
        Ok(id) => {
            debug!("Inserted job {} for {} meeting", id, provider);
            println!("Meeting scheduled (job {id})");
            println!("URL: {url}");
            println!("Join in: {minutes} minute(s)");
            if let Some(at) = Local.timestamp_millis_opt(join_at).single() {
                println!("Join at: {}", at.format("%Y-%m-%d %H:%M:%S"));
            }
            0
        }
        Err(StoreError::Duplicate { .. }) => {
            eprintln!("Meeting already scheduled (duplicate URL)");
            0
        }
        Err(e) => {
            eprintln!("Failed to schedule meeting: {e}");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert_eq!(
            validate_url("https://meet.google.com/abc-defg-hij"),
            Ok(Provider::Google)
        );
        assert!(matches!(
            validate_url("https://meet.google.com/abc defg"),
            Err(ValidationError::InvalidUrl(_))
        ));
        assert!(validate_url("").is_err());
    }

    #[test]
    fn test_parse_delay() {
        assert_eq!(parse_delay("1"), Ok(1));
        assert_eq!(parse_delay(" 15 "), Ok(15));
        for bad in ["0", "-3", "1.5", "abc", ""] {
            assert_eq!(
                parse_delay(bad),
                Err(ValidationError::InvalidDelay(bad.to_string())),
                "{bad:?} should be rejected"
            );
        }
    }
}
