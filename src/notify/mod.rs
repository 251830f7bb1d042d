//! Outbound notification channels: chat alerts (Discord webhook) and push
//! notifications (Pushover).

pub mod chat;
pub mod push;

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum NotifyError {
    /// Non-2xx response, with the body the service returned.
    Http(u16, String),
    Transport(String),
    /// The named environment setting is missing.
    NotConfigured(&'static str),
}

impl fmt::Display for NotifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyError::Http(code, body) => write!(f, "HTTP {}: {}", code, body),
            NotifyError::Transport(msg) => write!(f, "Transport error: {}", msg),
            NotifyError::NotConfigured(what) => write!(f, "{} is not set", what),
        }
    }
}

impl std::error::Error for NotifyError {}

pub(crate) fn http_client(timeout: std::time::Duration) -> Result<reqwest::blocking::Client, NotifyError> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| NotifyError::Transport(e.to_string()))
}

/// Maps a non-success response to `NotifyError::Http`.
pub(crate) fn check_response(response: reqwest::blocking::Response) -> Result<(), NotifyError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        let body = response.text().unwrap_or_default();
        Err(NotifyError::Http(status.as_u16(), body))
    }
}
