/// Push notifications via Pushover.
///
/// API Documentation: https://pushover.net/api

use super::{NotifyError, check_response, http_client};
use crate::model::{RoutePriority, RouteVerdict};
use std::time::Duration;

const PUSHOVER_URL: &str = "https://api.pushover.net/1/messages.json";
pub const DEFAULT_TITLE: &str = "Traffic Update";

#[derive(Debug, Clone, PartialEq)]
pub struct PushMessage {
    pub title: String,
    pub message: String,
    /// Pushover priority: 0 normal, 1 high.
    pub priority: i8,
}

pub trait PushChannel: Send + Sync {
    fn send(&self, message: &PushMessage) -> Result<(), NotifyError>;
}

/// High when any High-priority route in the push set is heavy.
pub fn push_priority(verdicts: &[&RouteVerdict]) -> i8 {
    let urgent = verdicts
        .iter()
        .any(|v| v.route.priority == RoutePriority::High && v.result.is_heavy);
    if urgent { 1 } else { 0 }
}

pub fn build_message(title: &str, body: String, verdicts: &[&RouteVerdict]) -> PushMessage {
    PushMessage {
        title: title.to_string(),
        message: body,
        priority: push_priority(verdicts),
    }
}

pub struct Pushover {
    client: reqwest::blocking::Client,
    token: String,
    user: String,
}

impl Pushover {
    pub fn new(token: &str, user: &str, timeout: Duration) -> Result<Self, NotifyError> {
        if token.trim().is_empty() {
            return Err(NotifyError::NotConfigured("PUSHOVER_TOKEN"));
        }
        if user.trim().is_empty() {
            return Err(NotifyError::NotConfigured("PUSHOVER_USER"));
        }
        Ok(Self {
            client: http_client(timeout)?,
            token: token.to_string(),
            user: user.to_string(),
        })
    }
}

impl PushChannel for Pushover {
    fn send(&self, message: &PushMessage) -> Result<(), NotifyError> {
        let priority = message.priority.to_string();
        let form = [
            ("token", self.token.as_str()),
            ("user", self.user.as_str()),
            ("title", message.title.as_str()),
            ("message", message.message.as_str()),
            ("priority", priority.as_str()),
        ];

        let response = self
            .client
            .post(PUSHOVER_URL)
            .form(&form)
            .send()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        check_response(response)
    }
}
