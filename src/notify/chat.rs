/// Chat alerts.
///
/// One entry per route whose state flipped this pass. The Discord webhook
/// renders each entry as an embed: green when the route is back to normal,
/// red while it is heavy. Operational notices (the LLM balance running low)
/// go out on the same webhook as a single embed.

use super::{NotifyError, check_response, http_client};
use crate::model::{HeavySegment, RouteVerdict, TrafficState, seconds_to_minutes};
use crate::summary::route_sentence;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::time::Duration;

pub const SEGMENT_DISPLAY_LIMIT: usize = 4;
/// Discord accepts at most this many embeds per message.
const EMBEDS_PER_MESSAGE: usize = 10;
const COLOR_NORMAL: u32 = 0x00FF00;
const COLOR_HEAVY: u32 = 0xFF0000;
const COLOR_WARNING: u32 = 0xFFA500;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatEntry {
    pub route_name: String,
    pub state: TrafficState,
    pub distance_km: f64,
    pub live_minutes: i64,
    pub normal_minutes: i64,
    pub delay_minutes: i64,
    pub segments: String,
    pub sentence: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatAlert {
    pub sent_at: DateTime<Utc>,
    pub entries: Vec<ChatEntry>,
}

/// Free-form operational message, outside the per-route alert flow.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatNotice {
    pub title: String,
    pub body: String,
    pub critical: bool,
    pub sent_at: DateTime<Utc>,
}

pub trait ChatChannel: Send + Sync {
    fn send(&self, alert: &ChatAlert) -> Result<(), NotifyError>;
    fn send_notice(&self, notice: &ChatNotice) -> Result<(), NotifyError>;
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

/// One line per heavy segment, capped at `limit`, or "None".
pub fn summarize_segments(segments: &[HeavySegment], limit: usize) -> String {
    if segments.is_empty() {
        return "None".to_string();
    }

    let mut lines: Vec<String> = segments
        .iter()
        .take(limit)
        .map(|s| {
            format!(
                "• {} (+{} min, {}x)",
                s.instruction,
                seconds_to_minutes(s.delay_sec),
                s.ratio
            )
        })
        .collect();
    if segments.len() > limit {
        lines.push(format!("...and {} more segments", segments.len() - limit));
    }
    lines.join("\n")
}

pub fn chat_entry(verdict: &RouteVerdict) -> ChatEntry {
    let result = &verdict.result;
    ChatEntry {
        route_name: verdict.route.name.clone(),
        state: result.new_state(),
        distance_km: result.distance_km,
        live_minutes: seconds_to_minutes(result.live_sec),
        normal_minutes: seconds_to_minutes(result.free_flow_sec),
        delay_minutes: seconds_to_minutes(result.current_delay_sec),
        segments: summarize_segments(&result.heavy_segments, SEGMENT_DISPLAY_LIMIT),
        sentence: route_sentence(verdict).unwrap_or_default(),
    }
}

pub fn build_alert(verdicts: &[&RouteVerdict], sent_at: DateTime<Utc>) -> ChatAlert {
    ChatAlert {
        sent_at,
        entries: verdicts.iter().map(|v| chat_entry(v)).collect(),
    }
}

pub fn embed_json(entry: &ChatEntry, sent_at: DateTime<Utc>) -> Value {
    let color = match entry.state {
        TrafficState::Normal => COLOR_NORMAL,
        TrafficState::Heavy => COLOR_HEAVY,
    };
    json!({
        "title": "Traffic Status",
        "description": format!("**Route:** {}", entry.route_name),
        "color": color,
        "timestamp": sent_at.to_rfc3339(),
        "fields": [
            {"name": "State", "value": entry.state.as_str(), "inline": true},
            {"name": "Distance", "value": format!("{:.2} km", entry.distance_km), "inline": true},
            {"name": "Live Time", "value": format!("{} min", entry.live_minutes), "inline": true},
            {"name": "Normal Time", "value": format!("{} min", entry.normal_minutes), "inline": true},
            {"name": "Delay", "value": format!("{} min", entry.delay_minutes), "inline": true},
            {"name": "Heavy Segments", "value": entry.segments, "inline": false},
            {"name": "Summary", "value": entry.sentence, "inline": false}
        ]
    })
}

pub fn notice_json(notice: &ChatNotice) -> Value {
    json!({
        "title": notice.title,
        "description": notice.body,
        "color": if notice.critical { COLOR_HEAVY } else { COLOR_WARNING },
        "timestamp": notice.sent_at.to_rfc3339(),
    })
}

// ---------------------------------------------------------------------------
// Discord
// ---------------------------------------------------------------------------

pub struct DiscordWebhook {
    client: reqwest::blocking::Client,
    url: String,
}

impl DiscordWebhook {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, NotifyError> {
        if url.trim().is_empty() {
            return Err(NotifyError::NotConfigured("DISCORD_WEBHOOK_URL"));
        }
        Ok(Self {
            client: http_client(timeout)?,
            url: url.to_string(),
        })
    }
}

impl DiscordWebhook {
    fn post_embeds(&self, embeds: &[Value]) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "embeds": embeds }))
            .send()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        check_response(response)
    }
}

impl ChatChannel for DiscordWebhook {
    fn send(&self, alert: &ChatAlert) -> Result<(), NotifyError> {
        let embeds: Vec<Value> = alert
            .entries
            .iter()
            .map(|e| embed_json(e, alert.sent_at))
            .collect();

        for chunk in embeds.chunks(EMBEDS_PER_MESSAGE) {
            self.post_embeds(chunk)?;
        }
        Ok(())
    }

    fn send_notice(&self, notice: &ChatNotice) -> Result<(), NotifyError> {
        self.post_embeds(&[notice_json(notice)])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
