//! Ignition edge detection.
//!
//! The vehicle tracker publishes a heartbeat every few seconds while the
//! ignition is on and goes silent when it is off. This module turns that
//! stream into discrete "ignition just turned on" events, one per drive.
//!
//! # Clocks
//! Deadlines are kept on the receiving host's clock only: `observe` uses each
//! signal's `received_at` and the caller passes `now` to `expire`. The
//! tracker's own `timestamp` may lag or run ahead and is only reported.
//! The detector never reads the wall clock itself, so the state machine is
//! fully deterministic in tests.

use crate::logging::{self, Component};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::fmt;
use std::io::BufRead;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;

/// Silence after which the ignition is considered off.
pub const DEFAULT_TIMEOUT_SECS: i64 = 300;
/// Longest accepted timeout (one day).
pub const MAX_TIMEOUT_SECS: i64 = 86_400;

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// One parsed presence signal.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceSignal {
    pub device_id: String,
    pub ignition_on: bool,
    /// Tracker clock, or the receipt time when the payload carries none.
    pub timestamp: DateTime<Utc>,
    /// Host clock at receipt.
    pub received_at: DateTime<Utc>,
}

/// A signal that could not be parsed. Dropped without any state effect.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalError {
    Json(String),
    MissingField(&'static str),
    BadTimestamp(String),
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::Json(msg) => write!(f, "Malformed signal JSON: {}", msg),
            SignalError::MissingField(field) => write!(f, "Malformed signal: missing '{}'", field),
            SignalError::BadTimestamp(ts) => write!(f, "Malformed signal timestamp: {}", ts),
        }
    }
}

impl std::error::Error for SignalError {}

/// Wire shape published by the tracker. `location` and any other fields are
/// ignored.
#[derive(Debug, Deserialize)]
struct RawSignal {
    #[serde(rename = "Ignition On", alias = "ignition_on")]
    ignition_on: Option<bool>,
    device_id: Option<String>,
    timestamp: Option<String>,
}

/// Parses one JSON payload. `received_at` stands in for a missing timestamp.
pub fn parse_signal(payload: &str, received_at: DateTime<Utc>) -> Result<PresenceSignal, SignalError> {
    let raw: RawSignal =
        serde_json::from_str(payload.trim()).map_err(|e| SignalError::Json(e.to_string()))?;

    let ignition_on = raw.ignition_on.ok_or(SignalError::MissingField("Ignition On"))?;
    let timestamp = match raw.timestamp {
        Some(ts) => DateTime::parse_from_rfc3339(&ts)
            .map_err(|_| SignalError::BadTimestamp(ts.clone()))?
            .with_timezone(&Utc),
        None => received_at,
    };

    Ok(PresenceSignal {
        device_id: raw.device_id.unwrap_or_else(|| "unknown".to_string()),
        ignition_on,
        timestamp,
        received_at,
    })
}

// ---------------------------------------------------------------------------
// Edge detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnitionState {
    Idle,
    Active { last_signal: DateTime<Utc> },
}

/// Emitted once per Idle → Active transition.
#[derive(Debug, Clone, PartialEq)]
pub struct IgnitionEvent {
    pub device_id: String,
    /// The tracker's timestamp of the first heartbeat.
    pub at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IgnitionDetector {
    timeout: Duration,
    state: IgnitionState,
}

impl IgnitionDetector {
    pub fn new(timeout_secs: i64) -> Self {
        Self {
            timeout: Duration::seconds(timeout_secs.clamp(0, MAX_TIMEOUT_SECS)),
            state: IgnitionState::Idle,
        }
    }

    pub fn state(&self) -> IgnitionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, IgnitionState::Active { .. })
    }

    /// When the ignition will be considered off if no further heartbeat
    /// arrives. `None` while idle.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match self.state {
            IgnitionState::Idle => None,
            IgnitionState::Active { last_signal } => Some(last_signal + self.timeout),
        }
    }

    /// Feeds one signal. Returns an event on the Idle → Active edge.
    ///
    /// Signals with the flag off are not heartbeats: they neither arm the
    /// detector nor extend the deadline. A heartbeat arriving more than
    /// `timeout` after the previous one counts as a new drive even if
    /// `expire` was never called in between.
    pub fn observe(&mut self, signal: &PresenceSignal) -> Option<IgnitionEvent> {
        if !signal.ignition_on {
            return None;
        }

        self.expire(signal.received_at);

        match self.state {
            IgnitionState::Idle => {
                self.state = IgnitionState::Active {
                    last_signal: signal.received_at,
                };
                Some(IgnitionEvent {
                    device_id: signal.device_id.clone(),
                    at: signal.timestamp,
                    received_at: signal.received_at,
                })
            }
            IgnitionState::Active { last_signal } => {
                self.state = IgnitionState::Active {
                    last_signal: last_signal.max(signal.received_at),
                };
                None
            }
        }
    }

    /// Deadline check: Active → Idle once more than `timeout` has passed since
    /// the last heartbeat. Emits nothing; returns whether the state changed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        if let IgnitionState::Active { last_signal } = self.state {
            if now - last_signal > self.timeout {
                self.state = IgnitionState::Idle;
                return true;
            }
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Signal source loop
// ---------------------------------------------------------------------------

/// Reads newline-delimited JSON signals from `reader` until it closes,
/// calling `on_ignition` for every edge.
///
/// Lines are read on a background thread and stamped with their receipt time;
/// this thread runs the deadline check at least every `tick`. `on_ignition`
/// runs on this thread, so a slow handler delays (never overlaps) the next one.
pub fn run_signal_loop<R, F>(
    reader: R,
    detector: &mut IgnitionDetector,
    tick: std::time::Duration,
    mut on_ignition: F,
) where
    R: BufRead + Send + 'static,
    F: FnMut(&IgnitionEvent),
{
    let (tx, rx) = mpsc::channel::<(String, DateTime<Utc>)>();

    thread::spawn(move || {
        for line in reader.lines() {
            match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => {
                    if tx.send((line, Utc::now())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    logging::error(Component::Ignition, None, &format!("Signal source read failed: {}", e));
                    break;
                }
            }
        }
    });

    loop {
        match rx.recv_timeout(tick) {
            Ok((line, received_at)) => match parse_signal(&line, received_at) {
                Ok(signal) => {
                    if let Some(event) = detector.observe(&signal) {
                        logging::info(
                            Component::Ignition,
                            Some(&event.device_id),
                            &format!("IGNITION: ON at {}", event.at.format("%Y-%m-%d %H:%M:%S UTC")),
                        );
                        on_ignition(&event);
                    }
                }
                Err(e) => logging::warn(Component::Ignition, None, &format!("{} (dropped)", e)),
            },
            Err(RecvTimeoutError::Timeout) => {
                if detector.expire(Utc::now()) {
                    logging::info(Component::Ignition, None, "IGNITION: OFF (timeout)");
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                logging::info(Component::Ignition, None, "Signal source closed");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::io::{BufReader, Read};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 7, 30, 0).unwrap()
    }

    fn heartbeat(offset_secs: i64) -> PresenceSignal {
        let at = t0() + Duration::seconds(offset_secs);
        PresenceSignal {
            device_id: "tracker-1".to_string(),
            ignition_on: true,
            timestamp: at,
            received_at: at,
        }
    }

    /// Heartbeat whose tracker timestamp differs from its receipt time.
    fn skewed(tracker_offset_secs: i64, received_offset_secs: i64) -> PresenceSignal {
        PresenceSignal {
            timestamp: t0() + Duration::seconds(tracker_offset_secs),
            ..heartbeat(received_offset_secs)
        }
    }

    /// Yields one line per read after sleeping for its delay, like a socket
    /// that delivers heartbeats over time.
    struct PacedLines {
        pending: VecDeque<(std::time::Duration, Vec<u8>)>,
        current: Vec<u8>,
    }

    impl PacedLines {
        fn new(lines: &[(u64, &str)]) -> BufReader<Self> {
            BufReader::new(Self {
                pending: lines
                    .iter()
                    .map(|(ms, line)| {
                        (std::time::Duration::from_millis(*ms), format!("{}\n", line).into_bytes())
                    })
                    .collect(),
                current: Vec::new(),
            })
        }
    }

    impl Read for PacedLines {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.current.is_empty() {
                match self.pending.pop_front() {
                    Some((delay, line)) => {
                        thread::sleep(delay);
                        self.current = line;
                    }
                    None => return Ok(0),
                }
            }
            let n = buf.len().min(self.current.len());
            buf[..n].copy_from_slice(&self.current[..n]);
            self.current.drain(..n);
            Ok(n)
        }
    }

    fn count_events(offsets: &[i64], timeout: i64) -> usize {
        let mut detector = IgnitionDetector::new(timeout);
        offsets
            .iter()
            .filter_map(|&o| detector.observe(&heartbeat(o)))
            .count()
    }

    // --- Edges --------------------------------------------------------------

    #[test]
    fn test_heartbeat_inside_timeout_fires_once() {
        assert_eq!(count_events(&[0, 100], 300), 1);
    }

    #[test]
    fn test_gap_beyond_timeout_fires_twice() {
        assert_eq!(count_events(&[0, 400], 300), 2);
    }

    #[test]
    fn test_first_event_is_at_first_signal() {
        let mut detector = IgnitionDetector::new(300);
        let event = detector.observe(&heartbeat(0)).expect("first signal arms");
        assert_eq!(event.at, t0());
        assert_eq!(event.device_id, "tracker-1");
    }

    #[test]
    fn test_steady_heartbeats_keep_single_drive() {
        let offsets: Vec<i64> = (0..60).map(|i| i * 250).collect();
        assert_eq!(count_events(&offsets, 300), 1, "each gap is 250 s < 300 s");
    }

    #[test]
    fn test_gap_exactly_at_timeout_is_same_drive() {
        assert_eq!(count_events(&[0, 300], 300), 1);
        assert_eq!(count_events(&[0, 301], 300), 2);
    }

    // --- Deadline -----------------------------------------------------------

    #[test]
    fn test_expire_goes_idle_silently_and_next_signal_rearms() {
        let mut detector = IgnitionDetector::new(300);
        detector.observe(&heartbeat(0));
        assert_eq!(detector.deadline(), Some(t0() + Duration::seconds(300)));

        assert!(!detector.expire(t0() + Duration::seconds(200)));
        assert!(detector.is_active());

        assert!(detector.expire(t0() + Duration::seconds(301)));
        assert_eq!(detector.state(), IgnitionState::Idle);
        assert_eq!(detector.deadline(), None);

        assert!(detector.observe(&heartbeat(302)).is_some(), "re-arm emits");
    }

    #[test]
    fn test_heartbeat_extends_deadline() {
        let mut detector = IgnitionDetector::new(300);
        detector.observe(&heartbeat(0));
        detector.observe(&heartbeat(250));
        assert!(!detector.expire(t0() + Duration::seconds(500)));
        assert_eq!(detector.deadline(), Some(t0() + Duration::seconds(550)));
    }

    #[test]
    fn test_off_flag_neither_arms_nor_extends() {
        let mut detector = IgnitionDetector::new(300);
        let mut off = heartbeat(0);
        off.ignition_on = false;
        assert!(detector.observe(&off).is_none());
        assert!(!detector.is_active());

        detector.observe(&heartbeat(10));
        let mut late_off = heartbeat(200);
        late_off.ignition_on = false;
        detector.observe(&late_off);
        assert_eq!(detector.deadline(), Some(t0() + Duration::seconds(310)));
    }

    #[test]
    fn test_out_of_order_heartbeat_does_not_shorten_deadline() {
        let mut detector = IgnitionDetector::new(300);
        detector.observe(&heartbeat(0));
        detector.observe(&heartbeat(200));
        detector.observe(&heartbeat(50));
        assert_eq!(detector.deadline(), Some(t0() + Duration::seconds(500)));
    }

    #[test]
    fn test_deadline_follows_receipt_clock_not_tracker_clock() {
        // Tracker clock an hour behind and drifting: payload gaps look huge,
        // receipt gaps are 60 s.
        let mut detector = IgnitionDetector::new(300);
        let first = detector.observe(&skewed(-3600, 0)).expect("first heartbeat arms");
        assert_eq!(first.at, t0() - Duration::hours(1));
        assert_eq!(first.received_at, t0());

        assert!(detector.observe(&skewed(-3000, 60)).is_none());
        assert!(detector.observe(&skewed(-7200, 120)).is_none());
        assert_eq!(detector.deadline(), Some(t0() + Duration::seconds(420)));
    }

    #[test]
    fn test_tracker_clock_ahead_does_not_hold_drive_open() {
        let mut detector = IgnitionDetector::new(300);
        detector.observe(&skewed(86_400, 0));
        assert!(detector.expire(t0() + Duration::seconds(301)));
        assert!(detector.observe(&skewed(86_400, 302)).is_some());
    }

    #[test]
    fn test_oversized_timeout_is_clamped() {
        let mut detector = IgnitionDetector::new(i64::MAX);
        detector.observe(&heartbeat(0));
        assert_eq!(
            detector.deadline(),
            Some(t0() + Duration::seconds(MAX_TIMEOUT_SECS))
        );

        let mut negative = IgnitionDetector::new(-5);
        negative.observe(&heartbeat(0));
        assert_eq!(negative.deadline(), Some(t0()));
    }

    // --- Parsing ------------------------------------------------------------

    #[test]
    fn test_parse_tracker_payload() {
        let payload = r#"{"Ignition On": true, "device_id": "tracker-1",
                          "timestamp": "2024-05-01T09:30:00+02:00",
                          "location": {"lat": -33.9, "lng": 18.4}}"#;
        let received = t0() + Duration::seconds(7);
        let signal = parse_signal(payload, received).expect("valid payload");
        assert!(signal.ignition_on);
        assert_eq!(signal.device_id, "tracker-1");
        assert_eq!(signal.timestamp, t0(), "09:30+02:00 is 07:30 UTC");
        assert_eq!(signal.received_at, received);
    }

    #[test]
    fn test_parse_uses_receipt_time_and_alias() {
        let signal = parse_signal(r#"{"ignition_on": false}"#, t0()).expect("valid payload");
        assert!(!signal.ignition_on);
        assert_eq!(signal.timestamp, t0());
        assert_eq!(signal.received_at, t0());
        assert_eq!(signal.device_id, "unknown");
    }

    #[test]
    fn test_malformed_signals_rejected() {
        assert!(matches!(parse_signal("not json", t0()), Err(SignalError::Json(_))));
        assert_eq!(
            parse_signal(r#"{"device_id": "x"}"#, t0()),
            Err(SignalError::MissingField("Ignition On"))
        );
        assert!(matches!(
            parse_signal(r#"{"Ignition On": true, "timestamp": "yesterday"}"#, t0()),
            Err(SignalError::BadTimestamp(_))
        ));
    }

    // --- Loop ---------------------------------------------------------------

    #[test]
    fn test_signal_loop_ignores_stale_tracker_timestamps() {
        // Payload timestamps ten minutes apart, delivered within a second.
        let reader = PacedLines::new(&[
            (0, r#"{"Ignition On": true, "timestamp": "2020-01-01T00:00:00Z"}"#),
            (50, "garbage"),
            (50, r#"{"Ignition On": true, "timestamp": "2020-01-01T00:10:00Z"}"#),
            (100, ""),
            (0, r#"{"Ignition On": true, "timestamp": "2020-01-01T00:20:00Z"}"#),
            (100, r#"{"Ignition On": true, "timestamp": "2020-01-01T00:30:00Z"}"#),
        ]);

        let mut detector = IgnitionDetector::new(300);
        let mut events = Vec::new();
        run_signal_loop(reader, &mut detector, std::time::Duration::from_millis(20), |e| {
            events.push(e.at)
        });

        assert_eq!(events, vec![Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()]);
    }

    #[test]
    fn test_signal_loop_fires_again_after_receipt_gap() {
        // Identical payload timestamps; only the real pause separates drives.
        let beat = r#"{"Ignition On": true, "device_id": "tracker-1", "timestamp": "2024-05-01T07:30:00Z"}"#;
        let reader = PacedLines::new(&[(0, beat), (100, beat), (1500, beat), (100, beat)]);

        let mut detector = IgnitionDetector::new(1);
        let mut events = Vec::new();
        run_signal_loop(reader, &mut detector, std::time::Duration::from_millis(50), |e| {
            events.push(e.device_id.clone())
        });

        assert_eq!(events, vec!["tracker-1".to_string(), "tracker-1".to_string()]);
    }
}
