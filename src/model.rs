//! Core data types for the route traffic monitoring service.
//!
//! This module defines the shared domain model imported by all other modules:
//! routes and their persisted traffic state, threshold brackets, directions
//! responses, evaluation results, and the error enums that cross module
//! boundaries. It contains no I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of delay observations kept per route. Oldest entries are
/// dropped first.
pub const HISTORY_LIMIT: usize = 20;

// ---------------------------------------------------------------------------
// Route classification
// ---------------------------------------------------------------------------

/// Per-route notification priority.
///
/// Controls push/LLM eligibility only. Chat alerts ignore priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoutePriority {
    High,
    #[default]
    Normal,
}

impl RoutePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutePriority::High => "High",
            RoutePriority::Normal => "Normal",
        }
    }

    /// Accepts "High"/"Normal" in any case, plus the single-letter "H"/"N"
    /// shorthand used at the CLI prompt.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" | "h" => Some(RoutePriority::High),
            "normal" | "n" => Some(RoutePriority::Normal),
            _ => None,
        }
    }
}

impl fmt::Display for RoutePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Traffic state of a route as of its most recent completed evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrafficState {
    #[default]
    Normal,
    Heavy,
}

impl TrafficState {
    pub fn from_heavy(is_heavy: bool) -> Self {
        if is_heavy {
            TrafficState::Heavy
        } else {
            TrafficState::Normal
        }
    }

    pub fn is_heavy(&self) -> bool {
        matches!(self, TrafficState::Heavy)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficState::Normal => "Normal",
            TrafficState::Heavy => "Heavy",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Some(TrafficState::Normal),
            "heavy" => Some(TrafficState::Heavy),
            _ => None,
        }
    }
}

impl fmt::Display for TrafficState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Route records
// ---------------------------------------------------------------------------

/// A WGS84 position in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// Renders as `lat,lng`, the form the Directions and Static Maps APIs expect.
impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.latitude, self.longitude)
    }
}

/// A monitored route as persisted by the route store.
///
/// Identity (`id`, `name`, `start`, `end`) never changes after creation.
/// Evaluation mutates only `history`, `last_state`, `revision` and
/// `last_checked`; management mutates only `priority`.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub id: i64,
    pub name: String,
    pub start: Coordinate,
    pub end: Coordinate,
    pub priority: RoutePriority,
    pub last_state: TrafficState,
    /// Most recent delay observations in seconds, oldest first.
    /// Never longer than `HISTORY_LIMIT`.
    pub history: Vec<f64>,
    /// Bumped on every committed evaluation. Used to detect lost updates.
    pub revision: u64,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Route {
    /// Mean of the recorded delays, or `None` when there is no history yet.
    pub fn mean_history_delay(&self) -> Option<f64> {
        if self.history.is_empty() {
            None
        } else {
            Some(self.history.iter().sum::<f64>() / self.history.len() as f64)
        }
    }
}

/// Input for creating a route. Coordinates are already normalised to
/// decimal degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRoute {
    pub name: String,
    pub start: Coordinate,
    pub end: Coordinate,
    pub priority: RoutePriority,
}

// ---------------------------------------------------------------------------
// Threshold types
// ---------------------------------------------------------------------------

/// Detection parameters for one distance bracket `[min_km, max_km)`.
///
/// A route is heavy at the route level when its delay exceeds both
/// `baseline * route_factor` and `route_delay_threshold_sec`. A single leg is
/// heavy when its delay exceeds both `segment_delay_threshold_sec` and
/// `segment_factor` times the route's mean leg delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdBracket {
    pub min_km: f64,
    pub max_km: f64,
    pub route_factor: f64,
    pub segment_factor: f64,
    pub route_delay_threshold_sec: f64,
    pub segment_delay_threshold_sec: f64,
}

impl ThresholdBracket {
    pub fn contains(&self, distance_km: f64) -> bool {
        distance_km >= self.min_km && distance_km < self.max_km
    }
}

// ---------------------------------------------------------------------------
// Directions types
// ---------------------------------------------------------------------------

/// One step of the chosen route, with its own free-flow and live durations.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionsLeg {
    /// Plain-text driving instruction (HTML already stripped).
    pub instruction: String,
    pub duration_sec: f64,
    pub duration_in_traffic_sec: f64,
}

impl DirectionsLeg {
    /// Live minus free-flow duration, floored at zero.
    pub fn delay_sec(&self) -> f64 {
        (self.duration_in_traffic_sec - self.duration_sec).max(0.0)
    }
}

/// The fastest traffic-aware route returned by a directions lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionsResponse {
    pub summary: String,
    pub start_address: Option<String>,
    pub end_address: Option<String>,
    pub distance_m: f64,
    pub duration_sec: f64,
    pub duration_in_traffic_sec: f64,
    pub legs: Vec<DirectionsLeg>,
    /// Encoded overview polyline, used for route map images.
    pub overview_polyline: Option<String>,
}

impl DirectionsResponse {
    pub fn distance_km(&self) -> f64 {
        self.distance_m / 1000.0
    }
}

// ---------------------------------------------------------------------------
// Evaluation results
// ---------------------------------------------------------------------------

/// State change of a route between two consecutive evaluations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    NoChangeNormal,
    NoChangeHeavy,
    BecameHeavy,
    BecameNormal,
}

impl Transition {
    pub fn between(previous: TrafficState, is_heavy: bool) -> Self {
        match (previous, is_heavy) {
            (TrafficState::Normal, false) => Transition::NoChangeNormal,
            (TrafficState::Heavy, true) => Transition::NoChangeHeavy,
            (TrafficState::Normal, true) => Transition::BecameHeavy,
            (TrafficState::Heavy, false) => Transition::BecameNormal,
        }
    }

    pub fn is_change(&self) -> bool {
        matches!(self, Transition::BecameHeavy | Transition::BecameNormal)
    }
}

/// A leg whose delay crossed the segment thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct HeavySegment {
    pub instruction: String,
    pub free_flow_sec: f64,
    pub live_sec: f64,
    pub delay_sec: f64,
    /// live / free-flow, rounded to two decimals. Zero when free-flow is zero.
    pub ratio: f64,
}

/// Outcome of evaluating one route against one directions response.
/// Ephemeral: only `history` and the new state are persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub current_delay_sec: f64,
    pub baseline_delay_sec: f64,
    pub is_heavy: bool,
    pub route_level_heavy: bool,
    pub transition: Transition,
    pub distance_km: f64,
    pub free_flow_sec: f64,
    pub live_sec: f64,
    pub heavy_segments: Vec<HeavySegment>,
}

impl EvaluationResult {
    pub fn new_state(&self) -> TrafficState {
        TrafficState::from_heavy(self.is_heavy)
    }
}

/// A route paired with its evaluation, in the order routes were listed.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteVerdict {
    pub route: Route,
    pub result: EvaluationResult,
}

/// Whole minutes, rounded to nearest, as shown in alerts and summaries.
pub fn seconds_to_minutes(seconds: f64) -> i64 {
    (seconds / 60.0).round() as i64
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors from a directions lookup. Every variant skips the route for the
/// current cycle without touching its persisted state.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectionsError {
    /// The response had no usable traffic-aware route, or was not shaped
    /// like a directions response at all.
    NoRouteFound(String),
    /// Non-2xx HTTP response.
    HttpError(u16),
    /// The API answered with an explicit error message.
    ApiError(String),
    /// The request never produced a response (DNS, TLS, timeout).
    Transport(String),
    /// No API key configured.
    NotConfigured,
}

impl fmt::Display for DirectionsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DirectionsError::NoRouteFound(msg) => write!(f, "No route found: {}", msg),
            DirectionsError::HttpError(code) => write!(f, "HTTP error: {}", code),
            DirectionsError::ApiError(msg) => write!(f, "Directions API error: {}", msg),
            DirectionsError::Transport(msg) => write!(f, "Transport error: {}", msg),
            DirectionsError::NotConfigured => write!(f, "GOOGLE_MAPS_API_KEY is not set"),
        }
    }
}

impl std::error::Error for DirectionsError {}

/// Rejected coordinate input at the management boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinateError {
    InvalidFormat(String),
    OutOfRange { value: f64, limit: f64 },
    InvalidPair(String),
}

impl fmt::Display for CoordinateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinateError::InvalidFormat(s) => write!(f, "Invalid coordinate format: {}", s),
            CoordinateError::OutOfRange { value, limit } => {
                write!(f, "Coordinate {} outside of ±{}", value, limit)
            }
            CoordinateError::InvalidPair(s) => write!(f, "Invalid coordinate pair: {}", s),
        }
    }
}

impl std::error::Error for CoordinateError {}

/// Errors raised by route store implementations.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    NotFound(String),
    DuplicateName(String),
    Database(String),
    /// A persisted record could not be decoded (bad JSON history, unknown
    /// enum text).
    Corrupt(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "Not found: {}", what),
            StoreError::DuplicateName(name) => write!(f, "Route '{}' already exists", name),
            StoreError::Database(msg) => write!(f, "Database error: {}", msg),
            StoreError::Corrupt(msg) => write!(f, "Corrupt record: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Rejected threshold table edits.
#[derive(Debug, Clone, PartialEq)]
pub enum ThresholdError {
    Empty,
    InvalidRange { index: usize, min_km: f64, max_km: f64 },
    Overlap { index: usize },
    NegativeParameter { index: usize, field: &'static str },
    UnknownBracket(usize),
}

impl fmt::Display for ThresholdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdError::Empty => write!(f, "Threshold table has no brackets"),
            ThresholdError::InvalidRange { index, min_km, max_km } => write!(
                f,
                "Bracket {} has invalid range [{}, {})",
                index, min_km, max_km
            ),
            ThresholdError::Overlap { index } => {
                write!(f, "Bracket {} overlaps or precedes the previous bracket", index)
            }
            ThresholdError::NegativeParameter { index, field } => {
                write!(f, "Bracket {} has a negative or non-finite {}", index, field)
            }
            ThresholdError::UnknownBracket(index) => write!(f, "No bracket at index {}", index),
        }
    }
}

impl std::error::Error for ThresholdError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn route_with_history(history: Vec<f64>) -> Route {
        Route {
            id: 1,
            name: "Highway-101".to_string(),
            start: Coordinate::new(-33.92, 18.42),
            end: Coordinate::new(-33.80, 18.50),
            priority: RoutePriority::High,
            last_state: TrafficState::Normal,
            history,
            revision: 0,
            last_checked: None,
        }
    }

    #[test]
    fn test_transition_table() {
        use TrafficState::*;
        assert_eq!(Transition::between(Normal, false), Transition::NoChangeNormal);
        assert_eq!(Transition::between(Normal, true), Transition::BecameHeavy);
        assert_eq!(Transition::between(Heavy, true), Transition::NoChangeHeavy);
        assert_eq!(Transition::between(Heavy, false), Transition::BecameNormal);
    }

    #[test]
    fn test_only_flips_count_as_change() {
        assert!(Transition::BecameHeavy.is_change());
        assert!(Transition::BecameNormal.is_change());
        assert!(!Transition::NoChangeHeavy.is_change());
        assert!(!Transition::NoChangeNormal.is_change());
    }

    #[test]
    fn test_mean_history_delay() {
        assert_eq!(route_with_history(vec![]).mean_history_delay(), None);
        assert_eq!(
            route_with_history(vec![100.0, 110.0, 105.0]).mean_history_delay(),
            Some(105.0)
        );
    }

    #[test]
    fn test_priority_parse_accepts_cli_shorthand() {
        assert_eq!(RoutePriority::parse("H"), Some(RoutePriority::High));
        assert_eq!(RoutePriority::parse(" normal "), Some(RoutePriority::Normal));
        assert_eq!(RoutePriority::parse("urgent"), None);
    }

    #[test]
    fn test_leg_delay_is_floored_at_zero() {
        let leg = DirectionsLeg {
            instruction: "Head north".to_string(),
            duration_sec: 120.0,
            duration_in_traffic_sec: 90.0,
        };
        assert_eq!(leg.delay_sec(), 0.0);
    }

    #[test]
    fn test_coordinate_display_matches_api_format() {
        assert_eq!(Coordinate::new(-33.5, 18.25).to_string(), "-33.5,18.25");
    }

    #[test]
    fn test_seconds_to_minutes_rounds() {
        assert_eq!(seconds_to_minutes(301.0), 5);
        assert_eq!(seconds_to_minutes(89.0), 1);
        assert_eq!(seconds_to_minutes(90.0), 2);
    }
}
