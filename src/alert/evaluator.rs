//! Heavy-traffic verdicts for a single route.
//!
//! Given a route's persisted history and state plus a fresh directions
//! response, decides whether the route is currently heavy and how that
//! compares to the last completed evaluation. Pure: persisting the returned
//! history and state is the caller's job (see `monitor`).

use crate::alert::thresholds::ThresholdTable;
use crate::model::{
    DirectionsError, DirectionsResponse, EvaluationResult, HISTORY_LIMIT, HeavySegment, Route,
    Transition,
};

/// Evaluates `route` against `directions`.
///
/// Returns the verdict and the route's new history (the current delay
/// appended, truncated to the most recent `HISTORY_LIMIT` entries). Fails with
/// `NoRouteFound` when the response durations are not usable numbers; the
/// caller must then leave the route untouched for this cycle.
pub fn evaluate(
    route: &Route,
    directions: &DirectionsResponse,
    thresholds: &ThresholdTable,
) -> Result<(EvaluationResult, Vec<f64>), DirectionsError> {
    check_shape(directions)?;

    let distance_km = directions.distance_km();
    let bracket = thresholds.bracket_for(distance_km);

    let current_delay_sec =
        (directions.duration_in_traffic_sec - directions.duration_sec).max(0.0);
    let baseline_delay_sec = route.mean_history_delay().unwrap_or(current_delay_sec);

    // Relative and absolute conditions must both hold.
    let route_level_heavy = current_delay_sec > baseline_delay_sec * bracket.route_factor
        && current_delay_sec > bracket.route_delay_threshold_sec;

    let heavy_segments = heavy_segments(
        directions,
        bracket.segment_factor,
        bracket.segment_delay_threshold_sec,
    );

    let is_heavy = route_level_heavy || !heavy_segments.is_empty();
    let transition = Transition::between(route.last_state, is_heavy);

    let result = EvaluationResult {
        current_delay_sec,
        baseline_delay_sec,
        is_heavy,
        route_level_heavy,
        transition,
        distance_km,
        free_flow_sec: directions.duration_sec,
        live_sec: directions.duration_in_traffic_sec,
        heavy_segments,
    };

    Ok((result, push_history(&route.history, current_delay_sec)))
}

/// Legs whose delay exceeds both the absolute segment floor and
/// `segment_factor` times the mean leg delay, in route order.
pub fn heavy_segments(
    directions: &DirectionsResponse,
    segment_factor: f64,
    segment_delay_threshold_sec: f64,
) -> Vec<HeavySegment> {
    if directions.legs.is_empty() {
        return Vec::new();
    }

    let delays: Vec<f64> = directions.legs.iter().map(|leg| leg.delay_sec()).collect();
    let mean_leg_delay = delays.iter().sum::<f64>() / delays.len() as f64;

    directions
        .legs
        .iter()
        .zip(delays)
        .filter(|(_, delay)| {
            *delay > segment_delay_threshold_sec && *delay > mean_leg_delay * segment_factor
        })
        .map(|(leg, delay)| HeavySegment {
            instruction: leg.instruction.clone(),
            free_flow_sec: leg.duration_sec,
            live_sec: leg.duration_in_traffic_sec,
            delay_sec: delay,
            ratio: if leg.duration_sec > 0.0 {
                (leg.duration_in_traffic_sec / leg.duration_sec * 100.0).round() / 100.0
            } else {
                0.0
            },
        })
        .collect()
}

/// Appends `delay_sec` and keeps only the most recent `HISTORY_LIMIT` entries.
pub fn push_history(history: &[f64], delay_sec: f64) -> Vec<f64> {
    let keep_from = (history.len() + 1).saturating_sub(HISTORY_LIMIT);
    let mut updated: Vec<f64> = history.iter().skip(keep_from).copied().collect();
    updated.push(delay_sec);
    updated
}

fn check_shape(directions: &DirectionsResponse) -> Result<(), DirectionsError> {
    let usable = |v: f64| v.is_finite() && v >= 0.0;

    if !usable(directions.duration_sec)
        || !usable(directions.duration_in_traffic_sec)
        || !usable(directions.distance_m)
    {
        return Err(DirectionsError::NoRouteFound(
            "directions response has missing or negative totals".to_string(),
        ));
    }
    if directions
        .legs
        .iter()
        .any(|leg| !usable(leg.duration_sec) || !usable(leg.duration_in_traffic_sec))
    {
        return Err(DirectionsError::NoRouteFound(
            "directions response has a leg with missing or negative durations".to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
