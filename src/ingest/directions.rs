/// Google Directions API Client
///
/// Fetches traffic-aware driving directions between a route's endpoints and
/// reduces the response to the fastest alternative's totals and steps.
///
/// API Documentation: https://developers.google.com/maps/documentation/directions/get-directions

use crate::model::{Coordinate, DirectionsError, DirectionsLeg, DirectionsResponse};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

const DIRECTIONS_URL: &str = "https://maps.googleapis.com/maps/api/directions/json";

/// Source of directions for a pair of coordinates.
pub trait DirectionsProvider: Send + Sync {
    fn directions(&self, origin: Coordinate, destination: Coordinate) -> Result<DirectionsResponse, DirectionsError>;
}

// ============================================================================
// API Response Structures
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    routes: Vec<ApiRoute>,
}

#[derive(Debug, Deserialize)]
struct ApiRoute {
    #[serde(default)]
    summary: String,
    legs: Vec<ApiLeg>,
    #[serde(default)]
    overview_polyline: Option<ApiPolyline>,
}

#[derive(Debug, Deserialize)]
struct ApiPolyline {
    points: String,
}

#[derive(Debug, Deserialize)]
struct ApiLeg {
    distance: ApiValue,
    duration: ApiValue,
    #[serde(default)]
    duration_in_traffic: Option<ApiValue>,
    #[serde(default)]
    start_address: Option<String>,
    #[serde(default)]
    end_address: Option<String>,
    #[serde(default)]
    steps: Vec<ApiStep>,
}

#[derive(Debug, Deserialize)]
struct ApiStep {
    #[serde(default)]
    html_instructions: String,
    duration: ApiValue,
    #[serde(default)]
    duration_in_traffic: Option<ApiValue>,
}

/// `{"text": "12 mins", "value": 720}`; only the value is used.
#[derive(Debug, Deserialize)]
struct ApiValue {
    value: f64,
}

// ============================================================================
// Request
// ============================================================================

/// Builds the request URL. `departure_time=now` is what makes Google return
/// `duration_in_traffic`.
pub fn build_directions_url(
    api_key: &str,
    origin: Coordinate,
    destination: Coordinate,
) -> Result<Url, DirectionsError> {
    Url::parse_with_params(
        DIRECTIONS_URL,
        &[
            ("origin", origin.to_string()),
            ("destination", destination.to_string()),
            ("mode", "driving".to_string()),
            ("departure_time", "now".to_string()),
            ("alternatives", "true".to_string()),
            ("key", api_key.to_string()),
        ],
    )
    .map_err(|e| DirectionsError::Transport(format!("bad request URL: {}", e)))
}

pub struct GoogleDirections {
    client: reqwest::blocking::Client,
    api_key: String,
}

impl GoogleDirections {
    pub fn new(api_key: &str, timeout: Duration) -> Result<Self, DirectionsError> {
        if api_key.trim().is_empty() {
            return Err(DirectionsError::NotConfigured);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DirectionsError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.to_string(),
        })
    }
}

impl DirectionsProvider for GoogleDirections {
    fn directions(&self, origin: Coordinate, destination: Coordinate) -> Result<DirectionsResponse, DirectionsError> {
        let url = build_directions_url(&self.api_key, origin, destination)?;

        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .map_err(|e| DirectionsError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DirectionsError::HttpError(response.status().as_u16()));
        }

        let body = response
            .text()
            .map_err(|e| DirectionsError::Transport(e.to_string()))?;
        parse_directions_response(&body)
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// Reduces a Directions API JSON body to the fastest traffic-aware route.
///
/// Only alternatives whose first leg carries `duration_in_traffic` are
/// considered. Steps without their own traffic duration are taken at their
/// free-flow duration.
pub fn parse_directions_response(body: &str) -> Result<DirectionsResponse, DirectionsError> {
    let api: ApiResponse = serde_json::from_str(body)
        .map_err(|e| DirectionsError::NoRouteFound(format!("unparseable directions response: {}", e)))?;

    if let Some(message) = api.error_message {
        return Err(DirectionsError::ApiError(format!("{}: {}", api.status, message)));
    }

    let fastest = api
        .routes
        .into_iter()
        .filter_map(|route| {
            let live = route.legs.first()?.duration_in_traffic.as_ref()?.value;
            Some((live, route))
        })
        .min_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, route)| route);

    let route = match fastest {
        Some(route) => route,
        None if api.status == "OK" || api.status == "ZERO_RESULTS" || api.status.is_empty() => {
            return Err(DirectionsError::NoRouteFound(
                "no routes with traffic data between origin and destination".to_string(),
            ));
        }
        None => return Err(DirectionsError::ApiError(api.status)),
    };

    let mut distance_m = 0.0;
    let mut duration_sec = 0.0;
    let mut duration_in_traffic_sec = 0.0;
    let mut legs = Vec::new();

    for leg in &route.legs {
        distance_m += leg.distance.value;
        duration_sec += leg.duration.value;
        duration_in_traffic_sec += leg
            .duration_in_traffic
            .as_ref()
            .map_or(leg.duration.value, |d| d.value);

        legs.extend(leg.steps.iter().map(|step| DirectionsLeg {
            instruction: strip_html(&step.html_instructions),
            duration_sec: step.duration.value,
            duration_in_traffic_sec: step
                .duration_in_traffic
                .as_ref()
                .map_or(step.duration.value, |d| d.value),
        }));
    }

    Ok(DirectionsResponse {
        summary: route.summary,
        start_address: route.legs.first().and_then(|l| l.start_address.clone()),
        end_address: route.legs.last().and_then(|l| l.end_address.clone()),
        distance_m,
        duration_sec,
        duration_in_traffic_sec,
        legs,
        overview_polyline: route.overview_polyline.map(|p| p.points),
    })
}

/// Removes tags and decodes the handful of entities Google emits.
/// Block-level `<div>` boundaries become a single space.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut tag = String::new();

    for c in html.chars() {
        match (in_tag, c) {
            (false, '<') => {
                in_tag = true;
                tag.clear();
            }
            (true, '>') => {
                in_tag = false;
                if tag.trim_start_matches('/').to_ascii_lowercase().starts_with("div") {
                    text.push(' ');
                }
            }
            (true, c) => tag.push(c),
            (false, c) => text.push(c),
        }
    }

    unescape(&text).split_whitespace().collect::<Vec<_>>().join(" ")
}

fn unescape(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

// ============================================================================
// Tests
// ============================================================================
