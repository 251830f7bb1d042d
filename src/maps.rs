/// Route map images.
///
/// A PNG per route under the maps directory, rendered once by the Google
/// Static Maps API along the road-following overview polyline and reused
/// afterwards. Map problems are reported to the caller, who logs them; they
/// never block route management.

use crate::ingest::directions::DirectionsProvider;
use crate::model::{Coordinate, DirectionsError, Route};
use reqwest::Url;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const STATIC_MAP_URL: &str = "https://maps.googleapis.com/maps/api/staticmap";
pub const DEFAULT_MAPS_DIR: &str = "maps";

#[derive(Debug)]
pub enum MapError {
    NotConfigured,
    Directions(DirectionsError),
    Http(u16),
    Transport(String),
    Io(std::io::Error),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::NotConfigured => write!(f, "GOOGLE_MAPS_API_KEY is not set"),
            MapError::Directions(e) => write!(f, "Route lookup for map failed: {}", e),
            MapError::Http(code) => write!(f, "Static Maps API failed {}", code),
            MapError::Transport(msg) => write!(f, "Transport error: {}", msg),
            MapError::Io(e) => write!(f, "Map file error: {}", e),
        }
    }
}

impl std::error::Error for MapError {}

impl From<std::io::Error> for MapError {
    fn from(e: std::io::Error) -> Self {
        MapError::Io(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapStatus {
    Cached,
    Missing,
}

impl fmt::Display for MapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapStatus::Cached => write!(f, "map cached"),
            MapStatus::Missing => write!(f, "no map"),
        }
    }
}

/// File name for a route's map: the id, then the name with anything outside
/// `[A-Za-z0-9-_]` replaced by `_`. The id keeps names that sanitise alike
/// apart.
pub fn map_file_name(route_id: i64, route_name: &str) -> String {
    let safe: String = route_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}-{}.png", route_id, safe)
}

/// Static Maps request: 800x400 roadmap, the route path when known (a
/// straight segment otherwise), green S and red E markers.
pub fn build_static_map_url(
    api_key: &str,
    start: Coordinate,
    end: Coordinate,
    polyline: Option<&str>,
) -> Result<Url, MapError> {
    let path = match polyline {
        Some(points) => format!("enc:{}", points),
        None => format!("{}|{}", start, end),
    };
    Url::parse_with_params(
        STATIC_MAP_URL,
        &[
            ("size", "800x400".to_string()),
            ("maptype", "roadmap".to_string()),
            ("path", path),
            ("markers", format!("color:green|label:S|{}", start)),
            ("markers", format!("color:red|label:E|{}", end)),
            ("key", api_key.to_string()),
        ],
    )
    .map_err(|e| MapError::Transport(format!("bad map URL: {}", e)))
}

pub struct MapCache {
    dir: PathBuf,
    api_key: Option<String>,
    directions: Option<Arc<dyn DirectionsProvider>>,
    client: reqwest::blocking::Client,
}

impl MapCache {
    pub fn new(
        dir: impl Into<PathBuf>,
        api_key: Option<String>,
        directions: Option<Arc<dyn DirectionsProvider>>,
        timeout: Duration,
    ) -> Result<Self, MapError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MapError::Transport(e.to_string()))?;
        Ok(Self {
            dir: dir.into(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            directions,
            client,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn map_path(&self, route: &Route) -> PathBuf {
        self.dir.join(map_file_name(route.id, &route.name))
    }

    pub fn status(&self, route: &Route) -> MapStatus {
        if self.map_path(route).is_file() {
            MapStatus::Cached
        } else {
            MapStatus::Missing
        }
    }

    /// The cached map, rendering it first when missing.
    pub fn route_map(&self, route: &Route) -> Result<PathBuf, MapError> {
        let path = self.map_path(route);
        if path.is_file() {
            return Ok(path);
        }

        let api_key = self.api_key.as_deref().ok_or(MapError::NotConfigured)?;
        let polyline = match &self.directions {
            Some(provider) => provider
                .directions(route.start, route.end)
                .map_err(MapError::Directions)?
                .overview_polyline,
            None => None,
        };

        let url = build_static_map_url(api_key, route.start, route.end, polyline.as_deref())?;
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| MapError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(MapError::Http(response.status().as_u16()));
        }
        let bytes = response
            .bytes()
            .map_err(|e| MapError::Transport(e.to_string()))?;

        fs::create_dir_all(&self.dir)?;
        fs::write(&path, &bytes)?;
        Ok(path)
    }

    /// Deletes a route's map if present.
    pub fn remove(&self, route: &Route) -> Result<bool, MapError> {
        let path = self.map_path(route);
        if path.is_file() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}
