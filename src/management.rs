/// Route and threshold management.
///
/// The operations behind the `routes` and `thresholds` commands. Input is
/// validated here: bad coordinates, empty names and invalid threshold edits
/// are rejected before anything is written.

use crate::alert::thresholds::{BracketUpdate, ThresholdTable};
use crate::coordinates::parse_coordinate;
use crate::logging::{self, Component};
use crate::maps::{MapCache, MapStatus};
use crate::model::{CoordinateError, NewRoute, Route, RoutePriority, StoreError, ThresholdError};
use crate::store::{RouteStore, load_thresholds, save_thresholds};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum ManagementError {
    InvalidInput(String),
    Coordinate(CoordinateError),
    Store(StoreError),
    Threshold(ThresholdError),
}

impl fmt::Display for ManagementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagementError::InvalidInput(msg) => write!(f, "{}", msg),
            ManagementError::Coordinate(e) => write!(f, "{}", e),
            ManagementError::Store(e) => write!(f, "{}", e),
            ManagementError::Threshold(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ManagementError {}

impl From<CoordinateError> for ManagementError {
    fn from(e: CoordinateError) -> Self {
        ManagementError::Coordinate(e)
    }
}

impl From<StoreError> for ManagementError {
    fn from(e: StoreError) -> Self {
        ManagementError::Store(e)
    }
}

impl From<ThresholdError> for ManagementError {
    fn from(e: ThresholdError) -> Self {
        ManagementError::Threshold(e)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedRoute {
    pub route: Route,
    /// Rendered map, when one could be produced.
    pub map: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteListing {
    pub route: Route,
    pub map: MapStatus,
}

pub struct RouteManager {
    store: Arc<dyn RouteStore>,
    maps: Option<MapCache>,
}

impl RouteManager {
    pub fn new(store: Arc<dyn RouteStore>) -> Self {
        Self { store, maps: None }
    }

    pub fn with_maps(mut self, maps: MapCache) -> Self {
        self.maps = Some(maps);
        self
    }

    // --- Routes -------------------------------------------------------------

    /// Creates a route from DMS or decimal coordinate text.
    pub fn create_route(
        &self,
        name: &str,
        start: &str,
        end: &str,
        priority: RoutePriority,
    ) -> Result<CreatedRoute, ManagementError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ManagementError::InvalidInput("Route name must not be empty".into()));
        }

        let new_route = NewRoute {
            name: name.to_string(),
            start: parse_coordinate(start)?,
            end: parse_coordinate(end)?,
            priority,
        };
        let route = self.store.insert_route(&new_route)?;
        logging::info(Component::Store, Some(&route.name), &format!("Route added (id {})", route.id));

        let map = match &self.maps {
            Some(maps) => match maps.route_map(&route) {
                Ok(path) => Some(path),
                Err(e) => {
                    logging::warn(Component::System, Some(&route.name), &format!("No map: {}", e));
                    None
                }
            },
            None => None,
        };

        Ok(CreatedRoute { route, map })
    }

    pub fn list_routes(&self) -> Result<Vec<RouteListing>, ManagementError> {
        let routes = self.store.list_routes()?;
        Ok(routes
            .into_iter()
            .map(|route| {
                let map = self
                    .maps
                    .as_ref()
                    .map_or(MapStatus::Missing, |maps| maps.status(&route));
                RouteListing { route, map }
            })
            .collect())
    }

    /// Looks a route up by numeric id or, failing that, by exact name.
    pub fn resolve(&self, name_or_id: &str) -> Result<Route, ManagementError> {
        let key = name_or_id.trim();
        if let Ok(id) = key.parse::<i64>() {
            match self.store.get_route(id) {
                Ok(route) => return Ok(route),
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.store
            .find_route(key)?
            .ok_or_else(|| StoreError::NotFound(format!("route '{}'", key)).into())
    }

    pub fn update_priority(&self, id: i64, priority: RoutePriority) -> Result<Route, ManagementError> {
        let route = self.store.update_priority(id, priority)?;
        logging::info(Component::Store, Some(&route.name), &format!("Priority set to {}", priority));
        Ok(route)
    }

    /// Deletes the route and its cached map. Returns the deleted record.
    pub fn delete_route(&self, id: i64) -> Result<Route, ManagementError> {
        let route = self.store.get_route(id)?;
        self.store.delete_route(id)?;
        if let Some(maps) = &self.maps {
            if let Err(e) = maps.remove(&route) {
                logging::warn(Component::System, Some(&route.name), &format!("Map not removed: {}", e));
            }
        }
        logging::info(Component::Store, Some(&route.name), "Route deleted");
        Ok(route)
    }

    // --- Thresholds ---------------------------------------------------------

    pub fn thresholds(&self) -> Result<ThresholdTable, ManagementError> {
        Ok(load_thresholds(self.store.as_ref())?)
    }

    pub fn update_thresholds(&self, index: usize, update: &BracketUpdate) -> Result<ThresholdTable, ManagementError> {
        if update.is_empty() {
            return Err(ManagementError::InvalidInput("Nothing to update".into()));
        }
        let table = self.thresholds()?.with_update(index, update)?;
        save_thresholds(self.store.as_ref(), &table)?;
        logging::info(Component::Store, None, &format!("Threshold bracket {} updated", index));
        Ok(table)
    }

    pub fn reset_thresholds(&self) -> Result<ThresholdTable, ManagementError> {
        let table = ThresholdTable::default();
        save_thresholds(self.store.as_ref(), &table)?;
        logging::info(Component::Store, None, "Thresholds reset to defaults");
        Ok(table)
    }
}
