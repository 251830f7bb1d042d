/// In-process route store.
///
/// Same semantics as the PostgreSQL store, held behind one mutex. Used by the
/// test suites and by `check --dry-run`, which loads a snapshot of the real
/// routes into memory so nothing is persisted.

use super::{CommitOutcome, ConfigStore, EvaluationCommit, RouteStore, commit_outcome, lock_recovering};
use crate::model::{NewRoute, Route, RoutePriority, StoreError, TrafficState};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    routes: BTreeMap<i64, Route>,
    next_id: i64,
    config: HashMap<String, serde_json::Value>,
}

#[derive(Default)]
pub struct MemoryRouteStore {
    state: Mutex<MemoryState>,
}

impl MemoryRouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with existing records, keeping their ids.
    pub fn with_routes(routes: Vec<Route>) -> Self {
        let next_id = routes.iter().map(|r| r.id).max().unwrap_or(0);
        let routes = routes.into_iter().map(|r| (r.id, r)).collect();
        Self {
            state: Mutex::new(MemoryState {
                routes,
                next_id,
                config: HashMap::new(),
            }),
        }
    }
}

fn not_found(id: i64) -> StoreError {
    StoreError::NotFound(format!("route {}", id))
}

impl ConfigStore for MemoryRouteStore {
    fn get_config(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(lock_recovering(&self.state).config.get(key).cloned())
    }

    fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        lock_recovering(&self.state)
            .config
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    fn update_config(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<serde_json::Value>) -> Result<serde_json::Value, StoreError>,
    ) -> Result<serde_json::Value, StoreError> {
        let mut state = lock_recovering(&self.state);
        let next = apply(state.config.get(key).cloned())?;
        state.config.insert(key.to_string(), next.clone());
        Ok(next)
    }
}

impl RouteStore for MemoryRouteStore {
    fn list_routes(&self) -> Result<Vec<Route>, StoreError> {
        Ok(lock_recovering(&self.state).routes.values().cloned().collect())
    }

    fn get_route(&self, id: i64) -> Result<Route, StoreError> {
        lock_recovering(&self.state)
            .routes
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    fn find_route(&self, name: &str) -> Result<Option<Route>, StoreError> {
        Ok(lock_recovering(&self.state)
            .routes
            .values()
            .find(|r| r.name == name)
            .cloned())
    }

    fn insert_route(&self, new_route: &NewRoute) -> Result<Route, StoreError> {
        let mut state = lock_recovering(&self.state);
        if state.routes.values().any(|r| r.name == new_route.name) {
            return Err(StoreError::DuplicateName(new_route.name.clone()));
        }

        state.next_id += 1;
        let route = Route {
            id: state.next_id,
            name: new_route.name.clone(),
            start: new_route.start,
            end: new_route.end,
            priority: new_route.priority,
            last_state: TrafficState::Normal,
            history: Vec::new(),
            revision: 0,
            last_checked: None,
        };
        state.routes.insert(route.id, route.clone());
        Ok(route)
    }

    fn update_priority(&self, id: i64, priority: RoutePriority) -> Result<Route, StoreError> {
        let mut state = lock_recovering(&self.state);
        let route = state.routes.get_mut(&id).ok_or_else(|| not_found(id))?;
        route.priority = priority;
        Ok(route.clone())
    }

    fn delete_route(&self, id: i64) -> Result<(), StoreError> {
        lock_recovering(&self.state)
            .routes
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(id))
    }

    fn commit_evaluation(&self, commit: &EvaluationCommit) -> Result<CommitOutcome, StoreError> {
        let mut state = lock_recovering(&self.state);
        let route = state
            .routes
            .get_mut(&commit.route_id)
            .ok_or_else(|| not_found(commit.route_id))?;

        let outcome = commit_outcome(route.revision, commit.based_on_revision);
        route.history = commit.history.clone();
        route.last_state = commit.state;
        route.revision = outcome.revision();
        route.last_checked = Some(commit.evaluated_at);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Coordinate;
    use chrono::Utc;

    fn new_route(name: &str) -> NewRoute {
        NewRoute {
            name: name.to_string(),
            start: Coordinate::new(-33.92, 18.42),
            end: Coordinate::new(-33.80, 18.50),
            priority: RoutePriority::Normal,
        }
    }

    fn commit(route_id: i64, based_on_revision: u64, delay: f64) -> EvaluationCommit {
        EvaluationCommit {
            route_id,
            based_on_revision,
            history: vec![delay],
            state: TrafficState::Heavy,
            evaluated_at: Utc::now(),
        }
    }

    #[test]
    fn test_insert_assigns_ids_and_defaults() {
        let store = MemoryRouteStore::new();
        let a = store.insert_route(&new_route("A")).expect("insert");
        let b = store.insert_route(&new_route("B")).expect("insert");
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(a.last_state, TrafficState::Normal);
        assert!(a.history.is_empty());
        assert_eq!(store.list_routes().expect("list").len(), 2);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let store = MemoryRouteStore::new();
        store.insert_route(&new_route("Highway-101")).expect("insert");
        assert_eq!(
            store.insert_route(&new_route("Highway-101")).unwrap_err(),
            StoreError::DuplicateName("Highway-101".into())
        );
    }

    #[test]
    fn test_update_and_delete_unknown_id() {
        let store = MemoryRouteStore::new();
        assert!(matches!(store.update_priority(9, RoutePriority::High), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete_route(9), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_commit_applies_and_detects_lost_update() {
        let store = MemoryRouteStore::new();
        let route = store.insert_route(&new_route("A")).expect("insert");

        let first = store.commit_evaluation(&commit(route.id, 0, 100.0)).expect("commit");
        assert_eq!(first, CommitOutcome::Applied { revision: 1 });

        // A second evaluation computed from revision 0 arrives late.
        let second = store.commit_evaluation(&commit(route.id, 0, 200.0)).expect("commit");
        assert_eq!(second, CommitOutcome::Overwrote { lost_revision: 1, revision: 2 });

        let stored = store.get_route(route.id).expect("get");
        assert_eq!(stored.history, vec![200.0], "later write wins");
        assert_eq!(stored.revision, 2);
        assert!(stored.last_checked.is_some());
    }

    #[test]
    fn test_seeded_store_continues_ids() {
        let store = MemoryRouteStore::new();
        let route = store.insert_route(&new_route("A")).expect("insert");
        let seeded = MemoryRouteStore::with_routes(vec![Route { id: 5, ..route }]);
        assert_eq!(seeded.insert_route(&new_route("B")).expect("insert").id, 6);
    }

    #[test]
    fn test_update_config_sees_previous_value() {
        let store = MemoryRouteStore::new();
        let counter = |current: Option<serde_json::Value>| -> Result<serde_json::Value, StoreError> {
            let n = current.and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(serde_json::json!(n + 1))
        };

        assert_eq!(store.update_config("n", &mut |c| counter(c)).expect("create"), serde_json::json!(1));
        assert_eq!(store.update_config("n", &mut |c| counter(c)).expect("bump"), serde_json::json!(2));

        let failed = store.update_config("n", &mut |_| Err(StoreError::Corrupt("bad".into())));
        assert!(failed.is_err());
        assert_eq!(store.get_config("n").expect("get"), Some(serde_json::json!(2)));
    }

    #[test]
    fn test_concurrent_config_updates_are_not_lost() {
        let store = std::sync::Arc::new(MemoryRouteStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        store
                            .update_config("n", &mut |c| {
                                Ok(serde_json::json!(c.and_then(|v| v.as_i64()).unwrap_or(0) + 1))
                            })
                            .expect("update");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(store.get_config("n").expect("get"), Some(serde_json::json!(400)));
    }
}
