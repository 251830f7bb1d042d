//! Route persistence.
//!
//! The `RouteStore` trait is the seam between the monitor/management code and
//! the database. `memory` backs tests and `check --dry-run`; `postgres` is the
//! production store. Named JSON config records (thresholds, LLM balance) share
//! the same backend through `ConfigStore`.

pub mod memory;
pub mod postgres;

use crate::alert::thresholds::ThresholdTable;
use crate::model::{NewRoute, Route, RoutePriority, StoreError, TrafficState};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

pub const THRESHOLDS_CONFIG_KEY: &str = "thresholds";

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait ConfigStore: Send + Sync {
    fn get_config(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;
    fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError>;
    /// Atomic read-modify-write of one record. `apply` receives the current
    /// value (`None` when absent) and returns the value to store; no other
    /// write to `key` lands in between. An error from `apply` leaves the
    /// record untouched.
    fn update_config(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<serde_json::Value>) -> Result<serde_json::Value, StoreError>,
    ) -> Result<serde_json::Value, StoreError>;
}

pub trait RouteStore: ConfigStore {
    /// All routes, ordered by id.
    fn list_routes(&self) -> Result<Vec<Route>, StoreError>;
    fn get_route(&self, id: i64) -> Result<Route, StoreError>;
    fn find_route(&self, name: &str) -> Result<Option<Route>, StoreError>;
    /// Fails with `DuplicateName` when a route with the same name exists.
    fn insert_route(&self, new_route: &NewRoute) -> Result<Route, StoreError>;
    fn update_priority(&self, id: i64, priority: RoutePriority) -> Result<Route, StoreError>;
    fn delete_route(&self, id: i64) -> Result<(), StoreError>;
    /// Persists one evaluation's history and state in a single step.
    fn commit_evaluation(&self, commit: &EvaluationCommit) -> Result<CommitOutcome, StoreError>;
}

/// The persisted part of one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationCommit {
    pub route_id: i64,
    /// Revision of the route record the evaluation was computed from.
    pub based_on_revision: u64,
    pub history: Vec<f64>,
    pub state: TrafficState,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied { revision: u64 },
    /// Another evaluation committed in between. This write still won; the
    /// other one is lost.
    Overwrote { lost_revision: u64, revision: u64 },
}

impl CommitOutcome {
    pub fn revision(&self) -> u64 {
        match self {
            CommitOutcome::Applied { revision } | CommitOutcome::Overwrote { revision, .. } => *revision,
        }
    }
}

/// Outcome for a record currently at `current` receiving a commit based on
/// `based_on`.
pub(crate) fn commit_outcome(current: u64, based_on: u64) -> CommitOutcome {
    let revision = current + 1;
    if current == based_on {
        CommitOutcome::Applied { revision }
    } else {
        CommitOutcome::Overwrote { lost_revision: current, revision }
    }
}

// ---------------------------------------------------------------------------
// Threshold record
// ---------------------------------------------------------------------------

/// The stored threshold table, or the built-in defaults when none is saved.
pub fn load_thresholds<S: ConfigStore + ?Sized>(store: &S) -> Result<ThresholdTable, StoreError> {
    match store.get_config(THRESHOLDS_CONFIG_KEY)? {
        Some(value) => serde_json::from_value(value)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", THRESHOLDS_CONFIG_KEY, e))),
        None => Ok(ThresholdTable::default()),
    }
}

pub fn save_thresholds<S: ConfigStore + ?Sized>(store: &S, table: &ThresholdTable) -> Result<(), StoreError> {
    let value = serde_json::to_value(table)
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", THRESHOLDS_CONFIG_KEY, e)))?;
    store.set_config(THRESHOLDS_CONFIG_KEY, &value)
}

// ---------------------------------------------------------------------------
// Per-route serialization
// ---------------------------------------------------------------------------

/// One mutex per route id. Evaluations of the same route run their
/// read-evaluate-commit step one at a time; different routes never block
/// each other. An entry lives only while someone holds or waits for it.
#[derive(Default)]
pub struct RouteLocks {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl RouteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` while holding the lock for `route_id`.
    pub fn with_route_lock<T>(&self, route_id: i64, f: impl FnOnce() -> T) -> T {
        let lock = {
            let mut map = lock_recovering(&self.locks);
            Arc::clone(map.entry(route_id).or_default())
        };
        let result = {
            let _guard = lock_recovering(&lock);
            f()
        };
        self.release(route_id, lock);
        result
    }

    /// Number of routes with a live lock entry.
    pub fn len(&self) -> usize {
        lock_recovering(&self.locks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, route_id: i64, lock: Arc<Mutex<()>>) {
        let mut map = lock_recovering(&self.locks);
        // The map's reference plus ours: no other holder or waiter.
        if Arc::strong_count(&lock) == 2 {
            map.remove(&route_id);
        }
    }
}

/// A panicked holder must not wedge every later pass.
pub(crate) fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
