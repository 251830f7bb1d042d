/// PostgreSQL route store.
///
/// One connection behind a mutex; every write runs in its own transaction
/// that commits on success and rolls back when dropped on any error path.
/// History is stored as a JSON array in a TEXT column.

use super::{CommitOutcome, ConfigStore, EvaluationCommit, RouteStore, commit_outcome, lock_recovering};
use crate::logging::{self, Component};
use crate::model::{Coordinate, NewRoute, Route, RoutePriority, StoreError, TrafficState};
use chrono::{DateTime, Utc};
use postgres::error::SqlState;
use postgres::{Client, GenericClient, NoTls, Row};
use std::sync::Mutex;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS routes (
        id            BIGSERIAL PRIMARY KEY,
        name          TEXT NOT NULL UNIQUE,
        start_lat     DOUBLE PRECISION NOT NULL,
        start_lng     DOUBLE PRECISION NOT NULL,
        end_lat       DOUBLE PRECISION NOT NULL,
        end_lng       DOUBLE PRECISION NOT NULL,
        priority      TEXT NOT NULL DEFAULT 'Normal',
        last_state    TEXT NOT NULL DEFAULT 'Normal',
        history       TEXT NOT NULL DEFAULT '[]',
        revision      BIGINT NOT NULL DEFAULT 0,
        last_checked  TIMESTAMPTZ
    );
    CREATE TABLE IF NOT EXISTS config (
        name   TEXT PRIMARY KEY,
        value  TEXT NOT NULL
    );
";

const ROUTE_COLUMNS: &str = "id, name, start_lat, start_lng, end_lat, end_lng, \
                             priority, last_state, history, revision, last_checked";

pub struct PgRouteStore {
    client: Mutex<Client>,
}

impl PgRouteStore {
    /// Connects and creates the tables if they do not exist yet.
    pub fn connect(database_url: &str) -> Result<Self, StoreError> {
        let mut client = Client::connect(database_url, NoTls).map_err(db_error)?;
        client.batch_execute(SCHEMA).map_err(db_error)?;
        logging::debug(Component::Store, None, "Route schema ready");
        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

fn db_error(e: postgres::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn not_found(id: i64) -> StoreError {
    StoreError::NotFound(format!("route {}", id))
}

fn route_from_row(row: &Row) -> Result<Route, StoreError> {
    let id: i64 = row.get(0);
    let priority: String = row.get(6);
    let last_state: String = row.get(7);
    let history: String = row.get(8);
    let revision: i64 = row.get(9);

    Ok(Route {
        id,
        name: row.get(1),
        start: Coordinate::new(row.get(2), row.get(3)),
        end: Coordinate::new(row.get(4), row.get(5)),
        priority: RoutePriority::parse(&priority)
            .ok_or_else(|| StoreError::Corrupt(format!("route {}: priority '{}'", id, priority)))?,
        last_state: TrafficState::parse(&last_state)
            .ok_or_else(|| StoreError::Corrupt(format!("route {}: state '{}'", id, last_state)))?,
        history: serde_json::from_str(&history)
            .map_err(|e| StoreError::Corrupt(format!("route {}: history: {}", id, e)))?,
        revision: u64::try_from(revision)
            .map_err(|_| StoreError::Corrupt(format!("route {}: revision {}", id, revision)))?,
        last_checked: row.get::<_, Option<DateTime<Utc>>>(10),
    })
}

fn select_route<C: GenericClient>(client: &mut C, id: i64, for_update: bool) -> Result<Route, StoreError> {
    let lock = if for_update { " FOR UPDATE" } else { "" };
    let query = format!("SELECT {} FROM routes WHERE id = $1{}", ROUTE_COLUMNS, lock);
    let row = client
        .query_opt(query.as_str(), &[&id])
        .map_err(db_error)?
        .ok_or_else(|| not_found(id))?;
    route_from_row(&row)
}

impl ConfigStore for PgRouteStore {
    fn get_config(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let mut client = lock_recovering(&self.client);
        let row = client
            .query_opt("SELECT value FROM config WHERE name = $1", &[&key])
            .map_err(db_error)?;

        match row {
            Some(row) => {
                let text: String = row.get(0);
                serde_json::from_str(&text)
                    .map(Some)
                    .map_err(|e| StoreError::Corrupt(format!("config {}: {}", key, e)))
            }
            None => Ok(None),
        }
    }

    fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let text = value.to_string();
        let mut client = lock_recovering(&self.client);
        client
            .execute(
                "INSERT INTO config (name, value) VALUES ($1, $2)
                 ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value",
                &[&key, &text],
            )
            .map_err(db_error)?;
        Ok(())
    }

    fn update_config(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<serde_json::Value>) -> Result<serde_json::Value, StoreError>,
    ) -> Result<serde_json::Value, StoreError> {
        let mut client = lock_recovering(&self.client);
        let mut tx = client.transaction().map_err(db_error)?;

        // Creates the row if missing so FOR UPDATE always has something to lock.
        let inserted = tx
            .execute(
                "INSERT INTO config (name, value) VALUES ($1, 'null') ON CONFLICT (name) DO NOTHING",
                &[&key],
            )
            .map_err(db_error)?;
        let row = tx
            .query_one("SELECT value FROM config WHERE name = $1 FOR UPDATE", &[&key])
            .map_err(db_error)?;

        let current = if inserted == 1 {
            None
        } else {
            let text: String = row.get(0);
            let value: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| StoreError::Corrupt(format!("config {}: {}", key, e)))?;
            Some(value)
        };

        let next = apply(current)?;
        tx.execute(
            "UPDATE config SET value = $2 WHERE name = $1",
            &[&key, &next.to_string()],
        )
        .map_err(db_error)?;
        tx.commit().map_err(db_error)?;

        Ok(next)
    }
}

impl RouteStore for PgRouteStore {
    fn list_routes(&self) -> Result<Vec<Route>, StoreError> {
        let mut client = lock_recovering(&self.client);
        let query = format!("SELECT {} FROM routes ORDER BY id", ROUTE_COLUMNS);
        let rows = client.query(query.as_str(), &[]).map_err(db_error)?;
        rows.iter().map(route_from_row).collect()
    }

    fn get_route(&self, id: i64) -> Result<Route, StoreError> {
        let mut client = lock_recovering(&self.client);
        select_route(&mut *client, id, false)
    }

    fn find_route(&self, name: &str) -> Result<Option<Route>, StoreError> {
        let mut client = lock_recovering(&self.client);
        let query = format!("SELECT {} FROM routes WHERE name = $1", ROUTE_COLUMNS);
        let row = client.query_opt(query.as_str(), &[&name]).map_err(db_error)?;
        row.as_ref().map(route_from_row).transpose()
    }

    fn insert_route(&self, new_route: &NewRoute) -> Result<Route, StoreError> {
        let mut client = lock_recovering(&self.client);
        let query = format!(
            "INSERT INTO routes (name, start_lat, start_lng, end_lat, end_lng, priority)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {}",
            ROUTE_COLUMNS
        );
        let result = client.query_one(
            query.as_str(),
            &[
                &new_route.name,
                &new_route.start.latitude,
                &new_route.start.longitude,
                &new_route.end.latitude,
                &new_route.end.longitude,
                &new_route.priority.as_str(),
            ],
        );

        match result {
            Ok(row) => route_from_row(&row),
            Err(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(StoreError::DuplicateName(new_route.name.clone()))
            }
            Err(e) => Err(db_error(e)),
        }
    }

    fn update_priority(&self, id: i64, priority: RoutePriority) -> Result<Route, StoreError> {
        let mut client = lock_recovering(&self.client);
        let query = format!(
            "UPDATE routes SET priority = $2 WHERE id = $1 RETURNING {}",
            ROUTE_COLUMNS
        );
        let row = client
            .query_opt(query.as_str(), &[&id, &priority.as_str()])
            .map_err(db_error)?
            .ok_or_else(|| not_found(id))?;
        route_from_row(&row)
    }

    fn delete_route(&self, id: i64) -> Result<(), StoreError> {
        let mut client = lock_recovering(&self.client);
        let deleted = client
            .execute("DELETE FROM routes WHERE id = $1", &[&id])
            .map_err(db_error)?;
        if deleted == 0 {
            Err(not_found(id))
        } else {
            Ok(())
        }
    }

    fn commit_evaluation(&self, commit: &EvaluationCommit) -> Result<CommitOutcome, StoreError> {
        let history = serde_json::to_string(&commit.history)
            .map_err(|e| StoreError::Corrupt(format!("route {}: history: {}", commit.route_id, e)))?;

        let mut client = lock_recovering(&self.client);
        let mut tx = client.transaction().map_err(db_error)?;

        let current = select_route(&mut tx, commit.route_id, true)?;
        let outcome = commit_outcome(current.revision, commit.based_on_revision);
        let revision = i64::try_from(outcome.revision())
            .map_err(|_| StoreError::Corrupt(format!("route {}: revision overflow", commit.route_id)))?;

        tx.execute(
            "UPDATE routes
             SET history = $2, last_state = $3, revision = $4, last_checked = $5
             WHERE id = $1",
            &[
                &commit.route_id,
                &history,
                &commit.state.as_str(),
                &revision,
                &commit.evaluated_at,
            ],
        )
        .map_err(db_error)?;
        tx.commit().map_err(db_error)?;

        Ok(outcome)
    }
}
