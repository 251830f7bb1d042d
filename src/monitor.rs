/// Evaluation passes.
///
/// One pass evaluates every route (or a chosen subset) on a bounded pool of
/// scoped worker threads. Directions are fetched without holding any lock;
/// the read-evaluate-commit step for a route then runs under that route's
/// lock. The pass returns once every job has finished, and only then does the
/// notification policy run over the successful verdicts.

use crate::alert::evaluator;
use crate::alert::policy;
use crate::alert::thresholds::ThresholdTable;
use crate::ingest::directions::DirectionsProvider;
use crate::logging::{self, Component};
use crate::model::{DirectionsError, Route, RouteVerdict, StoreError};
use crate::notify::chat::{self, ChatChannel};
use crate::notify::push::{self, PushChannel, PushMessage};
use crate::store::{CommitOutcome, EvaluationCommit, RouteLocks, RouteStore, load_thresholds, lock_recovering};
use crate::summary::SummaryComposer;
use chrono::Utc;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

pub const DEFAULT_WORKERS: usize = 4;

// ---------------------------------------------------------------------------
// Pass results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum PassError {
    Directions(DirectionsError),
    Store(StoreError),
}

impl fmt::Display for PassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PassError::Directions(e) => write!(f, "{}", e),
            PassError::Store(e) => write!(f, "{}", e),
        }
    }
}

impl From<DirectionsError> for PassError {
    fn from(e: DirectionsError) -> Self {
        PassError::Directions(e)
    }
}

impl From<StoreError> for PassError {
    fn from(e: StoreError) -> Self {
        PassError::Store(e)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteFailure {
    pub route_id: i64,
    pub route_name: String,
    pub error: PassError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    /// Successful evaluations, in route order.
    pub verdicts: Vec<RouteVerdict>,
    pub failures: Vec<RouteFailure>,
    /// Commits that overwrote a concurrent evaluation of the same route.
    pub lost_updates: usize,
}

impl PassReport {
    pub fn total(&self) -> usize {
        self.verdicts.len() + self.failures.len()
    }
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

pub struct Monitor {
    store: Arc<dyn RouteStore>,
    directions: Arc<dyn DirectionsProvider>,
    locks: RouteLocks,
    workers: usize,
}

impl Monitor {
    pub fn new(store: Arc<dyn RouteStore>, directions: Arc<dyn DirectionsProvider>, workers: usize) -> Self {
        Self {
            store,
            directions,
            locks: RouteLocks::new(),
            workers: workers.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn RouteStore> {
        &self.store
    }

    /// Evaluates every stored route.
    pub fn run_pass(&self) -> Result<PassReport, StoreError> {
        let routes = self.store.list_routes()?;
        self.run_pass_for(&routes)
    }

    /// Evaluates `routes`. Only the thresholds and the route list itself can
    /// fail the pass; per-route failures are collected in the report.
    pub fn run_pass_for(&self, routes: &[Route]) -> Result<PassReport, StoreError> {
        let thresholds = load_thresholds(self.store.as_ref())?;
        let next = AtomicUsize::new(0);
        let results: Mutex<Vec<(usize, Result<(RouteVerdict, CommitOutcome), PassError>)>> =
            Mutex::new(Vec::with_capacity(routes.len()));

        thread::scope(|s| {
            for _ in 0..self.workers.min(routes.len()) {
                s.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(route) = routes.get(index) else { break };
                        let outcome = self.evaluate_route(route, &thresholds);
                        lock_recovering(&results).push((index, outcome));
                    }
                });
            }
        });

        let mut results = results.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner());
        results.sort_by_key(|(index, _)| *index);

        let mut report = PassReport::default();
        for (index, outcome) in results {
            let route = &routes[index];
            match outcome {
                Ok((verdict, commit)) => {
                    if let CommitOutcome::Overwrote { lost_revision, revision } = commit {
                        report.lost_updates += 1;
                        logging::warn(
                            Component::Store,
                            Some(&route.name),
                            &format!(
                                "Concurrent evaluation at revision {} was overwritten (now revision {})",
                                lost_revision, revision
                            ),
                        );
                    }
                    report.verdicts.push(verdict);
                }
                Err(error) => {
                    match &error {
                        PassError::Directions(e) => logging::log_directions_failure(&route.name, e),
                        PassError::Store(e) => logging::error(
                            Component::Store,
                            Some(&route.name),
                            &format!("Evaluation not saved: {}", e),
                        ),
                    }
                    report.failures.push(RouteFailure {
                        route_id: route.id,
                        route_name: route.name.clone(),
                        error,
                    });
                }
            }
        }

        logging::log_pass_summary(report.total(), report.verdicts.len(), report.failures.len());
        Ok(report)
    }

    fn evaluate_route(
        &self,
        route: &Route,
        thresholds: &ThresholdTable,
    ) -> Result<(RouteVerdict, CommitOutcome), PassError> {
        let directions = self.directions.directions(route.start, route.end)?;

        self.locks.with_route_lock(route.id, || -> Result<(RouteVerdict, CommitOutcome), PassError> {
            let current = self.store.get_route(route.id)?;
            let (result, history) = evaluator::evaluate(&current, &directions, thresholds)?;

            let commit = EvaluationCommit {
                route_id: current.id,
                based_on_revision: current.revision,
                history,
                state: result.new_state(),
                evaluated_at: Utc::now(),
            };
            let outcome = self.store.commit_evaluation(&commit)?;

            logging::debug(
                Component::Directions,
                Some(&current.name),
                &format!(
                    "delay {:.0}s vs baseline {:.0}s over {:.1} km: {}",
                    result.current_delay_sec,
                    result.baseline_delay_sec,
                    result.distance_km,
                    result.new_state()
                ),
            );
            Ok((RouteVerdict { route: current, result }, outcome))
        })
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub chat_routes: Vec<String>,
    pub push_routes: Vec<String>,
    pub push_message: Option<PushMessage>,
    pub chat_sent: bool,
    pub push_sent: bool,
}

/// Applies the notification policy and delivers the results. Channels left
/// unset are skipped, which is how dry runs work.
pub struct Dispatcher {
    chat: Option<Arc<dyn ChatChannel>>,
    push: Option<Arc<dyn PushChannel>>,
    composer: SummaryComposer,
    push_title: String,
}

impl Dispatcher {
    pub fn new(composer: SummaryComposer, push_title: &str) -> Self {
        Self {
            chat: None,
            push: None,
            composer,
            push_title: push_title.to_string(),
        }
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatChannel>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_push(mut self, push: Arc<dyn PushChannel>) -> Self {
        self.push = Some(push);
        self
    }

    pub fn dispatch(&self, verdicts: &[RouteVerdict]) -> DispatchReport {
        let plan = policy::decide(verdicts);
        let mut report = DispatchReport {
            chat_routes: plan.chat_routes.iter().map(|v| v.route.name.clone()).collect(),
            push_routes: plan.push_routes.iter().map(|v| v.route.name.clone()).collect(),
            ..DispatchReport::default()
        };

        if plan.has_chat() {
            if let Some(channel) = &self.chat {
                let alert = chat::build_alert(&plan.chat_routes, Utc::now());
                match channel.send(&alert) {
                    Ok(()) => {
                        report.chat_sent = true;
                        logging::info(
                            Component::Notify,
                            None,
                            &format!("Chat alert posted for {} route(s)", alert.entries.len()),
                        );
                    }
                    Err(e) => logging::error(Component::Notify, None, &format!("Chat alert failed: {}", e)),
                }
            }
        }

        if plan.has_push() {
            let body = self.composer.compose(&plan.push_routes);
            let message = push::build_message(&self.push_title, body, &plan.push_routes);
            if let Some(channel) = &self.push {
                match channel.send(&message) {
                    Ok(()) => {
                        report.push_sent = true;
                        logging::info(
                            Component::Notify,
                            None,
                            &format!("Push notification sent (priority {})", message.priority),
                        );
                    }
                    Err(e) => logging::error(Component::Notify, None, &format!("Push notification failed: {}", e)),
                }
            }
            report.push_message = Some(message);
        }

        report
    }
}

/// One ignition-triggered cycle: a full pass, then dispatch.
pub fn run_cycle(monitor: &Monitor, dispatcher: &Dispatcher) -> Result<(PassReport, DispatchReport), StoreError> {
    let pass = monitor.run_pass()?;
    let dispatch = dispatcher.dispatch(&pass.verdicts);
    Ok((pass, dispatch))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coordinate, DirectionsLeg, DirectionsResponse, NewRoute, RoutePriority, TrafficState};
    use crate::store::memory::MemoryRouteStore;

    /// Free-flow 600 s over four steps. The whole delay, taken from the
    /// destination longitude, lands on the last step.
    struct FixedDelays;

    impl DirectionsProvider for FixedDelays {
        fn directions(&self, _origin: Coordinate, destination: Coordinate) -> Result<DirectionsResponse, DirectionsError> {
            if destination.longitude < 0.0 {
                return Err(DirectionsError::NoRouteFound("no routes".into()));
            }
            let live = 600.0 + destination.longitude;
            Ok(DirectionsResponse {
                summary: "test".into(),
                start_address: None,
                end_address: None,
                distance_m: 10_000.0,
                duration_sec: 600.0,
                duration_in_traffic_sec: live,
                legs: vec![
                    step("Head north", 100.0, 100.0),
                    step("Continue", 100.0, 100.0),
                    step("Keep left", 100.0, 100.0),
                    step("Merge", 300.0, live - 300.0),
                ],
                overview_polyline: None,
            })
        }
    }

    fn step(instruction: &str, free: f64, live: f64) -> DirectionsLeg {
        DirectionsLeg {
            instruction: instruction.into(),
            duration_sec: free,
            duration_in_traffic_sec: live,
        }
    }

    fn add(store: &MemoryRouteStore, name: &str, delay: f64) -> Route {
        store
            .insert_route(&NewRoute {
                name: name.into(),
                start: Coordinate::new(0.0, 0.0),
                end: Coordinate::new(0.0, delay),
                priority: RoutePriority::Normal,
            })
            .expect("insert")
    }

    #[test]
    fn test_pass_keeps_route_order_and_collects_failures() {
        let store = Arc::new(MemoryRouteStore::new());
        add(&store, "A", 10.0);
        add(&store, "B", -1.0);
        add(&store, "C", 1000.0);
        let monitor = Monitor::new(store.clone(), Arc::new(FixedDelays), 3);

        let report = monitor.run_pass().expect("pass");
        let names: Vec<&str> = report.verdicts.iter().map(|v| v.route.name.as_str()).collect();
        assert_eq!(names, vec!["A", "C"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].route_name, "B");
        assert_eq!(report.total(), 3);
    }

    #[test]
    fn test_failed_route_state_untouched() {
        let store = Arc::new(MemoryRouteStore::new());
        let failing = add(&store, "B", -1.0);
        let monitor = Monitor::new(store.clone(), Arc::new(FixedDelays), 1);

        monitor.run_pass().expect("pass");
        assert_eq!(store.get_route(failing.id).expect("get"), failing);
    }

    #[test]
    fn test_pass_commits_history_and_state() {
        let store = Arc::new(MemoryRouteStore::new());
        let route = add(&store, "C", 1000.0);
        let monitor = Monitor::new(store.clone(), Arc::new(FixedDelays), 2);

        let report = monitor.run_pass().expect("pass");
        assert!(report.verdicts[0].result.is_heavy);

        let stored = store.get_route(route.id).expect("get");
        assert_eq!(stored.history, vec![1000.0]);
        assert_eq!(stored.last_state, TrafficState::Heavy);
        assert_eq!(stored.revision, 1);
    }

    #[test]
    fn test_empty_store_is_an_empty_pass() {
        let monitor = Monitor::new(Arc::new(MemoryRouteStore::new()), Arc::new(FixedDelays), 4);
        assert_eq!(monitor.run_pass().expect("pass"), PassReport::default());
    }

    #[test]
    fn test_dispatch_without_channels_still_plans() {
        let store = Arc::new(MemoryRouteStore::new());
        add(&store, "C", 1000.0);
        let monitor = Monitor::new(store, Arc::new(FixedDelays), 1);
        let dispatcher = Dispatcher::new(SummaryComposer::deterministic(), push::DEFAULT_TITLE);

        let (_, dispatch) = run_cycle(&monitor, &dispatcher).expect("cycle");
        assert_eq!(dispatch.chat_routes, vec!["C".to_string()]);
        assert_eq!(dispatch.push_routes, vec!["C".to_string()]);
        assert!(!dispatch.chat_sent && !dispatch.push_sent);
        let message = dispatch.push_message.expect("push planned");
        assert_eq!(message.message, "Heavy traffic detected on C, current delay is 17 minutes.");
        assert_eq!(message.priority, 0);
    }
}
