//! LLM spend tracking.
//!
//! Every stylized summary costs money. The tracker holds the estimated
//! remaining balance as an explicit state record, is owned by the service,
//! and is handed to the summary composer as an `Arc`. When the usable balance
//! drops under the disable threshold, summaries fall back to the
//! deterministic text.
//!
//! The state record is persisted through the store's config record under
//! `BALANCE_CONFIG_KEY` so the CLI and the daemon see the same figure.
//! Crossing the alert or disable threshold posts one chat notice.

use crate::logging::{self, Component};
use crate::model::StoreError;
use crate::notify::chat::{ChatChannel, ChatNotice};
use crate::store::{ConfigStore, lock_recovering};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

pub const BALANCE_CONFIG_KEY: &str = "llm_balance";

// ---------------------------------------------------------------------------
// Policy & state
// ---------------------------------------------------------------------------

/// Pricing and guard rails, from the `[balance]` config section.
#[derive(Debug, Clone, PartialEq)]
pub struct BalancePolicy {
    pub starting_balance: Decimal,
    /// Share of the balance never spent, in percent.
    pub buffer_percent: u32,
    pub alert_threshold: Decimal,
    pub disable_threshold: Decimal,
    pub input_cost_per_1k: Decimal,
    pub output_cost_per_1k: Decimal,
}

impl Default for BalancePolicy {
    fn default() -> Self {
        Self {
            starting_balance: Decimal::new(500, 2),
            buffer_percent: 10,
            alert_threshold: Decimal::new(100, 2),
            disable_threshold: Decimal::new(50, 2),
            input_cost_per_1k: Decimal::new(3, 3),
            output_cost_per_1k: Decimal::new(15, 3),
        }
    }
}

/// The persisted balance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceState {
    pub current_balance: Decimal,
    pub total_spent: Decimal,
    pub requests: u64,
    pub last_updated: DateTime<Utc>,
}

impl BalanceState {
    pub fn starting(balance: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            current_balance: balance,
            total_spent: Decimal::ZERO,
            requests: 0,
            last_updated: now,
        }
    }
}

/// Derived view for display and gating.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceStatus {
    pub current_balance: Decimal,
    pub usable_balance: Decimal,
    pub buffer_percent: u32,
    pub below_alert: bool,
    pub below_disable: bool,
    pub balance_available: bool,
    pub requests: u64,
    pub total_spent: Decimal,
}

impl BalanceStatus {
    pub fn can_make_request(&self) -> Result<(), String> {
        if !self.balance_available {
            Err("No balance available".to_string())
        } else if self.below_disable {
            Err(format!(
                "Usable balance ${} is below the disable threshold",
                self.usable_balance.round_dp(2)
            ))
        } else {
            Ok(())
        }
    }
}

/// Cost of one request, rounded to six decimal places.
pub fn request_cost(policy: &BalancePolicy, input_tokens: u32, output_tokens: u32) -> Decimal {
    let thousand = Decimal::from(1000);
    let input = Decimal::from(input_tokens) / thousand * policy.input_cost_per_1k;
    let output = Decimal::from(output_tokens) / thousand * policy.output_cost_per_1k;
    (input + output).round_dp(6)
}

pub fn status_of(policy: &BalancePolicy, state: &BalanceState) -> BalanceStatus {
    let hundred = Decimal::from(100);
    let buffer = Decimal::from(policy.buffer_percent.min(100));
    let usable = state.current_balance * (hundred - buffer) / hundred;

    BalanceStatus {
        current_balance: state.current_balance,
        usable_balance: usable,
        buffer_percent: policy.buffer_percent,
        below_alert: usable < policy.alert_threshold,
        below_disable: usable < policy.disable_threshold,
        balance_available: usable > Decimal::ZERO,
        requests: state.requests,
        total_spent: state.total_spent,
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

const BILLING_LINK: &str = "[Console Balance & Usage](https://console.anthropic.com/account/billing)";

/// Chat notice for the first crossing of the alert or disable threshold.
/// `None` when no threshold was crossed downwards.
pub fn threshold_notice(
    before: &BalanceStatus,
    after: &BalanceStatus,
    now: DateTime<Utc>,
) -> Option<ChatNotice> {
    let critical = after.below_disable && !before.below_disable;
    if !critical && !(after.below_alert && !before.below_alert) {
        return None;
    }

    let (level, title) = if critical {
        ("🚨", "CRITICAL")
    } else {
        ("⚠️", "LOW")
    };
    let usage_line = if after.below_disable {
        "🔴 **LLM usage disabled - balance too low**"
    } else {
        "🟡 **LLM usage still active**"
    };

    Some(ChatNotice {
        title: format!("{} Claude Console Balance {} {}", level, title, level),
        body: format!(
            "**Estimated Balance:** ${}\n**Usable Balance:** ${} ({}% buffer)\n\n\
             **Usage:** {} requests, ${} spent\n\n{}\n\n{}",
            after.current_balance.round_dp(2),
            after.usable_balance.round_dp(2),
            after.buffer_percent,
            after.requests,
            after.total_spent.round_dp(4),
            usage_line,
            BILLING_LINK
        ),
        critical,
        sent_at: now,
    })
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// With a ledger, the stored record is the source of truth: every read goes
/// back to it and every write is a read-modify-write, so the daemon and the
/// CLI never overwrite each other's changes. `cached` is the last figure seen
/// and only answers while the ledger is unreachable.
pub struct BalanceTracker {
    policy: BalancePolicy,
    cached: Mutex<BalanceState>,
    ledger: Option<Arc<dyn ConfigStore>>,
    alerts: Option<Arc<dyn ChatChannel>>,
}

impl BalanceTracker {
    /// A tracker that lives only as long as the process.
    pub fn in_memory(policy: BalancePolicy) -> Self {
        let state = BalanceState::starting(policy.starting_balance, Utc::now());
        Self {
            policy,
            cached: Mutex::new(state),
            ledger: None,
            alerts: None,
        }
    }

    /// Loads the persisted record, initialising it from the policy's
    /// starting balance on first use.
    pub fn load(policy: BalancePolicy, ledger: Arc<dyn ConfigStore>) -> Result<Self, StoreError> {
        let state = match read_state(ledger.as_ref())? {
            Some(state) => state,
            None => {
                let starting = policy.starting_balance;
                let fresh = ledger.update_config(BALANCE_CONFIG_KEY, &mut |current| match current {
                    Some(existing) => Ok(existing),
                    None => encode_state(&BalanceState::starting(starting, Utc::now())),
                })?;
                let fresh = decode_state(fresh)?;
                logging::info(
                    Component::Llm,
                    None,
                    &format!("Initialised LLM balance at ${}", fresh.current_balance),
                );
                fresh
            }
        };

        Ok(Self {
            policy,
            cached: Mutex::new(state),
            ledger: Some(ledger),
            alerts: None,
        })
    }

    /// Posts a notice to `channel` when usage first takes the balance under
    /// the alert or disable threshold.
    pub fn with_alerts(mut self, channel: Arc<dyn ChatChannel>) -> Self {
        self.alerts = Some(channel);
        self
    }

    pub fn policy(&self) -> &BalancePolicy {
        &self.policy
    }

    /// Current record, re-read from the ledger when there is one.
    pub fn snapshot(&self) -> BalanceState {
        if let Some(ledger) = &self.ledger {
            match read_state(ledger.as_ref()) {
                Ok(Some(state)) => {
                    *lock_recovering(&self.cached) = state.clone();
                    return state;
                }
                Ok(None) => {}
                Err(e) => logging::warn(
                    Component::Store,
                    None,
                    &format!("Failed to read LLM balance, using last known figure: {}", e),
                ),
            }
        }
        lock_recovering(&self.cached).clone()
    }

    pub fn status(&self) -> BalanceStatus {
        status_of(&self.policy, &self.snapshot())
    }

    pub fn can_make_request(&self) -> Result<(), String> {
        self.status().can_make_request()
    }

    /// Deducts the cost of one request and persists the new record.
    /// Persistence failures are logged; the in-memory figure still moves.
    pub fn record_usage(&self, input_tokens: u32, output_tokens: u32) -> Decimal {
        let cost = request_cost(&self.policy, input_tokens, output_tokens);
        let (before, after) = self.update(|state| {
            state.current_balance -= cost;
            state.total_spent += cost;
            state.requests += 1;
        });

        logging::info(
            Component::Llm,
            None,
            &format!(
                "Tracked usage: {}in/{}out tokens, cost: ${} (balance ${})",
                input_tokens,
                output_tokens,
                cost,
                after.current_balance.round_dp(4)
            ),
        );

        let before = status_of(&self.policy, &before);
        let after = status_of(&self.policy, &after);
        if after.below_alert {
            logging::warn(
                Component::Llm,
                None,
                &format!("LLM balance low: ${} usable", after.usable_balance.round_dp(2)),
            );
        }
        if let Some(notice) = threshold_notice(&before, &after, Utc::now()) {
            self.send_notice(&notice);
        }
        cost
    }

    /// Replaces the balance with a new total, e.g. after a console top-up.
    pub fn top_up(&self, new_total: Decimal) -> BalanceState {
        self.update(|state| state.current_balance = new_total).1
    }

    fn send_notice(&self, notice: &ChatNotice) {
        let Some(channel) = &self.alerts else {
            return;
        };
        match channel.send_notice(notice) {
            Ok(()) => logging::info(Component::Notify, None, &format!("Sent balance alert: {}", notice.title)),
            Err(e) => logging::error(Component::Notify, None, &format!("Balance alert failed: {}", e)),
        }
    }

    /// Applies `apply` to the current record. Returns the record before and
    /// after the change.
    fn update(&self, apply: impl Fn(&mut BalanceState)) -> (BalanceState, BalanceState) {
        let Some(ledger) = &self.ledger else {
            return self.update_cached(&apply);
        };

        let starting = self.policy.starting_balance;
        let mut before = None;
        let result = ledger
            .update_config(BALANCE_CONFIG_KEY, &mut |current| {
                let mut state = match current {
                    Some(value) => decode_state(value)?,
                    None => BalanceState::starting(starting, Utc::now()),
                };
                before = Some(state.clone());
                apply(&mut state);
                state.last_updated = Utc::now();
                encode_state(&state)
            })
            .and_then(decode_state);

        match result {
            Ok(after) => {
                *lock_recovering(&self.cached) = after.clone();
                (before.unwrap_or_else(|| after.clone()), after)
            }
            Err(e) => {
                logging::error(Component::Store, None, &format!("Failed to persist LLM balance: {}", e));
                self.update_cached(&apply)
            }
        }
    }

    fn update_cached(&self, apply: &impl Fn(&mut BalanceState)) -> (BalanceState, BalanceState) {
        let mut guard = lock_recovering(&self.cached);
        let before = guard.clone();
        apply(&mut guard);
        guard.last_updated = Utc::now();
        (before, guard.clone())
    }
}

fn read_state(ledger: &dyn ConfigStore) -> Result<Option<BalanceState>, StoreError> {
    ledger.get_config(BALANCE_CONFIG_KEY)?.map(decode_state).transpose()
}

fn decode_state(value: serde_json::Value) -> Result<BalanceState, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt(format!("{}: {}", BALANCE_CONFIG_KEY, e)))
}

fn encode_state(state: &BalanceState) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(state).map_err(|e| StoreError::Corrupt(format!("{}: {}", BALANCE_CONFIG_KEY, e)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NotifyError;
    use crate::notify::chat::ChatAlert;
    use crate::store::memory::MemoryRouteStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn dollars(s: &str) -> Decimal {
        s.parse().expect("valid decimal literal")
    }

    #[derive(Default)]
    struct RecordingChat {
        notices: Mutex<Vec<ChatNotice>>,
    }

    impl ChatChannel for RecordingChat {
        fn send(&self, _alert: &ChatAlert) -> Result<(), NotifyError> {
            Ok(())
        }

        fn send_notice(&self, notice: &ChatNotice) -> Result<(), NotifyError> {
            self.notices.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    /// Memory ledger that can be switched off to simulate a database outage.
    #[derive(Default)]
    struct FlakyLedger {
        inner: MemoryRouteStore,
        down: AtomicBool,
    }

    impl FlakyLedger {
        fn check(&self) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                Err(StoreError::Database("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    impl ConfigStore for FlakyLedger {
        fn get_config(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
            self.check()?;
            self.inner.get_config(key)
        }

        fn set_config(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
            self.check()?;
            self.inner.set_config(key, value)
        }

        fn update_config(
            &self,
            key: &str,
            apply: &mut dyn FnMut(Option<serde_json::Value>) -> Result<serde_json::Value, StoreError>,
        ) -> Result<serde_json::Value, StoreError> {
            self.check()?;
            self.inner.update_config(key, apply)
        }
    }

    #[test]
    fn test_request_cost() {
        let policy = BalancePolicy::default();
        // 1000 in × 0.003 + 500 out × 0.015 / 1000 = 0.003 + 0.0075
        assert_eq!(request_cost(&policy, 1000, 500), dollars("0.0105"));
        assert_eq!(request_cost(&policy, 0, 0), Decimal::ZERO);
    }

    #[test]
    fn test_usable_balance_reserves_buffer() {
        let policy = BalancePolicy::default();
        let status = status_of(&policy, &BalanceState::starting(dollars("5.00"), Utc::now()));
        assert_eq!(status.usable_balance, dollars("4.5"));
        assert!(!status.below_alert);
        assert!(status.can_make_request().is_ok());
    }

    #[test]
    fn test_low_balance_disables_requests() {
        let policy = BalancePolicy::default();
        // 0.50 × 0.9 = 0.45 usable, under the 0.50 disable threshold
        let status = status_of(&policy, &BalanceState::starting(dollars("0.50"), Utc::now()));
        assert!(status.below_alert);
        assert!(status.below_disable);
        assert!(status.can_make_request().is_err());

        let empty = status_of(&policy, &BalanceState::starting(Decimal::ZERO, Utc::now()));
        assert_eq!(empty.can_make_request(), Err("No balance available".to_string()));
    }

    #[test]
    fn test_record_usage_deducts_and_counts() {
        let tracker = BalanceTracker::in_memory(BalancePolicy::default());
        let cost = tracker.record_usage(2000, 1000);
        assert_eq!(cost, dollars("0.021"));
        let state = tracker.snapshot();
        assert_eq!(state.current_balance, dollars("4.979"));
        assert_eq!(state.total_spent, dollars("0.021"));
        assert_eq!(state.requests, 1);
    }

    #[test]
    fn test_state_persists_through_ledger() {
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryRouteStore::new());
        let tracker = BalanceTracker::load(BalancePolicy::default(), store.clone()).expect("load");
        tracker.record_usage(1000, 0);
        tracker.top_up(dollars("12.00"));

        let reloaded = BalanceTracker::load(BalancePolicy::default(), store).expect("reload");
        assert_eq!(reloaded.snapshot().current_balance, dollars("12.00"));
        assert_eq!(reloaded.snapshot().requests, 1);
    }

    #[test]
    fn test_top_up_from_another_tracker_is_not_overwritten() {
        let store: Arc<dyn ConfigStore> = Arc::new(MemoryRouteStore::new());
        let daemon = BalanceTracker::load(BalancePolicy::default(), store.clone()).expect("load");
        daemon.top_up(dollars("0.40"));
        assert!(daemon.can_make_request().is_err());

        let cli = BalanceTracker::load(BalancePolicy::default(), store.clone()).expect("load");
        cli.top_up(dollars("20.00"));

        assert!(daemon.can_make_request().is_ok(), "daemon sees the top-up");
        daemon.record_usage(1000, 1000);

        let persisted = BalanceTracker::load(BalancePolicy::default(), store).expect("reload");
        assert_eq!(persisted.snapshot().current_balance, dollars("19.982"));
        assert_eq!(cli.snapshot().current_balance, dollars("19.982"));
    }

    #[test]
    fn test_ledger_outage_falls_back_to_last_known_figure() {
        let ledger = Arc::new(FlakyLedger::default());
        let tracker = BalanceTracker::load(BalancePolicy::default(), ledger.clone()).expect("load");

        ledger.down.store(true, Ordering::SeqCst);
        tracker.record_usage(1000, 1000);
        assert_eq!(tracker.snapshot().current_balance, dollars("4.982"));
        assert!(tracker.can_make_request().is_ok());

        ledger.down.store(false, Ordering::SeqCst);
        assert_eq!(tracker.snapshot().current_balance, dollars("5.00"), "ledger is authoritative again");
    }

    #[test]
    fn test_threshold_notice_on_first_crossing_only() {
        let policy = BalancePolicy {
            starting_balance: dollars("1.20"),
            ..BalancePolicy::default()
        };
        let chat = Arc::new(RecordingChat::default());
        let tracker = BalanceTracker::in_memory(policy).with_alerts(chat.clone());

        // 10k output tokens cost 0.15. Usable is 90% of the balance.
        tracker.record_usage(0, 10_000); // 1.05 -> 0.945 usable, under 1.00
        tracker.record_usage(0, 10_000); // 0.90 -> 0.81
        tracker.record_usage(0, 20_000); // 0.60 -> 0.54
        tracker.record_usage(0, 10_000); // 0.45 -> 0.405, under 0.50
        tracker.record_usage(0, 10_000); // 0.30

        let notices = chat.notices.lock().unwrap();
        assert_eq!(notices.len(), 2);
        assert!(!notices[0].critical);
        assert!(notices[0].title.contains("LOW"));
        assert!(notices[0].body.contains("**Estimated Balance:** $1.05"));
        assert!(notices[0].body.contains("LLM usage still active"));
        assert!(notices[1].critical);
        assert!(notices[1].title.contains("CRITICAL"));
        assert!(notices[1].body.contains("LLM usage disabled - balance too low"));
    }

    #[test]
    fn test_threshold_notice_only_on_downward_crossing() {
        let policy = BalancePolicy::default();
        let high = status_of(&policy, &BalanceState::starting(dollars("5.00"), Utc::now()));
        let low = status_of(&policy, &BalanceState::starting(dollars("1.00"), Utc::now()));
        let empty = status_of(&policy, &BalanceState::starting(dollars("0.10"), Utc::now()));

        assert!(threshold_notice(&high, &high, Utc::now()).is_none());
        assert!(threshold_notice(&low, &low, Utc::now()).is_none());
        assert!(threshold_notice(&empty, &high, Utc::now()).is_none(), "top-up is not an alert");

        let straight_down = threshold_notice(&high, &empty, Utc::now()).expect("crossed both");
        assert!(straight_down.critical);
    }
}
