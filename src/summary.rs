/// Push notification text.
///
/// Every push carries a deterministic summary built from the verdicts. When a
/// text generator is configured and the LLM balance allows it, the summary is
/// rewritten in the configured style within a bounded wait; any timeout,
/// error, or empty answer falls back to the deterministic text unchanged.

use crate::balance::BalanceTracker;
use crate::logging::{self, Component};
use crate::model::{RoutePriority, RouteVerdict, Transition, seconds_to_minutes};
use std::fmt;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_STYLE: &str = "concise radio traffic announcer";

// ---------------------------------------------------------------------------
// Text generation collaborator
// ---------------------------------------------------------------------------

/// Text returned by a generator, with the token counts it was billed for.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextGenError {
    Timeout,
    Http(u16),
    Transport(String),
    EmptyResponse,
    BudgetExhausted(String),
}

impl fmt::Display for TextGenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextGenError::Timeout => write!(f, "Text generation timed out"),
            TextGenError::Http(code) => write!(f, "Text generation HTTP error: {}", code),
            TextGenError::Transport(msg) => write!(f, "Text generation transport error: {}", msg),
            TextGenError::EmptyResponse => write!(f, "Text generation returned no text"),
            TextGenError::BudgetExhausted(msg) => write!(f, "LLM budget exhausted: {}", msg),
        }
    }
}

impl std::error::Error for TextGenError {}

/// Opaque, nondeterministic text source (an LLM in production).
pub trait TextGenerator: Send + Sync {
    fn generate(&self, prompt: &str, max_words: usize) -> Result<Generated, TextGenError>;
}

// ---------------------------------------------------------------------------
// Deterministic text
// ---------------------------------------------------------------------------

/// One sentence per route that has something to report.
pub fn route_sentence(verdict: &RouteVerdict) -> Option<String> {
    let name = &verdict.route.name;
    if verdict.result.is_heavy {
        Some(format!(
            "Heavy traffic detected on {}, current delay is {} minutes.",
            name,
            seconds_to_minutes(verdict.result.current_delay_sec)
        ))
    } else if verdict.result.transition == Transition::BecameNormal {
        Some(format!("You can expect normal travel times on {}.", name))
    } else if verdict.route.priority == RoutePriority::High {
        Some(format!("Traffic on {} is flowing normally.", name))
    } else {
        None
    }
}

pub fn fallback_summary(verdicts: &[&RouteVerdict]) -> String {
    verdicts
        .iter()
        .filter_map(|v| route_sentence(v))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn word_budget(route_count: usize) -> usize {
    8 * route_count + 20
}

pub fn build_prompt(style: &str, verdicts: &[&RouteVerdict], max_words: usize) -> String {
    let mut prompt = format!(
        "You are a {}. Rewrite the traffic report below as a short spoken update of at most {} words. \
         Mention every route by name. Keep the delay figures. Reply with the update text only.\n\nRoutes:\n",
        style, max_words
    );
    for v in verdicts {
        let state = if v.result.is_heavy { "heavy traffic" } else { "normal traffic" };
        let change = match v.result.transition {
            Transition::BecameHeavy => ", just became heavy",
            Transition::BecameNormal => ", just cleared",
            Transition::NoChangeHeavy | Transition::NoChangeNormal => "",
        };
        prompt.push_str(&format!(
            "- {}: {}{}, delay {} minutes\n",
            v.route.name,
            state,
            change,
            seconds_to_minutes(v.result.current_delay_sec)
        ));
    }
    prompt.push_str("\nFacts:\n");
    prompt.push_str(&fallback_summary(verdicts));
    prompt
}

/// Whether `text` names every route at least once (case-insensitive).
pub fn mentions_all_routes(text: &str, verdicts: &[&RouteVerdict]) -> bool {
    let lower = text.to_lowercase();
    verdicts
        .iter()
        .all(|v| lower.contains(&v.route.name.to_lowercase()))
}

// ---------------------------------------------------------------------------
// Composer
// ---------------------------------------------------------------------------

pub struct SummaryComposer {
    generator: Option<Arc<dyn TextGenerator>>,
    balance: Option<Arc<BalanceTracker>>,
    style: String,
    timeout: Duration,
}

impl SummaryComposer {
    /// A composer that always returns the deterministic text.
    pub fn deterministic() -> Self {
        Self {
            generator: None,
            balance: None,
            style: DEFAULT_STYLE.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn new(generator: Arc<dyn TextGenerator>, style: &str, timeout: Duration) -> Self {
        Self {
            generator: Some(generator),
            balance: None,
            style: style.to_string(),
            timeout,
        }
    }

    pub fn with_balance(mut self, balance: Arc<BalanceTracker>) -> Self {
        self.balance = Some(balance);
        self
    }

    /// Summary text for the routes selected for push.
    pub fn compose(&self, verdicts: &[&RouteVerdict]) -> String {
        let fallback = fallback_summary(verdicts);
        let generator = match &self.generator {
            Some(g) if !verdicts.is_empty() => Arc::clone(g),
            _ => return fallback,
        };

        match self.stylize(generator, verdicts) {
            Ok(text) => {
                if !mentions_all_routes(&text, verdicts) {
                    logging::warn(
                        Component::Llm,
                        None,
                        "Stylized summary does not mention every route",
                    );
                }
                text
            }
            Err(e) => {
                logging::warn(Component::Llm, None, &format!("Using plain summary: {}", e));
                fallback
            }
        }
    }

    fn stylize(
        &self,
        generator: Arc<dyn TextGenerator>,
        verdicts: &[&RouteVerdict],
    ) -> Result<String, TextGenError> {
        if let Some(balance) = &self.balance {
            balance.can_make_request().map_err(TextGenError::BudgetExhausted)?;
        }

        let max_words = word_budget(verdicts.len());
        let prompt = build_prompt(&self.style, verdicts, max_words);
        let balance = self.balance.clone();
        let (tx, rx) = mpsc::channel();

        // Detached: a late answer is still billed, then dropped.
        thread::spawn(move || {
            let result = generator.generate(&prompt, max_words);
            if let (Ok(generated), Some(balance)) = (&result, &balance) {
                balance.record_usage(generated.input_tokens, generated.output_tokens);
            }
            let _ = tx.send(result);
        });

        let generated = match rx.recv_timeout(self.timeout) {
            Ok(result) => result?,
            Err(mpsc::RecvTimeoutError::Timeout) => return Err(TextGenError::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(TextGenError::Transport("generator thread exited".into()));
            }
        };

        let text = generated.text.trim();
        if text.is_empty() {
            Err(TextGenError::EmptyResponse)
        } else {
            Ok(text.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::BalancePolicy;
    use crate::model::{Coordinate, EvaluationResult, Route, TrafficState};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn verdict(name: &str, priority: RoutePriority, is_heavy: bool, transition: Transition, delay: f64) -> RouteVerdict {
        RouteVerdict {
            route: Route {
                id: 1,
                name: name.to_string(),
                start: Coordinate::new(0.0, 0.0),
                end: Coordinate::new(0.1, 0.1),
                priority,
                last_state: TrafficState::Normal,
                history: vec![],
                revision: 0,
                last_checked: None,
            },
            result: EvaluationResult {
                current_delay_sec: delay,
                baseline_delay_sec: 0.0,
                is_heavy,
                route_level_heavy: is_heavy,
                transition,
                distance_km: 10.0,
                free_flow_sec: 600.0,
                live_sec: 600.0 + delay,
                heavy_segments: vec![],
            },
        }
    }

    struct Canned(Result<Generated, TextGenError>);

    impl TextGenerator for Canned {
        fn generate(&self, _prompt: &str, _max_words: usize) -> Result<Generated, TextGenError> {
            self.0.clone()
        }
    }

    struct Slow(Duration);

    impl TextGenerator for Slow {
        fn generate(&self, _prompt: &str, _max_words: usize) -> Result<Generated, TextGenError> {
            thread::sleep(self.0);
            Ok(Generated {
                text: "Late words about Highway-101".into(),
                input_tokens: 10,
                output_tokens: 10,
            })
        }
    }

    struct Counting(AtomicUsize);

    impl TextGenerator for Counting {
        fn generate(&self, _prompt: &str, _max_words: usize) -> Result<Generated, TextGenError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(TextGenError::Http(500))
        }
    }

    fn ok_text(text: &str) -> Canned {
        Canned(Ok(Generated {
            text: text.to_string(),
            input_tokens: 100,
            output_tokens: 40,
        }))
    }

    // --- Deterministic text -------------------------------------------------

    #[test]
    fn test_fallback_sentences() {
        let heavy = verdict("Highway-101", RoutePriority::High, true, Transition::BecameHeavy, 301.0);
        let cleared = verdict("Main-Street", RoutePriority::Normal, false, Transition::BecameNormal, 30.0);
        let text = fallback_summary(&[&heavy, &cleared]);
        assert_eq!(
            text,
            "Heavy traffic detected on Highway-101, current delay is 5 minutes. \
             You can expect normal travel times on Main-Street."
        );
    }

    #[test]
    fn test_fallback_covers_quiet_high_priority_route() {
        let quiet = verdict("Ring-Road", RoutePriority::High, false, Transition::NoChangeNormal, 0.0);
        assert_eq!(fallback_summary(&[&quiet]), "Traffic on Ring-Road is flowing normally.");
    }

    #[test]
    fn test_word_budget() {
        assert_eq!(word_budget(1), 28);
        assert_eq!(word_budget(3), 44);
    }

    #[test]
    fn test_prompt_carries_style_budget_and_every_route() {
        let a = verdict("Highway-101", RoutePriority::High, true, Transition::BecameHeavy, 301.0);
        let b = verdict("Main-Street", RoutePriority::Normal, false, Transition::BecameNormal, 30.0);
        let prompt = build_prompt("pirate", &[&a, &b], 36);
        assert!(prompt.contains("pirate"));
        assert!(prompt.contains("36 words"));
        assert!(prompt.contains("Highway-101") && prompt.contains("Main-Street"));
    }

    // --- Composer -----------------------------------------------------------

    #[test]
    fn test_no_generator_uses_fallback() {
        let v = verdict("Highway-101", RoutePriority::High, true, Transition::BecameHeavy, 301.0);
        let composer = SummaryComposer::deterministic();
        assert_eq!(composer.compose(&[&v]), fallback_summary(&[&v]));
    }

    #[test]
    fn test_generated_text_is_used() {
        let v = verdict("Highway-101", RoutePriority::High, true, Transition::BecameHeavy, 301.0);
        let composer = SummaryComposer::new(
            Arc::new(ok_text("  Highway-101 is crawling, five minutes extra.  ")),
            DEFAULT_STYLE,
            Duration::from_secs(5),
        );
        let text = composer.compose(&[&v]);
        assert_eq!(text, "Highway-101 is crawling, five minutes extra.");
        assert!(mentions_all_routes(&text, &[&v]));
    }

    #[test]
    fn test_error_and_empty_answers_fall_back() {
        let v = verdict("Highway-101", RoutePriority::High, true, Transition::BecameHeavy, 301.0);
        for generator in [Canned(Err(TextGenError::Http(529))), ok_text("   ")] {
            let composer = SummaryComposer::new(Arc::new(generator), DEFAULT_STYLE, Duration::from_secs(5));
            assert_eq!(composer.compose(&[&v]), fallback_summary(&[&v]));
        }
    }

    #[test]
    fn test_timeout_returns_fallback() {
        let v = verdict("Highway-101", RoutePriority::High, true, Transition::BecameHeavy, 301.0);
        let composer = SummaryComposer::new(
            Arc::new(Slow(Duration::from_millis(500))),
            DEFAULT_STYLE,
            Duration::from_millis(50),
        );
        assert_eq!(composer.compose(&[&v]), fallback_summary(&[&v]));
    }

    #[test]
    fn test_exhausted_balance_skips_generator() {
        let v = verdict("Highway-101", RoutePriority::High, true, Transition::BecameHeavy, 301.0);
        let generator = Arc::new(Counting(AtomicUsize::new(0)));
        let broke = BalanceTracker::in_memory(BalancePolicy {
            starting_balance: Decimal::new(10, 2),
            ..BalancePolicy::default()
        });
        let composer = SummaryComposer::new(generator.clone(), DEFAULT_STYLE, Duration::from_secs(5))
            .with_balance(Arc::new(broke));

        assert_eq!(composer.compose(&[&v]), fallback_summary(&[&v]));
        assert_eq!(generator.0.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_successful_generation_is_billed() {
        let v = verdict("Highway-101", RoutePriority::High, true, Transition::BecameHeavy, 301.0);
        let balance = Arc::new(BalanceTracker::in_memory(BalancePolicy::default()));
        let composer = SummaryComposer::new(Arc::new(ok_text("Highway-101 slow")), DEFAULT_STYLE, Duration::from_secs(5))
            .with_balance(balance.clone());

        composer.compose(&[&v]);
        assert_eq!(balance.snapshot().requests, 1);
    }
}
