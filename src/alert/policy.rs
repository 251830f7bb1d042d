//! Which evaluated routes are worth surfacing, and where.
//!
//! Two independent decisions per pass:
//! - chat: every route whose state flipped, priority-agnostic;
//! - push/LLM summary: High-priority routes always, Normal-priority routes
//!   only while heavy or on the cycle they recover.
//!
//! Both lists keep the input order.

use crate::model::{RoutePriority, RouteVerdict, Transition};

/// Routes selected for each downstream channel, borrowed from the pass's
/// verdict list.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationPlan<'a> {
    pub chat_routes: Vec<&'a RouteVerdict>,
    pub push_routes: Vec<&'a RouteVerdict>,
}

impl NotificationPlan<'_> {
    /// No chat alert is sent when this is false.
    pub fn has_chat(&self) -> bool {
        !self.chat_routes.is_empty()
    }

    /// The push/LLM step is skipped entirely when this is false.
    pub fn has_push(&self) -> bool {
        !self.push_routes.is_empty()
    }
}

pub fn is_chat_worthy(verdict: &RouteVerdict) -> bool {
    verdict.result.transition.is_change()
}

pub fn is_push_worthy(verdict: &RouteVerdict) -> bool {
    match verdict.route.priority {
        RoutePriority::High => true,
        RoutePriority::Normal => {
            verdict.result.is_heavy || verdict.result.transition == Transition::BecameNormal
        }
    }
}

pub fn decide(verdicts: &[RouteVerdict]) -> NotificationPlan<'_> {
    NotificationPlan {
        chat_routes: verdicts.iter().filter(|v| is_chat_worthy(v)).collect(),
        push_routes: verdicts.iter().filter(|v| is_push_worthy(v)).collect(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
