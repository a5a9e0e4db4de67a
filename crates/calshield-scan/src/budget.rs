//! Per-rule wall-clock budget.
//!
//! Every detection rule gets [`RULE_BUDGET_MS`] of wall time. Rules check
//! the budget cooperatively between matches; an overrunning rule stops
//! early and keeps whatever detections it has already produced.

use std::time::{Duration, Instant};

use calshield_types::scan::RULE_BUDGET_MS;

pub(crate) struct RuleBudget {
    deadline: Instant,
}

impl RuleBudget {
    pub(crate) fn start() -> Self {
        Self {
            deadline: Instant::now() + Duration::from_millis(RULE_BUDGET_MS),
        }
    }

    pub(crate) fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}
