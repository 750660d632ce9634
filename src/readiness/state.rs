//! Decides what should happen to a rule's taint on one node.
//!
//! The decision is pure; committing it is a separate step. Taint changes are written first and the
//! bootstrap completion marker second, and both steps are idempotent, so a crash between them is
//! repaired by the next evaluation: with the taint already gone and no marker, it decides to mark again.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::resources::nodereadinessrules::EnforcementMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaintAction {
    Add,
    Remove,
    Keep,
}

#[derive(Clone, Copy, Debug)]
pub struct DecisionInput {
    pub mode: EnforcementMode,
    pub all_satisfied: bool,
    pub has_taint: bool,
    /// Bootstrap completion marker; ignored in continuous mode
    pub completed: bool,
    pub grace_period: Option<Duration>,
    /// First time the conditions were seen unsatisfied, from the previous evaluation
    pub unsatisfied_since: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaintDecision {
    pub action: TaintAction,
    /// Set the bootstrap completion marker once the taint action is committed
    pub mark_completed: bool,
    /// The taint is due but held back by the grace period for this much longer
    pub grace_remaining: Option<Duration>,
    /// Value to persist as the new start of the unsatisfied period
    pub unsatisfied_since: Option<DateTime<Utc>>,
}

impl TaintDecision {
    fn keep() -> Self {
        TaintDecision {
            action: TaintAction::Keep,
            mark_completed: false,
            grace_remaining: None,
            unsatisfied_since: None,
        }
    }

    /// Whether the taint is present once this decision has been applied
    pub fn taint_after(&self, has_taint: bool) -> bool {
        match self.action {
            TaintAction::Add => true,
            TaintAction::Remove => false,
            TaintAction::Keep => has_taint,
        }
    }
}

pub fn decide(input: DecisionInput) -> TaintDecision {
    let bootstrap = input.mode == EnforcementMode::BootstrapOnly;

    // A completed bootstrap-only rule never touches the node again.
    if bootstrap && input.completed {
        return TaintDecision::keep();
    }

    if input.all_satisfied {
        return TaintDecision {
            action: if input.has_taint {
                TaintAction::Remove
            } else {
                TaintAction::Keep
            },
            mark_completed: bootstrap,
            grace_remaining: None,
            unsatisfied_since: None,
        };
    }

    let since = input.unsatisfied_since.unwrap_or(input.now);
    let mut decision = TaintDecision {
        unsatisfied_since: Some(since),
        ..TaintDecision::keep()
    };

    if input.has_taint {
        return decision;
    }

    match input.grace_period.filter(|g| !g.is_zero()) {
        None => decision.action = TaintAction::Add,
        Some(grace) => {
            let elapsed = (input.now - since).to_std().unwrap_or(Duration::ZERO);
            if elapsed >= grace {
                decision.action = TaintAction::Add;
            } else {
                decision.grace_remaining = Some(grace - elapsed);
            }
        }
    }

    decision
}
