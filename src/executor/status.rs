//! Per-node status and apply results.

use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::planner::{ChangeAction, PlannedChange};
use crate::state::StateDelta;

/// Lifecycle of one resource during an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for dependencies.
    Pending,
    /// Provider calls under way.
    InProgress,
    /// Applied and committed.
    Succeeded,
    /// Started and failed.
    Failed,
    /// Never started: a dependency did not succeed, or the apply was cancelled.
    Skipped,
}

impl NodeStatus {
    /// Returns true for the three end states.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress | Self::Skipped)
                | (Self::InProgress, Self::Succeeded | Self::Failed)
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Final report for one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutcome {
    /// Resource id.
    pub id: String,
    /// Planned action.
    pub action: ChangeAction,
    /// Final status.
    pub status: NodeStatus,
    /// Failure or skip reason.
    pub error: Option<String>,
    /// Provider call attempts, summed over every step.
    pub attempts: u32,
    /// Time spent in progress, in milliseconds.
    pub elapsed_ms: u64,
}

impl NodeOutcome {
    pub(crate) fn pending(change: &PlannedChange) -> Self {
        Self {
            id: change.id.clone(),
            action: change.action,
            status: NodeStatus::Pending,
            error: None,
            attempts: 0,
            elapsed_ms: 0,
        }
    }

    /// Moves to `next` if the state machine allows it.
    pub(crate) fn transition(&mut self, next: NodeStatus) {
        if self.status.can_become(next) {
            debug!("{}: {} -> {next}", self.id, self.status);
            self.status = next;
        } else {
            debug!("{}: ignoring transition {} -> {next}", self.id, self.status);
        }
    }

    /// Outcome for a change whose task never reported back.
    pub(crate) fn aborted(change: &PlannedChange, message: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Failed,
            error: Some(message.into()),
            ..Self::pending(change)
        }
    }

    pub(crate) fn finish(&mut self, next: NodeStatus, error: Option<String>, elapsed: Duration) {
        self.transition(next);
        self.error = error;
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    }
}

/// Result of applying a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyResult {
    /// One outcome per planned change, in plan order.
    pub outcomes: Vec<NodeOutcome>,
    /// State deltas that reached the store, in commit order.
    pub deltas: Vec<StateDelta>,
    /// Wall-clock duration of the apply, in milliseconds.
    pub elapsed_ms: u64,
    /// Whether the apply was cancelled.
    pub cancelled: bool,
    /// State store failure that stopped the apply, if any.
    pub fatal_error: Option<String>,
}

impl ApplyResult {
    /// Returns true if every change succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.fatal_error.is_none()
            && self
                .outcomes
                .iter()
                .all(|o| o.status == NodeStatus::Succeeded)
    }

    /// Returns the outcome for `id`.
    #[must_use]
    pub fn outcome(&self, id: &str) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    /// Number of outcomes with `status`.
    #[must_use]
    pub fn count(&self, status: NodeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Outcomes that failed or were skipped.
    #[must_use]
    pub fn failures(&self) -> Vec<&NodeOutcome> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, NodeStatus::Failed | NodeStatus::Skipped))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine() {
        assert!(NodeStatus::Pending.can_become(NodeStatus::InProgress));
        assert!(NodeStatus::Pending.can_become(NodeStatus::Skipped));
        assert!(NodeStatus::InProgress.can_become(NodeStatus::Failed));
        assert!(!NodeStatus::Pending.can_become(NodeStatus::Succeeded));
        assert!(!NodeStatus::Succeeded.can_become(NodeStatus::Failed));
        assert!(!NodeStatus::InProgress.can_become(NodeStatus::Skipped));
        assert!(NodeStatus::Skipped.is_terminal());
        assert!(!NodeStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_status_serialises_snake_case() {
        assert_eq!(serde_json::to_value(NodeStatus::InProgress).unwrap(), "in_progress");
    }
}
