//! Plan types and ordering.
//!
//! A plan holds exactly one change per resource in the union of the desired
//! graph and the prior state. Non-delete changes come first in dependency
//! order; deletes follow in reverse dependency order of the prior state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::{ConfigHasher, ReplaceStrategy};
use crate::model::{ResourceGraph, ResourceNode, topological_sort};
use crate::state::{StateRecord, StateSnapshot};

use super::diff::{DiffResult, ResourceDiff};

/// What the executor will do to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
    /// Create a resource that has no state record.
    Create,
    /// Update a resource in place.
    Update,
    /// Destroy and recreate a resource.
    Replace,
    /// Destroy a resource that left the stack.
    Delete,
    /// Leave the resource untouched.
    NoOp,
}

/// A single planned change.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedChange {
    /// Resource id.
    pub id: String,
    /// Action to take.
    pub action: ChangeAction,
    /// Why the action was chosen.
    pub reason: String,
    /// Desired node; `None` for deletes.
    pub node: Option<ResourceNode>,
    /// Prior record; `None` for creates.
    pub prior: Option<StateRecord>,
    /// Content hash of the desired node; `None` for deletes.
    pub new_hash: Option<String>,
    /// Properties whose value differs from the prior record.
    pub changed_properties: Vec<String>,
    /// Ordering of a replacement; set only for replaces.
    pub replace_strategy: Option<ReplaceStrategy>,
}

/// Machine-readable summary line of a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSummary {
    /// Resource id.
    pub id: String,
    /// Action to take.
    pub action: ChangeAction,
    /// Why the action was chosen.
    pub reason: String,
}

/// An ordered, fingerprinted execution plan.
#[derive(Debug, Clone)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Changes in execution order.
    pub changes: Vec<PlannedChange>,
    /// SHA-256 over the ordered changes.
    pub fingerprint: String,
}

impl PlannedChange {
    /// Resource type the change acts on: desired type, or prior type for deletes.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        self.node
            .as_ref()
            .map(|n| n.resource_type.as_str())
            .or_else(|| self.prior.as_ref().map(|p| p.resource_type.as_str()))
            .unwrap_or_default()
    }

    /// Ids this change must wait for in the desired graph.
    #[must_use]
    pub fn depends_on(&self) -> BTreeSet<String> {
        match (&self.node, &self.prior) {
            (Some(node), _) => node.depends_on.clone(),
            (None, Some(prior)) => prior.depends_on.clone(),
            (None, None) => BTreeSet::new(),
        }
    }

    /// Returns the summary line.
    #[must_use]
    pub fn summary(&self) -> ChangeSummary {
        ChangeSummary {
            id: self.id.clone(),
            action: self.action,
            reason: self.reason.clone(),
        }
    }

    /// Returns a human-readable description of the change.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            ChangeAction::Create => format!("Create {} '{}'", self.resource_type(), self.id),
            ChangeAction::Update => format!("Update {} '{}'", self.resource_type(), self.id),
            ChangeAction::Replace => format!("Replace {} '{}'", self.resource_type(), self.id),
            ChangeAction::Delete => format!("Delete {} '{}'", self.resource_type(), self.id),
            ChangeAction::NoOp => format!("No change for '{}'", self.id),
        }
    }

    fn from_diff(diff: &ResourceDiff, node: Option<&ResourceNode>, prior: Option<&StateRecord>) -> Self {
        Self {
            id: diff.id.clone(),
            action: diff.action,
            reason: diff.reason.clone(),
            node: node.cloned(),
            prior: prior.cloned(),
            new_hash: diff.new_hash.clone(),
            changed_properties: diff.changed_properties.clone(),
            replace_strategy: diff.replace_strategy,
        }
    }
}

impl Plan {
    /// Orders a diff into a plan.
    ///
    /// Non-delete changes follow the graph's topological order. Deletes follow
    /// the reverse topological order of the prior records' dependencies.
    #[must_use]
    pub fn from_diff(diff: &DiffResult, graph: &ResourceGraph, prior: &StateSnapshot) -> Self {
        let by_id: BTreeMap<&str, &ResourceDiff> = diff.diffs.iter().map(|d| (d.id.as_str(), d)).collect();
        let mut changes = Vec::with_capacity(diff.diffs.len());

        for id in graph.topological_order() {
            if let Some(d) = by_id.get(id) {
                changes.push(PlannedChange::from_diff(d, graph.node(id), prior.get(id)));
            }
        }

        for id in delete_order(diff, prior) {
            if let Some(d) = by_id.get(id) {
                changes.push(PlannedChange::from_diff(d, None, prior.get(id)));
            }
        }

        let fingerprint = fingerprint(&changes);
        Self {
            created_at: Utc::now(),
            changes,
            fingerprint,
        }
    }

    /// Returns true if every change is a no-op.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.iter().all(|c| c.action == ChangeAction::NoOp)
    }

    /// Returns the change for `id`.
    #[must_use]
    pub fn change(&self, id: &str) -> Option<&PlannedChange> {
        self.changes.iter().find(|c| c.id == id)
    }

    /// Returns the ordered `(id, action)` pairs.
    #[must_use]
    pub fn actions(&self) -> Vec<(&str, ChangeAction)> {
        self.changes.iter().map(|c| (c.id.as_str(), c.action)).collect()
    }

    /// Returns the machine-readable summary.
    #[must_use]
    pub fn summary(&self) -> Vec<ChangeSummary> {
        self.changes.iter().map(PlannedChange::summary).collect()
    }

    /// Counts changes per action.
    #[must_use]
    pub fn counts(&self) -> BTreeMap<ChangeAction, usize> {
        let mut counts = BTreeMap::new();
        for change in &self.changes {
            *counts.entry(change.action).or_insert(0) += 1;
        }
        counts
    }

    /// Number of changes with `action`.
    #[must_use]
    pub fn count(&self, action: ChangeAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }
}

/// Orders deleted ids so that prior dependents are deleted before what they depended on.
fn delete_order<'a>(diff: &'a DiffResult, prior: &'a StateSnapshot) -> Vec<&'a str> {
    let deleted: BTreeSet<&str> = diff
        .diffs
        .iter()
        .filter(|d| d.action == ChangeAction::Delete)
        .map(|d| d.id.as_str())
        .collect();

    let edges: BTreeMap<&str, Vec<&str>> = deleted
        .iter()
        .map(|&id| {
            let deps = prior
                .get(id)
                .map(|r| r.depends_on.iter().map(String::as_str).collect())
                .unwrap_or_default();
            (id, deps)
        })
        .collect();

    let mut order = topological_sort(&edges);
    // Records whose stored dependencies form a cycle are still deleted, by id.
    let placed: BTreeSet<&str> = order.iter().copied().collect();
    order.extend(deleted.iter().copied().filter(|id| !placed.contains(id)));
    order.reverse();
    order
}

fn fingerprint(changes: &[PlannedChange]) -> String {
    let lines: Vec<String> = changes
        .iter()
        .map(|c| {
            format!(
                "{} {} {}",
                c.action,
                c.id,
                c.new_hash.as_deref().unwrap_or("-")
            )
        })
        .collect();
    ConfigHasher::new().hash_lines(lines.iter().map(String::as_str))
}

impl ChangeAction {
    /// Single-glyph marker used in text output.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoOp => "=",
        }
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "noop",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlannedChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.action.symbol(), self.description())?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        let pending: Vec<_> = self
            .changes
            .iter()
            .filter(|c| c.action != ChangeAction::NoOp)
            .collect();
        writeln!(f, "Plan ({} changes):", pending.len())?;
        for (i, change) in pending.iter().enumerate() {
            writeln!(f, "  {}. {change}", i + 1)?;
        }
        Ok(())
    }
}
