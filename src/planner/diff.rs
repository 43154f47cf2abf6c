//! Diff engine comparing the desired graph with the prior state.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::{ConfigHasher, ReplaceStrategy};
use crate::error::PlanError;
use crate::model::{CapabilityTable, ResourceGraph, ResourceNode};
use crate::state::{StateRecord, StateSnapshot};

use super::plan::ChangeAction;

/// Engine for computing per-resource diffs.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Content hasher.
    hasher: ConfigHasher,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    /// Resource id.
    pub id: String,
    /// Chosen action.
    pub action: ChangeAction,
    /// Why the action was chosen.
    pub reason: String,
    /// Properties whose value differs from the prior record.
    pub changed_properties: Vec<String>,
    /// Previous hash, if a record exists.
    pub old_hash: Option<String>,
    /// New hash, if the resource is desired.
    pub new_hash: Option<String>,
    /// Replacement ordering, for replaces.
    pub replace_strategy: Option<ReplaceStrategy>,
}

/// Complete diff result, unordered.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// All resource diffs.
    pub diffs: Vec<ResourceDiff>,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff of every desired and every prior resource.
    ///
    /// Desired nodes are visited in dependency order so that whether a
    /// dependency gets a new provider id is known before its dependents are
    /// decided.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::ReplacePolicyMissing`] if a resource must be
    /// replaced and its type declares no replace strategy.
    pub fn compute_diff(
        &self,
        graph: &ResourceGraph,
        prior: &StateSnapshot,
        capabilities: &CapabilityTable,
    ) -> Result<DiffResult, PlanError> {
        let mut diffs = Vec::with_capacity(graph.len() + prior.len());
        let mut renewed: BTreeMap<&str, ChangeAction> = BTreeMap::new();

        for id in graph.topological_order() {
            let Some(node) = graph.node(id) else {
                continue;
            };
            let diff = self.diff_node(node, prior, capabilities, &renewed)?;
            if matches!(diff.action, ChangeAction::Replace | ChangeAction::Create) {
                renewed.insert(id, diff.action);
            }
            debug!("{id}: {} ({})", diff.action, diff.reason);
            diffs.push(diff);
        }

        for (id, record) in prior {
            if !graph.contains(id) {
                debug!("{id}: delete (removed from stack)");
                diffs.push(ResourceDiff {
                    id: id.clone(),
                    action: ChangeAction::Delete,
                    reason: String::from("removed from stack"),
                    changed_properties: Vec::new(),
                    old_hash: Some(record.last_applied_hash.clone()),
                    new_hash: None,
                    replace_strategy: None,
                });
            }
        }

        Ok(DiffResult { diffs })
    }

    fn diff_node(
        &self,
        node: &ResourceNode,
        snapshot: &StateSnapshot,
        capabilities: &CapabilityTable,
        renewed: &BTreeMap<&str, ChangeAction>,
    ) -> Result<ResourceDiff, PlanError> {
        let prior = snapshot.get(&node.id);
        let properties = node.placeholder_properties();
        let new_hash = self.hasher.hash_properties(&node.resource_type, &properties);

        let mut diff = ResourceDiff {
            id: node.id.clone(),
            action: ChangeAction::NoOp,
            reason: String::from("unchanged"),
            changed_properties: Vec::new(),
            old_hash: prior.map(|p| p.last_applied_hash.clone()),
            new_hash: Some(new_hash.clone()),
            replace_strategy: None,
        };

        let Some(prior) = prior else {
            diff.action = ChangeAction::Create;
            diff.reason = String::from("not yet created");
            return Ok(diff);
        };

        if prior.resource_type != node.resource_type {
            diff.action = ChangeAction::Replace;
            diff.reason = format!(
                "type changed from '{}' to '{}'",
                prior.resource_type, node.resource_type
            );
        } else if !ConfigHasher::hashes_match(&prior.last_applied_hash, &new_hash) {
            diff.changed_properties = changed_properties(&prior.last_applied_properties, &properties);
            let changed: Vec<&str> = diff.changed_properties.iter().map(String::as_str).collect();
            let immutable = capabilities.immutable_changes(&node.resource_type, &changed);

            if immutable.is_empty() {
                diff.action = ChangeAction::Update;
                diff.reason = if changed.is_empty() {
                    String::from("content hash changed")
                } else {
                    format!("changed: {}", changed.join(", "))
                };
            } else {
                diff.action = ChangeAction::Replace;
                diff.reason = format!("immutable property changed: {}", immutable.join(", "));
            }
        }

        if matches!(diff.action, ChangeAction::NoOp | ChangeAction::Update) {
            Self::follow_dependency_ids(node, prior, snapshot, capabilities, renewed, &mut diff);
        }

        if diff.action == ChangeAction::Replace {
            diff.replace_strategy = capabilities.replace_strategy(&node.resource_type);
            if diff.replace_strategy.is_none() {
                return Err(PlanError::ReplacePolicyMissing {
                    id: node.id.clone(),
                    resource_type: node.resource_type.clone(),
                    reason: diff.reason,
                });
            }
        }

        Ok(diff)
    }

    /// Escalates a change when a referenced dependency has or gets a provider
    /// id other than the one this resource was last applied against.
    ///
    /// That is the case when the dependency is replaced or (re)created in this
    /// plan, or when its recorded id differs from the one this resource saw,
    /// which happens after an interrupted replacement. A reference through an
    /// immutable property forces a replace; any other reference turns a no-op
    /// into an update.
    fn follow_dependency_ids(
        node: &ResourceNode,
        prior: &StateRecord,
        snapshot: &StateSnapshot,
        capabilities: &CapabilityTable,
        renewed: &BTreeMap<&str, ChangeAction>,
        diff: &mut ResourceDiff,
    ) {
        for dep in &node.depends_on {
            let Some(cause) = dependency_change(dep, prior, snapshot, renewed) else {
                continue;
            };
            let referencing = node.properties_referencing(dep);
            if referencing.is_empty() {
                continue;
            }

            let immutable = capabilities.immutable_changes(&node.resource_type, &referencing);
            if !immutable.is_empty() {
                diff.action = ChangeAction::Replace;
                diff.reason = format!(
                    "'{dep}' {cause} and is referenced by immutable property {}",
                    immutable.join(", ")
                );
                return;
            }

            if diff.action == ChangeAction::NoOp {
                diff.action = ChangeAction::Update;
                diff.reason = format!("'{dep}' {cause}");
            }
        }
    }
}

/// Describes how `dep` changes identity for a resource last applied as `prior`.
fn dependency_change(
    dep: &str,
    prior: &StateRecord,
    snapshot: &StateSnapshot,
    renewed: &BTreeMap<&str, ChangeAction>,
) -> Option<String> {
    match renewed.get(dep) {
        Some(ChangeAction::Replace) => return Some(String::from("is replaced")),
        Some(_) => return Some(String::from("is recreated")),
        None => {}
    }
    let seen = prior.dependency_ids.get(dep)?;
    let current = &snapshot.get(dep)?.provider_id;
    (seen != current).then(|| format!("moved from {seen} to {current}"))
}

/// Names of properties whose placeholder value differs, in name order.
fn changed_properties(old: &BTreeMap<String, Value>, new: &BTreeMap<String, Value>) -> Vec<String> {
    old.keys()
        .chain(new.keys())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|k| old.get(*k) != new.get(*k))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_changed_properties() {
        let old = BTreeMap::from([
            (String::from("a"), json!(1)),
            (String::from("b"), json!(2)),
        ]);
        let new = BTreeMap::from([
            (String::from("b"), json!(3)),
            (String::from("c"), json!(4)),
        ]);
        assert_eq!(changed_properties(&old, &new), vec!["a", "b", "c"]);
        assert!(changed_properties(&old, &old).is_empty());
    }
}
