//! Planning module.
//!
//! Compares the desired resource graph with the prior state snapshot and
//! produces an ordered, fingerprinted plan. Planning is pure: it reads a
//! snapshot and never touches the provider or the store.

mod diff;
mod plan;

pub use diff::{DiffEngine, DiffResult, ResourceDiff};
pub use plan::{ChangeAction, ChangeSummary, Plan, PlannedChange};

use crate::error::PlanError;
use crate::model::{CapabilityTable, ResourceGraph};
use crate::state::StateSnapshot;

/// Plans the changes that turn `prior` into `graph`.
///
/// # Errors
///
/// Returns [`PlanError::ReplacePolicyMissing`] if a required replacement has
/// no declared strategy.
pub fn plan(
    graph: &ResourceGraph,
    prior: &StateSnapshot,
    capabilities: &CapabilityTable,
) -> Result<Plan, PlanError> {
    let diff = DiffEngine::new().compute_diff(graph, prior, capabilities)?;
    Ok(Plan::from_diff(&diff, graph, prior))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHasher, ReplaceStrategy, ResourceSpec, TypeCapabilities};
    use crate::model::{GraphBuilder, Reference};
    use crate::state::StateRecord;
    use serde_json::{Value, json};
    use std::collections::{BTreeMap, BTreeSet};

    fn network(cidr: &str) -> ResourceSpec {
        ResourceSpec::new("n1", "network").with_property("cidr", json!(cidr))
    }

    fn instance() -> ResourceSpec {
        ResourceSpec::new("i1", "instance")
            .with_property("network", Reference::new("n1", "id").to_value())
            .with_property("size", json!("small"))
    }

    fn capabilities() -> CapabilityTable {
        CapabilityTable::default().with_type(
            "network",
            TypeCapabilities {
                immutable: BTreeSet::from([String::from("cidr")]),
                replace: Some(ReplaceStrategy::CreateBeforeDelete),
            },
        )
    }

    /// Builds the snapshot a successful apply of `specs` would leave behind.
    fn applied(specs: &[ResourceSpec]) -> StateSnapshot {
        let graph = GraphBuilder::new().build(specs).unwrap();
        let hasher = ConfigHasher::new();
        graph
            .nodes()
            .map(|node| {
                let props = node.placeholder_properties();
                let hash = hasher.hash_properties(&node.resource_type, &props);
                let record = StateRecord::new(&node.resource_type, format!("{}-1", node.id), props, hash)
                    .with_depends_on(node.depends_on.clone());
                (node.id.clone(), record)
            })
            .collect()
    }

    fn plan_for(specs: &[ResourceSpec], prior: &StateSnapshot) -> Plan {
        let graph = GraphBuilder::new().build(specs).unwrap();
        plan(&graph, prior, &capabilities()).unwrap()
    }

    #[test]
    fn test_initial_plan_creates_in_dependency_order() {
        let p = plan_for(&[instance(), network("10.0.0.0/16")], &StateSnapshot::new());
        assert_eq!(
            p.actions(),
            vec![("n1", ChangeAction::Create), ("i1", ChangeAction::Create)]
        );
    }

    #[test]
    fn test_replan_after_apply_is_all_noop() {
        let specs = vec![network("10.0.0.0/16"), instance()];
        let p = plan_for(&specs, &applied(&specs));
        assert!(p.is_empty());
        assert_eq!(
            p.actions(),
            vec![("n1", ChangeAction::NoOp), ("i1", ChangeAction::NoOp)]
        );
    }

    #[test]
    fn test_immutable_change_replaces_and_updates_dependent() {
        let prior = applied(&[network("10.0.0.0/16"), instance()]);
        let p = plan_for(&[network("10.1.0.0/16"), instance()], &prior);

        assert_eq!(
            p.actions(),
            vec![("n1", ChangeAction::Replace), ("i1", ChangeAction::Update)]
        );
        let n1 = p.change("n1").unwrap();
        assert_eq!(n1.replace_strategy, Some(ReplaceStrategy::CreateBeforeDelete));
        assert_eq!(n1.changed_properties, vec!["cidr"]);
    }

    #[test]
    fn test_mutable_change_updates_only_that_node() {
        let prior = applied(&[network("10.0.0.0/16"), instance()]);
        let resized = instance().with_property("size", json!("large"));
        let p = plan_for(&[network("10.0.0.0/16"), resized], &prior);

        assert_eq!(
            p.actions(),
            vec![("n1", ChangeAction::NoOp), ("i1", ChangeAction::Update)]
        );
    }

    #[test]
    fn test_replaced_dependency_through_immutable_property_replaces() {
        let caps = capabilities().with_type(
            "instance",
            TypeCapabilities {
                immutable: BTreeSet::from([String::from("network")]),
                replace: Some(ReplaceStrategy::DeleteBeforeCreate),
            },
        );
        let prior = applied(&[network("10.0.0.0/16"), instance()]);
        let graph = GraphBuilder::new()
            .build(&[network("10.1.0.0/16"), instance()])
            .unwrap();

        let p = plan(&graph, &prior, &caps).unwrap();
        assert_eq!(p.change("i1").unwrap().action, ChangeAction::Replace);
    }

    #[test]
    fn test_recreated_dependency_updates_dependent() {
        let specs = [network("10.0.0.0/16"), instance()];
        let mut prior = applied(&specs);
        prior.remove("n1");

        let p = plan_for(&specs, &prior);
        assert_eq!(
            p.actions(),
            vec![("n1", ChangeAction::Create), ("i1", ChangeAction::Update)]
        );
        assert_eq!(p.change("i1").unwrap().reason, "'n1' is recreated");
    }

    #[test]
    fn test_dependency_id_seen_at_apply_is_compared() {
        let specs = [network("10.0.0.0/16"), instance()];
        let mut prior = applied(&specs);
        let i1 = prior.remove("i1").unwrap();
        prior.insert(
            String::from("i1"),
            i1.clone()
                .with_dependency_ids(BTreeMap::from([(String::from("n1"), String::from("n1-0"))])),
        );

        let p = plan_for(&specs, &prior);
        assert_eq!(p.change("n1").unwrap().action, ChangeAction::NoOp);
        let change = p.change("i1").unwrap();
        assert_eq!(change.action, ChangeAction::Update);
        assert_eq!(change.reason, "'n1' moved from n1-0 to n1-1");

        prior.insert(
            String::from("i1"),
            i1.with_dependency_ids(BTreeMap::from([(String::from("n1"), String::from("n1-1"))])),
        );
        assert!(plan_for(&specs, &prior).is_empty());
    }

    #[test]
    fn test_literal_placeholder_text_differs_from_reference() {
        let literal = ResourceSpec::new("i1", "instance")
            .with_property("network", json!("${ref:n1.id}"))
            .with_property("size", json!("small"));
        let prior = applied(&[network("10.0.0.0/16"), literal]);

        let p = plan_for(&[network("10.0.0.0/16"), instance()], &prior);
        let change = p.change("i1").unwrap();
        assert_eq!(change.action, ChangeAction::Update);
        assert_eq!(change.changed_properties, vec!["network"]);
    }

    #[test]
    fn test_replace_without_strategy_fails() {
        let caps = CapabilityTable::default().with_type(
            "network",
            TypeCapabilities {
                immutable: BTreeSet::from([String::from("cidr")]),
                replace: None,
            },
        );
        let prior = applied(&[network("10.0.0.0/16")]);
        let graph = GraphBuilder::new().build(&[network("10.9.0.0/16")]).unwrap();

        let err = plan(&graph, &prior, &caps).unwrap_err();
        assert!(matches!(err, PlanError::ReplacePolicyMissing { ref id, .. } if id == "n1"));
    }

    #[test]
    fn test_type_change_replaces() {
        let prior = applied(&[network("10.0.0.0/16")]);
        let caps = capabilities().with_type(
            "network-v2",
            TypeCapabilities {
                immutable: BTreeSet::new(),
                replace: Some(ReplaceStrategy::DeleteBeforeCreate),
            },
        );
        let graph = GraphBuilder::new()
            .build(&[ResourceSpec::new("n1", "network-v2").with_property("cidr", json!("10.0.0.0/16"))])
            .unwrap();

        let p = plan(&graph, &prior, &caps).unwrap();
        assert_eq!(p.change("n1").unwrap().action, ChangeAction::Replace);
    }

    #[test]
    fn test_deletes_follow_reverse_dependency_order_after_other_changes() {
        let prior = applied(&[network("10.0.0.0/16"), instance()]);
        let bucket = ResourceSpec::new("logs", "bucket");
        let p = plan_for(&[bucket], &prior);

        assert_eq!(
            p.actions(),
            vec![
                ("logs", ChangeAction::Create),
                ("i1", ChangeAction::Delete),
                ("n1", ChangeAction::Delete),
            ]
        );
    }

    #[test]
    fn test_plan_is_deterministic() {
        let specs: Vec<ResourceSpec> = (0..20)
            .map(|i| {
                let spec = ResourceSpec::new(format!("r{i:02}"), "thing").with_property("n", Value::from(i));
                if i > 0 {
                    spec.with_property("prev", Reference::new(format!("r{:02}", i / 2), "id").to_value())
                } else {
                    spec
                }
            })
            .collect();
        let prior = applied(&specs[..10]);

        let a = plan_for(&specs, &prior);
        let b = plan_for(&specs, &prior);
        assert_eq!(a.summary(), b.summary());
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_summary_and_counts() {
        let p = plan_for(&[network("10.0.0.0/16"), instance()], &StateSnapshot::new());
        assert_eq!(p.count(ChangeAction::Create), 2);
        assert_eq!(p.counts(), BTreeMap::from([(ChangeAction::Create, 2)]));

        let json = serde_json::to_value(p.summary()).unwrap();
        assert_eq!(json[0]["action"], json!("create"));
        assert_eq!(json[0]["id"], json!("n1"));
    }
}
