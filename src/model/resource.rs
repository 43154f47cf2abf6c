//! Resource nodes of the desired graph.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::reference::{Reference, collect_references, with_placeholders};

/// A resource in the desired graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceNode {
    /// Stable, user-assigned id.
    pub id: String,
    /// Provider resource kind.
    pub resource_type: String,
    /// Desired properties, references unresolved.
    pub properties: BTreeMap<String, Value>,
    /// Ids this node depends on: referenced nodes plus explicit dependencies.
    pub depends_on: BTreeSet<String>,
}

impl ResourceNode {
    /// Returns every reference in the node's properties, grouped by property name.
    ///
    /// Malformed references are skipped; the graph builder rejects them
    /// before a node is ever constructed.
    #[must_use]
    pub fn references(&self) -> BTreeMap<&str, Vec<Reference>> {
        self.properties
            .iter()
            .filter_map(|(name, value)| {
                let mut refs = Vec::new();
                collect_references(value, &mut refs).ok()?;
                (!refs.is_empty()).then_some((name.as_str(), refs))
            })
            .collect()
    }

    /// Returns the names of properties that reference `node`.
    #[must_use]
    pub fn properties_referencing(&self, node: &str) -> Vec<&str> {
        self.references()
            .into_iter()
            .filter(|(_, refs)| refs.iter().any(|r| r.node == node))
            .map(|(name, _)| name)
            .collect()
    }

    /// Returns the properties with references replaced by placeholder tokens.
    #[must_use]
    pub fn placeholder_properties(&self) -> BTreeMap<String, Value> {
        self.properties
            .iter()
            .map(|(k, v)| (k.clone(), with_placeholders(v)))
            .collect()
    }
}
