//! Desired resource graph and its builder.
//!
//! The builder is a pure transformation from resource declarations to a
//! validated, acyclic graph. Nothing is contacted and nothing is written.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::{ResourceSpec, StackSpec};
use crate::error::GraphError;

use super::reference::collect_references;
use super::resource::ResourceNode;

/// Validated, acyclic graph of desired resources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceGraph {
    nodes: BTreeMap<String, ResourceNode>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl ResourceGraph {
    /// Returns a graph with no nodes, the desired state of a destroy.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Looks up a node.
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&ResourceNode> {
        self.nodes.get(id)
    }

    /// Returns true if the graph holds a node with this id.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Iterates nodes in id order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Returns the set of node ids.
    #[must_use]
    pub fn ids(&self) -> BTreeSet<&str> {
        self.nodes.keys().map(String::as_str).collect()
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the ids `id` depends on.
    #[must_use]
    pub fn dependencies(&self, id: &str) -> Vec<&str> {
        self.nodes
            .get(id)
            .map(|n| n.depends_on.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Returns the ids that depend on `id`.
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.dependents
            .get(id)
            .map(|d| d.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Returns node ids with every dependency ahead of its dependents.
    ///
    /// Among nodes that are ready at the same time the smallest id goes
    /// first, so the order is a function of the graph alone.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&str> {
        let edges: BTreeMap<&str, Vec<&str>> = self
            .nodes
            .values()
            .map(|n| (n.id.as_str(), n.depends_on.iter().map(String::as_str).collect()))
            .collect();
        topological_sort(&edges)
    }
}

/// Kahn's algorithm over an id → dependencies map, smallest ready id first.
///
/// Dependencies that are not keys of the map are ignored. Nodes caught in a
/// cycle are left out.
pub(crate) fn topological_sort<'a>(edges: &BTreeMap<&'a str, Vec<&'a str>>) -> Vec<&'a str> {
    let mut remaining: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (&id, deps) in edges {
        let known: BTreeSet<&str> = deps.iter().copied().filter(|d| edges.contains_key(d)).collect();
        remaining.insert(id, known.len());
        for dep in known {
            dependents.entry(dep).or_default().push(id);
        }
    }

    let mut ready: BTreeSet<&str> = remaining
        .iter()
        .filter(|&(_, count)| *count == 0)
        .map(|(&id, _)| id)
        .collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(id) = ready.pop_first() {
        order.push(id);
        for &dependent in dependents.get(id).map_or(&[][..], Vec::as_slice) {
            if let Some(count) = remaining.get_mut(dependent) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    order
}

/// Builds [`ResourceGraph`]s from resource declarations.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds the desired graph of a stack document.
    ///
    /// # Errors
    ///
    /// See [`GraphBuilder::build`].
    pub fn build_stack(&self, stack: &StackSpec) -> Result<ResourceGraph, GraphError> {
        self.build(&stack.resources)
    }

    /// Builds a graph from resource declarations.
    ///
    /// # Errors
    ///
    /// - [`GraphError::DuplicateId`] if two declarations share an id.
    /// - [`GraphError::Validation`] for malformed ids, empty types, malformed
    ///   references, and references or dependencies to unknown ids.
    /// - [`GraphError::Cycle`] if the dependency relation is cyclic.
    pub fn build(&self, resources: &[ResourceSpec]) -> Result<ResourceGraph, GraphError> {
        let mut seen = BTreeSet::new();
        for resource in resources {
            if !is_valid_id(&resource.id) {
                return Err(GraphError::validation(
                    &resource.id,
                    "id must start with a lowercase letter and contain only lowercase letters, digits, '-' and '_'",
                ));
            }
            if resource.resource_type.trim().is_empty() {
                return Err(GraphError::validation(&resource.id, "resource type cannot be empty"));
            }
            if !seen.insert(resource.id.as_str()) {
                return Err(GraphError::DuplicateId {
                    id: resource.id.clone(),
                });
            }
        }

        let mut nodes = BTreeMap::new();
        for resource in resources {
            let node = Self::build_node(resource, &seen)?;
            nodes.insert(node.id.clone(), node);
        }

        if let Some(path) = find_cycle(&nodes) {
            return Err(GraphError::Cycle { path });
        }

        let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for node in nodes.values() {
            for dep in &node.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(node.id.clone());
            }
        }

        debug!("Built resource graph with {} nodes", nodes.len());
        Ok(ResourceGraph { nodes, dependents })
    }

    /// Converts one declaration, deriving its dependency set.
    fn build_node(resource: &ResourceSpec, known: &BTreeSet<&str>) -> Result<ResourceNode, GraphError> {
        let mut depends_on = BTreeSet::new();

        for (name, value) in &resource.properties {
            let mut refs = Vec::new();
            collect_references(value, &mut refs)
                .map_err(|e| GraphError::validation(&resource.id, format!("property '{name}': {e}")))?;
            for reference in refs {
                if !known.contains(reference.node.as_str()) {
                    return Err(GraphError::validation(
                        &resource.id,
                        format!(
                            "property '{name}' references unknown resource '{}'",
                            reference.node
                        ),
                    ));
                }
                depends_on.insert(reference.node);
            }
        }

        for dep in &resource.depends_on {
            if !known.contains(dep.as_str()) {
                return Err(GraphError::validation(
                    &resource.id,
                    format!("depends_on names unknown resource '{dep}'"),
                ));
            }
            depends_on.insert(dep.clone());
        }

        Ok(ResourceNode {
            id: resource.id.clone(),
            resource_type: resource.resource_type.clone(),
            properties: resource.properties.clone(),
            depends_on,
        })
    }
}

/// Finds a cycle with an iterative depth-first traversal.
///
/// `on_stack` mirrors the explicit traversal stack, so reaching a node that is
/// on it closes a cycle. Returns the cycle with its first id repeated last.
fn find_cycle(nodes: &BTreeMap<String, ResourceNode>) -> Option<Vec<String>> {
    let adjacency: BTreeMap<&str, Vec<&str>> = nodes
        .values()
        .map(|n| (n.id.as_str(), n.depends_on.iter().map(String::as_str).collect()))
        .collect();

    let mut visited: BTreeSet<&str> = BTreeSet::new();
    let mut on_stack: BTreeSet<&str> = BTreeSet::new();

    for &root in adjacency.keys() {
        if !visited.insert(root) {
            continue;
        }
        on_stack.insert(root);
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let deps = adjacency.get(node).map_or(&[][..], Vec::as_slice);

            if let Some(&next) = deps.get(frame.1) {
                frame.1 += 1;
                if on_stack.contains(next) {
                    let start = stack.iter().position(|(id, _)| *id == next).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|(id, _)| (*id).to_string()).collect();
                    path.push(next.to_string());
                    return Some(path);
                }
                if visited.insert(next) {
                    on_stack.insert(next);
                    stack.push((next, 0));
                }
            } else {
                on_stack.remove(node);
                stack.pop();
            }
        }
    }

    None
}

/// Validates that an id can name a state record.
/// Ids start with a lowercase letter; the rest are lowercase alphanumerics, '-' or '_'.
fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}
