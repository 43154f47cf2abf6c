//! Per-type capability table.
//!
//! Planner and executor stay generic; everything type-specific (which
//! properties force a replacement, in what order a replacement happens) is
//! looked up here.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{ReplaceStrategy, TypeCapabilities};

/// Capabilities used for types the table does not list: everything mutable, no replace strategy.
static UNLISTED: TypeCapabilities = TypeCapabilities {
    immutable: BTreeSet::new(),
    replace: None,
};

/// Lookup table from resource type to its capabilities.
#[derive(Debug, Clone, Default)]
pub struct CapabilityTable {
    types: BTreeMap<String, TypeCapabilities>,
}

impl CapabilityTable {
    /// Creates a table from the stack document's `types` section.
    #[must_use]
    pub const fn new(types: BTreeMap<String, TypeCapabilities>) -> Self {
        Self { types }
    }

    /// Registers or overrides the capabilities of a type.
    #[must_use]
    pub fn with_type(mut self, resource_type: impl Into<String>, caps: TypeCapabilities) -> Self {
        self.types.insert(resource_type.into(), caps);
        self
    }

    /// Returns the capabilities of a type.
    #[must_use]
    pub fn for_type(&self, resource_type: &str) -> &TypeCapabilities {
        self.types.get(resource_type).unwrap_or(&UNLISTED)
    }

    /// Returns the subset of `changed` that the type marks immutable.
    #[must_use]
    pub fn immutable_changes<'a>(&self, resource_type: &str, changed: &[&'a str]) -> Vec<&'a str> {
        let caps = self.for_type(resource_type);
        changed
            .iter()
            .copied()
            .filter(|name| caps.immutable.contains(*name))
            .collect()
    }

    /// Returns the replace strategy declared for a type.
    #[must_use]
    pub fn replace_strategy(&self, resource_type: &str) -> Option<ReplaceStrategy> {
        self.for_type(resource_type).replace
    }

    /// Returns the listed type names.
    #[must_use]
    pub fn type_names(&self) -> Vec<&str> {
        self.types.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CapabilityTable {
        CapabilityTable::default().with_type(
            "network",
            TypeCapabilities {
                immutable: BTreeSet::from([String::from("cidr")]),
                replace: Some(ReplaceStrategy::DeleteBeforeCreate),
            },
        )
    }

    #[test]
    fn test_immutable_changes() {
        let table = table();
        assert_eq!(table.immutable_changes("network", &["cidr", "tags"]), vec!["cidr"]);
        assert!(table.immutable_changes("network", &["tags"]).is_empty());
    }

    #[test]
    fn test_unlisted_type_is_fully_mutable() {
        let table = table();
        assert!(table.immutable_changes("bucket", &["name"]).is_empty());
        assert_eq!(table.replace_strategy("bucket"), None);
        assert_eq!(
            table.replace_strategy("network"),
            Some(ReplaceStrategy::DeleteBeforeCreate)
        );
    }
}
