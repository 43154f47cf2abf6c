//! State record types.
//!
//! A record is what the engine remembers about one applied resource. It is
//! enough to diff the next desired graph against, to resolve references to
//! unchanged resources, and to order deletions of resources that left the
//! stack.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Current version of the record format.
pub const STATE_VERSION: &str = "1";

/// All records keyed by resource id.
pub type StateSnapshot = BTreeMap<String, StateRecord>;

/// Last applied state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Record format version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Provider resource kind.
    pub resource_type: String,
    /// Id the provider assigned.
    pub provider_id: String,
    /// Properties as last applied, references kept as placeholder tokens.
    pub last_applied_properties: BTreeMap<String, Value>,
    /// Content hash of the last applied type and properties.
    pub last_applied_hash: String,
    /// Outputs the provider returned.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
    /// Ids this resource depended on when applied.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Provider id of each referenced dependency, as seen when applied.
    #[serde(default)]
    pub dependency_ids: BTreeMap<String, String>,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> String {
    STATE_VERSION.to_string()
}

/// A change actually written to the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StateDelta {
    /// A record was written.
    Committed {
        /// Resource id.
        id: String,
        /// The record as written.
        record: StateRecord,
    },
    /// A record was removed.
    Removed {
        /// Resource id.
        id: String,
    },
}

impl StateRecord {
    /// Creates a record for a freshly created resource.
    #[must_use]
    pub fn new(
        resource_type: impl Into<String>,
        provider_id: impl Into<String>,
        properties: BTreeMap<String, Value>,
        hash: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: default_version(),
            resource_type: resource_type.into(),
            provider_id: provider_id.into(),
            last_applied_properties: properties,
            last_applied_hash: hash.into(),
            outputs: BTreeMap::new(),
            depends_on: BTreeSet::new(),
            dependency_ids: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: BTreeMap<String, Value>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Sets the dependency ids.
    #[must_use]
    pub fn with_depends_on(mut self, depends_on: BTreeSet<String>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Sets the provider ids the dependencies had when this record was applied.
    #[must_use]
    pub fn with_dependency_ids(mut self, dependency_ids: BTreeMap<String, String>) -> Self {
        self.dependency_ids = dependency_ids;
        self
    }

    /// Returns the updated record after an in-place update.
    ///
    /// The provider id and creation time are kept.
    #[must_use]
    pub fn updated(
        &self,
        properties: BTreeMap<String, Value>,
        hash: impl Into<String>,
        outputs: BTreeMap<String, Value>,
        depends_on: BTreeSet<String>,
    ) -> Self {
        Self {
            version: default_version(),
            resource_type: self.resource_type.clone(),
            provider_id: self.provider_id.clone(),
            last_applied_properties: properties,
            last_applied_hash: hash.into(),
            outputs,
            depends_on,
            dependency_ids: self.dependency_ids.clone(),
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    /// Looks up an output attribute. `id` is always the provider id.
    #[must_use]
    pub fn output(&self, attribute: &str) -> Option<Value> {
        if attribute == "id" {
            return Some(Value::String(self.provider_id.clone()));
        }
        self.outputs.get(attribute).cloned()
    }
}

impl StateDelta {
    /// Returns the id the delta applies to.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Committed { id, .. } | Self::Removed { id } => id,
        }
    }
}
