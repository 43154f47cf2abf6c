//! Resource model.
//!
//! Typed resource nodes, inter-resource references, per-type capabilities,
//! and the validated dependency graph built from a stack document.

mod capability;
mod graph;
mod reference;
mod resource;

pub use capability::CapabilityTable;
pub use graph::{GraphBuilder, ResourceGraph};
pub use reference::{REF_KEY, Reference, collect_references, resolve, with_placeholders};
pub use resource::ResourceNode;

pub(crate) use graph::topological_sort;
