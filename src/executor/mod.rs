//! Plan execution.
//!
//! Every planned change runs in its own task. A task first waits on the
//! completion signals of the changes it depends on, then takes a permit from a
//! shared semaphore for each provider call it makes, so waiting tasks never
//! hold a permit. Successful changes commit their state record before they
//! signal dependents.

mod apply;
mod cancel;
mod status;

pub use apply::PlanExecutor;
pub use cancel::CancelHandle;
pub use status::{ApplyResult, NodeOutcome, NodeStatus};
