// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halyard
//!
//! A declarative infrastructure provisioning engine.
//!
//! ## Overview
//!
//! Halyard reads a stack document that declares resources, their properties
//! and the references between them, and converges real infrastructure to it:
//!
//! - Resources form a dependency graph built from explicit `depends_on`
//!   lists and from `{ref: "id.attr"}` references inside properties
//! - Planning compares the graph with durable state and yields a
//!   deterministic, fingerprinted plan of create/update/replace/delete
//! - Applying runs independent branches concurrently under a bounded pool,
//!   retries transient provider failures and commits state per resource
//!
//! ## Architecture
//!
//! 1. **Desired State**: Defined in `halyard.stack.yaml`
//! 2. **Prior State**: One record per resource in the state store
//! 3. **Planner**: Diffs the two into an ordered plan
//! 4. **Executor**: Applies the plan through a provider
//!
//! ## Modules
//!
//! - [`config`]: Stack document parsing and validation
//! - [`model`]: Resource graph, references and type capabilities
//! - [`planner`]: Diff computation and plan ordering
//! - [`executor`]: Concurrent plan execution
//! - [`provider`]: Provider trait, HTTP and in-memory providers, retries
//! - [`state`]: State storage backends (local, S3)
//! - [`engine`]: Lock, load, plan, apply, unlock
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!   environment: prod
//!
//! types:
//!   network:
//!     immutable: [cidr]
//!     replace: create_before_delete
//!
//! resources:
//!   - id: vpc
//!     type: network
//!     properties:
//!       cidr: 10.0.0.0/16
//!   - id: web
//!     type: instance
//!     properties:
//!       network: { ref: vpc.id }
//!       size: small
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod model;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackSpec};
pub use engine::{Engine, Goal};
pub use error::{HalyardError, Result};
pub use executor::{ApplyResult, CancelHandle, PlanExecutor};
pub use model::{GraphBuilder, ResourceGraph};
pub use planner::{Plan, plan};
pub use provider::{HttpProvider, MemoryProvider, Provider};
pub use state::{LocalStateStore, S3StateStore, StateRecord, StateStore};
