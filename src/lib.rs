//! graphrecon
//!
//! Declarative reconciliation engine for hierarchical, OData-flavored REST
//! APIs. A resource is described once by a typed attribute schema plus
//! read/write options; the engine turns desired values into ordered HTTP
//! calls and remote entities back into values of the same shape.
//!
//! # Module Structure
//!
//! - [`schema`] - Attribute schema model and derived-type resolver
//! - [`resource`] - Resource declarations and the registry
//! - [`hooks`] - Middleware and create/delete modify hooks
//! - [`engine`] - CRUD pipeline, diffing, sub-actions, reads, governor
//! - [`graph`] - HTTP transport
//! - [`config`] - Persistent user configuration
//! - [`error`], [`diagnostics`] - Failure and warning reporting

pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hooks;
pub mod resource;
pub mod schema;

pub use diagnostics::{Diagnostic, Diagnostics, Severity};
pub use engine::{Engine, Filter, ListingEntry, OperationContext, WriteGovernor};
pub use error::{EngineError, Result};
pub use resource::{Registry, ResourceSpec};
