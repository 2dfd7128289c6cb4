#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Build operation tracking core
//!
//! Producers start, progress and finish operations through
//! [`BuildOperations`]. The controller keeps the authoritative operation
//! forest in a registry keyed by identifier, resolves implicit parents from
//! the per-thread [`context`] carrier, classifies outcomes and delivers every
//! transition to listeners in causal order.
//!
//! ```no_run
//! use buildops_errors::Error;
//! use buildops_operations::BuildOperations;
//! use buildops_types::{OperationDescriptor, OperationKind};
//!
//! let operations = BuildOperations::new();
//! operations.run(OperationDescriptor::builder(OperationKind::Build, "app"), |ctx| {
//!     ctx.operations().run(
//!         OperationDescriptor::builder(OperationKind::Task, "compile"),
//!         |task| task.progress("linking").map_err(Error::from),
//!     )
//! })?;
//! # Ok::<(), Error>(())
//! ```

pub mod classifier;
pub mod context;
mod controller;
mod queue;
pub mod registry;
mod runner;

pub use classifier::{Classification, FailureClassifier};
pub use context::{CapturedContext, ContextGuard, Instrumented};
pub use controller::{BuildOperations, BuildSummary, OperationHandle};
pub use queue::QueueReport;
pub use runner::OperationContext;
