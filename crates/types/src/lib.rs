#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Core type definitions for build operation tracking
//!
//! This crate provides the value types shared by the registry, the event
//! system and external listeners: identities, descriptors, lifecycle
//! status, point-in-time snapshots and producer outcomes.

pub mod operation;
pub mod outcome;
pub mod state;

// Re-export commonly used types
pub use operation::{DescriptorBuilder, OperationDescriptor, OperationId, OperationKind, Sequence};
pub use outcome::{FailureContext, Outcome};
pub use state::{OperationSnapshot, OperationState, OperationStatus};
