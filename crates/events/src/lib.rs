#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Event system for build operation lifecycles
//!
//! This crate defines the closed set of lifecycle events (started,
//! progressed, finished), the metadata that orders them, the listener
//! capability external tooling implements, and the dispatcher that fans
//! events out to listeners.
//!
//! ## Architecture
//!
//! - **Typed events**: `OperationEvent` carries operation identity and payload
//! - **Ordering metadata**: every event has a sequence number allocated with its transition
//! - **Listener isolation**: a failing listener never affects producers or other listeners
//! - **Tracing integration**: `TracingListener` mirrors the record into `tracing`

pub mod dispatch;
pub mod event;
pub mod listener;
pub mod meta;

pub use dispatch::{DiagnosticSink, DispatchReport, ListenerDispatcher, TracingDiagnosticSink};
pub use event::{EventKind, EventMessage, OperationEvent};
pub use listener::{
    channel, BuildOperationListener, ChannelListener, EventReceiver, Interest, ListenerId,
    TracingListener,
};
pub use meta::{EventLevel, EventMeta, EventSource};

// Value types listeners need to interpret events
pub use buildops_types::{FailureContext, OperationDescriptor, OperationId, OperationStatus};
