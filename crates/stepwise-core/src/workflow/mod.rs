//! Workflow engine core: steps, context, routing, checkpoints and the run loop.
//!
//! - `step` -- step handler traits and descriptors
//! - `definition` -- workflow assembly and validation
//! - `dag` -- event-flow graph and reachability
//! - `queue` -- per-step inbound event queues
//! - `checkpoint` -- checkpoint broker and ledger storage
//! - `context` -- shared state store, routing and aggregation
//! - `executor` -- run loop and step workers
//! - `handler` -- awaitable run handle

pub mod checkpoint;
pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod handler;
pub mod queue;
pub mod step;

pub use checkpoint::{BrokerLog, CheckpointBroker, InMemoryBrokerLog};
pub use context::{Context, ContextBuilder, ContextError, SerializedContext};
pub use definition::{Workflow, WorkflowBuilder, WorkflowError};
pub use executor::ExecutorError;
pub use handler::WorkflowHandler;
pub use queue::{ChannelQueue, EventQueue, QueueFactory};
pub use step::{FnStep, Step, StepDescriptor, StepDyn, StepResult};
