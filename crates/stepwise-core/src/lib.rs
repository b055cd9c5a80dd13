//! Event-driven workflow engine for Stepwise.
//!
//! Steps exchange typed events through per-step queues, share state through a
//! `Context`, and every event-producing step completion is appended to a
//! checkpoint ledger that can be filtered and resumed from.
//!
//! Runs on tokio. Shared run state lives in `dashmap` maps, reachability is
//! checked over a `petgraph` graph, and step handlers return `anyhow` errors.
//! The filesystem is only touched by the optional `workflow.toml` loader.

pub mod config;
pub mod event;
pub mod workflow;

pub use workflow::{
    Context, ContextError, ExecutorError, StepDescriptor, Workflow, WorkflowError,
    WorkflowHandler,
};
