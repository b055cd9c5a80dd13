//! Workflow domain types for Stepwise.
//!
//! `StepConfig` is the static, immutable description of a step: its name,
//! the event types it accepts, the types it may produce, and how it is
//! scheduled. `RunStatus` tracks a single run's lifecycle.

use serde::{Deserialize, Serialize};

use crate::event::EventType;

// ---------------------------------------------------------------------------
// Step configuration
// ---------------------------------------------------------------------------

/// Static metadata for one workflow step.
///
/// Built once when the workflow is assembled and only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepConfig {
    name: String,
    accepted_events: Vec<EventType>,
    #[serde(default)]
    produced_events: Vec<EventType>,
    #[serde(default = "default_num_workers")]
    num_workers: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
}

fn default_num_workers() -> usize {
    1
}

impl StepConfig {
    /// A step that accepts nothing yet; chain `accepts` / `produces`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            accepted_events: Vec::new(),
            produced_events: Vec::new(),
            num_workers: default_num_workers(),
            target: None,
        }
    }

    /// Add an accepted input type.
    pub fn accepts(mut self, ty: EventType) -> Self {
        if !self.accepted_events.contains(&ty) {
            self.accepted_events.push(ty);
        }
        self
    }

    /// Add a type this step may return.
    pub fn produces(mut self, ty: EventType) -> Self {
        if !self.produced_events.contains(&ty) {
            self.produced_events.push(ty);
        }
        self
    }

    /// Number of concurrent workers draining this step's queue (minimum 1).
    pub fn with_num_workers(mut self, n: usize) -> Self {
        self.num_workers = n.max(1);
        self
    }

    /// Route every output of this step to one named step instead of broadcasting.
    pub fn with_target(mut self, step: impl Into<String>) -> Self {
        self.target = Some(step.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accepted_events(&self) -> &[EventType] {
        &self.accepted_events
    }

    pub fn produced_events(&self) -> &[EventType] {
        &self.produced_events
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn target(&self) -> Option<&str> {
        self.target.as_deref()
    }

    /// Whether events of `ty` may be delivered to this step.
    pub fn accepts_type(&self, ty: &EventType) -> bool {
        self.accepted_events.contains(ty)
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    /// A stop event resolved the run.
    Stopped,
    /// A step error, timeout or cancellation aborted the run.
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Stopped | RunStatus::Failed)
    }
}
