//! Workflow definition assembly and validation.
//!
//! A `Workflow` is an immutable set of `StepDescriptor`s plus engine
//! configuration. `WorkflowBuilder::build` validates structural constraints
//! (unique names, start/stop coverage, produced/consumed type agreement,
//! known targets, reachability) before the workflow can run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use stepwise_types::config::WorkflowConfig;
use stepwise_types::event::EventType;
use thiserror::Error;

use super::dag::unreachable_steps;
use super::step::StepDescriptor;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while assembling a workflow.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Two steps share a name.
    #[error("duplicate step name: '{0}'")]
    DuplicateStep(String),

    /// A step routes its output to a step that does not exist.
    #[error("step '{step}' targets unknown step '{target}'")]
    UnknownTarget { step: String, target: String },

    /// Steps that no event path from the start event can reach.
    #[error("unreachable steps: {0}")]
    Unreachable(String),
}

// ---------------------------------------------------------------------------
// StepTable
// ---------------------------------------------------------------------------

/// Registered steps in declaration order with a name index.
#[derive(Debug)]
pub(crate) struct StepTable {
    steps: Vec<StepDescriptor>,
    index: HashMap<String, usize>,
}

impl StepTable {
    fn new(steps: Vec<StepDescriptor>) -> Self {
        let index = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name().to_string(), i))
            .collect();
        Self { steps, index }
    }

    pub(crate) fn get(&self, name: &str) -> Option<&StepDescriptor> {
        self.index.get(name).map(|&i| &self.steps[i])
    }

    pub(crate) fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name())
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// An immutable, validated graph of steps.
///
/// Cloning is cheap: the step table is shared.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    table: Arc<StepTable>,
    config: WorkflowConfig,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Steps in registration order.
    pub fn steps(&self) -> &[StepDescriptor] {
        self.table.steps()
    }

    pub fn step(&self, name: &str) -> Option<&StepDescriptor> {
        self.table.get(name)
    }

    /// Steps that receive the start event.
    pub fn start_steps(&self) -> impl Iterator<Item = &StepDescriptor> {
        self.steps()
            .iter()
            .filter(|s| s.config().accepts_type(&EventType::Start))
    }

    pub(crate) fn table(&self) -> &Arc<StepTable> {
        &self.table
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Collects step descriptors and configuration, then validates them.
pub struct WorkflowBuilder {
    name: String,
    steps: Vec<StepDescriptor>,
    config: WorkflowConfig,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            config: WorkflowConfig::default(),
        }
    }

    pub fn step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = StepDescriptor>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the whole-run timeout. `None` disables it.
    pub fn timeout_secs(mut self, secs: Option<u64>) -> Self {
        self.config.timeout_secs = secs;
        self
    }

    /// Validate and freeze the workflow.
    ///
    /// Unique step names are always enforced since routing depends on them;
    /// the remaining checks are skipped when `disable_validation` is set.
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        check_unique_names(&self.steps)?;
        if !self.config.disable_validation {
            validate_definition(&self.name, &self.steps)?;
        }

        tracing::debug!(
            workflow = self.name.as_str(),
            steps = self.steps.len(),
            "workflow built"
        );

        Ok(Workflow {
            name: self.name,
            table: Arc::new(StepTable::new(self.steps)),
            config: self.config,
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn check_unique_names(steps: &[StepDescriptor]) -> Result<(), WorkflowError> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.name()) {
            return Err(WorkflowError::DuplicateStep(step.name().to_string()));
        }
    }
    Ok(())
}

/// Validate structural constraints on a set of steps.
///
/// Checks:
/// - Name is non-empty and at least one step exists
/// - Some step accepts the start event and some step produces the stop event
/// - Every produced type (except stop) is accepted by some step
/// - Every accepted type (except start) is produced by some step
/// - Every `target` names an existing step
/// - Every step is reachable from the start steps
pub fn validate_definition(name: &str, steps: &[StepDescriptor]) -> Result<(), WorkflowError> {
    if name.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow name must not be empty".to_string(),
        ));
    }
    if steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }
    check_unique_names(steps)?;

    let accepted: HashSet<&EventType> = steps
        .iter()
        .flat_map(|s| s.config().accepted_events())
        .collect();
    let produced: HashSet<&EventType> = steps
        .iter()
        .flat_map(|s| s.config().produced_events())
        .collect();

    if !accepted.contains(&EventType::Start) {
        return Err(WorkflowError::ValidationError(
            "no step accepts the start event".to_string(),
        ));
    }
    if !produced.contains(&EventType::Stop) {
        return Err(WorkflowError::ValidationError(
            "no step produces the stop event".to_string(),
        ));
    }

    let mut unconsumed: Vec<&str> = produced
        .iter()
        .filter(|ty| !ty.is_stop() && !accepted.contains(*ty))
        .map(|ty| ty.as_str())
        .collect();
    if !unconsumed.is_empty() {
        unconsumed.sort_unstable();
        return Err(WorkflowError::ValidationError(format!(
            "events produced but never consumed: {}",
            unconsumed.join(", ")
        )));
    }

    let mut unproduced: Vec<&str> = accepted
        .iter()
        .filter(|ty| !ty.is_start() && !produced.contains(*ty))
        .map(|ty| ty.as_str())
        .collect();
    if !unproduced.is_empty() {
        unproduced.sort_unstable();
        return Err(WorkflowError::ValidationError(format!(
            "events consumed but never produced: {}",
            unproduced.join(", ")
        )));
    }

    let names: HashSet<&str> = steps.iter().map(|s| s.name()).collect();
    for step in steps {
        if let Some(target) = step.config().target() {
            if !names.contains(target) {
                return Err(WorkflowError::UnknownTarget {
                    step: step.name().to_string(),
                    target: target.to_string(),
                });
            }
        }
    }

    let unreachable = unreachable_steps(steps);
    if !unreachable.is_empty() {
        return Err(WorkflowError::Unreachable(unreachable.join(", ")));
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
