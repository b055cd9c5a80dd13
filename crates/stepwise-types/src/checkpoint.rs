//! Checkpoint records and ledger filters.
//!
//! A `Checkpoint` captures one step transition: which step completed, the
//! event it consumed, the event it produced, and a structural copy of the
//! context store at that moment. Checkpoints are appended to a context's
//! broker log and never mutated afterwards.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event::{Event, EventType};

/// Snapshot of a context store. Ordered so snapshots compare and print stably.
pub type ContextState = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// One entry in a context's broker log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// UUIDv7, so ids sort in creation order.
    pub id: Uuid,
    /// The run that produced this checkpoint.
    pub run_id: Uuid,
    /// Name of the step that just completed. `None` marks a run's start boundary.
    pub last_completed_step: Option<String>,
    /// Event the step consumed. `None` on the start boundary.
    pub input_event: Option<Event>,
    /// Event the step produced (the seeding event on the start boundary).
    pub output_event: Event,
    /// Copy of the context store when the checkpoint was created.
    pub ctx_state: ContextState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        run_id: Uuid,
        last_completed_step: Option<String>,
        input_event: Option<Event>,
        output_event: Event,
        ctx_state: ContextState,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            last_completed_step,
            input_event,
            output_event,
            ctx_state,
            created_at: Utc::now(),
        }
    }

    /// Whether this checkpoint marks the start of a run.
    pub fn is_run_boundary(&self) -> bool {
        self.last_completed_step.is_none()
    }
}

// ---------------------------------------------------------------------------
// CheckpointFilter
// ---------------------------------------------------------------------------

/// Conjunctive query over a broker log.
///
/// Unset fields match everything, so the default filter returns the whole
/// ledger. Event fields match on type identity, not on event equality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointFilter {
    pub last_completed_step: Option<String>,
    pub input_event_type: Option<EventType>,
    pub output_event_type: Option<EventType>,
}

impl CheckpointFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_completed_step(mut self, step: impl Into<String>) -> Self {
        self.last_completed_step = Some(step.into());
        self
    }

    pub fn input_event_type(mut self, ty: EventType) -> Self {
        self.input_event_type = Some(ty);
        self
    }

    pub fn output_event_type(mut self, ty: EventType) -> Self {
        self.output_event_type = Some(ty);
        self
    }

    /// Whether a checkpoint satisfies every set predicate.
    pub fn matches(&self, checkpoint: &Checkpoint) -> bool {
        if let Some(step) = &self.last_completed_step {
            if checkpoint.last_completed_step.as_deref() != Some(step.as_str()) {
                return false;
            }
        }
        if let Some(ty) = &self.input_event_type {
            match &checkpoint.input_event {
                Some(ev) if ev.event_type() == ty => {}
                _ => return false,
            }
        }
        if let Some(ty) = &self.output_event_type {
            if checkpoint.output_event.event_type() != ty {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step_checkpoint(step: &str, input: &str, output: &str) -> Checkpoint {
        Checkpoint::new(
            Uuid::nil(),
            Some(step.to_string()),
            Some(Event::named(input, json!({}))),
            Event::named(output, json!({})),
            ContextState::new(),
        )
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let boundary = Checkpoint::new(
            Uuid::nil(),
            None,
            None,
            Event::start(json!({})),
            ContextState::new(),
        );
        assert!(boundary.is_run_boundary());
        assert!(CheckpointFilter::new().matches(&boundary));
        assert!(CheckpointFilter::new().matches(&step_checkpoint("a", "x", "y")));
    }

    #[test]
    fn test_filter_by_step_name() {
        let ckpt = step_checkpoint("middle_step", "one", "last");
        assert!(CheckpointFilter::new().last_completed_step("middle_step").matches(&ckpt));
        assert!(!CheckpointFilter::new().last_completed_step("end_step").matches(&ckpt));
    }

    #[test]
    fn test_filter_by_event_types_is_conjunctive() {
        let ckpt = step_checkpoint("middle_step", "one", "last");
        let both = CheckpointFilter::new()
            .input_event_type(EventType::named("one"))
            .output_event_type(EventType::named("last"));
        assert!(both.matches(&ckpt));

        let wrong_output = CheckpointFilter::new()
            .input_event_type(EventType::named("one"))
            .output_event_type(EventType::Stop);
        assert!(!wrong_output.matches(&ckpt));
    }

    #[test]
    fn test_input_filter_skips_boundary_checkpoint() {
        let boundary = Checkpoint::new(
            Uuid::nil(),
            None,
            None,
            Event::start(json!({})),
            ContextState::new(),
        );
        let filter = CheckpointFilter::new().input_event_type(EventType::Start);
        assert!(!filter.matches(&boundary));
        let filter = CheckpointFilter::new().output_event_type(EventType::Start);
        assert!(filter.matches(&boundary));
    }
}
