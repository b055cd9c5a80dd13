//! Stream events published while a workflow runs.
//!
//! `StreamEvent` is broadcast on a context's event bus. The scheduler emits
//! the lifecycle variants; step handlers publish `Custom` events through
//! `Context::write_event_to_stream`. All variants are Clone + Send + Sync for
//! use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::Event;

/// Events observed by stream subscribers during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
    },

    /// A step worker picked an accepted event off its queue.
    StepStarted {
        run_id: Uuid,
        step_name: String,
        event_type: String,
    },

    StepCompleted {
        run_id: Uuid,
        step_name: String,
        duration_ms: u64,
        /// Type of the produced event, if any.
        output_type: Option<String>,
    },

    StepFailed {
        run_id: Uuid,
        step_name: String,
        error: String,
    },

    /// An event written by a step handler.
    Custom { run_id: Uuid, event: Event },

    RunCompleted {
        run_id: Uuid,
        workflow_name: String,
        duration_ms: u64,
    },

    RunFailed {
        run_id: Uuid,
        workflow_name: String,
        error: String,
    },
}

impl StreamEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            StreamEvent::RunStarted { run_id, .. }
            | StreamEvent::StepStarted { run_id, .. }
            | StreamEvent::StepCompleted { run_id, .. }
            | StreamEvent::StepFailed { run_id, .. }
            | StreamEvent::Custom { run_id, .. }
            | StreamEvent::RunCompleted { run_id, .. }
            | StreamEvent::RunFailed { run_id, .. } => *run_id,
        }
    }

    /// Whether this is the last event a run publishes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StreamEvent::RunCompleted { .. } | StreamEvent::RunFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_completed_serde_roundtrip() {
        let event = StreamEvent::StepCompleted {
            run_id: Uuid::now_v7(),
            step_name: "start_step".to_string(),
            duration_ms: 12,
            output_type: Some("one_test_event".to_string()),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"step_completed\""));
        let parsed: StreamEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, StreamEvent::StepCompleted { duration_ms: 12, .. }));
    }

    #[test]
    fn test_custom_event_carries_payload() {
        let run_id = Uuid::now_v7();
        let event = StreamEvent::Custom {
            run_id,
            event: Event::named("progress", json!({"pct": 50})),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"custom\""));
        assert_eq!(event.run_id(), run_id);
        assert!(!event.is_terminal());
    }

    #[test]
    fn test_terminal_variants() {
        let done = StreamEvent::RunCompleted {
            run_id: Uuid::nil(),
            workflow_name: "w".to_string(),
            duration_ms: 1,
        };
        let failed = StreamEvent::RunFailed {
            run_id: Uuid::nil(),
            workflow_name: "w".to_string(),
            error: "boom".to_string(),
        };
        assert!(done.is_terminal());
        assert!(failed.is_terminal());
    }
}
