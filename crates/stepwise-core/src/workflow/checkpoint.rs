//! Checkpoint broker for workflow step transitions.
//!
//! Wraps a `BrokerLog` to provide a higher-level API for recording step-level
//! checkpoints. Each completed step transition is appended as an immutable
//! `Checkpoint` so a run can be inspected afterwards or resumed from any
//! recorded point.

use std::sync::{Arc, RwLock};

use stepwise_types::checkpoint::{Checkpoint, CheckpointFilter, ContextState};
use stepwise_types::event::Event;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BrokerLog
// ---------------------------------------------------------------------------

/// Append-only storage for checkpoints.
///
/// Implementations must preserve append order. The in-memory log is the only
/// backend shipped; the trait exists so tests and embedders can observe or
/// replace the ledger.
pub trait BrokerLog: Send + Sync {
    fn append(&self, checkpoint: Checkpoint);

    /// All checkpoints in append order.
    fn entries(&self) -> Vec<Checkpoint>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `BrokerLog` held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryBrokerLog {
    entries: RwLock<Vec<Checkpoint>>,
}

impl InMemoryBrokerLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a log with existing checkpoints (used when restoring a context).
    pub fn from_entries(entries: Vec<Checkpoint>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl BrokerLog for InMemoryBrokerLog {
    fn append(&self, checkpoint: Checkpoint) {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(checkpoint);
    }

    fn entries(&self) -> Vec<Checkpoint> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

// ---------------------------------------------------------------------------
// CheckpointBroker
// ---------------------------------------------------------------------------

/// Records and queries the checkpoints of one context.
#[derive(Clone)]
pub struct CheckpointBroker {
    log: Arc<dyn BrokerLog>,
}

impl CheckpointBroker {
    /// Create a broker backed by the given log.
    pub fn new(log: Arc<dyn BrokerLog>) -> Self {
        Self { log }
    }

    /// Create a broker with an empty in-memory log.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBrokerLog::new()))
    }

    /// Access the underlying log.
    pub fn log(&self) -> &Arc<dyn BrokerLog> {
        &self.log
    }

    /// Build a checkpoint from a completed transition and append it.
    ///
    /// `ctx_state` must already be a detached copy of the store; the broker
    /// stores it as-is.
    pub fn create_checkpoint(
        &self,
        run_id: Uuid,
        last_completed_step: Option<&str>,
        input_event: Option<Event>,
        output_event: Event,
        ctx_state: ContextState,
    ) -> Checkpoint {
        let checkpoint = Checkpoint::new(
            run_id,
            last_completed_step.map(str::to_string),
            input_event,
            output_event,
            ctx_state,
        );
        self.log.append(checkpoint.clone());

        tracing::debug!(
            run_id = %run_id,
            step = last_completed_step.unwrap_or("<start>"),
            output_type = %checkpoint.output_event.event_type(),
            "checkpoint recorded"
        );

        checkpoint
    }

    /// Every checkpoint matching `filter`, in ledger order.
    pub fn filter(&self, filter: &CheckpointFilter) -> Vec<Checkpoint> {
        self.log
            .entries()
            .into_iter()
            .filter(|c| filter.matches(c))
            .collect()
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.log.entries()
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}

impl std::fmt::Debug for CheckpointBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointBroker")
            .field("len", &self.log.len())
            .finish()
    }
}
