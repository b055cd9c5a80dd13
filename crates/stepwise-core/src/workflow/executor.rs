//! Workflow run loop: step workers, routing and checkpointing.
//!
//! `Workflow::run` claims a `Context`, records the run-boundary checkpoint,
//! seeds the queues and spawns a driver task. The driver spawns
//! `num_workers` worker tasks per step into a `JoinSet` and then waits on
//! three things at once: step signals, worker exits and cancellation.
//!
//! # Execution flow
//!
//! 1. Workers pop their step's queue, skip event types the step does not
//!    accept, and race the handler against the run's cancellation token.
//! 2. Each finished handler reports a `RunSignal` to the driver.
//! 3. For an output event the driver appends a checkpoint (so ledger order
//!    equals completion order) and routes it to the step's target, or to
//!    every step when no target is set.
//! 4. A stop event, step error, timeout or cancellation ends the run. Workers
//!    are cancelled, undelivered events are drained and the context is
//!    released for the next run.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde_json::Value;
use stepwise_types::checkpoint::{Checkpoint, ContextState};
use stepwise_types::event::Event;
use stepwise_types::stream::StreamEvent;
use stepwise_types::workflow::RunStatus;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::{Context, ContextError};
use super::definition::Workflow;
use super::handler::WorkflowHandler;
use super::queue::EventQueue;
use super::step::StepDescriptor;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Why a run did not produce a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("step '{step}' failed: {error}")]
    StepFailed { step: String, error: String },

    /// A step's output could not be routed.
    #[error("routing failed: {0}")]
    Routing(#[from] ContextError),

    #[error("workflow timed out after {0:?}")]
    Timeout(Duration),

    #[error("workflow run was cancelled")]
    Cancelled,

    /// The context is already driving the given run.
    #[error("context is already running workflow run {0}")]
    ContextBusy(Uuid),

    /// The context was built for a different workflow.
    #[error("context does not belong to workflow '{0}'")]
    WorkflowMismatch(String),

    #[error("run task failed: {0}")]
    TaskJoin(String),
}

// ---------------------------------------------------------------------------
// Worker -> driver signals
// ---------------------------------------------------------------------------

pub(crate) enum RunSignal {
    Completed {
        step: String,
        input: Event,
        output: Option<Event>,
        duration_ms: u64,
    },
    Failed {
        step: String,
        error: String,
    },
    /// A stop event broadcast through `Context::send_event`.
    Stop(Event),
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

impl Workflow {
    /// Start a run with an empty start payload.
    ///
    /// Uses a fresh context when `ctx` is `None`. Must be called from within
    /// a tokio runtime.
    pub fn run(&self, ctx: Option<Context>) -> WorkflowHandler {
        self.run_with_input(ctx, Value::Object(Default::default()))
    }

    /// Start a run whose start event carries `input`.
    pub fn run_with_input(&self, ctx: Option<Context>, input: Value) -> WorkflowHandler {
        self.launch(ctx, Event::start(input), None, None)
    }

    /// Resume from `checkpoint`: the store is reset to the checkpoint's state
    /// and its output event is re-emitted in place of a start event.
    ///
    /// The event is routed as the completing step routed it: to that step's
    /// target when it has one, otherwise to every step.
    pub fn run_from(&self, checkpoint: &Checkpoint, ctx: Option<Context>) -> WorkflowHandler {
        tracing::info!(
            workflow = self.name(),
            checkpoint_id = %checkpoint.id,
            step = checkpoint.last_completed_step.as_deref().unwrap_or("<start>"),
            "resuming workflow from checkpoint"
        );
        let target = checkpoint
            .last_completed_step
            .as_deref()
            .filter(|_| !checkpoint.output_event.is_stop())
            .and_then(|step| self.step(step))
            .and_then(|step| step.config().target());
        self.launch(
            ctx,
            checkpoint.output_event.clone(),
            target,
            Some(checkpoint.ctx_state.clone()),
        )
    }

    fn launch(
        &self,
        ctx: Option<Context>,
        seed: Event,
        seed_target: Option<&str>,
        restore: Option<ContextState>,
    ) -> WorkflowHandler {
        let ctx = ctx.unwrap_or_else(|| Context::new(self));
        let run_id = Uuid::now_v7();

        if !ctx.belongs_to(self) {
            return WorkflowHandler::resolved(
                ctx,
                run_id,
                Err(ExecutorError::WorkflowMismatch(self.name().to_string())),
            );
        }

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        if let Err(err) = ctx.begin_run(run_id, signal_tx.clone()) {
            tracing::warn!(workflow = self.name(), error = %err, "rejecting concurrent run");
            return WorkflowHandler::resolved(ctx, run_id, Err(err));
        }

        // Subscribe before anything is published so the stream sees RunStarted.
        let stream = ctx.subscribe();

        if let Some(state) = restore {
            ctx.restore_store(state);
        }
        ctx.create_checkpoint(None, None, seed.clone());
        if let Err(err) = ctx.send_event(seed, seed_target) {
            ctx.end_run(run_id);
            return WorkflowHandler::resolved(ctx, run_id, Err(err.into()));
        }

        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(RunStatus::Pending);
        let driver = RunDriver {
            workflow: self.clone(),
            ctx: ctx.clone(),
            run_id,
            signals: signal_rx,
            signal_tx,
            cancel: cancel.clone(),
            status: status_tx,
        };
        let task = tokio::spawn(driver.drive());

        WorkflowHandler::spawned(ctx, run_id, task, cancel, status_rx, stream)
    }
}

// ---------------------------------------------------------------------------
// RunDriver
// ---------------------------------------------------------------------------

struct RunDriver {
    workflow: Workflow,
    ctx: Context,
    run_id: Uuid,
    signals: mpsc::UnboundedReceiver<RunSignal>,
    signal_tx: mpsc::UnboundedSender<RunSignal>,
    cancel: CancellationToken,
    status: watch::Sender<RunStatus>,
}

impl RunDriver {
    async fn drive(mut self) -> Result<Value, ExecutorError> {
        let started = Instant::now();
        let workflow_name = self.workflow.name().to_string();

        self.status.send_replace(RunStatus::Running);
        self.ctx.bus().publish(StreamEvent::RunStarted {
            run_id: self.run_id,
            workflow_name: workflow_name.clone(),
        });
        tracing::info!(run_id = %self.run_id, workflow = %workflow_name, "workflow run started");

        let mut workers = self.spawn_workers();
        let outcome = match self.workflow.config().timeout() {
            Some(limit) => tokio::time::timeout(limit, self.event_loop(&mut workers))
                .await
                .unwrap_or(Err(ExecutorError::Timeout(limit))),
            None => self.event_loop(&mut workers).await,
        };

        self.cancel.cancel();
        workers.shutdown().await;
        let dropped = self.ctx.clear_queues();
        if dropped > 0 {
            tracing::debug!(run_id = %self.run_id, dropped, "drained undelivered events");
        }
        self.ctx.end_run(self.run_id);

        let duration_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => {
                self.status.send_replace(RunStatus::Stopped);
                self.ctx.bus().publish(StreamEvent::RunCompleted {
                    run_id: self.run_id,
                    workflow_name: workflow_name.clone(),
                    duration_ms,
                });
                tracing::info!(
                    run_id = %self.run_id,
                    workflow = %workflow_name,
                    duration_ms,
                    "workflow run completed"
                );
            }
            Err(err) => {
                self.status.send_replace(RunStatus::Failed);
                self.ctx.bus().publish(StreamEvent::RunFailed {
                    run_id: self.run_id,
                    workflow_name: workflow_name.clone(),
                    error: err.to_string(),
                });
                tracing::warn!(
                    run_id = %self.run_id,
                    workflow = %workflow_name,
                    error = %err,
                    "workflow run failed"
                );
            }
        }

        outcome
    }

    fn spawn_workers(&self) -> JoinSet<()> {
        let mut workers = JoinSet::new();
        let verbose = self.workflow.config().verbose;
        for step in self.workflow.steps() {
            let queue = self.ctx.queue_for(step.name());
            for _ in 0..step.config().num_workers() {
                let worker = StepWorker {
                    step: step.clone(),
                    ctx: self.ctx.clone(),
                    queue: Arc::clone(&queue),
                    signals: self.signal_tx.clone(),
                    cancel: self.cancel.child_token(),
                    run_id: self.run_id,
                    verbose,
                };
                workers.spawn(worker.run());
            }
        }
        workers
    }

    async fn event_loop(&mut self, workers: &mut JoinSet<()>) -> Result<Value, ExecutorError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ExecutorError::Cancelled),
                Some(joined) = workers.join_next() => {
                    if let Err(err) = joined {
                        return Err(ExecutorError::TaskJoin(err.to_string()));
                    }
                }
                signal = self.signals.recv() => {
                    // The driver holds a sender, so the channel cannot close.
                    let Some(signal) = signal else {
                        return Err(ExecutorError::Cancelled);
                    };
                    if let Some(result) = self.handle_signal(signal)? {
                        return Ok(result);
                    }
                }
            }
        }
    }

    /// Apply one worker signal. `Some` means the run resolved.
    fn handle_signal(&self, signal: RunSignal) -> Result<Option<Value>, ExecutorError> {
        match signal {
            RunSignal::Completed {
                step,
                input,
                output,
                duration_ms,
            } => {
                self.ctx.bus().publish(StreamEvent::StepCompleted {
                    run_id: self.run_id,
                    step_name: step.clone(),
                    duration_ms,
                    output_type: output.as_ref().map(|ev| ev.event_type().to_string()),
                });

                let Some(output) = output else {
                    return Ok(None);
                };
                self.ctx.create_checkpoint(Some(&step), Some(input), output.clone());

                if output.is_stop() {
                    return Ok(Some(self.resolve(output)));
                }
                let target = self.workflow.step(&step).and_then(|s| s.config().target());
                self.ctx.send_event(output, target)?;
                Ok(None)
            }
            RunSignal::Failed { step, error } => {
                self.ctx.bus().publish(StreamEvent::StepFailed {
                    run_id: self.run_id,
                    step_name: step.clone(),
                    error: error.clone(),
                });
                Err(ExecutorError::StepFailed { step, error })
            }
            RunSignal::Stop(event) => Ok(Some(self.resolve(event))),
        }
    }

    fn resolve(&self, stop: Event) -> Value {
        let result = stop.into_payload();
        self.ctx.set_result(result.clone());
        result
    }
}

// ---------------------------------------------------------------------------
// StepWorker
// ---------------------------------------------------------------------------

/// One consumer of a step's queue.
struct StepWorker {
    step: StepDescriptor,
    ctx: Context,
    queue: Arc<dyn EventQueue>,
    signals: mpsc::UnboundedSender<RunSignal>,
    cancel: CancellationToken,
    run_id: Uuid,
    verbose: bool,
}

impl StepWorker {
    async fn run(self) {
        let handler = self.step.handler();
        let name = self.step.name();

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = self.queue.pop() => match event {
                    Some(event) => event,
                    None => return,
                },
            };
            if !self.step.config().accepts_type(event.event_type()) {
                continue;
            }

            if self.verbose {
                tracing::info!(run_id = %self.run_id, step = name, event_type = %event.event_type(), "running step");
            } else {
                tracing::debug!(run_id = %self.run_id, step = name, event_type = %event.event_type(), "running step");
            }
            self.ctx.bus().publish(StreamEvent::StepStarted {
                run_id: self.run_id,
                step_name: name.to_string(),
                event_type: event.event_type().to_string(),
            });

            let started = Instant::now();
            let invocation = AssertUnwindSafe(handler.run_boxed(self.ctx.clone(), event.clone()));
            let outcome = tokio::select! {
                _ = self.cancel.cancelled() => return,
                outcome = invocation.catch_unwind() => outcome,
            };

            let signal = match outcome {
                Ok(Ok(output)) => RunSignal::Completed {
                    step: name.to_string(),
                    input: event,
                    output,
                    duration_ms: started.elapsed().as_millis() as u64,
                },
                Ok(Err(err)) => RunSignal::Failed {
                    step: name.to_string(),
                    error: format!("{err:#}"),
                },
                Err(_) => RunSignal::Failed {
                    step: name.to_string(),
                    error: "step handler panicked".to_string(),
                },
            };
            let failed = matches!(signal, RunSignal::Failed { .. });
            if self.signals.send(signal).is_err() || failed {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
