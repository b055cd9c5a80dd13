//! Awaitable handle for one workflow run.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use stepwise_types::stream::StreamEvent;
use stepwise_types::workflow::RunStatus;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::Context;
use crate::event::run_events;
use super::executor::ExecutorError;

/// Handle returned by `Workflow::run`.
///
/// Awaiting it yields the run's result. The outcome is cached, so
/// `(&mut handler).await` may be repeated and returns the same value.
pub struct WorkflowHandler {
    ctx: Context,
    run_id: Uuid,
    task: Option<JoinHandle<Result<Value, ExecutorError>>>,
    outcome: Option<Result<Value, ExecutorError>>,
    cancel: CancellationToken,
    status: watch::Receiver<RunStatus>,
    stream: Option<broadcast::Receiver<StreamEvent>>,
}

impl WorkflowHandler {
    pub(crate) fn spawned(
        ctx: Context,
        run_id: Uuid,
        task: JoinHandle<Result<Value, ExecutorError>>,
        cancel: CancellationToken,
        status: watch::Receiver<RunStatus>,
        stream: broadcast::Receiver<StreamEvent>,
    ) -> Self {
        Self {
            ctx,
            run_id,
            task: Some(task),
            outcome: None,
            cancel,
            status,
            stream: Some(stream),
        }
    }

    /// A handle for a run that was rejected before it started.
    pub(crate) fn resolved(ctx: Context, run_id: Uuid, outcome: Result<Value, ExecutorError>) -> Self {
        let status = if outcome.is_ok() {
            RunStatus::Stopped
        } else {
            RunStatus::Failed
        };
        let (_tx, status) = watch::channel(status);
        Self {
            ctx,
            run_id,
            task: None,
            outcome: Some(outcome),
            cancel: CancellationToken::new(),
            status,
            stream: None,
        }
    }

    /// The context this run reads and writes.
    pub fn ctx(&self) -> &Context {
        &self.ctx
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_some() || self.task.as_ref().is_some_and(JoinHandle::is_finished)
    }

    /// Request cancellation. The run resolves with `ExecutorError::Cancelled`
    /// unless it already finished.
    pub fn cancel(&self) {
        if !self.is_done() {
            tracing::debug!(run_id = %self.run_id, "cancelling workflow run");
        }
        self.cancel.cancel();
    }

    /// Stream of this run's events, ending with its `RunCompleted` or
    /// `RunFailed` event.
    ///
    /// The first call sees every event since the run started; later calls
    /// only see events published after they subscribe.
    pub fn stream_events(&mut self) -> impl Stream<Item = StreamEvent> + Send + use<> {
        let receiver = match self.stream.take() {
            Some(rx) => Some(rx),
            None if self.is_done() => None,
            None => Some(self.ctx.subscribe()),
        };
        match receiver {
            Some(rx) => run_events(rx, self.run_id).left_stream(),
            None => futures_util::stream::empty().right_stream(),
        }
    }
}

impl Future for WorkflowHandler {
    type Output = Result<Value, ExecutorError>;

    fn poll(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(outcome) = &this.outcome {
            return Poll::Ready(outcome.clone());
        }
        let Some(task) = this.task.as_mut() else {
            return Poll::Ready(Err(ExecutorError::TaskJoin(
                "run task missing".to_string(),
            )));
        };

        let outcome = match Pin::new(task).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            Poll::Ready(Err(err)) => Err(ExecutorError::TaskJoin(err.to_string())),
        };
        this.task = None;
        this.outcome = Some(outcome.clone());
        Poll::Ready(outcome)
    }
}

impl std::fmt::Debug for WorkflowHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandler")
            .field("run_id", &self.run_id)
            .field("status", &self.status())
            .field("done", &self.is_done())
            .finish()
    }
}
