//! Broadcast bus carrying `StreamEvent`s for every run on a context.
//!
//! One bus is shared by all runs of a `Context`, so subscribers narrow it to a
//! single run with [`EventBus::subscribe_run`] or [`run_events`]. Publishing
//! with no active subscribers is a no-op.

use futures_util::Stream;
use stepwise_types::stream::StreamEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Multi-consumer bus for workflow stream events.
///
/// Wraps a `tokio::sync::broadcast` channel. Cloning the bus clones the
/// sender, allowing multiple producers and consumers.
pub struct EventBus {
    sender: broadcast::Sender<StreamEvent>,
}

impl EventBus {
    /// Create a new event bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Create a new subscriber that will receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no subscribers, the event is silently dropped.
    pub fn publish(&self, event: StreamEvent) {
        let _ = self.sender.send(event);
    }

    /// Stream of the events of `run_id` published from now on, ending after
    /// that run's terminal event.
    pub fn subscribe_run(&self, run_id: Uuid) -> impl Stream<Item = StreamEvent> + Send + use<> {
        run_events(self.subscribe(), run_id)
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Narrow an existing subscription to the events of `run_id`.
///
/// Events of other runs are skipped. The stream ends after `RunCompleted` or
/// `RunFailed` for `run_id`, or when the bus is dropped. Lagging subscribers
/// log a warning and keep reading.
pub fn run_events(
    mut rx: broadcast::Receiver<StreamEvent>,
    run_id: Uuid,
) -> impl Stream<Item = StreamEvent> + Send {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) if event.run_id() != run_id => continue,
                Ok(event) => {
                    let terminal = event.is_terminal();
                    yield event;
                    if terminal {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(%run_id, skipped, "stream subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
