//! Per-step inbound event queues.
//!
//! Every step owns one FIFO queue. Producers (the scheduler and any step
//! calling `send_event`) push concurrently; the step's workers pop. The
//! `EventQueue` trait is the seam that lets tests substitute a recording
//! queue through `ContextBuilder::queue_factory`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use stepwise_types::event::Event;
use tokio::sync::{Mutex, mpsc};

/// Object-safe FIFO of events for a single step.
pub trait EventQueue: Send + Sync {
    /// Enqueue at the back. Never blocks.
    fn push(&self, event: Event);

    /// Wait for the front event. Resolves to `None` once the queue can no
    /// longer produce events.
    fn pop(&self) -> Pin<Box<dyn Future<Output = Option<Event>> + Send + '_>>;

    /// Number of queued events.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued event, returning how many were discarded.
    fn clear(&self) -> usize;
}

/// Builds the queue for a step name. Called lazily, once per step.
pub type QueueFactory = Arc<dyn Fn(&str) -> Arc<dyn EventQueue> + Send + Sync>;

/// The default factory, producing [`ChannelQueue`]s.
pub fn channel_queue_factory() -> QueueFactory {
    Arc::new(|_step: &str| Arc::new(ChannelQueue::new()) as Arc<dyn EventQueue>)
}

// ---------------------------------------------------------------------------
// ChannelQueue
// ---------------------------------------------------------------------------

/// Unbounded queue backed by a tokio mpsc channel.
///
/// The receiver sits behind an async mutex so several workers of the same
/// step can share it; each event is delivered to exactly one of them.
pub struct ChannelQueue {
    sender: mpsc::UnboundedSender<Event>,
    receiver: Mutex<mpsc::UnboundedReceiver<Event>>,
    depth: AtomicUsize,
}

impl ChannelQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
            depth: AtomicUsize::new(0),
        }
    }
}

impl Default for ChannelQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue for ChannelQueue {
    fn push(&self, event: Event) {
        // Count first so a racing pop never decrements below zero.
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(event).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn pop(&self) -> Pin<Box<dyn Future<Output = Option<Event>> + Send + '_>> {
        Box::pin(async move {
            let mut receiver = self.receiver.lock().await;
            let event = receiver.recv().await;
            if event.is_some() {
                self.depth.fetch_sub(1, Ordering::SeqCst);
            }
            event
        })
    }

    fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    fn clear(&self) -> usize {
        // A worker parked in `pop` holds the lock; the scheduler only clears
        // after its workers have shut down.
        let Ok(mut receiver) = self.receiver.try_lock() else {
            return 0;
        };
        let mut dropped = 0;
        while receiver.try_recv().is_ok() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            dropped += 1;
        }
        dropped
    }
}

impl std::fmt::Debug for ChannelQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelQueue")
            .field("len", &self.len())
            .finish()
    }
}
