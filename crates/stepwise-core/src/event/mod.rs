//! Event bus for workflow run streaming.
//!
//! Provides an `EventBus` that distributes `StreamEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel, and `run_events` to
//! follow a single run.

pub mod bus;

pub use bus::{EventBus, run_events};
