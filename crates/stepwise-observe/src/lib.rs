//! Observability setup for Stepwise.
//!
//! The engine crates only emit `tracing` events and spans; binaries and test
//! suites call into this crate to install a subscriber.

pub mod tracing_setup;
