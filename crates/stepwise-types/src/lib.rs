//! Shared domain types for Stepwise.
//!
//! This crate contains the data types used across the Stepwise workflow
//! engine: events, checkpoints, step configuration, stream events and engine
//! configuration.
//!
//! No runtime dependencies beyond serde, serde_json, uuid and chrono.

pub mod checkpoint;
pub mod config;
pub mod event;
pub mod stream;
pub mod workflow;
