//! Event types routed between workflow steps.
//!
//! An [`Event`] is an immutable tagged value: a type identity ([`EventType`])
//! plus a JSON payload. Two variants of `EventType` are reserved: `Start`
//! seeds a run and `Stop` terminates it, carrying the run's result.

use std::borrow::Cow;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// EventType
// ---------------------------------------------------------------------------

/// Type identity of an event.
///
/// Routing, step acceptance, aggregation and checkpoint filtering all match
/// on this value, never on payload contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// Seeds a workflow run.
    Start,
    /// Terminates a workflow run; the payload becomes the run result.
    Stop,
    /// An application-defined event type.
    Named(Cow<'static, str>),
}

impl EventType {
    /// Wire name of the start type.
    pub const START_NAME: &'static str = "start";
    /// Wire name of the stop type.
    pub const STOP_NAME: &'static str = "stop";

    /// Build an application event type from a static name, usable in `const`.
    ///
    /// Unlike [`EventType::named`], the reserved names are not normalized.
    pub const fn from_static(name: &'static str) -> Self {
        EventType::Named(Cow::Borrowed(name))
    }

    /// Build an event type from a runtime name.
    ///
    /// `"start"` and `"stop"` map onto the reserved variants.
    pub fn named(name: impl Into<String>) -> Self {
        EventType::from(name.into())
    }

    /// The type name.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Start => Self::START_NAME,
            EventType::Stop => Self::STOP_NAME,
            EventType::Named(name) => name.as_ref(),
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, EventType::Start)
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, EventType::Stop)
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        match name.as_str() {
            Self::START_NAME => EventType::Start,
            Self::STOP_NAME => EventType::Stop,
            _ => EventType::Named(Cow::Owned(name)),
        }
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        EventType::from(name.to_string())
    }
}

impl From<EventType> for String {
    fn from(ty: EventType) -> Self {
        ty.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A typed message passed between steps.
///
/// Every event gets a fresh UUIDv7 at construction, so equality holds between
/// an event and its clones but not between two events built separately from
/// the same payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: Uuid,
    event_type: EventType,
    #[serde(default)]
    payload: Value,
}

impl Event {
    /// Create an event of the given type.
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_type,
            payload,
        }
    }

    /// Create an application event by type name.
    pub fn named(name: impl Into<String>, payload: Value) -> Self {
        Self::new(EventType::named(name), payload)
    }

    /// Create a start event carrying the run input.
    pub fn start(input: Value) -> Self {
        Self::new(EventType::Start, input)
    }

    /// Create a stop event carrying the run result.
    pub fn stop(result: Value) -> Self {
        Self::new(EventType::Stop, result)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Consume the event and return its payload.
    pub fn into_payload(self) -> Value {
        self.payload
    }

    /// Look up a top-level payload field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    pub fn is_start(&self) -> bool {
        self.event_type.is_start()
    }

    pub fn is_stop(&self) -> bool {
        self.event_type.is_stop()
    }
}
