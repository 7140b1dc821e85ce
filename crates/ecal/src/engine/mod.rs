//! Event processing: rules, monitors and the worker pool processor.

mod monitor;
mod processor;
mod rule;

pub use monitor::{Monitor, MonitorError};
pub use processor::Processor;
pub use rule::Rule;

use crate::value::{MapKey, Value, ValueMap};

/// An event injected into the processor.
///
/// The kind path classifies the event hierarchically and is what sink
/// `kindmatch` patterns are tested against. The state map carries arbitrary
/// payload data.
#[derive(Debug, Clone)]
pub struct Event {
    name: String,
    kind: Vec<String>,
    state: ValueMap,
}

impl Event {
    pub fn new(name: impl Into<String>, kind: Vec<String>, state: ValueMap) -> Self {
        Self {
            name: name.into(),
            kind,
            state,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &[String] {
        &self.kind
    }

    pub fn state(&self) -> &ValueMap {
        &self.state
    }

    /// The value bound to the `event` variable inside a triggered sink body.
    pub(crate) fn to_value(&self) -> Value {
        let mut map = ValueMap::new();
        map.insert(MapKey::Str("name".into()), Value::Str(self.name.clone()));
        map.insert(
            MapKey::Str("kind".into()),
            Value::Str(self.kind.join(".")),
        );
        map.insert(MapKey::Str("state".into()), Value::Map(self.state.clone()));
        map.insert(MapKey::Str("time".into()), Value::Number(now_micros()));
        Value::Map(map)
    }
}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event: {} {}", self.name, self.kind.join("."))
    }
}

/// Microseconds since the epoch as a double, the runtime's time unit.
pub(crate) fn now_micros() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64
}
