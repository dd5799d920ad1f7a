//! Event types shared by the kernel event source, the control-socket
//! servers and the correlation engine.
//!
//! All sources publish [`MonitorEvent`]s onto one unbounded
//! multi-producer/single-consumer channel; the correlation engine is the
//! sole consumer.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Attribute key carrying the kernel device path on device events.
pub const ATTR_PATH: &str = "path";
/// Attribute key carrying the resolved container id on trigger events.
pub const ATTR_CONTAINER: &str = "container";
/// Attribute key carrying the trigger scope on trigger events.
pub const ATTR_MODE: &str = "mode";

/// Producer half of the shared event bus.
pub type EventSender = tokio::sync::mpsc::UnboundedSender<MonitorEvent>;
/// Consumer half of the shared event bus.
pub type EventReceiver = tokio::sync::mpsc::UnboundedReceiver<MonitorEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    DeviceAdded,
    DeviceRemoved,
    TriggerOpened,
    TriggerClosed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::DeviceAdded => "DeviceAdded",
            EventKind::DeviceRemoved => "DeviceRemoved",
            EventKind::TriggerOpened => "TriggerOpened",
            EventKind::TriggerClosed => "TriggerClosed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event observed by a source component. Consumed exactly once by the
/// correlation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorEvent {
    pub kind: EventKind,
    pub timestamp: Instant,
    pub attributes: HashMap<String, String>,
}

impl MonitorEvent {
    /// Creates a device add/remove event for the given kernel device path.
    pub fn device(kind: EventKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Instant::now(),
            attributes: HashMap::from([(ATTR_PATH.to_owned(), path.into())]),
        }
    }

    /// Creates a trigger open/close event attributed to `container`.
    pub fn trigger(kind: EventKind, container: impl Into<String>, scope: TriggerScope) -> Self {
        Self {
            kind,
            timestamp: Instant::now(),
            attributes: HashMap::from([
                (ATTR_CONTAINER.to_owned(), container.into()),
                (ATTR_MODE.to_owned(), scope.as_str().to_owned()),
            ]),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Scope a trigger applies to: the requesting container alone or every
/// container in its pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerScope {
    Container,
    Pod,
}

impl TriggerScope {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerScope::Container => "CONTAINER",
            TriggerScope::Pod => "POD",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown trigger scope: {0}")]
pub struct ScopeParseError(String);

impl FromStr for TriggerScope {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONTAINER" => Ok(TriggerScope::Container),
            "POD" => Ok(TriggerScope::Pod),
            other => Err(ScopeParseError(other.to_owned())),
        }
    }
}
