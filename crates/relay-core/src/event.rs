//! Telemetry records.
//!
//! Services build an [`EventInfo`]; the queue turns it into an [`Event`] at
//! enqueue time by fixing the timestamp and attaching the captured
//! [`Context`]. `Event` is what gets persisted and handed to the sender.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::attributes::Attributes;
use crate::context::Context;

/// Namespace used by every event the SDK emits on its own behalf.
pub const ROVER_NAMESPACE: &str = "rover";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInfo {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub attributes: Attributes,
    /// Preset timestamp; `None` means "stamp when enqueued".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventInfo {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            namespace: namespace.into(),
            attributes,
            timestamp: None,
        }
    }

    /// An event in the SDK's own namespace.
    pub fn rover(name: impl Into<String>, attributes: Attributes) -> Self {
        Self::new(name, ROVER_NAMESPACE, attributes)
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// A queued event. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub name: String,
    pub namespace: String,
    pub attributes: Attributes,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub context: Context,
}

impl Event {
    pub fn from_info(info: &EventInfo, context: Context) -> Self {
        Self {
            id: info.id,
            name: info.name.clone(),
            namespace: info.namespace.clone(),
            attributes: info.attributes.clone(),
            timestamp: info.timestamp.unwrap_or_else(Utc::now),
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_info_gets_a_fresh_identity() {
        let a = EventInfo::rover("Testing Enabled", Attributes::new());
        let b = EventInfo::rover("Testing Enabled", Attributes::new());
        assert_ne!(a.id, b.id);
        assert_eq!(a.namespace, "rover");
    }

    #[test]
    fn preset_timestamp_is_kept_on_enqueue() {
        let ts = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let info = EventInfo::new("Screen Viewed", "app", Attributes::new()).at(ts);
        let event = Event::from_info(&info, Context::new());
        assert_eq!(event.timestamp, ts);
        assert_eq!(event.id, info.id);
    }

    #[test]
    fn missing_timestamp_is_stamped_now() {
        let before = Utc::now();
        let event = Event::from_info(&EventInfo::rover("x", Attributes::new()), Context::new());
        assert!(event.timestamp >= before);
    }
}
