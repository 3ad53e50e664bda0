use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Milliseconds since the Unix epoch.
///
/// Signed so that zero, negative and future-dated values coming from
/// persisted state can be represented and clamped rather than rejected.
pub type Timestamp = i64;

pub const SECOND_MS: Timestamp = 1_000;
pub const MINUTE_MS: Timestamp = 60 * SECOND_MS;
pub const DAY_MS: Timestamp = 24 * 60 * MINUTE_MS;

/// Filter value matching every event type.
pub const WILDCARD: &str = "*";

/// A domain event produced by a poller.
///
/// Serializes as `{"type": ..., "data": ...}`, which is also the body
/// sent to webhook subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(rename = "data")]
    pub payload: Value,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// A registration as persisted by a subscription store.
///
/// `events_serialized` holds a JSON array of event type filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub target: String,
    pub events_serialized: String,
}

impl SubscriptionRecord {
    pub fn new(target: impl Into<String>, events_serialized: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            events_serialized: events_serialized.into(),
        }
    }

    /// Build a record from a plain filter list.
    pub fn with_filters<I, S>(target: impl Into<String>, filters: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filters: Vec<String> = filters.into_iter().map(Into::into).collect();
        Self {
            target: target.into(),
            events_serialized: Value::from(filters).to_string(),
        }
    }
}

/// A parsed webhook subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub target: String,
    pub event_type_filters: HashSet<String>,
}

impl Subscription {
    /// Decode the serialized filter list of a stored registration.
    pub fn parse(record: &SubscriptionRecord) -> Result<Self, StoreError> {
        let filters: Vec<String> = serde_json::from_str(&record.events_serialized)
            .map_err(|e| StoreError::Decode(format!("{}: {}", record.target, e)))?;

        Ok(Self {
            target: record.target.clone(),
            event_type_filters: filters.into_iter().collect(),
        })
    }

    pub fn matches(&self, event_type: &str) -> bool {
        self.event_type_filters.contains(WILDCARD) || self.event_type_filters.contains(event_type)
    }
}

/// What requested a poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollSource {
    /// The initial cache-warming poll run by `start()`. Never emits.
    Seed,
    /// A coalesced burst of change notifications.
    Debounced,
    /// The periodic backstop timer.
    Fallback,
}

impl fmt::Display for PollSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollSource::Seed => write!(f, "seed"),
            PollSource::Debounced => write!(f, "debounced"),
            PollSource::Fallback => write!(f, "fallback"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serializes_as_type_and_data() {
        let event = DomainEvent::new("msg-new", json!({ "id": 1 }));
        let body = serde_json::to_value(&event).unwrap();
        assert_eq!(body, json!({ "type": "msg-new", "data": { "id": 1 } }));
    }

    #[test]
    fn wildcard_matches_everything() {
        let sub = Subscription::parse(&SubscriptionRecord::with_filters("http://a", ["*"])).unwrap();
        assert!(sub.matches("msg-new"));
        assert!(sub.matches("anything"));
    }

    #[test]
    fn exact_filter_does_not_match_other_types() {
        let sub =
            Subscription::parse(&SubscriptionRecord::with_filters("http://a", ["msg-deleted"])).unwrap();
        assert!(sub.matches("msg-deleted"));
        assert!(!sub.matches("msg-new"));
    }

    #[test]
    fn malformed_filters_are_rejected() {
        let record = SubscriptionRecord::new("http://a", "not json");
        assert!(matches!(Subscription::parse(&record), Err(StoreError::Decode(_))));
    }
}
