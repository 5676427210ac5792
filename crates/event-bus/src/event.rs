use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The domain an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AggregateType {
    Entity,
    User,
}

impl AggregateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateType::Entity => "entity",
            AggregateType::User => "user",
        }
    }
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the aggregate.
///
/// Closed set: every consumer matches on it exhaustively. User events are
/// published by a peer service and only pass through this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    EntityCreated,
    EntityUpdated,
    EntityDeleted,
    UserCreated,
    UserUpdated,
    UserDeleted,
}

impl EventType {
    /// All event types relevant to the entity read model.
    pub const ENTITY: [EventType; 3] = [
        EventType::EntityCreated,
        EventType::EntityUpdated,
        EventType::EntityDeleted,
    ];

    pub fn aggregate(&self) -> AggregateType {
        match self {
            EventType::EntityCreated | EventType::EntityUpdated | EventType::EntityDeleted => {
                AggregateType::Entity
            }
            EventType::UserCreated | EventType::UserUpdated | EventType::UserDeleted => {
                AggregateType::User
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::EntityCreated => "entity-created",
            EventType::EntityUpdated => "entity-updated",
            EventType::EntityDeleted => "entity-deleted",
            EventType::UserCreated => "user-created",
            EventType::UserUpdated => "user-updated",
            EventType::UserDeleted => "user-deleted",
        }
    }

    /// Parses the wire name produced by [`EventType::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        let parsed = match value {
            "entity-created" => EventType::EntityCreated,
            "entity-updated" => EventType::EntityUpdated,
            "entity-deleted" => EventType::EntityDeleted,
            "user-created" => EventType::UserCreated,
            "user-updated" => EventType::UserUpdated,
            "user-deleted" => EventType::UserDeleted,
            _ => return None,
        };
        Some(parsed)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable fact about one aggregate.
///
/// `body` holds the JSON-serialized payload whose shape is dictated by
/// `event_type`. Events are routed and applied, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The aggregate this event concerns.
    pub aggregate_type: AggregateType,

    /// The kind of change.
    pub event_type: EventType,

    /// Serialized payload.
    pub body: Vec<u8>,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    /// Free-form metadata (correlation ids, origin).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Event {
    /// Builds an event by serializing `payload` as its body.
    pub fn make<T: Serialize + ?Sized>(
        event_type: EventType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::from_raw(event_type, serde_json::to_vec(payload)?))
    }

    /// Builds an event around an already serialized body.
    pub fn from_raw(event_type: EventType, body: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: EventId::new(),
            aggregate_type: event_type.aggregate(),
            event_type,
            body: body.into(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Adds a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Deserializes the body into `T`.
    pub fn decode_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_new_creates_unique_ids() {
        assert_ne!(EventId::new(), EventId::new());
    }

    #[test]
    fn event_type_wire_names_parse_back() {
        for event_type in [
            EventType::EntityCreated,
            EventType::EntityUpdated,
            EventType::EntityDeleted,
            EventType::UserCreated,
            EventType::UserUpdated,
            EventType::UserDeleted,
        ] {
            assert_eq!(EventType::parse(event_type.as_str()), Some(event_type));
            let json = serde_json::to_string(&event_type).unwrap();
            assert_eq!(json, format!("\"{}\"", event_type.as_str()));
        }
        assert_eq!(EventType::parse("order-created"), None);
    }

    #[test]
    fn aggregate_follows_event_type() {
        assert_eq!(EventType::EntityDeleted.aggregate(), AggregateType::Entity);
        assert_eq!(EventType::UserDeleted.aggregate(), AggregateType::User);
        assert!(
            EventType::ENTITY
                .iter()
                .all(|t| t.aggregate() == AggregateType::Entity)
        );
    }

    #[test]
    fn make_serializes_payload_into_body() {
        let event = Event::make(EventType::EntityDeleted, "a").unwrap();
        assert_eq!(event.aggregate_type, AggregateType::Entity);
        assert_eq!(event.body, b"\"a\"");
        assert_eq!(event.decode_body::<String>().unwrap(), "a");
    }

    #[test]
    fn metadata_is_attached() {
        let event = Event::from_raw(EventType::UserCreated, b"{}".to_vec())
            .with_metadata("origin", "peer");
        assert_eq!(event.metadata.get("origin").map(String::as_str), Some("peer"));
        assert_eq!(event.aggregate_type, AggregateType::User);
    }
}
