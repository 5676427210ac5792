//! Typed entity events and their wire encoding.

use common::EntityId;
use event_bus::{Event, EventType};

use super::Entity;
use crate::error::DecodeError;

/// What happened to an entity.
///
/// Created and Updated carry the full record; Deleted carries only the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityEvent {
    Created(Entity),
    Updated(Entity),
    Deleted(EntityId),
}

impl EntityEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            EntityEvent::Created(_) => EventType::EntityCreated,
            EntityEvent::Updated(_) => EventType::EntityUpdated,
            EntityEvent::Deleted(_) => EventType::EntityDeleted,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        match self {
            EntityEvent::Created(entity) | EntityEvent::Updated(entity) => &entity.id,
            EntityEvent::Deleted(id) => id,
        }
    }

    /// Encodes this event for the bus.
    pub fn to_event(&self) -> Result<Event, serde_json::Error> {
        match self {
            EntityEvent::Created(entity) | EntityEvent::Updated(entity) => {
                Event::make(self.event_type(), entity)
            }
            EntityEvent::Deleted(id) => Event::make(self.event_type(), id),
        }
    }

    /// Decodes a bus event.
    ///
    /// Returns `Ok(None)` for events that do not concern entities and an
    /// error when the body does not have the shape its type dictates.
    pub fn decode(event: &Event) -> Result<Option<Self>, DecodeError> {
        let decoded = match event.event_type {
            EventType::EntityCreated => EntityEvent::Created(decode_body(event)?),
            EventType::EntityUpdated => EntityEvent::Updated(decode_body(event)?),
            EventType::EntityDeleted => EntityEvent::Deleted(decode_body(event)?),
            EventType::UserCreated | EventType::UserUpdated | EventType::UserDeleted => {
                return Ok(None);
            }
        };
        Ok(Some(decoded))
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(event: &Event) -> Result<T, DecodeError> {
    event.decode_body().map_err(|source| DecodeError {
        event_type: event.event_type,
        source,
    })
}
