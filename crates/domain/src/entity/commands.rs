//! Entity commands.

use chrono::{DateTime, Utc};
use common::EntityId;

use super::Entity;
use crate::command::Command;
use crate::error::ValidationError;

/// Command to create a new entity. The id is assigned by the service.
#[derive(Debug, Clone, Default)]
pub struct CreateEntity {
    pub user_id: String,
    pub title: String,
    pub body: String,
}

impl CreateEntity {
    pub fn new(
        user_id: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            title: title.into(),
            body: body.into(),
        }
    }

    /// Builds the entity to persist under a freshly assigned `id`.
    pub fn into_entity(self, id: EntityId, now: DateTime<Utc>) -> Entity {
        Entity {
            id,
            user_id: self.user_id,
            title: self.title,
            body: self.body,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Command for CreateEntity {
    fn name(&self) -> &'static str {
        "create"
    }

    fn validate(&self) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Command to replace the mutable content of an entity.
#[derive(Debug, Clone, Default)]
pub struct UpdateEntity {
    pub id: EntityId,
    pub title: String,
    pub body: String,
}

impl UpdateEntity {
    pub fn new(id: impl Into<EntityId>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
        }
    }

    /// Builds the update record stamped at `now`.
    ///
    /// Owner and creation time are left empty; stores keep their own.
    pub fn into_entity(self, now: DateTime<Utc>) -> Entity {
        Entity {
            id: self.id,
            title: self.title,
            body: self.body,
            updated_at: now,
            ..Entity::default()
        }
    }
}

impl Command for UpdateEntity {
    fn name(&self) -> &'static str {
        "update"
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_id(&self.id)
    }
}

/// Command to delete an entity.
#[derive(Debug, Clone, Default)]
pub struct DeleteEntity {
    pub id: EntityId,
}

impl DeleteEntity {
    pub fn new(id: impl Into<EntityId>) -> Self {
        Self { id: id.into() }
    }
}

impl Command for DeleteEntity {
    fn name(&self) -> &'static str {
        "delete"
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_id(&self.id)
    }
}

fn require_id(id: &EntityId) -> Result<(), ValidationError> {
    if id.as_str().trim().is_empty() {
        return Err(ValidationError::new("id", "must not be empty"));
    }
    Ok(())
}
