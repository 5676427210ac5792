//! Entity aggregate and related types.

mod commands;
mod events;

pub use commands::{CreateEntity, DeleteEntity, UpdateEntity};
pub use events::EntityEvent;

use chrono::{DateTime, Utc};
use common::EntityId;
use serde::{Deserialize, Serialize};

/// The aggregate root.
///
/// `id` is assigned once on creation; `user_id` never changes afterwards.
/// `updated_at` advances on every mutation and orders competing writes on
/// the read side.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Whether `self` should replace `current` under last-write-wins.
    ///
    /// Ties favour the incoming write so a redelivered event is a no-op
    /// rather than a conflict.
    pub fn supersedes(&self, current: &Entity) -> bool {
        self.updated_at >= current.updated_at
    }

    /// Applies the mutable fields of `update`, keeping identity, owner and
    /// creation time.
    pub fn apply_update(&mut self, update: &Entity) {
        self.title.clone_from(&update.title);
        self.body.clone_from(&update.body);
        self.updated_at = update.updated_at;
    }
}
