//! Entities-by-owner view.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use common::EntityId;
use domain::{DecodeError, EntityEvent};
use event_bus::{Event, EventHandler, EventType, HandlerError};
use tokio::sync::RwLock;

use crate::Result;

#[derive(Default)]
struct UserEntitiesState {
    by_user: HashMap<String, BTreeSet<EntityId>>,
    owners: HashMap<EntityId, String>,
    deleted: HashSet<EntityId>,
}

impl UserEntitiesState {
    fn index(&mut self, id: EntityId, user_id: String) {
        if self.deleted.contains(&id) || user_id.is_empty() {
            return;
        }
        self.by_user
            .entry(user_id.clone())
            .or_default()
            .insert(id.clone());
        self.owners.insert(id, user_id);
    }

    fn remove_entity(&mut self, id: EntityId) {
        if let Some(user_id) = self.owners.remove(&id)
            && let Some(ids) = self.by_user.get_mut(&user_id)
        {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_user.remove(&user_id);
            }
        }
        self.deleted.insert(id);
    }

    fn remove_user(&mut self, user_id: &str) {
        for id in self.by_user.remove(user_id).into_iter().flatten() {
            self.owners.remove(&id);
        }
    }
}

/// Indexes entity ids by the user that owns them.
///
/// Runs as an asynchronous dispatcher handler; a removed user's index is
/// dropped on `UserDeleted`, whose body is the bare user id.
#[derive(Clone, Default)]
pub struct UserEntitiesView {
    state: Arc<RwLock<UserEntitiesState>>,
}

impl UserEntitiesView {
    /// Event types this view must be subscribed to.
    pub const EVENT_TYPES: [EventType; 4] = [
        EventType::EntityCreated,
        EventType::EntityUpdated,
        EventType::EntityDeleted,
        EventType::UserDeleted,
    ];

    /// Creates a new empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of the entities owned by `user_id`, in id order.
    pub async fn entities_for(&self, user_id: &str) -> Vec<EntityId> {
        self.state
            .read()
            .await
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of users owning at least one entity.
    pub async fn user_count(&self) -> usize {
        self.state.read().await.by_user.len()
    }

    /// Applies one event.
    pub async fn apply(&self, event: &Event) -> Result<()> {
        if event.event_type == EventType::UserDeleted {
            let user_id: String = event.decode_body().map_err(|source| DecodeError {
                event_type: event.event_type,
                source,
            })?;
            self.state.write().await.remove_user(&user_id);
            return Ok(());
        }

        let mut state = self.state.write().await;
        match EntityEvent::decode(event)? {
            Some(EntityEvent::Created(entity)) | Some(EntityEvent::Updated(entity)) => {
                state.index(entity.id, entity.user_id)
            }
            Some(EntityEvent::Deleted(id)) => state.remove_entity(id),
            None => {}
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for UserEntitiesView {
    fn name(&self) -> &str {
        "user-entities"
    }

    async fn handle(&self, event: &Event) -> std::result::Result<(), HandlerError> {
        self.apply(event).await?;
        Ok(())
    }
}
