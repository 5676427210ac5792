use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use common::EntityId;
use domain::{Entity, EntityEvent};
use event_bus::{EventConsumer, EventPublisher, EventSource, EventType, InMemoryBroker, Shutdown};
use tokio::sync::RwLock;

use crate::store::{ReadStore, WriteStore};
use crate::{Result, StoreError};

/// In-memory write store.
///
/// Holds the authoritative entities and an in-process event log that
/// doubles as the durable catch-up channel.
#[derive(Clone, Default)]
pub struct InMemoryWriteStore {
    entities: Arc<RwLock<HashMap<EntityId, Entity>>>,
    log: InMemoryBroker,
}

impl InMemoryWriteStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entities stored.
    pub async fn entity_count(&self) -> usize {
        self.entities.read().await.len()
    }

    /// Returns the stored entity, if any.
    pub async fn find(&self, id: &EntityId) -> Option<Entity> {
        self.entities.read().await.get(id).cloned()
    }

    /// Returns every event recorded for `event_type`, oldest first.
    pub async fn events(&self, event_type: EventType) -> Vec<event_bus::Event> {
        self.log.history(event_type).await
    }

    async fn record(&self, event: EntityEvent) -> Result<()> {
        self.log.publish(&event.to_event()?).await?;
        Ok(())
    }
}

#[async_trait]
impl WriteStore for InMemoryWriteStore {
    async fn create(&self, entity: &Entity) -> Result<()> {
        let mut entities = self.entities.write().await;
        if entities.contains_key(&entity.id) {
            return Err(StoreError::AlreadyExists(entity.id.clone()));
        }

        entities.insert(entity.id.clone(), entity.clone());
        self.record(EntityEvent::Created(entity.clone())).await
    }

    async fn update(&self, entity: &Entity) -> Result<Entity> {
        let mut entities = self.entities.write().await;
        let stored = entities
            .get_mut(&entity.id)
            .ok_or_else(|| StoreError::NotFound(entity.id.clone()))?;

        stored.apply_update(entity);
        let stored = stored.clone();
        self.record(EntityEvent::Updated(stored.clone())).await?;
        Ok(stored)
    }

    async fn delete(&self, id: &EntityId) -> Result<()> {
        let mut entities = self.entities.write().await;
        if entities.remove(id).is_none() {
            return Err(StoreError::NotFound(id.clone()));
        }

        self.record(EntityEvent::Deleted(id.clone())).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl EventConsumer for InMemoryWriteStore {
    async fn consume(
        &self,
        group: &str,
        event_type: EventType,
        shutdown: Shutdown,
    ) -> event_bus::Result<EventSource> {
        self.log.consume(group, event_type, shutdown).await
    }
}

#[derive(Default)]
struct ReadState {
    entities: HashMap<EntityId, Entity>,
    tombstones: HashSet<EntityId>,
}

/// In-memory read store with idempotent, last-write-wins mutations.
#[derive(Clone, Default)]
pub struct InMemoryReadStore {
    state: Arc<RwLock<ReadState>>,
}

impl InMemoryReadStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of live entities.
    pub async fn count(&self) -> usize {
        self.state.read().await.entities.len()
    }

    /// Whether `id` has been deleted.
    pub async fn is_tombstoned(&self, id: &EntityId) -> bool {
        self.state.read().await.tombstones.contains(id)
    }
}

#[async_trait]
impl ReadStore for InMemoryReadStore {
    async fn create(&self, entity: &Entity) -> Result<()> {
        let mut state = self.state.write().await;
        if state.tombstones.contains(&entity.id) {
            tracing::debug!(entity_id = %entity.id, "ignoring create of deleted entity");
            return Ok(());
        }

        match state.entities.get(&entity.id) {
            Some(current) if !entity.supersedes(current) => {
                tracing::debug!(entity_id = %entity.id, "ignoring stale create");
            }
            _ => {
                state.entities.insert(entity.id.clone(), entity.clone());
            }
        }
        Ok(())
    }

    async fn update(&self, entity: &Entity) -> Result<()> {
        let mut state = self.state.write().await;
        if state.tombstones.contains(&entity.id) {
            tracing::debug!(entity_id = %entity.id, "ignoring update of deleted entity");
            return Ok(());
        }

        match state.entities.get_mut(&entity.id) {
            Some(current) if entity.supersedes(current) => current.apply_update(entity),
            Some(_) => tracing::debug!(entity_id = %entity.id, "ignoring stale update"),
            None => {
                state.entities.insert(entity.id.clone(), entity.clone());
            }
        }
        Ok(())
    }

    async fn delete(&self, id: &EntityId) -> Result<()> {
        let mut state = self.state.write().await;
        state.entities.remove(id);
        state.tombstones.insert(id.clone());
        Ok(())
    }

    async fn get(&self, id: &EntityId) -> Result<Entity> {
        self.state
            .read()
            .await
            .entities
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn get_multiple(&self, offset: usize, limit: usize) -> Result<Vec<Entity>> {
        let state = self.state.read().await;
        let mut entities: Vec<_> = state.entities.values().cloned().collect();
        entities.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(entities.into_iter().skip(offset).take(limit).collect())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
