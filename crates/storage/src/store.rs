use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::EntityId;
use domain::Entity;
use event_bus::{EventConsumer, EventHandler, EventType};

use crate::Result;

/// The authoritative store commands are issued to.
///
/// Every successful mutation records the matching entity event in the
/// store's own log within the same write, and that log is exposed as a
/// durable event channel through [`EventConsumer`].
#[async_trait]
pub trait WriteStore: EventConsumer {
    /// Persists a new entity. Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, entity: &Entity) -> Result<()>;

    /// Replaces title, body and `updated_at` of an existing entity and
    /// returns the stored record. Fails with `NotFound` if it is missing.
    async fn update(&self, entity: &Entity) -> Result<Entity>;

    /// Removes an entity. Fails with `NotFound` if it is missing.
    async fn delete(&self, id: &EntityId) -> Result<()>;

    /// Releases underlying handles.
    async fn close(&self) -> Result<()>;
}

/// The query-optimized store, mutated only by the synchronizer.
///
/// Mutations are idempotent so that redelivered and reordered events
/// converge:
/// - `create` and `update` are upserts resolved by last-write-wins on
///   `updated_at`
/// - `delete` of a missing id succeeds and leaves a tombstone, after which
///   creates and updates for that id are ignored
#[async_trait]
pub trait ReadStore: Send + Sync {
    async fn create(&self, entity: &Entity) -> Result<()>;

    async fn update(&self, entity: &Entity) -> Result<()>;

    async fn delete(&self, id: &EntityId) -> Result<()>;

    /// Fails with `NotFound` for missing and deleted ids.
    async fn get(&self, id: &EntityId) -> Result<Entity>;

    /// Returns a page of live entities ordered by creation time, then id.
    async fn get_multiple(&self, offset: usize, limit: usize) -> Result<Vec<Entity>>;

    /// Auxiliary projections this store wants wired to the dispatcher.
    fn event_handlers(&self) -> HashMap<EventType, Vec<Arc<dyn EventHandler>>> {
        HashMap::new()
    }

    /// Releases underlying handles.
    async fn close(&self) -> Result<()>;
}
