//! Applies entity events to the read store.

use std::sync::Arc;

use async_trait::async_trait;
use common::EntityId;
use domain::EntityEvent;
use event_bus::{Event, EventHandler, HandlerError};
use storage::ReadStore;

use crate::{ProjectionError, Result};

/// The read-store mutation a call to [`Synchronizer::catch_up`] performed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Created(EntityId),
    Updated(EntityId),
    Deleted(EntityId),
    /// The event does not concern entities.
    Skipped,
}

/// Keeps the read store convergent with the write store.
///
/// Each entity event maps to exactly one read-store call, forwarded
/// verbatim. Convergence under redelivery relies on the store's own
/// idempotence.
pub struct Synchronizer<R: ReadStore + ?Sized = dyn ReadStore> {
    store: Arc<R>,
}

impl<R: ReadStore + ?Sized> Synchronizer<R> {
    /// Creates a synchronizer writing to `store`.
    pub fn new(store: Arc<R>) -> Self {
        Self { store }
    }

    /// Gets a reference to the read store.
    pub fn store(&self) -> &Arc<R> {
        &self.store
    }

    /// Applies one event.
    ///
    /// Events of non-entity types are logged and skipped. A malformed body
    /// fails with [`ProjectionError::Decode`] before the store is touched.
    #[tracing::instrument(
        skip(self, event),
        fields(event_type = %event.event_type, event_id = %event.event_id)
    )]
    pub async fn catch_up(&self, event: &Event) -> Result<Applied> {
        let decoded = EntityEvent::decode(event).map_err(|e| {
            metrics::counter!("read_model_decode_failures_total").increment(1);
            tracing::warn!(error = %e, "dropping malformed event");
            ProjectionError::Decode(e)
        })?;

        let applied = match decoded {
            Some(EntityEvent::Created(entity)) => {
                self.store.create(&entity).await?;
                Applied::Created(entity.id)
            }
            Some(EntityEvent::Updated(entity)) => {
                self.store.update(&entity).await?;
                Applied::Updated(entity.id)
            }
            Some(EntityEvent::Deleted(id)) => {
                self.store.delete(&id).await?;
                Applied::Deleted(id)
            }
            None => {
                tracing::info!("ignoring event without read-model mapping");
                return Ok(Applied::Skipped);
            }
        };

        metrics::counter!(
            "read_model_catch_up_total",
            "event_type" => event.event_type.as_str()
        )
        .increment(1);
        tracing::debug!(?applied, "read model updated");

        Ok(applied)
    }
}

impl<R: ReadStore + ?Sized> Clone for Synchronizer<R> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

#[async_trait]
impl<R: ReadStore + ?Sized + 'static> EventHandler for Synchronizer<R> {
    fn name(&self) -> &str {
        "synchronizer"
    }

    async fn handle(&self, event: &Event) -> std::result::Result<(), HandlerError> {
        self.catch_up(event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use domain::Entity;
    use event_bus::EventType;
    use storage::{InMemoryReadStore, StoreError};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Create(Entity),
        Update(Entity),
        Delete(EntityId),
    }

    /// Records every call and optionally fails them.
    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<Call>>,
        fail: bool,
    }

    impl RecordingStore {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) -> storage::Result<()> {
            self.calls.lock().unwrap().push(call);
            if self.fail {
                return Err(StoreError::NotFound(EntityId::new("x")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ReadStore for RecordingStore {
        async fn create(&self, entity: &Entity) -> storage::Result<()> {
            self.record(Call::Create(entity.clone()))
        }

        async fn update(&self, entity: &Entity) -> storage::Result<()> {
            self.record(Call::Update(entity.clone()))
        }

        async fn delete(&self, id: &EntityId) -> storage::Result<()> {
            self.record(Call::Delete(id.clone()))
        }

        async fn get(&self, id: &EntityId) -> storage::Result<Entity> {
            Err(StoreError::NotFound(id.clone()))
        }

        async fn get_multiple(&self, _offset: usize, _limit: usize) -> storage::Result<Vec<Entity>> {
            Ok(Vec::new())
        }

        async fn close(&self) -> storage::Result<()> {
            Ok(())
        }
    }

    fn entity(id: &str) -> Entity {
        let now = Utc::now();
        Entity {
            id: EntityId::new(id),
            user_id: "u".to_string(),
            title: "T".to_string(),
            body: "B".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn setup() -> (Arc<RecordingStore>, Synchronizer<RecordingStore>) {
        let store = Arc::new(RecordingStore::default());
        (Arc::clone(&store), Synchronizer::new(store))
    }

    #[tokio::test]
    async fn created_calls_create_once() {
        let (store, sync) = setup();
        let a = entity("a");
        let event = EntityEvent::Created(a.clone()).to_event().unwrap();

        let applied = sync.catch_up(&event).await.unwrap();

        assert_eq!(applied, Applied::Created(EntityId::new("a")));
        assert_eq!(store.calls(), [Call::Create(a)]);
    }

    #[tokio::test]
    async fn updated_calls_update_once() {
        let (store, sync) = setup();
        let a = Entity {
            title: "T2".to_string(),
            updated_at: Utc::now() + chrono::Duration::seconds(1),
            ..entity("a")
        };
        let event = EntityEvent::Updated(a.clone()).to_event().unwrap();

        sync.catch_up(&event).await.unwrap();

        assert_eq!(store.calls(), [Call::Update(a)]);
    }

    #[tokio::test]
    async fn deleted_calls_delete_with_bare_id() {
        let (store, sync) = setup();
        let event = Event::from_raw(EventType::EntityDeleted, br#""abc""#.to_vec());

        let applied = sync.catch_up(&event).await.unwrap();

        assert_eq!(applied, Applied::Deleted(EntityId::new("abc")));
        assert_eq!(store.calls(), [Call::Delete(EntityId::new("abc"))]);
    }

    #[tokio::test]
    async fn malformed_body_fails_without_touching_store() {
        let (store, sync) = setup();

        for event in [
            Event::from_raw(EventType::EntityCreated, b"not json".to_vec()),
            Event::from_raw(EventType::EntityUpdated, br#"{"id": 5}"#.to_vec()),
            Event::from_raw(EventType::EntityDeleted, br#"{"id": "a"}"#.to_vec()),
        ] {
            let err = sync.catch_up(&event).await.unwrap_err();
            assert!(matches!(err, ProjectionError::Decode(_)));
        }
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn non_entity_events_are_skipped() {
        let (store, sync) = setup();
        let event = Event::make(EventType::UserDeleted, "u").unwrap();

        assert_eq!(sync.catch_up(&event).await.unwrap(), Applied::Skipped);
        assert!(store.calls().is_empty());
    }

    #[tokio::test]
    async fn store_errors_are_surfaced() {
        let store = Arc::new(RecordingStore::failing());
        let sync = Synchronizer::new(Arc::clone(&store));
        let event = EntityEvent::Created(entity("a")).to_event().unwrap();

        let err = sync.catch_up(&event).await.unwrap_err();

        assert!(matches!(err, ProjectionError::Store(StoreError::NotFound(_))));
        assert_eq!(store.calls().len(), 1);
    }

    #[tokio::test]
    async fn replayed_events_converge() {
        let store: Arc<dyn ReadStore> = Arc::new(InMemoryReadStore::new());
        let sync = Synchronizer::new(Arc::clone(&store));
        let a = entity("a");
        let created = EntityEvent::Created(a.clone()).to_event().unwrap();
        let deleted = EntityEvent::Deleted(a.id.clone()).to_event().unwrap();

        sync.catch_up(&created).await.unwrap();
        sync.catch_up(&created).await.unwrap();
        assert_eq!(store.get(&a.id).await.unwrap(), a);

        sync.catch_up(&deleted).await.unwrap();
        sync.catch_up(&deleted).await.unwrap();
        sync.catch_up(&created).await.unwrap();
        assert!(store.get(&a.id).await.is_err());
    }

    #[tokio::test]
    async fn handler_reports_errors_to_dispatcher() {
        let (_, sync) = setup();
        let event = Event::from_raw(EventType::EntityCreated, b"{".to_vec());

        let err = EventHandler::handle(&sync, &event).await.unwrap_err();

        assert!(err.to_string().contains("Malformed"));
        assert_eq!(sync.name(), "synchronizer");
    }
}
