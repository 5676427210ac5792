//! Command and query facade over the stores and the dispatcher.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use common::EntityId;
use domain::{Command, CreateEntity, DeleteEntity, Entity, EntityEvent, UpdateEntity};
use event_bus::Dispatcher;
use futures_util::stream::{self, BoxStream, StreamExt};
use storage::{ReadStore, StoreError, WriteStore};

use crate::error::ApiError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves entity commands and queries.
///
/// Commands are validated, applied to the write store and then published
/// through the dispatcher so the caller's own write is visible in the read
/// store before the request returns. Queries read the read store only.
pub struct EntityServer {
    write: Arc<dyn WriteStore>,
    read: Arc<dyn ReadStore>,
    dispatcher: Arc<Dispatcher>,
    request_timeout: Duration,
    stream_timeout: Duration,
}

impl EntityServer {
    pub fn new(
        write: Arc<dyn WriteStore>,
        read: Arc<dyn ReadStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            write,
            read,
            dispatcher,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
        }
    }

    /// Overrides the unary and streaming request deadlines.
    pub fn with_timeouts(mut self, request: Duration, stream: Duration) -> Self {
        self.request_timeout = request;
        self.stream_timeout = stream;
        self
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Creates an entity under a fresh id.
    #[tracing::instrument(skip(self, cmd), fields(user_id = %cmd.user_id))]
    pub async fn create(&self, cmd: CreateEntity) -> Result<Entity, ApiError> {
        let started = Instant::now();
        let result = self.create_inner(cmd).await;
        record("create", started, &result);
        result
    }

    async fn create_inner(&self, cmd: CreateEntity) -> Result<Entity, ApiError> {
        cmd.validate()?;
        let entity = cmd.into_entity(EntityId::generate(), Utc::now());

        self.with_deadline(self.write.create(&entity))
            .await?
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        tracing::info!(entity_id = %entity.id, "entity created");
        self.publish(EntityEvent::Created(entity.clone())).await;
        Ok(entity)
    }

    /// Replaces title and body of an entity.
    #[tracing::instrument(skip(self, cmd), fields(entity_id = %cmd.id))]
    pub async fn update(&self, cmd: UpdateEntity) -> Result<Entity, ApiError> {
        let started = Instant::now();
        let result = self.update_inner(cmd).await;
        record("update", started, &result);
        result
    }

    async fn update_inner(&self, cmd: UpdateEntity) -> Result<Entity, ApiError> {
        cmd.validate()?;
        let update = cmd.into_entity(Utc::now());

        let stored = self
            .with_deadline(self.write.update(&update))
            .await?
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        tracing::info!("entity updated");
        self.publish(EntityEvent::Updated(stored.clone())).await;
        Ok(stored)
    }

    /// Deletes an entity.
    #[tracing::instrument(skip(self, cmd), fields(entity_id = %cmd.id))]
    pub async fn delete(&self, cmd: DeleteEntity) -> Result<(), ApiError> {
        let started = Instant::now();
        let result = self.delete_inner(cmd).await;
        record("delete", started, &result);
        result
    }

    async fn delete_inner(&self, cmd: DeleteEntity) -> Result<(), ApiError> {
        cmd.validate()?;

        self.with_deadline(self.write.delete(&cmd.id))
            .await?
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        tracing::info!("entity deleted");
        self.publish(EntityEvent::Deleted(cmd.id)).await;
        Ok(())
    }

    /// Reads one entity from the read store.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, id: &EntityId) -> Result<Entity, ApiError> {
        if id.is_empty() {
            return Err(ApiError::BadRequest("Invalid id: must not be empty".to_string()));
        }

        self.with_deadline(self.read.get(id))
            .await?
            .map_err(ApiError::from_read)
    }

    /// Streams a page of entities ordered by creation time.
    ///
    /// The page is fetched up front; the returned stream ends early once
    /// the streaming deadline passes or the receiver goes away.
    #[tracing::instrument(skip(self))]
    pub async fn get_stream(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<BoxStream<'static, Entity>, ApiError> {
        let deadline = tokio::time::Instant::now() + self.stream_timeout;

        let page = tokio::time::timeout_at(deadline, self.read.get_multiple(offset, limit))
            .await
            .map_err(|_| ApiError::Timeout("stream deadline exceeded".to_string()))?
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        tracing::debug!(count = page.len(), "streaming entities");
        Ok(stream::iter(page)
            .take_until(tokio::time::sleep_until(deadline))
            .boxed())
    }

    async fn with_deadline<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<Result<T, StoreError>, ApiError> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| ApiError::Timeout("request deadline exceeded".to_string()))
    }

    /// The write has committed; a failed read-model apply is only logged
    /// and left to durable-channel redelivery.
    async fn publish(&self, event: EntityEvent) {
        let event = match event.to_event() {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode entity event");
                return;
            }
        };

        if let Err(e) = self.dispatcher.publish(event).await {
            tracing::warn!(error = %e, "read model not updated synchronously");
        }
    }
}

fn record<T>(command: &'static str, started: Instant, result: &Result<T, ApiError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(ApiError::BadRequest(_)) => "invalid",
        Err(ApiError::NotFound(_)) => "not_found",
        Err(ApiError::Timeout(_)) => "timeout",
        Err(ApiError::Internal(_)) => "error",
    };
    metrics::counter!("entity_commands_total", "command" => command, "outcome" => outcome)
        .increment(1);
    metrics::histogram!("entity_command_duration_seconds", "command" => command)
        .record(started.elapsed().as_secs_f64());
}
