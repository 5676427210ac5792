//! HTTP entity service with read-model synchronization and observability.
//!
//! Provides REST endpoints for entity commands and queries. Writes go to
//! the write store and are published through the dispatcher; the read model
//! is kept convergent by the synchronizer. Logging uses tracing and metrics
//! are exported for Prometheus.

pub mod config;
pub mod error;
pub mod routes;
pub mod server;
pub mod service;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use event_bus::{Dispatcher, EventHandler, EventType};
use metrics_exporter_prometheus::PrometheusHandle;
use projections::{Synchronizer, UserEntitiesView};
use sqlx::postgres::PgPoolOptions;
use storage::{
    InMemoryReadStore, InMemoryWriteStore, PostgresReadStore, PostgresWriteStore, ReadStore,
    WriteStore,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, LogFormat};
pub use error::{ApiError, ServiceError};
pub use server::EntityServer;
pub use service::EntityService;

use routes::entities::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route(
            "/entities",
            get(routes::entities::list).post(routes::entities::create),
        )
        .route(
            "/entities/{id}",
            get(routes::entities::get)
                .put(routes::entities::update)
                .delete(routes::entities::delete),
        )
        .route("/users/{user_id}/entities", get(routes::entities::by_user))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wires stores, dispatcher, synchronizer and projections into a service.
///
/// The dispatcher is not given a publisher: the write store's outbox is
/// the durable channel other replicas consume, so forwarding published
/// events to a broker would deliver every write twice. Embedders with an
/// external broker can build their own dispatcher with [`Dispatcher::with_publisher`].
pub fn assemble(
    config: Config,
    write: Arc<dyn WriteStore>,
    read: Arc<dyn ReadStore>,
    metrics_handle: PrometheusHandle,
) -> EntityService {
    let dispatcher = Arc::new(Dispatcher::new(config.dispatcher_max_workers));
    dispatcher.set_sync_handler(Arc::new(Synchronizer::new(Arc::clone(&read))));

    for (event_type, handlers) in read.event_handlers() {
        dispatcher.subscribe(event_type, handlers);
    }

    let user_entities = UserEntitiesView::new();
    let view: Arc<dyn EventHandler> = Arc::new(user_entities.clone());
    for event_type in UserEntitiesView::EVENT_TYPES {
        dispatcher.subscribe(event_type, [Arc::clone(&view)]);
    }

    for event_type in EventType::ENTITY {
        tracing::debug!(
            %event_type,
            handlers = dispatcher.handler_count(event_type),
            synchronized = dispatcher.has_sync_handler(),
            "dispatcher wired"
        );
    }

    let server = EntityServer::new(Arc::clone(&write), Arc::clone(&read), Arc::clone(&dispatcher))
        .with_timeouts(config.request_timeout, config.stream_timeout);
    let state = Arc::new(AppState {
        server,
        user_entities,
    });
    let app = create_app(state, metrics_handle);

    EntityService {
        config,
        write,
        read,
        dispatcher,
        app,
    }
}

/// Builds the service described by `config`.
///
/// Each side uses PostgreSQL when its URL is configured and an in-memory
/// store otherwise.
pub async fn compose(
    config: Config,
    metrics_handle: PrometheusHandle,
) -> Result<EntityService, ServiceError> {
    let write: Arc<dyn WriteStore> = match &config.write_database_url {
        Some(url) => {
            let store = PostgresWriteStore::new(connect(url).await?);
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL write store");
            Arc::new(store)
        }
        None => {
            tracing::info!("using in-memory write store");
            Arc::new(InMemoryWriteStore::new())
        }
    };

    let read: Arc<dyn ReadStore> = match &config.read_database_url {
        Some(url) => {
            let store = PostgresReadStore::new(connect(url).await?);
            store.run_migrations().await?;
            tracing::info!("using PostgreSQL read store");
            Arc::new(store)
        }
        None => {
            tracing::info!("using in-memory read store");
            Arc::new(InMemoryReadStore::new())
        }
    };

    Ok(assemble(config, write, read, metrics_handle))
}

async fn connect(url: &str) -> Result<sqlx::PgPool, ServiceError> {
    Ok(PgPoolOptions::new().max_connections(10).connect(url).await?)
}
