use common::EntityId;
use event_bus::BusError;
use thiserror::Error;

/// Errors that can occur when interacting with a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No entity with this id exists.
    #[error("Entity not found: {0}")]
    NotFound(EntityId),

    /// An entity with this id already exists.
    #[error("Entity already exists: {0}")]
    AlreadyExists(EntityId),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored event names a type this service does not know.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// The store's event log rejected an event.
    #[error("Event log error: {0}")]
    EventLog(#[from] BusError),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
