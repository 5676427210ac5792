use thiserror::Error;

use crate::handler::HandlerError;

/// Errors raised by the event bus itself.
#[derive(Debug, Error)]
pub enum BusError {
    /// `Dispatcher::run` was called a second time.
    #[error("Dispatcher is already running")]
    AlreadyRunning,

    /// The broker could not accept or deliver an event.
    #[error("Broker error: {0}")]
    Broker(String),

    /// An event could not be (de)serialized at a channel boundary.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of delivering one event to one handler.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The handler returned an error.
    #[error("Handler '{handler}' failed: {source}")]
    Handler {
        handler: String,
        #[source]
        source: HandlerError,
    },

    /// The handler panicked; the panic was contained.
    #[error("Handler '{handler}' panicked: {message}")]
    Panicked { handler: String, message: String },
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
