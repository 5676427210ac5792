//! Event plumbing for the entity service.
//!
//! - [`Event`] and its [`EventType`] / [`AggregateType`] tags
//! - [`EventHandler`] trait for anything that reacts to events
//! - [`Dispatcher`] fanning events out to one synchronous and many
//!   asynchronous handlers, from local publication and durable channels
//! - [`EventConsumer`] / [`EventPublisher`] contracts for event channels,
//!   with an in-process [`InMemoryBroker`]

pub mod broker;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod handler;
pub mod memory;
pub mod shutdown;

pub use broker::{EventConsumer, EventPublisher, EventSource};
pub use dispatcher::{DEFAULT_MAX_WORKERS, Dispatcher, RunReport, SourceExit, SourceReport};
pub use error::{BusError, DispatchError, Result};
pub use event::{AggregateType, Event, EventId, EventType};
pub use handler::{EventHandler, HandlerError, HandlerFn, handler_fn};
pub use memory::InMemoryBroker;
pub use shutdown::{Shutdown, ShutdownTrigger};
