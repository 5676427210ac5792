//! Contracts for event channels.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::Result;
use crate::event::{Event, EventType};
use crate::shutdown::Shutdown;

/// Buffer size of channels handed out by consumers.
pub const CHANNEL_CAPACITY: usize = 100;

/// An ordered stream of events, drained by the dispatcher.
pub type EventSource = mpsc::Receiver<Event>;

/// Produces durable event channels.
///
/// The returned channel is lazy, potentially infinite and not restartable;
/// it closes when `shutdown` fires or the underlying source goes away.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    async fn consume(
        &self,
        group: &str,
        event_type: EventType,
        shutdown: Shutdown,
    ) -> Result<EventSource>;
}

/// Accepts events for delivery to other consumers.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &Event) -> Result<()>;
}
