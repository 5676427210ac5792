use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::Result;
use crate::broker::{CHANNEL_CAPACITY, EventConsumer, EventPublisher, EventSource};
use crate::event::{Event, EventType};
use crate::shutdown::Shutdown;

struct Subscriber {
    group: String,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct BrokerState {
    log: HashMap<EventType, Vec<Event>>,
    subscribers: HashMap<EventType, Vec<Subscriber>>,
}

/// In-process durable broker.
///
/// Keeps every published event in a per-type log. Each consumption replays
/// the log for its type and then follows live publications, so a consumer
/// started after a restart still observes the full history. Consumer groups
/// only label subscriptions; every subscription receives every event.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates a new empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every event published for `event_type`, oldest first.
    pub async fn history(&self, event_type: EventType) -> Vec<Event> {
        self.state
            .lock()
            .await
            .log
            .get(&event_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the number of live subscriptions for `event_type`.
    pub async fn subscriber_count(&self, event_type: EventType) -> usize {
        let mut state = self.state.lock().await;
        let subscribers = state.subscribers.entry(event_type).or_default();
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.len()
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(&self, event: &Event) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .log
            .entry(event.event_type)
            .or_default()
            .push(event.clone());

        if let Some(subscribers) = state.subscribers.get_mut(&event.event_type) {
            subscribers.retain(|subscriber| {
                let delivered = subscriber.tx.send(event.clone()).is_ok();
                if !delivered {
                    tracing::debug!(group = %subscriber.group, "dropping closed subscription");
                }
                delivered
            });
        }

        Ok(())
    }
}

#[async_trait]
impl EventConsumer for InMemoryBroker {
    async fn consume(
        &self,
        group: &str,
        event_type: EventType,
        shutdown: Shutdown,
    ) -> Result<EventSource> {
        let (inbox_tx, mut inbox) = mpsc::unbounded_channel();
        {
            // Replay and registration happen under one lock so no event is
            // missed or seen twice.
            let mut state = self.state.lock().await;
            for event in state.log.get(&event_type).into_iter().flatten() {
                let _ = inbox_tx.send(event.clone());
            }
            state
                .subscribers
                .entry(event_type)
                .or_default()
                .push(Subscriber {
                    group: group.to_string(),
                    tx: inbox_tx,
                });
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let group = group.to_string();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    next = inbox.recv() => match next {
                        Some(event) => event,
                        None => break,
                    },
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            tracing::debug!(%group, %event_type, "subscription closed");
        });

        Ok(rx)
    }
}
