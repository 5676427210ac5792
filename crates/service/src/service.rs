//! Service lifecycle: serving, read-model catch-up and shutdown.

use std::sync::Arc;

use axum::Router;
use event_bus::{Dispatcher, EventType, RunReport, Shutdown};
use storage::{ReadStore, WriteStore};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::error::ServiceError;

/// A fully wired entity service.
pub struct EntityService {
    pub(crate) config: Config,
    pub(crate) write: Arc<dyn WriteStore>,
    pub(crate) read: Arc<dyn ReadStore>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) app: Router,
}

impl EntityService {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The HTTP router, for embedding or testing.
    pub fn router(&self) -> Router {
        self.app.clone()
    }

    /// Binds the configured address and serves until `shutdown` fires.
    pub async fn run(&self, shutdown: Shutdown) -> Result<RunReport, ServiceError> {
        let listener = TcpListener::bind(self.config.addr()).await?;
        self.serve(listener, shutdown).await
    }

    /// Serves on `listener` until `shutdown` fires.
    ///
    /// The write store's durable channels for every entity event type are
    /// drained concurrently with the HTTP server, so the read model catches
    /// up on events this process did not originate. Returns the
    /// dispatcher's report once both have stopped.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: Shutdown,
    ) -> Result<RunReport, ServiceError> {
        self.sync_event_sources(shutdown.clone()).await?;

        let dispatcher = Arc::clone(&self.dispatcher);
        let dispatching = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };

        tracing::info!(addr = %listener.local_addr()?, "serving entity API");
        let served = axum::serve(listener, self.app.clone())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        let report = match dispatching.await {
            Ok(report) => report?,
            Err(e) => {
                tracing::error!(error = %e, "dispatcher task failed");
                RunReport::default()
            }
        };
        tracing::info!(
            delivered = report.delivered(),
            failed = report.failed(),
            "dispatcher stopped"
        );

        served?;
        Ok(report)
    }

    /// Subscribes the dispatcher to the write store's entity channels.
    async fn sync_event_sources(&self, shutdown: Shutdown) -> Result<(), ServiceError> {
        let mut sources = Vec::with_capacity(EventType::ENTITY.len());
        for event_type in EventType::ENTITY {
            let source = self
                .write
                .consume(&self.config.consumer_group, event_type, shutdown.clone())
                .await?;
            sources.push(source);
        }

        tracing::info!(
            group = %self.config.consumer_group,
            count = sources.len(),
            "durable event channels registered"
        );
        self.dispatcher.add_event_sources(sources);
        Ok(())
    }

    /// Closes both stores. Failures are logged, never raised.
    pub async fn close(&self) {
        if let Err(e) = self.write.close().await {
            tracing::error!(error = %e, "failed to close write store");
        }
        if let Err(e) = self.read.close().await {
            tracing::error!(error = %e, "failed to close read store");
        }
        tracing::info!("stores closed");
    }
}
