use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::event::Event;

/// Error type handlers hand back to the dispatcher.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Something that reacts to events.
///
/// Handlers are shared between tasks, so they must be `Send + Sync`; any
/// mutable state lives behind the handler's own synchronization.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Handles a single event.
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct HandlerFn<F, Fut> {
    name: String,
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

/// Wraps `f` as a named handler.
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> HandlerFn<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn {
        name: name.into(),
        f,
        _future: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F, Fut>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}
