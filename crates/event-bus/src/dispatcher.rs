//! Two-phase event dispatch.
//!
//! Every event first goes to the single synchronous handler (inline, its
//! result is returned to whoever published the event) and then to all
//! asynchronous handlers registered for its type (queued, not awaited).
//! Events arrive either through [`Dispatcher::publish`] or from durable
//! channels drained by [`Dispatcher::run`].

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures_util::FutureExt;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use crate::broker::{EventPublisher, EventSource};
use crate::error::{BusError, DispatchError, Result};
use crate::event::{Event, EventType};
use crate::handler::EventHandler;
use crate::shutdown::Shutdown;

/// Default bound on concurrently running asynchronous handler calls.
pub const DEFAULT_MAX_WORKERS: usize = 20;

/// How a drained source ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceExit {
    /// The channel was closed by its producer.
    Closed,
    /// Shutdown fired before the channel closed.
    Cancelled,
}

/// Per-source outcome of [`Dispatcher::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    pub source: usize,
    pub exit: SourceExit,
    /// Events received and delivered to the synchronous handler.
    pub delivered: u64,
    /// Delivered events whose synchronous handler failed or panicked.
    pub failed: u64,
}

/// Summary returned once [`Dispatcher::run`] stops.
#[derive(Debug, Default)]
pub struct RunReport {
    pub sources: Vec<SourceReport>,
    /// Drain tasks that died without producing a report.
    pub aborted: usize,
}

impl RunReport {
    pub fn delivered(&self) -> u64 {
        self.sources.iter().map(|s| s.delivered).sum()
    }

    pub fn failed(&self) -> u64 {
        self.sources.iter().map(|s| s.failed).sum()
    }

    fn record(&mut self, joined: std::result::Result<SourceReport, tokio::task::JoinError>) {
        match joined {
            Ok(report) => {
                tracing::info!(
                    source = report.source,
                    exit = ?report.exit,
                    delivered = report.delivered,
                    failed = report.failed,
                    "event source drained"
                );
                self.sources.push(report);
            }
            Err(error) => {
                tracing::error!(%error, "event source task aborted");
                self.aborted += 1;
            }
        }
    }
}

struct Source {
    id: usize,
    events: EventSource,
}

type SharedHandler = Arc<dyn EventHandler>;

struct Registry {
    sync_handler: RwLock<Option<SharedHandler>>,
    handlers: RwLock<HashMap<EventType, Vec<SharedHandler>>>,
    workers: Arc<Semaphore>,
}

impl Registry {
    fn sync_handler(&self) -> Option<SharedHandler> {
        self.sync_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn async_handlers(&self, event_type: EventType) -> Vec<SharedHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event_type)
            .cloned()
            .unwrap_or_default()
    }

    async fn deliver_sync(&self, event: &Event) -> std::result::Result<(), DispatchError> {
        match self.sync_handler() {
            Some(handler) => invoke(handler.as_ref(), event).await,
            None => {
                tracing::debug!(event_type = %event.event_type, "no synchronous handler set");
                Ok(())
            }
        }
    }

    fn fan_out(&self, lanes: &mut Lanes, event: &Event) {
        for handler in self.async_handlers(event.event_type) {
            lanes.push(&self.workers, handler, event.clone());
        }
    }

    /// Runs both delivery phases for one event. Never fails the caller's
    /// loop: the synchronous outcome is returned for reporting only.
    async fn dispatch(&self, lanes: &mut Lanes, event: &Event) -> std::result::Result<(), DispatchError> {
        let outcome = self.deliver_sync(event).await;
        if let Err(error) = &outcome {
            report_failure(error, "sync", event);
        }
        self.fan_out(lanes, event);
        outcome
    }
}

/// FIFO queues, one per asynchronous handler, each drained by its own task.
///
/// Every event source owns a lane set, which keeps per-handler order equal
/// to the source's order without serializing different handlers.
#[derive(Default)]
struct Lanes {
    lanes: HashMap<usize, mpsc::UnboundedSender<Event>>,
}

impl Lanes {
    fn push(&mut self, workers: &Arc<Semaphore>, handler: SharedHandler, event: Event) {
        let key = Arc::as_ptr(&handler) as *const () as usize;
        let lane = self
            .lanes
            .entry(key)
            .or_insert_with(|| spawn_lane(Arc::clone(workers), Arc::clone(&handler)));

        if let Err(mpsc::error::SendError(event)) = lane.send(event) {
            let lane = spawn_lane(Arc::clone(workers), handler);
            let _ = lane.send(event);
            self.lanes.insert(key, lane);
        }
    }
}

fn spawn_lane(workers: Arc<Semaphore>, handler: SharedHandler) -> mpsc::UnboundedSender<Event> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let Ok(_permit) = workers.acquire().await else {
                break;
            };
            if let Err(error) = invoke(handler.as_ref(), &event).await {
                report_failure(&error, "async", &event);
            }
        }
    });
    tx
}

async fn invoke(handler: &dyn EventHandler, event: &Event) -> std::result::Result<(), DispatchError> {
    match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(DispatchError::Handler {
            handler: handler.name().to_string(),
            source,
        }),
        Err(payload) => Err(DispatchError::Panicked {
            handler: handler.name().to_string(),
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn report_failure(error: &DispatchError, phase: &'static str, event: &Event) {
    if matches!(error, DispatchError::Panicked { .. }) {
        metrics::counter!("dispatcher_handler_panics_total", "phase" => phase).increment(1);
    }
    metrics::counter!("dispatcher_handler_failures_total", "phase" => phase).increment(1);
    tracing::error!(
        %error,
        phase,
        event_type = %event.event_type,
        event_id = %event.event_id,
        "event handler failed"
    );
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes events to one synchronous and any number of asynchronous handlers.
///
/// A dispatcher is an owned value: construct it in the composition root and
/// share it (usually behind an `Arc`) with whoever publishes or subscribes.
pub struct Dispatcher {
    registry: Arc<Registry>,
    publisher: Option<Arc<dyn EventPublisher>>,
    local_lanes: Mutex<Lanes>,
    sources_tx: mpsc::UnboundedSender<Source>,
    sources_rx: Mutex<Option<mpsc::UnboundedReceiver<Source>>>,
    next_source: AtomicUsize,
}

impl Dispatcher {
    /// Creates a dispatcher running at most `max_workers` asynchronous
    /// handler calls at once.
    pub fn new(max_workers: usize) -> Self {
        let (sources_tx, sources_rx) = mpsc::unbounded_channel();
        Self {
            registry: Arc::new(Registry {
                sync_handler: RwLock::new(None),
                handlers: RwLock::new(HashMap::new()),
                workers: Arc::new(Semaphore::new(max_workers.max(1))),
            }),
            publisher: None,
            local_lanes: Mutex::new(Lanes::default()),
            sources_tx,
            sources_rx: Mutex::new(Some(sources_rx)),
            next_source: AtomicUsize::new(0),
        }
    }

    /// Forwards every locally published event to `publisher` once both
    /// delivery phases have been started.
    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Designates the synchronous handler. Replaces any previous one.
    pub fn set_sync_handler(&self, handler: Arc<dyn EventHandler>) {
        tracing::debug!(handler = handler.name(), "synchronous handler set");
        *self
            .registry
            .sync_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    /// Registers additional asynchronous handlers for `event_type`.
    pub fn subscribe(
        &self,
        event_type: EventType,
        handlers: impl IntoIterator<Item = Arc<dyn EventHandler>>,
    ) {
        let mut registered = self
            .registry
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entry = registered.entry(event_type).or_default();
        for handler in handlers {
            tracing::debug!(handler = handler.name(), %event_type, "handler subscribed");
            entry.push(handler);
        }
    }

    /// Number of asynchronous handlers registered for `event_type`.
    pub fn handler_count(&self, event_type: EventType) -> usize {
        self.registry.async_handlers(event_type).len()
    }

    /// Whether a synchronous handler has been designated.
    pub fn has_sync_handler(&self) -> bool {
        self.registry.sync_handler().is_some()
    }

    /// Registers channels to be drained by [`Dispatcher::run`]. Channels added
    /// while `run` is active start draining immediately.
    pub fn add_event_sources(&self, sources: impl IntoIterator<Item = EventSource>) {
        for events in sources {
            let id = self.next_source.fetch_add(1, Ordering::Relaxed);
            if self.sources_tx.send(Source { id, events }).is_err() {
                tracing::warn!(source = id, "dispatcher stopped, event source ignored");
            }
        }
    }

    /// Delivers a locally originated event.
    ///
    /// Blocks until the synchronous handler has finished and returns its
    /// outcome; asynchronous handlers are queued and not awaited.
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, event_id = %event.event_id))]
    pub async fn publish(&self, event: Event) -> std::result::Result<(), DispatchError> {
        metrics::counter!("dispatcher_events_total", "origin" => "local").increment(1);

        let outcome = self.registry.deliver_sync(&event).await;
        if let Err(error) = &outcome {
            report_failure(error, "sync", &event);
        }

        {
            let mut lanes = lock(&self.local_lanes);
            self.registry.fan_out(&mut lanes, &event);
        }

        if let Some(publisher) = &self.publisher
            && let Err(error) = publisher.publish(&event).await
        {
            tracing::warn!(%error, "failed to forward event to broker");
        }

        outcome
    }

    /// Drains every registered source concurrently until `shutdown` fires.
    ///
    /// Each source gets its own task and is processed in arrival order.
    /// On shutdown no further events are read; synchronous handler calls
    /// already in progress are allowed to finish before this returns.
    pub async fn run(&self, shutdown: Shutdown) -> Result<RunReport> {
        let mut sources = lock(&self.sources_rx)
            .take()
            .ok_or(BusError::AlreadyRunning)?;

        let mut tasks = JoinSet::new();
        let mut report = RunReport::default();
        tracing::info!("dispatcher running");

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                Some(source) = sources.recv() => {
                    tracing::debug!(source = source.id, "draining event source");
                    tasks.spawn(drain(source, Arc::clone(&self.registry), shutdown.clone()));
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => report.record(joined),
            }
        }

        tracing::info!(in_flight = tasks.len(), "dispatcher stopping");
        while let Some(joined) = tasks.join_next().await {
            report.record(joined);
        }

        Ok(report)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

async fn drain(mut source: Source, registry: Arc<Registry>, shutdown: Shutdown) -> SourceReport {
    let mut lanes = Lanes::default();
    let mut delivered = 0;
    let mut failed = 0;

    let exit = loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => break SourceExit::Cancelled,
            next = source.events.recv() => match next {
                Some(event) => event,
                None => break SourceExit::Closed,
            },
        };

        metrics::counter!("dispatcher_events_total", "origin" => "durable").increment(1);
        if registry.dispatch(&mut lanes, &event).await.is_err() {
            failed += 1;
        }
        delivered += 1;
    };

    SourceReport {
        source: source.id,
        exit,
        delivered,
        failed,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::handler::{HandlerError, handler_fn};

    /// Records the bodies of every event it sees, optionally failing.
    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    impl Recorder {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                ..Self::default()
            })
        }

        fn failing(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: true,
                ..Self::default()
            })
        }

        fn seen(&self) -> Vec<String> {
            lock(&self.seen).clone()
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, event: &Event) -> std::result::Result<(), HandlerError> {
            lock(&self.seen).push(event.decode_body::<String>()?);
            if self.fail {
                return Err(format!("{} failed", self.name).into());
            }
            Ok(())
        }
    }

    fn deleted(id: &str) -> Event {
        Event::make(EventType::EntityDeleted, id).unwrap()
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn publish_runs_sync_handler_before_returning() {
        let dispatcher = Dispatcher::default();
        let sync = Recorder::new("sync");
        dispatcher.set_sync_handler(sync.clone());

        dispatcher.publish(deleted("a")).await.unwrap();

        assert_eq!(sync.seen(), vec!["a"]);
    }

    #[tokio::test]
    async fn publish_returns_sync_handler_error() {
        let dispatcher = Dispatcher::default();
        dispatcher.set_sync_handler(Recorder::failing("sync"));

        let err = dispatcher.publish(deleted("a")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Handler { ref handler, .. } if handler == "sync"));
    }

    #[tokio::test]
    async fn async_handlers_run_even_when_sync_handler_fails() {
        let dispatcher = Dispatcher::default();
        dispatcher.set_sync_handler(Recorder::failing("sync"));
        let observer = Recorder::new("observer");
        dispatcher.subscribe(EventType::EntityDeleted, [observer.clone() as Arc<dyn EventHandler>]);

        assert!(dispatcher.publish(deleted("a")).await.is_err());

        eventually(|| observer.seen() == vec!["a"]).await;
    }

    #[tokio::test]
    async fn async_handlers_only_receive_subscribed_types() {
        let dispatcher = Dispatcher::default();
        let observer = Recorder::new("observer");
        dispatcher.subscribe(EventType::EntityCreated, [observer.clone() as Arc<dyn EventHandler>]);

        dispatcher.publish(deleted("a")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(observer.seen().is_empty());
        assert_eq!(dispatcher.handler_count(EventType::EntityCreated), 1);
        assert_eq!(dispatcher.handler_count(EventType::EntityDeleted), 0);
    }

    #[tokio::test]
    async fn publish_does_not_wait_for_async_handlers() {
        let dispatcher = Dispatcher::default();
        let release = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));

        let gate = Arc::clone(&release);
        let done = Arc::clone(&finished);
        dispatcher.subscribe(
            EventType::EntityDeleted,
            [Arc::new(handler_fn("slow", move |_event| {
                let gate = Arc::clone(&gate);
                let done = Arc::clone(&done);
                async move {
                    gate.notified().await;
                    done.store(true, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            })) as Arc<dyn EventHandler>],
        );

        let sync = Recorder::new("sync");
        dispatcher.set_sync_handler(sync.clone());

        tokio::time::timeout(Duration::from_secs(1), dispatcher.publish(deleted("a")))
            .await
            .expect("publish blocked on an asynchronous handler")
            .unwrap();

        assert_eq!(sync.seen(), vec!["a"]);
        assert!(!finished.load(Ordering::SeqCst));

        release.notify_one();
        eventually(|| finished.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn publish_of_update_returns_after_sync_phase() {
        let dispatcher = Dispatcher::default();
        let release = Arc::new(Notify::new());
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let gate = Arc::clone(&release);
        let entered = Arc::clone(&started);
        let done = Arc::clone(&finished);
        let blocked: Arc<dyn EventHandler> = Arc::new(handler_fn("blocked", move |_event| {
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            let done = Arc::clone(&done);
            async move {
                entered.store(true, Ordering::SeqCst);
                gate.notified().await;
                done.store(true, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        }));
        let observer = Recorder::new("observer");
        dispatcher.subscribe(
            EventType::EntityUpdated,
            [blocked, observer.clone() as Arc<dyn EventHandler>],
        );

        let sync = Recorder::new("sync");
        dispatcher.set_sync_handler(sync.clone());

        let update = Event::make(EventType::EntityUpdated, "a").unwrap();
        tokio::time::timeout(Duration::from_secs(1), dispatcher.publish(update))
            .await
            .expect("publish blocked on an asynchronous handler")
            .unwrap();

        assert_eq!(sync.seen(), vec!["a"]);
        assert!(!finished.load(Ordering::SeqCst));

        eventually(|| started.load(Ordering::SeqCst)).await;
        eventually(|| observer.seen() == vec!["a"]).await;
        assert!(!finished.load(Ordering::SeqCst));

        release.notify_one();
        eventually(|| finished.load(Ordering::SeqCst)).await;
    }

    #[tokio::test]
    async fn set_sync_handler_last_write_wins() {
        let dispatcher = Dispatcher::default();
        let first = Recorder::new("first");
        let second = Recorder::new("second");
        dispatcher.set_sync_handler(first.clone());
        dispatcher.set_sync_handler(second.clone());

        dispatcher.publish(deleted("a")).await.unwrap();

        assert!(first.seen().is_empty());
        assert_eq!(second.seen(), vec!["a"]);
    }

    #[tokio::test]
    async fn publish_without_sync_handler_succeeds() {
        let dispatcher = Dispatcher::default();
        assert!(!dispatcher.has_sync_handler());
        dispatcher.publish(deleted("a")).await.unwrap();
    }

    #[tokio::test]
    async fn panicking_sync_handler_is_contained() {
        let dispatcher = Dispatcher::default();
        dispatcher.set_sync_handler(Arc::new(handler_fn("explosive", |_event| async {
            if true {
                panic!("kaboom");
            }
            Ok::<(), HandlerError>(())
        })));

        let err = dispatcher.publish(deleted("a")).await.unwrap_err();
        match err {
            DispatchError::Panicked { handler, message } => {
                assert_eq!(handler, "explosive");
                assert_eq!(message, "kaboom");
            }
            other => panic!("unexpected error: {other}"),
        }

        // The dispatcher keeps working afterwards.
        let sync = Recorder::new("sync");
        dispatcher.set_sync_handler(sync.clone());
        dispatcher.publish(deleted("b")).await.unwrap();
        assert_eq!(sync.seen(), vec!["b"]);
    }

    #[tokio::test]
    async fn panicking_async_handler_does_not_stop_its_lane() {
        let dispatcher = Dispatcher::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        dispatcher.subscribe(
            EventType::EntityDeleted,
            [Arc::new(handler_fn("flaky", move |event: Event| {
                let sink = Arc::clone(&sink);
                async move {
                    let id: String = event.decode_body()?;
                    if id == "boom" {
                        panic!("flaky handler");
                    }
                    lock(&sink).push(id);
                    Ok::<(), HandlerError>(())
                }
            })) as Arc<dyn EventHandler>],
        );

        dispatcher.publish(deleted("boom")).await.unwrap();
        dispatcher.publish(deleted("after")).await.unwrap();

        eventually(|| *lock(&seen) == vec!["after".to_string()]).await;
    }

    #[tokio::test]
    async fn run_drains_sources_concurrently_in_fifo_order() {
        let dispatcher = Arc::new(Dispatcher::default());
        let sync = Recorder::new("sync");
        let observer = Recorder::new("observer");
        dispatcher.set_sync_handler(sync.clone());
        dispatcher.subscribe(EventType::EntityDeleted, [observer.clone() as Arc<dyn EventHandler>]);

        let (first_tx, first_rx) = mpsc::channel(16);
        let (second_tx, second_rx) = mpsc::channel(16);
        dispatcher.add_event_sources([first_rx, second_rx]);

        let (trigger, shutdown) = Shutdown::new();
        let running = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };

        for i in 0..5 {
            first_tx.send(deleted(&format!("first-{i}"))).await.unwrap();
            second_tx.send(deleted(&format!("second-{i}"))).await.unwrap();
        }
        drop(first_tx);

        eventually(|| sync.seen().len() == 10).await;
        eventually(|| observer.seen().len() == 10).await;

        for seen in [sync.seen(), observer.seen()] {
            for prefix in ["first-", "second-"] {
                let ordered: Vec<_> = seen.iter().filter(|id| id.starts_with(prefix)).cloned().collect();
                let expected: Vec<_> = (0..5).map(|i| format!("{prefix}{i}")).collect();
                assert_eq!(ordered, expected);
            }
        }

        trigger.trigger();
        let mut report = running.await.unwrap().unwrap();
        report.sources.sort_by_key(|s| s.source);

        assert_eq!(report.delivered(), 10);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.sources.len(), 2);
        assert_eq!(report.sources[0].exit, SourceExit::Closed);
        assert_eq!(report.sources[1].exit, SourceExit::Cancelled);
    }

    #[tokio::test]
    async fn run_isolates_failures_per_event() {
        let dispatcher = Arc::new(Dispatcher::default());
        let sync = Recorder::failing("sync");
        dispatcher.set_sync_handler(sync.clone());

        let (tx, rx) = mpsc::channel(16);
        dispatcher.add_event_sources([rx]);
        for id in ["a", "b", "c"] {
            tx.send(deleted(id)).await.unwrap();
        }
        drop(tx);

        let (trigger, shutdown) = Shutdown::new();
        let running = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };

        eventually(|| sync.seen().len() == 3).await;
        trigger.trigger();
        let report = running.await.unwrap().unwrap();

        assert_eq!(report.delivered(), 3);
        assert_eq!(report.failed(), 3);
        assert_eq!(sync.seen(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn sources_added_while_running_are_drained() {
        let dispatcher = Arc::new(Dispatcher::default());
        let sync = Recorder::new("sync");
        dispatcher.set_sync_handler(sync.clone());

        let (trigger, shutdown) = Shutdown::new();
        let running = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };

        let (tx, rx) = mpsc::channel(4);
        dispatcher.add_event_sources([rx]);
        tx.send(deleted("late")).await.unwrap();

        eventually(|| sync.seen() == vec!["late"]).await;
        trigger.trigger();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_sync_handler() {
        let dispatcher = Arc::new(Dispatcher::default());
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let completed = Arc::new(AtomicBool::new(false));

        {
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            let completed = Arc::clone(&completed);
            dispatcher.set_sync_handler(Arc::new(handler_fn("slow-sync", move |_event| {
                let started = Arc::clone(&started);
                let release = Arc::clone(&release);
                let completed = Arc::clone(&completed);
                async move {
                    started.notify_one();
                    release.notified().await;
                    completed.store(true, Ordering::SeqCst);
                    Ok::<(), HandlerError>(())
                }
            })));
        }

        let (tx, rx) = mpsc::channel(4);
        dispatcher.add_event_sources([rx]);
        tx.send(deleted("a")).await.unwrap();
        tx.send(deleted("never-read")).await.unwrap();

        let (trigger, shutdown) = Shutdown::new();
        let running = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run(shutdown).await })
        };

        started.notified().await;
        trigger.trigger();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!running.is_finished());

        release.notify_one();
        let report = running.await.unwrap().unwrap();

        assert!(completed.load(Ordering::SeqCst));
        assert_eq!(report.delivered(), 1);
        assert_eq!(report.sources[0].exit, SourceExit::Cancelled);
    }

    #[tokio::test]
    async fn run_twice_is_rejected() {
        let dispatcher = Dispatcher::default();
        let (trigger, shutdown) = Shutdown::new();
        trigger.trigger();

        dispatcher.run(shutdown.clone()).await.unwrap();
        assert!(matches!(
            dispatcher.run(shutdown).await,
            Err(BusError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn publish_forwards_to_publisher() {
        let broker = crate::memory::InMemoryBroker::new();
        let dispatcher = Dispatcher::default().with_publisher(Arc::new(broker.clone()));

        dispatcher.publish(deleted("a")).await.unwrap();

        let history = broker.history(EventType::EntityDeleted).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, b"\"a\"");
    }
}
