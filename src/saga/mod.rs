//! The saga engine (spec §4.7): a typed event bus paired with take
//! strategies that decide how concurrently-dispatched events spawn and
//! supersede saga handlers.
//!
//! Grounded on the teacher's subscriber fan-out in `Runtime::notify`
//! (every listener sees every value published after it subscribed) for
//! the event bus, and on its in-flight-query supersession logic for the
//! `on_latest`/`on_leading` take strategies.

mod context;
mod task;

pub use context::{ForkedTask, SagaContext};
pub use task::Task;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::CoreResult;
#[cfg(test)]
use crate::error::CoreError;
use crate::store::Store;

/// Strategy governing how a saga reacts to events dispatched while a
/// prior handler for the same registration may still be running.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TakeStrategy {
    /// Handle exactly the first matching event, then stop listening.
    Once,
    /// Run one handler per event concurrently.
    Every,
    /// Cancel the previous handler (if still running) when a new event
    /// arrives; only the latest runs to completion.
    Latest,
    /// Ignore new events while a handler is still running.
    Leading,
}

/// A typed, ordered event channel that saga registrations subscribe to.
#[derive(Clone)]
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    /// Publishes `event` to every active subscription.
    pub fn dispatch(&self, event: E) {
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        EventBus::new(1024)
    }
}

/// The root of a running saga: owns the event bus and the task tree
/// rooted at its registrations.
pub struct Saga<E> {
    store: Store,
    bus: EventBus<E>,
    root: Task,
}

impl<E> Saga<E>
where
    E: Clone + Send + 'static,
{
    pub fn new(store: Store, bus: EventBus<E>, name: &str) -> Self {
        Saga { store, bus, root: Task::root(name) }
    }

    pub fn bus(&self) -> &EventBus<E> {
        &self.bus
    }

    pub fn root_task(&self) -> &Task {
        &self.root
    }

    /// Cancels every registration and in-flight handler owned by this
    /// saga.
    pub fn cancel(&self) {
        self.root.cancel();
    }

    /// Registers `handler` to run under `strategy` for every event
    /// matching `predicate`.
    pub fn take<F, Fut, P>(&self, name: &str, strategy: TakeStrategy, predicate: P, handler: F) -> TaskHandle
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
        F: Fn(SagaContext, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<()>> + Send + 'static,
    {
        let registration_task = self.root.child(name);
        let mut rx = self.bus.subscribe();
        let store = self.store.clone();
        let handler = Arc::new(handler);
        let predicate = Arc::new(predicate);
        let task_for_loop = registration_task.clone();
        let name = name.to_string();

        let join = tokio::spawn(async move {
            let in_flight: Arc<Mutex<Option<Task>>> = Arc::new(Mutex::new(None));
            let busy = Arc::new(AtomicBool::new(false));

            loop {
                if task_for_loop.is_cancelled() {
                    break;
                }
                let event = tokio::select! {
                    biased;
                    _ = task_for_loop.cancelled() => break,
                    recvd = rx.recv() => match recvd {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    },
                };
                if !predicate(&event) {
                    continue;
                }

                match strategy {
                    TakeStrategy::Once => {
                        let child = task_for_loop.child(&format!("{name}:once"));
                        let ctx = SagaContext::new(store.clone(), child.clone());
                        let _ = handler(ctx, event).await;
                        child.complete();
                        break;
                    }
                    TakeStrategy::Every => {
                        let child = task_for_loop.child(&format!("{name}:every"));
                        let ctx = SagaContext::new(store.clone(), child.clone());
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            let _ = handler(ctx, event).await;
                            child.complete();
                        });
                    }
                    TakeStrategy::Latest => {
                        if let Some(previous) = in_flight.lock().take() {
                            previous.cancel();
                        }
                        let child = task_for_loop.child(&format!("{name}:latest"));
                        *in_flight.lock() = Some(child.clone());
                        let ctx = SagaContext::new(store.clone(), child.clone());
                        let handler = handler.clone();
                        let in_flight = in_flight.clone();
                        tokio::spawn(async move {
                            let _ = handler(ctx, event).await;
                            child.complete();
                            let mut slot = in_flight.lock();
                            if let Some(current) = slot.as_ref() {
                                if current.id() == child.id() {
                                    *slot = None;
                                }
                            }
                        });
                    }
                    TakeStrategy::Leading => {
                        if busy.load(Ordering::SeqCst) {
                            continue;
                        }
                        busy.store(true, Ordering::SeqCst);
                        let child = task_for_loop.child(&format!("{name}:leading"));
                        let ctx = SagaContext::new(store.clone(), child.clone());
                        let handler = handler.clone();
                        let busy = busy.clone();
                        tokio::spawn(async move {
                            let _ = handler(ctx, event).await;
                            child.complete();
                            busy.store(false, Ordering::SeqCst);
                        });
                    }
                }
            }
        });

        TaskHandle { task: registration_task, join }
    }
}

/// A running, named saga registered against a [`Store`] (spec §6:
/// `runSaga(s) -> task`, `dispatch(s, event)`, `cancelSaga(s)`,
/// `cancelAllSagas()`). Returned by [`Store::run_saga`].
pub struct SagaHandle<E> {
    name: String,
    store: Store,
    saga: Arc<Saga<E>>,
}

impl<E> SagaHandle<E>
where
    E: Clone + Send + 'static,
{
    pub(crate) fn new(name: String, store: Store, saga: Arc<Saga<E>>) -> Self {
        SagaHandle { name, store, saga }
    }

    /// The name this saga was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The event bus this saga listens on.
    pub fn bus(&self) -> &EventBus<E> {
        self.saga.bus()
    }

    /// Publishes `event` to this saga's event bus (spec §6: `dispatch(s,
    /// event)`).
    pub fn dispatch(&self, event: E) {
        self.saga.bus().dispatch(event);
    }

    /// The root of this saga's task tree.
    pub fn root_task(&self) -> &Task {
        self.saga.root_task()
    }

    /// Registers `handler` to run under `strategy` for every event
    /// matching `predicate`. See [`Saga::take`].
    pub fn take<F, Fut, P>(&self, name: &str, strategy: TakeStrategy, predicate: P, handler: F) -> TaskHandle
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
        F: Fn(SagaContext, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<()>> + Send + 'static,
    {
        self.saga.take(name, strategy, predicate, handler)
    }

    /// Cancels this saga and removes it from the store's registry (spec
    /// §6: `cancelSaga(s)`). Fails with `SagaNotRunning` if it was already
    /// cancelled or the store was disposed.
    pub fn cancel(&self) -> CoreResult<()> {
        self.store.cancel_saga(&self.name)
    }
}

/// A handle to a `take` registration, usable to cancel it independently
/// of the owning saga.
pub struct TaskHandle {
    task: Task,
    join: tokio::task::JoinHandle<()>,
}

impl TaskHandle {
    pub fn cancel(&self) {
        self.task.cancel();
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;
    use std::time::Duration;

    #[derive(Clone, Debug)]
    enum Evt {
        Inc(i64),
    }

    #[tokio::test]
    async fn take_every_runs_all_handlers() {
        let store = Store::new();
        let bus: EventBus<Evt> = EventBus::default();
        let saga = Saga::new(store.clone(), bus.clone(), "root");
        let total = Arc::new(AtomicI64::new(0));
        let total2 = total.clone();

        let _handle = saga.take("inc", TakeStrategy::Every, |_| true, move |_ctx, evt| {
            let total = total2.clone();
            async move {
                let Evt::Inc(n) = evt;
                total.fetch_add(n, Ordering::SeqCst);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.dispatch(Evt::Inc(1));
        bus.dispatch(Evt::Inc(2));
        bus.dispatch(Evt::Inc(3));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(total.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn take_latest_cancels_superseded_handler() {
        let store = Store::new();
        let bus: EventBus<Evt> = EventBus::default();
        let saga = Saga::new(store.clone(), bus.clone(), "root");
        let completed = Arc::new(Mutex::new(Vec::new()));
        let completed2 = completed.clone();

        let _handle = saga.take("latest", TakeStrategy::Latest, |_| true, move |ctx, evt| {
            let completed = completed2.clone();
            async move {
                let Evt::Inc(n) = evt;
                if ctx.delay(Duration::from_millis(30)).await.is_err() {
                    return Ok(());
                }
                completed.lock().push(n);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.dispatch(Evt::Inc(1));
        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.dispatch(Evt::Inc(2));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*completed.lock(), vec![2]);
    }

    #[tokio::test]
    async fn take_leading_ignores_events_while_busy() {
        let store = Store::new();
        let bus: EventBus<Evt> = EventBus::default();
        let saga = Saga::new(store.clone(), bus.clone(), "root");
        let completed = Arc::new(Mutex::new(Vec::new()));
        let completed2 = completed.clone();

        let _handle = saga.take("leading", TakeStrategy::Leading, |_| true, move |ctx, evt| {
            let completed = completed2.clone();
            async move {
                let Evt::Inc(n) = evt;
                let _ = ctx.delay(Duration::from_millis(30)).await;
                completed.lock().push(n);
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.dispatch(Evt::Inc(1));
        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.dispatch(Evt::Inc(2));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*completed.lock(), vec![1]);
    }

    #[tokio::test]
    async fn saga_cancel_stops_registration() {
        let store = Store::new();
        let bus: EventBus<Evt> = EventBus::default();
        let saga = Saga::new(store.clone(), bus.clone(), "root");
        let total = Arc::new(AtomicI64::new(0));
        let total2 = total.clone();
        let _handle = saga.take("inc", TakeStrategy::Every, |_| true, move |_ctx, evt| {
            let total = total2.clone();
            async move {
                let Evt::Inc(n) = evt;
                total.fetch_add(n, Ordering::SeqCst);
                Ok(())
            }
        });
        saga.cancel();
        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.dispatch(Evt::Inc(100));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_saga_rejects_a_duplicate_name_and_cancel_saga_stops_it() {
        let store = Store::new();
        let bus: EventBus<Evt> = EventBus::default();
        let handle = store.run_saga("checkout", bus.clone()).unwrap();
        assert!(matches!(
            store.run_saga("checkout", EventBus::<Evt>::default()),
            Err(CoreError::SagaAlreadyRunning)
        ));

        let total = Arc::new(AtomicI64::new(0));
        let total2 = total.clone();
        let _reg = handle.take("inc", TakeStrategy::Every, |_| true, move |_ctx, evt| {
            let total = total2.clone();
            async move {
                let Evt::Inc(n) = evt;
                total.fetch_add(n, Ordering::SeqCst);
                Ok(())
            }
        });

        handle.cancel().unwrap();
        assert!(matches!(store.cancel_saga("checkout"), Err(CoreError::SagaNotRunning)));

        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.dispatch(Evt::Inc(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dispose_cancels_every_running_saga() {
        let store = Store::new();
        let bus: EventBus<Evt> = EventBus::default();
        let handle = store.run_saga("a", bus.clone()).unwrap();
        let total = Arc::new(AtomicI64::new(0));
        let total2 = total.clone();
        let _reg = handle.take("inc", TakeStrategy::Every, |_| true, move |_ctx, evt| {
            let total = total2.clone();
            async move {
                let Evt::Inc(n) = evt;
                total.fetch_add(n, Ordering::SeqCst);
                Ok(())
            }
        });

        store.dispose();
        tokio::time::sleep(Duration::from_millis(5)).await;
        bus.dispatch(Evt::Inc(5));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(total.load(Ordering::SeqCst), 0);
        assert!(matches!(store.cancel_saga("a"), Err(CoreError::SagaNotRunning)));
    }
}
