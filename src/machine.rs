//! Typed finite-state machines backed by a state reacton (spec §4.7).
//!
//! Grounded on the teacher's cycle-guarded `Runtime::execute_query`
//! "already in progress" check (an in-flight flag that rejects
//! re-entrant execution rather than deadlocking), reused here as the
//! `AlreadyTransitioning` guard around `send`.

use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::{CoreError, CoreResult};
use crate::store::Store;
use crate::value::Ref;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type Handler<S, E> = Arc<dyn Fn(S, E) -> BoxFuture<'static, CoreResult<S>> + Send + Sync>;
type Guard<S, E> = Arc<dyn Fn(&S, &E) -> bool + Send + Sync>;
type OnTransition<S> = Arc<dyn Fn(&S, &S) + Send + Sync>;

/// Builds a [`Machine`] by registering transitions, guards, and an
/// optional `onTransition` hook before binding it to a store.
pub struct MachineBuilder<S, E> {
    initial: S,
    transitions: FxHashMap<(S, E), Handler<S, E>>,
    guards: FxHashMap<(S, E), Guard<S, E>>,
    on_transition: Option<OnTransition<S>>,
}

impl<S, E> MachineBuilder<S, E>
where
    S: Eq + Hash + Clone + PartialEq + Send + Sync + 'static,
    E: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(initial: S) -> Self {
        MachineBuilder {
            initial,
            transitions: FxHashMap::default(),
            guards: FxHashMap::default(),
            on_transition: None,
        }
    }

    /// Registers a synchronous handler for `(state, event)`.
    pub fn on_sync<F>(mut self, state: S, event: E, handler: F) -> Self
    where
        F: Fn(S, E) -> S + Send + Sync + 'static,
    {
        let handler = Arc::new(move |s: S, e: E| {
            let next = handler(s, e);
            Box::pin(async move { Ok(next) }) as BoxFuture<'static, CoreResult<S>>
        });
        self.transitions.insert((state, event), handler);
        self
    }

    /// Registers an asynchronous handler for `(state, event)`.
    pub fn on<F, Fut>(mut self, state: S, event: E, handler: F) -> Self
    where
        F: Fn(S, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<S>> + Send + 'static,
    {
        let handler = Arc::new(move |s: S, e: E| Box::pin(handler(s, e)) as BoxFuture<'static, CoreResult<S>>);
        self.transitions.insert((state, event), handler);
        self
    }

    /// Registers a guard that must return `true` for the transition at
    /// `(state, event)` to proceed.
    pub fn guard<F>(mut self, state: S, event: E, guard: F) -> Self
    where
        F: Fn(&S, &E) -> bool + Send + Sync + 'static,
    {
        self.guards.insert((state, event), Arc::new(guard));
        self
    }

    /// Registers a side-effect run after every committed transition.
    pub fn on_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(&S, &S) + Send + Sync + 'static,
    {
        self.on_transition = Some(Arc::new(f));
        self
    }

    /// Binds the machine to `store`, registering its state reacton.
    pub fn build(self, store: &Store) -> Machine<S, E> {
        let state = store.source(self.initial);
        Machine {
            store: store.clone(),
            state,
            transitions: Arc::new(self.transitions),
            guards: Arc::new(self.guards),
            on_transition: self.on_transition,
            transitioning: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A typed state machine whose current state lives in a store reacton
/// (spec §4.7).
#[derive(Clone)]
pub struct Machine<S, E> {
    store: Store,
    state: Ref<S>,
    transitions: Arc<FxHashMap<(S, E), Handler<S, E>>>,
    guards: Arc<FxHashMap<(S, E), Guard<S, E>>>,
    on_transition: Option<OnTransition<S>>,
    transitioning: Arc<AtomicBool>,
}

impl<S, E> Machine<S, E>
where
    S: Eq + Hash + Clone + PartialEq + Send + Sync + 'static,
    E: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// The reacton holding the machine's current state, for use with
    /// `Store::get`/`subscribe`.
    pub fn state_ref(&self) -> Ref<S> {
        self.state.clone()
    }

    pub fn machine_state(&self) -> S {
        self.store.get(self.state.clone())
    }

    /// Whether the current state has a handler for `event` (guards are
    /// not evaluated).
    pub fn can_send(&self, event: &E) -> bool {
        let current = self.machine_state();
        self.transitions.contains_key(&(current, event.clone()))
    }

    /// The set of events with a registered handler for `state`.
    pub fn valid_events(&self, state: &S) -> Vec<E> {
        self.transitions
            .keys()
            .filter(|(s, _)| s == state)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Runs the transition for `event` against the current state.
    pub async fn send(&self, event: E) -> CoreResult<S> {
        if self
            .transitioning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::AlreadyTransitioning);
        }

        let result = self.send_inner(event).await;
        self.transitioning.store(false, Ordering::SeqCst);
        result
    }

    async fn send_inner(&self, event: E) -> CoreResult<S> {
        let current = self.machine_state();
        let key = (current.clone(), event.clone());

        if let Some(guard) = self.guards.get(&key) {
            if !guard(&current, &event) {
                return Err(CoreError::GuardBlocked);
            }
        }

        let handler = self
            .transitions
            .get(&key)
            .cloned()
            .ok_or(CoreError::NoTransition)?;

        let next = handler(current.clone(), event).await?;
        self.store.set(self.state.clone(), next.clone())?;
        if let Some(on_transition) = &self.on_transition {
            on_transition(&current, &next);
        }
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum Light {
        Red,
        Green,
        Yellow,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    enum Event {
        Next,
    }

    fn traffic_light(store: &Store) -> Machine<Light, Event> {
        MachineBuilder::new(Light::Red)
            .on_sync(Light::Red, Event::Next, |_, _| Light::Green)
            .on_sync(Light::Green, Event::Next, |_, _| Light::Yellow)
            .on_sync(Light::Yellow, Event::Next, |_, _| Light::Red)
            .build(store)
    }

    #[tokio::test]
    async fn advances_through_states() {
        let store = Store::new();
        let m = traffic_light(&store);
        assert_eq!(m.send(Event::Next).await.unwrap(), Light::Green);
        assert_eq!(m.send(Event::Next).await.unwrap(), Light::Yellow);
        assert_eq!(m.machine_state(), Light::Yellow);
    }

    #[tokio::test]
    async fn guard_blocks_transition() {
        let store = Store::new();
        let m = MachineBuilder::new(Light::Red)
            .on_sync(Light::Red, Event::Next, |_, _| Light::Green)
            .guard(Light::Red, Event::Next, |_, _| false)
            .build(&store);
        assert!(matches!(m.send(Event::Next).await, Err(CoreError::GuardBlocked)));
        assert_eq!(m.machine_state(), Light::Red);
    }

    #[tokio::test]
    async fn missing_handler_is_no_transition() {
        let store = Store::new();
        let empty: Machine<Light, Event> = MachineBuilder::new(Light::Red).build(&store);
        assert!(!empty.can_send(&Event::Next));
        assert!(matches!(
            empty.send(Event::Next).await,
            Err(CoreError::NoTransition)
        ));
    }
}
