//! The store: reads, writes, batching, subscriptions, middleware, and the
//! recomputation engine (spec §4.1–§4.3).
//!
//! Grounded on the teacher's `Runtime`/`Arc<SharedState>` split (one cheap
//! `Clone`-able handle wrapping shared state behind a lock) and on the
//! `update_if_necessary` pull algorithm from `leptos_reactive::runtime`
//! (retrieved reference example), adapted from thread-local `Rc<RefCell>`
//! storage to an `Arc<parking_lot::Mutex<_>>` so the handle is `Send` and
//! can cross the `tokio` task boundaries the saga and query layers need.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::TypeId;
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::graph::{FxIndexSet, Graph, NodeKind, NodeState, RefId, RefIdAllocator};
use crate::history::{HistoryEntry, HistoryRing};
use crate::module::ModuleEntry;
use crate::node::{Behavior, ComputeFn, EffectFn, LensWriteFn};
use crate::saga::{EventBus, Saga, SagaHandle};
use crate::tick::AtomicTick;
use crate::value::{self, AnyRef, AnyValue, EqualsFn, Ref};

pub(crate) type BeforeWrite =
    Arc<dyn Fn(RefId, &AnyValue, AnyValue) -> CoreResult<AnyValue> + Send + Sync>;
pub(crate) type AfterWrite = Arc<dyn Fn(RefId, &AnyValue, &AnyValue) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct MiddlewareEntry {
    pub(crate) before: Option<BeforeWrite>,
    pub(crate) after: Option<AfterWrite>,
}

type Listener = Box<dyn FnMut(&AnyValue) + Send>;

struct Subscriber {
    id: u64,
    added_generation: u64,
    listener: Mutex<Listener>,
}

/// A frame recording which sources a node's `compute` closure read
/// during the current recomputation, so that stale edges can be dropped
/// and fresh ones added once the closure returns (spec §3: "discovered
/// dynamically during recomputation; stale edges ... removed on each
/// recomputation").
struct ComputeFrame {
    node: RefId,
    observed: FxIndexSet<RefId>,
}

pub(crate) struct StoreInner {
    pub(crate) graph: Graph,
    alloc: RefIdAllocator,
    values: FxHashMap<RefId, AnyValue>,
    equals: FxHashMap<RefId, EqualsFn>,
    behaviors: FxHashMap<RefId, Behavior>,
    subscribers: FxHashMap<RefId, Vec<Subscriber>>,
    next_listener_id: u64,
    middleware: Vec<MiddlewareEntry>,
    interceptors: FxHashMap<RefId, Vec<BeforeWrite>>,
    batch_depth: u32,
    pending_dirty: FxIndexSet<RefId>,
    pending_effects: FxIndexSet<RefId>,
    flush_changed: indexmap::IndexMap<RefId, AnyValue, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>,
    compute_stack: Vec<ComputeFrame>,
    flush_generation: u64,
    pub(crate) tick: AtomicTick,
    pub(crate) history: FxHashMap<RefId, HistoryRing>,
    pub(crate) modules:
        indexmap::IndexMap<TypeId, ModuleEntry, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>,
    /// Saga cancel callbacks keyed by name, so `cancelSaga`/`cancelAllSagas`
    /// and `dispose` can stop every running saga without knowing its event
    /// type (spec §4.8/§6: `runSaga`, `cancelSaga`, `cancelAllSagas`).
    sagas: FxHashMap<String, Arc<dyn Fn() + Send + Sync>>,
    /// Peer ids of currently connected CRDT collaboration sessions, keyed
    /// by an internal session id, so `collaborativeSessions` can be
    /// answered without the store depending on the `crdt` module's types
    /// (spec §6: `collaborativeSessions`).
    collab_sessions: FxHashMap<u64, String>,
    next_collab_id: u64,
    /// Set while an undo/redo/jump is writing a value back, so that
    /// write does not itself get recorded as a new history entry.
    pub(crate) suppress_history_for: Option<RefId>,
    pub(crate) config: StoreConfig,
}

/// A cheap, `Clone`-able handle to a reactive store. Every clone shares
/// the same underlying graph, values, and subscriptions (spec §3: "Store:
/// holds ValueMap ...").
#[derive(Clone)]
pub struct Store(pub(crate) Arc<Mutex<StoreInner>>);

/// A scope handed to `compute`/`write`/effect closures, recording every
/// reacton read through it as a dependency of the node currently being
/// (re)computed.
pub struct Scope<'a> {
    store: &'a Store,
}

impl<'a> Scope<'a> {
    /// Reads `r`, pulling it up to date first and recording it as a
    /// dependency of the node this scope belongs to.
    pub fn get<T: Clone + 'static>(&self, r: Ref<T>) -> T {
        let v = self.store.pull(r.id);
        value::downcast(&v)
    }

    /// Writes to a source through a lens's focus function.
    pub fn set<T: Send + Sync + 'static>(&self, r: Ref<T>, v: T) -> CoreResult<()> {
        self.store.set(r, v)
    }

    /// The store this scope is bound to, for escape-hatch access (e.g.
    /// spawning a saga from an effect).
    pub fn store(&self) -> &Store {
        self.store
    }
}

/// A handle returned by [`Store::subscribe`]; dropping it does not
/// unsubscribe — call [`Subscription::unsubscribe`] explicitly.
#[must_use = "dropping a Subscription does not unsubscribe; call .unsubscribe()"]
pub struct Subscription {
    store: Store,
    node: RefId,
    listener_id: u64,
}

impl Subscription {
    /// Removes the listener. Idempotent.
    pub fn unsubscribe(self) {
        let mut inner = self.store.0.lock();
        if let Some(subs) = inner.subscribers.get_mut(&self.node) {
            subs.retain(|s| s.id != self.listener_id);
        }
    }
}

impl Store {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Creates a new store with the given configuration.
    pub fn with_config(config: StoreConfig) -> Self {
        Store(Arc::new(Mutex::new(StoreInner {
            graph: Graph::default(),
            alloc: RefIdAllocator::default(),
            values: FxHashMap::default(),
            equals: FxHashMap::default(),
            behaviors: FxHashMap::default(),
            subscribers: FxHashMap::default(),
            next_listener_id: 0,
            middleware: Vec::new(),
            interceptors: FxHashMap::default(),
            batch_depth: 0,
            pending_dirty: FxIndexSet::default(),
            pending_effects: FxIndexSet::default(),
            flush_changed: indexmap::IndexMap::default(),
            compute_stack: Vec::new(),
            flush_generation: 0,
            tick: AtomicTick::new(),
            history: FxHashMap::default(),
            modules: indexmap::IndexMap::default(),
            sagas: FxHashMap::default(),
            collab_sessions: FxHashMap::default(),
            next_collab_id: 0,
            suppress_history_for: None,
            config,
        })))
    }

    pub(crate) fn lock(&self) -> parking_lot::MutexGuard<'_, StoreInner> {
        self.0.lock()
    }

    fn alloc_name(name: Option<&str>) -> Option<Arc<str>> {
        name.map(Arc::from)
    }

    // ---- registration -------------------------------------------------

    /// Registers a source reacton with an initial value.
    pub fn source<T>(&self, initial: T) -> Ref<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.source_named(initial, None)
    }

    /// Like [`Store::source`], with a debug name.
    pub fn source_named<T>(&self, initial: T, name: Option<&str>) -> Ref<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let mut inner = self.0.lock();
        let id = inner.alloc.alloc();
        let name = Self::alloc_name(name);
        inner.graph.register(id, NodeKind::Source, name.clone());
        inner.graph.set_state(id, NodeState::Clean);
        inner.values.insert(id, value::boxed(initial));
        inner.equals.insert(id, value::default_equals::<T>());
        inner.behaviors.insert(id, Behavior::Source);
        Ref::new(id, name)
    }

    /// Registers a computed reacton. `deps` is the initial, eagerly
    /// wired dependency set (used for the synchronous cycle check);
    /// subsequent recomputations rediscover the actual set dynamically.
    pub fn computed<T, F>(&self, deps: &[AnyRef], compute: F) -> CoreResult<Ref<T>>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&Scope<'_>) -> T + Send + Sync + 'static,
    {
        self.computed_named(deps, compute, None)
    }

    /// Like [`Store::computed`], with a debug name.
    pub fn computed_named<T, F>(
        &self,
        deps: &[AnyRef],
        compute: F,
        name: Option<&str>,
    ) -> CoreResult<Ref<T>>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&Scope<'_>) -> T + Send + Sync + 'static,
    {
        let compute: ComputeFn = Arc::new(move |scope| value::boxed(compute(scope)));
        self.register_derived(NodeKind::Computed, deps, Behavior::Computed { compute }, name)
    }

    /// Registers a selector: a read-only projection, implemented as a
    /// computed under the hood (spec glossary: "Selector / Lens").
    pub fn selector<T, F>(&self, deps: &[AnyRef], project: F) -> CoreResult<Ref<T>>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&Scope<'_>) -> T + Send + Sync + 'static,
    {
        let compute: ComputeFn = Arc::new(move |scope| value::boxed(project(scope)));
        self.register_derived(NodeKind::Selector, deps, Behavior::Computed { compute }, None)
    }

    /// Registers a lens: a projection that both reads (`project`) and
    /// writes back through `write` (spec glossary: "Lens").
    pub fn lens<T, F, W>(&self, deps: &[AnyRef], project: F, write: W) -> CoreResult<Ref<T>>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn(&Scope<'_>) -> T + Send + Sync + 'static,
        W: Fn(&Scope<'_>, T) + Send + Sync + 'static,
    {
        let compute: ComputeFn = Arc::new(move |scope| value::boxed(project(scope)));
        let write: LensWriteFn = Arc::new(move |scope, v| write(scope, value::downcast::<T>(&v)));
        self.register_derived(NodeKind::Lens, deps, Behavior::Lens { compute, write }, None)
    }

    /// Registers an effect: a side-effecting closure with no value of its
    /// own, run once per flush that dirties one of `deps`.
    pub fn effect<F>(&self, deps: &[AnyRef], run: F) -> CoreResult<Ref<()>>
    where
        F: Fn(&Scope<'_>) + Send + Sync + 'static,
    {
        let run: EffectFn = Arc::new(run);
        let mut inner = self.0.lock();
        let id = inner.alloc.alloc();
        inner.graph.register(id, NodeKind::Effect, None);
        inner.graph.set_state(id, NodeState::Dirty);
        inner.behaviors.insert(id, Behavior::Effect { run });
        for dep in deps {
            if let Err(e) = inner.graph.add_edge(dep.id(), id) {
                inner.graph.remove(id);
                inner.behaviors.remove(&id);
                return Err(e);
            }
        }
        inner.pending_effects.insert(id);
        if inner.batch_depth == 0 {
            drop(inner);
            self.flush();
        }
        Ok(Ref::new(id, None))
    }

    fn register_derived<T: Clone + Send + Sync + 'static>(
        &self,
        kind: NodeKind,
        deps: &[AnyRef],
        behavior: Behavior,
        name: Option<&str>,
    ) -> CoreResult<Ref<T>>
    where
        T: PartialEq,
    {
        let mut inner = self.0.lock();
        let id = inner.alloc.alloc();
        let name = Self::alloc_name(name);
        inner.graph.register(id, kind, name.clone());
        inner.graph.set_state(id, NodeState::Dirty);
        inner.equals.insert(id, value::default_equals::<T>());
        for dep in deps {
            if let Err(e) = inner.graph.add_edge(dep.id(), id) {
                inner.graph.remove(id);
                inner.equals.remove(&id);
                return Err(e);
            }
        }
        inner.behaviors.insert(id, behavior);
        drop(inner);
        Ok(Ref::new(id, name))
    }

    /// Removes a reacton entirely: severs its edges and drops it from
    /// the value map (spec §3 lifecycle: "unregistered ... by explicit
    /// removal").
    pub fn remove<T>(&self, r: Ref<T>) {
        self.remove_id(r.id);
    }

    /// Type-erased form of [`Store::remove`], used by module uninstall to
    /// drop reactons it only knows as [`AnyRef`]s.
    pub(crate) fn remove_id(&self, id: RefId) {
        let mut inner = self.0.lock();
        inner.graph.remove(id);
        inner.values.remove(&id);
        inner.equals.remove(&id);
        inner.behaviors.remove(&id);
        inner.subscribers.remove(&id);
        inner.history.remove(&id);
    }

    // ---- reads & writes -------------------------------------------------

    /// Reads `r`'s current value, pulling a recomputation if stale.
    pub fn get<T: Clone + 'static>(&self, r: Ref<T>) -> T {
        let v = self.pull(r.id);
        value::downcast(&v)
    }

    /// Writes a new value to a source (or through a lens's write-back).
    pub fn set<T: Send + Sync + 'static>(&self, r: Ref<T>, v: T) -> CoreResult<()> {
        self.set_any(r.id, value::boxed(v))
    }

    /// Applies `f` to the current value and writes back the result, as
    /// one atomic step relative to subscribers (spec §4.3).
    pub fn update<T: Clone + Send + Sync + 'static>(
        &self,
        r: Ref<T>,
        f: impl FnOnce(T) -> T,
    ) -> CoreResult<()> {
        let old = self.get(r.clone());
        self.set(r, f(old))
    }

    fn set_any(&self, id: RefId, new_value: AnyValue) -> CoreResult<()> {
        let mut inner = self.0.lock();

        let behavior_is_lens = matches!(inner.behaviors.get(&id), Some(Behavior::Lens { .. }));
        if behavior_is_lens {
            let write = match inner.behaviors.get(&id) {
                Some(Behavior::Lens { write, .. }) => write.clone(),
                _ => unreachable!(),
            };
            drop(inner);
            let scope = Scope { store: self };
            write(&scope, new_value);
            return Ok(());
        }

        let old_value = inner
            .values
            .get(&id)
            .cloned()
            .unwrap_or_else(|| value::boxed(()));

        let mut value = new_value;
        for mw in inner.middleware.clone() {
            if let Some(before) = mw.before {
                value = before(id, &old_value, value)?;
            }
        }
        if let Some(interceptors) = inner.interceptors.get(&id).cloned() {
            for interceptor in interceptors {
                value = interceptor(id, &old_value, value)?;
            }
        }

        let equal = inner
            .equals
            .get(&id)
            .map(|eq| eq(&old_value, &value))
            .unwrap_or(false);
        if equal {
            return Ok(());
        }

        inner.values.insert(id, value.clone());
        let tick = inner.tick.load();
        if inner.suppress_history_for != Some(id) {
            if let Some(ring) = inner.history.get_mut(&id) {
                ring.push(HistoryEntry {
                    before: old_value.clone(),
                    after: value.clone(),
                    tick,
                });
            }
        }

        inner.flush_changed.insert(id, value.clone());

        let affected = inner.graph.mark_dirty(id);
        for a in affected {
            if matches!(inner.graph.kind(a), Some(NodeKind::Effect)) {
                inner.pending_effects.insert(a);
            } else if a != id {
                inner.pending_dirty.insert(a);
            }
        }

        for mw in inner.middleware.clone().into_iter().rev() {
            if let Some(after) = mw.after {
                after(id, &old_value, &value);
            }
        }

        let should_flush = inner.batch_depth == 0;
        drop(inner);
        if should_flush {
            self.flush();
        }
        Ok(())
    }

    /// Reads the current value without pulling a recomputation, for
    /// internal callers (branch/snapshot) that already know it is fresh.
    pub(crate) fn peek_any(&self, id: RefId) -> Option<AnyValue> {
        self.0.lock().values.get(&id).cloned()
    }

    /// Every currently-initialized `(id, value)` pair, for snapshotting.
    pub(crate) fn all_values(&self) -> Vec<(RefId, AnyValue)> {
        self.0
            .lock()
            .values
            .iter()
            .map(|(&id, v)| (id, v.clone()))
            .collect()
    }

    pub(crate) fn set_any_external(&self, id: RefId, v: AnyValue) -> CoreResult<()> {
        self.set_any(id, v)
    }

    /// Writes `v` to `id` without recording a new history entry, used by
    /// undo/redo/jumpTo to avoid the write-back clobbering its own log.
    pub(crate) fn set_any_suppressed(&self, id: RefId, v: AnyValue) -> CoreResult<()> {
        self.0.lock().suppress_history_for = Some(id);
        let result = self.set_any(id, v);
        self.0.lock().suppress_history_for = None;
        result
    }

    // ---- subscriptions --------------------------------------------------

    /// Subscribes to post-flush notifications of `r`'s new value.
    /// Listeners added during an active flush observe the *next* flush,
    /// not the one in progress (spec §4.3).
    pub fn subscribe<T, F>(&self, r: Ref<T>, mut listener: F) -> Subscription
    where
        T: Clone + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let mut inner = self.0.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        let generation = inner.flush_generation;
        let boxed: Listener = Box::new(move |v: &AnyValue| listener(value::downcast::<T>(v)));
        inner
            .subscribers
            .entry(r.id)
            .or_default()
            .push(Subscriber {
                id,
                added_generation: generation,
                listener: Mutex::new(boxed),
            });
        Subscription {
            store: self.clone(),
            node: r.id,
            listener_id: id,
        }
    }

    // ---- middleware -----------------------------------------------------

    /// Registers store-wide middleware. `before` may transform or reject
    /// (return `Err`) a pending write; `after` observes the committed
    /// value. Composition order: first-registered wins on `before`
    /// (outer transforms, then inner); last-registered wins on `after`
    /// (inner fires, then outer) — spec §9.
    pub fn use_middleware(
        &self,
        before: Option<BeforeWrite>,
        after: Option<AfterWrite>,
    ) {
        self.0.lock().middleware.push(MiddlewareEntry { before, after });
    }

    /// Registers a per-node interceptor, run after store-wide middleware
    /// and before the equality check.
    pub fn add_interceptor(&self, id: RefId, interceptor: BeforeWrite) {
        self.0
            .lock()
            .interceptors
            .entry(id)
            .or_default()
            .push(interceptor);
    }

    // ---- batching & flush -------------------------------------------------

    /// Batches writes performed inside `f`: nested batches collapse into
    /// a single flush at the outermost boundary (spec §4.2).
    pub fn batch<R>(&self, f: impl FnOnce(&Store) -> R) -> R {
        {
            let mut inner = self.0.lock();
            inner.batch_depth += 1;
        }
        let result = f(self);
        let should_flush = {
            let mut inner = self.0.lock();
            inner.batch_depth -= 1;
            inner.batch_depth == 0
        };
        if should_flush {
            self.flush();
        }
        result
    }

    /// Pulls `id` up to date (recursively ensuring its sources are
    /// fresh first), recording the read as a dependency of whatever node
    /// is currently being computed, if any.
    pub(crate) fn pull(&self, id: RefId) -> AnyValue {
        self.ensure_fresh(id);
        {
            let mut inner = self.0.lock();
            if let Some(frame) = inner.compute_stack.last_mut() {
                frame.observed.insert(id);
            }
        }
        self.0
            .lock()
            .values
            .get(&id)
            .cloned()
            .unwrap_or_else(|| panic!("read of unregistered reacton {:?}", id))
    }

    fn ensure_fresh(&self, id: RefId) {
        let (kind, state) = {
            let inner = self.0.lock();
            (inner.graph.kind(id), inner.graph.state(id))
        };
        match (kind, state) {
            (Some(NodeKind::Source), _) | (None, _) => {}
            (Some(_), Some(NodeState::Clean)) => {}
            (Some(_), Some(NodeState::Check)) => {
                let sources = self.0.lock().graph.sources_of(id);
                let mut any_changed = false;
                for s in sources {
                    let before = self.peek_any(s);
                    self.ensure_fresh(s);
                    let after = self.peek_any(s);
                    let eq = self.values_equal(s, &before, &after);
                    if !eq {
                        any_changed = true;
                    }
                }
                if any_changed {
                    self.recompute_now(id);
                } else {
                    self.0.lock().graph.set_state(id, NodeState::Clean);
                }
            }
            (Some(_), Some(NodeState::Dirty)) => {
                self.recompute_now(id);
            }
            (Some(_), None) => {}
        }
    }

    fn values_equal(&self, id: RefId, a: &Option<AnyValue>, b: &Option<AnyValue>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => {
                let inner = self.0.lock();
                inner
                    .equals
                    .get(&id)
                    .map(|eq| eq(a, b))
                    .unwrap_or_else(|| Arc::ptr_eq(a, b))
            }
            (None, None) => true,
            _ => false,
        }
    }

    fn recompute_now(&self, id: RefId) {
        let behavior_compute = {
            let inner = self.0.lock();
            match inner.behaviors.get(&id) {
                Some(Behavior::Computed { compute }) | Some(Behavior::Lens { compute, .. }) => {
                    Some(compute.clone())
                }
                _ => None,
            }
        };
        let compute = match behavior_compute {
            Some(c) => c,
            None => return,
        };

        {
            let mut inner = self.0.lock();
            inner.compute_stack.push(ComputeFrame {
                node: id,
                observed: FxIndexSet::default(),
            });
        }
        let scope = Scope { store: self };
        let new_value = compute(&scope);
        let frame = {
            let mut inner = self.0.lock();
            inner.compute_stack.pop().expect("compute frame present")
        };
        debug_assert_eq!(frame.node, id);

        // Validate the freshly observed source set against the current
        // graph before mutating anything, so a rediscovered cycle leaves
        // the graph untouched (spec §4.1: "fail before mutation").
        {
            let inner = self.0.lock();
            for &src in &frame.observed {
                if inner.graph.would_cycle(id, src) {
                    drop(inner);
                    tracing::warn!(node = ?id, source = ?src, "dynamic dependency would introduce a cycle; keeping prior edges");
                    self.0.lock().graph.set_state(id, NodeState::Clean);
                    return;
                }
            }
        }

        let mut inner = self.0.lock();
        inner.graph.clear_sources(id);
        for src in frame.observed.iter().copied().collect::<Vec<_>>() {
            inner
                .graph
                .add_edge(src, id)
                .expect("pre-validated edge cannot fail");
        }

        let old_value = inner.values.get(&id).cloned();
        let equal = old_value
            .as_ref()
            .and_then(|old| inner.equals.get(&id).map(|eq| eq(old, &new_value)))
            .unwrap_or(false);

        // Keep the old `Arc` when the freshly computed value is equal so
        // that a later snapshot diff (which compares `Arc` identity) does
        // not see a spurious change.
        if !equal {
            inner.values.insert(id, new_value.clone());
            inner.flush_changed.insert(id, new_value);
        }
        inner.graph.set_state(id, NodeState::Clean);
    }

    /// Flushes pending recomputation and notifies subscribers. Called
    /// automatically when `batch_depth` returns to zero.
    pub(crate) fn flush(&self) {
        let this_generation = {
            let mut inner = self.0.lock();
            inner.flush_generation += 1;
            inner.flush_generation
        };

        let bound = self.0.lock().config.feedback_bound;
        let mut passes: u32 = 0;
        loop {
            passes += 1;
            if passes > bound {
                tracing::error!(bound, "flush exceeded re-entrant pass bound; likely feedback loop");
                break;
            }

            let dirty = {
                let mut inner = self.0.lock();
                let mut list: Vec<RefId> = inner.pending_dirty.drain(..).collect();
                list.sort_by_key(|id| (inner.graph.level(*id), id.sort_key()));
                list
            };

            let effects: Vec<RefId> = {
                let mut inner = self.0.lock();
                inner.pending_effects.drain(..).collect()
            };

            if dirty.is_empty() && effects.is_empty() {
                break;
            }

            for id in dirty {
                self.ensure_fresh(id);
            }

            for id in effects {
                self.run_effect(id);
            }
        }

        let changed: Vec<(RefId, AnyValue)> = {
            let mut inner = self.0.lock();
            inner.flush_changed.drain(..).collect()
        };

        for (id, value) in changed {
            let listeners: Vec<(u64, u64)> = {
                let inner = self.0.lock();
                inner
                    .subscribers
                    .get(&id)
                    .map(|v| v.iter().map(|s| (s.id, s.added_generation)).collect())
                    .unwrap_or_default()
            };
            for (listener_id, added_generation) in listeners {
                if added_generation >= this_generation {
                    continue;
                }
                let inner = self.0.lock();
                if let Some(subs) = inner.subscribers.get(&id) {
                    if let Some(s) = subs.iter().find(|s| s.id == listener_id) {
                        let mut guard = s.listener.lock();
                        (guard)(&value);
                    }
                }
            }
        }

        self.0.lock().tick.advance();
    }

    fn run_effect(&self, id: RefId) {
        for src in self.0.lock().graph.sources_of(id) {
            self.ensure_fresh(src);
        }
        let run = match self.0.lock().behaviors.get(&id) {
            Some(Behavior::Effect { run }) => Some(run.clone()),
            _ => None,
        };
        if let Some(run) = run {
            let scope = Scope { store: self };
            run(&scope);
        }
        self.0.lock().graph.set_state(id, NodeState::Clean);
    }

    /// Starts a new named saga listening on `bus` (spec §6: `runSaga(s) ->
    /// task`). Fails with `SagaAlreadyRunning` if a saga with this name is
    /// already registered against this store.
    pub fn run_saga<E>(&self, name: &str, bus: EventBus<E>) -> CoreResult<SagaHandle<E>>
    where
        E: Clone + Send + 'static,
    {
        let saga = Arc::new(Saga::new(self.clone(), bus, name));
        let cancel_handle = saga.clone();
        let mut inner = self.0.lock();
        if inner.sagas.contains_key(name) {
            return Err(CoreError::SagaAlreadyRunning);
        }
        inner
            .sagas
            .insert(name.to_string(), Arc::new(move || cancel_handle.cancel()));
        drop(inner);
        Ok(SagaHandle::new(name.to_string(), self.clone(), saga))
    }

    /// Cancels the named saga and removes it from the registry (spec §6:
    /// `cancelSaga(s)`). Fails with `SagaNotRunning` if no saga with this
    /// name is currently running.
    pub fn cancel_saga(&self, name: &str) -> CoreResult<()> {
        let cancel = self.0.lock().sagas.remove(name);
        match cancel {
            Some(cancel) => {
                cancel();
                Ok(())
            }
            None => Err(CoreError::SagaNotRunning),
        }
    }

    /// Cancels every saga currently registered against this store (spec
    /// §6: `cancelAllSagas()`).
    pub fn cancel_all_sagas(&self) {
        let cancels: Vec<_> = self.0.lock().sagas.drain().map(|(_, c)| c).collect();
        for cancel in cancels {
            cancel();
        }
    }

    /// Registers a newly connected CRDT collaboration session under
    /// `peer_id`, returning the id used to deregister it. Used by
    /// [`crate::crdt::CollaborationBuilder::connect`].
    pub(crate) fn register_collab_session(&self, peer_id: &str) -> u64 {
        let mut inner = self.0.lock();
        let id = inner.next_collab_id;
        inner.next_collab_id += 1;
        inner.collab_sessions.insert(id, peer_id.to_string());
        id
    }

    /// Removes a collaboration session from the registry. Used when a
    /// [`crate::crdt::CollaborationSession`] disconnects or is dropped.
    pub(crate) fn deregister_collab_session(&self, id: u64) {
        self.0.lock().collab_sessions.remove(&id);
    }

    /// Peer ids of every currently connected CRDT collaboration session
    /// (spec §6: `collaborativeSessions`).
    pub fn collaborative_sessions(&self) -> Vec<String> {
        self.0.lock().collab_sessions.values().cloned().collect()
    }

    /// Cancels all sagas, disposes installed modules in reverse-install
    /// order, and clears all state (spec §4.3).
    pub fn dispose(&self) {
        self.cancel_all_sagas();
        crate::module::dispose_all(self);
        let mut inner = self.0.lock();
        inner.values.clear();
        inner.equals.clear();
        inner.behaviors.clear();
        inner.subscribers.clear();
        inner.history.clear();
        inner.pending_dirty.clear();
        inner.pending_effects.clear();
        inner.graph = Graph::default();
    }
}

impl Default for Store {
    fn default() -> Self {
        Store::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diamond_glitch_free_single_notification() {
        let store = Store::new();
        let a = store.source(1i64);
        let value = a.clone();
        let b = store.computed(&[a.erase()], move |s| 2 * s.get(value)).unwrap();
        let value = a.clone();
        let c = store.computed(&[a.erase()], move |s| s.get(value) + 1).unwrap();
        let d = store
            .computed(&[b.erase(), c.erase()], move |s| s.get(b) + s.get(c))
            .unwrap();

        let count = Arc::new(Mutex::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let count = count.clone();
            let seen = seen.clone();
            store.subscribe(d.clone(), move |v: i64| {
                *count.lock() += 1;
                seen.lock().push(v);
            })
        };

        store.set(a, 10).unwrap();
        assert_eq!(store.get(d), 31);
        assert_eq!(*count.lock(), 1);
        assert_eq!(*seen.lock(), vec![31]);
    }

    #[test]
    fn batched_writes_coalesce_to_one_notification() {
        let store = Store::new();
        let x = store.source(0i64);
        let y = store.source(0i64);
        let value = y.clone();
        let value = x.clone();
        let sum = store
            .computed(&[x.erase(), y.erase()], move |s| s.get(value) + s.get(value))
            .unwrap();

        let count = Arc::new(Mutex::new(0));
        let last = Arc::new(Mutex::new(0));
        let _sub = {
            let count = count.clone();
            let last = last.clone();
            store.subscribe(sum, move |v: i64| {
                *count.lock() += 1;
                *last.lock() = v;
            })
        };

        store.batch(|s| {
            s.set(x, 5).unwrap();
            s.set(y, 10).unwrap();
        });

        assert_eq!(*count.lock(), 1);
        assert_eq!(*last.lock(), 15);
    }

    #[test]
    fn equal_write_short_circuits() {
        let store = Store::new();
        let r = store.source(5i64);
        let count = Arc::new(Mutex::new(0));
        let _sub = {
            let count = count.clone();
            store.subscribe(r.clone(), move |_: i64| *count.lock() += 1)
        };
        store.set(r, 5).unwrap();
        assert_eq!(*count.lock(), 0);
    }
}
