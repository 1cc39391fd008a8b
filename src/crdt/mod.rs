//! CRDT-style multi-peer sync for a subset of a store's reactons (spec
//! §4.10): each tracked reacton's writes carry a vector clock, local and
//! remote updates merge deterministically, and genuine concurrent writes
//! resolve via a pluggable [`MergeStrategy`] surfaced on an `onConflict`
//! stream.
//!
//! Grounded on the teacher's `Subscriber`/notification fan-out for
//! detecting local writes, and its cycle/version-mismatch error
//! reporting style for [`crate::error::CoreError::InvalidMessage`] and
//! [`crate::error::CoreError::UnsupportedVersion`].

pub mod clock;
pub mod merge;
pub mod message;

pub use clock::{ClockOrder, VectorClock};
pub use merge::{ConflictSide, MergeStrategy};
pub use message::SyncMessage;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{CoreError, CoreResult};
use crate::graph::RefId;
use crate::store::{Store, Subscription};
use crate::value::Ref;

/// A bidirectional channel carrying [`SyncMessage`]s to and from a peer.
/// Implementors are expected to be single-owner: one [`CollaborationSession`]
/// drives both halves from its background task.
#[async_trait]
pub trait Duplex: Send {
    async fn send(&mut self, message: SyncMessage) -> CoreResult<()>;
    async fn recv(&mut self) -> CoreResult<SyncMessage>;
}

type SerializeFn = Arc<dyn Fn(&Store) -> CoreResult<Value> + Send + Sync>;
type ApplyFn = Arc<dyn Fn(&Store, Value) -> CoreResult<()> + Send + Sync>;

#[derive(Clone)]
struct Binding {
    serialize: SerializeFn,
    apply: ApplyFn,
}

/// A conflict detected between a local and a remote concurrent write,
/// together with how it was resolved.
#[derive(Clone, Debug)]
pub struct ConflictEvent {
    pub ref_name: String,
    pub local: Value,
    pub remote: Value,
    pub resolved: Value,
    pub local_clock: VectorClock,
    pub remote_clock: VectorClock,
}

enum LocalChange {
    Changed { ref_name: String, value: Value },
}

/// Per-ref sync bookkeeping shared between a session's background task and
/// its handle, backing `isSynced`/`clockOf` (spec §6).
#[derive(Default)]
struct SyncState {
    /// The clock each tracked ref's current value was last written or
    /// merged at.
    ref_clocks: HashMap<String, VectorClock>,
    /// Ref names with a locally written value sent to the peer but not
    /// yet covered by a `SyncAck`.
    pending: HashSet<String>,
}

/// Builds a [`CollaborationSession`] by registering which reactons to
/// track before connecting a channel.
pub struct CollaborationBuilder {
    store: Store,
    peer_id: String,
    strategy: MergeStrategy,
    bindings: IndexMap<String, Binding>,
    tracked: IndexMap<RefId, String>,
    subs: Vec<Subscription>,
    local_tx: mpsc::UnboundedSender<LocalChange>,
    local_rx: mpsc::UnboundedReceiver<LocalChange>,
    applying: Arc<AtomicBool>,
}

impl CollaborationBuilder {
    pub fn new(store: &Store, peer_id: impl Into<String>) -> Self {
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        CollaborationBuilder {
            store: store.clone(),
            peer_id: peer_id.into(),
            strategy: MergeStrategy::LastWriterWins,
            bindings: IndexMap::new(),
            tracked: IndexMap::new(),
            subs: Vec::new(),
            local_tx,
            local_rx,
            applying: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn strategy(mut self, strategy: MergeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Tracks `r` under `name`, publishing local writes to peers and
    /// accepting remote writes for it.
    pub fn track<T>(mut self, name: impl Into<String>, r: Ref<T>) -> Self
    where
        T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
    {
        let name = name.into();
        let r_for_serialize = r.clone();
        let serialize: SerializeFn = Arc::new(move |store: &Store| {
            serde_json::to_value(store.get(r_for_serialize.clone())).map_err(|e| CoreError::InvalidMessage(e.to_string()))
        });
        let r_for_apply = r.clone();
        let apply: ApplyFn = Arc::new(move |store: &Store, value: Value| {
            let typed: T = serde_json::from_value(value).map_err(|e| CoreError::InvalidMessage(e.to_string()))?;
            store.set(r_for_apply.clone(), typed)
        });

        let applying = self.applying.clone();
        let tx = self.local_tx.clone();
        let name_for_sub = name.clone();
        let sub = self.store.subscribe(r.clone(), move |value: T| {
            if applying.load(Ordering::SeqCst) {
                return;
            }
            if let Ok(v) = serde_json::to_value(value) {
                let _ = tx.send(LocalChange::Changed { ref_name: name_for_sub.clone(), value: v });
            }
        });

        self.subs.push(sub);
        self.tracked.insert(r.id(), name.clone());
        self.bindings.insert(name, Binding { serialize, apply });
        self
    }

    /// Connects `channel` and starts the background sync task, returning
    /// a handle to observe conflicts and disconnect.
    pub fn connect<D>(self, channel: D) -> CollaborationSession
    where
        D: Duplex + Send + 'static,
    {
        let (conflict_tx, conflict_rx) = mpsc::unbounded_channel();
        let clock = Arc::new(Mutex::new(VectorClock::new()));
        let sync = Arc::new(Mutex::new(SyncState::default()));
        let session_id = self.store.register_collab_session(&self.peer_id);

        let join = tokio::spawn(run_session(
            self.store.clone(),
            self.peer_id,
            self.strategy,
            self.bindings,
            self.local_rx,
            self.applying,
            clock.clone(),
            sync.clone(),
            channel,
            conflict_tx,
        ));

        CollaborationSession {
            store: self.store,
            session_id,
            join,
            conflicts: Mutex::new(conflict_rx),
            clock,
            sync,
            tracked: self.tracked,
            _subs: self.subs,
        }
    }
}

async fn run_session<D: Duplex>(
    store: Store,
    peer_id: String,
    strategy: MergeStrategy,
    bindings: IndexMap<String, Binding>,
    mut local_rx: mpsc::UnboundedReceiver<LocalChange>,
    applying: Arc<AtomicBool>,
    clock: Arc<Mutex<VectorClock>>,
    sync: Arc<Mutex<SyncState>>,
    mut channel: D,
    conflict_tx: mpsc::UnboundedSender<ConflictEvent>,
) {
    // Pull any state the peer diverged on before we connected; the peer
    // answers with a `SyncFull` (spec §4.10).
    let initial_clock = clock.lock().clone();
    let _ = channel.send(SyncMessage::SyncRequestFull { clock: initial_clock }).await;

    loop {
        tokio::select! {
            local = local_rx.recv() => {
                let Some(LocalChange::Changed { ref_name, value }) = local else { break };
                let new_clock = { let mut c = clock.lock(); c.increment(&peer_id); c.clone() };
                let wall_clock_millis = now_millis();
                {
                    let mut s = sync.lock();
                    s.ref_clocks.insert(ref_name.clone(), new_clock.clone());
                    s.pending.insert(ref_name.clone());
                }
                let _ = channel
                    .send(SyncMessage::SyncDelta { ref_name, value, clock: new_clock, peer_id: peer_id.clone(), wall_clock_millis })
                    .await;
            }
            incoming = channel.recv() => {
                let Ok(message) = incoming else { break };
                handle_incoming(&store, &peer_id, &strategy, &bindings, &applying, &clock, &sync, &mut channel, &conflict_tx, message).await;
            }
        }
    }
}

async fn handle_incoming<D: Duplex>(
    store: &Store,
    peer_id: &str,
    strategy: &MergeStrategy,
    bindings: &IndexMap<String, Binding>,
    applying: &Arc<AtomicBool>,
    clock: &Arc<Mutex<VectorClock>>,
    sync: &Arc<Mutex<SyncState>>,
    channel: &mut D,
    conflict_tx: &mpsc::UnboundedSender<ConflictEvent>,
    message: SyncMessage,
) {
    match message {
        SyncMessage::SyncRequestFull { .. } => {
            let mut values = HashMap::new();
            for (name, binding) in bindings {
                if let Ok(v) = (binding.serialize)(store) {
                    values.insert(name.clone(), v);
                }
            }
            let current = clock.lock().clone();
            let _ = channel.send(SyncMessage::SyncFull { values, clock: current }).await;
        }
        SyncMessage::SyncFull { values, clock: remote_clock } => {
            applying.store(true, Ordering::SeqCst);
            for (name, value) in &values {
                if let Some(binding) = bindings.get(name) {
                    let _ = (binding.apply)(store, value.clone());
                }
            }
            applying.store(false, Ordering::SeqCst);
            clock.lock().merge(&remote_clock);
            let acked_clock = clock.lock().clone();
            {
                let mut s = sync.lock();
                for name in values.keys() {
                    s.ref_clocks.insert(name.clone(), acked_clock.clone());
                }
            }
            let _ = channel.send(SyncMessage::SyncAck { clock: acked_clock }).await;
        }
        SyncMessage::SyncDelta { ref_name, value, clock: remote_clock, peer_id: remote_peer, wall_clock_millis } => {
            let Some(binding) = bindings.get(&ref_name) else { return };
            let local_clock = clock.lock().clone();
            match local_clock.compare(&remote_clock) {
                ClockOrder::Equal => {}
                ClockOrder::Before => {
                    applying.store(true, Ordering::SeqCst);
                    let _ = (binding.apply)(store, value);
                    applying.store(false, Ordering::SeqCst);
                    clock.lock().merge(&remote_clock);
                    let merged = clock.lock().clone();
                    sync.lock().ref_clocks.insert(ref_name, merged.clone());
                    let _ = channel.send(SyncMessage::SyncAck { clock: merged }).await;
                }
                ClockOrder::After => {}
                ClockOrder::Concurrent => {
                    let local_value = (binding.serialize)(store).unwrap_or(Value::Null);
                    let local_side = ConflictSide { value: local_value.clone(), peer_id: peer_id.to_string(), wall_clock_millis: now_millis() };
                    let remote_side = ConflictSide { value: value.clone(), peer_id: remote_peer, wall_clock_millis };
                    let resolved = strategy.resolve(&local_side, &remote_side);

                    applying.store(true, Ordering::SeqCst);
                    let _ = (binding.apply)(store, resolved.clone());
                    applying.store(false, Ordering::SeqCst);
                    clock.lock().merge(&remote_clock);
                    let merged = clock.lock().clone();
                    sync.lock().ref_clocks.insert(ref_name.clone(), merged.clone());

                    let _ = conflict_tx.send(ConflictEvent {
                        ref_name,
                        local: local_value,
                        remote: value,
                        resolved,
                        local_clock,
                        remote_clock,
                    });
                    let _ = channel.send(SyncMessage::SyncAck { clock: merged }).await;
                }
            }
        }
        SyncMessage::SyncAck { clock: remote_clock } => {
            clock.lock().merge(&remote_clock);
            sync.lock().pending.clear();
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A running sync session; drop or call [`CollaborationSession::disconnect`]
/// to stop exchanging messages.
pub struct CollaborationSession {
    store: Store,
    session_id: u64,
    join: tokio::task::JoinHandle<()>,
    conflicts: Mutex<mpsc::UnboundedReceiver<ConflictEvent>>,
    clock: Arc<Mutex<VectorClock>>,
    sync: Arc<Mutex<SyncState>>,
    tracked: IndexMap<RefId, String>,
    _subs: Vec<Subscription>,
}

impl CollaborationSession {
    /// The next conflict resolution, if one occurs before the session
    /// disconnects.
    pub async fn next_conflict(&self) -> Option<ConflictEvent> {
        self.conflicts.lock().recv().await
    }

    /// This session's current merged vector clock.
    pub fn clock(&self) -> VectorClock {
        self.clock.lock().clone()
    }

    /// The clock `r`'s current value was last written or merged at, if
    /// `r` is tracked by this session (spec §6: `clockOf(ref)`).
    pub fn clock_of<T>(&self, r: Ref<T>) -> Option<VectorClock> {
        let name = self.tracked.get(&r.id())?;
        self.sync.lock().ref_clocks.get(name).cloned()
    }

    /// Whether `r` is tracked by this session and has no locally written
    /// value still awaiting the peer's acknowledgement (spec §6:
    /// `isSynced(ref)`).
    pub fn is_synced<T>(&self, r: Ref<T>) -> bool {
        match self.tracked.get(&r.id()) {
            Some(name) => !self.sync.lock().pending.contains(name),
            None => false,
        }
    }

    pub fn disconnect(self) {
        self.join.abort();
        // `Drop` deregisters this session from the store.
    }
}

impl Drop for CollaborationSession {
    fn drop(&mut self) {
        self.store.deregister_collab_session(self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

    struct ChannelPair {
        tx: UnboundedSender<SyncMessage>,
        rx: UnboundedReceiver<SyncMessage>,
    }

    #[async_trait]
    impl Duplex for ChannelPair {
        async fn send(&mut self, message: SyncMessage) -> CoreResult<()> {
            self.tx.send(message).map_err(|_| CoreError::Failed("closed".into()))
        }
        async fn recv(&mut self) -> CoreResult<SyncMessage> {
            self.rx.recv().await.ok_or(CoreError::Failed("closed".into()))
        }
    }

    fn pair() -> (ChannelPair, ChannelPair) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (ChannelPair { tx: a_tx, rx: a_rx }, ChannelPair { tx: b_tx, rx: b_rx })
    }

    #[tokio::test]
    async fn local_write_propagates_to_peer() {
        let store_a = Store::new();
        let counter_a = store_a.source(0i64);
        let store_b = Store::new();
        let counter_b = store_b.source(0i64);

        let (chan_a, chan_b) = pair();
        let _session_a = CollaborationBuilder::new(&store_a, "a").track("counter", counter_a.clone()).connect(chan_a);
        let _session_b = CollaborationBuilder::new(&store_b, "b").track("counter", counter_b.clone()).connect(chan_b);

        store_a.set(counter_a, 42).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(store_b.get(counter_b), 42);
    }

    #[tokio::test]
    async fn concurrent_writes_resolve_via_strategy_and_emit_conflict() {
        let store_a = Store::new();
        let counter_a = store_a.source(0i64);
        let store_b = Store::new();
        let counter_b = store_b.source(0i64);

        let (chan_a, chan_b) = pair();
        let session_a = CollaborationBuilder::new(&store_a, "a")
            .strategy(MergeStrategy::MaxValue)
            .track("counter", counter_a.clone())
            .connect(chan_a);
        let _session_b = CollaborationBuilder::new(&store_b, "b")
            .strategy(MergeStrategy::MaxValue)
            .track("counter", counter_b.clone())
            .connect(chan_b);

        // Both peers write before either has observed the other's delta,
        // so their vector clocks are concurrent.
        store_a.set(counter_a.clone(), 5).unwrap();
        store_b.set(counter_b, 9).unwrap();

        let conflict = tokio::time::timeout(std::time::Duration::from_millis(200), session_a.next_conflict())
            .await
            .unwrap();
        assert!(conflict.is_some());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(store_a.get(counter_a), 9);
    }

    #[tokio::test]
    async fn is_synced_and_clock_of_track_acknowledgement() {
        let store_a = Store::new();
        let counter_a = store_a.source(0i64);
        let store_b = Store::new();
        let counter_b = store_b.source(0i64);

        let (chan_a, chan_b) = pair();
        let session_a = CollaborationBuilder::new(&store_a, "a").track("counter", counter_a.clone()).connect(chan_a);
        let _session_b = CollaborationBuilder::new(&store_b, "b").track("counter", counter_b).connect(chan_b);

        assert_eq!(store_a.collaborative_sessions(), vec!["a".to_string()]);

        store_a.set(counter_a.clone(), 7).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(session_a.is_synced(counter_a.clone()));
        assert!(session_a.clock_of(counter_a).is_some());

        session_a.disconnect();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(store_a.collaborative_sessions().is_empty());
    }
}
