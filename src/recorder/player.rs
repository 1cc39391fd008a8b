//! Replays a [`RecordedSession`] against a store at an adjustable speed
//! (spec §4.11).
//!
//! Grounded on the teacher's cancellable timer-driven task (the same
//! `tokio::spawn` + `sleep` shape as [`crate::debounce::Debouncer`]),
//! looped here once per recorded event instead of once per call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::error::{CoreError, CoreResult};
use crate::recorder::session::RecordedSession;
use crate::store::Store;
use crate::value::Ref;

type ApplyFn = Arc<dyn Fn(&Store, &Value) -> CoreResult<()> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PlayerStatus {
    Idle,
    Playing,
    Paused,
    Finished,
}

struct PlayerState {
    status: PlayerStatus,
    cursor: usize,
}

/// Replays a loaded [`RecordedSession`] against `store`, writing each
/// event's new value back to its matching tracked reacton.
pub struct Player {
    store: Store,
    bindings: IndexMap<u64, ApplyFn>,
    session: Mutex<Option<RecordedSession>>,
    state: Arc<Mutex<PlayerState>>,
    speed: Arc<Mutex<f64>>,
    generation: Arc<AtomicU64>,
    playing_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    progress_tx: watch::Sender<f64>,
    progress_rx: watch::Receiver<f64>,
    complete_tx: mpsc::UnboundedSender<()>,
    complete_rx: Mutex<mpsc::UnboundedReceiver<()>>,
}

/// Builds a [`Player`] by registering which reactons events replay onto.
pub struct PlayerBuilder {
    store: Store,
    bindings: IndexMap<u64, ApplyFn>,
}

impl PlayerBuilder {
    pub fn new(store: &Store) -> Self {
        PlayerBuilder { store: store.clone(), bindings: IndexMap::new() }
    }

    pub fn track<T>(mut self, r: Ref<T>) -> Self
    where
        T: DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
    {
        let sort_key = r.id().sort_key();
        let apply: ApplyFn = Arc::new(move |store: &Store, value: &Value| {
            let typed: T = serde_json::from_value(value.clone()).map_err(|e| CoreError::InvalidMessage(e.to_string()))?;
            store.set(r.clone(), typed)
        });
        self.bindings.insert(sort_key, apply);
        self
    }

    pub fn build(self) -> Player {
        let (progress_tx, progress_rx) = watch::channel(0.0);
        let (complete_tx, complete_rx) = mpsc::unbounded_channel();
        Player {
            store: self.store,
            bindings: self.bindings,
            session: Mutex::new(None),
            state: Arc::new(Mutex::new(PlayerState { status: PlayerStatus::Idle, cursor: 0 })),
            speed: Arc::new(Mutex::new(1.0)),
            generation: Arc::new(AtomicU64::new(0)),
            playing_handle: Mutex::new(None),
            progress_tx,
            progress_rx,
            complete_tx,
            complete_rx: Mutex::new(complete_rx),
        }
    }
}

impl Player {
    pub fn load(&self, session: RecordedSession) {
        self.stop();
        self.apply_snapshot(&session);
        *self.session.lock() = Some(session);
        *self.state.lock() = PlayerState { status: PlayerStatus::Idle, cursor: 0 };
        let _ = self.progress_tx.send(0.0);
    }

    /// Applies `session`'s initial snapshot to every bound reacton, so
    /// replay always starts from the state recording began at rather than
    /// whatever the store happens to hold already.
    fn apply_snapshot(&self, session: &RecordedSession) {
        for (ref_id, value) in &session.initial_snapshot {
            if let Some(apply) = self.bindings.get(ref_id) {
                let _ = apply(&self.store, value);
            }
        }
    }

    fn total_events(&self) -> usize {
        self.session.lock().as_ref().map(|s| s.events.len()).unwrap_or(0)
    }

    fn apply_event(&self, index: usize) {
        let session = self.session.lock();
        let Some(session) = session.as_ref() else { return };
        let Some(event) = session.events.get(index) else { return };
        if let Some(apply) = self.bindings.get(&event.ref_id) {
            let _ = apply(&self.store, &event.new);
        }
    }

    fn report_progress(&self) {
        let total = self.total_events();
        let cursor = self.state.lock().cursor;
        let progress = if total == 0 { 1.0 } else { cursor as f64 / total as f64 };
        let _ = self.progress_tx.send(progress);
    }

    /// Begins (or resumes) playback at `speed` (1.0 is real time; 2.0 is
    /// twice as fast).
    pub fn play(&self, speed: f64) {
        if self.session.lock().is_none() {
            return;
        }
        *self.speed.lock() = speed;
        {
            let mut s = self.state.lock();
            if s.status == PlayerStatus::Finished {
                return;
            }
            s.status = PlayerStatus::Playing;
        }

        if self.playing_handle.lock().is_some() {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let gen_flag = self.generation.clone();
        let state = self.state.clone();
        let speed = self.speed.clone();
        let progress_tx = self.progress_tx.clone();
        let complete_tx = self.complete_tx.clone();
        let bindings = self.bindings.clone();
        let store = self.store.clone();
        let session = self.session.lock().clone();

        let handle = tokio::spawn(async move {
            let Some(session) = session else { return };
            loop {
                if gen_flag.load(Ordering::SeqCst) != generation {
                    return;
                }
                let (cursor, status) = {
                    let s = state.lock();
                    (s.cursor, s.status)
                };
                if status != PlayerStatus::Playing {
                    return;
                }
                let Some(event) = session.events.get(cursor) else {
                    state.lock().status = PlayerStatus::Finished;
                    let _ = progress_tx.send(1.0);
                    let _ = complete_tx.send(());
                    return;
                };
                let next_elapsed = session.events.get(cursor + 1).map(|e| e.elapsed).unwrap_or(event.elapsed);
                let wait = next_elapsed.saturating_sub(event.elapsed);
                let current_speed = *speed.lock();
                if cursor > 0 && !wait.is_zero() && current_speed > 0.0 {
                    tokio::time::sleep(wait.div_f64(current_speed)).await;
                }
                if gen_flag.load(Ordering::SeqCst) != generation {
                    return;
                }
                if let Some(apply) = bindings.get(&event.ref_id) {
                    let _ = apply(&store, &event.new);
                }
                {
                    let mut s = state.lock();
                    s.cursor += 1;
                }
                let total = session.events.len();
                let cursor_now = state.lock().cursor;
                let progress = if total == 0 { 1.0 } else { cursor_now as f64 / total as f64 };
                let _ = progress_tx.send(progress);
            }
        });
        *self.playing_handle.lock() = Some(handle);
    }

    pub fn pause(&self) {
        let mut s = self.state.lock();
        if s.status == PlayerStatus::Playing {
            s.status = PlayerStatus::Paused;
        }
        drop(s);
        if let Some(handle) = self.playing_handle.lock().take() {
            handle.abort();
        }
    }

    pub fn resume(&self) {
        let speed = *self.speed.lock();
        self.play(speed);
    }

    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.playing_handle.lock().take() {
            handle.abort();
        }
        let mut s = self.state.lock();
        s.status = PlayerStatus::Idle;
        s.cursor = 0;
        drop(s);
        let _ = self.progress_tx.send(0.0);
    }

    /// Applies the next event without waiting for its scheduled time; a
    /// no-op at the end of the recording.
    pub fn step_forward(&self) {
        let cursor = {
            let mut s = self.state.lock();
            if s.cursor >= self.total_events() {
                return;
            }
            let c = s.cursor;
            s.cursor += 1;
            c
        };
        self.apply_event(cursor);
        self.report_progress();
    }

    /// Moves the cursor back one event and re-applies it; a no-op at the
    /// start of the recording.
    pub fn step_backward(&self) {
        let cursor = {
            let mut s = self.state.lock();
            if s.cursor == 0 {
                return;
            }
            s.cursor -= 1;
            s.cursor
        };
        self.apply_event(cursor);
        self.report_progress();
    }

    /// Jumps to `position` (clamped to `0.0..=1.0`) and applies every
    /// event up to that point.
    pub fn seek_to(&self, position: f64) {
        let total = self.total_events();
        let position = position.clamp(0.0, 1.0);
        let target = ((total as f64) * position).round() as usize;
        {
            let mut s = self.state.lock();
            s.cursor = 0;
        }
        if let Some(session) = self.session.lock().clone() {
            self.apply_snapshot(&session);
        }
        for i in 0..target.min(total) {
            self.apply_event(i);
        }
        self.state.lock().cursor = target.min(total);
        self.report_progress();
    }

    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress_rx.clone()
    }

    pub async fn wait_for_completion(&self) {
        let mut rx = self.complete_rx.lock();
        rx.recv().await;
    }
}
