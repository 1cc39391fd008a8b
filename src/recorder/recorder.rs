//! Captures writes to a set of tracked reactons as a timestamped
//! [`RecordedSession`] (spec §4.11).
//!
//! Grounded on the teacher's `Subscriber` fan-out for detecting writes
//! (reused, as in [`crate::crdt`], to turn store notifications into a
//! linear event log) and its `HistoryRing` capacity eviction for the
//! optional `max_events` ring.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use crate::recorder::event::{SessionMark, StateEvent};
use crate::recorder::session::RecordedSession;
use crate::store::{Store, Subscription};
use crate::value::Ref;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Status {
    Idle,
    Recording,
    Paused,
}

struct RecorderState {
    status: Status,
    start: Option<Instant>,
    paused_accum: Duration,
    paused_at: Option<Instant>,
    events: VecDeque<StateEvent>,
    marks: Vec<SessionMark>,
    /// Each tracked reacton's value as of the most recent `start()` call.
    initial_snapshot: HashMap<u64, Value>,
    /// Metadata staged by `annotate`, consumed by the next recorded event.
    pending_metadata: serde_json::Map<String, Value>,
}

/// Records writes to its tracked reactons while running.
pub struct Recorder {
    state: Arc<Mutex<RecorderState>>,
    max_events: Option<usize>,
    last_values: IndexMap<u64, Arc<Mutex<Option<Value>>>>,
    subs: Vec<Subscription>,
}

/// Builds a [`Recorder`] by registering which reactons to track.
pub struct RecorderBuilder {
    store: Store,
    max_events: Option<usize>,
    state: Arc<Mutex<RecorderState>>,
    last_values: IndexMap<u64, Arc<Mutex<Option<Value>>>>,
    subs: Vec<Subscription>,
}

impl RecorderBuilder {
    pub fn new(store: &Store) -> Self {
        RecorderBuilder {
            store: store.clone(),
            max_events: None,
            state: Arc::new(Mutex::new(RecorderState {
                status: Status::Idle,
                start: None,
                paused_accum: Duration::ZERO,
                paused_at: None,
                events: VecDeque::new(),
                marks: Vec::new(),
                initial_snapshot: HashMap::new(),
                pending_metadata: serde_json::Map::new(),
            })),
            last_values: IndexMap::new(),
            subs: Vec::new(),
        }
    }

    /// Bounds the number of buffered events; the oldest are evicted once
    /// the bound is exceeded.
    pub fn max_events(mut self, max: usize) -> Self {
        self.max_events = Some(max);
        self
    }

    pub fn track<T>(mut self, r: Ref<T>) -> Self
    where
        T: Serialize + Clone + Send + Sync + 'static,
    {
        let ref_id = r.id().sort_key();
        let ref_name = r.name().map(str::to_string);
        let last: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(serde_json::to_value(self.store.get(r.clone())).ok()));
        self.last_values.insert(ref_id, last.clone());

        let state = self.state.clone();
        let max_events = self.max_events;
        let sub = self.store.subscribe(r, move |value: T| {
            // Kept current regardless of recording status, so a later
            // `start()` can snapshot each tracked reacton's live value.
            let Ok(new) = serde_json::to_value(&value) else { return };
            let old = last.lock().replace(new.clone()).unwrap_or(Value::Null);

            let mut s = state.lock();
            if s.status != Status::Recording {
                return;
            }
            let start = s.start.expect("recording has a start instant while Recording");
            let elapsed = start.elapsed() - s.paused_accum;
            let metadata = if s.pending_metadata.is_empty() {
                None
            } else {
                Some(Value::Object(std::mem::take(&mut s.pending_metadata)))
            };
            let event = StateEvent {
                ref_id,
                ref_name: ref_name.clone(),
                old,
                new,
                elapsed,
                wall_clock_millis: now_millis(),
                metadata,
            };
            s.events.push_back(event);
            if let Some(max) = max_events {
                while s.events.len() > max {
                    s.events.pop_front();
                }
            }
        });
        self.subs.push(sub);
        self
    }

    pub fn build(self) -> Recorder {
        Recorder {
            state: self.state,
            max_events: self.max_events,
            last_values: self.last_values,
            subs: self.subs,
        }
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Recorder {
    pub fn start(&self) {
        let snapshot = self
            .last_values
            .iter()
            .filter_map(|(&id, v)| v.lock().clone().map(|value| (id, value)))
            .collect();

        let mut s = self.state.lock();
        s.status = Status::Recording;
        s.start = Some(Instant::now());
        s.paused_accum = Duration::ZERO;
        s.paused_at = None;
        s.events.clear();
        s.marks.clear();
        s.initial_snapshot = snapshot;
        s.pending_metadata.clear();
    }

    pub fn pause(&self) {
        let mut s = self.state.lock();
        if s.status == Status::Recording {
            s.status = Status::Paused;
            s.paused_at = Some(Instant::now());
        }
    }

    pub fn resume(&self) {
        let mut s = self.state.lock();
        if s.status == Status::Paused {
            if let Some(paused_at) = s.paused_at.take() {
                s.paused_accum += paused_at.elapsed();
            }
            s.status = Status::Recording;
        }
    }

    pub fn stop(&self) {
        self.state.lock().status = Status::Idle;
    }

    pub fn is_recording(&self) -> bool {
        self.state.lock().status == Status::Recording
    }

    fn elapsed_now(&self, s: &RecorderState) -> Duration {
        s.start.map(|start| start.elapsed() - s.paused_accum).unwrap_or(Duration::ZERO)
    }

    /// Adds a labeled bookmark at the current recording time.
    pub fn mark(&self, label: impl Into<String>, metadata: Option<Value>) {
        let mut s = self.state.lock();
        let elapsed = self.elapsed_now(&s);
        s.marks.push(SessionMark { label: label.into(), elapsed, metadata });
    }

    /// Stages `(key, value)` as metadata for the *next* recorded event.
    /// Staged keys accumulate across calls and are consumed (merged into
    /// the event's `metadata` object, then cleared) the next time a
    /// tracked reacton's write is recorded.
    pub fn annotate(&self, key: impl Into<String>, value: Value) {
        let mut s = self.state.lock();
        s.pending_metadata.insert(key.into(), value);
    }

    /// Exports everything captured so far as a [`RecordedSession`].
    pub fn export(&self) -> RecordedSession {
        let s = self.state.lock();
        RecordedSession::new(s.initial_snapshot.clone(), s.events.iter().cloned().collect(), s.marks.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    #[test]
    fn records_writes_with_old_and_new_values() {
        let store = Store::new();
        let r = store.source(1i64);
        let recorder = RecorderBuilder::new(&store).track(r.clone()).build();

        recorder.start();
        store.set(r.clone(), 2).unwrap();
        store.set(r, 3).unwrap();
        recorder.stop();

        let session = recorder.export();
        assert_eq!(session.events.len(), 2);
        assert_eq!(session.events[0].old, Value::from(1));
        assert_eq!(session.events[0].new, Value::from(2));
        assert_eq!(session.events[1].old, Value::from(2));
        assert_eq!(session.events[1].new, Value::from(3));
    }

    #[test]
    fn writes_outside_recording_are_ignored() {
        let store = Store::new();
        let r = store.source(1i64);
        let recorder = RecorderBuilder::new(&store).track(r.clone()).build();
        store.set(r, 2).unwrap();
        assert_eq!(recorder.export().events.len(), 0);
    }

    #[test]
    fn max_events_evicts_oldest() {
        let store = Store::new();
        let r = store.source(0i64);
        let recorder = RecorderBuilder::new(&store).max_events(2).track(r.clone()).build();
        recorder.start();
        store.set(r.clone(), 1).unwrap();
        store.set(r.clone(), 2).unwrap();
        store.set(r, 3).unwrap();
        let session = recorder.export();
        assert_eq!(session.events.len(), 2);
        assert_eq!(session.events[0].new, Value::from(2));
        assert_eq!(session.events[1].new, Value::from(3));
    }

    #[test]
    fn mark_and_annotate() {
        let store = Store::new();
        let r = store.source(0i64);
        let recorder = RecorderBuilder::new(&store).track(r.clone()).build();
        recorder.start();
        store.set(r, 1).unwrap();
        recorder.mark("milestone", None);
        let session = recorder.export();
        assert_eq!(session.events[0].metadata, None);
        assert_eq!(session.marks.len(), 1);
        assert_eq!(session.marks[0].label, "milestone");
    }

    #[test]
    fn annotate_attaches_to_the_next_recorded_event_only() {
        let store = Store::new();
        let r = store.source(0i64);
        let recorder = RecorderBuilder::new(&store).track(r.clone()).build();
        recorder.start();

        store.set(r.clone(), 1).unwrap();
        recorder.annotate("reason", Value::from("checkpoint"));
        recorder.annotate("actor", Value::from("user"));
        store.set(r.clone(), 2).unwrap();
        store.set(r, 3).unwrap();

        let session = recorder.export();
        assert_eq!(session.events.len(), 3);
        assert_eq!(session.events[0].metadata, None);
        assert_eq!(
            session.events[1].metadata,
            Some(serde_json::json!({"reason": "checkpoint", "actor": "user"}))
        );
        assert_eq!(session.events[2].metadata, None);
    }

    #[test]
    fn start_captures_an_initial_snapshot_of_tracked_values() {
        let store = Store::new();
        let r = store.source(5i64);
        let recorder = RecorderBuilder::new(&store).track(r.clone()).build();

        store.set(r.clone(), 9).unwrap();
        recorder.start();

        let session = recorder.export();
        assert_eq!(session.initial_snapshot.get(&r.id().sort_key()), Some(&Value::from(9)));
    }
}
