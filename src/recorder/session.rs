//! A captured recording: the exchange format Recorder produces and
//! Player consumes (spec §4.11).
//!
//! Grounded on the teacher's versioned cache-export format (a schema
//! version tag checked on import, rejecting a mismatched version rather
//! than attempting a best-effort read) applied here to JSON and
//! gzip-compressed session exports.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::recorder::event::{SessionMark, StateEvent};

pub const SCHEMA_VERSION: u32 = 1;

/// A complete, exportable recording.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordedSession {
    pub schema_version: u32,
    /// Each tracked reacton's value at the moment recording started,
    /// keyed by `ref_id`, so a player can reproduce the starting state
    /// before replaying `events` (spec §4.11).
    #[serde(default)]
    pub initial_snapshot: HashMap<u64, Value>,
    pub events: Vec<StateEvent>,
    pub marks: Vec<SessionMark>,
}

impl RecordedSession {
    pub fn new(initial_snapshot: HashMap<u64, Value>, events: Vec<StateEvent>, marks: Vec<SessionMark>) -> Self {
        RecordedSession { schema_version: SCHEMA_VERSION, initial_snapshot, events, marks }
    }

    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string(self).map_err(|e| CoreError::InvalidMessage(e.to_string()))
    }

    pub fn from_json(raw: &str) -> CoreResult<Self> {
        let session: RecordedSession =
            serde_json::from_str(raw).map_err(|e| CoreError::InvalidMessage(e.to_string()))?;
        if session.schema_version != SCHEMA_VERSION {
            return Err(CoreError::UnsupportedVersion { found: session.schema_version, expected: SCHEMA_VERSION });
        }
        Ok(session)
    }

    pub fn to_compressed(&self) -> CoreResult<Vec<u8>> {
        let json = self.to_json()?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(json.as_bytes()).map_err(|e| CoreError::InvalidMessage(e.to_string()))?;
        encoder.finish().map_err(|e| CoreError::InvalidMessage(e.to_string()))
    }

    pub fn from_compressed(bytes: &[u8]) -> CoreResult<Self> {
        let mut decoder = GzDecoder::new(bytes);
        let mut raw = String::new();
        decoder.read_to_string(&mut raw).map_err(|e| CoreError::InvalidMessage(e.to_string()))?;
        RecordedSession::from_json(&raw)
    }

    /// The events between `from` and `to` (inclusive/exclusive), with
    /// `elapsed` re-stamped relative to `from`.
    pub fn slice(&self, from: Duration, to: Duration) -> RecordedSession {
        let events = self
            .events
            .iter()
            .filter(|e| e.elapsed >= from && e.elapsed < to)
            .map(|e| StateEvent { elapsed: e.elapsed - from, ..e.clone() })
            .collect();
        let marks = self
            .marks
            .iter()
            .filter(|m| m.elapsed >= from && m.elapsed < to)
            .map(|m| SessionMark { elapsed: m.elapsed - from, ..m.clone() })
            .collect();
        RecordedSession::new(self.initial_snapshot.clone(), events, marks)
    }

    /// Only the events for reactons named in `names`; marks are kept
    /// unfiltered since they are not tied to a single reacton.
    pub fn filter(&self, names: &[String]) -> RecordedSession {
        let events = self
            .events
            .iter()
            .filter(|e| e.ref_name.as_ref().map(|n| names.contains(n)).unwrap_or(false))
            .cloned()
            .collect();
        RecordedSession::new(self.initial_snapshot.clone(), events, self.marks.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn event(name: &str, elapsed_ms: u64) -> StateEvent {
        StateEvent {
            ref_id: 1,
            ref_name: Some(name.to_string()),
            old: Value::Null,
            new: Value::from(1),
            elapsed: Duration::from_millis(elapsed_ms),
            wall_clock_millis: 0,
            metadata: None,
        }
    }

    #[test]
    fn json_round_trip() {
        let session = RecordedSession::new(HashMap::new(), vec![event("a", 0)], vec![]);
        let json = session.to_json().unwrap();
        let back = RecordedSession::from_json(&json).unwrap();
        assert_eq!(back.events.len(), 1);
    }

    #[test]
    fn compressed_round_trip() {
        let session = RecordedSession::new(HashMap::new(), vec![event("a", 0), event("b", 10)], vec![]);
        let bytes = session.to_compressed().unwrap();
        let back = RecordedSession::from_compressed(&bytes).unwrap();
        assert_eq!(back.events.len(), 2);
    }

    #[test]
    fn mismatched_schema_version_is_rejected() {
        let raw = r#"{"schema_version":99,"events":[],"marks":[]}"#;
        assert!(matches!(
            RecordedSession::from_json(raw),
            Err(CoreError::UnsupportedVersion { found: 99, expected: 1 })
        ));
    }

    #[test]
    fn slice_rebases_elapsed_time() {
        let session = RecordedSession::new(HashMap::new(), vec![event("a", 5), event("a", 15), event("a", 25)], vec![]);
        let sliced = session.slice(Duration::from_millis(10), Duration::from_millis(20));
        assert_eq!(sliced.events.len(), 1);
        assert_eq!(sliced.events[0].elapsed, Duration::from_millis(5));
    }

    #[test]
    fn filter_keeps_only_named_reactons() {
        let session = RecordedSession::new(HashMap::new(), vec![event("a", 0), event("b", 0)], vec![]);
        let filtered = session.filter(&["a".to_string()]);
        assert_eq!(filtered.events.len(), 1);
        assert_eq!(filtered.events[0].ref_name.as_deref(), Some("a"));
    }

    #[test]
    fn initial_snapshot_round_trips_and_defaults_when_absent() {
        let mut snapshot = HashMap::new();
        snapshot.insert(1u64, Value::from(7));
        let session = RecordedSession::new(snapshot, vec![event("a", 0)], vec![]);
        let json = session.to_json().unwrap();
        let back = RecordedSession::from_json(&json).unwrap();
        assert_eq!(back.initial_snapshot.get(&1), Some(&Value::from(7)));

        let raw = r#"{"schema_version":1,"events":[],"marks":[]}"#;
        let legacy = RecordedSession::from_json(raw).unwrap();
        assert!(legacy.initial_snapshot.is_empty());
    }
}
