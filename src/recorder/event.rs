//! The recorded unit of session history (spec §4.11).
//!
//! Grounded on the teacher's `HistoryEntry` (before/after value pairs
//! captured per write) widened here with wall-clock and elapsed-time
//! stamps plus optional metadata, since a recording is replayed against
//! real time rather than just undone/redone.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One reacton write captured during a recording session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateEvent {
    pub ref_id: u64,
    pub ref_name: Option<String>,
    pub old: Value,
    pub new: Value,
    /// Time since the recording started.
    pub elapsed: Duration,
    pub wall_clock_millis: u64,
    pub metadata: Option<Value>,
}

/// A user-supplied bookmark within a recording, e.g. "checkout started".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionMark {
    pub label: String,
    pub elapsed: Duration,
    pub metadata: Option<Value>,
}
