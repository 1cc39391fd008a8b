//! Conflict resolution strategies applied when two peers concurrently
//! change the same reacton (spec §4.10).
//!
//! Grounded on the teacher's value-equality short-circuit (`values_equal`
//! in the store, which already treats "same value" as a no-op) extended
//! here to the four-way "who wins" decision a genuine conflict requires.

use std::sync::Arc;

use serde_json::Value;

/// A peer update paired with the metadata a [`MergeStrategy`] needs to
/// resolve a conflict against another peer's concurrent update.
#[derive(Clone, Debug)]
pub struct ConflictSide {
    pub value: Value,
    pub peer_id: String,
    pub wall_clock_millis: u64,
}

type CustomMergeFn = Arc<dyn Fn(&ConflictSide, &ConflictSide) -> Value + Send + Sync>;

/// How to resolve two concurrent writes to the same reacton.
#[derive(Clone)]
pub enum MergeStrategy {
    /// The write with the later wall-clock timestamp wins; ties broken
    /// by comparing peer ids lexicographically (larger wins).
    LastWriterWins,
    /// The numerically larger value wins (non-numeric values fall back
    /// to `LastWriterWins`).
    MaxValue,
    /// Both sides are JSON arrays; the resolved value is their
    /// deduplicated union, local-then-remote order.
    UnionMerge,
    /// An application-supplied resolver.
    CustomMerge(CustomMergeFn),
}

impl MergeStrategy {
    pub fn resolve(&self, local: &ConflictSide, remote: &ConflictSide) -> Value {
        match self {
            MergeStrategy::LastWriterWins => last_writer_wins(local, remote),
            MergeStrategy::MaxValue => max_value(local, remote),
            MergeStrategy::UnionMerge => union_merge(local, remote),
            MergeStrategy::CustomMerge(f) => f(local, remote),
        }
    }
}

fn last_writer_wins(local: &ConflictSide, remote: &ConflictSide) -> Value {
    match local.wall_clock_millis.cmp(&remote.wall_clock_millis) {
        std::cmp::Ordering::Greater => local.value.clone(),
        std::cmp::Ordering::Less => remote.value.clone(),
        std::cmp::Ordering::Equal => {
            if local.peer_id >= remote.peer_id {
                local.value.clone()
            } else {
                remote.value.clone()
            }
        }
    }
}

fn max_value(local: &ConflictSide, remote: &ConflictSide) -> Value {
    match (local.value.as_f64(), remote.value.as_f64()) {
        (Some(l), Some(r)) => if l >= r { local.value.clone() } else { remote.value.clone() },
        _ => last_writer_wins(local, remote),
    }
}

fn union_merge(local: &ConflictSide, remote: &ConflictSide) -> Value {
    let (Some(l), Some(r)) = (local.value.as_array(), remote.value.as_array()) else {
        return last_writer_wins(local, remote);
    };
    let mut merged: Vec<Value> = Vec::with_capacity(l.len() + r.len());
    for item in l.iter().chain(r.iter()) {
        if !merged.contains(item) {
            merged.push(item.clone());
        }
    }
    Value::Array(merged)
}
