//! Whole-store snapshots: capture every initialized reacton's value and
//! restore it later, or diff two snapshots (spec §4.4).
//!
//! Grounded on the teacher's revision-stamped memo tables (a full
//! `Ref → Value` capture keyed by a logical tick), adapted from
//! per-query memoization to a whole-store capture.

use rustc_hash::FxHashMap;

use crate::error::CoreResult;
use crate::graph::RefId;
use crate::store::Store;
use crate::tick::Tick;
use crate::value::AnyValue;

/// An immutable capture of every initialized reacton's value at a point
/// in time.
#[derive(Clone)]
pub struct Snapshot {
    values: FxHashMap<RefId, AnyValue>,
    pub tick: Tick,
}

/// The result of comparing two snapshots.
pub struct SnapshotDiff {
    pub added: Vec<RefId>,
    pub removed: Vec<RefId>,
    pub changed: Vec<(RefId, AnyValue, AnyValue)>,
}

impl Snapshot {
    /// The value captured for `id`, if it was initialized at capture time.
    pub fn get_any(&self, id: RefId) -> Option<&AnyValue> {
        self.values.get(&id)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Diffs two snapshots into added/removed/changed reacton sets.
pub fn diff(a: &Snapshot, b: &Snapshot) -> SnapshotDiff {
    let mut added = Vec::new();
    let mut changed = Vec::new();
    for (&id, bv) in &b.values {
        match a.values.get(&id) {
            None => added.push(id),
            Some(av) => {
                if !std::sync::Arc::ptr_eq(av, bv) {
                    changed.push((id, av.clone(), bv.clone()));
                }
            }
        }
    }
    let removed = a
        .values
        .keys()
        .filter(|id| !b.values.contains_key(id))
        .copied()
        .collect();
    SnapshotDiff { added, removed, changed }
}

impl Store {
    /// Captures every currently-initialized reacton's value.
    pub fn snapshot(&self) -> Snapshot {
        let values = self.all_values().into_iter().collect();
        Snapshot {
            values,
            tick: self.lock().tick.load(),
        }
    }

    /// Reapplies every captured `(ref, value)` via `set`, in one batch
    /// (subscribers observe one wave).
    pub fn restore(&self, snapshot: &Snapshot) -> CoreResult<()> {
        let mut first_err = None;
        self.batch(|s| {
            for (&id, value) in snapshot.values.iter() {
                if let Err(e) = s.set_any_external(id, value.clone()) {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        });
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
