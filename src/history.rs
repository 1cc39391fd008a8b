//! Per-reacton undo/redo history (spec §4.4: "enableHistory / undo / redo
//! / jumpTo").
//!
//! Grounded on the teacher's revision-counter bookkeeping in `runtime.rs`
//! (a monotonically increasing counter stamped on each write), reused
//! here as the `Tick` each entry is stamped with, and on the ring-buffer
//! eviction shape used by `forest-rs-execution`'s `dirty.rs` channel
//! buffering (retrieved reference example) for the bounded-capacity
//! `VecDeque`.

use std::collections::VecDeque;

use crate::error::CoreResult;
use crate::store::Store;
use crate::tick::Tick;
use crate::value::{AnyRef, AnyValue};

/// One recorded write.
#[derive(Clone)]
pub(crate) struct HistoryEntry {
    pub(crate) before: AnyValue,
    pub(crate) after: AnyValue,
    pub(crate) tick: Tick,
}

/// A bounded undo/redo log for a single reacton.
///
/// Writing past `cursor` truncates any entries beyond it — the documented
/// "new write after undo discards the redo tail" rule.
pub(crate) struct HistoryRing {
    capacity: usize,
    entries: VecDeque<HistoryEntry>,
    /// Index into `entries` one past the last applied entry; entries at
    /// or beyond this index are the redo tail.
    cursor: usize,
}

impl HistoryRing {
    pub(crate) fn new(capacity: usize) -> Self {
        HistoryRing {
            capacity: capacity.max(1),
            entries: VecDeque::new(),
            cursor: 0,
        }
    }

    pub(crate) fn push(&mut self, entry: HistoryEntry) {
        self.entries.truncate(self.cursor);
        self.entries.push_back(entry);
        if self.entries.len() > self.capacity {
            self.entries.pop_front();
        } else {
            self.cursor += 1;
            return;
        }
        self.cursor = self.entries.len();
    }

    /// Returns the value to restore for an undo, and advances the
    /// internal cursor. `None` if there is nothing to undo.
    pub(crate) fn undo(&mut self) -> Option<AnyValue> {
        if self.cursor == 0 {
            return None;
        }
        self.cursor -= 1;
        self.entries.get(self.cursor).map(|e| e.before.clone())
    }

    /// Returns the value to restore for a redo, and advances the cursor.
    /// `None` if there is nothing to redo.
    pub(crate) fn redo(&mut self) -> Option<AnyValue> {
        let entry = self.entries.get(self.cursor)?;
        let value = entry.after.clone();
        self.cursor += 1;
        Some(value)
    }

    /// Jumps directly to the state after entry `index` (0-based into the
    /// full entry log, pre-truncation), returning the value at that
    /// point if `index` is in range.
    pub(crate) fn jump_to(&mut self, index: usize) -> Option<AnyValue> {
        if index >= self.entries.len() {
            return None;
        }
        self.cursor = index + 1;
        self.entries.get(index).map(|e| e.after.clone())
    }

    pub(crate) fn can_undo(&self) -> bool {
        self.cursor > 0
    }

    pub(crate) fn can_redo(&self) -> bool {
        self.cursor < self.entries.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Store {
    /// Starts recording undo/redo history for `r`, using the store's
    /// default capacity.
    pub fn enable_history(&self, r: AnyRef) {
        let capacity = self.lock().config.default_history_capacity;
        self.enable_history_with_capacity(r, capacity);
    }

    /// Like [`Store::enable_history`], with an explicit ring capacity.
    pub fn enable_history_with_capacity(&self, r: AnyRef, capacity: usize) {
        self.lock().history.insert(r.id(), HistoryRing::new(capacity));
    }

    /// Stops recording history for `r` and discards any recorded entries.
    pub fn disable_history(&self, r: AnyRef) {
        self.lock().history.remove(&r.id());
    }

    pub fn can_undo(&self, r: AnyRef) -> bool {
        self.lock().history.get(&r.id()).map(|h| h.can_undo()).unwrap_or(false)
    }

    pub fn can_redo(&self, r: AnyRef) -> bool {
        self.lock().history.get(&r.id()).map(|h| h.can_redo()).unwrap_or(false)
    }

    /// Restores `r`'s value to what it was before the last recorded
    /// write. A no-op if there is nothing to undo.
    pub fn undo(&self, r: AnyRef) -> CoreResult<()> {
        let value = {
            let mut inner = self.lock();
            inner.history.get_mut(&r.id()).and_then(|h| h.undo())
        };
        match value {
            Some(v) => self.set_any_suppressed(r.id(), v),
            None => Ok(()),
        }
    }

    /// Re-applies the write most recently undone. A no-op if there is
    /// nothing to redo.
    pub fn redo(&self, r: AnyRef) -> CoreResult<()> {
        let value = {
            let mut inner = self.lock();
            inner.history.get_mut(&r.id()).and_then(|h| h.redo())
        };
        match value {
            Some(v) => self.set_any_suppressed(r.id(), v),
            None => Ok(()),
        }
    }

    /// Jumps directly to the state recorded at `index` in `r`'s history.
    pub fn jump_to(&self, r: AnyRef, index: usize) -> CoreResult<()> {
        let value = {
            let mut inner = self.lock();
            inner.history.get_mut(&r.id()).and_then(|h| h.jump_to(index))
        };
        match value {
            Some(v) => self.set_any_suppressed(r.id(), v),
            None => Ok(()),
        }
    }
}
