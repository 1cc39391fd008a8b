//! Copy-on-write branches (spec §4.4): an overlay over a store that reads
//! through to the parent for anything it has not overridden, and only
//! ever affects the parent once merged.
//!
//! Grounded on the teacher's revision-scoped `ActiveQuery` snapshotting
//! (a read-through layer over the committed database) adapted from a
//! query-memo overlay to a value overlay, keyed by reacton id rather
//! than query key.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::error::{CoreError, CoreResult};
use crate::graph::RefId;
use crate::store::Store;
use crate::value::{AnyValue, Ref};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BranchStatus {
    Open,
    Merged,
    Discarded,
}

struct BranchInner {
    name: String,
    parent: Store,
    overrides: indexmap::IndexMap<RefId, AnyValue>,
    status: BranchStatus,
}

/// A copy-on-write overlay over a [`Store`] (spec §4.4).
#[derive(Clone)]
pub struct Branch(Arc<Mutex<BranchInner>>);

/// One entry of [`Branch::diff`]: the parent's value and this branch's
/// overridden value for the same reacton.
pub struct BranchDiffEntry {
    pub id: RefId,
    pub parent_value: AnyValue,
    pub branch_value: AnyValue,
}

impl Branch {
    pub(crate) fn new(parent: Store, name: impl Into<String>) -> Self {
        Branch(Arc::new(Mutex::new(BranchInner {
            name: name.into(),
            parent,
            overrides: indexmap::IndexMap::new(),
            status: BranchStatus::Open,
        })))
    }

    pub fn name(&self) -> String {
        self.0.lock().name.clone()
    }

    pub fn status(&self) -> BranchStatus {
        self.0.lock().status
    }

    fn ensure_open(&self) -> CoreResult<()> {
        let inner = self.0.lock();
        match inner.status {
            BranchStatus::Open => Ok(()),
            _ => Err(CoreError::BranchClosed(RefId::dangling())),
        }
    }

    /// Reads `r`: the branch's overridden value if present, otherwise
    /// falls through to the parent store.
    pub fn get<T: Clone + 'static>(&self, r: Ref<T>) -> CoreResult<T> {
        self.ensure_open()?;
        let inner = self.0.lock();
        if let Some(v) = inner.overrides.get(&r.id()) {
            return Ok(crate::value::downcast(v));
        }
        let parent = inner.parent.clone();
        drop(inner);
        Ok(parent.get(r))
    }

    /// Writes `r` into the branch's overlay only; the parent is
    /// unaffected until [`Branch::merge`].
    pub fn set<T: Send + Sync + 'static>(&self, r: Ref<T>, v: T) -> CoreResult<()> {
        self.ensure_open()?;
        self.0
            .lock()
            .overrides
            .insert(r.id(), crate::value::boxed(v));
        Ok(())
    }

    /// Enumerates every overridden reacton as `(parentValue, branchValue)`.
    pub fn diff(&self) -> CoreResult<Vec<BranchDiffEntry>> {
        self.ensure_open()?;
        let inner = self.0.lock();
        let parent = inner.parent.clone();
        let mut out = Vec::with_capacity(inner.overrides.len());
        for (&id, branch_value) in inner.overrides.iter() {
            if let Some(parent_value) = parent.peek_any(id) {
                out.push(BranchDiffEntry {
                    id,
                    parent_value,
                    branch_value: branch_value.clone(),
                });
            }
        }
        Ok(out)
    }

    /// Applies every overlay entry to the parent store as an ordinary
    /// `set`, in insertion order, under a single batch, then marks this
    /// branch `Merged`.
    pub fn merge(&self) -> CoreResult<()> {
        self.ensure_open()?;
        let (parent, overrides) = {
            let inner = self.0.lock();
            (inner.parent.clone(), inner.overrides.clone())
        };
        let mut first_err = None;
        parent.batch(|s| {
            for (id, value) in overrides {
                if let Err(e) = s.set_any_external(id, value) {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        });
        self.0.lock().status = BranchStatus::Merged;
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Marks the branch `Discarded`; further reads/writes fail with
    /// `BranchClosed`.
    pub fn discard(&self) {
        self.0.lock().status = BranchStatus::Discarded;
    }
}

impl RefId {
    /// A placeholder id used only to carry `BranchClosed` when the
    /// offending ref isn't known at the call site (branch-level, not
    /// ref-level, closure).
    pub(crate) fn dangling() -> RefId {
        RefId::from_raw(u64::MAX)
    }
}

impl Store {
    /// Creates a new open branch over this store.
    pub fn create_branch(&self, name: impl Into<String>) -> Branch {
        Branch::new(self.clone(), name)
    }
}
