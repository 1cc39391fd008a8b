//! Node-kind-specific behavior (spec §3's `Node`, §4.3's per-kind ops).
//!
//! The graph (see [`crate::graph`]) is value-agnostic; this module holds
//! the closures that give each node kind its semantics — a source has
//! none (its value only ever changes via `set`), a computed/selector has
//! a `compute` closure, a lens additionally has a write-back closure, an
//! effect has a side-effecting closure with no return value.

use crate::value::AnyValue;
use std::sync::Arc;

pub(crate) type ComputeFn = Arc<dyn Fn(&crate::store::Scope<'_>) -> AnyValue + Send + Sync>;
pub(crate) type LensWriteFn = Arc<dyn Fn(&crate::store::Scope<'_>, AnyValue) + Send + Sync>;
pub(crate) type EffectFn = Arc<dyn Fn(&crate::store::Scope<'_>) + Send + Sync>;

/// The behavior attached to a node, keyed by reacton id in the store.
pub(crate) enum Behavior {
    /// No recomputation behavior; value only changes via `set`/`update`.
    Source,
    /// Recomputed by calling `compute` whenever dirty or check-and-stale.
    Computed { compute: ComputeFn },
    /// Like `Computed`, but also supports `set` by delegating to `write`.
    Lens { compute: ComputeFn, write: LensWriteFn },
    /// No stored value; `run` fires once per flush that touches it.
    Effect { run: EffectFn },
}
