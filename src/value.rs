//! Dynamically-typed value storage with typed access at the edges.
//!
//! The graph itself is value-agnostic (spec §9); node values are carried
//! as `Arc<dyn Any + Send + Sync>` plus a per-node equality predicate
//! captured at registration, downcast once at the storage boundary. This
//! mirrors the boxed-signal storage used by the fine-grained-reactivity
//! corpus (e.g. `leptos_reactive`'s `stored_values: SlotMap<_, Rc<RefCell<dyn Any>>>`)
//! adapted to a `Send + Sync` handle since this crate's saga/query layers
//! move the store across `tokio` task boundaries.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A type-erased value held by a node.
pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;

/// A type-erased equality predicate, used to implement the "equality
/// short-circuit" invariant (spec §4.3) without making the graph generic
/// over every node's value type.
pub(crate) type EqualsFn = Arc<dyn Fn(&AnyValue, &AnyValue) -> bool + Send + Sync>;

/// Builds the default structural-equality predicate for `T`.
pub(crate) fn default_equals<T: PartialEq + 'static>() -> EqualsFn {
    Arc::new(|a: &AnyValue, b: &AnyValue| {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    })
}

pub(crate) fn boxed<T: Send + Sync + 'static>(value: T) -> AnyValue {
    Arc::new(value)
}

/// Downcasts a stored value, panicking with a descriptive message on a
/// type mismatch (indicates a `Ref<T>` was used against the wrong
/// store, which is a programmer error rather than a recoverable one).
pub(crate) fn downcast<T: Clone + 'static>(value: &AnyValue) -> T {
    value
        .downcast_ref::<T>()
        .unwrap_or_else(|| panic!("type mismatch reading reacton value as {}", std::any::type_name::<T>()))
        .clone()
}

/// A reference to the value of a query/source/computed node, tagged with
/// its result type `T` for ergonomic, type-checked call sites.
///
/// Equality and hashing are identity-only, delegating to the underlying
/// [`crate::graph::RefId`] (spec §3: "Equality is identity").
pub struct Ref<T> {
    pub(crate) id: crate::graph::RefId,
    pub(crate) name: Option<Arc<str>>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T> Ref<T> {
    pub(crate) fn new(id: crate::graph::RefId, name: Option<Arc<str>>) -> Self {
        Ref {
            id,
            name,
            _marker: std::marker::PhantomData,
        }
    }

    /// The process-unique identity of this reacton.
    pub fn id(&self) -> crate::graph::RefId {
        self.id
    }

    /// The debug name supplied at creation, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Erases the value type, useful for dependency lists that mix
    /// reacton kinds (e.g. a computed that reads sources of different
    /// types).
    pub fn erase(&self) -> AnyRef {
        AnyRef {
            id: self.id,
            name: self.name.clone(),
        }
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Ref {
            id: self.id,
            name: self.name.clone(),
            _marker: std::marker::PhantomData,
        }
    }
}
impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl<T> Eq for Ref<T> {}

impl<T> std::hash::Hash for Ref<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "Ref({:?}, {:?})", self.id, name),
            None => write!(f, "Ref({:?})", self.id),
        }
    }
}

/// A type-erased [`Ref`], used for dependency lists and the branch/history
/// APIs that operate uniformly across node kinds.
#[derive(Clone, Debug)]
pub struct AnyRef {
    pub(crate) id: crate::graph::RefId,
    pub(crate) name: Option<Arc<str>>,
}

impl AnyRef {
    pub fn id(&self) -> crate::graph::RefId {
        self.id
    }
}

impl PartialEq for AnyRef {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for AnyRef {}
impl std::hash::Hash for AnyRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl<T> From<Ref<T>> for AnyRef {
    fn from(r: Ref<T>) -> Self {
        r.erase()
    }
}
