//! Parameterized node factories with an identity cache keyed by argument
//! (spec §4.9's "Query family", generalized per spec §2's Family
//! component to any node kind).
//!
//! Grounded on the teacher's interned-query-key tables (`InternTables`
//! mapping a key value to a stable interned id, reused across calls with
//! an equal key) adapted from string/tuple interning to caching whole
//! reacton handles.

use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::CoreResult;
use crate::store::Store;
use crate::value::Ref;

type Factory<Arg, T> = Arc<dyn Fn(&Store, &Arg) -> CoreResult<Ref<T>> + Send + Sync>;

/// A factory that returns the same [`Ref`] for equal arguments, creating
/// it lazily on first use.
pub struct Family<Arg, T> {
    store: Store,
    factory: Factory<Arg, T>,
    cache: Arc<Mutex<indexmap::IndexMap<Arg, Ref<T>>>>,
}

impl<Arg, T> Clone for Family<Arg, T> {
    fn clone(&self) -> Self {
        Family {
            store: self.store.clone(),
            factory: self.factory.clone(),
            cache: self.cache.clone(),
        }
    }
}

impl<Arg, T> Family<Arg, T>
where
    Arg: Eq + Hash + Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new<F>(store: &Store, factory: F) -> Self
    where
        F: Fn(&Store, &Arg) -> CoreResult<Ref<T>> + Send + Sync + 'static,
    {
        Family {
            store: store.clone(),
            factory: Arc::new(factory),
            cache: Arc::new(Mutex::new(indexmap::IndexMap::new())),
        }
    }

    /// Returns the cached reacton for `arg`, creating it on first use.
    pub fn get(&self, arg: Arg) -> CoreResult<Ref<T>> {
        if let Some(r) = self.cache.lock().get(&arg) {
            return Ok(r.clone());
        }
        let r = (self.factory)(&self.store, &arg)?;
        self.cache.lock().insert(arg, r.clone());
        Ok(r)
    }

    /// Evicts `arg`'s cached reacton, if any, removing it from the store.
    pub fn remove(&self, arg: &Arg) -> Option<Ref<T>> {
        let r = self.cache.lock().shift_remove(arg)?;
        self.store.remove(r.clone());
        Some(r)
    }

    /// Evicts every cached reacton, removing them all from the store.
    pub fn clear(&self) {
        let entries: Vec<Ref<T>> = self.cache.lock().drain(..).map(|(_, r)| r).collect();
        for r in entries {
            self.store.remove(r);
        }
    }

    /// Every argument currently cached, in first-use order.
    pub fn cached_args(&self) -> Vec<Arg> {
        self.cache.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_args_share_one_reacton() {
        let store = Store::new();
        let family: Family<i64, i64> =
            Family::new(&store, |s, arg| Ok(s.source(*arg * 10)));

        let a1 = family.get(1).unwrap();
        let a2 = family.get(1).unwrap();
        let b = family.get(2).unwrap();

        assert_eq!(a1, a2);
        assert_ne!(a1.id(), b.id());
        assert_eq!(store.get(a1), 10);
        assert_eq!(family.cached_args(), vec![1, 2]);
    }

    #[test]
    fn remove_and_clear_evict_cache() {
        let store = Store::new();
        let family: Family<i64, i64> = Family::new(&store, |s, arg| Ok(s.source(*arg)));
        family.get(1).unwrap();
        family.get(2).unwrap();
        family.remove(&1);
        assert_eq!(family.cached_args(), vec![2]);
        family.clear();
        assert!(family.cached_args().is_empty());
    }
}
