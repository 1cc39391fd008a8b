//! Optimistic mutation with rollback (spec §4.6): apply a provisional
//! value immediately, then reconcile once the async mutation settles.
//!
//! Grounded on the teacher's cancellation-aware query execution (set a
//! provisional state, run to completion or fail, leave the database in
//! a consistent state either way), adapted to the value-overwrite
//! semantics this spec requires rather than memoized recomputation.

use std::future::Future;

use crate::error::CoreResult;
use crate::store::Store;
use crate::value::Ref;

impl Store {
    /// Applies `optimistic_value` to `r` immediately, runs `mutation`,
    /// and on success commits its result; on failure rolls `r` back to
    /// its value at entry and returns the mutation's error.
    ///
    /// The full sequence is observable by subscribers as: the optimistic
    /// value, then either the final value or the rollback value.
    pub async fn optimistic<T, F, Fut>(&self, r: Ref<T>, optimistic_value: T, mutation: F) -> CoreResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        self.optimistic_with_rollback(r, optimistic_value, mutation, |_| {})
            .await
    }

    /// Like [`Store::optimistic`], invoking `on_rollback` with the
    /// mutation's error before it is returned to the caller.
    pub async fn optimistic_with_rollback<T, F, Fut, R>(
        &self,
        r: Ref<T>,
        optimistic_value: T,
        mutation: F,
        on_rollback: R,
    ) -> CoreResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CoreResult<T>>,
        R: FnOnce(&crate::error::CoreError),
    {
        let previous = self.get(r.clone());
        self.set(r.clone(), optimistic_value)?;

        match mutation().await {
            Ok(final_value) => {
                self.set(r, final_value.clone())?;
                Ok(final_value)
            }
            Err(e) => {
                self.set(r, previous)?;
                on_rollback(&e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    #[tokio::test]
    async fn rollback_restores_prior_value_and_invokes_hook() {
        let store = Store::new();
        let r = store.source(5i64);

        let observed = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let _sub = {
            let observed = observed.clone();
            store.subscribe(r.clone(), move |v: i64| observed.lock().push(v))
        };

        let captured = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let captured2 = captured.clone();
        let result = store
            .optimistic_with_rollback(
                r.clone(),
                42,
                || async { Err(CoreError::Failed("E".into())) },
                move |e| *captured2.lock() = Some(e.to_string()),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(store.get(r), 5);
        assert_eq!(*observed.lock(), vec![42, 5]);
        assert_eq!(captured.lock().as_deref(), Some("operation failed: E"));
    }

    #[tokio::test]
    async fn success_commits_final_value() {
        let store = Store::new();
        let r = store.source(5i64);
        let result = store.optimistic(r.clone(), 42, || async { Ok(99) }).await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(store.get(r), 99);
    }
}
