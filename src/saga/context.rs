//! The context handed to a saga handler: cooperative operations that all
//! check the owning task's cancellation flag before taking effect (spec
//! §4.7's `put`/`select`/`call`/`delay`/`fork`/`race`/`all`).
//!
//! Grounded on the teacher's cancellable query future (a unit of async
//! work raced against a cancellation signal, with the underlying future
//! left to run to completion rather than forcibly dropped) for `call`
//! and `delay`; `race`/`all` are grounded on the teacher's concurrent
//! multi-query resolution in `Runtime::execute_batch`.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use futures::future::{try_join_all, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};

use crate::error::{CoreError, CoreResult};
use crate::saga::task::Task;
use crate::store::Store;
use crate::value::Ref;

/// Operations available inside a running saga handler.
#[derive(Clone)]
pub struct SagaContext {
    pub(crate) store: Store,
    pub(crate) task: Task,
}

impl SagaContext {
    pub fn new(store: Store, task: Task) -> Self {
        SagaContext { store, task }
    }

    fn check_cancelled(&self) -> CoreResult<()> {
        if self.task.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.is_cancelled()
    }

    /// Writes `value` to `r`, rejecting the write if this task has been
    /// cancelled.
    pub fn put<T>(&self, r: Ref<T>, value: T) -> CoreResult<()>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        self.check_cancelled()?;
        self.store.set(r, value)
    }

    /// Reads `r`'s current value, rejecting the read if this task has
    /// been cancelled.
    pub fn select<T>(&self, r: Ref<T>) -> CoreResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.check_cancelled()?;
        Ok(self.store.get(r))
    }

    /// Awaits `fut`, racing it against cancellation. On cancellation the
    /// future keeps running to completion in the background — only the
    /// saga stops awaiting it.
    pub async fn call<Fut, T>(&self, fut: Fut) -> CoreResult<T>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.check_cancelled()?;
        let handle = tokio::spawn(fut);
        tokio::select! {
            biased;
            _ = self.task.cancelled() => Err(CoreError::Cancelled),
            res = handle => res.map_err(|_| CoreError::Cancelled),
        }
    }

    /// Suspends for `duration`, racing cancellation.
    pub async fn delay(&self, duration: Duration) -> CoreResult<()> {
        self.check_cancelled()?;
        tokio::select! {
            biased;
            _ = self.task.cancelled() => Err(CoreError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Spawns `handler` as a child task running concurrently with the
    /// caller; cancelling the parent cancels the child.
    pub fn fork<F, Fut, T>(&self, name: &str, handler: F) -> ForkedTask<T>
    where
        F: FnOnce(SagaContext) -> Fut + Send + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let child_task = self.task.child(name);
        let ctx = SagaContext::new(self.store.clone(), child_task.clone());
        let task_handle = child_task.clone();
        let join = tokio::spawn(async move {
            let result = handler(ctx).await;
            child_task.complete();
            result
        });
        ForkedTask { task: task_handle, join }
    }

    /// Runs every named future concurrently and returns the first to
    /// complete, paired with its name. The remaining futures are dropped.
    pub async fn race<T>(
        &self,
        branches: HashMap<String, impl Future<Output = T> + Send + 'static>,
    ) -> CoreResult<(String, T)>
    where
        T: Send + 'static,
    {
        self.check_cancelled()?;
        let mut pending: FuturesUnordered<_> = branches
            .into_iter()
            .map(|(name, fut)| fut.map(move |v| (name, v)))
            .collect();

        tokio::select! {
            biased;
            _ = self.task.cancelled() => Err(CoreError::Cancelled),
            next = pending.next() => next.ok_or(CoreError::Cancelled),
        }
    }

    /// Resolves every future once all succeed, in input order; the first
    /// error short-circuits the rest (the others keep running, their
    /// results discarded).
    pub async fn all<T>(&self, futures: Vec<impl Future<Output = CoreResult<T>> + Send + 'static>) -> CoreResult<Vec<T>>
    where
        T: Send + 'static,
    {
        self.check_cancelled()?;
        let joined = futures.into_iter().map(tokio::spawn);
        let results = try_join_all(joined)
            .await
            .map_err(|_| CoreError::Cancelled)?;
        results.into_iter().collect()
    }
}

/// A handle to a task spawned with [`SagaContext::fork`].
pub struct ForkedTask<T> {
    task: Task,
    join: tokio::task::JoinHandle<CoreResult<T>>,
}

impl<T> ForkedTask<T> {
    pub fn cancel(&self) {
        self.task.cancel();
    }

    pub fn is_completed(&self) -> bool {
        self.task.is_completed()
    }

    pub async fn join(self) -> CoreResult<T> {
        self.join.await.map_err(|_| CoreError::Cancelled)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_and_select_roundtrip() {
        let store = Store::new();
        let r = store.source(1i64);
        let ctx = SagaContext::new(store.clone(), Task::root("t"));
        ctx.put(r.clone(), 9).unwrap();
        assert_eq!(ctx.select(r).unwrap(), 9);
    }

    #[tokio::test]
    async fn cancelled_task_rejects_operations() {
        let store = Store::new();
        let r = store.source(1i64);
        let task = Task::root("t");
        task.cancel();
        let ctx = SagaContext::new(store, task);
        assert!(matches!(ctx.put(r.clone(), 2), Err(CoreError::Cancelled)));
        assert!(matches!(ctx.select(r), Err(CoreError::Cancelled)));
        assert!(matches!(ctx.delay(Duration::from_millis(1)).await, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn call_keeps_running_after_cancellation_but_returns_cancelled() {
        let store = Store::new();
        let task = Task::root("t");
        let ctx = SagaContext::new(store, task.clone());

        let ran = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        let fut = async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            ran2.store(true, std::sync::atomic::Ordering::SeqCst);
        };

        let call = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.call(fut).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        task.cancel();
        let result = call.await.unwrap();
        assert!(matches!(result, Err(CoreError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn race_returns_first_branch_by_name() {
        let store = Store::new();
        let ctx = SagaContext::new(store, Task::root("t"));
        let mut branches: HashMap<String, _> = HashMap::new();
        branches.insert("slow".into(), async { tokio::time::sleep(Duration::from_millis(30)).await; 1 }.boxed());
        branches.insert("fast".into(), async { 2 }.boxed());
        let (name, value) = ctx.race(branches).await.unwrap();
        assert_eq!(name, "fast");
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn all_collects_in_order() {
        let store = Store::new();
        let ctx = SagaContext::new(store, Task::root("t"));
        let futures: Vec<_> = vec![
            async { Ok::<_, CoreError>(1) }.boxed(),
            async { Ok::<_, CoreError>(2) }.boxed(),
            async { Ok::<_, CoreError>(3) }.boxed(),
        ];
        let result = ctx.all(futures).await.unwrap();
        assert_eq!(result, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn all_short_circuits_on_first_error() {
        let store = Store::new();
        let ctx = SagaContext::new(store, Task::root("t"));
        let futures: Vec<_> = vec![
            async { Ok::<_, CoreError>(1) }.boxed(),
            async { Err::<i64, _>(CoreError::Failed("boom".into())) }.boxed(),
        ];
        assert!(ctx.all(futures).await.is_err());
    }
}
