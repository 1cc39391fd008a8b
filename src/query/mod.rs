//! The async query cache (spec §4.9): stale-while-revalidate fetches
//! with retry/backoff, polling, and a parameterized query family built
//! atop [`crate::family::Family`].
//!
//! Grounded on the teacher's `Runtime::execute_query` (the single path
//! every memoized async computation goes through: check cache validity,
//! dedupe in-flight work, retry/backoff on failure) adapted from
//! memoized-forever query results to time-bounded cache entries with an
//! explicit `AsyncValue` state visible to callers while a fetch is
//! in flight. The in-flight dedup below mirrors the teacher's
//! single-flight "already in progress" query guard, generalized from one
//! waiter to a broadcast of the result to every concurrent caller.

mod retry;

pub use retry::RetryPolicy;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{CoreError, CoreResult};
use crate::family::Family;
use crate::graph::RefId;
use crate::store::Store;
use crate::value::Ref;

/// Supplies the current instant; injectable for deterministic tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Wall-clock [`Clock`] backed by [`std::time::Instant`].
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock { origin: std::time::Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        SystemClock::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// The state of an asynchronously fetched value (spec §4.9).
#[derive(Clone, PartialEq)]
pub enum AsyncValue<T> {
    Loading(Option<T>),
    Data(T),
    Error(Arc<CoreError>, Option<T>),
}

impl<T: fmt::Debug> fmt::Debug for AsyncValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncValue::Loading(prev) => f.debug_tuple("Loading").field(prev).finish(),
            AsyncValue::Data(v) => f.debug_tuple("Data").field(v).finish(),
            AsyncValue::Error(e, prev) => f.debug_tuple("Error").field(e).field(prev).finish(),
        }
    }
}

impl<T> AsyncValue<T> {
    pub fn data(&self) -> Option<&T> {
        match self {
            AsyncValue::Data(v) => Some(v),
            AsyncValue::Loading(prev) | AsyncValue::Error(_, prev) => prev.as_ref(),
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, AsyncValue::Loading(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, AsyncValue::Error(_, _))
    }
}

/// The outcome of one fetch attempt, type-erased so a single non-generic
/// in-flight table can broadcast it to every concurrent waiter regardless
/// of the query's `T`.
type SharedOutcome = Result<Arc<dyn Any + Send + Sync>, CoreError>;

struct QueryMeta {
    fetched_at: Option<Duration>,
    stale_time: Duration,
    cache_time: Duration,
    in_flight: u64,
    /// The current leader's token and the channel it will broadcast its
    /// result on; `None` when no fetch is in flight for this reacton.
    shared: Option<(u64, broadcast::Sender<SharedOutcome>)>,
    polling: Option<JoinHandle<()>>,
}

impl QueryMeta {
    fn fresh(options: &QueryOptions) -> Self {
        QueryMeta {
            fetched_at: None,
            stale_time: options.stale_time,
            cache_time: options.cache_time,
            in_flight: 0,
            shared: None,
            polling: None,
        }
    }
}

/// Configuration for a single query's cache lifetime and retry behavior.
#[derive(Clone)]
pub struct QueryOptions {
    pub stale_time: Duration,
    pub cache_time: Duration,
    pub retry: RetryPolicy,
    pub polling_interval: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        QueryOptions {
            stale_time: Duration::ZERO,
            cache_time: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
            polling_interval: None,
        }
    }
}

struct QueryCacheInner {
    store: Store,
    clock: Arc<dyn Clock>,
    meta: Mutex<FxHashMap<RefId, QueryMeta>>,
    next_token: AtomicU64,
}

/// Owns the query cache's in-flight bookkeeping and clock. A cheap,
/// `Clone`-able handle (like [`Store`]) so background revalidation and
/// polling tasks can hold their own owned copy.
#[derive(Clone)]
pub struct QueryCache(Arc<QueryCacheInner>);

impl QueryCache {
    pub fn new(store: Store) -> Self {
        QueryCache::with_clock(store, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(store: Store, clock: Arc<dyn Clock>) -> Self {
        QueryCache(Arc::new(QueryCacheInner {
            store,
            clock,
            meta: Mutex::new(FxHashMap::default()),
            next_token: AtomicU64::new(0),
        }))
    }

    fn store(&self) -> &Store {
        &self.0.store
    }

    fn meta(&self) -> &Mutex<FxHashMap<RefId, QueryMeta>> {
        &self.0.meta
    }

    fn now(&self) -> Duration {
        self.0.clock.now()
    }

    fn is_fresh(&self, id: RefId, now: Duration) -> bool {
        let meta = self.meta().lock();
        meta.get(&id)
            .and_then(|m| m.fetched_at.map(|f| (f, m.stale_time)))
            .map(|(fetched_at, stale_time)| now.saturating_sub(fetched_at) < stale_time)
            .unwrap_or(false)
    }

    /// Runs `fetch` against `r` if the cached value is absent or stale,
    /// retrying per `options.retry` on failure.
    ///
    /// Concurrent callers for the same `r` dedupe onto a single in-flight
    /// attempt and all resolve to that attempt's result (spec §4.9
    /// testable property #6). If `r` already holds data but it is stale,
    /// the cached value is returned immediately while the refetch runs in
    /// the background (testable property #7: stale-while-revalidate).
    pub async fn fetch_query<T, F, Fut>(
        &self,
        r: Ref<AsyncValue<T>>,
        options: &QueryOptions,
        fetch: F,
    ) -> CoreResult<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        let id = r.erase().id();
        let options = options.clone();
        let fetch = Arc::new(fetch);

        if self.is_fresh(id, self.now()) {
            if let AsyncValue::Data(v) = self.store().get(r.clone()) {
                return Ok(v);
            }
        }

        let previous = self.store().get(r.clone()).data().cloned();
        if previous.is_some() {
            self.spawn_leader_if_absent(id, r.clone(), options, fetch);
            return Ok(previous.expect("checked is_some above"));
        }

        self.run_or_join(id, r, &options, fetch).await
    }

    /// Triggers a fetch without blocking the caller, skipping entirely if
    /// `r` is already fresh. Used to warm the cache ahead of a read.
    pub fn prefetch_query<T, F, Fut>(&self, r: Ref<AsyncValue<T>>, options: &QueryOptions, fetch: F)
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        let id = r.erase().id();
        if self.is_fresh(id, self.now()) {
            return;
        }
        self.spawn_leader_if_absent(id, r, options.clone(), Arc::new(fetch));
    }

    fn spawn_leader_if_absent<T, F, Fut>(
        &self,
        id: RefId,
        r: Ref<AsyncValue<T>>,
        options: QueryOptions,
        fetch: Arc<F>,
    ) where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        let already_running = self.meta().lock().get(&id).map(|m| m.shared.is_some()).unwrap_or(false);
        if already_running {
            return;
        }
        let cache = self.clone();
        tokio::spawn(async move {
            let _ = cache.run_or_join(id, r, &options, fetch).await;
        });
    }

    /// Joins an in-flight fetch for `id` if one exists, otherwise becomes
    /// its leader: runs the retry loop, writes the result to the store,
    /// and broadcasts it to every follower that joined meanwhile.
    async fn run_or_join<T, F, Fut>(
        &self,
        id: RefId,
        r: Ref<AsyncValue<T>>,
        options: &QueryOptions,
        fetch: Arc<F>,
    ) -> CoreResult<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        let existing = self.meta().lock().get(&id).and_then(|m| m.shared.as_ref().map(|(_, tx)| tx.subscribe()));
        if let Some(mut rx) = existing {
            return Self::recv_shared::<T>(&mut rx).await;
        }

        let token = self.0.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, _rx) = broadcast::channel(1);
        {
            let mut meta = self.meta().lock();
            let entry = meta.entry(id).or_insert_with(|| QueryMeta::fresh(options));
            entry.stale_time = options.stale_time;
            entry.cache_time = options.cache_time;
            entry.in_flight = token;
            entry.shared = Some((token, tx.clone()));
        }

        let previous = self.store().get(r.clone()).data().cloned();
        let _ = self.store().set(r.clone(), AsyncValue::Loading(previous.clone()));

        let outcome = self.execute_retry_loop(id, token, r.clone(), options, fetch.clone(), previous).await;

        {
            let mut meta = self.meta().lock();
            if let Some(entry) = meta.get_mut(&id) {
                if matches!(&entry.shared, Some((t, _)) if *t == token) {
                    entry.shared = None;
                }
            }
        }

        let broadcastable: SharedOutcome = match &outcome {
            Ok(v) => Ok(Arc::new(v.clone()) as Arc<dyn Any + Send + Sync>),
            Err(e) => Err(e.clone()),
        };
        let _ = tx.send(broadcastable);

        if outcome.is_ok() && options.polling_interval.is_some() {
            self.ensure_polling(id, r, options.clone(), fetch);
        }

        outcome
    }

    async fn recv_shared<T: Clone + Send + Sync + 'static>(
        rx: &mut broadcast::Receiver<SharedOutcome>,
    ) -> CoreResult<T> {
        match rx.recv().await {
            Ok(Ok(any)) => any
                .downcast::<T>()
                .map(|v| (*v).clone())
                .map_err(|_| CoreError::Failed("query result type mismatch".into())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CoreError::QueryCancelled),
        }
    }

    async fn execute_retry_loop<T, F, Fut>(
        &self,
        id: RefId,
        token: u64,
        r: Ref<AsyncValue<T>>,
        options: &QueryOptions,
        fetch: Arc<F>,
        previous: Option<T>,
    ) -> CoreResult<T>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        let mut attempt: u32 = 0;
        loop {
            match fetch().await {
                Ok(value) => {
                    if !self.still_current(id, token) {
                        return Err(CoreError::QueryCancelled);
                    }
                    {
                        let mut meta = self.meta().lock();
                        if let Some(m) = meta.get_mut(&id) {
                            m.fetched_at = Some(self.now());
                        }
                    }
                    self.store().set(r, AsyncValue::Data(value.clone()))?;
                    return Ok(value);
                }
                Err(e) => {
                    attempt += 1;
                    if !options.retry.should_retry(attempt, &e) {
                        if !self.still_current(id, token) {
                            return Err(CoreError::QueryCancelled);
                        }
                        self.store().set(r, AsyncValue::Error(Arc::new(e.clone()), previous.clone()))?;
                        return Err(e);
                    }
                    let delay = options.retry.delay_for(attempt);
                    tokio::time::sleep(delay).await;
                    if !self.still_current(id, token) {
                        return Err(CoreError::QueryCancelled);
                    }
                }
            }
        }
    }

    fn still_current(&self, id: RefId, token: u64) -> bool {
        self.meta().lock().get(&id).map(|m| m.in_flight == token).unwrap_or(false)
    }

    fn ensure_polling<T, F, Fut>(&self, id: RefId, r: Ref<AsyncValue<T>>, options: QueryOptions, fetch: Arc<F>)
    where
        T: Clone + PartialEq + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CoreResult<T>> + Send + 'static,
    {
        let Some(interval) = options.polling_interval else { return };
        {
            let mut meta = self.meta().lock();
            if let Some(entry) = meta.get_mut(&id) {
                if let Some(handle) = &entry.polling {
                    if !handle.is_finished() {
                        return;
                    }
                }
            } else {
                return;
            }
        }
        let cache = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if cache.meta().lock().get(&id).is_none() {
                    return;
                }
                let _ = cache.run_or_join(id, r.clone(), &options, fetch.clone()).await;
            }
        });
        if let Some(entry) = self.meta().lock().get_mut(&id) {
            entry.polling = Some(handle);
        }
    }

    /// Forces the next `fetch_query` call for `r` to ignore `stale_time`,
    /// and cancels any fetch currently in flight for `r` (it resolves
    /// with [`CoreError::QueryCancelled`] rather than committing a stale
    /// result once it was already superseded by the invalidation).
    pub fn invalidate_query<T>(&self, r: Ref<AsyncValue<T>>) {
        let id = r.erase().id();
        let token = self.0.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(m) = self.meta().lock().get_mut(&id) {
            m.fetched_at = None;
            m.in_flight = token;
        }
    }

    /// Invalidates every tracked query, cancelling any fetch in flight.
    pub fn invalidate_all(&self) {
        let mut meta = self.meta().lock();
        for m in meta.values_mut() {
            m.fetched_at = None;
            m.in_flight = self.0.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        }
    }

    /// Writes `value` directly into the cache without fetching,
    /// refreshing its staleness clock.
    pub fn set_query_data<T>(&self, r: Ref<AsyncValue<T>>, value: T) -> CoreResult<()>
    where
        T: Clone + PartialEq + Send + Sync + 'static,
    {
        let id = r.erase().id();
        let mut meta = self.meta().lock();
        let entry = meta.entry(id).or_insert_with(|| QueryMeta::fresh(&QueryOptions::default()));
        entry.fetched_at = Some(self.now());
        drop(meta);
        self.store().set(r, AsyncValue::Data(value))
    }

    /// Drops `r`'s cache bookkeeping entirely and cancels its polling
    /// task, if any.
    pub fn remove_query<T>(&self, r: Ref<AsyncValue<T>>) {
        let id = r.erase().id();
        if let Some(entry) = self.meta().lock().remove(&id) {
            if let Some(handle) = entry.polling {
                handle.abort();
            }
        }
    }
}

/// A [`Family`] of query reactons, one per argument, backed by a shared
/// [`QueryCache`].
pub type QueryFamily<Arg, T> = Family<Arg, AsyncValue<T>>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FakeClock(Mutex<Duration>);

    impl Clock for FakeClock {
        fn now(&self) -> Duration {
            *self.0.lock()
        }
    }

    #[tokio::test]
    async fn fresh_fetch_populates_data() {
        let store = Store::new();
        let r = store.source(AsyncValue::Loading(None));
        let cache = QueryCache::new(store.clone());
        let options = QueryOptions::default();

        let result = cache.fetch_query(r.clone(), &options, || async { Ok::<_, CoreError>(7i64) }).await;
        assert_eq!(result.unwrap(), 7);
        assert!(matches!(store.get(r), AsyncValue::Data(7)));
    }

    #[tokio::test]
    async fn within_stale_time_skips_refetch() {
        let store = Store::new();
        let r = store.source(AsyncValue::Loading(None));
        let clock = Arc::new(FakeClock(Mutex::new(Duration::ZERO)));
        let cache = QueryCache::with_clock(store.clone(), clock.clone());
        let options = QueryOptions { stale_time: Duration::from_secs(10), ..QueryOptions::default() };

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        cache.fetch_query(r.clone(), &options, move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CoreError>(1i64)
            }
        }).await.unwrap();

        let calls3 = calls.clone();
        let result = cache.fetch_query(r, &options, move || {
            let calls = calls3.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CoreError>(2i64)
            }
        }).await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_exhausts_then_reports_error_with_previous_data() {
        let store = Store::new();
        let r = store.source(AsyncValue::Data(5i64));
        let cache = QueryCache::new(store.clone());
        let options = QueryOptions {
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                backoff_multiplier: 1.0,
                max_delay: None,
                should_retry: None,
            },
            ..QueryOptions::default()
        };

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let result = cache
            .fetch_query(r.clone(), &options, move || {
                let attempts = attempts2.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<i64, _>(CoreError::Failed("down".into()))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(matches!(store.get(r), AsyncValue::Error(_, Some(5))));
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let store = Store::new();
        let r = store.source(AsyncValue::Loading(None));
        let cache = QueryCache::new(store.clone());
        let options = QueryOptions { stale_time: Duration::from_secs(60), ..QueryOptions::default() };

        cache.fetch_query(r.clone(), &options, || async { Ok::<_, CoreError>(1i64) }).await.unwrap();
        cache.invalidate_query(r.clone());
        let result = cache.fetch_query(r, &options, || async { Ok::<_, CoreError>(2i64) }).await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn invalidate_cancels_an_in_flight_fetch() {
        let store = Store::new();
        let r = store.source(AsyncValue::Loading(None));
        let cache = QueryCache::new(store.clone());
        let options = QueryOptions::default();

        let gate = Arc::new(tokio::sync::Notify::new());
        let gate2 = gate.clone();
        let cache2 = cache.clone();
        let value = r.clone();
        let handle = tokio::spawn(async move {
            cache2
                .fetch_query(value, &options, move || {
                    let gate2 = gate2.clone();
                    async move {
                        gate2.notified().await;
                        Ok::<_, CoreError>(1i64)
                    }
                })
                .await
        });

        tokio::task::yield_now().await;
        cache.invalidate_query(r);
        gate.notify_one();

        let result = handle.await.unwrap();
        assert_eq!(result, Err(CoreError::QueryCancelled));
    }

    #[tokio::test]
    async fn concurrent_fetches_dedupe_to_a_single_call() {
        let store = Store::new();
        let r = store.source(AsyncValue::Loading(None));
        let cache = QueryCache::new(store.clone());
        let options = QueryOptions::default();

        let calls = Arc::new(AtomicU32::new(0));
        let ready = Arc::new(tokio::sync::Notify::new());

        let make_fetch = {
            let calls = calls.clone();
            let ready = ready.clone();
            move || {
                let calls = calls.clone();
                let ready = ready.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    ready.notified().await;
                    Ok::<_, CoreError>(42i64)
                }
            }
        };

        let cache_a = cache.clone();
        let fetch_a = make_fetch.clone();
        let value = r.clone();
        let a = tokio::spawn(async move { cache_a.fetch_query(value, &options, fetch_a).await });

        tokio::task::yield_now().await;

        let cache_b = cache.clone();
        let fetch_b = make_fetch.clone();
        let options_b = QueryOptions::default();
        let b = tokio::spawn(async move { cache_b.fetch_query(r, &options_b, fetch_b).await });

        tokio::task::yield_now().await;
        ready.notify_waiters();

        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.unwrap().unwrap(), 42);
        assert_eq!(rb.unwrap().unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_fetch_returns_cached_value_and_revalidates_in_background() {
        let store = Store::new();
        let r = store.source(AsyncValue::Data(1i64));
        let clock = Arc::new(FakeClock(Mutex::new(Duration::ZERO)));
        let cache = QueryCache::with_clock(store.clone(), clock.clone());
        let options = QueryOptions { stale_time: Duration::ZERO, ..QueryOptions::default() };
        cache.set_query_data(r.clone(), 1).unwrap();
        *clock.0.lock() = Duration::from_secs(1);

        let result = cache.fetch_query(r.clone(), &options, || async { Ok::<_, CoreError>(2i64) }).await;
        assert_eq!(result.unwrap(), 1, "stale value is returned synchronously");

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(store.get(r), AsyncValue::Data(2)), "background refetch lands once it resolves");
    }

    #[tokio::test]
    async fn prefetch_is_a_noop_when_already_fresh() {
        let store = Store::new();
        let r = store.source(AsyncValue::Loading(None));
        let cache = QueryCache::new(store.clone());
        let options = QueryOptions { stale_time: Duration::from_secs(60), ..QueryOptions::default() };

        cache.fetch_query(r.clone(), &options, || async { Ok::<_, CoreError>(1i64) }).await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        cache.prefetch_query(r, &options, move || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CoreError>(2i64)
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn remove_query_cancels_polling() {
        let store = Store::new();
        let r = store.source(AsyncValue::Loading(None));
        let cache = QueryCache::new(store.clone());
        let options = QueryOptions { polling_interval: Some(Duration::from_millis(5)), ..QueryOptions::default() };

        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        cache
            .fetch_query(r.clone(), &options, move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, CoreError>(1i64)
                }
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let seen_before = calls.load(Ordering::SeqCst);
        assert!(seen_before >= 2, "polling should have refetched at least once");

        cache.remove_query(r);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let seen_after = calls.load(Ordering::SeqCst);
        assert_eq!(seen_before, seen_after, "removing the query stops polling");
    }
}
