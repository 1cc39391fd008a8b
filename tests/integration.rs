use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cascade_core::{CoreError, Store};

#[test]
fn diamond_dependency_recomputes_once_per_flush() {
    let store = Store::new();
    let a = store.source(1i64);
    let a_for_b = a.clone();
    let a_for_c = a.clone();
    let b = store.computed(&[a.erase()], move |scope| scope.get(a_for_b.clone()) * 10).unwrap();
    let c = store.computed(&[a.erase()], move |scope| scope.get(a_for_c.clone()) * 100).unwrap();
    let runs = Arc::new(AtomicU32::new(0));
    let runs2 = runs.clone();
    let b_for_d = b.clone();
    let c_for_d = c.clone();
    let d = store
        .computed(&[b.erase(), c.erase()], move |scope| {
            runs2.fetch_add(1, Ordering::SeqCst);
            scope.get(b_for_d.clone()) + scope.get(c_for_d.clone())
        })
        .unwrap();

    assert_eq!(store.get(d.clone()), 110);
    store.set(a, 3).unwrap();
    assert_eq!(store.get(d), 330);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn batched_writes_notify_subscribers_once_with_final_value() {
    let store = Store::new();
    let a = store.source(0i64);
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    let _sub = store.subscribe(a.clone(), move |v| seen2.lock().unwrap().push(v));

    store.batch(|s| {
        s.set(a.clone(), 1).unwrap();
        s.set(a.clone(), 2).unwrap();
        s.set(a, 3).unwrap();
    });

    assert_eq!(*seen.lock().unwrap(), vec![3]);
}

#[test]
fn branch_writes_stay_isolated_until_merged_into_the_parent() {
    let store = Store::new();
    let balance = store.source(100i64);

    let branch = store.create_branch("what-if");
    branch.set(balance.clone(), 40).unwrap();

    assert_eq!(branch.get(balance.clone()).unwrap(), 40);
    assert_eq!(store.get(balance.clone()), 100);

    branch.merge().unwrap();
    assert_eq!(store.get(balance), 40);
}

#[tokio::test]
async fn optimistic_update_rolls_back_on_failure() {
    let store = Store::new();
    let balance = store.source(100i64);

    let result = store
        .optimistic(balance.clone(), 50, || async { Err(CoreError::Failed("insufficient funds".into())) })
        .await;

    assert!(result.is_err());
    assert_eq!(store.get(balance), 100);
}

#[tokio::test]
async fn saga_take_latest_only_completes_the_newest_event() {
    use cascade_core::saga::{EventBus, Saga, TakeStrategy};

    #[derive(Clone)]
    enum Evt {
        Search(&'static str),
    }

    let store = Store::new();
    let result = store.source(String::new());
    let bus: EventBus<Evt> = EventBus::default();
    let saga = Saga::new(store.clone(), bus.clone(), "search");

    let result_for_handler = result.clone();
    let _handle = saga.take("search", TakeStrategy::Latest, |_| true, move |ctx, evt| {
        let result = result_for_handler.clone();
        async move {
            let Evt::Search(term) = evt;
            if ctx.delay(Duration::from_millis(30)).await.is_err() {
                return Ok(());
            }
            ctx.put(result, term.to_string())
        }
    });

    tokio::time::sleep(Duration::from_millis(5)).await;
    bus.dispatch(Evt::Search("a"));
    tokio::time::sleep(Duration::from_millis(5)).await;
    bus.dispatch(Evt::Search("ab"));
    tokio::time::sleep(Duration::from_millis(5)).await;
    bus.dispatch(Evt::Search("abc"));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(store.get(result), "abc");
}

#[tokio::test]
async fn query_cache_retries_then_succeeds() {
    use cascade_core::query::{AsyncValue, QueryCache, QueryOptions, RetryPolicy};

    let store = Store::new();
    let r = store.source(AsyncValue::Loading(None));
    let cache = QueryCache::new(store.clone());
    let options = QueryOptions {
        retry: RetryPolicy {
            max_attempts: 5,
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
        .fetch_query(r, &options, move || {
            let attempts = attempts2.clone();
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(CoreError::Failed("transient".into()))
                } else {
                    Ok(42i64)
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn vector_clocks_detect_concurrent_writes_and_merge_monotonically() {
    use cascade_core::crdt::{ClockOrder, VectorClock};

    let mut a = VectorClock::new();
    a.increment("a");
    let mut b = VectorClock::new();
    b.increment("b");

    assert_eq!(a.compare(&b), ClockOrder::Concurrent);

    let mut merged = a.clone();
    merged.merge(&b);
    assert_eq!(merged.get("a"), 1);
    assert_eq!(merged.get("b"), 1);
    assert_eq!(a.compare(&merged), ClockOrder::Before);
}

#[test]
fn recorded_session_replays_through_player() {
    use cascade_core::recorder::{PlayerBuilder, RecorderBuilder};

    let record_store = Store::new();
    let counter = record_store.source(0i64);
    let recorder = RecorderBuilder::new(&record_store).track(counter.clone()).build();

    recorder.start();
    record_store.set(counter.clone(), 1).unwrap();
    record_store.set(counter, 2).unwrap();
    recorder.stop();
    let session = recorder.export();

    let replay_store = Store::new();
    let replay_counter = replay_store.source(0i64);
    let player = PlayerBuilder::new(&replay_store).track(replay_counter.clone()).build();
    player.load(session);
    player.seek_to(1.0);

    assert_eq!(replay_store.get(replay_counter), 2);
}
