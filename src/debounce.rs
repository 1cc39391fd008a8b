//! Trailing-edge debounce and leading+trailing throttle (spec §4.12).
//!
//! Grounded on the teacher's `tokio::time`-based timeout handling in its
//! async query-execution path (a cancellable timer racing a unit of
//! work), adapted here to arm/cancel a single pending callback rather
//! than bound an await.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Trailing-edge debounce: each call to [`Debouncer::run`] cancels any
/// pending timer and reschedules after `duration`.
pub struct Debouncer {
    duration: Duration,
    handle: Arc<Mutex<Option<JoinHandle<()>>>>,
    disposed: Arc<Mutex<bool>>,
}

impl Debouncer {
    pub fn new(duration: Duration) -> Self {
        Debouncer {
            duration,
            handle: Arc::new(Mutex::new(None)),
            disposed: Arc::new(Mutex::new(false)),
        }
    }

    /// Cancels any pending timer and schedules `f` after `duration`.
    pub fn run(&self, f: impl FnOnce() + Send + 'static) {
        if *self.disposed.lock() {
            return;
        }
        self.cancel();
        let duration = self.duration;
        let handle_slot = self.handle.clone();
        let disposed = self.disposed.clone();
        let callback: Callback = Box::new(f);
        let join = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if !*disposed.lock() {
                callback();
            }
            handle_slot.lock().take();
        });
        *self.handle.lock() = Some(join);
    }

    /// Whether a timer is currently armed.
    pub fn is_pending(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Disarms any pending timer without running its callback.
    pub fn cancel(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    /// Disarms and permanently disables future [`Debouncer::run`] calls.
    pub fn dispose(&self) {
        *self.disposed.lock() = true;
        self.cancel();
    }
}

struct ThrottleState {
    window_open: bool,
    trailing: Option<Callback>,
}

/// Leading-edge-plus-trailing throttle: the first call in a window runs
/// immediately; later calls within the window replace a pending
/// trailing callback that fires at window end.
pub struct Throttler {
    duration: Duration,
    state: Arc<Mutex<ThrottleState>>,
}

impl Throttler {
    pub fn new(duration: Duration) -> Self {
        Throttler {
            duration,
            state: Arc::new(Mutex::new(ThrottleState {
                window_open: false,
                trailing: None,
            })),
        }
    }

    /// Runs `f` immediately if no window is open (opening one);
    /// otherwise replaces the pending trailing callback for this window.
    pub fn run(&self, f: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock();
        if !state.window_open {
            state.window_open = true;
            drop(state);
            f();
            let duration = self.duration;
            let state_slot = self.state.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let trailing = {
                    let mut s = state_slot.lock();
                    s.window_open = false;
                    s.trailing.take()
                };
                if let Some(cb) = trailing {
                    cb();
                }
            });
        } else {
            state.trailing = Some(Box::new(f));
        }
    }

    /// Disarms the pending trailing callback; does not reverse an
    /// already-completed leading call.
    pub fn cancel(&self) {
        self.state.lock().trailing = None;
    }
}
