//! Task lifecycle: the counted set of in-flight background work that gates
//! a clean shutdown.
//!
//! Every task spawned through [`TaskLifecycle::track`] is registered before it
//! starts and removed by a drop guard living inside the spawned future, so the
//! removal runs exactly once whether the task returns, fails, panics or is
//! aborted. Once [`TaskLifecycle::request_stop`] has been called, the moment
//! the tracked set is empty the one-shot "work complete" signal fires.
//!
//! Requesting stop never cancels anything by itself. Loops observe
//! [`TaskLifecycle::stopped`] and wind down on their own.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct TaskLifecycle {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    stop_tx: watch::Sender<bool>,
    complete_tx: watch::Sender<bool>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    tracked: HashMap<u64, String>,
    stop_requested: bool,
    complete: bool,
}

impl TaskLifecycle {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (complete_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                stop_tx,
                complete_tx,
            }),
        }
    }

    /// Spawn `fut` onto the runtime and keep it in the tracked set for exactly
    /// as long as it runs.
    pub fn track<F>(&self, name: impl Into<String>, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = self.register(name.into());
        tokio::spawn(async move {
            let _guard = guard;
            fut.await
        })
    }

    fn register(&self, name: String) -> TrackGuard {
        let mut state = self.inner.lock();
        if state.complete {
            warn!(task = %name, "task tracked after work completed");
        }
        let id = state.next_id;
        state.next_id += 1;
        debug!(task = %name, id, "task tracked");
        state.tracked.insert(id, name);
        TrackGuard {
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Switch to stopping mode. Tracked tasks keep running.
    pub fn request_stop(&self) {
        let fire = {
            let mut state = self.inner.lock();
            if state.stop_requested {
                return;
            }
            state.stop_requested = true;
            info!(in_flight = state.tracked.len(), "stop requested");
            state.try_complete()
        };
        self.inner.stop_tx.send_replace(true);
        if fire {
            self.inner.fire_complete();
        }
    }

    pub fn is_stopping(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    /// Resolves once stop has been requested (immediately if it already was).
    pub async fn stopped(&self) {
        let mut rx = self.inner.stop_tx.subscribe();
        let _ = rx.wait_for(|stopping| *stopping).await;
    }

    pub fn is_complete(&self) -> bool {
        *self.inner.complete_tx.borrow()
    }

    /// Resolves once the tracked set has drained after a stop request.
    pub async fn work_complete(&self) {
        let mut rx = self.inner.complete_tx.subscribe();
        let _ = rx.wait_for(|complete| *complete).await;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Names of the tasks currently in flight, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().tracked.values().cloned().collect();
        names.sort();
        names
    }
}

impl Default for TaskLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn untrack(&self, id: u64) {
        let fire = {
            let mut state = self.lock();
            let Some(name) = state.tracked.remove(&id) else {
                return;
            };
            debug!(task = %name, id, remaining = state.tracked.len(), "task finished");
            state.try_complete()
        };
        if fire {
            self.fire_complete();
        }
    }

    fn fire_complete(&self) {
        info!("all tracked work complete");
        self.complete_tx.send_replace(true);
    }
}

impl State {
    /// Latch `complete` when the set is empty after a stop request. Returns
    /// `true` only on the transition.
    fn try_complete(&mut self) -> bool {
        if self.stop_requested && !self.complete && self.tracked.is_empty() {
            self.complete = true;
            return true;
        }
        false
    }
}

struct TrackGuard {
    id: u64,
    inner: Arc<Inner>,
}

impl Drop for TrackGuard {
    fn drop(&mut self) {
        self.inner.untrack(self.id);
    }
}
