//! Work queue keyed by resource name, and the worker pool draining it.
//!
//! - a key is queued at most once
//! - a key is handed to at most one worker at a time; triggers that arrive
//!   while it is processed mark it dirty and it is queued again once done
//! - `add_after` keeps only the earliest pending timer per key

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// What to do with a key after it was reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Reconcile again after the delay.
    Requeue(Duration),
    /// Wait for the next change to the resource.
    AwaitChange,
}

#[derive(Default)]
struct State {
    ready: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    timers: HashMap<String, Instant>,
    shutdown: bool,
}

#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The state stays consistent even if a holder panicked.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Queue `key` now.
    pub fn add(&self, key: &str) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        if state.processing.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        if state.queued.insert(key.to_string()) {
            state.ready.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue `key` once `delay` has passed. An earlier pending timer for the
    /// same key wins over a later one.
    pub fn add_after(self: &Arc<Self>, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let at = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            match state.timers.get(key) {
                Some(existing) if *existing <= at => return,
                _ => {
                    state.timers.insert(key.to_string(), at);
                }
            }
        }

        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            let fire = {
                let mut state = queue.lock();
                if state.timers.get(&key) == Some(&at) {
                    state.timers.remove(&key);
                    true
                } else {
                    false
                }
            };
            if fire {
                queue.add(&key);
            }
        });
    }

    /// Next key to process, waiting until one is ready. `None` after shutdown.
    pub async fn next(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` as processed; a key triggered meanwhile is queued again.
    pub fn done(&self, key: &str) {
        let requeue = {
            let mut state = self.lock();
            state.processing.remove(key);
            state.dirty.remove(key)
        };
        if requeue {
            self.add(key);
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().ready.len()
    }
}

/// Spawn `workers` tasks that reconcile keys from `queue` with `handler`.
pub fn run_workers<F, Fut>(queue: &Arc<WorkQueue>, workers: usize, handler: F) -> Vec<JoinHandle<()>>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Action> + Send + 'static,
{
    let handler = Arc::new(handler);
    (0..workers.max(1))
        .map(|worker| {
            let queue = Arc::clone(queue);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                while let Some(key) = queue.next().await {
                    debug!(worker, key = key.as_str(), "Processing");
                    let action = handler(key.clone()).await;
                    queue.done(&key);
                    if let Action::Requeue(delay) = action {
                        queue.add_after(&key, delay);
                    }
                }
                debug!(worker, "Worker stopped");
            })
        })
        .collect()
}
