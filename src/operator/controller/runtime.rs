/*
 * Copyright (C) 2025 The Staticpod Operator Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::operator::observability::metrics;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Per-item exponential delay: `base * 2^(failures - 1)`, capped at `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map(|delay| delay.min(self.max))
            .unwrap_or(self.max)
    }
}

/// Coalescing work queue with single-flight processing per item.
///
/// An item added while queued is dropped; an item added while a worker holds
/// it is re-queued once the worker calls [`done`](WorkQueue::done).
#[derive(Clone)]
pub struct WorkQueue<T> {
    inner: Arc<WorkQueueInner<T>>,
}

struct WorkQueueInner<T> {
    name: &'static str,
    state: Mutex<QueueState<T>>,
    notify: Notify,
    backoff: ExponentialBackoff,
}

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self::with_backoff(name, ExponentialBackoff::default())
    }

    pub fn with_backoff(name: &'static str, backoff: ExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(WorkQueueInner {
                name,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn add(&self, item: T) {
        let depth = {
            let mut state = self.lock();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }
            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                return;
            }
            state.queue.push_back(item);
            state.queue.len()
        };
        metrics::set_workqueue_depth(self.inner.name, depth);
        self.inner.notify.notify_one();
    }

    /// Adds `item` once `delay` has elapsed. Without a Tokio runtime the item
    /// is added immediately.
    pub fn add_after(&self, item: T, delay: Duration) {
        if delay.is_zero() {
            self.add(item);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queue = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    queue.add(item);
                });
            }
            Err(_) => self.add(item),
        }
    }

    /// Re-adds `item` after its per-item backoff and bumps its failure count.
    pub fn add_rate_limited(&self, item: T) {
        let failures = {
            let mut state = self.lock();
            let failures = state.failures.entry(item.clone()).or_insert(0);
            *failures += 1;
            *failures
        };
        metrics::record_workqueue_retry(self.inner.name);
        self.add_after(item, self.inner.backoff.delay(failures));
    }

    /// Clears the failure history of `item`.
    pub fn forget(&self, item: &T) {
        self.lock().failures.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().failures.get(item).copied().unwrap_or(0)
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.poll_item() {
                return result;
            }
            notified.await;
        }
    }

    /// Non-blocking variant of [`get`](WorkQueue::get).
    pub fn try_get(&self) -> Option<T> {
        self.poll_item().flatten()
    }

    fn poll_item(&self) -> Option<Option<T>> {
        let (item, depth) = {
            let mut state = self.lock();
            match state.queue.pop_front() {
                Some(item) => {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    (Some(item), state.queue.len())
                }
                None if state.shutting_down => return Some(None),
                None => return None,
            }
        };
        metrics::set_workqueue_depth(self.inner.name, depth);
        Some(item)
    }

    /// Marks `item` as processed, re-queueing it if it was added meanwhile.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutting_down {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}
