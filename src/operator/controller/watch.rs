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

use crate::operator::controller::informer::ResourceCache;
use crate::operator::k8s::store::{ClusterStore, StoreError, WatchEventType, WatchScope};
use crate::operator::k8s::ObjectKey;
use crate::operator::logger::{log_debug, log_info, log_warn};
use crate::operator::scheduler::{JobResult, ScheduleSpec, ScheduledTaskHandle, Scheduler};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const BACKOFF_INITIAL_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 10_000;
const COMPONENT: &str = "change-feed";

/// Key-only change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub event_type: WatchEventType,
    pub key: ObjectKey,
}

pub type ChangeHandler = Arc<dyn Fn(&ChangeNotice) + Send + Sync>;

/// Watches (kind, namespace) scopes, keeps the [`ResourceCache`] current,
/// and fans key notifications out to handlers.
///
/// Delivery is at-least-once and may coalesce: after a disconnect the feed
/// resumes from the last seen resource version, and when that version has
/// left the store's history it re-lists, emitting synthetic notifications for
/// every object present and every object that vanished.
#[derive(Clone)]
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    store: ClusterStore,
    cache: ResourceCache,
    handlers: Mutex<BTreeMap<WatchScope, Vec<ChangeHandler>>>,
    tasks: Mutex<Vec<ScheduledTaskHandle>>,
    restarts: AtomicU64,
    relists: AtomicU64,
}

impl ChangeFeed {
    pub fn new(store: ClusterStore, cache: ResourceCache) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                store,
                cache,
                handlers: Mutex::new(BTreeMap::new()),
                tasks: Mutex::new(Vec::new()),
                restarts: AtomicU64::new(0),
                relists: AtomicU64::new(0),
            }),
        }
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.inner.cache
    }

    /// Registers `handler` for changes in `scope`. Handlers added after
    /// [`start`](ChangeFeed::start) only see scopes already being watched.
    pub fn subscribe(&self, scope: WatchScope, handler: ChangeHandler) {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(scope)
            .or_default()
            .push(handler);
    }

    pub fn scopes(&self) -> Vec<WatchScope> {
        self.inner
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Performs the initial list of every subscribed scope, notifies handlers
    /// of all existing objects, then starts one watch loop per scope.
    pub fn start(&self, token: &CancellationToken) {
        self.inner.cache.start();
        let scheduler = Scheduler::global();
        let mut tasks = Vec::new();
        for scope in self.scopes() {
            let version = self.inner.relist(&scope);
            let inner = Arc::clone(&self.inner);
            let handle = scheduler.schedule_child(
                token,
                ScheduleSpec::Immediate {
                    label: "change-feed.watch-loop",
                },
                move |ctx| {
                    let inner = Arc::clone(&inner);
                    let scope = scope.clone();
                    Box::pin(async move {
                        run_watch_loop(inner, scope, version, ctx.cancellation_token()).await;
                        JobResult::Stop
                    })
                },
            );
            tasks.push(handle);
        }
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(tasks);
        log_info(COMPONENT, "Change feed started", &[]);
    }

    /// Cancels every watch loop and waits for them to exit.
    pub async fn stop(&self) {
        let tasks: Vec<ScheduledTaskHandle> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in &tasks {
            task.cancel();
        }
        for task in &tasks {
            let _ = task.join().await;
        }
        self.inner.cache.stop();
    }

    /// Number of times a watch stream was re-established after ending.
    pub fn restart_count(&self) -> u64 {
        self.inner.restarts.load(Ordering::Relaxed)
    }

    /// Number of full re-lists, including the initial one per scope.
    pub fn relist_count(&self) -> u64 {
        self.inner.relists.load(Ordering::Relaxed)
    }
}

impl FeedInner {
    fn dispatch(&self, scope: &WatchScope, notice: &ChangeNotice) {
        let handlers: Vec<ChangeHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(notice);
        }
    }

    /// Lists `scope`, replaces the cached slice, and notifies handlers of
    /// every current object and every vanished one. Returns the list version.
    fn relist(&self, scope: &WatchScope) -> u64 {
        let (items, version) = self.store.list_scope(scope);
        let current: Vec<ObjectKey> = items.iter().map(|(key, _)| key.clone()).collect();
        let previous = self.cache.replace(scope, items);
        self.relists.fetch_add(1, Ordering::Relaxed);

        for key in previous.into_iter().filter(|key| !current.contains(key)) {
            self.dispatch(
                scope,
                &ChangeNotice {
                    event_type: WatchEventType::Deleted,
                    key,
                },
            );
        }
        for key in current {
            self.dispatch(
                scope,
                &ChangeNotice {
                    event_type: WatchEventType::Added,
                    key,
                },
            );
        }
        version
    }
}

async fn run_watch_loop(
    inner: Arc<FeedInner>,
    scope: WatchScope,
    mut last_version: u64,
    cancellation: CancellationToken,
) {
    let mut backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
    let scope_label = scope.to_string();

    loop {
        match inner.store.watch(scope.clone(), last_version) {
            Ok(mut stream) => loop {
                tokio::select! {
                    _ = cancellation.cancelled() => return,
                    next = stream.next() => match next {
                        Ok(Some(event)) => {
                            backoff = Duration::from_millis(BACKOFF_INITIAL_MS);
                            last_version = event.resource_version;
                            inner.cache.apply(&event);
                            inner.dispatch(&scope, &ChangeNotice {
                                event_type: event.event_type,
                                key: event.key,
                            });
                        }
                        Ok(None) => break,
                        Err(StoreError::Expired { .. }) => {
                            log_info(COMPONENT, "Watch history expired; re-listing", &[("scope", scope_label.as_str())]);
                            last_version = inner.relist(&scope);
                            break;
                        }
                        Err(err) => {
                            let error = err.to_string();
                            log_warn(COMPONENT, "Watch stream failed", &[("scope", scope_label.as_str()), ("error", error.as_str())]);
                            break;
                        }
                    }
                }
            },
            Err(StoreError::Expired { .. }) => {
                log_info(
                    COMPONENT,
                    "Resume version expired; re-listing",
                    &[("scope", scope_label.as_str())],
                );
                last_version = inner.relist(&scope);
                continue;
            }
            Err(err) => {
                let error = err.to_string();
                log_warn(
                    COMPONENT,
                    "Failed to open watch",
                    &[("scope", scope_label.as_str()), ("error", error.as_str())],
                );
            }
        }

        inner.restarts.fetch_add(1, Ordering::Relaxed);
        let resume = last_version.to_string();
        log_debug(
            COMPONENT,
            "Restarting watch",
            &[("scope", scope_label.as_str()), ("resourceVersion", resume.as_str())],
        );
        tokio::select! {
            _ = cancellation.cancelled() => return,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(Duration::from_millis(BACKOFF_MAX_MS));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::k8s::configmap::ConfigMap;
    use crate::operator::k8s::{ObjectMeta, ResourceKind};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn recording_feed(
        store: &ClusterStore,
    ) -> (ChangeFeed, mpsc::UnboundedReceiver<ChangeNotice>) {
        let feed = ChangeFeed::new(store.clone(), ResourceCache::new(store.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        feed.subscribe(
            WatchScope::new(ResourceKind::ConfigMap, Some("kcm")),
            Arc::new(move |notice: &ChangeNotice| {
                let _ = tx.send(notice.clone());
            }),
        );
        (feed, rx)
    }

    async fn next_notice(rx: &mut mpsc::UnboundedReceiver<ChangeNotice>) -> ChangeNotice {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("notice arrives")
            .expect("channel open")
    }

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap::new(ObjectMeta::namespaced("kcm", name))
    }

    #[tokio::test]
    async fn initial_list_and_live_events_are_delivered() {
        let store = ClusterStore::new();
        store.create(&config_map("existing")).expect("create");
        let (feed, mut rx) = recording_feed(&store);
        let token = CancellationToken::new();
        feed.start(&token);

        let initial = next_notice(&mut rx).await;
        assert_eq!(initial.key.name, "existing");
        assert_eq!(initial.event_type, WatchEventType::Added);

        store.create(&config_map("fresh")).expect("create");
        let live = next_notice(&mut rx).await;
        assert_eq!(live.key.name, "fresh");
        let cached: Option<ConfigMap> = feed.cache().get(Some("kcm"), "fresh").expect("get");
        assert!(cached.is_some());

        token.cancel();
        feed.stop().await;
    }

    #[tokio::test]
    async fn disconnects_resume_from_last_version() {
        let store = ClusterStore::new();
        let (feed, mut rx) = recording_feed(&store);
        let token = CancellationToken::new();
        feed.start(&token);

        store.create(&config_map("one")).expect("create");
        assert_eq!(next_notice(&mut rx).await.key.name, "one");

        store.disconnect_watchers();
        store.create(&config_map("two")).expect("create");
        let resumed = next_notice(&mut rx).await;
        assert_eq!(resumed.key.name, "two");
        assert!(feed.restart_count() >= 1);

        token.cancel();
        feed.stop().await;
    }

    #[tokio::test]
    async fn expired_history_triggers_relist_with_deletions() {
        let store = ClusterStore::new();
        store.create(&config_map("doomed")).expect("create");
        let (feed, mut rx) = recording_feed(&store);
        let token = CancellationToken::new();
        feed.start(&token);
        assert_eq!(next_notice(&mut rx).await.key.name, "doomed");

        store.disconnect_watchers();
        store
            .delete::<ConfigMap>(Some("kcm"), "doomed", None)
            .expect("delete");
        store.create(&config_map("survivor")).expect("create");
        store.compact();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            let notice = next_notice(&mut rx).await;
            seen.push((notice.event_type, notice.key.name));
        }
        assert!(seen.contains(&(WatchEventType::Deleted, "doomed".to_string())));
        assert!(seen.contains(&(WatchEventType::Added, "survivor".to_string())));
        assert!(feed.relist_count() >= 2);

        token.cancel();
        feed.stop().await;
    }
}
