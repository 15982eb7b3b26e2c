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

use crate::operator::k8s::store::{ClusterStore, StoreError, WatchEvent, WatchEventType, WatchScope};
use crate::operator::k8s::{ObjectKey, Resource};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Read-through cache of cluster objects, fed by the change feed.
///
/// Reads are served from memory for scopes the feed has synced while the
/// cache is running; every other read falls through to the store.
#[derive(Clone)]
pub struct ResourceCache {
    store: ClusterStore,
    inner: Arc<RwLock<CacheState>>,
}

#[derive(Default)]
struct CacheState {
    running: bool,
    objects: BTreeMap<ObjectKey, Value>,
    synced: HashSet<WatchScope>,
}

impl ResourceCache {
    pub fn new(store: ClusterStore) -> Self {
        Self {
            store,
            inner: Arc::new(RwLock::new(CacheState::default())),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn start(&self) {
        self.write().running = true;
    }

    /// Stops serving from memory and drops everything cached.
    pub fn stop(&self) {
        let mut state = self.write();
        state.running = false;
        state.objects.clear();
        state.synced.clear();
    }

    pub fn is_running(&self) -> bool {
        self.read().running
    }

    /// Replaces the cached contents of `scope` with a fresh listing and
    /// returns the keys that were cached before.
    pub fn replace(&self, scope: &WatchScope, items: Vec<(ObjectKey, Value)>) -> Vec<ObjectKey> {
        let mut state = self.write();
        let previous: Vec<ObjectKey> = state
            .objects
            .keys()
            .filter(|key| scope.matches(key))
            .cloned()
            .collect();
        for key in &previous {
            state.objects.remove(key);
        }
        state.objects.extend(items);
        state.synced.insert(scope.clone());
        previous
    }

    pub fn apply(&self, event: &WatchEvent) {
        let mut state = self.write();
        match event.event_type {
            WatchEventType::Deleted => {
                state.objects.remove(&event.key);
            }
            WatchEventType::Added | WatchEventType::Modified => {
                state.objects.insert(event.key.clone(), event.object.clone());
            }
        }
    }

    pub fn has_synced(&self, scope: &WatchScope) -> bool {
        let state = self.read();
        state.running && covers(&state, scope)
    }

    pub fn get<T: Resource>(&self, namespace: Option<&str>, name: &str) -> Result<Option<T>, StoreError> {
        let key = ObjectKey::new(T::KIND, namespace, name);
        {
            let state = self.read();
            if state.running && covers(&state, &WatchScope::new(T::KIND, namespace)) {
                return state
                    .objects
                    .get(&key)
                    .map(|value| decode(&key, value))
                    .transpose();
            }
        }
        self.store.get(namespace, name)
    }

    pub fn list<T: Resource>(&self, namespace: Option<&str>) -> Result<Vec<T>, StoreError> {
        let scope = WatchScope::new(T::KIND, namespace);
        {
            let state = self.read();
            if state.running && covers(&state, &scope) {
                return state
                    .objects
                    .iter()
                    .filter(|(key, _)| scope.matches(key))
                    .map(|(key, value)| decode(key, value))
                    .collect();
            }
        }
        self.store.list(namespace)
    }
}

/// A scope is covered when it, or the all-namespace scope of its kind, has
/// been synced.
fn covers(state: &CacheState, scope: &WatchScope) -> bool {
    state.synced.contains(scope) || state.synced.contains(&WatchScope::new(scope.kind, None))
}

fn decode<T: Resource>(key: &ObjectKey, value: &Value) -> Result<T, StoreError> {
    serde_json::from_value(value.clone()).map_err(|source| StoreError::Serialization {
        key: key.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::k8s::configmap::ConfigMap;
    use crate::operator::k8s::{ObjectMeta, ResourceKind};

    #[test]
    fn unsynced_scopes_read_through() {
        let store = ClusterStore::new();
        let cache = ResourceCache::new(store.clone());
        cache.start();
        store
            .create(&ConfigMap::new(ObjectMeta::namespaced("kcm", "config")))
            .expect("create");

        let found: Option<ConfigMap> = cache.get(Some("kcm"), "config").expect("get");
        assert!(found.is_some());
    }

    #[test]
    fn synced_scopes_serve_cached_state() {
        let store = ClusterStore::new();
        let cache = ResourceCache::new(store.clone());
        cache.start();
        let scope = WatchScope::new(ResourceKind::ConfigMap, Some("kcm"));
        let (items, _) = store.list_scope(&scope);
        cache.replace(&scope, items);
        assert!(cache.is_running());
        assert!(cache.has_synced(&scope));

        store
            .create(&ConfigMap::new(ObjectMeta::namespaced("kcm", "config")))
            .expect("create");
        let cached: Vec<ConfigMap> = cache.list(Some("kcm")).expect("list");
        assert!(cached.is_empty(), "cache only changes through the feed");

        cache.stop();
        assert!(!cache.is_running());
        let live: Vec<ConfigMap> = cache.list(Some("kcm")).expect("list");
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn cluster_wide_sync_covers_namespaces() {
        let store = ClusterStore::new();
        let cache = ResourceCache::new(store.clone());
        cache.start();
        store
            .create(&ConfigMap::new(ObjectMeta::namespaced("a", "one")))
            .expect("create");
        let scope = WatchScope::new(ResourceKind::ConfigMap, None);
        let (items, _) = store.list_scope(&scope);
        cache.replace(&scope, items);
        assert!(cache.has_synced(&WatchScope::new(ResourceKind::ConfigMap, Some("a"))));
        let found: Option<ConfigMap> = cache.get(Some("a"), "one").expect("get");
        assert!(found.is_some());
    }

    #[test]
    fn cache_serves_reads_after_a_writer_panics() {
        let store = ClusterStore::new();
        store
            .create(&ConfigMap::new(ObjectMeta::namespaced("kcm", "config")))
            .expect("create");
        let cache = ResourceCache::new(store.clone());
        cache.start();
        let scope = WatchScope::new(ResourceKind::ConfigMap, Some("kcm"));
        let (items, _) = store.list_scope(&scope);
        cache.replace(&scope, items);

        let writer = cache.clone();
        let joined = std::thread::spawn(move || {
            let _guard = writer.write();
            panic!("writer panicked");
        })
        .join();
        assert!(joined.is_err());
        assert!(cache.inner.is_poisoned());

        assert!(cache.has_synced(&scope));
        let found: Option<ConfigMap> = cache.get(Some("kcm"), "config").expect("get");
        assert!(found.is_some());
        cache.stop();
        assert!(!cache.is_running());
    }
}
