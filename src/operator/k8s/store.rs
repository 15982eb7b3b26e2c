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

//! In-process model of the cluster object API: typed CRUD with optimistic
//! concurrency on a single global resource-version counter, plus watches
//! that resume from a resource version within a bounded history window.

use super::meta::{ObjectKey, Resource, ResourceKind};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

const WATCH_HISTORY_LIMIT: usize = 1024;
const WATCH_CHANNEL_CAPACITY: usize = 256;

/// Attempts used by controllers for read-modify-write cycles.
pub const DEFAULT_UPDATE_ATTEMPTS: usize = 5;

#[derive(Debug)]
pub enum StoreError {
    NotFound(ObjectKey),
    AlreadyExists(ObjectKey),
    Conflict {
        key: ObjectKey,
        expected: String,
        actual: String,
    },
    Unavailable(String),
    Invalid {
        key: ObjectKey,
        reason: String,
    },
    /// The requested resource version is older than the retained history.
    Expired {
        requested: u64,
        oldest: u64,
    },
    Serialization {
        key: ObjectKey,
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Errors that may succeed when retried without any change in input.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::Unavailable(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(key) => write!(f, "{key} not found"),
            StoreError::AlreadyExists(key) => write!(f, "{key} already exists"),
            StoreError::Conflict {
                key,
                expected,
                actual,
            } => write!(
                f,
                "conflict updating {key}: expected resourceVersion {expected}, found {actual}"
            ),
            StoreError::Unavailable(message) => write!(f, "store unavailable: {message}"),
            StoreError::Invalid { key, reason } => write!(f, "invalid {key}: {reason}"),
            StoreError::Expired { requested, oldest } => write!(
                f,
                "resourceVersion {requested} is too old (oldest retained {oldest})"
            ),
            StoreError::Serialization { key, source } => {
                write!(f, "failed to (de)serialize {key}: {source}")
            }
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Serialization { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub key: ObjectKey,
    /// Object state after the change; the last known state for deletions.
    pub object: Value,
    pub resource_version: u64,
}

impl WatchEvent {
    pub fn decode<T: Resource>(&self) -> Result<T, StoreError> {
        decode(&self.key, &self.object)
    }
}

/// A (kind, namespace) slice of the store. `namespace: None` spans every
/// namespace of the kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchScope {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
}

impl WatchScope {
    pub fn new(kind: ResourceKind, namespace: Option<&str>) -> Self {
        Self {
            kind,
            namespace: namespace.map(str::to_string),
        }
    }

    pub fn matches(&self, key: &ObjectKey) -> bool {
        key.kind == self.kind
            && match &self.namespace {
                Some(namespace) => key.namespace.as_deref() == Some(namespace.as_str()),
                None => true,
            }
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}/{}", self.kind, namespace),
            None => write!(f, "{}/*", self.kind),
        }
    }
}

/// Result of [`ClusterStore::update_with_retry`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome<T> {
    Updated(T),
    /// The mutation produced no change, so nothing was written.
    Unchanged(T),
}

impl<T> UpdateOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            UpdateOutcome::Updated(value) | UpdateOutcome::Unchanged(value) => value,
        }
    }

    pub fn was_updated(&self) -> bool {
        matches!(self, UpdateOutcome::Updated(_))
    }
}

/// Faults the store can be told to return from upcoming writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    Unavailable,
    Conflict,
}

struct StoredObject {
    value: Value,
    resource_version: u64,
}

struct StoreState {
    objects: BTreeMap<ObjectKey, StoredObject>,
    version: u64,
    history: VecDeque<WatchEvent>,
    compacted_through: u64,
    sender: broadcast::Sender<WatchEvent>,
    faults: VecDeque<InjectedFault>,
    read_faults: usize,
    writes: u64,
}

impl StoreState {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    fn record(&mut self, event: WatchEvent) {
        self.writes += 1;
        self.history.push_back(event.clone());
        while self.history.len() > WATCH_HISTORY_LIMIT {
            if let Some(evicted) = self.history.pop_front() {
                self.compacted_through = evicted.resource_version;
            }
        }
        let _ = self.sender.send(event);
    }

    fn take_read_fault(&mut self) -> Result<(), StoreError> {
        if self.read_faults == 0 {
            return Ok(());
        }
        self.read_faults -= 1;
        Err(StoreError::Unavailable("injected read fault".to_string()))
    }

    fn take_fault(&mut self, key: &ObjectKey) -> Result<(), StoreError> {
        match self.faults.pop_front() {
            None => Ok(()),
            Some(InjectedFault::Unavailable) => {
                Err(StoreError::Unavailable("injected fault".to_string()))
            }
            Some(InjectedFault::Conflict) => Err(StoreError::Conflict {
                key: key.clone(),
                expected: "injected".to_string(),
                actual: self.version.to_string(),
            }),
        }
    }

    fn events_since(&self, scope: &WatchScope, since: u64) -> Result<VecDeque<WatchEvent>, StoreError> {
        if since < self.compacted_through {
            return Err(StoreError::Expired {
                requested: since,
                oldest: self.compacted_through,
            });
        }
        Ok(self
            .history
            .iter()
            .filter(|event| event.resource_version > since && scope.matches(&event.key))
            .cloned()
            .collect())
    }
}

/// Shared handle to the cluster object store.
#[derive(Clone)]
pub struct ClusterStore {
    inner: Arc<Mutex<StoreState>>,
}

impl Default for ClusterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterStore {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(StoreState {
                objects: BTreeMap::new(),
                version: 0,
                history: VecDeque::new(),
                compacted_through: 0,
                sender,
                faults: VecDeque::new(),
                read_faults: 0,
                writes: 0,
            })),
        }
    }

    /// No mutation unwinds halfway under the guard, so a poisoned lock
    /// still holds consistent state.
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get<T: Resource>(&self, namespace: Option<&str>, name: &str) -> Result<Option<T>, StoreError> {
        let key = ObjectKey::new(T::KIND, namespace, name);
        let mut state = self.lock();
        state.take_read_fault()?;
        state
            .objects
            .get(&key)
            .map(|stored| decode(&key, &stored.value))
            .transpose()
    }

    /// Lists objects of `T` in `namespace`, or across all namespaces when
    /// `None`, ordered by key.
    pub fn list<T: Resource>(&self, namespace: Option<&str>) -> Result<Vec<T>, StoreError> {
        self.list_with_version(namespace).map(|(items, _)| items)
    }

    /// Lists objects together with the store version the list reflects.
    pub fn list_with_version<T: Resource>(
        &self,
        namespace: Option<&str>,
    ) -> Result<(Vec<T>, u64), StoreError> {
        self.lock().take_read_fault()?;
        let scope = WatchScope::new(T::KIND, namespace);
        let (raw, version) = self.list_scope(&scope);
        let items = raw
            .iter()
            .map(|(key, value)| decode(key, value))
            .collect::<Result<Vec<T>, _>>()?;
        Ok((items, version))
    }

    /// Untyped list used by caches and change feeds.
    pub fn list_scope(&self, scope: &WatchScope) -> (Vec<(ObjectKey, Value)>, u64) {
        let state = self.lock();
        let items = state
            .objects
            .iter()
            .filter(|(key, _)| scope.matches(key))
            .map(|(key, stored)| (key.clone(), stored.value.clone()))
            .collect();
        (items, state.version)
    }

    pub fn create<T: Resource>(&self, object: &T) -> Result<T, StoreError> {
        let key = object.key();
        validate_key(&key)?;
        let mut state = self.lock();
        state.take_fault(&key)?;
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }

        let version = state.next_version();
        let mut created = object.clone();
        {
            let meta = created.metadata_mut();
            meta.resource_version = Some(version.to_string());
            meta.generation = 1;
            if meta.creation_timestamp.is_none() {
                meta.creation_timestamp = Some(Utc::now());
            }
        }
        let value = encode(&key, &created)?;
        state.objects.insert(
            key.clone(),
            StoredObject {
                value: value.clone(),
                resource_version: version,
            },
        );
        state.record(WatchEvent {
            event_type: WatchEventType::Added,
            key,
            object: value,
            resource_version: version,
        });
        Ok(created)
    }

    /// Replaces a stored object. When `object` carries a resourceVersion it
    /// must match the stored one.
    pub fn update<T: Resource>(&self, object: &T) -> Result<T, StoreError> {
        let key = object.key();
        if T::KIND.is_immutable() {
            return Err(StoreError::Invalid {
                key,
                reason: format!("{} objects are immutable", T::KIND),
            });
        }
        let mut state = self.lock();
        state.take_fault(&key)?;
        let (current_version, current_value) = match state.objects.get(&key) {
            Some(stored) => (stored.resource_version, stored.value.clone()),
            None => return Err(StoreError::NotFound(key)),
        };
        if let Some(expected) = object.metadata().resource_version.as_deref() {
            if expected != current_version.to_string() {
                return Err(StoreError::Conflict {
                    key,
                    expected: expected.to_string(),
                    actual: current_version.to_string(),
                });
            }
        }

        let current: T = decode(&key, &current_value)?;
        let version = state.next_version();
        let mut updated = object.clone();
        let spec_changed = encode(&key, &updated)?.get("spec") != current_value.get("spec");
        {
            let meta = updated.metadata_mut();
            meta.resource_version = Some(version.to_string());
            meta.creation_timestamp = current.metadata().creation_timestamp;
            meta.generation = current.metadata().generation + u64::from(spec_changed);
        }
        let value = encode(&key, &updated)?;
        state.objects.insert(
            key.clone(),
            StoredObject {
                value: value.clone(),
                resource_version: version,
            },
        );
        state.record(WatchEvent {
            event_type: WatchEventType::Modified,
            key,
            object: value,
            resource_version: version,
        });
        Ok(updated)
    }

    /// Deletes an object, optionally only if it is still at `precondition`.
    pub fn delete<T: Resource>(
        &self,
        namespace: Option<&str>,
        name: &str,
        precondition: Option<&str>,
    ) -> Result<(), StoreError> {
        let key = ObjectKey::new(T::KIND, namespace, name);
        let mut state = self.lock();
        state.take_fault(&key)?;
        let current_version = match state.objects.get(&key) {
            Some(stored) => stored.resource_version,
            None => return Err(StoreError::NotFound(key)),
        };
        if let Some(expected) = precondition {
            if expected != current_version.to_string() {
                return Err(StoreError::Conflict {
                    key,
                    expected: expected.to_string(),
                    actual: current_version.to_string(),
                });
            }
        }

        let version = state.next_version();
        let removed = state
            .objects
            .remove(&key)
            .map(|stored| stored.value)
            .unwrap_or(Value::Null);
        state.record(WatchEvent {
            event_type: WatchEventType::Deleted,
            key,
            object: removed,
            resource_version: version,
        });
        Ok(())
    }

    /// Read-compute-compare-write with bounded retries on conflict.
    ///
    /// `mutate` receives a fresh copy of the stored object on every attempt.
    /// When it leaves the object unchanged nothing is written. Exhausting
    /// `attempts` returns the last [`StoreError::Conflict`].
    pub fn update_with_retry<T, F>(
        &self,
        namespace: Option<&str>,
        name: &str,
        attempts: usize,
        mut mutate: F,
    ) -> Result<UpdateOutcome<T>, StoreError>
    where
        T: Resource,
        F: FnMut(&mut T),
    {
        let key = ObjectKey::new(T::KIND, namespace, name);
        let mut last_conflict = None;
        for _ in 0..attempts.max(1) {
            let current: T = self
                .get(namespace, name)?
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            let mut desired = current.clone();
            mutate(&mut desired);
            desired.metadata_mut().resource_version = current.metadata().resource_version.clone();
            if encode(&key, &desired)? == encode(&key, &current)? {
                return Ok(UpdateOutcome::Unchanged(current));
            }
            match self.update(&desired) {
                Ok(updated) => return Ok(UpdateOutcome::Updated(updated)),
                Err(err @ StoreError::Conflict { .. }) => last_conflict = Some(err),
                Err(err) => return Err(err),
            }
        }
        Err(last_conflict.unwrap_or(StoreError::Conflict {
            key,
            expected: String::new(),
            actual: String::new(),
        }))
    }

    /// Streams changes in `scope` with a resource version greater than
    /// `since`.
    pub fn watch(&self, scope: WatchScope, since: u64) -> Result<WatchStream, StoreError> {
        let state = self.lock();
        let backlog = state.events_since(&scope, since)?;
        let receiver = state.sender.subscribe();
        drop(state);
        Ok(WatchStream {
            scope,
            receiver,
            store: self.clone(),
            backlog,
            last_version: since,
        })
    }

    pub fn current_version(&self) -> u64 {
        self.lock().version
    }

    /// Number of successful mutations since creation.
    pub fn write_count(&self) -> u64 {
        self.lock().writes
    }

    /// Queues `count` faults of `fault` for the next writes.
    pub fn inject_faults(&self, fault: InjectedFault, count: usize) {
        let mut state = self.lock();
        state.faults.extend(std::iter::repeat(fault).take(count));
    }

    /// Fails the next `count` typed reads (`get`, `list`) as unavailable.
    pub fn inject_read_faults(&self, count: usize) {
        self.lock().read_faults += count;
    }

    /// Discards the retained watch history. Watches resuming from a version
    /// older than the current one receive [`StoreError::Expired`].
    pub fn compact(&self) {
        let mut state = self.lock();
        state.history.clear();
        state.compacted_through = state.version;
    }

    /// Closes every open watch stream.
    pub fn disconnect_watchers(&self) {
        let (sender, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        self.lock().sender = sender;
    }
}

pub struct WatchStream {
    scope: WatchScope,
    receiver: broadcast::Receiver<WatchEvent>,
    store: ClusterStore,
    backlog: VecDeque<WatchEvent>,
    last_version: u64,
}

impl WatchStream {
    pub fn last_version(&self) -> u64 {
        self.last_version
    }

    fn refill_backlog(&mut self) -> Result<(), StoreError> {
        let state = self.store.lock();
        self.backlog = state.events_since(&self.scope, self.last_version)?;
        Ok(())
    }

    /// Next event in scope. `Ok(None)` means the stream was closed and the
    /// caller should re-watch from [`last_version`](Self::last_version).
    pub async fn next(&mut self) -> Result<Option<WatchEvent>, StoreError> {
        if let Some(event) = self.backlog.pop_front() {
            self.last_version = event.resource_version;
            return Ok(Some(event));
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.resource_version <= self.last_version {
                        continue;
                    }
                    self.last_version = event.resource_version;
                    if self.scope.matches(&event.key) {
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    self.refill_backlog()?;
                    if let Some(event) = self.backlog.pop_front() {
                        self.last_version = event.resource_version;
                        return Ok(Some(event));
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

fn validate_key(key: &ObjectKey) -> Result<(), StoreError> {
    if key.name.is_empty() {
        return Err(StoreError::Invalid {
            key: key.clone(),
            reason: "metadata.name is required".to_string(),
        });
    }
    if key.kind.is_namespaced() != key.namespace.is_some() {
        let reason = if key.kind.is_namespaced() {
            "metadata.namespace is required"
        } else {
            "cluster-scoped objects must not set metadata.namespace"
        };
        return Err(StoreError::Invalid {
            key: key.clone(),
            reason: reason.to_string(),
        });
    }
    Ok(())
}

fn encode<T: Serialize>(key: &ObjectKey, object: &T) -> Result<Value, StoreError> {
    serde_json::to_value(object).map_err(|source| StoreError::Serialization {
        key: key.clone(),
        source,
    })
}

fn decode<T: Resource>(key: &ObjectKey, value: &Value) -> Result<T, StoreError> {
    serde_json::from_value(value.clone()).map_err(|source| StoreError::Serialization {
        key: key.clone(),
        source,
    })
}
