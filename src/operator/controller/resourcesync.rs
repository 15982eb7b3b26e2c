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

use crate::operator::controller::conditions::{
    report_degraded, ConditionReason, OperatorConditionKind,
};
use crate::operator::controller::informer::ResourceCache;
use crate::operator::controller::reconcile::{Controller, ControllerError, ReconcileOutcome};
use crate::operator::controller::runtime::WorkQueue;
use crate::operator::k8s::configmap::{ConfigMap, Secret};
use crate::operator::k8s::operator::GLOBAL_MACHINE_CONFIG_NAMESPACE;
use crate::operator::k8s::store::{ClusterStore, StoreError, DEFAULT_UPDATE_ATTEMPTS};
use crate::operator::k8s::{ObjectMeta, Resource, ResourceKind};
use crate::operator::logger::log_info;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

const CONTROLLER_NAME: &str = "resource-sync";

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ResourceLocation {
    pub namespace: String,
    pub name: String,
}

impl ResourceLocation {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SyncKind {
    ConfigMap,
    Secret,
}

impl SyncKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            SyncKind::ConfigMap => "configmap",
            SyncKind::Secret => "secret",
        }
    }

    fn matches(self, kind: ResourceKind) -> bool {
        matches!(
            (self, kind),
            (SyncKind::ConfigMap, ResourceKind::ConfigMap) | (SyncKind::Secret, ResourceKind::Secret)
        )
    }
}

/// One-directional copy of a ConfigMap or Secret into a destination owned by
/// the controller. A rule without a source removes the destination.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SyncRule {
    pub kind: SyncKind,
    pub source: Option<ResourceLocation>,
    pub destination: ResourceLocation,
    pub required: bool,
}

impl SyncRule {
    pub fn config_map(source: ResourceLocation, destination: ResourceLocation) -> Self {
        Self {
            kind: SyncKind::ConfigMap,
            source: Some(source),
            destination,
            required: false,
        }
    }

    pub fn secret(source: ResourceLocation, destination: ResourceLocation) -> Self {
        Self {
            kind: SyncKind::Secret,
            source: Some(source),
            destination,
            required: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Queue key for this rule, derived from the destination.
    pub fn key(&self) -> String {
        sync_key(self.kind, &self.destination)
    }
}

pub fn sync_key(kind: SyncKind, destination: &ResourceLocation) -> String {
    format!("{}/{}/{}", kind.as_str(), destination.namespace, destination.name)
}

/// Registration surface used by config observers to request mirroring.
/// Passing `None` as the source turns the rule into a removal of the
/// destination.
pub trait ResourceSyncer: Send + Sync {
    fn sync_config_map(&self, destination: ResourceLocation, source: Option<ResourceLocation>);
    fn sync_secret(&self, destination: ResourceLocation, source: Option<ResourceLocation>);
}

/// Rules every installation mirrors into the target namespace.
pub fn default_sync_rules(target_namespace: &str) -> Vec<SyncRule> {
    vec![
        SyncRule::secret(
            ResourceLocation::new(GLOBAL_MACHINE_CONFIG_NAMESPACE, "kube-controller-manager-kubeconfig"),
            ResourceLocation::new(target_namespace, "controller-manager-kubeconfig"),
        )
        .required(),
        SyncRule::config_map(
            ResourceLocation::new(GLOBAL_MACHINE_CONFIG_NAMESPACE, "serviceaccount-ca"),
            ResourceLocation::new(target_namespace, "serviceaccount-ca"),
        ),
    ]
}

pub struct ResourceSyncController {
    store: ClusterStore,
    cache: ResourceCache,
    queue: WorkQueue<String>,
    rules: RwLock<BTreeMap<String, SyncRule>>,
}

impl ResourceSyncController {
    pub fn new(store: ClusterStore, cache: ResourceCache, rules: Vec<SyncRule>) -> Self {
        let rules = rules.into_iter().map(|rule| (rule.key(), rule)).collect();
        Self {
            store,
            cache,
            queue: WorkQueue::new(CONTROLLER_NAME),
            rules: RwLock::new(rules),
        }
    }

    pub fn rules(&self) -> Vec<SyncRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn rule(&self, key: &str) -> Option<SyncRule> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Keys of every rule whose source or destination is the named object.
    pub fn keys_for(&self, kind: ResourceKind, namespace: &str, name: &str) -> Vec<String> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, rule)| rule.kind.matches(kind))
            .filter(|(_, rule)| {
                let is_destination =
                    rule.destination.namespace == namespace && rule.destination.name == name;
                let is_source = rule
                    .source
                    .as_ref()
                    .map(|source| source.namespace == namespace && source.name == name)
                    .unwrap_or(false);
                is_destination || is_source
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn enqueue_all(&self) {
        for key in self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
        {
            self.queue.add(key.clone());
        }
    }

    fn register(&self, rule: SyncRule) {
        let key = rule.key();
        let changed = {
            let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
            let required = rules.get(&key).map(|existing| existing.required).unwrap_or(false);
            let rule = SyncRule { required: rule.required || required, ..rule };
            rules.insert(key.clone(), rule.clone()) != Some(rule)
        };
        if changed {
            log_info(CONTROLLER_NAME, "Registered sync rule", &[("key", key.as_str())]);
            self.queue.add(key);
        }
    }

    fn sync_rule(&self, rule: &SyncRule) -> Result<bool, StoreError> {
        match rule.kind {
            SyncKind::ConfigMap => self.sync_object::<ConfigMap>(
                rule,
                ConfigMap::content_hash,
                ConfigMap::copy_data_from,
                ConfigMap::new,
            ),
            SyncKind::Secret => self.sync_object::<Secret>(
                rule,
                Secret::content_hash,
                Secret::copy_data_from,
                Secret::new,
            ),
        }
    }

    /// Returns whether the source was present.
    fn sync_object<T: Resource>(
        &self,
        rule: &SyncRule,
        hash: fn(&T) -> String,
        copy: fn(&mut T, &T),
        empty: fn(ObjectMeta) -> T,
    ) -> Result<bool, StoreError> {
        let destination = &rule.destination;
        let source: Option<T> = match &rule.source {
            Some(location) => self.cache.get(Some(&location.namespace), &location.name)?,
            None => None,
        };
        let current: Option<T> = self
            .store
            .get(Some(&destination.namespace), &destination.name)?;

        let Some(source) = source else {
            if current.is_some() {
                match self
                    .store
                    .delete::<T>(Some(&destination.namespace), &destination.name, None)
                {
                    Ok(()) | Err(StoreError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
                let target = destination.to_string();
                log_info(CONTROLLER_NAME, "Removed synced resource", &[("destination", target.as_str())]);
            }
            return Ok(false);
        };

        let desired_hash = hash(&source);
        match current {
            Some(existing) if hash(&existing) == desired_hash => return Ok(true),
            Some(_) => {}
            None => {
                let mut created = empty(ObjectMeta::namespaced(
                    destination.namespace.clone(),
                    destination.name.clone(),
                ));
                copy(&mut created, &source);
                match self.store.create(&created) {
                    Ok(_) => {
                        self.log_synced(rule, &desired_hash);
                        return Ok(true);
                    }
                    Err(StoreError::AlreadyExists(_)) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        let outcome = self.store.update_with_retry::<T, _>(
            Some(&destination.namespace),
            &destination.name,
            DEFAULT_UPDATE_ATTEMPTS,
            |object| copy(object, &source),
        )?;
        if outcome.was_updated() {
            self.log_synced(rule, &desired_hash);
        }
        Ok(true)
    }

    fn log_synced(&self, rule: &SyncRule, hash: &str) {
        let source = rule
            .source
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let destination = rule.destination.to_string();
        log_info(
            CONTROLLER_NAME,
            "Synced resource",
            &[
                ("kind", rule.kind.as_str()),
                ("source", source.as_str()),
                ("destination", destination.as_str()),
                ("contentHash", hash),
            ],
        );
    }

    fn source_exists(&self, rule: &SyncRule) -> Result<bool, StoreError> {
        let Some(source) = &rule.source else {
            return Ok(true);
        };
        match rule.kind {
            SyncKind::ConfigMap => Ok(self
                .cache
                .get::<ConfigMap>(Some(&source.namespace), &source.name)?
                .is_some()),
            SyncKind::Secret => Ok(self
                .cache
                .get::<Secret>(Some(&source.namespace), &source.name)?
                .is_some()),
        }
    }

    fn missing_required_sources(&self) -> Result<Vec<String>, StoreError> {
        let mut missing = Vec::new();
        for rule in self.rules().into_iter().filter(|rule| rule.required) {
            if !self.source_exists(&rule)? {
                let source = rule
                    .source
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                missing.push(format!("{} {} (for {})", rule.kind.as_str(), source, rule.destination));
            }
        }
        Ok(missing)
    }
}

impl ResourceSyncer for ResourceSyncController {
    fn sync_config_map(&self, destination: ResourceLocation, source: Option<ResourceLocation>) {
        self.register(SyncRule {
            kind: SyncKind::ConfigMap,
            source,
            destination,
            required: false,
        });
    }

    fn sync_secret(&self, destination: ResourceLocation, source: Option<ResourceLocation>) {
        self.register(SyncRule {
            kind: SyncKind::Secret,
            source,
            destination,
            required: false,
        });
    }
}

impl Controller for ResourceSyncController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    fn reconcile(&self, key: &str) -> Result<ReconcileOutcome, ControllerError> {
        if let Some(rule) = self.rule(key) {
            self.sync_rule(&rule)?;
        }

        let missing = self.missing_required_sources()?;
        let message = format!("required source missing: {}", missing.join(", "));
        let failure = if missing.is_empty() {
            None
        } else {
            Some((ConditionReason::RequiredSourceMissing.as_str(), message.as_str()))
        };
        report_degraded(
            &self.store,
            OperatorConditionKind::ResourceSyncControllerDegraded,
            failure,
        )?;
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::controller::conditions::find_condition;
    use crate::operator::k8s::operator::{ConditionStatus, OperatorConfig};

    fn setup(rules: Vec<SyncRule>) -> (ClusterStore, ResourceSyncController) {
        let store = ClusterStore::new();
        store.create(&OperatorConfig::default_cluster()).expect("seed");
        let controller =
            ResourceSyncController::new(store.clone(), ResourceCache::new(store.clone()), rules);
        (store, controller)
    }

    fn ca_rule() -> SyncRule {
        SyncRule::config_map(
            ResourceLocation::new("src", "ca"),
            ResourceLocation::new("dst", "ca"),
        )
    }

    fn degraded(store: &ClusterStore) -> ConditionStatus {
        let config: OperatorConfig = store.get(None, "cluster").unwrap().unwrap();
        find_condition(&config.status.conditions, "ResourceSyncControllerDegraded")
            .map(|condition| condition.status)
            .unwrap_or(ConditionStatus::Unknown)
    }

    #[test]
    fn copies_source_and_is_idempotent() {
        let (store, controller) = setup(vec![ca_rule()]);
        store
            .create(&ConfigMap::new(ObjectMeta::namespaced("src", "ca")).with_data("ca.crt", "pem"))
            .unwrap();
        controller.reconcile("configmap/dst/ca").unwrap();

        let copied: ConfigMap = store.get(Some("dst"), "ca").unwrap().unwrap();
        assert_eq!(copied.data.get("ca.crt").map(String::as_str), Some("pem"));

        let writes = store.write_count();
        controller.reconcile("configmap/dst/ca").unwrap();
        assert_eq!(store.write_count(), writes);
    }

    #[test]
    fn missing_source_removes_destination() {
        let (store, controller) = setup(vec![ca_rule()]);
        store
            .create(&ConfigMap::new(ObjectMeta::namespaced("dst", "ca")).with_data("stale", "x"))
            .unwrap();
        controller.reconcile("configmap/dst/ca").unwrap();
        assert!(store.get::<ConfigMap>(Some("dst"), "ca").unwrap().is_none());
        assert_eq!(degraded(&store), ConditionStatus::False);
    }

    #[test]
    fn missing_required_source_degrades() {
        let (store, controller) = setup(default_sync_rules("target"));
        controller
            .reconcile("secret/target/controller-manager-kubeconfig")
            .unwrap();
        assert_eq!(degraded(&store), ConditionStatus::True);

        store
            .create(
                &Secret::new(ObjectMeta::namespaced(
                    GLOBAL_MACHINE_CONFIG_NAMESPACE,
                    "kube-controller-manager-kubeconfig",
                ))
                .with_entry("kubeconfig", b"apiVersion: v1"),
            )
            .unwrap();
        controller
            .reconcile("secret/target/controller-manager-kubeconfig")
            .unwrap();
        assert_eq!(degraded(&store), ConditionStatus::False);
        let copied: Secret = store
            .get(Some("target"), "controller-manager-kubeconfig")
            .unwrap()
            .unwrap();
        assert_eq!(copied.get_key_bytes("kubeconfig"), Some(b"apiVersion: v1".to_vec()));
    }

    #[test]
    fn registration_enqueues_and_keys_match_both_ends() {
        let (_store, controller) = setup(Vec::new());
        controller.sync_config_map(
            ResourceLocation::new("target", "cloud-config"),
            Some(ResourceLocation::new("openshift-config", "cloud")),
        );
        assert_eq!(controller.queue().len(), 1);
        assert_eq!(
            controller.keys_for(ResourceKind::ConfigMap, "openshift-config", "cloud"),
            vec!["configmap/target/cloud-config".to_string()]
        );
        assert_eq!(
            controller.keys_for(ResourceKind::ConfigMap, "target", "cloud-config").len(),
            1
        );
        assert!(controller
            .keys_for(ResourceKind::Secret, "openshift-config", "cloud")
            .is_empty());

        // Same registration again is not a change.
        let queued = controller.queue().try_get().expect("queued key");
        controller.queue().done(&queued);
        controller.sync_config_map(
            ResourceLocation::new("target", "cloud-config"),
            Some(ResourceLocation::new("openshift-config", "cloud")),
        );
        assert!(controller.queue().is_empty());
    }
}
