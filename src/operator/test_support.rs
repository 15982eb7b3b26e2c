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

//! Deterministic harness for scenario tests: drives every controller
//! synchronously against an in-memory store with a simulated installer.
#![allow(dead_code)]

use crate::operator::config::OperatorSettings;
use crate::operator::controller::orchestrator::Orchestrator;
use crate::operator::controller::reconcile::{handle_result, Controller};
use crate::operator::controller::simulator::SimulatedInstaller;
use crate::operator::k8s::cluster::{Infrastructure, Network};
use crate::operator::k8s::configmap::{ConfigMap, Secret};
use crate::operator::k8s::node::Node;
use crate::operator::k8s::operator::{
    ClusterOperator, ConditionStatus, OperatorConfig, OperatorCondition, CLUSTER_OPERATOR_NAME,
    GLOBAL_MACHINE_CONFIG_NAMESPACE, OPERATOR_CONFIG_NAME,
};
use crate::operator::k8s::revision::Revision;
use crate::operator::k8s::store::DEFAULT_UPDATE_ATTEMPTS;
use crate::operator::k8s::{ClusterStore, ObjectMeta};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const TEST_IMAGE: &str = "registry.example/kube-controller-manager:test";
pub const KUBECONFIG_SOURCE: &str = "kube-controller-manager-kubeconfig";
pub const SERVICE_ACCOUNT_CA_SOURCE: &str = "serviceaccount-ca";
/// Revision secrets written straight into the target namespace by the
/// certificate tooling rather than synced from a source.
pub const TARGET_SECRETS: [&str; 3] = [
    "cluster-signing-ca",
    "service-account-private-key",
    "serving-cert",
];

/// Settings with an image and no installer backoff, so a failing node
/// burns through its retries within a few rounds.
pub fn test_settings() -> OperatorSettings {
    OperatorSettings {
        image: Some(TEST_IMAGE.to_string()),
        installer_backoff_base: Duration::ZERO,
        installer_backoff_max: Duration::ZERO,
        installer_poll_interval: Duration::from_millis(20),
        revision_min_age: Duration::ZERO,
        ..OperatorSettings::default()
    }
}

pub struct Cluster {
    store: ClusterStore,
    settings: OperatorSettings,
    orchestrator: Orchestrator,
    installer: SimulatedInstaller,
    controllers: Vec<Arc<dyn Controller>>,
}

impl Cluster {
    /// A cluster with control-plane `nodes`, platform config and the global
    /// source objects every rollout needs.
    pub fn new(nodes: &[&str]) -> Self {
        Self::with_settings(test_settings(), nodes)
    }

    pub fn with_settings(settings: OperatorSettings, nodes: &[&str]) -> Self {
        let store = ClusterStore::new();
        let orchestrator = Orchestrator::new(store.clone(), settings.clone());
        orchestrator
            .ensure_operator_config()
            .expect("seed operator config");
        store
            .create(&Infrastructure::new("AWS"))
            .expect("seed infrastructure");
        store
            .create(&Network::new(&["10.128.0.0/14"], &["172.30.0.0/16"]))
            .expect("seed network");
        let installer = SimulatedInstaller::new(store.clone(), settings.target_namespace.clone());
        let controllers = orchestrator.controllers();
        let cluster = Self {
            store,
            settings,
            orchestrator,
            installer,
            controllers,
        };
        for node in nodes {
            cluster.add_node(node);
        }
        cluster.put_source_secret(KUBECONFIG_SOURCE, "kubeconfig", "v1");
        cluster.put_source_config_map(SERVICE_ACCOUNT_CA_SOURCE, "ca-bundle.crt", "ca-v1");
        for name in TARGET_SECRETS {
            cluster.put_target_secret(name, "tls.key", "v1");
        }
        cluster
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn settings(&self) -> &OperatorSettings {
        &self.settings
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn installer(&self) -> &SimulatedInstaller {
        &self.installer
    }

    pub fn namespace(&self) -> &str {
        &self.settings.target_namespace
    }

    pub fn add_node(&self, name: &str) {
        self.store.create(&Node::control_plane(name)).expect("create node");
    }

    pub fn remove_node(&self, name: &str) {
        self.store.delete::<Node>(None, name, None).expect("delete node");
    }

    /// Creates or replaces a secret in the global managed-config namespace.
    pub fn put_source_secret(&self, name: &str, key: &str, value: &str) {
        let secret = Secret::new(ObjectMeta::namespaced(GLOBAL_MACHINE_CONFIG_NAMESPACE, name))
            .with_entry(key, value.as_bytes());
        if self.store.create(&secret).is_err() {
            self.store
                .update_with_retry::<Secret, _>(
                    Some(GLOBAL_MACHINE_CONFIG_NAMESPACE),
                    name,
                    DEFAULT_UPDATE_ATTEMPTS,
                    |current| current.copy_data_from(&secret),
                )
                .expect("update source secret");
        }
    }

    /// Creates or replaces a secret directly in the target namespace.
    pub fn put_target_secret(&self, name: &str, key: &str, value: &str) {
        let namespace = self.settings.target_namespace.as_str();
        let secret = Secret::new(ObjectMeta::namespaced(namespace, name)).with_entry(key, value.as_bytes());
        if self.store.create(&secret).is_err() {
            self.store
                .update_with_retry::<Secret, _>(Some(namespace), name, DEFAULT_UPDATE_ATTEMPTS, |current| {
                    current.copy_data_from(&secret)
                })
                .expect("update target secret");
        }
    }

    pub fn put_source_config_map(&self, name: &str, key: &str, value: &str) {
        let config_map = ConfigMap::new(ObjectMeta::namespaced(GLOBAL_MACHINE_CONFIG_NAMESPACE, name))
            .with_data(key, value);
        if self.store.create(&config_map).is_err() {
            self.store
                .update_with_retry::<ConfigMap, _>(
                    Some(GLOBAL_MACHINE_CONFIG_NAMESPACE),
                    name,
                    DEFAULT_UPDATE_ATTEMPTS,
                    |current| current.copy_data_from(&config_map),
                )
                .expect("update source config map");
        }
    }

    pub fn edit_operator_config(&self, edit: impl FnMut(&mut OperatorConfig)) {
        self.store
            .update_with_retry::<OperatorConfig, _>(None, OPERATOR_CONFIG_NAME, DEFAULT_UPDATE_ATTEMPTS, edit)
            .expect("edit operator config");
    }

    /// Drains every controller queue once, including keys re-queued by
    /// other controllers during the pass. Returns the number of reconciles.
    pub fn reconcile_pending(&self) -> usize {
        let mut reconciles = 0;
        loop {
            let mut progressed = false;
            for controller in &self.controllers {
                let queue = controller.queue();
                while let Some(key) = queue.try_get() {
                    let started = Instant::now();
                    let result = controller.reconcile(&key);
                    handle_result(controller.as_ref(), &key, result, started.elapsed());
                    queue.done(&key);
                    reconciles += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return reconciles;
            }
        }
    }

    /// One full pass: every controller key queued and reconciled, then the
    /// simulated installer advances. Returns the store writes it caused.
    pub fn round(&self) -> u64 {
        let before = self.store.write_count();
        self.orchestrator.enqueue_all();
        self.reconcile_pending();
        self.installer.step().expect("simulated installer step");
        self.store.write_count() - before
    }

    /// Runs rounds until one completes without writing. Panics when the
    /// cluster is still changing after `max_rounds`.
    pub fn settle(&self, max_rounds: usize) -> usize {
        for round in 1..=max_rounds {
            if self.round() == 0 {
                return round;
            }
        }
        panic!("cluster did not settle within {max_rounds} rounds");
    }

    pub fn operator_config(&self) -> OperatorConfig {
        self.store
            .get(None, OPERATOR_CONFIG_NAME)
            .expect("read operator config")
            .expect("operator config exists")
    }

    pub fn cluster_operator(&self) -> ClusterOperator {
        self.store
            .get(None, CLUSTER_OPERATOR_NAME)
            .expect("read cluster operator")
            .expect("cluster operator exists")
    }

    pub fn revisions(&self) -> Vec<u64> {
        let mut numbers: Vec<u64> = self
            .store
            .list::<Revision>(Some(self.namespace()))
            .expect("list revisions")
            .iter()
            .map(|revision| revision.number)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn cluster_condition(&self, condition_type: &str) -> OperatorCondition {
        self.cluster_operator()
            .condition(condition_type)
            .cloned()
            .unwrap_or_else(|| panic!("cluster operator has no {condition_type} condition"))
    }

    pub fn cluster_condition_is(&self, condition_type: &str, status: ConditionStatus) -> bool {
        self.cluster_condition(condition_type).status == status
    }
}
