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

//! Folds rollout progress and controller health into the four published
//! cluster operator conditions.
//!
//! [`compute_conditions`] is a pure function of the operator config and the
//! set of healthy nodes. The only state carried over from the previously
//! published conditions is `lastTransitionTime`, which moves only when a
//! condition's status changes.

use crate::operator::controller::conditions::OperatorConditionKind;
use crate::operator::controller::informer::ResourceCache;
use crate::operator::controller::installer::exhausted_message;
use crate::operator::controller::reconcile::{Controller, ControllerError, ReconcileOutcome};
use crate::operator::controller::runtime::WorkQueue;
use crate::operator::k8s::installer::{workload_pod_name, WorkloadPod};
use crate::operator::k8s::operator::{
    ClusterOperator, ConditionStatus, ManagementState, NodeRollout, ObjectReference,
    OperandVersion, OperatorCondition, OperatorConfig, CLUSTER_OPERATOR_NAME,
    GLOBAL_MACHINE_CONFIG_NAMESPACE, GLOBAL_USER_CONFIG_NAMESPACE, OPERATOR_CONFIG_NAME,
    OPERATOR_NAMESPACE,
};
use crate::operator::k8s::store::{ClusterStore, StoreError, DEFAULT_UPDATE_ATTEMPTS};
use crate::operator::logger::log_info;
use crate::operator::observability::metrics;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

const CONTROLLER_NAME: &str = "status";

pub const STATUS_KEY: &str = "status";

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ClusterConditionType {
    Available,
    Progressing,
    Degraded,
    Upgradeable,
}

impl ClusterConditionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            ClusterConditionType::Available => "Available",
            ClusterConditionType::Progressing => "Progressing",
            ClusterConditionType::Degraded => "Degraded",
            ClusterConditionType::Upgradeable => "Upgradeable",
        }
    }

    pub const fn all() -> [ClusterConditionType; 4] {
        [
            ClusterConditionType::Available,
            ClusterConditionType::Progressing,
            ClusterConditionType::Degraded,
            ClusterConditionType::Upgradeable,
        ]
    }
}

impl Display for ClusterConditionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides whether a node's workload is serving at its current revision.
pub trait HealthProbe: Send + Sync {
    fn is_healthy(&self, rollout: &NodeRollout) -> Result<bool, StoreError>;
}

/// Healthy when the node's mirror pod is ready at the node's current
/// revision.
pub struct MirrorPodProbe {
    cache: ResourceCache,
    namespace: String,
}

impl MirrorPodProbe {
    pub fn new(cache: ResourceCache, namespace: impl Into<String>) -> Self {
        Self {
            cache,
            namespace: namespace.into(),
        }
    }
}

impl HealthProbe for MirrorPodProbe {
    fn is_healthy(&self, rollout: &NodeRollout) -> Result<bool, StoreError> {
        let pod: Option<WorkloadPod> = self
            .cache
            .get(Some(&self.namespace), &workload_pod_name(&rollout.node_name))?;
        Ok(pod
            .map(|pod| pod.ready && pod.revision == rollout.current_revision)
            .unwrap_or(false))
    }
}

pub struct StatusInputs<'a> {
    pub config: &'a OperatorConfig,
    /// Nodes passing the health probe.
    pub healthy: &'a BTreeSet<String>,
    /// Nodes required for Available; `None` means a majority.
    pub quorum: Option<usize>,
    pub max_installer_retries: u32,
}

pub fn quorum_for(nodes: usize, configured: Option<usize>) -> usize {
    configured.unwrap_or(nodes / 2 + 1)
}

fn condition(
    kind: ClusterConditionType,
    status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
) -> OperatorCondition {
    OperatorCondition::new(kind.as_str(), status, reason, message)
}

/// Computes Available, Progressing, Degraded and Upgradeable, in that order,
/// without transition times.
pub fn compute_conditions(inputs: &StatusInputs<'_>) -> Vec<OperatorCondition> {
    let status = &inputs.config.status;
    let rollouts = &status.node_statuses;
    let latest = status.latest_available_revision;

    let available = if rollouts.is_empty() {
        condition(
            ClusterConditionType::Available,
            ConditionStatus::False,
            "NoNodes",
            "no control-plane nodes are known",
        )
    } else {
        let quorum = quorum_for(rollouts.len(), inputs.quorum);
        let serving = rollouts
            .iter()
            .filter(|rollout| {
                rollout.current_revision > 0
                    && rollout.current_revision == rollout.target_revision
                    && inputs.healthy.contains(&rollout.node_name)
            })
            .count();
        let message = format!(
            "{serving} of {} nodes are serving their target revision (quorum {quorum})",
            rollouts.len()
        );
        if serving >= quorum {
            condition(ClusterConditionType::Available, ConditionStatus::True, "AsExpected", message)
        } else {
            condition(
                ClusterConditionType::Available,
                ConditionStatus::False,
                "InsufficientQuorum",
                message,
            )
        }
    };

    let lagging: Vec<String> = rollouts
        .iter()
        .filter(|rollout| rollout.current_revision != latest)
        .map(|rollout| format!("{} at revision {}", rollout.node_name, rollout.current_revision))
        .collect();
    let progressing = if lagging.is_empty() {
        condition(
            ClusterConditionType::Progressing,
            ConditionStatus::False,
            "AsExpected",
            format!("all nodes are at revision {latest}"),
        )
    } else {
        condition(
            ClusterConditionType::Progressing,
            ConditionStatus::True,
            "NodesUpdating",
            format!("{}; latest revision is {latest}", lagging.join(", ")),
        )
    };

    let degraded = if let Some(message) = exhausted_message(rollouts, inputs.max_installer_retries) {
        condition(
            ClusterConditionType::Degraded,
            ConditionStatus::True,
            "InstallerRetriesExhausted",
            message,
        )
    } else if let Some(failing) = status.conditions.iter().find(|existing| {
        existing.condition_type.ends_with("Degraded")
            && existing.condition_type != OperatorConditionKind::NodeInstallerDegraded.as_str()
            && existing.status == ConditionStatus::True
    }) {
        condition(
            ClusterConditionType::Degraded,
            ConditionStatus::True,
            &failing.reason,
            format!("{}: {}", failing.condition_type, failing.message),
        )
    } else {
        condition(ClusterConditionType::Degraded, ConditionStatus::False, "AsExpected", "")
    };

    let upgradeable = if let Some(blocking) = status.conditions.iter().find(|existing| {
        existing.condition_type.ends_with("Upgradeable") && existing.status == ConditionStatus::False
    }) {
        condition(
            ClusterConditionType::Upgradeable,
            ConditionStatus::False,
            &blocking.reason,
            format!("{}: {}", blocking.condition_type, blocking.message),
        )
    } else if inputs.config.spec.management_state == ManagementState::Unmanaged {
        condition(
            ClusterConditionType::Upgradeable,
            ConditionStatus::False,
            "Unmanaged",
            "the operator is not managing the component",
        )
    } else {
        condition(ClusterConditionType::Upgradeable, ConditionStatus::True, "AsExpected", "")
    };

    vec![available, progressing, degraded, upgradeable]
}

/// Stamps `computed` with transition times carried over from `previous`
/// when the status is unchanged, or `now` otherwise.
pub fn merge_transition_times(
    previous: &[OperatorCondition],
    computed: Vec<OperatorCondition>,
    now: DateTime<Utc>,
) -> Vec<OperatorCondition> {
    computed
        .into_iter()
        .map(|mut condition| {
            let carried = previous
                .iter()
                .find(|existing| existing.condition_type == condition.condition_type)
                .filter(|existing| existing.status == condition.status)
                .and_then(|existing| existing.last_transition_time);
            condition.last_transition_time = Some(carried.unwrap_or(now));
            condition
        })
        .collect()
}

pub fn related_objects(target_namespace: &str) -> Vec<ObjectReference> {
    vec![
        ObjectReference::new("operator.openshift.io", "kubecontrollermanagers", "", OPERATOR_CONFIG_NAME),
        ObjectReference::new("", "namespaces", "", GLOBAL_USER_CONFIG_NAMESPACE),
        ObjectReference::new("", "namespaces", "", GLOBAL_MACHINE_CONFIG_NAMESPACE),
        ObjectReference::new("", "namespaces", "", target_namespace),
        ObjectReference::new("", "namespaces", "", OPERATOR_NAMESPACE),
    ]
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusSettings {
    pub quorum: Option<usize>,
    pub max_installer_retries: u32,
    pub operator_version: String,
}

pub struct StatusAggregator {
    store: ClusterStore,
    cache: ResourceCache,
    queue: WorkQueue<String>,
    probe: Box<dyn HealthProbe>,
    settings: StatusSettings,
    target_namespace: String,
}

impl StatusAggregator {
    pub fn new(
        store: ClusterStore,
        cache: ResourceCache,
        probe: Box<dyn HealthProbe>,
        settings: StatusSettings,
        target_namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            queue: WorkQueue::new(CONTROLLER_NAME),
            probe,
            settings,
            target_namespace: target_namespace.into(),
        }
    }

    pub fn enqueue(&self) {
        self.queue.add(STATUS_KEY.to_string());
    }

    fn publish(&self, computed: Vec<OperatorCondition>) -> Result<bool, StoreError> {
        let now = Utc::now();
        let related = related_objects(&self.target_namespace);
        let versions = vec![OperandVersion {
            name: "operator".to_string(),
            version: self.settings.operator_version.clone(),
        }];

        let existing: Option<ClusterOperator> = self.store.get(None, CLUSTER_OPERATOR_NAME)?;
        if existing.is_none() {
            let mut created = ClusterOperator::new();
            created.status.conditions = merge_transition_times(&[], computed.clone(), now);
            created.status.related_objects = related.clone();
            created.status.versions = versions.clone();
            match self.store.create(&created) {
                Ok(_) => return Ok(true),
                Err(StoreError::AlreadyExists(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let outcome = self.store.update_with_retry::<ClusterOperator, _>(
            None,
            CLUSTER_OPERATOR_NAME,
            DEFAULT_UPDATE_ATTEMPTS,
            |operator| {
                operator.status.conditions =
                    merge_transition_times(&operator.status.conditions, computed.clone(), now);
                operator.status.related_objects = related.clone();
                operator.status.versions = versions.clone();
            },
        )?;
        Ok(outcome.was_updated())
    }
}

impl Controller for StatusAggregator {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    fn reconcile(&self, _key: &str) -> Result<ReconcileOutcome, ControllerError> {
        let config: Option<OperatorConfig> = self.cache.get(None, OPERATOR_CONFIG_NAME)?;
        let Some(config) = config else {
            return Err(ControllerError::Dependency(format!(
                "operator config {OPERATOR_CONFIG_NAME} not found"
            )));
        };

        let mut healthy = BTreeSet::new();
        for rollout in &config.status.node_statuses {
            if self.probe.is_healthy(rollout)? {
                healthy.insert(rollout.node_name.clone());
            }
            metrics::set_node_current_revision(&rollout.node_name, rollout.current_revision);
        }

        let computed = compute_conditions(&StatusInputs {
            config: &config,
            healthy: &healthy,
            quorum: self.settings.quorum,
            max_installer_retries: self.settings.max_installer_retries,
        });
        for condition in &computed {
            metrics::set_operator_condition(&condition.condition_type, condition.status.as_str());
        }

        if self.publish(computed.clone())? {
            let summary: Vec<String> = computed
                .iter()
                .map(|condition| format!("{}={}", condition.condition_type, condition.status))
                .collect();
            let summary = summary.join(" ");
            log_info(CONTROLLER_NAME, "Published cluster operator status", &[("conditions", summary.as_str())]);
        }

        let generation = config.metadata.generation;
        let ready = u32::try_from(healthy.len()).unwrap_or(u32::MAX);
        self.store.update_with_retry::<OperatorConfig, _>(
            None,
            OPERATOR_CONFIG_NAME,
            DEFAULT_UPDATE_ATTEMPTS,
            |config| {
                config.status.observed_generation = generation;
                config.status.ready_replicas = ready;
            },
        )?;
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn rollout(node: &str, current: u64, target: u64) -> NodeRollout {
        NodeRollout {
            current_revision: current,
            target_revision: target,
            ..NodeRollout::new(node)
        }
    }

    fn config_with(rollouts: Vec<NodeRollout>, latest: u64) -> OperatorConfig {
        let mut config = OperatorConfig::default_cluster();
        config.status.latest_available_revision = latest;
        config.status.node_statuses = rollouts;
        config
    }

    fn compute(config: &OperatorConfig, healthy: &[&str]) -> Vec<OperatorCondition> {
        let healthy: BTreeSet<String> = healthy.iter().map(|node| node.to_string()).collect();
        compute_conditions(&StatusInputs {
            config,
            healthy: &healthy,
            quorum: None,
            max_installer_retries: 5,
        })
    }

    fn find<'a>(conditions: &'a [OperatorCondition], kind: ClusterConditionType) -> &'a OperatorCondition {
        conditions
            .iter()
            .find(|condition| condition.condition_type == kind.as_str())
            .expect("condition present")
    }

    #[test]
    fn no_nodes_is_unavailable() {
        let conditions = compute(&config_with(Vec::new(), 0), &[]);
        let available = find(&conditions, ClusterConditionType::Available);
        assert_eq!(available.status, ConditionStatus::False);
        assert_eq!(available.reason, "NoNodes");
    }

    #[test]
    fn availability_needs_a_healthy_majority_at_target() {
        let config = config_with(vec![rollout("a", 2, 2), rollout("b", 1, 2), rollout("c", 2, 2)], 2);
        let conditions = compute(&config, &["a"]);
        assert_eq!(find(&conditions, ClusterConditionType::Available).status, ConditionStatus::False);
        let conditions = compute(&config, &["a", "c"]);
        assert_eq!(find(&conditions, ClusterConditionType::Available).status, ConditionStatus::True);

        let progressing = find(&conditions, ClusterConditionType::Progressing);
        assert_eq!(progressing.status, ConditionStatus::True);
        assert_eq!(progressing.reason, "NodesUpdating");
        assert!(progressing.message.contains("b at revision 1"));
    }

    #[test]
    fn exhaustion_takes_precedence_in_degraded() {
        let mut failing = rollout("b", 1, 2);
        failing.last_failed_revision = 2;
        failing.last_failed_count = 5;
        failing.last_failed_reason = "crash".into();
        let mut config = config_with(vec![rollout("a", 2, 2), failing], 2);
        config.status.conditions.push(OperatorCondition::new(
            "RevisionControllerDegraded",
            ConditionStatus::True,
            "ContentCreationError",
            "missing",
        ));
        let degraded = find(&compute(&config, &["a"]), ClusterConditionType::Degraded).clone();
        assert_eq!(degraded.status, ConditionStatus::True);
        assert_eq!(degraded.reason, "InstallerRetriesExhausted");
        assert!(degraded.message.contains("node b"));
    }

    #[test]
    fn controller_degraded_conditions_propagate() {
        let mut config = config_with(vec![rollout("a", 1, 1)], 1);
        config.status.conditions.push(OperatorCondition::new(
            "ResourceSyncControllerDegraded",
            ConditionStatus::True,
            "RequiredSourceMissing",
            "secret missing",
        ));
        let degraded = find(&compute(&config, &["a"]), ClusterConditionType::Degraded).clone();
        assert_eq!(degraded.reason, "RequiredSourceMissing");
    }

    #[test]
    fn unmanaged_is_not_upgradeable() {
        let mut config = config_with(vec![rollout("a", 1, 1)], 1);
        config.spec.management_state = ManagementState::Unmanaged;
        let upgradeable = find(&compute(&config, &["a"]), ClusterConditionType::Upgradeable).clone();
        assert_eq!(upgradeable.status, ConditionStatus::False);
    }

    #[test]
    fn transition_times_survive_unchanged_status() {
        let t0 = Utc::now();
        let t1 = t0 + ChronoDuration::seconds(30);
        let config = config_with(vec![rollout("a", 1, 1)], 1);
        let first = merge_transition_times(&[], compute(&config, &["a"]), t0);
        let second = merge_transition_times(&first, compute(&config, &["a"]), t1);
        assert!(second.iter().all(|condition| condition.last_transition_time == Some(t0)));

        let lagging = config_with(vec![rollout("a", 1, 2)], 2);
        let third = merge_transition_times(&second, compute(&lagging, &[]), t1);
        let progressing = find(&third, ClusterConditionType::Progressing);
        assert_eq!(progressing.last_transition_time, Some(t1));
    }

    struct AlwaysHealthy;

    impl HealthProbe for AlwaysHealthy {
        fn is_healthy(&self, _rollout: &NodeRollout) -> Result<bool, StoreError> {
            Ok(true)
        }
    }

    #[test]
    fn publishes_once_and_then_stays_quiet() {
        let store = ClusterStore::new();
        store.create(&config_with(vec![rollout("a", 1, 1)], 1)).unwrap();
        let aggregator = StatusAggregator::new(
            store.clone(),
            ResourceCache::new(store.clone()),
            Box::new(AlwaysHealthy),
            StatusSettings {
                quorum: None,
                max_installer_retries: 5,
                operator_version: "1.0.0".into(),
            },
            "target",
        );
        aggregator.reconcile(STATUS_KEY).unwrap();
        let published: ClusterOperator = store.get(None, CLUSTER_OPERATOR_NAME).unwrap().unwrap();
        assert_eq!(
            published.condition("Available").map(|condition| condition.status),
            Some(ConditionStatus::True)
        );
        assert_eq!(published.status.versions[0].version, "1.0.0");
        assert_eq!(published.status.related_objects.len(), 5);

        let writes = store.write_count();
        aggregator.reconcile(STATUS_KEY).unwrap();
        assert_eq!(store.write_count(), writes);
    }
}
