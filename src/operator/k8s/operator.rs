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

use super::meta::{impl_resource, ObjectMeta, ResourceKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const OPERATOR_CONFIG_NAME: &str = "cluster";
pub const CLUSTER_OPERATOR_NAME: &str = "kube-controller-manager";
pub const DEFAULT_TARGET_NAMESPACE: &str = "openshift-kube-controller-manager";
pub const OPERATOR_NAMESPACE: &str = "openshift-kube-controller-manager-operator";
/// Namespace holding administrator-provided cluster configuration.
pub const GLOBAL_USER_CONFIG_NAMESPACE: &str = "openshift-config";
/// Namespace holding platform-generated cluster configuration.
pub const GLOBAL_MACHINE_CONFIG_NAMESPACE: &str = "openshift-config-managed";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManagementState {
    #[default]
    Managed,
    Unmanaged,
    Removed,
}

impl ManagementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ManagementState::Managed => "Managed",
            ManagementState::Unmanaged => "Unmanaged",
            ManagementState::Removed => "Removed",
        }
    }
}

/// Desired state of the managed control-plane component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: OperatorSpec,
    #[serde(default)]
    pub status: OperatorStatus,
}

impl_resource!(OperatorConfig, ResourceKind::OperatorConfig);

impl OperatorConfig {
    /// The default singleton seeded when the operator starts against an
    /// empty cluster.
    pub fn default_cluster() -> Self {
        Self {
            metadata: ObjectMeta::named(OPERATOR_CONFIG_NAME),
            spec: OperatorSpec {
                management_state: ManagementState::Managed,
                log_level: "Normal".to_string(),
                observed_config: Value::Object(Default::default()),
                unsupported_config_overrides: Value::Object(Default::default()),
                ..OperatorSpec::default()
            },
            status: OperatorStatus::default(),
        }
    }

    pub fn node_status(&self, node: &str) -> Option<&NodeRollout> {
        self.status
            .node_statuses
            .iter()
            .find(|status| status.node_name == node)
    }

    pub fn node_status_mut(&mut self, node: &str) -> Option<&mut NodeRollout> {
        self.status
            .node_statuses
            .iter_mut()
            .find(|status| status.node_name == node)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorSpec {
    #[serde(default)]
    pub management_state: ManagementState,
    #[serde(default)]
    pub log_level: String,
    #[serde(default)]
    pub observed_config: Value,
    #[serde(default)]
    pub unsupported_config_overrides: Value,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub force_redeployment_reason: String,
    /// Overrides the pruner's retention count for revisions that never
    /// failed when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub succeeded_revision_limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_revision_limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorStatus {
    #[serde(default)]
    pub observed_generation: u64,
    #[serde(default)]
    pub latest_available_revision: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub latest_available_revision_reason: String,
    #[serde(default)]
    pub node_statuses: Vec<NodeRollout>,
    #[serde(default)]
    pub conditions: Vec<OperatorCondition>,
    #[serde(default)]
    pub ready_replicas: u32,
}

/// Rollout progress of one control-plane node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRollout {
    pub node_name: String,
    #[serde(default)]
    pub current_revision: u64,
    #[serde(default)]
    pub target_revision: u64,
    #[serde(default)]
    pub last_failed_revision: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_failed_reason: String,
    #[serde(default)]
    pub last_failed_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failed_time: Option<DateTime<Utc>>,
}

impl NodeRollout {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            ..Self::default()
        }
    }

    /// Whether the current target has failed `max_retries` times.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.target_revision != 0
            && self.target_revision != self.current_revision
            && self.last_failed_revision == self.target_revision
            && self.last_failed_count >= max_retries
    }

    pub fn clear_failure(&mut self) {
        self.last_failed_revision = 0;
        self.last_failed_reason.clear();
        self.last_failed_count = 0;
        self.last_failed_time = None;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl OperatorCondition {
    pub fn new(
        condition_type: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type: condition_type.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
        }
    }

    /// Equality ignoring `lastTransitionTime`.
    pub fn same_state(&self, other: &OperatorCondition) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Aggregated, externally published health of the component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOperator {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: ClusterOperatorStatus,
}

impl_resource!(ClusterOperator, ResourceKind::ClusterOperator);

impl ClusterOperator {
    pub fn new() -> Self {
        Self {
            metadata: ObjectMeta::named(CLUSTER_OPERATOR_NAME),
            status: ClusterOperatorStatus::default(),
        }
    }

    pub fn condition(&self, condition_type: &str) -> Option<&OperatorCondition> {
        self.status
            .conditions
            .iter()
            .find(|condition| condition.condition_type == condition_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterOperatorStatus {
    #[serde(default)]
    pub conditions: Vec<OperatorCondition>,
    #[serde(default)]
    pub related_objects: Vec<ObjectReference>,
    #[serde(default)]
    pub versions: Vec<OperandVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub group: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl ObjectReference {
    pub fn new(group: &str, resource: &str, namespace: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            resource: resource.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandVersion {
    pub name: String,
    pub version: String,
}
