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
use std::fmt;

pub const NODE_LABEL: &str = "node";
const WORKLOAD_POD_PREFIX: &str = "kube-controller-manager-";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Pending => "Pending",
            TaskPhase::Running => "Running",
            TaskPhase::Succeeded => "Succeeded",
            TaskPhase::Failed => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Succeeded | TaskPhase::Failed)
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to materialize a revision on one node, executed out of process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallerTask {
    pub metadata: ObjectMeta,
    pub node_name: String,
    pub revision: u64,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub phase: TaskPhase,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub exit_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl_resource!(InstallerTask, ResourceKind::InstallerTask);

impl InstallerTask {
    pub fn new(namespace: &str, node_name: &str, revision: u64, attempt: u32) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(
                namespace,
                installer_task_name(revision, attempt, node_name),
            )
            .with_label(NODE_LABEL, node_name)
            .with_label(super::revision::REVISION_LABEL, revision.to_string()),
            node_name: node_name.to_string(),
            revision,
            attempt,
            phase: TaskPhase::Pending,
            exit_reason: String::new(),
            finished_at: None,
        }
    }
}

/// `installer-<revision>-<node>` for the first attempt,
/// `installer-<revision>-retry-<attempt>-<node>` afterwards.
pub fn installer_task_name(revision: u64, attempt: u32, node: &str) -> String {
    if attempt == 0 {
        format!("installer-{revision}-{node}")
    } else {
        format!("installer-{revision}-retry-{attempt}-{node}")
    }
}

/// Observed state of the static pod running on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadPod {
    pub metadata: ObjectMeta,
    pub node_name: String,
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub ready: bool,
}

impl_resource!(WorkloadPod, ResourceKind::WorkloadPod);

impl WorkloadPod {
    pub fn new(namespace: &str, node_name: &str, revision: u64, ready: bool) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, workload_pod_name(node_name))
                .with_label(NODE_LABEL, node_name),
            node_name: node_name.to_string(),
            revision,
            ready,
        }
    }
}

pub fn workload_pod_name(node: &str) -> String {
    format!("{WORKLOAD_POD_PREFIX}{node}")
}
