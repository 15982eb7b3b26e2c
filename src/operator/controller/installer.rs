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

//! Per-node rollout state machine.
//!
//! Each control-plane node has a [`NodeRollout`] in the operator status. The
//! controller moves a node's target to the latest revision, launches an
//! [`InstallerTask`] for it, and folds the task's terminal phase back into the
//! rollout. Failed installs are retried with exponential backoff until the
//! retry budget is spent; a newer revision supersedes an exhausted target.
//!
//! Status is always written before the task is created, so a crash between
//! the two leaves a target without a task, which the next pass launches.

use crate::operator::controller::conditions::{set_degraded, ConditionReason, OperatorConditionKind};
use crate::operator::controller::informer::ResourceCache;
use crate::operator::controller::reconcile::{Controller, ControllerError, ReconcileOutcome};
use crate::operator::controller::rollout::RolloutPolicy;
use crate::operator::controller::runtime::{ExponentialBackoff, WorkQueue};
use crate::operator::k8s::installer::{InstallerTask, TaskPhase};
use crate::operator::k8s::node::Node;
use crate::operator::k8s::operator::{
    ManagementState, NodeRollout, OperatorConfig, OPERATOR_CONFIG_NAME,
};
use crate::operator::k8s::store::{ClusterStore, StoreError, DEFAULT_UPDATE_ATTEMPTS};
use crate::operator::logger::{log_info, log_warn};
use crate::operator::observability::metrics::{self, InstallerTaskResult};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;

const CONTROLLER_NAME: &str = "installer";

/// Passes of plan-and-apply per reconcile, so a recorded task result is
/// followed by the next launch in the same pass.
const MAX_STEPS_PER_PASS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstallerSettings {
    pub max_retries: u32,
    pub backoff: ExponentialBackoff,
    pub poll_interval: Duration,
}

impl Default for InstallerSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(300)),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// The single action a reconcile pass takes for a node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeStep {
    /// Current equals target equals latest.
    Noop,
    /// Set target to `revision` and create the installer task for `attempt`.
    Launch { revision: u64, attempt: u32 },
    /// A task is in flight or a retry backoff has not elapsed.
    Wait(Duration),
    MarkSucceeded { revision: u64 },
    MarkFailed {
        revision: u64,
        attempt: u32,
        reason: String,
    },
    /// Retries for the target are spent; waiting for a newer revision.
    Exhausted,
    /// The rollout policy holds this node back.
    Blocked,
}

/// Decides the next step for `rollout` from its installer tasks.
///
/// `tasks` are the node's tasks; `rollouts` is every node's rollout, which the
/// policy consults before a new target is started.
pub fn plan_node(
    rollout: &NodeRollout,
    latest: u64,
    tasks: &[InstallerTask],
    rollouts: &[NodeRollout],
    policy: &dyn RolloutPolicy,
    settings: &InstallerSettings,
    now: DateTime<Utc>,
) -> NodeStep {
    if tasks.iter().any(|task| !task.phase.is_terminal()) {
        return NodeStep::Wait(settings.poll_interval);
    }

    let target = rollout.target_revision;
    if target != 0 && target != rollout.current_revision {
        let newest_attempt = tasks
            .iter()
            .filter(|task| task.revision == target)
            .max_by_key(|task| task.attempt);
        if let Some(task) = newest_attempt {
            match task.phase {
                TaskPhase::Succeeded => return NodeStep::MarkSucceeded { revision: target },
                TaskPhase::Failed => {
                    let recorded = rollout.last_failed_revision == target
                        && rollout.last_failed_count > task.attempt;
                    if !recorded {
                        let reason = if task.exit_reason.is_empty() {
                            "installer failed".to_string()
                        } else {
                            task.exit_reason.clone()
                        };
                        return NodeStep::MarkFailed {
                            revision: target,
                            attempt: task.attempt,
                            reason,
                        };
                    }
                }
                TaskPhase::Pending | TaskPhase::Running => {}
            }
        }
    }

    if latest > target {
        return if policy.may_start(&rollout.node_name, rollouts) {
            NodeStep::Launch {
                revision: latest,
                attempt: 0,
            }
        } else {
            NodeStep::Blocked
        };
    }

    if target == 0 || target == rollout.current_revision {
        return NodeStep::Noop;
    }

    if rollout.is_exhausted(settings.max_retries) {
        return NodeStep::Exhausted;
    }

    if rollout.last_failed_revision != target || rollout.last_failed_count == 0 {
        // Target was set but its first task was never created.
        return NodeStep::Launch {
            revision: target,
            attempt: 0,
        };
    }

    let backoff = settings.backoff.delay(rollout.last_failed_count);
    let elapsed = rollout
        .last_failed_time
        .and_then(|failed_at| (now - failed_at).to_std().ok())
        .unwrap_or(backoff);
    if elapsed < backoff {
        return NodeStep::Wait(backoff - elapsed);
    }
    NodeStep::Launch {
        revision: target,
        attempt: rollout.last_failed_count,
    }
}

/// Applies the status half of `step` to `rollout`.
fn apply_step(rollout: &mut NodeRollout, step: &NodeStep, now: DateTime<Utc>) {
    match step {
        NodeStep::Launch { revision, .. } => rollout.target_revision = *revision,
        NodeStep::MarkSucceeded { revision } => {
            rollout.current_revision = *revision;
            rollout.clear_failure();
        }
        NodeStep::MarkFailed {
            revision,
            attempt,
            reason,
        } => {
            if rollout.last_failed_revision != *revision {
                rollout.last_failed_revision = *revision;
                rollout.last_failed_count = 0;
            }
            rollout.last_failed_count = rollout.last_failed_count.max(attempt + 1);
            rollout.last_failed_reason = reason.clone();
            rollout.last_failed_time = Some(now);
        }
        NodeStep::Noop | NodeStep::Wait(_) | NodeStep::Exhausted | NodeStep::Blocked => {}
    }
}

/// Adds rollouts for new control-plane nodes and drops departed ones.
/// Returns the names of removed nodes.
pub fn sync_membership(rollouts: &mut Vec<NodeRollout>, nodes: &BTreeSet<String>) -> Vec<String> {
    let mut removed = Vec::new();
    rollouts.retain(|rollout| {
        let keep = nodes.contains(&rollout.node_name);
        if !keep {
            removed.push(rollout.node_name.clone());
        }
        keep
    });
    for node in nodes {
        if !rollouts.iter().any(|rollout| &rollout.node_name == node) {
            rollouts.push(NodeRollout::new(node.clone()));
        }
    }
    rollouts.sort_by(|a, b| a.node_name.cmp(&b.node_name));
    removed
}

/// Message for `NodeInstallerDegraded`, or `None` when no node is exhausted.
pub fn exhausted_message(rollouts: &[NodeRollout], max_retries: u32) -> Option<String> {
    let exhausted: Vec<String> = rollouts
        .iter()
        .filter(|rollout| rollout.is_exhausted(max_retries))
        .map(|rollout| {
            format!(
                "node {} failed revision {} {} times: {}",
                rollout.node_name,
                rollout.target_revision,
                rollout.last_failed_count,
                rollout.last_failed_reason
            )
        })
        .collect();
    (!exhausted.is_empty()).then(|| exhausted.join("; "))
}

pub struct InstallerController {
    store: ClusterStore,
    cache: ResourceCache,
    queue: WorkQueue<String>,
    policy: Box<dyn RolloutPolicy>,
    settings: InstallerSettings,
    target_namespace: String,
}

impl InstallerController {
    pub fn new(
        store: ClusterStore,
        cache: ResourceCache,
        policy: Box<dyn RolloutPolicy>,
        settings: InstallerSettings,
        target_namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            queue: WorkQueue::new(CONTROLLER_NAME),
            policy,
            settings,
            target_namespace: target_namespace.into(),
        }
    }

    pub fn settings(&self) -> &InstallerSettings {
        &self.settings
    }

    fn control_plane_nodes(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .cache
            .list::<Node>(None)?
            .into_iter()
            .filter(Node::is_control_plane)
            .map(|node| node.metadata.name)
            .collect())
    }

    /// Queues every control-plane node.
    pub fn enqueue_all(&self) -> Result<(), StoreError> {
        for node in self.control_plane_nodes()? {
            self.queue.add(node);
        }
        Ok(())
    }

    /// Queues the node an installer task belongs to, or every node when the
    /// task is no longer readable.
    pub fn enqueue_for_task(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self.cache.get::<InstallerTask>(Some(namespace), name)? {
            Some(task) => self.queue.add(task.node_name),
            None => self.enqueue_all()?,
        }
        Ok(())
    }

    fn node_tasks(&self, node: &str) -> Result<Vec<InstallerTask>, StoreError> {
        Ok(self
            .store
            .list::<InstallerTask>(Some(&self.target_namespace))?
            .into_iter()
            .filter(|task| task.node_name == node)
            .collect())
    }

    /// Plans and records one step for `node` in a single status write.
    fn step(
        &self,
        node: &str,
        nodes: &BTreeSet<String>,
        tasks: &[InstallerTask],
    ) -> Result<(NodeStep, Vec<String>), StoreError> {
        let now = Utc::now();
        let mut planned = NodeStep::Noop;
        let mut removed = Vec::new();
        let outcome = self.store.update_with_retry::<OperatorConfig, _>(
            None,
            OPERATOR_CONFIG_NAME,
            DEFAULT_UPDATE_ATTEMPTS,
            |config| {
                removed = sync_membership(&mut config.status.node_statuses, nodes);
                let latest = config.status.latest_available_revision;
                planned = match config.node_status(node) {
                    Some(rollout) => plan_node(
                        rollout,
                        latest,
                        tasks,
                        &config.status.node_statuses,
                        self.policy.as_ref(),
                        &self.settings,
                        now,
                    ),
                    None => NodeStep::Noop,
                };
                if let Some(rollout) = config.node_status_mut(node) {
                    apply_step(rollout, &planned, now);
                }
                let message = exhausted_message(&config.status.node_statuses, self.settings.max_retries);
                let failure = message
                    .as_deref()
                    .map(|message| (ConditionReason::InstallerRetriesExhausted.as_str(), message));
                set_degraded(
                    &mut config.status.conditions,
                    OperatorConditionKind::NodeInstallerDegraded,
                    failure,
                    now,
                );
            },
        )?;
        if let Some(rollout) = outcome.into_inner().node_status(node) {
            if matches!(planned, NodeStep::MarkFailed { .. })
                && rollout.is_exhausted(self.settings.max_retries)
            {
                metrics::record_installer_task(InstallerTaskResult::Exhausted);
                log_warn(
                    CONTROLLER_NAME,
                    "Installer retries exhausted",
                    &[("node", node), ("reason", rollout.last_failed_reason.as_str())],
                );
            }
        }
        Ok((planned, removed))
    }

    fn launch(&self, node: &str, revision: u64, attempt: u32) -> Result<(), StoreError> {
        let task = InstallerTask::new(&self.target_namespace, node, revision, attempt);
        match self.store.create(&task) {
            Ok(_) => {
                metrics::record_installer_task(InstallerTaskResult::Launched);
                let revision_label = revision.to_string();
                let attempt_label = attempt.to_string();
                log_info(
                    CONTROLLER_NAME,
                    "Launched installer",
                    &[
                        ("node", node),
                        ("revision", revision_label.as_str()),
                        ("attempt", attempt_label.as_str()),
                        ("task", task.metadata.name.as_str()),
                    ],
                );
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl Controller for InstallerController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    fn reconcile(&self, node: &str) -> Result<ReconcileOutcome, ControllerError> {
        let config: Option<OperatorConfig> = self.cache.get(None, OPERATOR_CONFIG_NAME)?;
        let Some(config) = config else {
            return Err(ControllerError::Dependency(format!(
                "operator config {OPERATOR_CONFIG_NAME} not found"
            )));
        };
        if config.spec.management_state != ManagementState::Managed {
            return Ok(ReconcileOutcome::Done);
        }

        let nodes = self.control_plane_nodes()?;
        let tasks = self.node_tasks(node)?;
        for _ in 0..MAX_STEPS_PER_PASS {
            let (step, removed) = self.step(node, &nodes, &tasks)?;
            for departed in removed {
                metrics::clear_node(&departed);
                log_info(CONTROLLER_NAME, "Node left the rollout", &[("node", departed.as_str())]);
            }
            match step {
                NodeStep::Launch { revision, attempt } => {
                    self.launch(node, revision, attempt)?;
                    return Ok(ReconcileOutcome::RequeueAfter(self.settings.poll_interval));
                }
                NodeStep::Wait(delay) => return Ok(ReconcileOutcome::RequeueAfter(delay)),
                NodeStep::MarkSucceeded { revision } => {
                    metrics::record_installer_task(InstallerTaskResult::Succeeded);
                    metrics::set_node_current_revision(node, revision);
                    let revision_label = revision.to_string();
                    log_info(
                        CONTROLLER_NAME,
                        "Node reached revision",
                        &[("node", node), ("revision", revision_label.as_str())],
                    );
                    // Serial rollouts may now start another node.
                    for other in nodes.iter().filter(|other| other.as_str() != node) {
                        self.queue.add(other.clone());
                    }
                }
                NodeStep::MarkFailed { revision, attempt, ref reason } => {
                    metrics::record_installer_task(InstallerTaskResult::Failed);
                    let revision_label = revision.to_string();
                    let attempt_label = attempt.to_string();
                    log_warn(
                        CONTROLLER_NAME,
                        "Installer failed",
                        &[
                            ("node", node),
                            ("revision", revision_label.as_str()),
                            ("attempt", attempt_label.as_str()),
                            ("reason", reason.as_str()),
                        ],
                    );
                }
                NodeStep::Noop | NodeStep::Exhausted | NodeStep::Blocked => {
                    return Ok(ReconcileOutcome::Done)
                }
            }
        }
        Ok(ReconcileOutcome::Done)
    }
}
