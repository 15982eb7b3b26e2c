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

//! Local stand-in for the out-of-process installer executor.
//!
//! Each [`step`](SimulatedInstaller::step) advances every unfinished
//! installer task by one phase (Pending, Running, then Succeeded or Failed)
//! and, on success, reports a ready mirror pod at the installed revision.

use crate::operator::k8s::installer::{workload_pod_name, InstallerTask, TaskPhase, WorkloadPod};
use crate::operator::k8s::store::{ClusterStore, StoreError, DEFAULT_UPDATE_ATTEMPTS};
use crate::operator::logger::{log_debug, log_warn};
use crate::operator::scheduler::{JobResult, ScheduleSpec, ScheduledTaskHandle, Scheduler};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "simulated-installer";

#[derive(Default)]
struct FailurePlan {
    nodes: BTreeSet<String>,
    revisions: BTreeSet<u64>,
}

impl FailurePlan {
    fn fails(&self, task: &InstallerTask) -> bool {
        self.nodes.contains(&task.node_name) || self.revisions.contains(&task.revision)
    }
}

#[derive(Clone)]
pub struct SimulatedInstaller {
    store: ClusterStore,
    namespace: String,
    failures: Arc<Mutex<FailurePlan>>,
}

impl SimulatedInstaller {
    pub fn new(store: ClusterStore, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            failures: Arc::new(Mutex::new(FailurePlan::default())),
        }
    }

    /// Every task on `node` fails until [`clear_failures`](Self::clear_failures).
    pub fn fail_node(&self, node: impl Into<String>) {
        self.plan().nodes.insert(node.into());
    }

    /// Every task for `revision` fails.
    pub fn fail_revision(&self, revision: u64) {
        self.plan().revisions.insert(revision);
    }

    pub fn clear_failures(&self) {
        *self.plan() = FailurePlan::default();
    }

    fn plan(&self) -> std::sync::MutexGuard<'_, FailurePlan> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advances every unfinished task by one phase. Returns how many tasks
    /// changed.
    pub fn step(&self) -> Result<usize, StoreError> {
        let tasks: Vec<InstallerTask> = self.store.list(Some(&self.namespace))?;
        let mut advanced = 0;
        for task in tasks.into_iter().filter(|task| !task.phase.is_terminal()) {
            let fails = self.plan().fails(&task);
            let next = match task.phase {
                TaskPhase::Pending => TaskPhase::Running,
                TaskPhase::Running if fails => TaskPhase::Failed,
                TaskPhase::Running => TaskPhase::Succeeded,
                TaskPhase::Succeeded | TaskPhase::Failed => continue,
            };
            self.store.update_with_retry::<InstallerTask, _>(
                Some(&self.namespace),
                &task.metadata.name,
                DEFAULT_UPDATE_ATTEMPTS,
                |current| {
                    current.phase = next;
                    if next == TaskPhase::Failed {
                        current.exit_reason = "simulated installer failure".to_string();
                    }
                    if next.is_terminal() {
                        current.finished_at = Some(Utc::now());
                    }
                },
            )?;
            log_debug(
                COMPONENT,
                "Advanced installer task",
                &[("task", task.metadata.name.as_str()), ("phase", next.as_str())],
            );
            if next == TaskPhase::Succeeded {
                self.report_pod(&task.node_name, task.revision)?;
            }
            advanced += 1;
        }
        Ok(advanced)
    }

    fn report_pod(&self, node: &str, revision: u64) -> Result<(), StoreError> {
        let pod = WorkloadPod::new(&self.namespace, node, revision, true);
        match self.store.create(&pod) {
            Ok(_) => return Ok(()),
            Err(StoreError::AlreadyExists(_)) => {}
            Err(err) => return Err(err),
        }
        self.store.update_with_retry::<WorkloadPod, _>(
            Some(&self.namespace),
            &workload_pod_name(node),
            DEFAULT_UPDATE_ATTEMPTS,
            |current| {
                current.revision = revision;
                current.ready = true;
            },
        )?;
        Ok(())
    }

    /// Steps every `period` until `token` is cancelled.
    pub fn spawn(&self, token: &CancellationToken, period: Duration) -> ScheduledTaskHandle {
        let installer = self.clone();
        Scheduler::global().schedule_child(
            token,
            ScheduleSpec::Interval {
                label: "simulated-installer",
                period,
            },
            move |_ctx| {
                let installer = installer.clone();
                Box::pin(async move {
                    if let Err(err) = installer.step() {
                        let error = err.to_string();
                        log_warn(COMPONENT, "Simulated installer step failed", &[("error", error.as_str())]);
                    }
                    JobResult::Continue
                })
            },
        )
    }
}
