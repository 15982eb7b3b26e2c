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
use crate::operator::controller::reconcile::{Controller, ControllerError, ReconcileOutcome};
use crate::operator::controller::runtime::WorkQueue;
use crate::operator::k8s::installer::InstallerTask;
use crate::operator::k8s::operator::{ManagementState, OperatorConfig, OPERATOR_CONFIG_NAME};
use crate::operator::k8s::revision::Revision;
use crate::operator::k8s::store::{ClusterStore, StoreError};
use crate::operator::logger::{log_debug, log_info};
use crate::operator::observability::metrics;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;

const CONTROLLER_NAME: &str = "pruner";

pub const PRUNE_KEY: &str = "prune";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PruneSettings {
    /// Unreferenced revisions kept per group (succeeded and failed).
    pub retention: usize,
    /// Revisions younger than this are never deleted.
    pub min_age: Duration,
}

impl Default for PruneSettings {
    fn default() -> Self {
        Self {
            retention: 5,
            min_age: Duration::ZERO,
        }
    }
}

/// Revision numbers that must survive pruning: every node's current and
/// target revision, the published latest, and the newest existing revision.
pub fn protected_revisions(config: &OperatorConfig, revisions: &[Revision]) -> BTreeSet<u64> {
    let mut protected: BTreeSet<u64> = config
        .status
        .node_statuses
        .iter()
        .flat_map(|rollout| [rollout.current_revision, rollout.target_revision])
        .collect();
    protected.insert(config.status.latest_available_revision);
    if let Some(newest) = revisions.iter().map(|revision| revision.number).max() {
        protected.insert(newest);
    }
    protected.remove(&0);
    protected
}

/// Revisions some node failed to install.
pub fn failed_revisions(config: &OperatorConfig) -> BTreeSet<u64> {
    config
        .status
        .node_statuses
        .iter()
        .map(|rollout| rollout.last_failed_revision)
        .filter(|revision| *revision != 0)
        .collect()
}

/// Picks the revisions to delete, oldest first.
///
/// Unprotected revisions are split into failed and succeeded groups; the
/// newest `failed_limit` / `succeeded_limit` of each are kept. Candidates
/// younger than `min_age` are skipped.
pub fn plan_prune(
    revisions: &[Revision],
    protected: &BTreeSet<u64>,
    failed: &BTreeSet<u64>,
    succeeded_limit: usize,
    failed_limit: usize,
    min_age: Duration,
    now: DateTime<Utc>,
) -> Vec<u64> {
    let mut unprotected: Vec<&Revision> = revisions
        .iter()
        .filter(|revision| !protected.contains(&revision.number))
        .collect();
    unprotected.sort_by_key(|revision| revision.number);

    let (failed_group, succeeded_group): (Vec<&Revision>, Vec<&Revision>) = unprotected
        .into_iter()
        .partition(|revision| failed.contains(&revision.number));

    let mut doomed: Vec<&Revision> = Vec::new();
    for (group, limit) in [(failed_group, failed_limit), (succeeded_group, succeeded_limit)] {
        let excess = group.len().saturating_sub(limit);
        doomed.extend(group.into_iter().take(excess));
    }
    doomed.sort_by_key(|revision| revision.number);
    doomed
        .into_iter()
        .filter(|revision| {
            (now - revision.created_at)
                .to_std()
                .map(|age| age >= min_age)
                .unwrap_or(min_age.is_zero())
        })
        .map(|revision| revision.number)
        .collect()
}

pub struct PrunerController {
    store: ClusterStore,
    cache: ResourceCache,
    queue: WorkQueue<String>,
    settings: PruneSettings,
    target_namespace: String,
}

impl PrunerController {
    pub fn new(
        store: ClusterStore,
        cache: ResourceCache,
        settings: PruneSettings,
        target_namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            queue: WorkQueue::new(CONTROLLER_NAME),
            settings,
            target_namespace: target_namespace.into(),
        }
    }

    pub fn enqueue(&self) {
        self.queue.add(PRUNE_KEY.to_string());
    }

    /// Deletes one revision after re-checking protection against a live read
    /// of the operator status. Returns whether it was deleted.
    fn prune_revision(&self, revision: &Revision) -> Result<bool, StoreError> {
        let live: Option<OperatorConfig> = self.store.get(None, OPERATOR_CONFIG_NAME)?;
        let Some(live) = live else {
            return Ok(false);
        };
        let revisions: Vec<Revision> = self.store.list(Some(&self.target_namespace))?;
        if protected_revisions(&live, &revisions).contains(&revision.number) {
            let number = revision.number.to_string();
            log_debug(CONTROLLER_NAME, "Revision became protected; keeping", &[("revision", number.as_str())]);
            return Ok(false);
        }

        match self.store.delete::<Revision>(
            Some(&self.target_namespace),
            &revision.metadata.name,
            revision.metadata.resource_version.as_deref(),
        ) {
            Ok(()) => {}
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        }

        let tasks: Vec<InstallerTask> = self.store.list(Some(&self.target_namespace))?;
        for task in tasks.iter().filter(|task| task.revision == revision.number) {
            match self
                .store
                .delete::<InstallerTask>(Some(&self.target_namespace), &task.metadata.name, None)
            {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }
}

impl Controller for PrunerController {
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
        if config.spec.management_state != ManagementState::Managed {
            return Ok(ReconcileOutcome::Done);
        }

        let revisions: Vec<Revision> = self.store.list(Some(&self.target_namespace))?;
        let protected = protected_revisions(&config, &revisions);
        let candidates = plan_prune(
            &revisions,
            &protected,
            &failed_revisions(&config),
            config
                .spec
                .succeeded_revision_limit
                .unwrap_or(self.settings.retention),
            config
                .spec
                .failed_revision_limit
                .unwrap_or(self.settings.retention),
            self.settings.min_age,
            Utc::now(),
        );

        let mut pruned = Vec::new();
        for number in candidates {
            let Some(revision) = revisions.iter().find(|revision| revision.number == number) else {
                continue;
            };
            if self.prune_revision(revision)? {
                pruned.push(number.to_string());
            }
        }
        if !pruned.is_empty() {
            metrics::record_revisions_pruned(pruned.len());
            let list = pruned.join(",");
            log_info(CONTROLLER_NAME, "Pruned revisions", &[("revisions", list.as_str())]);
        }
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::k8s::operator::NodeRollout;
    use crate::operator::k8s::revision::RevisionSnapshot;
    use chrono::Duration as ChronoDuration;

    const NS: &str = "ns";

    fn revision(number: u64, age_secs: i64) -> Revision {
        let mut revision = Revision::new(NS, number, format!("h{number}"), String::new(), RevisionSnapshot::default());
        revision.created_at = Utc::now() - ChronoDuration::seconds(age_secs);
        revision
    }

    fn numbers(revisions: &[u64]) -> BTreeSet<u64> {
        revisions.iter().copied().collect()
    }

    #[test]
    fn keeps_newest_unprotected_and_deletes_oldest_first() {
        let revisions: Vec<Revision> = (1..=10).map(|n| revision(n, 600)).collect();
        let protected = numbers(&[10]);
        let doomed = plan_prune(&revisions, &protected, &BTreeSet::new(), 3, 3, Duration::ZERO, Utc::now());
        assert_eq!(doomed, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn protected_revisions_are_never_candidates() {
        let revisions: Vec<Revision> = (1..=6).map(|n| revision(n, 600)).collect();
        let protected = numbers(&[2, 6]);
        let doomed = plan_prune(&revisions, &protected, &BTreeSet::new(), 0, 0, Duration::ZERO, Utc::now());
        assert_eq!(doomed, vec![1, 3, 4, 5]);
    }

    #[test]
    fn young_revisions_are_skipped() {
        let revisions = vec![revision(1, 10), revision(2, 600), revision(3, 600)];
        let doomed = plan_prune(
            &revisions,
            &numbers(&[3]),
            &BTreeSet::new(),
            0,
            0,
            Duration::from_secs(60),
            Utc::now(),
        );
        assert_eq!(doomed, vec![2]);
    }

    #[test]
    fn failed_revisions_have_their_own_limit() {
        let revisions: Vec<Revision> = (1..=6).map(|n| revision(n, 600)).collect();
        let doomed = plan_prune(
            &revisions,
            &numbers(&[6]),
            &numbers(&[2, 4]),
            1,
            1,
            Duration::ZERO,
            Utc::now(),
        );
        assert_eq!(doomed, vec![1, 2, 3]);
    }

    #[test]
    fn protection_covers_nodes_latest_and_newest() {
        let mut config = OperatorConfig::default_cluster();
        config.status.latest_available_revision = 4;
        config.status.node_statuses = vec![NodeRollout {
            current_revision: 2,
            target_revision: 3,
            ..NodeRollout::new("a")
        }];
        let revisions: Vec<Revision> = (1..=5).map(|n| revision(n, 600)).collect();
        assert_eq!(protected_revisions(&config, &revisions), numbers(&[2, 3, 4, 5]));
    }

    #[test]
    fn controller_deletes_revisions_and_their_tasks() {
        let store = ClusterStore::new();
        let mut config = OperatorConfig::default_cluster();
        config.status.latest_available_revision = 4;
        config.status.node_statuses = vec![NodeRollout {
            current_revision: 4,
            target_revision: 4,
            ..NodeRollout::new("a")
        }];
        store.create(&config).unwrap();
        for n in 1..=4 {
            store.create(&revision(n, 600)).unwrap();
            store.create(&InstallerTask::new(NS, "a", n, 0)).unwrap();
        }
        let controller = PrunerController::new(
            store.clone(),
            ResourceCache::new(store.clone()),
            PruneSettings {
                retention: 1,
                min_age: Duration::ZERO,
            },
            NS,
        );
        controller.reconcile(PRUNE_KEY).unwrap();

        let remaining: Vec<u64> = store
            .list::<Revision>(Some(NS))
            .unwrap()
            .into_iter()
            .map(|revision| revision.number)
            .collect();
        assert_eq!(remaining, vec![3, 4]);
        let tasks = store.list::<InstallerTask>(Some(NS)).unwrap();
        assert!(tasks.iter().all(|task| task.revision >= 3));

        let writes = store.write_count();
        controller.reconcile(PRUNE_KEY).unwrap();
        assert_eq!(store.write_count(), writes);
    }
}
