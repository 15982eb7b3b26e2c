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

//! Wires the store, cache, change feed and controllers together and runs
//! them until cancelled.

use crate::operator::config::OperatorSettings;
use crate::operator::controller::configobserver::ConfigObserverController;
use crate::operator::controller::informer::ResourceCache;
use crate::operator::controller::installer::{InstallerController, InstallerSettings};
use crate::operator::controller::pruner::{PruneSettings, PrunerController};
use crate::operator::controller::reconcile::{run_controller, Controller};
use crate::operator::controller::resourcesync::{default_sync_rules, ResourceSyncController};
use crate::operator::controller::revision::RevisionController;
use crate::operator::controller::rollout::policy_for;
use crate::operator::controller::runtime::ExponentialBackoff;
use crate::operator::controller::simulator::SimulatedInstaller;
use crate::operator::controller::status::{MirrorPodProbe, StatusAggregator, StatusSettings};
use crate::operator::controller::targetconfig::TargetConfigController;
use crate::operator::controller::watch::{ChangeFeed, ChangeNotice};
use crate::operator::k8s::operator::{OperatorConfig, OPERATOR_CONFIG_NAME};
use crate::operator::k8s::store::{ClusterStore, StoreError, WatchScope};
use crate::operator::k8s::ResourceKind;
use crate::operator::logger::{self, log_error, log_info, log_warn, LogLevel};
use crate::operator::scheduler::{JobResult, ScheduleSpec, ScheduledTaskHandle, Scheduler};
use crate::operator::util::StartupError;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "orchestrator";
const SIMULATED_INSTALLER_PERIOD: Duration = Duration::from_millis(200);

#[derive(Clone)]
struct ControllerSet {
    config_observer: Arc<ConfigObserverController>,
    resource_sync: Arc<ResourceSyncController>,
    target_config: Arc<TargetConfigController>,
    revision: Arc<RevisionController>,
    installer: Arc<InstallerController>,
    pruner: Arc<PrunerController>,
    status: Arc<StatusAggregator>,
}

impl ControllerSet {
    fn all(&self) -> Vec<Arc<dyn Controller>> {
        vec![
            self.config_observer.clone(),
            self.resource_sync.clone(),
            self.target_config.clone(),
            self.revision.clone(),
            self.installer.clone(),
            self.pruner.clone(),
            self.status.clone(),
        ]
    }

    fn enqueue_all(&self) {
        self.config_observer.enqueue();
        self.resource_sync.enqueue_all();
        self.target_config.enqueue();
        self.revision.enqueue();
        enqueue_installer_nodes(&self.installer, "resync");
        self.pruner.enqueue();
        self.status.enqueue();
    }
}

pub struct Orchestrator {
    settings: OperatorSettings,
    store: ClusterStore,
    cache: ResourceCache,
    feed: ChangeFeed,
    controllers: ControllerSet,
    simulator: Option<SimulatedInstaller>,
}

impl Orchestrator {
    pub fn new(store: ClusterStore, settings: OperatorSettings) -> Self {
        let cache = ResourceCache::new(store.clone());
        let namespace = settings.target_namespace.clone();

        let resource_sync = Arc::new(ResourceSyncController::new(
            store.clone(),
            cache.clone(),
            default_sync_rules(&namespace),
        ));
        let config_observer = Arc::new(ConfigObserverController::new(
            store.clone(),
            cache.clone(),
            resource_sync.clone(),
            namespace.clone(),
        ));
        let target_config = Arc::new(TargetConfigController::new(
            store.clone(),
            cache.clone(),
            settings.image.clone(),
            settings.operator_version.clone(),
            namespace.clone(),
        ));
        let revision = Arc::new(RevisionController::new(store.clone(), cache.clone(), namespace.clone()));
        let installer = Arc::new(InstallerController::new(
            store.clone(),
            cache.clone(),
            policy_for(settings.rollout_strategy),
            InstallerSettings {
                max_retries: settings.max_installer_retries,
                backoff: ExponentialBackoff::new(
                    settings.installer_backoff_base,
                    settings.installer_backoff_max,
                ),
                poll_interval: settings.installer_poll_interval,
            },
            namespace.clone(),
        ));
        let pruner = Arc::new(PrunerController::new(
            store.clone(),
            cache.clone(),
            PruneSettings {
                retention: settings.revision_retention,
                min_age: settings.revision_min_age,
            },
            namespace.clone(),
        ));
        let status = Arc::new(StatusAggregator::new(
            store.clone(),
            cache.clone(),
            Box::new(MirrorPodProbe::new(cache.clone(), namespace.clone())),
            StatusSettings {
                quorum: settings.quorum,
                max_installer_retries: settings.max_installer_retries,
                operator_version: settings.operator_version.clone(),
            },
            namespace,
        ));

        let orchestrator = Self {
            feed: ChangeFeed::new(store.clone(), cache.clone()),
            settings,
            store,
            cache,
            controllers: ControllerSet {
                config_observer,
                resource_sync,
                target_config,
                revision,
                installer,
                pruner,
                status,
            },
            simulator: None,
        };
        orchestrator.register_handlers();
        orchestrator
    }

    /// Runs a [`SimulatedInstaller`] alongside the controllers.
    pub fn with_simulated_installer(mut self) -> Self {
        self.simulator = Some(SimulatedInstaller::new(
            self.store.clone(),
            self.settings.target_namespace.clone(),
        ));
        self
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn simulator(&self) -> Option<&SimulatedInstaller> {
        self.simulator.as_ref()
    }

    pub fn controllers(&self) -> Vec<Arc<dyn Controller>> {
        self.controllers.all()
    }

    /// Seeds the default operator config when the cluster has none.
    pub fn ensure_operator_config(&self) -> Result<(), StoreError> {
        if self
            .store
            .get::<OperatorConfig>(None, OPERATOR_CONFIG_NAME)?
            .is_some()
        {
            return Ok(());
        }
        match self.store.create(&OperatorConfig::default_cluster()) {
            Ok(_) => {
                log_info(COMPONENT, "Created default operator config", &[("name", OPERATOR_CONFIG_NAME)]);
                Ok(())
            }
            Err(StoreError::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Queues a full pass of every controller.
    pub fn enqueue_all(&self) {
        self.controllers.enqueue_all();
    }

    fn register_handlers(&self) {
        let namespace = self.settings.target_namespace.as_str();
        let set = &self.controllers;

        let (observer, target_config, revision, installer, status, cache) = (
            set.config_observer.clone(),
            set.target_config.clone(),
            set.revision.clone(),
            set.installer.clone(),
            set.status.clone(),
            self.cache.clone(),
        );
        self.feed.subscribe(
            WatchScope::new(ResourceKind::OperatorConfig, None),
            Arc::new(move |_notice: &ChangeNotice| {
                if let Ok(Some(config)) = cache.get::<OperatorConfig>(None, OPERATOR_CONFIG_NAME) {
                    logger::set_min_level(LogLevel::from_operator_log_level(&config.spec.log_level));
                }
                observer.enqueue();
                target_config.enqueue();
                revision.enqueue();
                enqueue_installer_nodes(&installer, "operator-config");
                status.enqueue();
            }),
        );

        for kind in [ResourceKind::Infrastructure, ResourceKind::Network] {
            let observer = set.config_observer.clone();
            self.feed.subscribe(
                WatchScope::new(kind, None),
                Arc::new(move |_notice: &ChangeNotice| observer.enqueue()),
            );
        }

        for kind in [ResourceKind::ConfigMap, ResourceKind::Secret] {
            let (sync, revision, target_config) = (
                set.resource_sync.clone(),
                set.revision.clone(),
                set.target_config.clone(),
            );
            self.feed.subscribe(
                WatchScope::new(kind, None),
                Arc::new(move |notice: &ChangeNotice| {
                    let Some(namespace) = notice.key.namespace.as_deref() else {
                        return;
                    };
                    for key in sync.keys_for(notice.key.kind, namespace, &notice.key.name) {
                        sync.queue().add(key);
                    }
                    if revision.is_input(notice.key.kind, namespace, &notice.key.name) {
                        revision.enqueue();
                    }
                    if notice.key.kind == ResourceKind::ConfigMap
                        && target_config.owns(namespace, &notice.key.name)
                    {
                        target_config.enqueue();
                    }
                }),
            );
        }

        let (installer, status) = (set.installer.clone(), set.status.clone());
        self.feed.subscribe(
            WatchScope::new(ResourceKind::Node, None),
            Arc::new(move |notice: &ChangeNotice| {
                installer.queue().add(notice.key.name.clone());
                status.enqueue();
            }),
        );

        let installer = set.installer.clone();
        self.feed.subscribe(
            WatchScope::new(ResourceKind::InstallerTask, Some(namespace)),
            Arc::new(move |notice: &ChangeNotice| {
                let namespace = notice.key.namespace.as_deref().unwrap_or_default();
                enqueue_installer_task(&installer, namespace, &notice.key.name);
            }),
        );

        let status = set.status.clone();
        self.feed.subscribe(
            WatchScope::new(ResourceKind::WorkloadPod, Some(namespace)),
            Arc::new(move |_notice: &ChangeNotice| status.enqueue()),
        );

        let (pruner, status) = (set.pruner.clone(), set.status.clone());
        self.feed.subscribe(
            WatchScope::new(ResourceKind::Revision, Some(namespace)),
            Arc::new(move |_notice: &ChangeNotice| {
                pruner.enqueue();
                status.enqueue();
            }),
        );
    }

    /// Starts every loop and blocks until `token` is cancelled, then waits
    /// for in-flight reconciles to finish.
    pub async fn run(&self, token: CancellationToken) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.ensure_operator_config()
            .map_err(|err| StartupError::new("failed to seed operator config", err))?;

        self.feed.start(&token);
        self.enqueue_all();

        let mut workers = Vec::new();
        for controller in self.controllers() {
            workers.extend(run_controller(controller, self.settings.workers, token.clone()));
        }

        let pruner = self.controllers.pruner.clone();
        let mut tasks = vec![schedule_interval(&token, "pruner", self.settings.prune_interval, move || {
            pruner.enqueue()
        })];
        let set = self.controllers.clone();
        tasks.push(schedule_interval(&token, "resync", self.settings.resync_interval, move || {
            set.enqueue_all()
        }));
        if let Some(simulator) = &self.simulator {
            tasks.push(simulator.spawn(&token, SIMULATED_INSTALLER_PERIOD));
        }

        let workers_label = self.settings.workers.to_string();
        log_info(
            COMPONENT,
            "Operator started",
            &[
                ("namespace", self.settings.target_namespace.as_str()),
                ("workers", workers_label.as_str()),
                ("rolloutPolicy", self.settings.rollout_strategy.as_str()),
            ],
        );

        token.cancelled().await;
        log_info(COMPONENT, "Shutting down", &[]);

        for task in &tasks {
            task.cancel();
        }
        for controller in self.controllers() {
            controller.queue().shut_down();
        }
        for worker in workers {
            if let Err(err) = worker.await {
                let error = err.to_string();
                log_error(COMPONENT, "Controller worker exited abnormally", &[("error", error.as_str())]);
            }
        }
        for task in &tasks {
            let _ = task.join().await;
        }
        self.feed.stop().await;
        log_info(COMPONENT, "Operator stopped", &[]);
        Ok(())
    }
}

/// Queues every control-plane node. A failed node list is retried by the
/// next resync tick.
fn enqueue_installer_nodes(installer: &InstallerController, trigger: &str) {
    if let Err(err) = installer.enqueue_all() {
        let error = err.to_string();
        log_warn(
            COMPONENT,
            "Failed to queue installer nodes",
            &[("trigger", trigger), ("error", error.as_str())],
        );
    }
}

fn enqueue_installer_task(installer: &InstallerController, namespace: &str, name: &str) {
    if let Err(err) = installer.enqueue_for_task(namespace, name) {
        let error = err.to_string();
        log_warn(
            COMPONENT,
            "Failed to resolve installer task node",
            &[("task", name), ("error", error.as_str())],
        );
        enqueue_installer_nodes(installer, "installer-task");
    }
}

fn schedule_interval(
    token: &CancellationToken,
    label: &'static str,
    period: Duration,
    tick: impl Fn() + Send + Sync + 'static,
) -> ScheduledTaskHandle {
    let tick = Arc::new(tick);
    Scheduler::global().schedule_child(token, ScheduleSpec::Interval { label, period }, move |_ctx| {
        let tick = Arc::clone(&tick);
        Box::pin(async move {
            tick();
            JobResult::Continue
        })
    })
}
