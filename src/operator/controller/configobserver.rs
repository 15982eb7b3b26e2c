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

//! Derives `spec.observedConfig` of the operator config from cluster-wide
//! configuration objects.
//!
//! Each [`ConfigObserverFn`] owns a fixed set of paths in the observed
//! config. A successful observation replaces exactly those paths; a failed
//! one leaves them as they were, so a transient problem never erases
//! previously observed values.

use crate::operator::controller::conditions::{set_degraded, ConditionReason, OperatorConditionKind};
use crate::operator::controller::informer::ResourceCache;
use crate::operator::controller::reconcile::{Controller, ControllerError, ReconcileOutcome};
use crate::operator::controller::resourcesync::{ResourceLocation, ResourceSyncer};
use crate::operator::controller::runtime::WorkQueue;
use crate::operator::k8s::cluster::{Infrastructure, Network, CLUSTER_CONFIG_NAME};
use crate::operator::k8s::operator::{
    ManagementState, OperatorConfig, GLOBAL_USER_CONFIG_NAMESPACE, OPERATOR_CONFIG_NAME,
};
use crate::operator::k8s::store::{ClusterStore, StoreError, DEFAULT_UPDATE_ATTEMPTS};
use crate::operator::logger::{log_info, log_warn};
use crate::operator::util::json::{as_object_or_empty, get_path, remove_path, set_path};
use chrono::Utc;
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;

const CONTROLLER_NAME: &str = "config-observer";

/// Queue key of the single observation pass.
pub const OBSERVER_KEY: &str = "cluster";

pub const CLOUD_CONFIG_NAME: &str = "cloud-config";
const CLOUD_CONFIG_DIR: &str = "/etc/kubernetes/static-pod-resources/configmaps/cloud-config";
const DEFAULT_CLOUD_CONFIG_KEY: &str = "config";

type Path = &'static [&'static str];

/// Inputs available to observer functions.
pub struct ObserverContext<'a> {
    pub cache: &'a ResourceCache,
    pub syncer: &'a dyn ResourceSyncer,
    pub target_namespace: &'a str,
}

pub trait ConfigObserverFn: Send + Sync {
    fn name(&self) -> &'static str;

    /// Paths in the observed config this observer is authoritative for.
    fn owned_paths(&self) -> &'static [Path];

    /// Returns a fragment containing values for some or all owned paths.
    /// Paths absent from the fragment are removed from the observed config.
    fn observe(&self, ctx: &ObserverContext<'_>) -> Result<Value, String>;
}

pub struct CloudProviderObserver;

const CLOUD_PROVIDER_PATH: Path = &["extendedArguments", "cloud-provider"];

impl ConfigObserverFn for CloudProviderObserver {
    fn name(&self) -> &'static str {
        "cloud-provider"
    }

    fn owned_paths(&self) -> &'static [Path] {
        &[CLOUD_PROVIDER_PATH]
    }

    fn observe(&self, ctx: &ObserverContext<'_>) -> Result<Value, String> {
        let mut fragment = json!({});
        let infrastructure: Option<Infrastructure> = ctx
            .cache
            .get(None, CLUSTER_CONFIG_NAME)
            .map_err(|err| err.to_string())?;
        let Some(infrastructure) = infrastructure else {
            return Ok(fragment);
        };
        if let Some(provider) = cloud_provider_for(&infrastructure.platform)? {
            set_path(&mut fragment, CLOUD_PROVIDER_PATH, json!([provider]));
        }
        Ok(fragment)
    }
}

/// Maps an infrastructure platform to the `--cloud-provider` value.
pub fn cloud_provider_for(platform: &str) -> Result<Option<&'static str>, String> {
    match platform {
        "AWS" => Ok(Some("aws")),
        "Azure" => Ok(Some("azure")),
        "GCP" => Ok(Some("gce")),
        "OpenStack" => Ok(Some("openstack")),
        "VSphere" => Ok(Some("vsphere")),
        "" | "None" | "BareMetal" | "Libvirt" => Ok(None),
        other => Err(format!("unsupported platform {other:?}")),
    }
}

pub struct CloudConfigObserver;

const CLOUD_CONFIG_PATH: Path = &["extendedArguments", "cloud-config"];

impl ConfigObserverFn for CloudConfigObserver {
    fn name(&self) -> &'static str {
        "cloud-config"
    }

    fn owned_paths(&self) -> &'static [Path] {
        &[CLOUD_CONFIG_PATH]
    }

    fn observe(&self, ctx: &ObserverContext<'_>) -> Result<Value, String> {
        let mut fragment = json!({});
        let destination = ResourceLocation::new(ctx.target_namespace, CLOUD_CONFIG_NAME);
        let infrastructure: Option<Infrastructure> = ctx
            .cache
            .get(None, CLUSTER_CONFIG_NAME)
            .map_err(|err| err.to_string())?;
        let reference = infrastructure
            .and_then(|infrastructure| infrastructure.cloud_config)
            .filter(|reference| !reference.name.is_empty());

        let Some(reference) = reference else {
            ctx.syncer.sync_config_map(destination, None);
            return Ok(fragment);
        };

        let namespace = reference
            .namespace
            .clone()
            .filter(|namespace| !namespace.is_empty())
            .unwrap_or_else(|| GLOBAL_USER_CONFIG_NAMESPACE.to_string());
        ctx.syncer.sync_config_map(
            destination,
            Some(ResourceLocation::new(namespace, reference.name.clone())),
        );
        let key = if reference.key.is_empty() {
            DEFAULT_CLOUD_CONFIG_KEY
        } else {
            reference.key.as_str()
        };
        set_path(
            &mut fragment,
            CLOUD_CONFIG_PATH,
            json!([format!("{CLOUD_CONFIG_DIR}/{key}")]),
        );
        Ok(fragment)
    }
}

pub struct NetworkObserver;

const CLUSTER_CIDR_PATH: Path = &["extendedArguments", "cluster-cidr"];
const SERVICE_CIDR_PATH: Path = &["extendedArguments", "service-cluster-ip-range"];

impl ConfigObserverFn for NetworkObserver {
    fn name(&self) -> &'static str {
        "network"
    }

    fn owned_paths(&self) -> &'static [Path] {
        &[CLUSTER_CIDR_PATH, SERVICE_CIDR_PATH]
    }

    fn observe(&self, ctx: &ObserverContext<'_>) -> Result<Value, String> {
        let mut fragment = json!({});
        let network: Option<Network> = ctx
            .cache
            .get(None, CLUSTER_CONFIG_NAME)
            .map_err(|err| err.to_string())?;
        let Some(network) = network else {
            return Ok(fragment);
        };
        for (path, entries, label) in [
            (CLUSTER_CIDR_PATH, &network.cluster_network, "clusterNetwork"),
            (SERVICE_CIDR_PATH, &network.service_network, "serviceNetwork"),
        ] {
            if let Some(cidr) = entries.first() {
                validate_cidr(cidr).map_err(|reason| format!("{label}: {reason}"))?;
                set_path(&mut fragment, path, json!([cidr]));
            }
        }
        Ok(fragment)
    }
}

pub fn validate_cidr(value: &str) -> Result<(), String> {
    let (address, prefix) = value
        .split_once('/')
        .ok_or_else(|| format!("{value:?} is not in CIDR notation"))?;
    let address: IpAddr = address
        .parse()
        .map_err(|_| format!("{value:?} has an invalid address"))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| format!("{value:?} has an invalid prefix length"))?;
    let max = if address.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(format!("{value:?} prefix length exceeds {max}"));
    }
    Ok(())
}

pub fn default_observers() -> Vec<Box<dyn ConfigObserverFn>> {
    vec![
        Box::new(CloudProviderObserver),
        Box::new(CloudConfigObserver),
        Box::new(NetworkObserver),
    ]
}

struct Observation {
    paths: &'static [Path],
    result: Result<Value, String>,
}

/// Replaces owned paths of `existing` with the successful observations.
fn merge_observations(existing: &Value, observations: &[Observation]) -> Value {
    let mut merged = as_object_or_empty(existing);
    for observation in observations {
        let Ok(fragment) = &observation.result else {
            continue;
        };
        for path in observation.paths {
            remove_path(&mut merged, path);
            if let Some(value) = get_path(fragment, path) {
                set_path(&mut merged, path, value.clone());
            }
        }
    }
    merged
}

pub struct ConfigObserverController {
    store: ClusterStore,
    cache: ResourceCache,
    queue: WorkQueue<String>,
    syncer: Arc<dyn ResourceSyncer>,
    observers: Vec<Box<dyn ConfigObserverFn>>,
    target_namespace: String,
}

impl ConfigObserverController {
    pub fn new(
        store: ClusterStore,
        cache: ResourceCache,
        syncer: Arc<dyn ResourceSyncer>,
        target_namespace: impl Into<String>,
    ) -> Self {
        Self::with_observers(store, cache, syncer, target_namespace, default_observers())
    }

    pub fn with_observers(
        store: ClusterStore,
        cache: ResourceCache,
        syncer: Arc<dyn ResourceSyncer>,
        target_namespace: impl Into<String>,
        observers: Vec<Box<dyn ConfigObserverFn>>,
    ) -> Self {
        Self {
            store,
            cache,
            queue: WorkQueue::new(CONTROLLER_NAME),
            syncer,
            observers,
            target_namespace: target_namespace.into(),
        }
    }

    pub fn enqueue(&self) {
        self.queue.add(OBSERVER_KEY.to_string());
    }
}

impl Controller for ConfigObserverController {
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

        let ctx = ObserverContext {
            cache: &self.cache,
            syncer: self.syncer.as_ref(),
            target_namespace: &self.target_namespace,
        };
        let observations: Vec<Observation> = self
            .observers
            .iter()
            .map(|observer| Observation {
                paths: observer.owned_paths(),
                result: observer
                    .observe(&ctx)
                    .map_err(|err| format!("{}: {}", observer.name(), err)),
            })
            .collect();
        let errors: Vec<&str> = observations
            .iter()
            .filter_map(|observation| observation.result.as_ref().err().map(String::as_str))
            .collect();
        let message = errors.join("; ");
        for error in &errors {
            log_warn(CONTROLLER_NAME, "Config observation failed", &[("error", *error)]);
        }

        let now = Utc::now();
        let outcome = self.store.update_with_retry::<OperatorConfig, _>(
            None,
            OPERATOR_CONFIG_NAME,
            DEFAULT_UPDATE_ATTEMPTS,
            |config| {
                config.spec.observed_config =
                    merge_observations(&config.spec.observed_config, &observations);
                let failure = (!errors.is_empty())
                    .then_some((ConditionReason::Error.as_str(), message.as_str()));
                set_degraded(
                    &mut config.status.conditions,
                    OperatorConditionKind::ConfigObservationDegraded,
                    failure,
                    now,
                );
            },
        );
        match outcome {
            Ok(outcome) => {
                if outcome.was_updated() {
                    log_info(CONTROLLER_NAME, "Observed config updated", &[]);
                }
                Ok(ReconcileOutcome::Done)
            }
            Err(StoreError::NotFound(_)) => Err(ControllerError::Dependency(format!(
                "operator config {OPERATOR_CONFIG_NAME} not found"
            ))),
            Err(err) => Err(err.into()),
        }
    }
}
