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

//! Renders the operand configuration and static pod manifest that the
//! revision controller snapshots.

use crate::operator::controller::conditions::{
    report_degraded, ConditionReason, OperatorConditionKind,
};
use crate::operator::controller::informer::ResourceCache;
use crate::operator::controller::reconcile::{Controller, ControllerError, ReconcileOutcome};
use crate::operator::controller::runtime::WorkQueue;
use crate::operator::k8s::configmap::ConfigMap;
use crate::operator::k8s::operator::{ManagementState, OperatorConfig, OPERATOR_CONFIG_NAME};
use crate::operator::k8s::store::{ClusterStore, StoreError, DEFAULT_UPDATE_ATTEMPTS};
use crate::operator::k8s::ObjectMeta;
use crate::operator::logger::{log_info, log_warn};
use crate::operator::util::json::merge;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;

const CONTROLLER_NAME: &str = "target-config";

pub const TARGET_CONFIG_KEY: &str = "targetconfig";
pub const CONFIG_CONFIG_MAP: &str = "config";
pub const POD_CONFIG_MAP: &str = "kube-controller-manager-pod";
pub const FORCE_REDEPLOYMENT_ANNOTATION: &str = "operator.openshift.io/force-redeployment-reason";

const RESOURCE_DIR: &str = "/etc/kubernetes/static-pod-resources";

fn default_config() -> Value {
    json!({
        "apiVersion": "kubecontrollermanager.config.openshift.io/v1",
        "kind": "KubeControllerManagerConfig",
        "extendedArguments": {},
    })
}

#[derive(Debug)]
pub enum RenderError {
    /// A spec document layered onto the operand config is not an object.
    NotAnObject(&'static str),
    Encode(serde_json::Error),
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderError::NotAnObject(field) => write!(f, "spec.{field} must be a JSON object"),
            RenderError::Encode(err) => write!(f, "failed to encode rendered document: {err}"),
        }
    }
}

impl Error for RenderError {}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::Encode(err)
    }
}

/// `config.yaml`: defaults, then the observed config, then the
/// administrator's unsupported overrides. Null layers are skipped.
pub fn render_config(config: &OperatorConfig) -> Result<String, RenderError> {
    let mut rendered = default_config();
    let layers = [
        ("observedConfig", &config.spec.observed_config),
        ("unsupportedConfigOverrides", &config.spec.unsupported_config_overrides),
    ];
    for (field, layer) in layers {
        match layer {
            Value::Null => {}
            Value::Object(_) => merge(&mut rendered, layer),
            _ => return Err(RenderError::NotAnObject(field)),
        }
    }
    Ok(serde_json::to_string_pretty(&rendered)?)
}

pub fn render_pod(
    config: &OperatorConfig,
    image: &str,
    namespace: &str,
) -> Result<String, RenderError> {
    let pod = json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": "kube-controller-manager",
            "namespace": namespace,
            "labels": {
                "app": "kube-controller-manager",
                "kube-controller-manager": "true",
            },
            "annotations": {
                FORCE_REDEPLOYMENT_ANNOTATION: config.spec.force_redeployment_reason,
            },
        },
        "spec": {
            "hostNetwork": true,
            "priorityClassName": "system-node-critical",
            "containers": [{
                "name": "kube-controller-manager",
                "image": image,
                "command": ["hyperkube", "kube-controller-manager"],
                "args": [format!("--openshift-config={RESOURCE_DIR}/configmaps/{CONFIG_CONFIG_MAP}/config.yaml")],
                "volumeMounts": [{
                    "name": "resource-dir",
                    "mountPath": RESOURCE_DIR,
                }],
            }],
            "volumes": [{
                "name": "resource-dir",
                "hostPath": { "path": format!("{RESOURCE_DIR}/kube-controller-manager-pod") },
            }],
        },
    });
    Ok(serde_json::to_string_pretty(&pod)?)
}

/// Creates or overwrites the data of a ConfigMap. Returns whether a write
/// happened.
pub fn apply_config_map_data(
    store: &ClusterStore,
    namespace: &str,
    name: &str,
    data: BTreeMap<String, String>,
) -> Result<bool, StoreError> {
    let existing: Option<ConfigMap> = store.get(Some(namespace), name)?;
    match existing {
        Some(existing) if existing.data == data && existing.binary_data.is_empty() => {
            return Ok(false)
        }
        Some(_) => {}
        None => {
            let mut created = ConfigMap::new(ObjectMeta::namespaced(namespace, name));
            created.data = data.clone();
            match store.create(&created) {
                Ok(_) => return Ok(true),
                Err(StoreError::AlreadyExists(_)) => {}
                Err(err) => return Err(err),
            }
        }
    }
    let outcome = store.update_with_retry::<ConfigMap, _>(
        Some(namespace),
        name,
        DEFAULT_UPDATE_ATTEMPTS,
        |config_map| {
            config_map.data = data.clone();
            config_map.binary_data.clear();
        },
    )?;
    Ok(outcome.was_updated())
}

pub struct TargetConfigController {
    store: ClusterStore,
    cache: ResourceCache,
    queue: WorkQueue<String>,
    image: Option<String>,
    operator_version: String,
    target_namespace: String,
}

impl TargetConfigController {
    pub fn new(
        store: ClusterStore,
        cache: ResourceCache,
        image: Option<String>,
        operator_version: impl Into<String>,
        target_namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            queue: WorkQueue::new(CONTROLLER_NAME),
            image: image.filter(|image| !image.is_empty()),
            operator_version: operator_version.into(),
            target_namespace: target_namespace.into(),
        }
    }

    pub fn enqueue(&self) {
        self.queue.add(TARGET_CONFIG_KEY.to_string());
    }

    /// Returns true when either ConfigMap object of `name` is one this
    /// controller renders.
    pub fn owns(&self, namespace: &str, name: &str) -> bool {
        namespace == self.target_namespace && (name == CONFIG_CONFIG_MAP || name == POD_CONFIG_MAP)
    }

    fn apply(&self, name: &str, data: BTreeMap<String, String>) -> Result<(), StoreError> {
        if apply_config_map_data(&self.store, &self.target_namespace, name, data)? {
            log_info(
                CONTROLLER_NAME,
                "Rendered target config",
                &[("namespace", self.target_namespace.as_str()), ("name", name)],
            );
        }
        Ok(())
    }

    /// Leaves the last good manifests in place; the next spec change
    /// re-queues the controller.
    fn report_render_error(&self, err: &RenderError) -> Result<ReconcileOutcome, ControllerError> {
        let message = err.to_string();
        log_warn(CONTROLLER_NAME, "Failed to render operand", &[("error", message.as_str())]);
        report_degraded(
            &self.store,
            OperatorConditionKind::TargetConfigControllerDegraded,
            Some((ConditionReason::RenderError.as_str(), message.as_str())),
        )?;
        Ok(ReconcileOutcome::Done)
    }
}

impl Controller for TargetConfigController {
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

        let rendered = match render_config(&config) {
            Ok(rendered) => rendered,
            Err(err) => return self.report_render_error(&err),
        };
        self.apply(
            CONFIG_CONFIG_MAP,
            BTreeMap::from([("config.yaml".to_string(), rendered)]),
        )?;

        let Some(image) = self.image.as_deref() else {
            report_degraded(
                &self.store,
                OperatorConditionKind::TargetConfigControllerDegraded,
                Some((
                    ConditionReason::MissingImage.as_str(),
                    "IMAGE environment variable is not set",
                )),
            )?;
            return Ok(ReconcileOutcome::Done);
        };

        let pod = match render_pod(&config, image, &self.target_namespace) {
            Ok(pod) => pod,
            Err(err) => return self.report_render_error(&err),
        };
        self.apply(
            POD_CONFIG_MAP,
            BTreeMap::from([
                ("pod.yaml".to_string(), pod),
                ("version".to_string(), self.operator_version.clone()),
            ]),
        )?;
        report_degraded(
            &self.store,
            OperatorConditionKind::TargetConfigControllerDegraded,
            None,
        )?;
        Ok(ReconcileOutcome::Done)
    }
}
