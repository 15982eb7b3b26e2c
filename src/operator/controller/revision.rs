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

//! Content-addressed, monotonically numbered snapshots of the operand inputs.
//!
//! The controller hashes every input ConfigMap and Secret in the target
//! namespace together with a digest of the relevant operator spec fields.
//! A new `revision-<n>` is created only when that hash differs from the
//! latest revision's. Revision numbers are allocated from a live read and the
//! store's create-if-absent semantics, so two concurrent passes can never
//! produce two revisions with the same number or the same content.

use crate::operator::controller::conditions::{
    report_degraded, set_degraded, ConditionReason, OperatorConditionKind,
};
use crate::operator::controller::informer::ResourceCache;
use crate::operator::controller::reconcile::{Controller, ControllerError, ReconcileOutcome};
use crate::operator::controller::runtime::WorkQueue;
use crate::operator::controller::targetconfig::{CONFIG_CONFIG_MAP, POD_CONFIG_MAP};
use crate::operator::k8s::configmap::{ConfigMap, Secret};
use crate::operator::k8s::operator::{ManagementState, OperatorConfig, OPERATOR_CONFIG_NAME};
use crate::operator::k8s::revision::{revision_name, Revision, RevisionSnapshot};
use crate::operator::k8s::store::{ClusterStore, StoreError, DEFAULT_UPDATE_ATTEMPTS};
use crate::operator::k8s::ResourceKind;
use crate::operator::logger::log_info;
use crate::operator::observability::metrics;
use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const CONTROLLER_NAME: &str = "revision";

pub const REVISION_KEY: &str = "revision";

/// An input object copied into every revision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RevisionInput {
    pub name: &'static str,
    pub optional: bool,
}

impl RevisionInput {
    const fn required(name: &'static str) -> Self {
        Self {
            name,
            optional: false,
        }
    }

    const fn optional(name: &'static str) -> Self {
        Self {
            name,
            optional: true,
        }
    }
}

pub const REVISION_CONFIG_MAPS: [RevisionInput; 4] = [
    RevisionInput::required(POD_CONFIG_MAP),
    RevisionInput::required(CONFIG_CONFIG_MAP),
    RevisionInput::required("serviceaccount-ca"),
    RevisionInput::optional("cloud-config"),
];

pub const REVISION_SECRETS: [RevisionInput; 4] = [
    RevisionInput::required("cluster-signing-ca"),
    RevisionInput::required("controller-manager-kubeconfig"),
    RevisionInput::required("service-account-private-key"),
    RevisionInput::required("serving-cert"),
];

/// Inputs gathered for one reconcile pass.
#[derive(Debug, Clone, Default)]
pub struct RevisionInputs {
    pub snapshot: RevisionSnapshot,
    /// `configmap/<name>` or `secret/<name>` to content hash, present inputs only.
    pub hashes: BTreeMap<String, String>,
    pub missing: Vec<String>,
}

impl RevisionInputs {
    /// SHA-256 over the sorted per-input content hashes and the spec digest.
    pub fn input_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (input, hash) in &self.hashes {
            hasher.update(input.as_bytes());
            hasher.update(b"=");
            hasher.update(hash.as_bytes());
            hasher.update(b"\n");
        }
        hasher.update(b"spec=");
        hasher.update(self.snapshot.spec_digest.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Digest of the operator spec fields that change the rendered operand.
pub fn spec_digest(config: &OperatorConfig) -> String {
    let relevant = json!({
        "observedConfig": config.spec.observed_config,
        "unsupportedConfigOverrides": config.spec.unsupported_config_overrides,
        "forceRedeploymentReason": config.spec.force_redeployment_reason,
    });
    hex::encode(Sha256::digest(relevant.to_string().as_bytes()))
}

/// Human-readable list of what differs between two snapshots.
pub fn change_reason(previous: Option<&RevisionSnapshot>, current: &RevisionSnapshot) -> String {
    let Some(previous) = previous else {
        return "initial revision".to_string();
    };
    let mut changes = Vec::new();
    collect_changes("configmap", &previous.config_maps, &current.config_maps, &mut changes);
    collect_changes("secret", &previous.secrets, &current.secrets, &mut changes);
    if previous.spec_digest != current.spec_digest {
        changes.push("operator spec changed".to_string());
    }
    if changes.is_empty() {
        "inputs changed".to_string()
    } else {
        changes.join(", ")
    }
}

fn collect_changes(
    kind: &str,
    previous: &BTreeMap<String, BTreeMap<String, String>>,
    current: &BTreeMap<String, BTreeMap<String, String>>,
    changes: &mut Vec<String>,
) {
    let mut names: Vec<&String> = previous.keys().chain(current.keys()).collect();
    names.sort();
    names.dedup();
    for name in names {
        match (previous.get(name), current.get(name)) {
            (Some(_), None) => changes.push(format!("{kind}/{name} removed")),
            (None, Some(_)) => changes.push(format!("{kind}/{name} added")),
            (Some(before), Some(after)) if before != after => {
                changes.push(format!("{kind}/{name} changed"))
            }
            _ => {}
        }
    }
}

pub struct RevisionController {
    store: ClusterStore,
    cache: ResourceCache,
    queue: WorkQueue<String>,
    target_namespace: String,
}

impl RevisionController {
    pub fn new(store: ClusterStore, cache: ResourceCache, target_namespace: impl Into<String>) -> Self {
        Self {
            store,
            cache,
            queue: WorkQueue::new(CONTROLLER_NAME),
            target_namespace: target_namespace.into(),
        }
    }

    pub fn enqueue(&self) {
        self.queue.add(REVISION_KEY.to_string());
    }

    /// True when `name` in the target namespace feeds revisions.
    pub fn is_input(&self, kind: ResourceKind, namespace: &str, name: &str) -> bool {
        if namespace != self.target_namespace {
            return false;
        }
        let inputs: &[RevisionInput] = match kind {
            ResourceKind::ConfigMap => &REVISION_CONFIG_MAPS,
            ResourceKind::Secret => &REVISION_SECRETS,
            _ => return false,
        };
        inputs.iter().any(|input| input.name == name)
    }

    pub fn gather_inputs(&self, config: &OperatorConfig) -> Result<RevisionInputs, StoreError> {
        let namespace = Some(self.target_namespace.as_str());
        let mut inputs = RevisionInputs::default();
        for input in REVISION_CONFIG_MAPS {
            let label = format!("configmap/{}", input.name);
            match self.cache.get::<ConfigMap>(namespace, input.name)? {
                Some(config_map) => {
                    inputs.hashes.insert(label, config_map.content_hash());
                    let mut captured = config_map.data.clone();
                    captured.extend(config_map.binary_data.clone());
                    inputs
                        .snapshot
                        .config_maps
                        .insert(input.name.to_string(), captured);
                }
                None if input.optional => {}
                None => inputs.missing.push(label),
            }
        }
        for input in REVISION_SECRETS {
            let label = format!("secret/{}", input.name);
            match self.cache.get::<Secret>(namespace, input.name)? {
                Some(secret) => {
                    inputs.hashes.insert(label, secret.content_hash());
                    inputs
                        .snapshot
                        .secrets
                        .insert(input.name.to_string(), secret.data.clone());
                }
                None if input.optional => {}
                None => inputs.missing.push(label),
            }
        }
        inputs.snapshot.spec_digest = spec_digest(config);
        Ok(inputs)
    }

    /// Highest-numbered revision, read live from the store.
    pub fn latest_revision(&self) -> Result<Option<Revision>, StoreError> {
        let revisions: Vec<Revision> = self.store.list(Some(&self.target_namespace))?;
        Ok(revisions.into_iter().max_by_key(|revision| revision.number))
    }

    /// Creates `revision-<number>`. Losing the race to a creator with the
    /// same content adopts the winner; different content is a conflict that
    /// the next pass resolves with a fresh read.
    fn create_revision(
        &self,
        number: u64,
        input_hash: &str,
        reason: &str,
        snapshot: RevisionSnapshot,
    ) -> Result<Revision, StoreError> {
        let revision = Revision::new(
            &self.target_namespace,
            number,
            input_hash.to_string(),
            reason.to_string(),
            snapshot,
        );
        match self.store.create(&revision) {
            Ok(created) => {
                let number_label = number.to_string();
                log_info(
                    CONTROLLER_NAME,
                    "Created revision",
                    &[("revision", number_label.as_str()), ("reason", reason)],
                );
                Ok(created)
            }
            Err(StoreError::AlreadyExists(key)) => {
                let winner: Option<Revision> = self
                    .store
                    .get(Some(&self.target_namespace), &revision_name(number))?;
                match winner {
                    Some(winner) if winner.input_hash == input_hash => Ok(winner),
                    Some(winner) => Err(StoreError::Conflict {
                        key,
                        expected: input_hash.to_string(),
                        actual: winner.input_hash,
                    }),
                    None => Err(StoreError::Conflict {
                        key,
                        expected: input_hash.to_string(),
                        actual: String::new(),
                    }),
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Raises `status.latestAvailableRevision` to `revision` (never lowers
    /// it) and clears the degraded condition in the same write.
    fn publish_latest(&self, revision: &Revision) -> Result<(), StoreError> {
        let now = Utc::now();
        self.store.update_with_retry::<OperatorConfig, _>(
            None,
            OPERATOR_CONFIG_NAME,
            DEFAULT_UPDATE_ATTEMPTS,
            |config| {
                if config.status.latest_available_revision < revision.number {
                    config.status.latest_available_revision = revision.number;
                    config.status.latest_available_revision_reason = revision.reason.clone();
                }
                set_degraded(
                    &mut config.status.conditions,
                    OperatorConditionKind::RevisionControllerDegraded,
                    None,
                    now,
                );
            },
        )?;
        metrics::set_latest_revision(revision.number);
        Ok(())
    }
}

impl Controller for RevisionController {
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

        let inputs = self.gather_inputs(&config)?;
        if !inputs.missing.is_empty() {
            let message = format!("missing required inputs: {}", inputs.missing.join(", "));
            report_degraded(
                &self.store,
                OperatorConditionKind::RevisionControllerDegraded,
                Some((ConditionReason::ContentCreationError.as_str(), message.as_str())),
            )?;
            return Ok(ReconcileOutcome::Done);
        }

        let input_hash = inputs.input_hash();
        let latest = self.latest_revision()?;
        let revision = match latest {
            Some(latest) if latest.input_hash == input_hash => latest,
            latest => {
                let newest = latest.as_ref().map(|revision| revision.number).unwrap_or(0);
                let number = newest.max(config.status.latest_available_revision) + 1;
                let reason = change_reason(latest.as_ref().map(|revision| &revision.snapshot), &inputs.snapshot);
                self.create_revision(number, &input_hash, &reason, inputs.snapshot)?
            }
        };
        self.publish_latest(&revision)?;
        Ok(ReconcileOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::controller::conditions::find_condition;
    use crate::operator::k8s::operator::ConditionStatus;
    use crate::operator::k8s::ObjectMeta;

    const NS: &str = "target";

    fn seed_inputs(store: &ClusterStore) {
        seed_inputs_except(store, "");
    }

    fn seed_inputs_except(store: &ClusterStore, skipped: &str) {
        for input in REVISION_CONFIG_MAPS.iter().filter(|input| !input.optional && input.name != skipped) {
            store
                .create(&ConfigMap::new(ObjectMeta::namespaced(NS, input.name)).with_data("data", "{}"))
                .unwrap();
        }
        for input in REVISION_SECRETS.iter().filter(|input| !input.optional && input.name != skipped) {
            store
                .create(&Secret::new(ObjectMeta::namespaced(NS, input.name)).with_entry("data", b"v1"))
                .unwrap();
        }
    }

    fn setup() -> (ClusterStore, RevisionController) {
        let store = ClusterStore::new();
        store.create(&OperatorConfig::default_cluster()).unwrap();
        let controller = RevisionController::new(store.clone(), ResourceCache::new(store.clone()), NS);
        (store, controller)
    }

    fn operator_config(store: &ClusterStore) -> OperatorConfig {
        store.get(None, OPERATOR_CONFIG_NAME).unwrap().unwrap()
    }

    #[test]
    fn first_revision_is_one_and_reruns_are_noops() {
        let (store, controller) = setup();
        seed_inputs(&store);
        controller.reconcile(REVISION_KEY).unwrap();

        let revision: Revision = store.get(Some(NS), "revision-1").unwrap().unwrap();
        assert_eq!(revision.reason, "initial revision");
        assert_eq!(operator_config(&store).status.latest_available_revision, 1);

        let writes = store.write_count();
        controller.reconcile(REVISION_KEY).unwrap();
        assert_eq!(store.write_count(), writes);
        assert_eq!(store.list::<Revision>(Some(NS)).unwrap().len(), 1);
    }

    #[test]
    fn input_change_creates_next_revision_with_reason() {
        let (store, controller) = setup();
        seed_inputs(&store);
        controller.reconcile(REVISION_KEY).unwrap();

        let mut config_map: ConfigMap = store.get(Some(NS), CONFIG_CONFIG_MAP).unwrap().unwrap();
        config_map.data.insert("data".into(), "{\"changed\":true}".into());
        store.update(&config_map).unwrap();
        controller.reconcile(REVISION_KEY).unwrap();

        let revision: Revision = store.get(Some(NS), "revision-2").unwrap().unwrap();
        assert_eq!(revision.reason, "configmap/config changed");
        let status = operator_config(&store).status;
        assert_eq!(status.latest_available_revision, 2);
        assert_eq!(status.latest_available_revision_reason, "configmap/config changed");
    }

    #[test]
    fn spec_changes_are_part_of_the_hash() {
        let (store, controller) = setup();
        seed_inputs(&store);
        controller.reconcile(REVISION_KEY).unwrap();

        let mut config = operator_config(&store);
        config.spec.force_redeployment_reason = "rotate".into();
        store.update(&config).unwrap();
        controller.reconcile(REVISION_KEY).unwrap();

        let revision: Revision = store.get(Some(NS), "revision-2").unwrap().unwrap();
        assert_eq!(revision.reason, "operator spec changed");
    }

    #[test]
    fn missing_required_input_degrades_without_revision() {
        let (store, controller) = setup();
        controller.reconcile(REVISION_KEY).unwrap();
        assert!(store.list::<Revision>(Some(NS)).unwrap().is_empty());
        let config = operator_config(&store);
        let condition =
            find_condition(&config.status.conditions, "RevisionControllerDegraded").unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.reason, "ContentCreationError");
        assert!(condition.message.contains("secret/controller-manager-kubeconfig"));
    }

    #[test]
    fn missing_serving_cert_blocks_revision_creation() {
        let (store, controller) = setup();
        seed_inputs_except(&store, "serving-cert");
        controller.reconcile(REVISION_KEY).unwrap();

        assert!(store.list::<Revision>(Some(NS)).unwrap().is_empty());
        let config = operator_config(&store);
        assert_eq!(config.status.latest_available_revision, 0);
        let condition =
            find_condition(&config.status.conditions, "RevisionControllerDegraded").unwrap();
        assert_eq!(condition.status, ConditionStatus::True);
        assert_eq!(condition.message, "missing required inputs: secret/serving-cert");

        store
            .create(&Secret::new(ObjectMeta::namespaced(NS, "serving-cert")).with_entry("tls.crt", b"cert"))
            .unwrap();
        controller.reconcile(REVISION_KEY).unwrap();
        assert!(store.get::<Revision>(Some(NS), "revision-1").unwrap().is_some());
    }

    #[test]
    fn cloud_config_is_the_only_optional_input() {
        let optional: Vec<&str> = REVISION_CONFIG_MAPS
            .iter()
            .chain(REVISION_SECRETS.iter())
            .filter(|input| input.optional)
            .map(|input| input.name)
            .collect();
        assert_eq!(optional, vec!["cloud-config"]);
    }

    #[test]
    fn losing_a_create_race_with_identical_content_adopts_the_winner() {
        let (store, controller) = setup();
        seed_inputs(&store);
        let config = operator_config(&store);
        let inputs = controller.gather_inputs(&config).unwrap();
        let winner = Revision::new(NS, 1, inputs.input_hash(), "initial revision".into(), inputs.snapshot.clone());
        store.create(&winner).unwrap();

        let adopted = controller
            .create_revision(1, &inputs.input_hash(), "initial revision", inputs.snapshot)
            .unwrap();
        assert_eq!(adopted.input_hash, winner.input_hash);
    }

    #[test]
    fn losing_a_create_race_with_other_content_conflicts() {
        let (store, controller) = setup();
        seed_inputs(&store);
        store
            .create(&Revision::new(NS, 1, "other".into(), "initial revision".into(), RevisionSnapshot::default()))
            .unwrap();
        let err = controller
            .create_revision(1, "mine", "initial revision", RevisionSnapshot::default())
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn numbering_continues_past_the_published_latest() {
        let (store, controller) = setup();
        seed_inputs(&store);
        let mut config = operator_config(&store);
        config.status.latest_available_revision = 7;
        store.update(&config).unwrap();
        controller.reconcile(REVISION_KEY).unwrap();
        assert!(store.get::<Revision>(Some(NS), "revision-8").unwrap().is_some());
        assert_eq!(operator_config(&store).status.latest_available_revision, 8);
    }

    #[test]
    fn reasons_list_added_and_removed_inputs() {
        let mut before = RevisionSnapshot::default();
        before.config_maps.insert("cloud-config".into(), BTreeMap::new());
        let mut after = RevisionSnapshot::default();
        after.secrets.insert("serving-cert".into(), BTreeMap::new());
        assert_eq!(
            change_reason(Some(&before), &after),
            "configmap/cloud-config removed, secret/serving-cert added"
        );
    }
}
