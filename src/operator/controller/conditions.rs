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

//! Condition bookkeeping shared by the controllers. Each controller owns the
//! `<Controller>Degraded` condition it reports and the status aggregator
//! folds them into the published cluster operator conditions.

use crate::operator::k8s::operator::{
    ConditionStatus, OperatorCondition, OperatorConfig, OPERATOR_CONFIG_NAME,
};
use crate::operator::k8s::store::{ClusterStore, StoreError, DEFAULT_UPDATE_ATTEMPTS};
use chrono::{DateTime, Utc};
use std::fmt::{Display, Formatter};

/// Per-controller condition types written into the operator config status.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OperatorConditionKind {
    ConfigObservationDegraded,
    ResourceSyncControllerDegraded,
    TargetConfigControllerDegraded,
    RevisionControllerDegraded,
    NodeInstallerDegraded,
    InstallerControllerDegraded,
    PruneControllerDegraded,
}

impl OperatorConditionKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            OperatorConditionKind::ConfigObservationDegraded => "ConfigObservationDegraded",
            OperatorConditionKind::ResourceSyncControllerDegraded => {
                "ResourceSyncControllerDegraded"
            }
            OperatorConditionKind::TargetConfigControllerDegraded => {
                "TargetConfigControllerDegraded"
            }
            OperatorConditionKind::RevisionControllerDegraded => "RevisionControllerDegraded",
            OperatorConditionKind::NodeInstallerDegraded => "NodeInstallerDegraded",
            OperatorConditionKind::InstallerControllerDegraded => "InstallerControllerDegraded",
            OperatorConditionKind::PruneControllerDegraded => "PruneControllerDegraded",
        }
    }
}

impl Display for OperatorConditionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reasons attached to degraded conditions.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConditionReason {
    AsExpected,
    Error,
    RequiredSourceMissing,
    SyncError,
    MissingImage,
    RenderError,
    ContentCreationError,
    InstallerRetriesExhausted,
}

impl ConditionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConditionReason::AsExpected => "AsExpected",
            ConditionReason::Error => "Error",
            ConditionReason::RequiredSourceMissing => "RequiredSourceMissing",
            ConditionReason::SyncError => "SyncError",
            ConditionReason::MissingImage => "MissingImage",
            ConditionReason::RenderError => "RenderError",
            ConditionReason::ContentCreationError => "ContentCreationError",
            ConditionReason::InstallerRetriesExhausted => "InstallerRetriesExhausted",
        }
    }
}

impl Display for ConditionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn find_condition<'a>(
    conditions: &'a [OperatorCondition],
    condition_type: &str,
) -> Option<&'a OperatorCondition> {
    conditions
        .iter()
        .find(|condition| condition.condition_type == condition_type)
}

pub fn is_condition_true(conditions: &[OperatorCondition], condition_type: &str) -> bool {
    find_condition(conditions, condition_type)
        .map(|condition| condition.status == ConditionStatus::True)
        .unwrap_or(false)
}

/// Inserts or replaces a condition. `lastTransitionTime` moves only when the
/// status changes. Returns whether anything changed.
pub fn set_condition(
    conditions: &mut Vec<OperatorCondition>,
    mut condition: OperatorCondition,
    now: DateTime<Utc>,
) -> bool {
    match conditions
        .iter_mut()
        .find(|existing| existing.condition_type == condition.condition_type)
    {
        Some(existing) => {
            if existing.same_state(&condition) {
                return false;
            }
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.or(Some(now))
            } else {
                Some(now)
            };
            *existing = condition;
            true
        }
        None => {
            condition.last_transition_time = Some(now);
            conditions.push(condition);
            true
        }
    }
}

/// Sets `kind` to True with the given reason/message, or to False when
/// `failure` is `None`.
pub fn set_degraded(
    conditions: &mut Vec<OperatorCondition>,
    kind: OperatorConditionKind,
    failure: Option<(&str, &str)>,
    now: DateTime<Utc>,
) -> bool {
    let condition = match failure {
        Some((reason, message)) => {
            OperatorCondition::new(kind.as_str(), ConditionStatus::True, reason, message)
        }
        None => OperatorCondition::new(
            kind.as_str(),
            ConditionStatus::False,
            ConditionReason::AsExpected.as_str(),
            "",
        ),
    };
    set_condition(conditions, condition, now)
}

/// Writes `kind` into the operator config status, skipping the write when
/// the condition is already in that state. A missing operator config is not
/// an error; the orchestrator seeds it.
pub fn report_degraded(
    store: &ClusterStore,
    kind: OperatorConditionKind,
    failure: Option<(&str, &str)>,
) -> Result<(), StoreError> {
    let now = Utc::now();
    match store.update_with_retry::<OperatorConfig, _>(
        None,
        OPERATOR_CONFIG_NAME,
        DEFAULT_UPDATE_ATTEMPTS,
        |config| {
            set_degraded(&mut config.status.conditions, kind, failure, now);
        },
    ) {
        Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
        Err(err) => Err(err),
    }
}
