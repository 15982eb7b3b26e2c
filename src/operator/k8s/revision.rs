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
use std::collections::BTreeMap;

pub const REVISION_LABEL: &str = "revision";
const REVISION_PREFIX: &str = "revision-";

/// Immutable snapshot of every input the workload is rendered from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revision {
    pub metadata: ObjectMeta,
    pub number: u64,
    pub created_at: DateTime<Utc>,
    pub input_hash: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub snapshot: RevisionSnapshot,
}

impl_resource!(Revision, ResourceKind::Revision);

impl Revision {
    pub fn new(
        namespace: &str,
        number: u64,
        input_hash: String,
        reason: String,
        snapshot: RevisionSnapshot,
    ) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, revision_name(number))
                .with_label(REVISION_LABEL, number.to_string()),
            number,
            created_at: Utc::now(),
            input_hash,
            reason,
            snapshot,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionSnapshot {
    /// ConfigMap name to its data, as captured at creation.
    #[serde(default)]
    pub config_maps: BTreeMap<String, BTreeMap<String, String>>,
    /// Secret name to its base64-encoded data.
    #[serde(default)]
    pub secrets: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub spec_digest: String,
}

pub fn revision_name(number: u64) -> String {
    format!("{REVISION_PREFIX}{number}")
}

pub fn parse_revision_name(name: &str) -> Option<u64> {
    name.strip_prefix(REVISION_PREFIX)?.parse().ok()
}
