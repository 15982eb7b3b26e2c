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
use serde::{Deserialize, Serialize};

/// Label marking nodes that host control-plane static pods.
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/master";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub metadata: ObjectMeta,
}

impl_resource!(Node, ResourceKind::Node);

impl Node {
    pub fn control_plane(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name).with_label(CONTROL_PLANE_LABEL, ""),
        }
    }

    pub fn worker(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name).with_label("node-role.kubernetes.io/worker", ""),
        }
    }

    pub fn is_control_plane(&self) -> bool {
        self.metadata.labels.contains_key(CONTROL_PLANE_LABEL)
    }
}
