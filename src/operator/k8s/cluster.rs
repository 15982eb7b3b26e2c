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

//! Cluster-wide configuration inputs read by the config observers.

use super::meta::{impl_resource, ObjectMeta, ResourceKind};
use serde::{Deserialize, Serialize};

/// Name shared by the cluster-scoped configuration singletons.
pub const CLUSTER_CONFIG_NAME: &str = "cluster";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Infrastructure {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_config: Option<CloudConfigReference>,
}

impl_resource!(Infrastructure, ResourceKind::Infrastructure);

impl Infrastructure {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(CLUSTER_CONFIG_NAME),
            platform: platform.into(),
            cloud_config: None,
        }
    }
}

/// Points at the ConfigMap holding the cloud provider configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfigReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub cluster_network: Vec<String>,
    #[serde(default)]
    pub service_network: Vec<String>,
}

impl_resource!(Network, ResourceKind::Network);

impl Network {
    pub fn new(cluster_network: &[&str], service_network: &[&str]) -> Self {
        Self {
            metadata: ObjectMeta::named(CLUSTER_CONFIG_NAME),
            cluster_network: cluster_network.iter().map(|s| s.to_string()).collect(),
            service_network: service_network.iter().map(|s| s.to_string()).collect(),
        }
    }
}
