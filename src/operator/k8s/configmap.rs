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

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Key/value configuration stored in a namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMap {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    /// Base64-encoded values for non UTF-8 content.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub binary_data: BTreeMap<String, String>,
}

impl_resource!(ConfigMap, ResourceKind::ConfigMap);

impl ConfigMap {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            metadata,
            ..Self::default()
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    pub fn get_key_bytes(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(value) = self.data.get(key) {
            Some(value.clone().into_bytes())
        } else {
            self.binary_data
                .get(key)
                .and_then(|value| BASE64_STANDARD.decode(value).ok())
        }
    }

    /// Decoded view over `data` and `binaryData`.
    pub fn entries(&self) -> BTreeMap<String, Vec<u8>> {
        let mut merged: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (key, value) in &self.data {
            merged.insert(key.clone(), value.clone().into_bytes());
        }
        for (key, value) in &self.binary_data {
            if let Ok(decoded) = BASE64_STANDARD.decode(value) {
                merged.insert(key.clone(), decoded);
            }
        }
        merged
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.entries())
    }

    /// Replaces the payload with `source`'s, leaving metadata untouched.
    pub fn copy_data_from(&mut self, source: &ConfigMap) {
        self.data = source.data.clone();
        self.binary_data = source.binary_data.clone();
    }
}

/// Opaque credential material. Values are base64 encoded on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(rename = "type", default = "default_secret_type")]
    pub secret_type: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

impl_resource!(Secret, ResourceKind::Secret);

fn default_secret_type() -> String {
    "Opaque".to_string()
}

impl Secret {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self {
            metadata,
            secret_type: default_secret_type(),
            data: BTreeMap::new(),
        }
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl AsRef<[u8]>) -> Self {
        self.data
            .insert(key.into(), BASE64_STANDARD.encode(value.as_ref()));
        self
    }

    pub fn get_key_bytes(&self, key: &str) -> Option<Vec<u8>> {
        self.data
            .get(key)
            .and_then(|value| BASE64_STANDARD.decode(value).ok())
    }

    pub fn entries(&self) -> BTreeMap<String, Vec<u8>> {
        self.data
            .iter()
            .filter_map(|(key, value)| {
                BASE64_STANDARD
                    .decode(value)
                    .ok()
                    .map(|decoded| (key.clone(), decoded))
            })
            .collect()
    }

    pub fn content_hash(&self) -> String {
        content_hash(&self.entries())
    }

    pub fn copy_data_from(&mut self, source: &Secret) {
        self.secret_type = source.secret_type.clone();
        self.data = source.data.clone();
    }
}

/// SHA-256 over the canonical (key-sorted, length-prefixed) encoding of `entries`.
pub fn content_hash(entries: &BTreeMap<String, Vec<u8>>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in entries {
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_metadata_and_storage_form() {
        let plain = ConfigMap::new(ObjectMeta::namespaced("a", "one")).with_data("k", "v");
        let mut binary = ConfigMap::new(ObjectMeta::namespaced("b", "two").with_label("x", "y"));
        binary
            .binary_data
            .insert("k".to_string(), BASE64_STANDARD.encode("v"));
        assert_eq!(plain.content_hash(), binary.content_hash());
    }

    #[test]
    fn hash_distinguishes_key_boundaries() {
        let left = ConfigMap::new(ObjectMeta::named("x")).with_data("ab", "c");
        let right = ConfigMap::new(ObjectMeta::named("x")).with_data("a", "bc");
        assert_ne!(left.content_hash(), right.content_hash());
    }

    #[test]
    fn secret_entries_round_trip_bytes() {
        let secret = Secret::new(ObjectMeta::namespaced("kcm", "serving-cert"))
            .with_entry("tls.key", [0u8, 159, 146, 150]);
        assert_eq!(
            secret.get_key_bytes("tls.key"),
            Some(vec![0u8, 159, 146, 150])
        );
        assert_eq!(secret.secret_type, "Opaque");
    }
}
