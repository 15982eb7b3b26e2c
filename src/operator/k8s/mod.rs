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

//! Typed cluster objects and the resource-versioned store they live in.

pub mod cluster;
pub mod configmap;
pub mod installer;
pub mod meta;
pub mod node;
pub mod operator;
pub mod revision;
pub mod store;

pub use meta::{ObjectKey, ObjectMeta, Resource, ResourceKind};
pub use store::{ClusterStore, StoreError, UpdateOutcome, WatchEvent, WatchEventType, WatchStream};
