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

//! Control loops of the operator and the runtime they share.

pub mod conditions;
pub mod configobserver;
pub mod informer;
pub mod installer;
pub mod orchestrator;
pub mod pruner;
pub mod reconcile;
pub mod resourcesync;
pub mod revision;
pub mod rollout;
pub mod runtime;
pub mod simulator;
pub mod status;
pub mod targetconfig;
pub mod watch;

pub use reconcile::{Controller, ControllerError, ReconcileOutcome};
