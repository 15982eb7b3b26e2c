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

use crate::operator::controller::runtime::WorkQueue;
use crate::operator::k8s::StoreError;
use crate::operator::logger::{log_debug, log_error, log_warn};
use crate::operator::observability::metrics::{self, ControllerReconcileResult};
use crate::operator::observability::tracing::with_span;
use std::error::Error;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result of one successful reconcile pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Done,
    /// Converged for now but expects to make progress later, e.g. while an
    /// installer task is still running or a retry backoff has not elapsed.
    RequeueAfter(Duration),
}

#[derive(Debug)]
pub enum ControllerError {
    /// Store access failed. Conflicts and unavailability are retried.
    Store(StoreError),
    /// Desired state cannot be produced from the current inputs. Retrying
    /// without an input change cannot succeed.
    Structural { reason: String, message: String },
    /// A required input does not exist yet.
    Dependency(String),
}

impl ControllerError {
    pub fn structural(reason: impl Into<String>, message: impl Into<String>) -> Self {
        ControllerError::Structural {
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Store(err) => err.is_transient(),
            ControllerError::Structural { .. } => false,
            ControllerError::Dependency(_) => true,
        }
    }
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::Store(err) => write!(f, "store error: {err}"),
            ControllerError::Structural { reason, message } => write!(f, "{reason}: {message}"),
            ControllerError::Dependency(message) => write!(f, "missing dependency: {message}"),
        }
    }
}

impl Error for ControllerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ControllerError::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ControllerError {
    fn from(err: StoreError) -> Self {
        ControllerError::Store(err)
    }
}

/// A level-triggered controller: `reconcile` reads current state, computes
/// the desired state and writes the difference. Calling it again with no
/// intervening change performs no writes.
pub trait Controller: Send + Sync {
    fn name(&self) -> &'static str;

    fn queue(&self) -> &WorkQueue<String>;

    fn reconcile(&self, key: &str) -> Result<ReconcileOutcome, ControllerError>;
}

/// Spawns `workers` tasks draining the controller's queue until `token` is
/// cancelled. A key is never processed by two workers at once.
pub fn run_controller(
    controller: Arc<dyn Controller>,
    workers: usize,
    token: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|worker| {
            let controller = Arc::clone(&controller);
            let token = token.clone();
            tokio::spawn(async move {
                worker_loop(controller, worker, token).await;
            })
        })
        .collect()
}

async fn worker_loop(controller: Arc<dyn Controller>, worker: usize, token: CancellationToken) {
    let name = controller.name();
    loop {
        let key = tokio::select! {
            _ = token.cancelled() => break,
            key = controller.queue().get() => match key {
                Some(key) => key,
                None => break,
            },
        };

        let worker_label = worker.to_string();
        let span_name = format!("{name}.reconcile");
        let started = Instant::now();
        let result = with_span(name, span_name, async {
            log_debug(name, "Reconciling", &[("key", key.as_str()), ("worker", worker_label.as_str())]);
            match catch_unwind(AssertUnwindSafe(|| controller.reconcile(&key))) {
                Ok(result) => result,
                Err(_) => Err(ControllerError::structural(
                    "Panic",
                    format!("reconcile of {key} panicked"),
                )),
            }
        })
        .await;
        handle_result(controller.as_ref(), &key, result, started.elapsed());
        controller.queue().done(&key);
    }
    controller.queue().shut_down();
}

/// Applies the retry policy for one reconcile result: transient failures are
/// re-queued with backoff, structural ones wait for the next input change.
pub fn handle_result(
    controller: &dyn Controller,
    key: &str,
    result: Result<ReconcileOutcome, ControllerError>,
    elapsed: Duration,
) {
    let name = controller.name();
    let queue = controller.queue();
    let key_owned = key.to_string();
    match result {
        Ok(ReconcileOutcome::Done) => {
            metrics::record_controller_reconcile(name, ControllerReconcileResult::Success, elapsed);
            queue.forget(&key_owned);
        }
        Ok(ReconcileOutcome::RequeueAfter(delay)) => {
            metrics::record_controller_reconcile(name, ControllerReconcileResult::Requeue, elapsed);
            queue.forget(&key_owned);
            queue.add_after(key_owned, delay);
        }
        Err(err) if err.is_transient() => {
            metrics::record_controller_reconcile(name, ControllerReconcileResult::Error, elapsed);
            let error = err.to_string();
            let retries = (queue.num_requeues(&key_owned) + 1).to_string();
            log_warn(
                name,
                "Reconcile failed; retrying",
                &[("key", key), ("error", error.as_str()), ("retries", retries.as_str())],
            );
            queue.add_rate_limited(key_owned);
        }
        Err(err) => {
            metrics::record_controller_reconcile(name, ControllerReconcileResult::Error, elapsed);
            let error = err.to_string();
            log_error(name, "Reconcile failed", &[("key", key), ("error", error.as_str())]);
            queue.forget(&key_owned);
        }
    }
}
