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

use std::error::Error;
use std::sync::OnceLock;
use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static CONTROLLER_RECONCILES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CONTROLLER_RECONCILE_DURATION: OnceLock<HistogramVec> = OnceLock::new();
static WORKQUEUE_DEPTH: OnceLock<IntGaugeVec> = OnceLock::new();
static WORKQUEUE_RETRIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static REVISION_LATEST: OnceLock<IntGauge> = OnceLock::new();
static REVISIONS_PRUNED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static INSTALLER_TASKS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static NODE_CURRENT_REVISION: OnceLock<IntGaugeVec> = OnceLock::new();
static OPERATOR_CONDITION: OnceLock<IntGaugeVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        Registry::new_custom(Some("staticpod".to_string()), None)
            .expect("failed to initialise staticpod metrics registry")
    })
}

fn register_collector<C>(collector: C) -> C
where
    C: Clone + Collector + Send + Sync + 'static,
{
    registry()
        .register(Box::new(collector.clone()))
        .expect("failed to register staticpod metric collector");
    collector
}

fn controller_reconciles_total() -> &'static IntCounterVec {
    CONTROLLER_RECONCILES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "controller_reconciles_total",
            "Controller reconciliation attempts grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["controller", "result"])
            .expect("failed to build controller reconcile counter");
        register_collector(counter)
    })
}

fn controller_reconcile_duration() -> &'static HistogramVec {
    CONTROLLER_RECONCILE_DURATION.get_or_init(|| {
        let opts = HistogramOpts::new(
            "controller_reconcile_duration_seconds",
            "Latency distribution of a single reconcile pass",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]);
        let histogram = HistogramVec::new(opts, &["controller"])
            .expect("failed to build controller reconcile histogram");
        register_collector(histogram)
    })
}

fn workqueue_depth() -> &'static IntGaugeVec {
    WORKQUEUE_DEPTH.get_or_init(|| {
        let opts = Opts::new("workqueue_depth", "Keys waiting in a controller work queue");
        let gauge =
            IntGaugeVec::new(opts, &["controller"]).expect("failed to build workqueue depth gauge");
        register_collector(gauge)
    })
}

fn workqueue_retries_total() -> &'static IntCounterVec {
    WORKQUEUE_RETRIES_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "workqueue_retries_total",
            "Rate-limited requeues grouped by controller",
        );
        let counter = IntCounterVec::new(opts, &["controller"])
            .expect("failed to build workqueue retries counter");
        register_collector(counter)
    })
}

fn revision_latest() -> &'static IntGauge {
    REVISION_LATEST.get_or_init(|| {
        let gauge = IntGauge::new("revision_latest", "Latest available revision number")
            .expect("failed to build latest revision gauge");
        register_collector(gauge)
    })
}

fn revisions_pruned_total() -> &'static IntCounter {
    REVISIONS_PRUNED_TOTAL.get_or_init(|| {
        let counter = IntCounter::new("revisions_pruned_total", "Revisions deleted by the pruner")
            .expect("failed to build pruned revisions counter");
        register_collector(counter)
    })
}

fn installer_tasks_total() -> &'static IntCounterVec {
    INSTALLER_TASKS_TOTAL.get_or_init(|| {
        let opts = Opts::new(
            "installer_tasks_total",
            "Installer task transitions observed grouped by result",
        );
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("failed to build installer task counter");
        register_collector(counter)
    })
}

fn node_current_revision() -> &'static IntGaugeVec {
    NODE_CURRENT_REVISION.get_or_init(|| {
        let opts = Opts::new(
            "node_current_revision",
            "Revision currently installed on each control-plane node",
        );
        let gauge = IntGaugeVec::new(opts, &["node"])
            .expect("failed to build node current revision gauge");
        register_collector(gauge)
    })
}

fn operator_condition() -> &'static IntGaugeVec {
    OPERATOR_CONDITION.get_or_init(|| {
        let opts = Opts::new(
            "operator_condition",
            "Published cluster operator conditions (1 = True, 0 = False, -1 = Unknown)",
        );
        let gauge =
            IntGaugeVec::new(opts, &["type"]).expect("failed to build operator condition gauge");
        register_collector(gauge)
    })
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ControllerReconcileResult {
    Success,
    Requeue,
    Error,
}

impl ControllerReconcileResult {
    fn as_label(self) -> &'static str {
        match self {
            ControllerReconcileResult::Success => "success",
            ControllerReconcileResult::Requeue => "requeue",
            ControllerReconcileResult::Error => "error",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InstallerTaskResult {
    Launched,
    Succeeded,
    Failed,
    Exhausted,
}

impl InstallerTaskResult {
    fn as_label(self) -> &'static str {
        match self {
            InstallerTaskResult::Launched => "launched",
            InstallerTaskResult::Succeeded => "succeeded",
            InstallerTaskResult::Failed => "failed",
            InstallerTaskResult::Exhausted => "exhausted",
        }
    }
}

pub fn record_controller_reconcile(
    controller: &str,
    result: ControllerReconcileResult,
    elapsed: Duration,
) {
    controller_reconciles_total()
        .with_label_values(&[controller, result.as_label()])
        .inc();
    controller_reconcile_duration()
        .with_label_values(&[controller])
        .observe(elapsed.as_secs_f64());
}

pub fn set_workqueue_depth(controller: &str, depth: usize) {
    workqueue_depth()
        .with_label_values(&[controller])
        .set(depth as i64);
}

pub fn record_workqueue_retry(controller: &str) {
    workqueue_retries_total()
        .with_label_values(&[controller])
        .inc();
}

pub fn set_latest_revision(revision: u64) {
    revision_latest().set(revision as i64);
}

pub fn record_revisions_pruned(count: usize) {
    revisions_pruned_total().inc_by(count as u64);
}

pub fn record_installer_task(result: InstallerTaskResult) {
    installer_tasks_total()
        .with_label_values(&[result.as_label()])
        .inc();
}

pub fn set_node_current_revision(node: &str, revision: u64) {
    node_current_revision()
        .with_label_values(&[node])
        .set(revision as i64);
}

pub fn clear_node(node: &str) {
    let _ = node_current_revision().remove_label_values(&[node]);
}

pub fn set_operator_condition(condition_type: &str, status: &str) {
    let value = match status {
        "True" => 1,
        "False" => 0,
        _ => -1,
    };
    operator_condition()
        .with_label_values(&[condition_type])
        .set(value);
}

/// Encodes every registered collector in the Prometheus text format.
pub fn gather() -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let metric_families = registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|err| Box::new(err) as Box<dyn Error + Send + Sync>)?;
    Ok(buffer)
}
