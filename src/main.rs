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

use clap::{Args, Parser, Subcommand};
use staticpod_operator::operator::controller::orchestrator::Orchestrator;
use staticpod_operator::operator::k8s::cluster::{Infrastructure, Network};
use staticpod_operator::operator::k8s::configmap::{ConfigMap, Secret};
use staticpod_operator::operator::k8s::node::Node;
use staticpod_operator::operator::k8s::operator::GLOBAL_MACHINE_CONFIG_NAMESPACE;
use staticpod_operator::operator::k8s::{ClusterStore, ObjectMeta, StoreError};
use staticpod_operator::operator::logger::{self, log_error, log_info, LogFormat};
use staticpod_operator::operator::observability::{metrics, tracing as op_tracing};
use staticpod_operator::operator::util::StartupError;
use staticpod_operator::operator::{Config, OperatorSettings};
use std::error::Error;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "main";

/// Revisioned rollout operator for node-pinned static control-plane pods.
#[derive(Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controllers until interrupted
    Run(RunArgs),

    /// Print the settings resolved from the environment
    Settings,
}

#[derive(Args)]
struct RunArgs {
    /// Workers per controller; overrides WORKERS
    #[arg(long)]
    workers: Option<usize>,

    /// Log line format; overrides LOG_FORMAT
    #[arg(long, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    /// Complete installer tasks in-process instead of on nodes
    #[arg(long)]
    simulate_installer: bool,

    /// Control-plane nodes to seed into the local store
    #[arg(long, value_delimiter = ',')]
    nodes: Vec<String>,

    /// Print the metrics exposition on shutdown
    #[arg(long)]
    dump_metrics: bool,
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse::<LogFormat>()
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Settings => show_settings(),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let error = err.to_string();
            log_error(COMPONENT, "Operator failed", &[("error", error.as_str())]);
            ExitCode::FAILURE
        }
    }
}

fn show_settings() -> Result<(), Box<dyn Error + Send + Sync>> {
    for config in Config::ALL {
        println!("{:<24} {}", config.env_var(), config.get());
    }
    let settings = OperatorSettings::from_env()?;
    println!("\n{settings:#?}");
    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut settings = OperatorSettings::from_env()?;
    if let Some(workers) = args.workers {
        settings.workers = workers.max(1);
    }
    if let Some(format) = args.log_format {
        settings.log_format = format;
    }
    logger::set_log_format(settings.log_format);
    op_tracing::init();

    let store = ClusterStore::new();
    seed_local_cluster(&store, &settings.target_namespace, &args.nodes)
        .map_err(|err| StartupError::new("failed to seed local cluster", err))?;

    let mut orchestrator = Orchestrator::new(store, settings);
    if args.simulate_installer {
        orchestrator = orchestrator.with_simulated_installer();
    }

    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    orchestrator.run(token).await?;

    if args.dump_metrics {
        let exposition = metrics::gather()?;
        println!("{}", String::from_utf8_lossy(&exposition));
    }
    Ok(())
}

/// Populates the in-memory store with the cluster-scoped objects a rollout
/// reads, using placeholder content. Certificate secrets that another actor
/// maintains in the target namespace are seeded there directly.
fn seed_local_cluster(
    store: &ClusterStore,
    target_namespace: &str,
    nodes: &[String],
) -> Result<(), StoreError> {
    let kubeconfig = Secret::new(ObjectMeta::namespaced(
        GLOBAL_MACHINE_CONFIG_NAMESPACE,
        "kube-controller-manager-kubeconfig",
    ))
    .with_entry("kubeconfig", b"apiVersion: v1\nkind: Config\n");
    let service_ca = ConfigMap::new(ObjectMeta::namespaced(GLOBAL_MACHINE_CONFIG_NAMESPACE, "serviceaccount-ca"))
        .with_data("ca-bundle.crt", "");
    store.create(&Infrastructure::new("None"))?;
    store.create(&Network::new(&["10.128.0.0/14"], &["172.30.0.0/16"]))?;
    store.create(&kubeconfig)?;
    store.create(&service_ca)?;
    for (name, key) in [
        ("cluster-signing-ca", "tls.crt"),
        ("service-account-private-key", "service-account.key"),
        ("serving-cert", "tls.crt"),
    ] {
        store.create(&Secret::new(ObjectMeta::namespaced(target_namespace, name)).with_entry(key, b"placeholder"))?;
    }
    for node in nodes.iter().map(|node| node.trim()).filter(|node| !node.is_empty()) {
        store.create(&Node::control_plane(node))?;
        log_info(COMPONENT, "Seeded node", &[("node", node)]);
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            let error = err.to_string();
            log_error(COMPONENT, "Failed to listen for Ctrl+C", &[("error", error.as_str())]);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log_info(COMPONENT, "Received Ctrl+C", &[]),
        _ = terminate => log_info(COMPONENT, "Received SIGTERM", &[]),
    }
}
