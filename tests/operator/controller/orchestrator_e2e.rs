use staticpod_operator::operator::controller::orchestrator::Orchestrator;
use staticpod_operator::operator::k8s::operator::{
    ClusterOperator, ConditionStatus, OperatorConfig, CLUSTER_OPERATOR_NAME, OPERATOR_CONFIG_NAME,
};
use staticpod_operator::operator::k8s::ClusterStore;
use staticpod_operator::operator::test_support::{test_settings, Cluster, KUBECONFIG_SOURCE};
use staticpod_operator::operator::OperatorSettings;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(15);

fn e2e_settings() -> OperatorSettings {
    OperatorSettings {
        workers: 2,
        prune_interval: Duration::from_millis(100),
        resync_interval: Duration::from_millis(500),
        ..test_settings()
    }
}

fn rolled_out_to(store: &ClusterStore, revision: u64) -> bool {
    let Ok(Some(config)) = store.get::<OperatorConfig>(None, OPERATOR_CONFIG_NAME) else {
        return false;
    };
    let Ok(Some(cluster_operator)) = store.get::<ClusterOperator>(None, CLUSTER_OPERATOR_NAME) else {
        return false;
    };
    let nodes_done = !config.status.node_statuses.is_empty()
        && config
            .status
            .node_statuses
            .iter()
            .all(|rollout| rollout.current_revision == revision);
    let settled = cluster_operator
        .condition("Progressing")
        .map(|condition| condition.status == ConditionStatus::False)
        .unwrap_or(false);
    let available = cluster_operator
        .condition("Available")
        .map(|condition| condition.status == ConditionStatus::True)
        .unwrap_or(false);
    config.status.latest_available_revision == revision && nodes_done && settled && available
}

async fn wait_for_revision(store: &ClusterStore, revision: u64) {
    timeout(CONVERGE_TIMEOUT, async {
        while !rolled_out_to(store, revision) {
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("rollout of revision {revision} did not converge"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_orchestrator_rolls_out_and_follows_changes() {
    let cluster = Cluster::with_settings(e2e_settings(), &["master-0", "master-1", "master-2"]);
    let store = cluster.store().clone();
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), e2e_settings()).with_simulated_installer());
    let token = CancellationToken::new();

    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        let token = token.clone();
        tokio::spawn(async move { orchestrator.run(token).await.map_err(|err| err.to_string()) })
    };

    wait_for_revision(&store, 1).await;

    cluster.put_source_secret(KUBECONFIG_SOURCE, "kubeconfig", "v2");
    wait_for_revision(&store, 2).await;

    token.cancel();
    let result = timeout(Duration::from_secs(5), running)
        .await
        .expect("orchestrator stops after cancellation")
        .expect("orchestrator task joins");
    assert_eq!(result, Ok(()));
    assert_eq!(cluster.revisions(), vec![1, 2]);
    assert!(orchestrator.feed().relist_count() >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_orchestrator_recovers_after_watch_disconnect() {
    let cluster = Cluster::with_settings(e2e_settings(), &["master-0", "master-1"]);
    let store = cluster.store().clone();
    let orchestrator = Arc::new(Orchestrator::new(store.clone(), e2e_settings()).with_simulated_installer());
    let token = CancellationToken::new();

    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        let token = token.clone();
        tokio::spawn(async move { orchestrator.run(token).await.map_err(|err| err.to_string()) })
    };
    wait_for_revision(&store, 1).await;

    store.disconnect_watchers();
    store.compact();
    cluster.put_source_secret(KUBECONFIG_SOURCE, "kubeconfig", "v2");
    wait_for_revision(&store, 2).await;

    assert!(orchestrator.feed().restart_count() >= 1);

    token.cancel();
    let result = timeout(Duration::from_secs(5), running)
        .await
        .expect("orchestrator stops after cancellation")
        .expect("orchestrator task joins");
    assert_eq!(result, Ok(()));
}
