use staticpod_operator::operator::controller::rollout::RolloutStrategy;
use staticpod_operator::operator::k8s::installer::InstallerTask;
use staticpod_operator::operator::k8s::operator::{ConditionStatus, NodeRollout};
use staticpod_operator::operator::OperatorSettings;
use staticpod_operator::operator::test_support::{test_settings, Cluster, KUBECONFIG_SOURCE};

const SETTLE_ROUNDS: usize = 60;

fn rollouts(cluster: &Cluster) -> Vec<NodeRollout> {
    cluster.operator_config().status.node_statuses
}

fn node(cluster: &Cluster, name: &str) -> NodeRollout {
    rollouts(cluster)
        .into_iter()
        .find(|rollout| rollout.node_name == name)
        .unwrap_or_else(|| panic!("node {name} has no rollout status"))
}

fn tasks_for(cluster: &Cluster, name: &str) -> Vec<InstallerTask> {
    cluster
        .store()
        .list::<InstallerTask>(Some(cluster.namespace()))
        .unwrap()
        .into_iter()
        .filter(|task| task.node_name == name)
        .collect()
}

#[test]
fn scenario_initial_rollout_reaches_every_node() {
    let cluster = Cluster::new(&["master-0", "master-1", "master-2"]);
    cluster.settle(SETTLE_ROUNDS);

    assert_eq!(cluster.revisions(), vec![1]);
    for rollout in rollouts(&cluster) {
        assert_eq!(rollout.current_revision, 1, "{}", rollout.node_name);
        assert_eq!(rollout.target_revision, 1, "{}", rollout.node_name);
    }
    assert!(cluster.cluster_condition_is("Available", ConditionStatus::True));
    assert!(cluster.cluster_condition_is("Progressing", ConditionStatus::False));
    assert!(cluster.cluster_condition_is("Degraded", ConditionStatus::False));
}

#[test]
fn scenario_input_change_rolls_out_exactly_one_new_revision() {
    let cluster = Cluster::new(&["master-0", "master-1", "master-2"]);
    cluster.settle(SETTLE_ROUNDS);

    cluster.put_source_secret(KUBECONFIG_SOURCE, "kubeconfig", "v2");
    cluster.settle(SETTLE_ROUNDS);

    assert_eq!(cluster.revisions(), vec![1, 2]);
    assert_eq!(cluster.operator_config().status.latest_available_revision, 2);
    for rollout in rollouts(&cluster) {
        assert_eq!(rollout.current_revision, 2, "{}", rollout.node_name);
    }
    let progressing = cluster.cluster_condition("Progressing");
    assert_eq!(progressing.status, ConditionStatus::False);
    assert_eq!(progressing.message, "all nodes are at revision 2");
    assert!(cluster.cluster_condition_is("Available", ConditionStatus::True));
}

#[test]
fn scenario_rotated_serving_cert_rolls_out_a_new_revision() {
    let cluster = Cluster::new(&["master-0", "master-1"]);
    cluster.settle(SETTLE_ROUNDS);

    cluster.put_target_secret("serving-cert", "tls.key", "v2");
    cluster.settle(SETTLE_ROUNDS);

    assert_eq!(cluster.revisions(), vec![1, 2]);
    let status = cluster.operator_config().status;
    assert_eq!(status.latest_available_revision_reason, "secret/serving-cert changed");
    for rollout in rollouts(&cluster) {
        assert_eq!(rollout.current_revision, 2, "{}", rollout.node_name);
    }
}

#[test]
fn scenario_settled_cluster_is_write_free() {
    let cluster = Cluster::new(&["master-0", "master-1"]);
    cluster.settle(SETTLE_ROUNDS);

    let writes = cluster.store().write_count();
    for _ in 0..3 {
        cluster.orchestrator().enqueue_all();
        cluster.reconcile_pending();
    }
    assert_eq!(cluster.store().write_count(), writes);
}

#[test]
fn scenario_failing_node_exhausts_retries_without_blocking_others() {
    let cluster = Cluster::new(&["master-0", "master-1", "master-2"]);
    cluster.installer().fail_node("master-1");
    cluster.settle(SETTLE_ROUNDS);

    let max_retries = cluster.settings().max_installer_retries;
    let failing = node(&cluster, "master-1");
    assert_eq!(failing.current_revision, 0);
    assert_eq!(failing.target_revision, 1);
    assert_eq!(failing.last_failed_revision, 1);
    assert_eq!(failing.last_failed_count, max_retries);
    assert_eq!(tasks_for(&cluster, "master-1").len(), max_retries as usize);

    assert_eq!(node(&cluster, "master-0").current_revision, 1);
    assert_eq!(node(&cluster, "master-2").current_revision, 1);

    let degraded = cluster.cluster_condition("Degraded");
    assert_eq!(degraded.status, ConditionStatus::True);
    assert_eq!(degraded.reason, "InstallerRetriesExhausted");
    assert!(degraded.message.contains("master-1"), "{}", degraded.message);
    assert!(cluster.cluster_condition_is("Available", ConditionStatus::True));
    assert!(cluster.cluster_condition_is("Progressing", ConditionStatus::True));
}

#[test]
fn scenario_new_revision_supersedes_exhausted_target() {
    let cluster = Cluster::new(&["master-0", "master-1", "master-2"]);
    cluster.installer().fail_node("master-1");
    cluster.settle(SETTLE_ROUNDS);
    assert!(cluster.cluster_condition_is("Degraded", ConditionStatus::True));

    cluster.installer().clear_failures();
    cluster.put_source_secret(KUBECONFIG_SOURCE, "kubeconfig", "v2");
    cluster.settle(SETTLE_ROUNDS);

    let recovered = node(&cluster, "master-1");
    assert_eq!(recovered.current_revision, 2);
    assert_eq!(recovered.last_failed_count, 0);
    assert!(cluster.cluster_condition_is("Degraded", ConditionStatus::False));
    assert!(cluster.cluster_condition_is("Progressing", ConditionStatus::False));
}

#[test]
fn scenario_serial_rollout_moves_one_node_at_a_time() {
    let settings = OperatorSettings {
        rollout_strategy: RolloutStrategy::Serial,
        ..test_settings()
    };
    let cluster = Cluster::with_settings(settings, &["master-0", "master-1", "master-2"]);
    cluster.settle(SETTLE_ROUNDS);
    cluster.put_source_secret(KUBECONFIG_SOURCE, "kubeconfig", "v2");

    for _ in 0..SETTLE_ROUNDS {
        let writes = cluster.round();
        let in_flight = rollouts(&cluster)
            .iter()
            .filter(|rollout| rollout.target_revision != rollout.current_revision)
            .count();
        assert!(in_flight <= 1, "{in_flight} nodes rolling out at once");
        if writes == 0 {
            break;
        }
    }
    for rollout in rollouts(&cluster) {
        assert_eq!(rollout.current_revision, 2, "{}", rollout.node_name);
    }
}

#[test]
fn scenario_removed_node_leaves_the_rollout() {
    let cluster = Cluster::new(&["master-0", "master-1", "master-2"]);
    cluster.settle(SETTLE_ROUNDS);

    cluster.remove_node("master-2");
    cluster.settle(SETTLE_ROUNDS);

    let names: Vec<String> = rollouts(&cluster)
        .into_iter()
        .map(|rollout| rollout.node_name)
        .collect();
    assert_eq!(names, vec!["master-0".to_string(), "master-1".to_string()]);
    assert!(cluster.cluster_condition_is("Available", ConditionStatus::True));
}
