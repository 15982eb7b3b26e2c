use staticpod_operator::operator::k8s::installer::InstallerTask;
use staticpod_operator::operator::test_support::{test_settings, Cluster, KUBECONFIG_SOURCE};
use staticpod_operator::operator::OperatorSettings;

const SETTLE_ROUNDS: usize = 60;

fn cluster_with_retention(retention: usize, nodes: &[&str]) -> Cluster {
    let settings = OperatorSettings {
        revision_retention: retention,
        ..test_settings()
    };
    Cluster::with_settings(settings, nodes)
}

fn roll_revisions(cluster: &Cluster, count: usize) {
    for generation in 2..=count + 1 {
        cluster.put_source_secret(KUBECONFIG_SOURCE, "kubeconfig", &format!("v{generation}"));
        cluster.settle(SETTLE_ROUNDS);
    }
}

fn task_revisions(cluster: &Cluster) -> Vec<u64> {
    let mut revisions: Vec<u64> = cluster
        .store()
        .list::<InstallerTask>(Some(cluster.namespace()))
        .unwrap()
        .into_iter()
        .map(|task| task.revision)
        .collect();
    revisions.sort_unstable();
    revisions.dedup();
    revisions
}

#[test]
fn scenario_old_revisions_beyond_retention_are_pruned() {
    let cluster = cluster_with_retention(2, &["master-0", "master-1"]);
    cluster.settle(SETTLE_ROUNDS);
    roll_revisions(&cluster, 6);

    assert_eq!(cluster.revisions(), vec![5, 6, 7]);
    assert_eq!(task_revisions(&cluster), vec![5, 6, 7]);
}

#[test]
fn scenario_spec_limit_overrides_retention() {
    let cluster = cluster_with_retention(5, &["master-0"]);
    cluster.settle(SETTLE_ROUNDS);
    cluster.edit_operator_config(|config| config.spec.succeeded_revision_limit = Some(1));
    roll_revisions(&cluster, 4);

    assert_eq!(cluster.revisions(), vec![4, 5]);
}

#[test]
fn scenario_revision_still_served_by_a_node_survives() {
    let cluster = cluster_with_retention(2, &["master-0", "master-1"]);
    cluster.settle(SETTLE_ROUNDS);
    cluster.installer().fail_node("master-1");
    roll_revisions(&cluster, 4);

    let stuck = cluster
        .operator_config()
        .status
        .node_statuses
        .into_iter()
        .find(|rollout| rollout.node_name == "master-1")
        .unwrap();
    assert_eq!(stuck.current_revision, 1);
    assert_eq!(stuck.target_revision, 5);
    assert_eq!(cluster.revisions(), vec![1, 3, 4, 5]);
}

#[test]
fn scenario_retention_zero_keeps_only_protected_revisions() {
    let cluster = cluster_with_retention(0, &["master-0"]);
    cluster.settle(SETTLE_ROUNDS);
    roll_revisions(&cluster, 3);

    assert_eq!(cluster.revisions(), vec![4]);
}
