use staticpod_operator::operator::k8s::cluster::{CloudConfigReference, Infrastructure};
use staticpod_operator::operator::k8s::configmap::{ConfigMap, Secret};
use staticpod_operator::operator::k8s::operator::{
    ConditionStatus, GLOBAL_MACHINE_CONFIG_NAMESPACE, GLOBAL_USER_CONFIG_NAMESPACE,
};
use staticpod_operator::operator::k8s::revision::Revision;
use staticpod_operator::operator::k8s::store::DEFAULT_UPDATE_ATTEMPTS;
use staticpod_operator::operator::k8s::ObjectMeta;
use staticpod_operator::operator::test_support::{Cluster, KUBECONFIG_SOURCE, SERVICE_ACCOUNT_CA_SOURCE};

const SETTLE_ROUNDS: usize = 60;
const KUBECONFIG_DESTINATION: &str = "controller-manager-kubeconfig";

fn destination_secret(cluster: &Cluster) -> Option<Secret> {
    cluster
        .store()
        .get(Some(cluster.namespace()), KUBECONFIG_DESTINATION)
        .unwrap()
}

fn operator_condition(cluster: &Cluster, condition_type: &str) -> Option<(ConditionStatus, String)> {
    cluster
        .operator_config()
        .status
        .conditions
        .into_iter()
        .find(|condition| condition.condition_type == condition_type)
        .map(|condition| (condition.status, condition.reason))
}

#[test]
fn scenario_source_content_reaches_destination() {
    let cluster = Cluster::new(&["master-0"]);
    cluster.settle(SETTLE_ROUNDS);

    let secret = destination_secret(&cluster).expect("destination synced");
    assert_eq!(secret.get_key_bytes("kubeconfig").unwrap(), b"v1");

    cluster.put_source_secret(KUBECONFIG_SOURCE, "kubeconfig", "v2");
    cluster.settle(SETTLE_ROUNDS);
    let secret = destination_secret(&cluster).unwrap();
    assert_eq!(secret.get_key_bytes("kubeconfig").unwrap(), b"v2");
}

#[test]
fn scenario_manual_destination_edit_is_reverted_without_new_revision() {
    let cluster = Cluster::new(&["master-0"]);
    cluster.settle(SETTLE_ROUNDS);
    assert_eq!(cluster.revisions(), vec![1]);

    cluster
        .store()
        .update_with_retry::<Secret, _>(
            Some(cluster.namespace()),
            KUBECONFIG_DESTINATION,
            DEFAULT_UPDATE_ATTEMPTS,
            |secret| {
                *secret = Secret::new(secret.metadata.clone()).with_entry("kubeconfig", b"tampered");
            },
        )
        .unwrap();
    cluster.settle(SETTLE_ROUNDS);

    let secret = destination_secret(&cluster).unwrap();
    assert_eq!(secret.get_key_bytes("kubeconfig").unwrap(), b"v1");
    assert_eq!(cluster.revisions(), vec![1]);
}

#[test]
fn scenario_removed_service_account_ca_blocks_new_revisions() {
    let cluster = Cluster::new(&["master-0", "master-1"]);
    cluster.settle(SETTLE_ROUNDS);
    let namespace = cluster.namespace().to_string();
    assert!(cluster
        .store()
        .get::<ConfigMap>(Some(&namespace), SERVICE_ACCOUNT_CA_SOURCE)
        .unwrap()
        .is_some());

    cluster
        .store()
        .delete::<ConfigMap>(Some(GLOBAL_MACHINE_CONFIG_NAMESPACE), SERVICE_ACCOUNT_CA_SOURCE, None)
        .unwrap();
    cluster.settle(SETTLE_ROUNDS);

    assert!(cluster
        .store()
        .get::<ConfigMap>(Some(&namespace), SERVICE_ACCOUNT_CA_SOURCE)
        .unwrap()
        .is_none());
    assert_eq!(
        operator_condition(&cluster, "RevisionControllerDegraded"),
        Some((ConditionStatus::True, "ContentCreationError".to_string()))
    );
    assert_eq!(cluster.revisions(), vec![1]);

    cluster.put_source_config_map(SERVICE_ACCOUNT_CA_SOURCE, "ca-bundle.crt", "ca-v2");
    cluster.settle(SETTLE_ROUNDS);

    assert_eq!(
        operator_condition(&cluster, "RevisionControllerDegraded"),
        Some((ConditionStatus::False, "AsExpected".to_string()))
    );
    assert_eq!(cluster.revisions(), vec![1, 2]);
    let revision: Revision = cluster.store().get(Some(&namespace), "revision-2").unwrap().unwrap();
    assert_eq!(revision.reason, "configmap/serviceaccount-ca changed");
}

#[test]
fn scenario_missing_required_source_degrades_until_restored() {
    let cluster = Cluster::new(&["master-0"]);
    cluster.settle(SETTLE_ROUNDS);

    cluster
        .store()
        .delete::<Secret>(Some(GLOBAL_MACHINE_CONFIG_NAMESPACE), KUBECONFIG_SOURCE, None)
        .unwrap();
    cluster.settle(SETTLE_ROUNDS);

    assert_eq!(
        operator_condition(&cluster, "ResourceSyncControllerDegraded"),
        Some((ConditionStatus::True, "RequiredSourceMissing".to_string()))
    );
    assert!(cluster.cluster_condition_is("Degraded", ConditionStatus::True));
    assert_eq!(cluster.revisions(), vec![1]);

    cluster.put_source_secret(KUBECONFIG_SOURCE, "kubeconfig", "v1");
    cluster.settle(SETTLE_ROUNDS);

    assert_eq!(
        operator_condition(&cluster, "ResourceSyncControllerDegraded"),
        Some((ConditionStatus::False, "AsExpected".to_string()))
    );
    assert!(cluster.cluster_condition_is("Degraded", ConditionStatus::False));
    assert_eq!(cluster.revisions(), vec![1]);
}

#[test]
fn scenario_cloud_config_reference_registers_a_sync_rule() {
    let cluster = Cluster::new(&["master-0"]);
    cluster.settle(SETTLE_ROUNDS);
    let namespace = cluster.namespace().to_string();

    cluster
        .store()
        .create(
            &ConfigMap::new(ObjectMeta::namespaced(GLOBAL_USER_CONFIG_NAMESPACE, "cloud-provider-config"))
                .with_data("cloud.conf", "[Global]\n"),
        )
        .unwrap();
    cluster
        .store()
        .update_with_retry::<Infrastructure, _>(None, "cluster", DEFAULT_UPDATE_ATTEMPTS, |infrastructure| {
            infrastructure.cloud_config = Some(CloudConfigReference {
                namespace: None,
                name: "cloud-provider-config".to_string(),
                key: "cloud.conf".to_string(),
            });
        })
        .unwrap();
    cluster.settle(SETTLE_ROUNDS);

    let synced: ConfigMap = cluster
        .store()
        .get(Some(&namespace), "cloud-config")
        .unwrap()
        .expect("cloud config synced");
    assert_eq!(synced.data.get("cloud.conf").map(String::as_str), Some("[Global]\n"));
    let observed = cluster.operator_config().spec.observed_config;
    let cloud_config = observed
        .pointer("/extendedArguments/cloud-config/0")
        .and_then(|value| value.as_str());
    assert_eq!(
        cloud_config,
        Some("/etc/kubernetes/static-pod-resources/configmaps/cloud-config/cloud.conf")
    );
}
