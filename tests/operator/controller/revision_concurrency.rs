use staticpod_operator::operator::controller::informer::ResourceCache;
use staticpod_operator::operator::controller::revision::{
    RevisionController, REVISION_CONFIG_MAPS, REVISION_KEY, REVISION_SECRETS,
};
use staticpod_operator::operator::controller::Controller;
use staticpod_operator::operator::k8s::configmap::{ConfigMap, Secret};
use staticpod_operator::operator::k8s::operator::{OperatorConfig, OPERATOR_CONFIG_NAME};
use staticpod_operator::operator::k8s::revision::Revision;
use staticpod_operator::operator::k8s::store::DEFAULT_UPDATE_ATTEMPTS;
use staticpod_operator::operator::k8s::{ClusterStore, ObjectMeta};
use std::sync::Barrier;
use std::thread;

const NAMESPACE: &str = "openshift-kube-controller-manager";
const CONTENDERS: usize = 8;

fn seed(store: &ClusterStore) {
    store.create(&OperatorConfig::default_cluster()).unwrap();
    for input in REVISION_CONFIG_MAPS.iter().filter(|input| !input.optional) {
        store
            .create(&ConfigMap::new(ObjectMeta::namespaced(NAMESPACE, input.name)).with_data("data", "{}"))
            .unwrap();
    }
    for input in REVISION_SECRETS.iter().filter(|input| !input.optional) {
        store
            .create(&Secret::new(ObjectMeta::namespaced(NAMESPACE, input.name)).with_entry("data", b"v1"))
            .unwrap();
    }
}

/// Runs one reconcile per contender at the same moment, each with its own
/// controller instance, then one more to converge any that lost a race.
fn race(store: &ClusterStore) {
    let barrier = Barrier::new(CONTENDERS);
    thread::scope(|scope| {
        for _ in 0..CONTENDERS {
            scope.spawn(|| {
                let controller =
                    RevisionController::new(store.clone(), ResourceCache::new(store.clone()), NAMESPACE);
                barrier.wait();
                if let Err(err) = controller.reconcile(REVISION_KEY) {
                    assert!(err.is_transient(), "unexpected error: {err}");
                }
            });
        }
    });
    let controller = RevisionController::new(store.clone(), ResourceCache::new(store.clone()), NAMESPACE);
    controller.reconcile(REVISION_KEY).unwrap();
}

fn revision_numbers(store: &ClusterStore) -> Vec<u64> {
    let mut numbers: Vec<u64> = store
        .list::<Revision>(Some(NAMESPACE))
        .unwrap()
        .into_iter()
        .map(|revision| revision.number)
        .collect();
    numbers.sort_unstable();
    numbers
}

fn latest_available(store: &ClusterStore) -> u64 {
    store
        .get::<OperatorConfig>(None, OPERATOR_CONFIG_NAME)
        .unwrap()
        .unwrap()
        .status
        .latest_available_revision
}

#[test]
fn scenario_concurrent_reconciles_create_one_revision() {
    let store = ClusterStore::new();
    seed(&store);

    race(&store);

    assert_eq!(revision_numbers(&store), vec![1]);
    assert_eq!(latest_available(&store), 1);
}

#[test]
fn scenario_concurrent_reconciles_after_change_create_one_successor() {
    let store = ClusterStore::new();
    seed(&store);
    race(&store);

    store
        .update_with_retry::<Secret, _>(
            Some(NAMESPACE),
            "controller-manager-kubeconfig",
            DEFAULT_UPDATE_ATTEMPTS,
            |secret| {
                secret.data.clear();
                secret.data.insert("kubeconfig".into(), "djI=".into());
            },
        )
        .unwrap();
    race(&store);

    assert_eq!(revision_numbers(&store), vec![1, 2]);
    assert_eq!(latest_available(&store), 2);
    let successor: Revision = store.get(Some(NAMESPACE), "revision-2").unwrap().unwrap();
    assert_eq!(successor.reason, "secret/controller-manager-kubeconfig changed");
}

#[test]
fn scenario_latest_available_never_moves_backwards() {
    let store = ClusterStore::new();
    seed(&store);
    race(&store);
    store
        .update_with_retry::<OperatorConfig, _>(None, OPERATOR_CONFIG_NAME, DEFAULT_UPDATE_ATTEMPTS, |config| {
            config.status.latest_available_revision = 4;
        })
        .unwrap();

    race(&store);

    assert_eq!(latest_available(&store), 4);
    assert_eq!(revision_numbers(&store), vec![1]);
}
