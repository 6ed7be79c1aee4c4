//! Mesh lifecycle: enrolment, simulation creation and teardown, stash.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use simmesh_ident::{MachineId, Mp, Mpo, OwnerId, ProcessId};
use simmesh_memory::{FixedProvider, ProviderCounters};
use simmesh_runtime::{
    BehaviorFactory, FileStash, Idle, Network, NetworkConfig, RuntimeError, SimConfig,
};

fn quick_config() -> NetworkConfig {
    NetworkConfig {
        sim: SimConfig {
            clock_period: Duration::from_millis(10),
        },
        ..NetworkConfig::default()
    }
}

fn idle_behaviors() -> BehaviorFactory {
    Arc::new(|_| Box::new(Idle))
}

/// Poll until the leaf reports no live simulations.
async fn drained(net: &Network, mp: Mp) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if net.simulations(mp).await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("simulation did not stop in time");
}

/// Poll until every construction has been matched by a destruction.
async fn balanced(counters: &ProviderCounters) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if counters.shared_live() == 0 && counters.heap_live() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("object memory was not released");
}

#[tokio::test]
async fn enrolment_builds_the_tree() {
    let net = Network::new(quick_config(), Arc::new(FixedProvider::default()));
    let daemon = net.enrole_daemon().await.unwrap();
    let leaf = net.enrole_leaf(&daemon, idle_behaviors()).await.unwrap();

    assert_eq!(net.machines().await.unwrap(), vec![daemon.mpo().machine()]);
    assert_eq!(
        net.processes(daemon.mpo().machine()).await.unwrap(),
        vec![leaf.mpo().mp()]
    );
    assert!(net.simulations(leaf.mpo().mp()).await.unwrap().is_empty());
}

#[tokio::test]
async fn simulation_lifecycle_balances_memory() {
    let provider = FixedProvider::default();
    let counters = provider.counters();
    let net = Network::new(quick_config(), Arc::new(provider));
    let daemon = net.enrole_daemon().await.unwrap();
    let leaf = net.enrole_leaf(&daemon, idle_behaviors()).await.unwrap();
    let mp = leaf.mpo().mp();

    let mpo = net.create_simulation(&leaf).await.unwrap();
    assert_eq!(mpo.mp(), mp);
    assert_eq!(net.simulations(mp).await.unwrap(), vec![mpo]);
    // the root object is live: one shared part, one heap extension
    assert_eq!(counters.shared_live(), 1);
    assert_eq!(counters.heap_live(), 1);

    net.destroy_simulation(mpo).await.unwrap();
    drained(&net, mp).await;
    balanced(&counters).await;
}

#[tokio::test]
async fn owner_slots_are_reused_after_teardown() {
    let net = Network::new(quick_config(), Arc::new(FixedProvider::default()));
    let daemon = net.enrole_daemon().await.unwrap();
    let leaf = net.enrole_leaf(&daemon, idle_behaviors()).await.unwrap();
    let mp = leaf.mpo().mp();

    let first = net.create_simulation(&leaf).await.unwrap();
    net.destroy_simulation(first).await.unwrap();
    drained(&net, mp).await;

    // the freed slot sits at the front of the free list
    let second = net.create_simulation(&leaf).await.unwrap();
    assert_eq!(second, first);
    net.destroy_simulation(second).await.unwrap();
    drained(&net, mp).await;
}

#[tokio::test]
async fn destroy_without_a_daemon_is_rejected() {
    let net = Network::new(quick_config(), Arc::new(FixedProvider::default()));
    let nowhere = Mpo::new(MachineId::new(7), ProcessId::new(0), OwnerId::new(1));

    let err = net.destroy_simulation(nowhere).await.unwrap_err();
    assert!(matches!(err, RuntimeError::NoDaemon(_)));
}

#[tokio::test]
async fn address_ceiling_rejects_creation() {
    let config = NetworkConfig {
        max_addresses: 1,
        ..quick_config()
    };
    let net = Network::new(config, Arc::new(FixedProvider::default()));
    let daemon = net.enrole_daemon().await.unwrap();
    let leaf = net.enrole_leaf(&daemon, idle_behaviors()).await.unwrap();

    // the first simulation takes the only address for its root object
    net.create_simulation(&leaf).await.unwrap();
    let err = net.create_simulation(&leaf).await.unwrap_err();
    assert!(matches!(err, RuntimeError::AddressSpaceExhausted(1)));
}

#[tokio::test]
async fn disconnect_leaf_releases_its_simulations() {
    let provider = FixedProvider::default();
    let counters = provider.counters();
    let net = Network::new(quick_config(), Arc::new(provider));
    let daemon = net.enrole_daemon().await.unwrap();
    let leaf = net.enrole_leaf(&daemon, idle_behaviors()).await.unwrap();
    let mp = leaf.mpo().mp();
    net.create_simulation(&leaf).await.unwrap();

    net.disconnect_leaf(&daemon, leaf).await.unwrap();

    // the process slot is gone from the tree
    let err = net.simulations(mp).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Address(_)));
    // its hosted simulation drained and released its memory
    balanced(&counters).await;
}

#[tokio::test]
async fn disconnect_daemon_frees_the_machine_slot() {
    let net = Network::new(quick_config(), Arc::new(FixedProvider::default()));
    let daemon = net.enrole_daemon().await.unwrap();
    let machine = daemon.mpo().machine();
    net.enrole_leaf(&daemon, idle_behaviors()).await.unwrap();

    net.disconnect_daemon(daemon).await.unwrap();
    assert!(net.machines().await.unwrap().is_empty());

    // the slot is mintable again
    let next = net.enrole_daemon().await.unwrap();
    assert_eq!(next.mpo().machine(), machine);
}

#[tokio::test]
async fn stash_round_trips_through_the_mesh() {
    let net = Network::new(quick_config(), Arc::new(FixedProvider::default()));

    net.stash("layout/v1", 7, Bytes::from_static(b"artifact"))
        .await
        .unwrap();
    assert_eq!(
        net.restore("layout/v1", 7).await.unwrap(),
        Some(Bytes::from_static(b"artifact"))
    );
    // a changed determinant invalidates the entry
    assert_eq!(net.restore("layout/v1", 8).await.unwrap(), None);

    net.clear_stash().await.unwrap();
    assert_eq!(net.restore("layout/v1", 7).await.unwrap(), None);
}

#[tokio::test]
async fn file_stash_survives_a_new_mesh() {
    let dir = tempfile::tempdir().unwrap();
    {
        let net = Network::with_stash(
            quick_config(),
            Arc::new(FixedProvider::default()),
            Box::new(FileStash::new(dir.path()).unwrap()),
        );
        net.stash("root", 1, Bytes::from_static(b"image"))
            .await
            .unwrap();
    }

    let net = Network::with_stash(
        quick_config(),
        Arc::new(FixedProvider::default()),
        Box::new(FileStash::new(dir.path()).unwrap()),
    );
    assert_eq!(
        net.restore("root", 1).await.unwrap(),
        Some(Bytes::from_static(b"image"))
    );
}
