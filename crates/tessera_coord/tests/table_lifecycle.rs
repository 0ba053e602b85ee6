//! Table lifecycle and locking through the catalog reference.
//!
//! Every test runs an in-process cluster (node 0 hosts the catalog) and
//! drives CREATE, DROP, queries and commits the way a query executor would:
//! take a proxy, run on its replicas, report per-replica outcomes.

mod common;

use std::time::Duration;

use common::{create_committed, node_id, release, test_config, Cluster};
use tessera_coord::{
    CatalogService, CommitPhase, CoordError, LockType, ReplicaOutcomes, TableInfo,
    TableManagerService,
};

#[tokio::test]
async fn create_registers_manager_and_metadata_copies() {
    let cluster = Cluster::start(3, test_config()).await;
    let (info, proxy) = create_committed(cluster.node(1), "app", "users").await;
    assert_eq!(proxy.replicas.len(), 2);
    assert!(proxy.replicas.contains(&node_id(1)));
    assert_eq!(proxy.update_id, 1);
    assert!(proxy.table.table_set > 0);

    let wrapper = cluster
        .node(2)
        .reference()
        .lookup_table_manager(&info)
        .await
        .expect("lookup")
        .expect("registered");
    assert_eq!(wrapper.owner, node_id(1));

    let catalog = cluster.node(2).reference().catalog().await.expect("catalog");
    assert!(catalog.exists(&info).await.expect("exists"));
    let locations = catalog.replica_locations(&info).await.expect("locations");
    assert!(locations.contains(&node_id(1)));
    let other = proxy
        .replicas
        .iter()
        .find(|node| **node != node_id(1))
        .expect("second replica");
    assert!(locations.contains(other), "metadata copy on {other} not recorded");
    let primaries = catalog.primary_locations().await.expect("primaries");
    assert!(primaries.contains(&(info.key(), node_id(1))));
}

#[tokio::test]
async fn duplicate_create_is_rejected() {
    let cluster = Cluster::start(3, test_config()).await;
    let (info, _) = create_committed(cluster.node(1), "app", "users").await;

    for n in [1, 2] {
        let session = cluster.node(n).session();
        let created = cluster
            .node(n)
            .create_table(TableInfo::new("app", "users"), &session)
            .await
            .expect("create call");
        assert!(created.is_none(), "node{n} created a duplicate");
    }
    assert!(cluster.node(2).local_manager(&info.key()).is_none());
    let managers = cluster
        .node(0)
        .reference()
        .catalog()
        .await
        .expect("catalog")
        .all_table_managers()
        .await
        .expect("managers");
    assert_eq!(managers.len(), 1);
}

#[tokio::test]
async fn membership_ids_and_table_sets_are_allocated_by_the_catalog() {
    let cluster = Cluster::start(3, test_config()).await;
    let catalog = cluster.node(0).reference().catalog().await.expect("catalog");
    let instances = catalog.database_instances().await.expect("instances");
    let mut ids: Vec<u64> = instances.iter().map(|i| i.connection_id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);

    let (_, first) = create_committed(cluster.node(1), "app", "a").await;
    let (_, second) = create_committed(cluster.node(1), "app", "b").await;
    assert_ne!(first.table.table_set, second.table.table_set);

    // Node 1 hosts two managers, so it is the least attractive placement.
    let machines = catalog.available_machines().await.expect("machines");
    assert_eq!(machines.len(), 3);
    assert_eq!(machines.last(), Some(&node_id(1)));

    let local = catalog.local_table_managers(&node_id(1)).await.expect("local");
    assert_eq!(local.len(), 2);
}

#[tokio::test]
async fn writer_excludes_readers_until_release() {
    let cluster = Cluster::start(3, test_config()).await;
    let (info, _) = create_committed(cluster.node(1), "app", "users").await;

    let writer = cluster.node(2).session();
    let write = cluster
        .node(2)
        .reference()
        .get_query_proxy(&info, LockType::Write, &writer)
        .await
        .expect("write proxy");
    assert_eq!(write.lock_granted, LockType::Write);
    assert_eq!(write.update_id, 2);

    let reader = cluster.node(0).session();
    let reader_ref = &reader;
    let attempt = cluster
        .node(0)
        .reference()
        .with_table_manager(&info, |manager| async move {
            manager.try_request_lock(LockType::Read, reader_ref).await
        })
        .await
        .expect("try lock");
    assert_eq!(attempt, LockType::None);

    let node0 = cluster.node(0).clone();
    let pending_info = info.clone();
    let pending_reader = reader.clone();
    let pending = tokio::spawn(async move {
        node0
            .reference()
            .get_query_proxy(&pending_info, LockType::Read, &pending_reader)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!pending.is_finished(), "reader admitted while writer holds the lock");

    cluster
        .node(2)
        .reference()
        .release_lock_and_update_replica_state(
            &info,
            true,
            &writer,
            &write.all_succeeded(),
            CommitPhase::Complete,
        )
        .await
        .expect("commit write");

    let read = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("reader admitted after release")
        .expect("join reader")
        .expect("read proxy");
    assert_eq!(read.lock_granted, LockType::Read);
    assert_eq!(read.update_id, 2);
    assert_eq!(read.replicas.len(), 2);
    release(cluster.node(0), &info, &reader).await;
}

#[tokio::test]
async fn failed_replica_drops_out_of_reads() {
    let cluster = Cluster::start(3, test_config().with_replication_factor(3)).await;
    let (info, proxy) = create_committed(cluster.node(1), "app", "orders").await;
    assert_eq!(proxy.replicas.len(), 3);
    let reference = cluster.node(1).reference();

    let writer = cluster.node(1).session();
    let write = reference
        .get_query_proxy(&info, LockType::Write, &writer)
        .await
        .expect("write proxy");
    assert_eq!(write.replicas.len(), 3);
    let mut outcomes = write.all_succeeded();
    outcomes.insert(node_id(2), false);
    reference
        .release_lock_and_update_replica_state(&info, true, &writer, &outcomes, CommitPhase::Complete)
        .await
        .expect("commit write");

    let reader = cluster.node(1).session();
    let read = reference
        .get_query_proxy(&info, LockType::Read, &reader)
        .await
        .expect("read proxy");
    assert_eq!(read.update_id, 2);
    assert_eq!(read.replicas.len(), 2);
    assert!(!read.replicas.contains(&node_id(2)));
    release(cluster.node(1), &info, &reader).await;

    // A rolled back write leaves the replica state alone.
    let writer = cluster.node(1).session();
    let write = reference
        .get_query_proxy(&info, LockType::Write, &writer)
        .await
        .expect("second write proxy");
    assert_eq!(write.replicas.len(), 3, "stale replicas still receive writes");
    reference
        .release_lock_and_update_replica_state(
            &info,
            false,
            &writer,
            &write.all_succeeded(),
            CommitPhase::Complete,
        )
        .await
        .expect("roll back");
    let active = reference
        .with_table_manager(&info, |manager| async move { manager.active_replicas().await })
        .await
        .expect("active replicas");
    assert_eq!(active.len(), 2);
    assert!(!active.contains(&node_id(2)));
}

#[tokio::test]
async fn two_phase_commit_keeps_lock_until_deferred_report() {
    let cluster = Cluster::start(3, test_config().with_replication_factor(3)).await;
    let (info, _) = create_committed(cluster.node(1), "app", "ledger").await;
    let reference = cluster.node(1).reference();

    let writer = cluster.node(1).session();
    let write = reference
        .get_query_proxy(&info, LockType::Write, &writer)
        .await
        .expect("write proxy");
    let partial: ReplicaOutcomes = [(node_id(1), true)].into_iter().collect();
    reference
        .release_lock_and_update_replica_state(&info, true, &writer, &partial, CommitPhase::Partial)
        .await
        .expect("first phase");

    let other = cluster.node(2).session();
    let other_ref = &other;
    let attempt = reference
        .with_table_manager(&info, |manager| async move {
            manager.try_request_lock(LockType::Read, other_ref).await
        })
        .await
        .expect("try lock");
    assert_eq!(attempt, LockType::None, "lock held until the deferred report");
    let active = reference
        .with_table_manager(&info, |manager| async move { manager.active_replicas().await })
        .await
        .expect("active after first phase");
    assert_eq!(active, vec![node_id(1)]);

    let deferred: ReplicaOutcomes = write
        .replicas
        .iter()
        .filter(|node| **node != node_id(1))
        .map(|node| (node.clone(), true))
        .collect();
    reference
        .release_lock_and_update_replica_state(&info, true, &writer, &deferred, CommitPhase::Deferred)
        .await
        .expect("deferred phase");

    let active = reference
        .with_table_manager(&info, |manager| async move { manager.active_replicas().await })
        .await
        .expect("active after deferred phase");
    assert_eq!(active.len(), 3);
    let attempt = reference
        .with_table_manager(&info, |manager| async move {
            manager.try_request_lock(LockType::Read, other_ref).await
        })
        .await
        .expect("try lock after release");
    assert_eq!(attempt, LockType::Read);
    release(cluster.node(1), &info, &other).await;
}

#[tokio::test]
async fn drop_removes_table_and_metadata_copies() {
    let cluster = Cluster::start(3, test_config()).await;
    let (info, _) = create_committed(cluster.node(1), "app", "events").await;
    let key = info.key();
    assert!(cluster.node(0).store().manager_state(&key).expect("read").is_some());

    let session = cluster.node(2).session();
    cluster.node(2).drop_table(&info, &session).await.expect("drop");

    let catalog = cluster.node(0).reference().catalog().await.expect("catalog");
    assert!(!catalog.exists(&info).await.expect("exists"));
    assert!(cluster.node(1).local_manager(&key).is_none());
    for n in 0..3 {
        let copy = cluster.node(n).store().manager_state(&key).expect("read");
        assert!(copy.is_none(), "node{n} kept manager state of a dropped table");
    }

    // The name is free again and starts from a fresh update id.
    let (_, proxy) = create_committed(cluster.node(2), "app", "events").await;
    assert_eq!(proxy.update_id, 1);
}

#[tokio::test]
async fn writer_queued_behind_drop_sees_table_gone() {
    let cluster = Cluster::start(3, test_config()).await;
    let (info, _) = create_committed(cluster.node(1), "app", "events").await;

    let first = cluster.node(1).session();
    let write = cluster
        .node(1)
        .reference()
        .get_query_proxy(&info, LockType::Write, &first)
        .await
        .expect("first write");

    let dropper = cluster.node(2).clone();
    let drop_info = info.clone();
    let drop_session = dropper.session();
    let dropping =
        tokio::spawn(async move { dropper.drop_table(&drop_info, &drop_session).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let node0 = cluster.node(0).clone();
    let queued_info = info.clone();
    let second = node0.session();
    let queued = tokio::spawn(async move {
        node0
            .reference()
            .get_query_proxy(&queued_info, LockType::Write, &second)
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!dropping.is_finished(), "DROP admitted while a WRITE is held");
    assert!(!queued.is_finished(), "second writer admitted while a WRITE is held");

    cluster
        .node(1)
        .reference()
        .release_lock_and_update_replica_state(
            &info,
            true,
            &first,
            &write.all_succeeded(),
            CommitPhase::Complete,
        )
        .await
        .expect("commit first write");

    tokio::time::timeout(Duration::from_secs(5), dropping)
        .await
        .expect("drop finishes")
        .expect("join drop")
        .expect("drop");
    let err = tokio::time::timeout(Duration::from_secs(5), queued)
        .await
        .expect("queued writer woken")
        .expect("join writer")
        .expect_err("table was dropped");
    assert!(matches!(err, CoordError::NotFound(_)), "unexpected error {err:?}");

    let catalog = cluster.node(0).reference().catalog().await.expect("catalog");
    assert!(!catalog.exists(&info).await.expect("exists"));
}

#[tokio::test]
async fn replicas_can_be_added_and_removed() {
    let cluster = Cluster::start(3, test_config().with_replication_factor(1)).await;
    let (info, proxy) = create_committed(cluster.node(1), "app", "solo").await;
    assert_eq!(proxy.replicas, vec![node_id(1)]);
    let reference = cluster.node(1).reference();
    let extra = node_id(2);
    let extra_ref = &extra;

    reference
        .with_table_manager(&info, |manager| async move { manager.add_replica(extra_ref).await })
        .await
        .expect("add replica");
    let all = reference
        .with_table_manager(&info, |manager| async move { manager.all_replicas().await })
        .await
        .expect("all replicas");
    assert_eq!(all, vec![node_id(1), node_id(2)]);
    let active = reference
        .with_table_manager(&info, |manager| async move { manager.active_replicas().await })
        .await
        .expect("active replicas");
    assert!(active.contains(&node_id(2)));

    reference
        .with_table_manager(&info, |manager| async move { manager.remove_replica(extra_ref).await })
        .await
        .expect("remove replica");
    let all = reference
        .with_table_manager(&info, |manager| async move { manager.all_replicas().await })
        .await
        .expect("all replicas after remove");
    assert_eq!(all, vec![node_id(1)]);

    let err = reference
        .with_table_manager(&info, |manager| async move { manager.remove_replica(extra_ref).await })
        .await
        .expect_err("second remove");
    assert!(matches!(err, CoordError::NotFound(_)));
}

#[tokio::test]
async fn schema_drop_removes_every_table_in_schema() {
    let cluster = Cluster::start(3, test_config()).await;
    let (a, _) = create_committed(cluster.node(1), "app", "a").await;
    let (b, _) = create_committed(cluster.node(2), "app", "b").await;
    let (c, _) = create_committed(cluster.node(1), "misc", "c").await;

    cluster.node(0).drop_schema("app").await.expect("drop schema");

    let catalog = cluster.node(0).reference().catalog().await.expect("catalog");
    assert!(!catalog.exists(&a).await.expect("exists a"));
    assert!(!catalog.exists(&b).await.expect("exists b"));
    assert!(catalog.exists(&c).await.expect("exists c"));
    assert!(cluster.node(2).local_manager(&b.key()).is_none());

    let err = catalog
        .remove_table_information(&TableInfo::new("app", "missing"))
        .await
        .expect_err("missing table");
    assert!(matches!(err, CoordError::NotFound(_)));
}

#[tokio::test]
async fn closed_node_stops_serving_its_managers() {
    let cluster = Cluster::start(3, test_config()).await;
    let (info, _) = create_committed(cluster.node(1), "app", "users").await;
    let handle = cluster
        .node(0)
        .reference()
        .lookup_table_manager(&info)
        .await
        .expect("lookup")
        .and_then(|wrapper| wrapper.handle)
        .expect("live handle");
    handle.ping().await.expect("manager answers before close");

    cluster.node(1).close().await;
    assert!(cluster.node(1).local_manager(&info.key()).is_none());
    assert!(cluster.node(1).local_managers().is_empty());

    let session = cluster.node(0).session();
    let err = handle
        .try_request_lock(LockType::Read, &session)
        .await
        .expect_err("closed manager refuses locks");
    assert!(err.is_relocation(), "unexpected error {err:?}");
}
