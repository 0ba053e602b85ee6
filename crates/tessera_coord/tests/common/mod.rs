//! Shared helpers for in-process cluster tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tessera_coord::{
    CommitPhase, CoordConfig, DatabaseId, LocalTransport, LocatorFiles, LockRequest, LockType,
    MemoryStore, MetadataStore, Node, RequestHandler, TableInfo, TableProxy, Transport,
};

/// Short migration window so expiry paths run quickly.
pub const TEST_MIGRATION_TIMEOUT: Duration = Duration::from_millis(150);

pub fn node_id(n: usize) -> DatabaseId {
    DatabaseId::new(format!("127.0.0.1:{}", 7300 + n), format!("db{n}"))
}

pub fn test_config() -> CoordConfig {
    CoordConfig::default()
        .with_replication_factor(2)
        .with_migration_timeout(TEST_MIGRATION_TIMEOUT)
}

/// N nodes wired through one `LocalTransport`; node 0 bootstraps the catalog.
pub struct Cluster {
    pub transport: Arc<LocalTransport>,
    pub nodes: Vec<Arc<Node>>,
}

impl Cluster {
    pub async fn start(size: usize, config: CoordConfig) -> Self {
        Self::start_inner(size, config, None).await
    }

    /// Same as `start`, with every node sharing the given locator files.
    pub async fn start_with_locator(size: usize, config: CoordConfig, paths: Vec<PathBuf>) -> Self {
        Self::start_inner(size, config, Some(paths)).await
    }

    async fn start_inner(size: usize, config: CoordConfig, locator_paths: Option<Vec<PathBuf>>) -> Self {
        let transport = LocalTransport::new();
        let shared: Arc<dyn Transport> = transport.clone();
        let mut nodes = Vec::with_capacity(size);
        for n in 0..size {
            let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
            let locator = locator_paths
                .clone()
                .map(|paths| Arc::new(LocatorFiles::new(paths)));
            let node = Node::new(node_id(n), config.clone(), store, shared.clone(), locator);
            let weak = Arc::downgrade(&node);
            let handler: Weak<dyn RequestHandler> = weak;
            transport.register(node_id(n), handler);
            nodes.push(node);
        }

        nodes[0].bootstrap_catalog().await.expect("bootstrap catalog");
        for node in nodes.iter().skip(1) {
            node.reference().set_catalog_location(Some(node_id(0)));
            node.join().await.expect("join cluster");
        }
        Self { transport, nodes }
    }

    pub fn node(&self, n: usize) -> &Arc<Node> {
        &self.nodes[n]
    }

    /// Make a node unreachable for every peer.
    pub fn crash(&self, n: usize) {
        self.transport.set_down(&node_id(n), true);
    }
}

pub fn all_ok(proxy: &TableProxy) -> tessera_coord::ReplicaOutcomes {
    proxy.all_succeeded()
}

/// CREATE `schema.table` from `node` and commit it on every chosen replica.
pub async fn create_committed(node: &Node, schema: &str, table: &str) -> (TableInfo, TableProxy) {
    let info = TableInfo::new(schema, table);
    let session = node.session();
    let proxy = node
        .create_table(info.clone(), &session)
        .await
        .expect("create table")
        .expect("table did not exist");
    assert_eq!(proxy.lock_granted, LockType::Create);
    node.reference()
        .release_lock_and_update_replica_state(
            &info,
            true,
            &session,
            &all_ok(&proxy),
            CommitPhase::Complete,
        )
        .await
        .expect("commit create");
    (info, proxy)
}

pub async fn release(node: &Node, info: &TableInfo, session: &LockRequest) {
    node.reference()
        .release_lock_and_update_replica_state(
            info,
            false,
            session,
            &Default::default(),
            CommitPhase::Complete,
        )
        .await
        .expect("release lock");
}

pub fn test_dir(name: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(&format!("tessera-{name}-"))
        .tempdir()
        .expect("create test dir")
}
