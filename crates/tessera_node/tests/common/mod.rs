//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::time::{Duration, Instant};

use tessera_coord::DatabaseId;
use tessera_node::{start_embedded_node, EmbeddedNodeConfig, EmbeddedNodeHandle};

/// Timeout for node startup and polled conditions.
pub const IO_TIMEOUT: Duration = Duration::from_secs(20);

pub fn pick_free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

pub fn free_addr() -> SocketAddr {
    let port = pick_free_port().expect("free port");
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn test_dir(name: &str) -> tempfile::TempDir {
    tempfile::Builder::new()
        .prefix(&format!("tessera-node-{name}-"))
        .tempdir()
        .expect("create test dir")
}

/// Embedded nodes over real TCP; node 0 bootstraps the catalog and the rest
/// join through it.
pub struct TcpCluster {
    pub nodes: Vec<EmbeddedNodeHandle>,
    _dir: tempfile::TempDir,
}

impl TcpCluster {
    pub async fn start(size: usize, tune: impl Fn(&mut EmbeddedNodeConfig)) -> Self {
        let dir = test_dir("cluster");
        let mut nodes: Vec<EmbeddedNodeHandle> = Vec::with_capacity(size);
        for n in 0..size {
            let data_dir = dir.path().join(format!("node{n}"));
            let mut config = match nodes.first() {
                None => EmbeddedNodeConfig::bootstrap(free_addr(), data_dir),
                Some(seed) => EmbeddedNodeConfig::joining(free_addr(), data_dir, seed.id().clone()),
            };
            config.ready_timeout = IO_TIMEOUT;
            tune(&mut config);
            let handle = start_embedded_node(config)
                .await
                .unwrap_or_else(|err| panic!("start node{n}: {err:#}"));
            nodes.push(handle);
        }
        Self { nodes, _dir: dir }
    }

    pub fn node(&self, n: usize) -> &EmbeddedNodeHandle {
        &self.nodes[n]
    }

    /// Cleanly stop node `n` and remove it; later nodes shift down one index.
    /// Peers see connection refusals, as after a crash.
    pub async fn stop(&mut self, n: usize) -> DatabaseId {
        let handle = self.nodes.remove(n);
        let id = handle.id().clone();
        handle.shutdown().await.expect("shutdown node");
        id
    }

    pub async fn shutdown(self) {
        for node in self.nodes {
            node.shutdown().await.expect("shutdown node");
        }
    }
}

/// Poll `check` until it yields a value or `timeout` elapses.
pub async fn wait_for<T, F, Fut>(what: &str, timeout: Duration, mut check: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = check().await {
            return value;
        }
        if start.elapsed() > timeout {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
