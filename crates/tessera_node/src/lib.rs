//! Node runtime for the tessera coordination layer: CLI options, the TCP
//! transport and RPC server, the liveness monitor, and an embedding API.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use tessera_coord::ring::CATALOG_LOOKUP_KEY;
use tessera_coord::{
    CatalogResolver, CoordConfig, DatabaseId, FjallStore, HashRing, LocatorFiles, MetadataStore,
    Node, RequestHandler, Transport,
};

pub mod monitor;
pub mod rpc_service;
pub mod transport;

use monitor::MonitorConfig;
use transport::TcpTransport;

/// Attempts made to register with the catalog before giving up.
const JOIN_ATTEMPTS: usize = 100;
const JOIN_RETRY_DELAY: Duration = Duration::from_millis(200);

/// CLI options for running a node.
#[derive(Parser, Clone, Debug)]
pub struct NodeArgs {
    /// Address the RPC server binds to.
    #[arg(long, env = "TESSERA_LISTEN")]
    pub listen: SocketAddr,

    /// Address peers use to reach this node. Defaults to `--listen`.
    #[arg(long, env = "TESSERA_ADVERTISE")]
    pub advertise: Option<String>,

    /// Database path component of this node's identity (`address/path`).
    #[arg(long, env = "TESSERA_DB_PATH", default_value = "tessera")]
    pub db_path: String,

    #[arg(long, env = "TESSERA_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Start (or recover) the catalog on this node.
    #[arg(long)]
    pub bootstrap: bool,

    /// Node to ask for the catalog location when joining, e.g. `10.0.0.1:7100/tessera`.
    #[arg(long, env = "TESSERA_JOIN")]
    pub join: Option<DatabaseId>,

    /// Comma-separated member list used to resolve the expected catalog host.
    #[arg(long, env = "TESSERA_PEERS", value_delimiter = ',')]
    pub peers: Vec<DatabaseId>,

    /// Locator file recording where the catalog and its state replicas live.
    /// Repeat for each copy; writers must reach a majority.
    #[arg(long = "locator")]
    pub locator: Vec<PathBuf>,

    /// Data replicas chosen for each new table.
    #[arg(long, env = "TESSERA_REPLICATION_FACTOR", default_value_t = 1)]
    pub replication_factor: usize,

    /// Nodes holding a copy of each table manager's metadata.
    #[arg(long, env = "TESSERA_MANAGER_REPLICATION_FACTOR", default_value_t = 2)]
    pub manager_replication_factor: usize,

    /// Peers receiving a copy of the catalog state after each change.
    #[arg(long, env = "TESSERA_CATALOG_REPLICATION_FACTOR", default_value_t = 2)]
    pub catalog_replication_factor: usize,

    /// Window after which an uncompleted migration is abandoned (ms).
    #[arg(long, env = "TESSERA_MIGRATION_TIMEOUT_MS", default_value_t = 10_000)]
    pub migration_timeout_ms: u64,

    /// Per-call RPC deadline (ms). Lock requests block while queued, so keep
    /// this well above the longest expected lock hold.
    #[arg(long, env = "TESSERA_RPC_TIMEOUT_MS", default_value_t = 30_000)]
    pub rpc_timeout_ms: u64,

    /// Liveness monitor interval on the catalog host (ms).
    #[arg(long, env = "TESSERA_MONITOR_INTERVAL_MS", default_value_t = 1000)]
    pub monitor_interval_ms: u64,
}

impl NodeArgs {
    pub fn node_id(&self) -> DatabaseId {
        let address = self
            .advertise
            .clone()
            .unwrap_or_else(|| self.listen.to_string());
        DatabaseId::new(address, self.db_path.clone())
    }

    fn coord_config(&self) -> CoordConfig {
        CoordConfig::default()
            .with_replication_factor(self.replication_factor)
            .with_manager_replication_factor(self.manager_replication_factor)
            .with_catalog_replication_factor(self.catalog_replication_factor)
            .with_migration_timeout(Duration::from_millis(self.migration_timeout_ms.max(1)))
    }
}

/// Run a node until ctrl-c.
pub async fn run_node(args: NodeArgs) -> anyhow::Result<()> {
    run_node_with_shutdown(args, tokio::signal::ctrl_c()).await
}

/// Run a node until `shutdown` resolves.
pub async fn run_node_with_shutdown<F>(args: NodeArgs, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    run_node_inner(args, shutdown, None).await
}

async fn run_node_inner<F>(
    args: NodeArgs,
    shutdown: F,
    ready: Option<oneshot::Sender<Arc<Node>>>,
) -> anyhow::Result<()>
where
    F: std::future::Future<Output = Result<(), std::io::Error>> + Send,
{
    if args.bootstrap && args.join.is_some() {
        anyhow::bail!("--bootstrap and --join are mutually exclusive");
    }
    if !args.bootstrap && args.join.is_none() && args.peers.is_empty() && args.locator.is_empty() {
        anyhow::bail!("a node needs --bootstrap, --join, --peers or --locator to find the catalog");
    }

    std::fs::create_dir_all(&args.data_dir).context("create data dir")?;
    let store = FjallStore::open_dir(args.data_dir.join("metadata"))?;
    let store: Arc<dyn MetadataStore> = Arc::new(store);
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(Duration::from_millis(
        args.rpc_timeout_ms,
    )));
    let locator = if args.locator.is_empty() {
        None
    } else {
        Some(Arc::new(LocatorFiles::new(args.locator.clone())))
    };

    let id = args.node_id();
    let node = Node::new(id.clone(), args.coord_config(), store, transport, locator);
    let mut ring_owner = None;
    if !args.peers.is_empty() {
        let ring = HashRing::new(args.peers.clone());
        ring_owner = ring.owner(CATALOG_LOOKUP_KEY).cloned();
        let resolver: Arc<dyn CatalogResolver> = Arc::new(ring);
        node.set_resolver(resolver);
    }

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind rpc listener on {}", args.listen))?;
    let server = tokio::spawn({
        let handler: Arc<dyn RequestHandler> = node.clone();
        async move {
            if let Err(err) = rpc_service::run(listener, handler).await {
                // Log server failures without crashing the node task.
                tracing::error!(error = ?err, "rpc server failed");
            }
        }
    });

    let started = if args.bootstrap || ring_owner.as_ref() == Some(&id) {
        node.bootstrap_catalog()
            .await
            .context("start catalog")
            .map(|_| ())
    } else {
        if let Some(seed) = &args.join {
            node.reference().set_catalog_location(Some(seed.clone()));
        }
        join_cluster(&node).await.map(|connection_id| {
            tracing::info!(node = %id, connection_id, "joined cluster");
        })
    };
    if let Err(err) = started {
        server.abort();
        node.close().await;
        return Err(err);
    }

    let monitor = monitor::spawn(
        node.clone(),
        MonitorConfig {
            interval: Duration::from_millis(args.monitor_interval_ms.max(10)),
        },
    );

    tracing::info!(
        node = %id,
        listen = %args.listen,
        catalog = node.hosts_catalog(),
        "node started"
    );
    if let Some(ready) = ready {
        let _ = ready.send(node.clone());
    }

    let result = shutdown.await.context("wait for shutdown signal");
    monitor.abort();
    server.abort();
    node.close().await;
    tracing::info!(node = %id, "node stopped");
    result
}

async fn join_cluster(node: &Node) -> anyhow::Result<u64> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match node.join().await {
            Ok(connection_id) => return Ok(connection_id),
            Err(err) if attempt < JOIN_ATTEMPTS => {
                tracing::debug!(attempt, error = %err, "catalog not reachable yet; retrying join");
                tokio::time::sleep(JOIN_RETRY_DELAY).await;
            }
            Err(err) => return Err(err).context("join cluster"),
        }
    }
}

/// Minimal embeddable configuration for running a node inside another process.
#[derive(Clone, Debug)]
pub struct EmbeddedNodeConfig {
    pub listen: SocketAddr,
    pub db_path: String,
    pub data_dir: PathBuf,
    pub bootstrap: bool,
    pub join: Option<DatabaseId>,
    pub peers: Vec<DatabaseId>,
    pub locator: Vec<PathBuf>,
    pub replication_factor: usize,
    pub migration_timeout: Duration,
    pub rpc_timeout: Duration,
    pub monitor_interval: Duration,
    pub ready_timeout: Duration,
}

impl EmbeddedNodeConfig {
    /// A node that starts the catalog.
    pub fn bootstrap(listen: SocketAddr, data_dir: PathBuf) -> Self {
        Self {
            listen,
            db_path: "tessera".to_string(),
            data_dir,
            bootstrap: true,
            join: None,
            peers: Vec::new(),
            locator: Vec::new(),
            replication_factor: 1,
            migration_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            monitor_interval: Duration::from_secs(1),
            ready_timeout: Duration::from_secs(20),
        }
    }

    /// A node that joins through `seed`.
    pub fn joining(listen: SocketAddr, data_dir: PathBuf, seed: DatabaseId) -> Self {
        Self {
            bootstrap: false,
            join: Some(seed),
            ..Self::bootstrap(listen, data_dir)
        }
    }
}

/// A node running on the current tokio runtime.
pub struct EmbeddedNodeHandle {
    node: Arc<Node>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl EmbeddedNodeHandle {
    pub fn id(&self) -> &DatabaseId {
        self.node.id()
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Close the hosted services and wait for the node task to exit.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        match self.task.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("tessera node task join failed: {err}")),
        }
    }

    /// Cancel the node task without closing the hosted services.
    pub fn abort(&self) {
        self.task.abort();
    }
}

pub fn build_node_args(config: &EmbeddedNodeConfig) -> anyhow::Result<NodeArgs> {
    let mut argv = vec![
        "tessera-node".to_string(),
        "--listen".to_string(),
        config.listen.to_string(),
        "--db-path".to_string(),
        config.db_path.clone(),
        "--data-dir".to_string(),
        config.data_dir.display().to_string(),
        "--replication-factor".to_string(),
        config.replication_factor.max(1).to_string(),
        "--migration-timeout-ms".to_string(),
        config.migration_timeout.as_millis().to_string(),
        "--rpc-timeout-ms".to_string(),
        config.rpc_timeout.as_millis().to_string(),
        "--monitor-interval-ms".to_string(),
        config.monitor_interval.as_millis().to_string(),
    ];

    if config.bootstrap {
        argv.push("--bootstrap".to_string());
    } else if let Some(join) = &config.join {
        argv.push("--join".to_string());
        argv.push(join.to_string());
    } else if config.peers.is_empty() && config.locator.is_empty() {
        anyhow::bail!("embedded node config requires bootstrap=true, a join seed, peers or locator files");
    }

    if !config.peers.is_empty() {
        let peers: Vec<String> = config.peers.iter().map(ToString::to_string).collect();
        argv.push("--peers".to_string());
        argv.push(peers.join(","));
    }
    for path in &config.locator {
        argv.push("--locator".to_string());
        argv.push(path.display().to_string());
    }

    NodeArgs::try_parse_from(argv).map_err(|err| anyhow::anyhow!(err.to_string()))
}

/// Start a node in-process and wait until it serves requests (or
/// `ready_timeout` elapses).
pub async fn start_embedded_node(config: EmbeddedNodeConfig) -> anyhow::Result<EmbeddedNodeHandle> {
    let args = build_node_args(&config)?;
    let wait_timeout = config.ready_timeout.max(Duration::from_secs(1));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = oneshot::channel::<Arc<Node>>();
    let task = tokio::spawn(async move {
        run_node_inner(
            args,
            async move {
                let _ = shutdown_rx.await;
                Ok::<(), std::io::Error>(())
            },
            Some(ready_tx),
        )
        .await
    });

    match tokio::time::timeout(wait_timeout, ready_rx).await {
        Ok(Ok(node)) => Ok(EmbeddedNodeHandle {
            node,
            shutdown_tx: Some(shutdown_tx),
            task,
        }),
        // The ready sender was dropped: the node task exited during startup.
        Ok(Err(_)) => match task.await {
            Ok(Err(err)) => Err(err.context("embedded tessera node failed to start")),
            Ok(Ok(())) => Err(anyhow::anyhow!(
                "embedded tessera node exited before becoming ready"
            )),
            Err(err) => Err(anyhow::anyhow!("tessera node task join failed: {err}")),
        },
        Err(_) => {
            task.abort();
            Err(anyhow::anyhow!(
                "timeout waiting for tessera node on {} to become ready",
                config.listen
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_config_round_trips_through_cli_parsing() {
        let seed: DatabaseId = "127.0.0.1:7100/tessera".parse().expect("seed id");
        let mut config = EmbeddedNodeConfig::joining(
            "127.0.0.1:7101".parse().expect("addr"),
            PathBuf::from("/tmp/tessera-n1"),
            seed.clone(),
        );
        config.peers = vec![seed.clone(), "127.0.0.1:7101/tessera".parse().expect("peer")];
        config.locator = vec![PathBuf::from("/tmp/a.json"), PathBuf::from("/tmp/b.json")];

        let args = build_node_args(&config).expect("args");
        assert!(!args.bootstrap);
        assert_eq!(args.join, Some(seed));
        assert_eq!(args.peers.len(), 2);
        assert_eq!(args.locator.len(), 2);
        assert_eq!(args.node_id().to_string(), "127.0.0.1:7101/tessera");
    }

    #[test]
    fn embedded_config_requires_a_way_to_find_the_catalog() {
        let mut config = EmbeddedNodeConfig::bootstrap(
            "127.0.0.1:7100".parse().expect("addr"),
            PathBuf::from("/tmp/tessera-n0"),
        );
        config.bootstrap = false;
        assert!(build_node_args(&config).is_err());
    }

    #[test]
    fn advertised_address_overrides_listen_address() {
        let args = NodeArgs::try_parse_from([
            "tessera-node",
            "--listen",
            "0.0.0.0:7100",
            "--advertise",
            "10.0.0.5:7100",
            "--data-dir",
            "/tmp/x",
            "--bootstrap",
        ])
        .expect("parse");
        assert_eq!(args.node_id(), DatabaseId::new("10.0.0.5:7100", "tessera"));
        assert_eq!(args.manager_replication_factor, 2);
    }
}
