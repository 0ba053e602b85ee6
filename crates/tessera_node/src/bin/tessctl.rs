//! Minimal admin client for the catalog and node RPCs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use tessera_coord::remote::RemoteCatalog;
use tessera_coord::transport::NodeRequest;
use tessera_coord::{
    expect_response, CatalogService, DatabaseId, DatabaseInstanceWrapper, Request, Response,
    TableInfo, TableManagerDescriptor, Transport,
};
use tessera_node::transport::TcpTransport;

#[derive(Parser)]
#[command(name = "tessctl")]
#[command(about = "Admin client for a tessera cluster", long_about = None)]
struct Args {
    /// Any cluster member (`address/path`); requests are routed to the catalog host.
    #[arg(long, default_value = "127.0.0.1:7100/tessera")]
    target: DatabaseId,
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print membership and the table directory as JSON.
    State,
    /// List tables with their manager location.
    Tables,
    /// Show where a table's manager lives and where its replicas are.
    Lookup {
        #[arg(long)]
        schema: String,
        #[arg(long)]
        table: String,
    },
    /// Report a node as failed; its table managers are recreated elsewhere.
    Suspect {
        #[arg(long)]
        node: DatabaseId,
    },
    /// Ping every table manager and recreate the unreachable ones.
    Check,
    /// Move the catalog to `--to` (defaults to the target node).
    MigrateCatalog {
        #[arg(long)]
        to: Option<DatabaseId>,
    },
    /// Move a table manager to `--to`.
    MigrateManager {
        #[arg(long)]
        schema: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        to: DatabaseId,
    },
    /// Register a new replica of a table (CREATE REPLICA).
    AddReplica {
        #[arg(long)]
        schema: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        node: DatabaseId,
    },
    /// Drop a replica of a table (DROP REPLICA).
    RemoveReplica {
        #[arg(long)]
        schema: String,
        #[arg(long)]
        table: String,
        #[arg(long)]
        node: DatabaseId,
    },
}

#[derive(Serialize)]
struct StateView {
    catalog: DatabaseId,
    instances: Vec<DatabaseInstanceWrapper>,
    tables: Vec<TableManagerDescriptor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let transport: Arc<dyn Transport> =
        Arc::new(TcpTransport::new(Duration::from_millis(args.timeout_ms)));

    match args.command {
        Command::State => {
            let catalog = catalog_client(&transport, &args.target).await?;
            let view = StateView {
                catalog: catalog.location(),
                instances: catalog.database_instances().await?,
                tables: catalog.all_table_managers().await?,
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Tables => {
            let catalog = catalog_client(&transport, &args.target).await?;
            let mut tables = catalog.all_table_managers().await?;
            tables.sort_by_key(|d| d.info.key());
            println!("{:<40} {:<8} owner", "table", "set");
            for d in tables {
                println!("{:<40} {:<8} {}", d.info.key(), d.info.table_set, d.owner);
            }
        }
        Command::Lookup { schema, table } => {
            let catalog = catalog_client(&transport, &args.target).await?;
            let info = TableInfo::new(schema, table);
            let wrapper = catalog
                .lookup(&info)
                .await?
                .with_context(|| format!("table {} not found", info.key()))?;
            println!("manager: {}", wrapper.owner);
            if let Some(handle) = wrapper.handle {
                let all = handle.all_replicas().await?;
                let active = handle.active_replicas().await?;
                for node in all {
                    let state = if active.contains(&node) { "active" } else { "stale" };
                    println!("replica: {node} ({state})");
                }
            }
            for node in catalog.replica_locations(&info).await? {
                println!("metadata copy: {node}");
            }
        }
        Command::Suspect { node } => {
            let catalog = catalog_client(&transport, &args.target).await?;
            catalog.suspect_instance_of_failure(&node).await?;
            println!("suspected {node}");
        }
        Command::Check => {
            let catalog = catalog_client(&transport, &args.target).await?;
            let recreated = catalog.check_table_manager_accessibility(None).await?;
            println!("recreated managers: {recreated}");
        }
        Command::MigrateCatalog { to } => {
            let to = to.unwrap_or(args.target);
            node_call(&transport, &to, NodeRequest::MigrateCatalogHere).await?;
            println!("catalog now on {to}");
        }
        Command::MigrateManager { schema, table, to } => {
            let info = TableInfo::new(schema, table);
            node_call(
                &transport,
                &to,
                NodeRequest::MigrateTableManagerHere(info.clone()),
            )
            .await?;
            println!("manager of {} now on {to}", info.key());
        }
        Command::AddReplica { schema, table, node } => {
            let catalog = catalog_client(&transport, &args.target).await?;
            let handle = manager_handle(catalog.as_ref(), TableInfo::new(schema, table)).await?;
            handle.add_replica(&node).await?;
            println!("added replica {node}");
        }
        Command::RemoveReplica { schema, table, node } => {
            let catalog = catalog_client(&transport, &args.target).await?;
            let handle = manager_handle(catalog.as_ref(), TableInfo::new(schema, table)).await?;
            handle.remove_replica(&node).await?;
            println!("removed replica {node}");
        }
    }

    Ok(())
}

/// Ask `target` where the catalog lives and connect to it.
async fn catalog_client(
    transport: &Arc<dyn Transport>,
    target: &DatabaseId,
) -> anyhow::Result<Arc<dyn CatalogService>> {
    let resp = transport
        .call(target, Request::Node(NodeRequest::CatalogLocation))
        .await?;
    let location = expect_response!(resp, Response::Location(location) => location)?
        .with_context(|| format!("{target} does not know the catalog location"))?;
    Ok(Arc::new(RemoteCatalog::new(location, transport.clone())))
}

async fn manager_handle(
    catalog: &dyn CatalogService,
    info: TableInfo,
) -> anyhow::Result<Arc<dyn tessera_coord::TableManagerService>> {
    let wrapper = catalog
        .lookup(&info)
        .await?
        .with_context(|| format!("table {} not found", info.key()))?;
    wrapper
        .handle
        .with_context(|| format!("table manager of {} is not reachable", info.key()))
}

async fn node_call(
    transport: &Arc<dyn Transport>,
    target: &DatabaseId,
    request: NodeRequest,
) -> anyhow::Result<()> {
    let resp = transport.call(target, Request::Node(request)).await?;
    expect_response!(resp, Response::Ack => ())?;
    Ok(())
}
