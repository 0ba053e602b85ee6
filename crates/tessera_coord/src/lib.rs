//! Distributed table coordination.
//!
//! A cluster of database nodes shares one catalog, which maps every table to
//! the node hosting its table manager. Each table manager serializes access
//! to its table through a locking table and tracks which replicas hold the
//! current version of the data. Both services can migrate between nodes and
//! are recreated from replicated metadata when their host fails.
//!
//! Callers work through a [`CatalogReference`]: ask it for a query proxy
//! (lock plus replica set), run the statement on those replicas, then report
//! the per-replica outcomes back so the replica state stays consistent.

pub mod catalog;
pub mod config;
pub mod error;
pub mod locator;
pub mod locking;
pub mod migration;
pub mod node;
pub mod reference;
pub mod remote;
pub mod replica;
pub mod ring;
pub mod service;
pub mod store;
pub mod table_manager;
pub mod transport;
pub mod types;

pub use catalog::{Catalog, CatalogSnapshot};
pub use config::CoordConfig;
pub use error::{CoordError, CoordResult};
pub use locator::{LocatorFiles, LocatorRecord};
pub use node::Node;
pub use reference::CatalogReference;
pub use ring::{CatalogResolver, HashRing};
pub use service::{CatalogService, TableManagerService, TableManagerWrapper};
pub use store::{FjallStore, MemoryStore, MetadataStore};
pub use transport::{LocalTransport, Request, RequestHandler, Response, Transport};
pub use types::{
    CommitPhase, DatabaseId, DatabaseInstanceWrapper, LockRequest, LockType, ReplicaOutcomes,
    TableInfo, TableKey, TableManagerDescriptor, TableProxy,
};
