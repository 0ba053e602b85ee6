//! Metadata persistence.
//!
//! Two groups of relations live here. The catalog relations (`tables`,
//! `connections`, `manager_replicas`, `catalog_meta`) are written only by the
//! node hosting the active catalog, or by a node holding a replicated copy of
//! it. The `replicas` relation holds table-manager state and is written on
//! every node chosen to keep a copy of that manager's metadata.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{DatabaseId, DatabaseInstanceWrapper, ReplicaEntry, TableInfo, TableKey};

/// Row of the `tables` relation: one per existing table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRow {
    pub info: TableInfo,
    /// Node hosting the table manager.
    pub manager: DatabaseId,
    /// Primary data copy, when one has been recorded.
    #[serde(default)]
    pub primary: Option<DatabaseId>,
}

/// Monotonic counters owned by the catalog.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogCounters {
    pub next_table_set_number: u64,
    pub next_connection_id: u64,
}

/// Persisted table-manager metadata, enough to rebuild the manager elsewhere.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStateRecord {
    pub info: TableInfo,
    pub replicas: Vec<ReplicaEntry>,
}

/// Durable relations behind the catalog and table manager metadata.
pub trait MetadataStore: Send + Sync {
    fn put_table(&self, row: &TableRow) -> anyhow::Result<()>;
    fn delete_table(&self, key: &TableKey) -> anyhow::Result<()>;
    fn tables(&self) -> anyhow::Result<Vec<TableRow>>;

    fn put_connection(&self, instance: &DatabaseInstanceWrapper) -> anyhow::Result<()>;
    fn delete_connection(&self, node: &DatabaseId) -> anyhow::Result<()>;
    fn connections(&self) -> anyhow::Result<Vec<DatabaseInstanceWrapper>>;

    fn put_manager_replicas(&self, key: &TableKey, nodes: &[DatabaseId]) -> anyhow::Result<()>;
    fn delete_manager_replicas(&self, key: &TableKey) -> anyhow::Result<()>;
    fn manager_replicas(&self) -> anyhow::Result<Vec<(TableKey, Vec<DatabaseId>)>>;

    fn put_counters(&self, counters: &CatalogCounters) -> anyhow::Result<()>;
    fn counters(&self) -> anyhow::Result<Option<CatalogCounters>>;

    /// Remove every catalog relation (not manager state).
    fn clear_catalog(&self) -> anyhow::Result<()>;

    fn put_manager_state(&self, record: &ManagerStateRecord) -> anyhow::Result<()>;
    fn manager_state(&self, key: &TableKey) -> anyhow::Result<Option<ManagerStateRecord>>;
    fn delete_manager_state(&self, key: &TableKey) -> anyhow::Result<()>;

    /// Whether any catalog state has ever been written here.
    fn has_catalog(&self) -> anyhow::Result<bool> {
        Ok(self.counters()?.is_some())
    }
}

#[derive(Default)]
struct MemoryInner {
    tables: BTreeMap<TableKey, TableRow>,
    connections: BTreeMap<DatabaseId, DatabaseInstanceWrapper>,
    manager_replicas: BTreeMap<TableKey, Vec<DatabaseId>>,
    counters: Option<CatalogCounters>,
    manager_state: BTreeMap<TableKey, ManagerStateRecord>,
}

/// Volatile store for tests and nodes started without a data directory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetadataStore for MemoryStore {
    fn put_table(&self, row: &TableRow) -> anyhow::Result<()> {
        self.inner.lock().tables.insert(row.info.key(), row.clone());
        Ok(())
    }

    fn delete_table(&self, key: &TableKey) -> anyhow::Result<()> {
        self.inner.lock().tables.remove(key);
        Ok(())
    }

    fn tables(&self) -> anyhow::Result<Vec<TableRow>> {
        Ok(self.inner.lock().tables.values().cloned().collect())
    }

    fn put_connection(&self, instance: &DatabaseInstanceWrapper) -> anyhow::Result<()> {
        self.inner
            .lock()
            .connections
            .insert(instance.id.clone(), instance.clone());
        Ok(())
    }

    fn delete_connection(&self, node: &DatabaseId) -> anyhow::Result<()> {
        self.inner.lock().connections.remove(node);
        Ok(())
    }

    fn connections(&self) -> anyhow::Result<Vec<DatabaseInstanceWrapper>> {
        Ok(self.inner.lock().connections.values().cloned().collect())
    }

    fn put_manager_replicas(&self, key: &TableKey, nodes: &[DatabaseId]) -> anyhow::Result<()> {
        self.inner
            .lock()
            .manager_replicas
            .insert(key.clone(), nodes.to_vec());
        Ok(())
    }

    fn delete_manager_replicas(&self, key: &TableKey) -> anyhow::Result<()> {
        self.inner.lock().manager_replicas.remove(key);
        Ok(())
    }

    fn manager_replicas(&self) -> anyhow::Result<Vec<(TableKey, Vec<DatabaseId>)>> {
        Ok(self
            .inner
            .lock()
            .manager_replicas
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn put_counters(&self, counters: &CatalogCounters) -> anyhow::Result<()> {
        self.inner.lock().counters = Some(*counters);
        Ok(())
    }

    fn counters(&self) -> anyhow::Result<Option<CatalogCounters>> {
        Ok(self.inner.lock().counters)
    }

    fn clear_catalog(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        inner.tables.clear();
        inner.connections.clear();
        inner.manager_replicas.clear();
        inner.counters = None;
        Ok(())
    }

    fn put_manager_state(&self, record: &ManagerStateRecord) -> anyhow::Result<()> {
        self.inner
            .lock()
            .manager_state
            .insert(record.info.key(), record.clone());
        Ok(())
    }

    fn manager_state(&self, key: &TableKey) -> anyhow::Result<Option<ManagerStateRecord>> {
        Ok(self.inner.lock().manager_state.get(key).cloned())
    }

    fn delete_manager_state(&self, key: &TableKey) -> anyhow::Result<()> {
        self.inner.lock().manager_state.remove(key);
        Ok(())
    }
}

const COUNTERS_KEY: &[u8] = b"counters";

/// Durable store: one fjall partition per relation, JSON-encoded rows.
pub struct FjallStore {
    keyspace: Arc<Keyspace>,
    tables: PartitionHandle,
    connections: PartitionHandle,
    replicas: PartitionHandle,
    manager_replicas: PartitionHandle,
    catalog_meta: PartitionHandle,
}

impl FjallStore {
    /// Open (or create) a fjall keyspace under `path`.
    pub fn open_dir(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path).context("create metadata dir")?;
        let keyspace = Arc::new(
            fjall::Config::new(path)
                .open()
                .context("open fjall keyspace")?,
        );
        Self::open(keyspace)
    }

    pub fn open(keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let open = |name: &str| -> anyhow::Result<PartitionHandle> {
            keyspace
                .open_partition(name, PartitionCreateOptions::default())
                .with_context(|| format!("open partition {name}"))
        };
        Ok(Self {
            tables: open("tables")?,
            connections: open("connections")?,
            replicas: open("replicas")?,
            manager_replicas: open("manager_replicas")?,
            catalog_meta: open("catalog_meta")?,
            keyspace,
        })
    }

    fn put_json<T: Serialize>(
        &self,
        partition: &PartitionHandle,
        key: &[u8],
        value: &T,
    ) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec(value).context("encode metadata row")?;
        partition.insert(key, bytes).context("write metadata row")?;
        self.sync()
    }

    fn remove(&self, partition: &PartitionHandle, key: &[u8]) -> anyhow::Result<()> {
        partition.remove(key).context("delete metadata row")?;
        self.sync()
    }

    /// Metadata writes are rare; make each one durable before acknowledging.
    fn sync(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist metadata journal")
    }

    fn get_json<T: DeserializeOwned>(
        partition: &PartitionHandle,
        key: &[u8],
    ) -> anyhow::Result<Option<T>> {
        match partition.get(key).context("read metadata row")? {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).context("decode metadata row")?,
            )),
            None => Ok(None),
        }
    }

    fn scan_json<T: DeserializeOwned>(partition: &PartitionHandle) -> anyhow::Result<Vec<T>> {
        let mut out = Vec::new();
        for item in partition.iter() {
            let (_, value) = item.context("scan metadata partition")?;
            out.push(serde_json::from_slice(&value).context("decode metadata row")?);
        }
        Ok(out)
    }

    fn clear_partition(&self, partition: &PartitionHandle) -> anyhow::Result<()> {
        let mut batch = self.keyspace.batch();
        for item in partition.iter() {
            let (key, _) = item.context("scan metadata partition")?;
            batch.remove(partition, key);
        }
        batch.commit().context("clear metadata partition")?;
        self.sync()
    }
}

fn table_key_bytes(key: &TableKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.schema.len() + key.table.len() + 1);
    out.extend_from_slice(key.schema.as_bytes());
    out.push(0);
    out.extend_from_slice(key.table.as_bytes());
    out
}

#[derive(Serialize, Deserialize)]
struct ManagerReplicasRow {
    table: TableKey,
    nodes: Vec<DatabaseId>,
}

impl MetadataStore for FjallStore {
    fn put_table(&self, row: &TableRow) -> anyhow::Result<()> {
        self.put_json(&self.tables, &table_key_bytes(&row.info.key()), row)
    }

    fn delete_table(&self, key: &TableKey) -> anyhow::Result<()> {
        self.remove(&self.tables, &table_key_bytes(key))
    }

    fn tables(&self) -> anyhow::Result<Vec<TableRow>> {
        Self::scan_json(&self.tables)
    }

    fn put_connection(&self, instance: &DatabaseInstanceWrapper) -> anyhow::Result<()> {
        self.put_json(&self.connections, instance.id.to_string().as_bytes(), instance)
    }

    fn delete_connection(&self, node: &DatabaseId) -> anyhow::Result<()> {
        self.remove(&self.connections, node.to_string().as_bytes())
    }

    fn connections(&self) -> anyhow::Result<Vec<DatabaseInstanceWrapper>> {
        Self::scan_json(&self.connections)
    }

    fn put_manager_replicas(&self, key: &TableKey, nodes: &[DatabaseId]) -> anyhow::Result<()> {
        let row = ManagerReplicasRow {
            table: key.clone(),
            nodes: nodes.to_vec(),
        };
        self.put_json(&self.manager_replicas, &table_key_bytes(key), &row)
    }

    fn delete_manager_replicas(&self, key: &TableKey) -> anyhow::Result<()> {
        self.remove(&self.manager_replicas, &table_key_bytes(key))
    }

    fn manager_replicas(&self) -> anyhow::Result<Vec<(TableKey, Vec<DatabaseId>)>> {
        let rows: Vec<ManagerReplicasRow> = Self::scan_json(&self.manager_replicas)?;
        Ok(rows.into_iter().map(|row| (row.table, row.nodes)).collect())
    }

    fn put_counters(&self, counters: &CatalogCounters) -> anyhow::Result<()> {
        self.put_json(&self.catalog_meta, COUNTERS_KEY, counters)
    }

    fn counters(&self) -> anyhow::Result<Option<CatalogCounters>> {
        Self::get_json(&self.catalog_meta, COUNTERS_KEY)
    }

    fn clear_catalog(&self) -> anyhow::Result<()> {
        self.clear_partition(&self.tables)?;
        self.clear_partition(&self.connections)?;
        self.clear_partition(&self.manager_replicas)?;
        self.clear_partition(&self.catalog_meta)?;
        Ok(())
    }

    fn put_manager_state(&self, record: &ManagerStateRecord) -> anyhow::Result<()> {
        self.put_json(&self.replicas, &table_key_bytes(&record.info.key()), record)
    }

    fn manager_state(&self, key: &TableKey) -> anyhow::Result<Option<ManagerStateRecord>> {
        Self::get_json(&self.replicas, &table_key_bytes(key))
    }

    fn delete_manager_state(&self, key: &TableKey) -> anyhow::Result<()> {
        self.remove(&self.replicas, &table_key_bytes(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u16) -> DatabaseId {
        DatabaseId::new(format!("127.0.0.1:{}", 7100 + n), format!("db{n}"))
    }

    fn exercise(store: &dyn MetadataStore) {
        assert!(!store.has_catalog().expect("has catalog"));
        let info = TableInfo::new("public", "orders").with_table_set(3);
        store
            .put_table(&TableRow {
                info: info.clone(),
                manager: node(1),
                primary: Some(node(2)),
            })
            .expect("put table");
        store
            .put_connection(&DatabaseInstanceWrapper {
                id: node(1),
                connection_id: 1,
                active: true,
            })
            .expect("put connection");
        store
            .put_manager_replicas(&info.key(), &[node(1), node(2)])
            .expect("put manager replicas");
        store
            .put_counters(&CatalogCounters {
                next_table_set_number: 4,
                next_connection_id: 2,
            })
            .expect("put counters");
        store
            .put_manager_state(&ManagerStateRecord {
                info: info.clone(),
                replicas: vec![ReplicaEntry {
                    node: node(2),
                    update_id: 7,
                    alive: true,
                    primary: true,
                }],
            })
            .expect("put manager state");

        assert!(store.has_catalog().expect("has catalog"));
        let tables = store.tables().expect("tables");
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].primary, Some(node(2)));
        assert_eq!(store.connections().expect("connections").len(), 1);
        assert_eq!(
            store.manager_replicas().expect("manager replicas"),
            vec![(info.key(), vec![node(1), node(2)])]
        );

        store.clear_catalog().expect("clear");
        assert!(store.tables().expect("tables").is_empty());
        assert!(store.counters().expect("counters").is_none());
        // Manager state survives a catalog wipe.
        let record = store
            .manager_state(&info.key())
            .expect("manager state")
            .expect("present");
        assert_eq!(record.replicas[0].update_id, 7);
        store.delete_manager_state(&info.key()).expect("delete");
        assert!(store.manager_state(&info.key()).expect("read").is_none());
    }

    #[test]
    fn memory_store_relations() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn fjall_store_relations_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = FjallStore::open_dir(dir.path()).expect("open");
            exercise(&store);
            store
                .put_connection(&DatabaseInstanceWrapper {
                    id: node(5),
                    connection_id: 9,
                    active: false,
                })
                .expect("put connection");
        }
        let reopened = FjallStore::open_dir(dir.path()).expect("reopen");
        let connections = reopened.connections().expect("connections");
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].connection_id, 9);
        assert!(!connections[0].active);
    }
}
