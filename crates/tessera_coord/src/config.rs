use std::time::Duration;

/// Default window after which an uncompleted migration is abandoned.
pub const DEFAULT_MIGRATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Coordination settings shared by the catalog, table managers and the
/// catalog reference on one node.
#[derive(Clone, Debug)]
pub struct CoordConfig {
    /// Target number of data replicas chosen on CREATE.
    pub replication_factor: usize,
    /// Number of nodes holding a copy of each table manager's own metadata.
    pub manager_replication_factor: usize,
    /// Number of peers receiving a copy of the catalog state.
    pub catalog_replication_factor: usize,
    /// Window after which `prepare_for_migration` without completion is undone.
    pub migration_timeout: Duration,
    /// Bounded attempts for transport/migration retries in the catalog reference.
    pub reference_attempts: usize,
    /// Pause between attempts when the callee reports a migration in progress.
    pub reference_backoff: Duration,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            replication_factor: 1,
            manager_replication_factor: 2,
            catalog_replication_factor: 2,
            migration_timeout: DEFAULT_MIGRATION_TIMEOUT,
            reference_attempts: 5,
            reference_backoff: Duration::from_millis(50),
        }
    }
}

impl CoordConfig {
    pub fn with_replication_factor(mut self, replication_factor: usize) -> Self {
        self.replication_factor = replication_factor.max(1);
        self
    }

    pub fn with_manager_replication_factor(mut self, factor: usize) -> Self {
        self.manager_replication_factor = factor.max(1);
        self
    }

    pub fn with_catalog_replication_factor(mut self, factor: usize) -> Self {
        self.catalog_replication_factor = factor;
        self
    }

    pub fn with_migration_timeout(mut self, timeout: Duration) -> Self {
        self.migration_timeout = timeout;
        self
    }
}
