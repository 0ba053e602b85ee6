//! Background liveness monitor.
//!
//! Runs on every node but only does work while the node hosts the catalog:
//! unresponsive members are suspected of failure and their table managers
//! recreated elsewhere.

use std::sync::Arc;
use std::time::Duration;

use tessera_coord::Node;

/// Settings for the liveness monitor task.
#[derive(Clone, Copy, Debug)]
pub struct MonitorConfig {
    /// Pause between liveness passes.
    pub interval: Duration,
}

pub fn spawn(node: Arc<Node>, cfg: MonitorConfig) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !node.hosts_catalog() {
                continue;
            }
            match node.run_liveness_check().await {
                Ok(failed) if failed.is_empty() => {}
                Ok(failed) => {
                    for failed_node in &failed {
                        tracing::warn!(node = %failed_node, "member removed after failed liveness check");
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "liveness pass failed");
                }
            }
        }
    })
}
