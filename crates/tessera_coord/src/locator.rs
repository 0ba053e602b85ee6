//! Locator files: an out-of-band record of which nodes hold catalog state.
//!
//! Every file carries an update count. Readers trust the readable file with
//! the highest count; writers bump the count and must land the new record in
//! a strict majority of files, so any later majority read sees it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::DatabaseId;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Contents of one locator file.
pub struct LocatorRecord {
    pub update_count: u64,
    /// Active catalog first, then nodes holding a replicated copy.
    pub catalog_locations: Vec<DatabaseId>,
}

/// Well-known files naming where the catalog lives. Every copy is written;
/// the one with the highest `update_count` wins on read.
#[derive(Debug)]
pub struct LocatorFiles {
    paths: Vec<PathBuf>,
    write_lock: Mutex<()>,
}

impl LocatorFiles {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self {
            paths,
            write_lock: Mutex::new(()),
        }
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    fn read_one(path: &Path) -> anyhow::Result<LocatorRecord> {
        let data = fs::read(path).with_context(|| format!("read locator {}", path.display()))?;
        serde_json::from_slice(&data).with_context(|| format!("decode locator {}", path.display()))
    }

    /// Newest record across the readable files.
    pub fn read(&self) -> Option<LocatorRecord> {
        self.paths
            .iter()
            .filter_map(|path| match Self::read_one(path) {
                Ok(record) => Some(record),
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = ?err, "skipping locator file");
                    None
                }
            })
            .max_by_key(|record| record.update_count)
    }

    fn write_one(path: &Path, record: &LocatorRecord) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("create locator dir")?;
        }
        let data = serde_json::to_vec_pretty(record).context("encode locator record")?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
        Ok(())
    }

    /// Publish a new catalog location list.
    pub fn record(&self, catalog_locations: Vec<DatabaseId>) -> anyhow::Result<LocatorRecord> {
        let _guard = self.write_lock.lock();
        anyhow::ensure!(!self.paths.is_empty(), "no locator files configured");
        let previous = self.read().map(|r| r.update_count).unwrap_or(0);
        let record = LocatorRecord {
            update_count: previous + 1,
            catalog_locations,
        };

        let mut written = 0usize;
        for path in &self.paths {
            match Self::write_one(path, &record) {
                Ok(()) => written += 1,
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = ?err, "failed to write locator file");
                }
            }
        }
        anyhow::ensure!(
            written * 2 > self.paths.len(),
            "locator update reached {written} of {} files",
            self.paths.len()
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u16) -> DatabaseId {
        DatabaseId::new(format!("127.0.0.1:{}", 7100 + n), "db")
    }

    #[test]
    fn newest_record_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("loc{i}.json"))).collect();
        let files = LocatorFiles::new(paths.clone());
        assert!(files.read().is_none());

        files.record(vec![node(1), node(2)]).expect("first");
        let second = files.record(vec![node(2), node(3)]).expect("second");
        assert_eq!(second.update_count, 2);

        // A stale file left behind by a partial write is ignored.
        LocatorFiles::write_one(
            &paths[0],
            &LocatorRecord {
                update_count: 1,
                catalog_locations: vec![node(9)],
            },
        )
        .expect("stale write");
        let read = files.read().expect("record");
        assert_eq!(read.catalog_locations, vec![node(2), node(3)]);
    }

    #[test]
    fn write_without_majority_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"file").expect("blocker");
        // Paths below a regular file can never be created.
        let files = LocatorFiles::new(vec![
            dir.path().join("ok.json"),
            blocker.join("a.json"),
            blocker.join("b.json"),
        ]);
        assert!(files.record(vec![node(1)]).is_err());
        assert_eq!(files.read().map(|r| r.update_count), Some(1));
    }
}
