//! Key-based routing used only to find where the catalog is expected to live.

use crate::types::DatabaseId;

/// Fixed key every node resolves to locate the catalog host.
pub const CATALOG_LOOKUP_KEY: &str = "__tessera_catalog__";

pub trait CatalogResolver: Send + Sync {
    /// Expected owner of `key`, if the resolver knows any node at all.
    fn resolve(&self, key: &str) -> Option<DatabaseId>;
}

/// Jump-consistent-hash ring over a fixed member list.
#[derive(Clone, Debug)]
pub struct HashRing {
    nodes: Vec<DatabaseId>,
}

impl HashRing {
    pub fn new(mut nodes: Vec<DatabaseId>) -> Self {
        nodes.sort_unstable();
        nodes.dedup();
        Self { nodes }
    }

    pub fn nodes(&self) -> &[DatabaseId] {
        &self.nodes
    }

    pub fn owner(&self, key: &str) -> Option<&DatabaseId> {
        if self.nodes.is_empty() {
            return None;
        }
        let bucket = jump_consistent_hash(mix(key), self.nodes.len() as i32);
        self.nodes.get(bucket as usize)
    }
}

impl CatalogResolver for HashRing {
    fn resolve(&self, key: &str) -> Option<DatabaseId> {
        self.owner(key).cloned()
    }
}

/// FNV-1a over the key bytes; identical on every build and platform.
fn mix(key: &str) -> u64 {
    key.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

fn jump_consistent_hash(mut key: u64, num_buckets: i32) -> i32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < num_buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        let denom = ((key >> 33) + 1) as f64;
        j = ((b as f64 + 1.0) * ((1u64 << 31) as f64) / denom).floor() as i64;
    }
    b as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u16) -> DatabaseId {
        DatabaseId::new(format!("127.0.0.1:{}", 7100 + n), "db")
    }

    #[test]
    fn owner_is_stable_regardless_of_member_order() {
        let a = HashRing::new(vec![node(1), node(2), node(3)]);
        let b = HashRing::new(vec![node(3), node(1), node(2), node(1)]);
        assert_eq!(a.nodes().len(), 3);
        assert_eq!(a.owner(CATALOG_LOOKUP_KEY), b.owner(CATALOG_LOOKUP_KEY));
        assert!(HashRing::new(Vec::new()).resolve(CATALOG_LOOKUP_KEY).is_none());
    }

    #[test]
    fn catalog_key_maps_to_the_same_member_on_every_build() {
        assert_eq!(mix(""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(mix("a"), 0xaf63_dc4c_8601_ec8c);

        let three = HashRing::new(vec![node(1), node(2), node(3)]);
        assert_eq!(three.owner(CATALOG_LOOKUP_KEY), Some(&node(3)));
        let five = HashRing::new((1..=5).map(node).collect());
        assert_eq!(five.owner(CATALOG_LOOKUP_KEY), Some(&node(3)));
        let one = HashRing::new(vec![node(4)]);
        assert_eq!(one.owner("app.users"), Some(&node(4)));
    }
}
