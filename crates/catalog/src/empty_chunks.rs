//! Empty-chunk sets.
//!
//! The partitioning tools record, per database, the chunk ids whose spatial
//! cells contain no rows. Coverage is pruned against this set so workers
//! never receive queries for chunks that cannot match.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use smq_common::{ChunkId, Result};

use crate::kv::KvInterface;

/// Cached per-database empty-chunk sets read from `/db/<name>/emptychunks`
/// (comma-separated chunk ids; a missing key means no chunk is empty).
pub struct EmptyChunks {
    kv: Arc<dyn KvInterface>,
    cache: Mutex<HashMap<String, Arc<BTreeSet<ChunkId>>>>,
}

impl EmptyChunks {
    pub fn new(kv: Arc<dyn KvInterface>) -> Self {
        Self {
            kv,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Empty-chunk set for `db`. The set is cached for the lifetime of this
    /// object; call [`EmptyChunks::clear`] after a catalog refresh.
    pub fn for_db(&self, db: &str) -> Result<Arc<BTreeSet<ChunkId>>> {
        if let Some(found) = self.cache.lock().expect("empty-chunk cache lock").get(db) {
            return Ok(Arc::clone(found));
        }
        let path = format!("/db/{db}/emptychunks");
        let set: BTreeSet<ChunkId> = if self.kv.exists(&path)? {
            self.kv
                .get(&path)?
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .filter_map(|t| t.parse::<ChunkId>().ok())
                .collect()
        } else {
            BTreeSet::new()
        };
        let set = Arc::new(set);
        self.cache
            .lock()
            .expect("empty-chunk cache lock")
            .insert(db.to_string(), Arc::clone(&set));
        Ok(set)
    }

    /// Drop all cached sets.
    pub fn clear(&self) {
        self.cache.lock().expect("empty-chunk cache lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemKv;

    #[test]
    fn parses_and_caches_sets() {
        let mut kv = MemKv::new();
        kv.set("/db/LSST/emptychunks", "5, 7,9");
        let empty = EmptyChunks::new(Arc::new(kv));
        let set = empty.for_db("LSST").unwrap();
        assert!(set.contains(&5) && set.contains(&7) && set.contains(&9));
        assert_eq!(set.len(), 3);
        // Second read serves the cached Arc.
        assert!(Arc::ptr_eq(&set, &empty.for_db("LSST").unwrap()));
    }

    #[test]
    fn missing_key_means_no_empty_chunks() {
        let kv = MemKv::new();
        let empty = EmptyChunks::new(Arc::new(kv));
        assert!(empty.for_db("LSST").unwrap().is_empty());
    }
}
