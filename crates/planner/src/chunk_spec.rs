//! Chunk coverage specs and the fragments dispatched to workers.

use serde::{Deserialize, Serialize};
use smq_common::{ChunkId, SubChunkId};

/// Chunk id standing in for "no real coverage": chunk-less queries still
/// dispatch exactly one task, against this always-present dummy chunk.
pub const DUMMY_CHUNK_ID: ChunkId = 1234567890;

/// One element of a query's chunk coverage: a chunk id plus the sub-chunks
/// covered within it (empty for non-sub-chunked queries).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSpec {
    pub chunk_id: ChunkId,
    pub subchunks: Vec<SubChunkId>,
}

impl ChunkSpec {
    /// Build a spec; the sub-chunk list is sorted and deduplicated.
    pub fn new(chunk_id: ChunkId, mut subchunks: Vec<SubChunkId>) -> Self {
        subchunks.sort_unstable();
        subchunks.dedup();
        Self {
            chunk_id,
            subchunks,
        }
    }

    /// Whether the sub-chunk list exceeds one dispatch fragment.
    pub fn should_split(&self, max_per_fragment: usize) -> bool {
        self.subchunks.len() > max_per_fragment
    }
}

/// Splits a large sub-chunk list into bounded batches, each of which becomes
/// one worker fragment.
pub struct ChunkSpecFragmenter<'a> {
    spec: &'a ChunkSpec,
    max_per_fragment: usize,
    offset: usize,
}

impl<'a> ChunkSpecFragmenter<'a> {
    pub fn new(spec: &'a ChunkSpec, max_per_fragment: usize) -> Self {
        Self {
            spec,
            max_per_fragment: max_per_fragment.max(1),
            offset: 0,
        }
    }
}

impl<'a> Iterator for ChunkSpecFragmenter<'a> {
    type Item = &'a [SubChunkId];

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.spec.subchunks.len() {
            return None;
        }
        let end = (self.offset + self.max_per_fragment).min(self.spec.subchunks.len());
        let batch = &self.spec.subchunks[self.offset..end];
        self.offset = end;
        Some(batch)
    }
}

/// One executable batch within a chunk: the concrete queries plus the
/// sub-chunk ids they cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkQueryFragment {
    pub queries: Vec<String>,
    pub subchunk_ids: Vec<SubChunkId>,
}

/// The concrete dispatchable unit for one chunk of one user query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkQuerySpec {
    /// Database context the worker runs the queries in.
    pub db: String,
    pub chunk_id: ChunkId,
    /// Tables needing sub-chunk instantiation on the worker, as `db.table`.
    pub subchunk_tables: Vec<String>,
    /// One fragment per sub-chunk batch; a single fragment for
    /// non-sub-chunked queries.
    pub fragments: Vec<ChunkQueryFragment>,
}
