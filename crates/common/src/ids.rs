//! Typed identifiers shared across planner and worker components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Chunk ids index the spatial tessellation; negative values never occur in
/// real coverage but the signed type matches the partitioning tools.
pub type ChunkId = i32;

/// Sub-chunk id within one chunk.
pub type SubChunkId = i32;

/// Stable user-query identifier assigned at submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(
    /// Raw numeric id value.
    pub u64,
);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-chunk job index within one user query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(
    /// Raw numeric id value.
    pub u32,
);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Standard `QI=<query>:<job>` prefix used in log lines so entries for one
/// query can be grepped across components.
pub fn query_id_str(query_id: QueryId, job_id: Option<JobId>) -> String {
    match job_id {
        Some(job) => format!("QI={query_id}:{job}"),
        None => format!("QI={query_id}"),
    }
}
