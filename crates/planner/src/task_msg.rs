//! Task wire format.
//!
//! One message per chunk of one user query, built from a [`ChunkQuerySpec`].
//! The transport framing is out of scope here; messages serialize as JSON
//! and the dispatch layer owns delivery.

use std::io::Write;

use serde::{Deserialize, Serialize};
use smq_common::{ChunkId, JobId, QueryId, Result, SmqError, SubChunkId};

use crate::chunk_spec::ChunkQuerySpec;
use crate::table_namer::ScanInfo;

/// One executable fragment: queries plus the chunk files they touch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFragmentMsg {
    pub queries: Vec<String>,
    pub subchunk_ids: Vec<SubChunkId>,
    /// Tables needing sub-chunk instantiation, as `db.table`.
    pub subchunk_tables: Vec<String>,
    /// Chunk table files the memory manager must lock before execution.
    pub files: Vec<String>,
}

/// Shared-scan metadata for one referenced table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTableMsg {
    pub db: String,
    pub table: String,
    pub lock_in_memory: bool,
    pub rating: i32,
}

/// Scan cost summary used by the worker to pick a scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanInfoMsg {
    pub tables: Vec<ScanTableMsg>,
    pub rating: i32,
}

/// The inbound task a worker receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMsg {
    pub query_id: QueryId,
    pub job_id: JobId,
    pub chunk_id: ChunkId,
    /// Database context for execution.
    pub db: String,
    pub fragments: Vec<TaskFragmentMsg>,
    pub scan: ScanInfoMsg,
    /// Fingerprint of the originating user query.
    pub fingerprint: u64,
}

/// Builds task messages for the chunks of one user query.
pub struct TaskMsgFactory {
    query_id: QueryId,
    fingerprint: u64,
}

impl TaskMsgFactory {
    pub fn new(query_id: QueryId, fingerprint: u64) -> Self {
        Self {
            query_id,
            fingerprint,
        }
    }

    /// Build the message for one chunk-query spec.
    pub fn make(&self, job_id: JobId, spec: &ChunkQuerySpec, scan: &ScanInfo) -> TaskMsg {
        let scan_msg = ScanInfoMsg {
            tables: scan
                .tables
                .iter()
                .map(|t| ScanTableMsg {
                    db: t.db.clone(),
                    table: t.table.clone(),
                    lock_in_memory: t.lock_in_memory,
                    rating: t.rating,
                })
                .collect(),
            rating: scan.rating,
        };
        let files: Vec<String> = scan
            .tables
            .iter()
            .map(|t| format!("{}/{}_{}.MYD", t.db, t.table, spec.chunk_id))
            .collect();
        TaskMsg {
            query_id: self.query_id,
            job_id,
            chunk_id: spec.chunk_id,
            db: spec.db.clone(),
            fragments: spec
                .fragments
                .iter()
                .map(|f| TaskFragmentMsg {
                    queries: f.queries.clone(),
                    subchunk_ids: f.subchunk_ids.clone(),
                    subchunk_tables: spec.subchunk_tables.clone(),
                    files: files.clone(),
                })
                .collect(),
            scan: scan_msg,
            fingerprint: self.fingerprint,
        }
    }

    /// Serialize one message as JSON onto a writer.
    pub fn serialize(&self, msg: &TaskMsg, writer: &mut dyn Write) -> Result<()> {
        serde_json::to_writer(&mut *writer, msg)
            .map_err(|e| SmqError::Internal(format!("task message encode failed: {e}")))?;
        writer.write_all(b"\n")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_spec::ChunkQueryFragment;
    use crate::table_namer::ScanTable;

    fn sample_spec() -> ChunkQuerySpec {
        ChunkQuerySpec {
            db: "LSST".to_string(),
            chunk_id: 42,
            subchunk_tables: vec!["LSST.Object".to_string()],
            fragments: vec![ChunkQueryFragment {
                queries: vec!["SELECT ra FROM LSST.Object_42_1".to_string()],
                subchunk_ids: vec![1],
            }],
        }
    }

    fn sample_scan() -> ScanInfo {
        ScanInfo {
            tables: vec![ScanTable {
                db: "LSST".to_string(),
                table: "Object".to_string(),
                lock_in_memory: true,
                rating: 32,
            }],
            rating: 32,
        }
    }

    #[test]
    fn builds_files_from_scan_tables() {
        let factory = TaskMsgFactory::new(QueryId(9), 0xfeed);
        let msg = factory.make(JobId(0), &sample_spec(), &sample_scan());
        assert_eq!(msg.chunk_id, 42);
        assert_eq!(msg.fragments[0].files, vec!["LSST/Object_42.MYD"]);
        assert_eq!(msg.scan.rating, 32);
        assert_eq!(msg.fingerprint, 0xfeed);
    }

    #[test]
    fn json_round_trip() {
        let factory = TaskMsgFactory::new(QueryId(9), 1);
        let msg = factory.make(JobId(3), &sample_spec(), &sample_scan());
        let mut buf = Vec::new();
        factory.serialize(&msg, &mut buf).unwrap();
        let decoded: TaskMsg = serde_json::from_slice(buf.trim_ascii_end()).unwrap();
        assert_eq!(decoded, msg);
    }
}
