//! Metadata catalog access for the planner.
//!
//! Architecture role:
//! - [`kv`]: read-only hierarchical key-value contract + in-memory impl
//! - [`facade`]: typed catalog queries (allowed dbs, chunk levels,
//!   partitioning columns, striping)
//! - [`empty_chunks`]: per-database empty-chunk sets with caching
//!
//! The storage layer behind [`kv::KvInterface`] is an external collaborator;
//! nothing here writes to it.

pub mod empty_chunks;
pub mod facade;
pub mod kv;

pub use empty_chunks::EmptyChunks;
pub use facade::{ChunkLevel, MetaCatalog, PartitionCols, StripingParams};
pub use kv::{KvInterface, MemKv};
