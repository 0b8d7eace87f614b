//! Query analysis and chunk-query generation for spatially partitioned
//! catalogs.
//!
//! Architecture role:
//! - SQL frontend and statement classification
//! - name resolution and chunk classification against the metadata catalog
//! - aggregate splitting into parallel + merge forms
//! - spatial restrictor handling
//! - per-chunk concrete query emission and the task wire format
//!
//! Key modules:
//! - [`frontend`]
//! - [`aliases`]
//! - [`table_namer`]
//! - [`aggregate`]
//! - [`spatial`]
//! - [`chunk_spec`]
//! - [`session`]
//! - [`task_msg`]

pub mod aggregate;
pub mod aliases;
pub mod chunk_spec;
pub mod frontend;
pub mod session;
pub mod spatial;
pub mod table_namer;
pub mod task_msg;

pub use aggregate::{rewrite_select_list, AggregateRewrite};
pub use aliases::AliasManager;
pub use chunk_spec::{
    ChunkQueryFragment, ChunkQuerySpec, ChunkSpec, ChunkSpecFragmenter, DUMMY_CHUNK_ID,
};
pub use frontend::{parse_select, StatementKind};
pub use session::{apply_template, ChunkQueryIter, QuerySession};
pub use spatial::{parse_hints, Restrictor, RestrictorKind};
pub use table_namer::{ResolvedTable, ScanInfo, ScanTable, Substitution, TableClass, TableNamer};
pub use task_msg::{ScanInfoMsg, ScanTableMsg, TaskFragmentMsg, TaskMsg, TaskMsgFactory};
