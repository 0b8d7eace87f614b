//! Metadata catalog facade used by the query planner.
//!
//! Answers the questions the planner needs during name resolution and
//! classification: which databases are allowed, which tables are chunked or
//! sub-chunked, which columns carry the spatial partitioning, and the
//! striping geometry of a database. Read-only.

use std::sync::Arc;

use smq_common::{Result, SmqError};
use tracing::debug;

use crate::kv::KvInterface;

/// Spatial partitioning columns of one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionCols {
    /// Longitude-like column (e.g. `ra`).
    pub lon: String,
    /// Latitude-like column (e.g. `decl`).
    pub lat: String,
    /// Director key column (e.g. `objectId`).
    pub key: String,
}

/// Striping geometry of a database's partitioning scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StripingParams {
    pub stripes: i32,
    pub sub_stripes: i32,
}

/// Chunking classification of a table as recorded in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkLevel {
    /// Not partitioned.
    Plain,
    /// Chunked only.
    Chunked,
    /// Chunked with sub-chunk overlap partitions.
    SubChunked,
}

/// Facade over the key-value surface.
///
/// Path layout:
/// - `/db/<name>` — database registered (and allowed)
/// - `/db/<name>/<table>` — table registered
/// - `/db/<name>/<table>/partitioning` — table is chunked
/// - `/db/<name>/<table>/partitioning/subchunks` = `1` — also sub-chunked
/// - `/db/<name>/<table>/partitioning/{lon,lat,key}` — partitioning columns
/// - `/db/<name>/partitioning/{stripes,substripes}` — striping geometry
#[derive(Clone)]
pub struct MetaCatalog {
    kv: Arc<dyn KvInterface>,
}

impl MetaCatalog {
    pub fn new(kv: Arc<dyn KvInterface>) -> Self {
        Self { kv }
    }

    fn db_path(&self, db: &str) -> String {
        format!("/db/{db}")
    }

    fn table_path(&self, db: &str, table: &str) -> String {
        format!("/db/{db}/{table}")
    }

    pub fn contains_db(&self, db: &str) -> Result<bool> {
        self.kv.exists(&self.db_path(db))
    }

    pub fn contains_table(&self, db: &str, table: &str) -> Result<bool> {
        self.check_db(db)?;
        self.kv.exists(&self.table_path(db, table))
    }

    /// Databases registered in the catalog.
    pub fn allowed_dbs(&self) -> Result<Vec<String>> {
        self.kv.get_children("/db")
    }

    fn check_db(&self, db: &str) -> Result<()> {
        if !self.contains_db(db)? {
            debug!(db, "db not found in metadata catalog");
            return Err(SmqError::Analysis(format!("no such database: {db}")));
        }
        Ok(())
    }

    fn check_table(&self, db: &str, table: &str) -> Result<()> {
        if !self.contains_table(db, table)? {
            debug!(db, table, "table not found in metadata catalog");
            return Err(SmqError::Analysis(format!(
                "no such table: {db}.{table}"
            )));
        }
        Ok(())
    }

    pub fn table_is_chunked(&self, db: &str, table: &str) -> Result<bool> {
        self.check_table(db, table)?;
        self.kv
            .exists(&format!("{}/partitioning", self.table_path(db, table)))
    }

    pub fn table_is_sub_chunked(&self, db: &str, table: &str) -> Result<bool> {
        self.check_table(db, table)?;
        let path = format!("{}/partitioning/subchunks", self.table_path(db, table));
        if !self.kv.exists(&path)? {
            return Ok(false);
        }
        Ok(self.kv.get(&path)? == "1")
    }

    /// Classification for one table: plain, chunked, or sub-chunked.
    pub fn chunk_level(&self, db: &str, table: &str) -> Result<ChunkLevel> {
        if self.table_is_sub_chunked(db, table)? {
            Ok(ChunkLevel::SubChunked)
        } else if self.table_is_chunked(db, table)? {
            Ok(ChunkLevel::Chunked)
        } else {
            Ok(ChunkLevel::Plain)
        }
    }

    /// Tables of `db` that are chunked (including sub-chunked ones).
    pub fn chunked_tables(&self, db: &str) -> Result<Vec<String>> {
        self.check_db(db)?;
        let mut out = Vec::new();
        for table in self.kv.get_children(&self.db_path(db))? {
            if table == "partitioning" || table == "emptychunks" {
                continue;
            }
            if self.table_is_chunked(db, &table)? {
                out.push(table);
            }
        }
        Ok(out)
    }

    /// Tables of `db` that carry sub-chunk overlap partitions.
    pub fn sub_chunked_tables(&self, db: &str) -> Result<Vec<String>> {
        self.check_db(db)?;
        let mut out = Vec::new();
        for table in self.kv.get_children(&self.db_path(db))? {
            if table == "partitioning" || table == "emptychunks" {
                continue;
            }
            if self.table_is_sub_chunked(db, &table)? {
                out.push(table);
            }
        }
        Ok(out)
    }

    /// Partitioning columns of a chunked table.
    ///
    /// Every chunked table must record all three columns; an incomplete
    /// entry is a catalog misconfiguration.
    pub fn partition_cols(&self, db: &str, table: &str) -> Result<PartitionCols> {
        self.check_table(db, table)?;
        let base = format!("{}/partitioning", self.table_path(db, table));
        let read = |leaf: &str| -> Result<String> {
            self.kv.get(&format!("{base}/{leaf}")).map_err(|_| {
                SmqError::InvalidConfig(format!(
                    "table {db}.{table} is chunked but missing partitioning column '{leaf}'"
                ))
            })
        };
        Ok(PartitionCols {
            lon: read("lon")?,
            lat: read("lat")?,
            key: read("key")?,
        })
    }

    /// Director key column of a table, empty if not recorded.
    pub fn key_column(&self, db: &str, table: &str) -> Result<String> {
        self.check_table(db, table)?;
        let path = format!("{}/partitioning/key", self.table_path(db, table));
        if self.kv.exists(&path)? {
            self.kv.get(&path)
        } else {
            Ok(String::new())
        }
    }

    /// Striping geometry of `db`.
    pub fn db_striping(&self, db: &str) -> Result<StripingParams> {
        self.check_db(db)?;
        let base = format!("{}/partitioning", self.db_path(db));
        let read_int = |leaf: &str| -> Result<i32> {
            let raw = self.kv.get(&format!("{base}/{leaf}"))?;
            raw.parse::<i32>().map_err(|_| {
                SmqError::InvalidConfig(format!("db {db}: bad striping value '{raw}' for {leaf}"))
            })
        };
        Ok(StripingParams {
            stripes: read_int("stripes")?,
            sub_stripes: read_int("substripes")?,
        })
    }
}
