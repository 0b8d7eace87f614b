//! Table reference resolution, chunk classification, and name templating.
//!
//! Each FROM-clause reference is resolved against the default database and
//! the allow-list, classified from the metadata catalog, and mapped to its
//! templated worker-side name: `T` → `T_%CC%` for chunked tables, or
//! `T_%CC%_%SS%` (with a `TFullOverlap_%CC%_%SS%` union variant) when the
//! reference participates in a sub-chunked join.

use std::collections::HashMap;

use smq_catalog::{ChunkLevel, MetaCatalog, PartitionCols};
use smq_common::{Result, SmqError, SpatialConflictPolicy};
use sqlparser::ast::{Ident, ObjectName, Select, TableFactor};
use tracing::{debug, warn};

/// Classification of one resolved reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableClass {
    Plain,
    Chunked,
    SubChunked,
}

/// One resolved FROM-clause reference, in lexical order.
#[derive(Debug, Clone)]
pub struct ResolvedTable {
    pub db: String,
    pub table: String,
    pub alias: Option<String>,
    /// Whether the reference carried an explicit db qualifier.
    pub qualified: bool,
    pub class: TableClass,
    /// Partitioning columns; always present for chunked references.
    pub partition: Option<PartitionCols>,
}

impl ResolvedTable {
    fn is_chunked(&self) -> bool {
        !matches!(self.class, TableClass::Plain)
    }
}

/// Positional substitution maps produced by the namer.
///
/// `primary[i]` / `overlap[i]` give the munged table name for the `i`-th
/// reference, or `None` when the reference stays as written. The overlap map
/// only differs for the union arm of sub-chunked joins.
#[derive(Debug, Clone)]
pub struct Substitution {
    pub primary: Vec<Option<String>>,
    pub overlap: Vec<Option<String>>,
}

/// Shared-scan metadata for one referenced table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTable {
    pub db: String,
    pub table: String,
    pub lock_in_memory: bool,
    pub rating: i32,
}

/// Scan cost summary of a query, used to pick the worker scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanInfo {
    pub tables: Vec<ScanTable>,
    pub rating: i32,
}

const RATING_CHUNKED: i32 = 16;
const RATING_SUB_CHUNKED: i32 = 32;

/// Result of resolving a statement's FROM clause.
#[derive(Debug, Clone)]
pub struct TableNamer {
    refs: Vec<ResolvedTable>,
    dominant_db: String,
}

impl TableNamer {
    /// Resolve and classify every FROM reference of `select`.
    ///
    /// Allow-list violations come back as a single `Analysis` error carrying
    /// the user-facing message; the empty-db sentinel produces
    /// `No database selected.`.
    pub fn resolve(
        select: &Select,
        catalog: &MetaCatalog,
        allowed_dbs: &[String],
        default_db: &str,
    ) -> Result<TableNamer> {
        let raw = collect_refs(select)?;

        let mut bad_dbs: Vec<String> = Vec::new();
        let mut resolved: Vec<ResolvedTable> = Vec::new();
        for (name, alias) in &raw {
            let (db, table, qualified) = split_name(name, default_db);
            if db.is_empty() {
                if !bad_dbs.iter().any(String::is_empty) {
                    bad_dbs.push(String::new());
                }
                continue;
            }
            if !allowed_dbs.contains(&db) {
                if !bad_dbs.contains(&db) {
                    bad_dbs.push(db);
                }
                continue;
            }
            resolved.push(ResolvedTable {
                db,
                table,
                alias: alias.clone(),
                qualified,
                class: TableClass::Plain,
                partition: None,
            });
        }
        if !bad_dbs.is_empty() {
            return Err(SmqError::Analysis(interpret_bad_dbs(&bad_dbs)));
        }

        // Classification is fixed the moment the catalog resolves each
        // reference; a level-2 table only acts sub-chunked when the query
        // joins it to itself or to another level-2 table.
        let mut level2 = 0usize;
        let mut levels: Vec<ChunkLevel> = Vec::with_capacity(resolved.len());
        for r in &resolved {
            if !catalog.contains_db(&r.db)? {
                return Err(SmqError::Analysis(format!("no such database: {}", r.db)));
            }
            if !catalog.contains_table(&r.db, &r.table)? {
                return Err(SmqError::Analysis(format!(
                    "no such table: {}.{}",
                    r.db, r.table
                )));
            }
            let level = catalog.chunk_level(&r.db, &r.table)?;
            if level == ChunkLevel::SubChunked {
                level2 += 1;
            }
            levels.push(level);
        }
        let use_subchunks = level2 >= 2;
        for (r, level) in resolved.iter_mut().zip(levels) {
            r.class = match level {
                ChunkLevel::Plain => TableClass::Plain,
                ChunkLevel::Chunked => TableClass::Chunked,
                ChunkLevel::SubChunked if use_subchunks => TableClass::SubChunked,
                ChunkLevel::SubChunked => TableClass::Chunked,
            };
            if r.is_chunked() {
                r.partition = Some(catalog.partition_cols(&r.db, &r.table)?);
            }
        }

        let dominant_db = resolved
            .iter()
            .find(|r| r.is_chunked())
            .map(|r| r.db.clone())
            .unwrap_or_else(|| default_db.to_string());
        debug!(%dominant_db, refs = resolved.len(), "table references resolved");

        Ok(TableNamer {
            refs: resolved,
            dominant_db,
        })
    }

    pub fn refs(&self) -> &[ResolvedTable] {
        &self.refs
    }

    /// Database used to select the worker pool for this query.
    pub fn dominant_db(&self) -> &str {
        &self.dominant_db
    }

    pub fn has_chunks(&self) -> bool {
        self.refs.iter().any(ResolvedTable::is_chunked)
    }

    pub fn has_subchunks(&self) -> bool {
        self.refs
            .iter()
            .any(|r| r.class == TableClass::SubChunked)
    }

    /// First chunked reference; the spatial restrictor binds to its
    /// partitioning columns.
    pub fn spatial_ref(&self) -> Option<&ResolvedTable> {
        self.refs.iter().find(|r| r.is_chunked())
    }

    /// Distinct `db.table` names participating as sub-chunked, in order.
    pub fn subchunk_table_names(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for r in &self.refs {
            if r.class == TableClass::SubChunked {
                let name = format!("{}.{}", r.db, r.table);
                if !out.contains(&name) {
                    out.push(name);
                }
            }
        }
        out
    }

    /// Shared-scan metadata over the distinct chunked tables.
    pub fn scan_info(&self) -> ScanInfo {
        let mut tables: Vec<ScanTable> = Vec::new();
        let mut rating = 0;
        for r in &self.refs {
            if !r.is_chunked() {
                continue;
            }
            let table_rating = match r.class {
                TableClass::SubChunked => RATING_SUB_CHUNKED,
                _ => RATING_CHUNKED,
            };
            if !tables.iter().any(|t| t.db == r.db && t.table == r.table) {
                tables.push(ScanTable {
                    db: r.db.clone(),
                    table: r.table.clone(),
                    lock_in_memory: true,
                    rating: table_rating,
                });
            }
            rating = rating.max(table_rating);
        }
        ScanInfo { tables, rating }
    }

    /// Build the positional substitution maps, honoring the munged-name
    /// conflict policy.
    pub fn substitution(&self, policy: SpatialConflictPolicy) -> Result<Substitution> {
        let mut primary: Vec<Option<String>> = Vec::with_capacity(self.refs.len());
        let mut overlap: Vec<Option<String>> = Vec::with_capacity(self.refs.len());
        let mut munged_referents: HashMap<String, String> = HashMap::new();
        let mut first_subchunked = true;

        for r in &self.refs {
            let (p, o) = match r.class {
                TableClass::Plain => (None, None),
                TableClass::Chunked => {
                    let munged = format!("{}_%CC%", r.table);
                    (Some(munged.clone()), Some(munged))
                }
                TableClass::SubChunked => {
                    let munged = format!("{}_%CC%_%SS%", r.table);
                    let over = if first_subchunked {
                        first_subchunked = false;
                        munged.clone()
                    } else {
                        format!("{}FullOverlap_%CC%_%SS%", r.table)
                    };
                    (Some(munged), Some(over))
                }
            };
            if let Some(munged) = &p {
                let referent = format!("{}.{}", r.db, r.table);
                match munged_referents.get(munged).cloned() {
                    Some(existing) if existing != referent => match policy {
                        SpatialConflictPolicy::Reject => {
                            return Err(SmqError::Internal(format!(
                                "conflicting munged referent: {munged} -> {existing} (existing), {referent} (new)"
                            )));
                        }
                        SpatialConflictPolicy::First => {
                            warn!(%munged, %existing, %referent, "keeping first munged referent");
                        }
                        SpatialConflictPolicy::Last => {
                            warn!(%munged, %existing, %referent, "keeping last munged referent");
                            munged_referents.insert(munged.clone(), referent);
                        }
                    },
                    Some(_) => {}
                    None => {
                        munged_referents.insert(munged.clone(), referent);
                    }
                }
            }
            primary.push(p);
            overlap.push(o);
        }
        Ok(Substitution { primary, overlap })
    }
}

/// Rewrite the FROM-clause table names of `select` in place with the given
/// positional map. References mapped to `None` stay as written.
pub fn apply_names(select: &mut Select, names: &[Option<String>]) {
    let mut index = 0usize;
    for twj in &mut select.from {
        rewrite_factor(&mut twj.relation, names, &mut index);
        for join in &mut twj.joins {
            rewrite_factor(&mut join.relation, names, &mut index);
        }
    }
}

fn rewrite_factor(factor: &mut TableFactor, names: &[Option<String>], index: &mut usize) {
    if let TableFactor::Table { name, .. } = factor {
        if let Some(Some(munged)) = names.get(*index) {
            let mut idents = name.0.clone();
            if let Some(last) = idents.last_mut() {
                *last = Ident::new(munged.clone());
            }
            *name = ObjectName(idents);
        }
        *index += 1;
    }
}

fn collect_refs(select: &Select) -> Result<Vec<(ObjectName, Option<String>)>> {
    let mut out = Vec::new();
    for twj in &select.from {
        push_factor(&twj.relation, &mut out)?;
        for join in &twj.joins {
            push_factor(&join.relation, &mut out)?;
        }
    }
    if out.is_empty() {
        return Err(SmqError::Unsupported(
            "statement has no table references".to_string(),
        ));
    }
    Ok(out)
}

fn push_factor(factor: &TableFactor, out: &mut Vec<(ObjectName, Option<String>)>) -> Result<()> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            out.push((name.clone(), alias.as_ref().map(|a| a.name.value.clone())));
            Ok(())
        }
        _ => Err(SmqError::Unsupported(
            "only plain table references are supported in FROM".to_string(),
        )),
    }
}

fn split_name(name: &ObjectName, default_db: &str) -> (String, String, bool) {
    let idents = &name.0;
    if idents.len() >= 2 {
        (
            idents[idents.len() - 2].value.clone(),
            idents[idents.len() - 1].value.clone(),
            true,
        )
    } else {
        (
            default_db.to_string(),
            idents
                .last()
                .map(|i| i.value.clone())
                .unwrap_or_default(),
            false,
        )
    }
}

fn interpret_bad_dbs(bad: &[String]) -> String {
    let named: Vec<&str> = bad
        .iter()
        .filter(|d| !d.is_empty())
        .map(String::as_str)
        .collect();
    let has_default_bad = bad.iter().any(String::is_empty);
    let mut msg = String::new();
    if has_default_bad {
        msg.push_str("No database selected.");
    }
    if !named.is_empty() {
        if !msg.is_empty() {
            msg.push(' ');
        }
        msg.push_str("Query references prohibited dbs: ");
        msg.push_str(&named.join(","));
    }
    msg
}
