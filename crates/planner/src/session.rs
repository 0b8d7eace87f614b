//! Query session: orchestrates the analysis pipeline for one user query and
//! produces the per-chunk concrete queries for dispatch.
//!
//! The pipeline runs fixed stages over an immutable plan state — parse,
//! aliases, name resolution, spatial restriction, aggregate split, template
//! emission, merge synthesis — each consuming the previous stage's output.
//! Any stage error is captured as the session's single error string and the
//! session becomes terminal: the chunk-query iterator is then empty.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use smq_catalog::{EmptyChunks, MetaCatalog, StripingParams};
use smq_common::{PlannerConfig, QueryId, Result, SmqError};
use sqlparser::ast::GroupByExpr;
use tracing::{debug, info};

use crate::aggregate::{self, AggregateRewrite};
use crate::aliases::AliasManager;
use crate::chunk_spec::{
    ChunkQueryFragment, ChunkQuerySpec, ChunkSpec, ChunkSpecFragmenter, DUMMY_CHUNK_ID,
};
use crate::frontend::{parse_select, query_of, query_of_mut, select_of, select_of_mut};
use crate::spatial::{self, Restrictor};
use crate::table_namer::{apply_names, ScanInfo, TableNamer};

/// Immutable products of a successful analysis.
#[derive(Debug, Clone)]
struct PlanProducts {
    parallel_templates: Vec<String>,
    merge_statement: Option<String>,
    needs_merge: bool,
    dominant_db: String,
    has_chunks: bool,
    has_subchunks: bool,
    subchunk_tables: Vec<String>,
    scan_info: ScanInfo,
    restrictors: Vec<Restrictor>,
    proxy_order_by: Option<String>,
}

/// Analysis state and chunk coverage for one submitted user query.
pub struct QuerySession {
    catalog: MetaCatalog,
    empty_chunks: Arc<EmptyChunks>,
    config: PlannerConfig,
    query_id: QueryId,
    original: String,
    products: Option<PlanProducts>,
    error: Option<String>,
    chunks: Vec<ChunkSpec>,
    is_final: bool,
    is_dummy: bool,
}

impl QuerySession {
    pub fn new(
        catalog: MetaCatalog,
        empty_chunks: Arc<EmptyChunks>,
        config: PlannerConfig,
        query_id: QueryId,
    ) -> Self {
        Self {
            catalog,
            empty_chunks,
            config,
            query_id,
            original: String::new(),
            products: None,
            error: None,
            chunks: Vec::new(),
            is_final: false,
            is_dummy: false,
        }
    }

    /// Analyze a user SQL statement.
    ///
    /// Idempotent: repeated calls on the same input produce identical
    /// products. A failed analysis leaves the session terminal with
    /// [`QuerySession::error`] set.
    pub fn analyze(&mut self, sql: &str) {
        self.original = sql.to_string();
        self.products = None;
        self.error = None;
        self.chunks.clear();
        self.is_final = false;
        self.is_dummy = false;
        match self.analyze_inner(sql) {
            Ok(products) => {
                debug!(query_id = %self.query_id, template = %products.parallel_templates[0],
                       "analysis complete");
                self.products = Some(products);
            }
            Err(err) => {
                info!(query_id = %self.query_id, %err, "analysis failed");
                self.error = Some(err.to_string());
            }
        }
    }

    fn analyze_inner(&self, sql: &str) -> Result<PlanProducts> {
        let stmt = parse_select(sql)?;
        let select = select_of(&stmt)?;
        let aliases = AliasManager::from_select(select);

        let allowed = self.config.effective_allowed_dbs();
        let namer = TableNamer::resolve(select, &self.catalog, &allowed, &self.config.default_db)?;
        let restrictors = spatial::parse_hints(&self.config.hints)?;

        // Working copy carries the parallel-side rewrites.
        let mut working = stmt.clone();
        if !restrictors.is_empty() {
            if let Some(spatial_ref) = namer.spatial_ref() {
                spatial::inject(select_of_mut(&mut working)?, &restrictors, spatial_ref)?;
            }
        }

        let agg = aggregate::rewrite_select_list(&select.projection)?;
        select_of_mut(&mut working)?.projection = agg.parallel_items.clone();

        let group_by_sql = render_group_by(select)?;
        let having_sql = match &select.having {
            Some(expr) => {
                let rendered = expr.to_string();
                if crate::aggregate::contains_aggregate_call(&rendered) {
                    return Err(SmqError::Unsupported(format!(
                        "HAVING with aggregates cannot be merged: {rendered}"
                    )));
                }
                Some(rendered)
            }
            None => None,
        };
        let query = query_of(&stmt)?;
        let (order_by_sql, merge_order_by_sql) = render_order_by(query, &agg, &aliases);
        let limit_sql = query.limit.as_ref().map(|l| l.to_string());

        let needs_merge = agg.has_aggregate
            || order_by_sql.is_some()
            || limit_sql.is_some()
            || having_sql.is_some();

        // The parallel form never orders; concatenation destroys order
        // anyway. A per-chunk LIMIT stays valid only when rows pass through
        // unmerged and ungrouped.
        {
            let wq = query_of_mut(&mut working)?;
            wq.order_by = None;
            if agg.has_aggregate || group_by_sql.is_some() || having_sql.is_some() {
                wq.limit = None;
            }
            select_of_mut(&mut working)?.having = None;
        }

        let subst = namer.substitution(self.config.spatial_conflict_policy)?;
        let mut primary = working.clone();
        apply_names(select_of_mut(&mut primary)?, &subst.primary);
        let mut template = primary.to_string();
        if namer.has_subchunks() {
            let mut overlap = working.clone();
            apply_names(select_of_mut(&mut overlap)?, &subst.overlap);
            template.push_str(" UNION ");
            template.push_str(&overlap.to_string());
        }

        let merge_statement = if needs_merge {
            Some(self.render_merge(
                &agg,
                group_by_sql.as_deref(),
                having_sql.as_deref(),
                merge_order_by_sql.as_deref(),
                limit_sql.as_deref(),
            ))
        } else {
            None
        };

        Ok(PlanProducts {
            parallel_templates: vec![template],
            merge_statement,
            needs_merge,
            dominant_db: namer.dominant_db().to_string(),
            has_chunks: namer.has_chunks(),
            has_subchunks: namer.has_subchunks(),
            subchunk_tables: namer.subchunk_table_names(),
            scan_info: namer.scan_info(),
            restrictors,
            proxy_order_by: order_by_sql,
        })
    }

    fn render_merge(
        &self,
        agg: &AggregateRewrite,
        group_by: Option<&str>,
        having: Option<&str>,
        order_by: Option<&str>,
        limit: Option<&str>,
    ) -> String {
        let mut merge = format!(
            "SELECT {} FROM result_{}_m",
            agg.merge_items.join(", "),
            self.query_id
        );
        if let Some(g) = group_by {
            merge.push_str(" GROUP BY ");
            merge.push_str(g);
        }
        if let Some(h) = having {
            merge.push_str(" HAVING ");
            merge.push_str(h);
        }
        if let Some(o) = order_by {
            merge.push_str(" ORDER BY ");
            merge.push_str(o);
        }
        if let Some(l) = limit {
            merge.push_str(" LIMIT ");
            merge.push_str(l);
        }
        merge
    }

    /// The original statement text.
    pub fn original(&self) -> &str {
        &self.original
    }

    /// Analysis error, if the pipeline failed.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Stable fingerprint of the original statement, carried on dispatched
    /// tasks so workers can attribute them.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.original.hash(&mut hasher);
        hasher.finish()
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    /// Whether a merge pass over concatenated partials is required.
    pub fn needs_merge(&self) -> bool {
        self.products.as_ref().map(|p| p.needs_merge).unwrap_or(false)
    }

    pub fn has_chunks(&self) -> bool {
        self.products.as_ref().map(|p| p.has_chunks).unwrap_or(false)
    }

    pub fn has_subchunks(&self) -> bool {
        self.products
            .as_ref()
            .map(|p| p.has_subchunks)
            .unwrap_or(false)
    }

    /// Database used to pick the worker pool; distinct from the default db.
    pub fn dominant_db(&self) -> Option<&str> {
        self.products.as_ref().map(|p| p.dominant_db.as_str())
    }

    /// Parallel statement templates with `%CC%`/`%SS%` substitution points.
    pub fn parallel_templates(&self) -> &[String] {
        self.products
            .as_ref()
            .map(|p| p.parallel_templates.as_slice())
            .unwrap_or(&[])
    }

    /// Merge statement over `result_<id>_m`, when one is needed.
    pub fn merge_statement(&self) -> Option<&str> {
        self.products
            .as_ref()
            .and_then(|p| p.merge_statement.as_deref())
    }

    /// ORDER BY clause the result proxy should apply at retrieval, if any.
    pub fn proxy_order_by(&self) -> Option<&str> {
        self.products
            .as_ref()
            .and_then(|p| p.proxy_order_by.as_deref())
    }

    /// Structured spatial restrictors for coverage computation.
    pub fn restrictors(&self) -> &[Restrictor] {
        self.products
            .as_ref()
            .map(|p| p.restrictors.as_slice())
            .unwrap_or(&[])
    }

    /// Shared-scan metadata of the analyzed statement.
    pub fn scan_info(&self) -> ScanInfo {
        self.products
            .as_ref()
            .map(|p| p.scan_info.clone())
            .unwrap_or_default()
    }

    /// Striping geometry of the dominant database.
    pub fn db_striping(&self) -> Result<StripingParams> {
        let db = self
            .dominant_db()
            .ok_or_else(|| SmqError::Internal("no dominant db before analysis".to_string()))?;
        self.catalog.db_striping(db)
    }

    /// Extend chunk coverage. Chunks in the dominant database's empty-chunk
    /// set are pruned here.
    pub fn add_chunk(&mut self, spec: ChunkSpec) -> Result<()> {
        if self.is_final {
            return Err(SmqError::Internal(
                "add_chunk after finalize".to_string(),
            ));
        }
        let products = self
            .products
            .as_ref()
            .ok_or_else(|| SmqError::Internal("add_chunk before analysis".to_string()))?;
        if products.has_subchunks && spec.subchunks.is_empty() {
            return Err(SmqError::Analysis(format!(
                "chunk {} has no sub-chunk coverage for a sub-chunked query",
                spec.chunk_id
            )));
        }
        let empty = self.empty_chunks.for_db(&products.dominant_db)?;
        if empty.contains(&spec.chunk_id) {
            debug!(query_id = %self.query_id, chunk = spec.chunk_id, "pruned empty chunk");
            return Ok(());
        }
        self.chunks.push(spec);
        Ok(())
    }

    /// Replace coverage with the dummy chunk (chunk-less query).
    pub fn set_dummy(&mut self) {
        self.is_dummy = true;
        self.chunks.clear();
        self.chunks.push(ChunkSpec::new(DUMMY_CHUNK_ID, vec![1]));
    }

    pub fn is_dummy(&self) -> bool {
        self.is_dummy
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Freeze the session after coverage is complete. Chunk-less queries get
    /// the dummy chunk. After a successful finalize the templates and chunk
    /// list are immutable.
    pub fn finalize(&mut self) -> Result<()> {
        if self.is_final {
            return Ok(());
        }
        if self.products.is_none() {
            return Err(SmqError::Internal(
                "finalize on a session without a successful analysis".to_string(),
            ));
        }
        if self.chunks.is_empty() {
            self.set_dummy();
        }
        self.is_final = true;
        Ok(())
    }

    /// Current chunk coverage.
    pub fn chunks(&self) -> &[ChunkSpec] {
        &self.chunks
    }

    /// Iterate the concrete per-chunk query specs. Empty when analysis
    /// failed.
    pub fn chunk_queries(&self) -> ChunkQueryIter<'_> {
        ChunkQueryIter {
            session: self,
            pos: 0,
            cache: None,
            dirty: true,
        }
    }

    fn build_spec(&self, products: &PlanProducts, spec: &ChunkSpec) -> ChunkQuerySpec {
        let templates = &products.parallel_templates;
        let mut fragments = Vec::new();
        if !products.has_subchunks {
            fragments.push(ChunkQueryFragment {
                queries: templates
                    .iter()
                    .map(|t| apply_template(t, spec.chunk_id, None))
                    .collect(),
                subchunk_ids: Vec::new(),
            });
        } else {
            for batch in ChunkSpecFragmenter::new(spec, self.config.max_subchunks_per_fragment) {
                let mut queries = Vec::with_capacity(batch.len() * templates.len());
                for subchunk in batch {
                    for template in templates {
                        queries.push(apply_template(template, spec.chunk_id, Some(*subchunk)));
                    }
                }
                fragments.push(ChunkQueryFragment {
                    queries,
                    subchunk_ids: batch.to_vec(),
                });
            }
        }
        ChunkQuerySpec {
            db: products.dominant_db.clone(),
            chunk_id: spec.chunk_id,
            subchunk_tables: products.subchunk_tables.clone(),
            fragments,
        }
    }
}

/// Substitute the chunk (and optionally sub-chunk) id into a template.
pub fn apply_template(template: &str, chunk_id: i32, subchunk_id: Option<i32>) -> String {
    let mut out = template.replace("%CC%", &chunk_id.to_string());
    if let Some(sub) = subchunk_id {
        out = out.replace("%SS%", &sub.to_string());
    }
    out
}

/// Forward iterator over [`ChunkQuerySpec`]s, one per coverage element.
///
/// The built spec is cached; advancing marks the cache dirty and the next
/// read rebuilds it from the templates.
pub struct ChunkQueryIter<'a> {
    session: &'a QuerySession,
    pos: usize,
    cache: Option<ChunkQuerySpec>,
    dirty: bool,
}

impl<'a> ChunkQueryIter<'a> {
    /// Spec at the current position without advancing.
    pub fn peek(&mut self) -> Option<&ChunkQuerySpec> {
        if self.session.error.is_some() {
            return None;
        }
        let products = self.session.products.as_ref()?;
        let chunk = self.session.chunks.get(self.pos)?;
        if self.dirty {
            self.cache = Some(self.session.build_spec(products, chunk));
            self.dirty = false;
        }
        self.cache.as_ref()
    }
}

impl<'a> Iterator for ChunkQueryIter<'a> {
    type Item = ChunkQuerySpec;

    fn next(&mut self) -> Option<ChunkQuerySpec> {
        self.peek()?;
        let spec = self.cache.take();
        self.pos += 1;
        self.dirty = true;
        spec
    }
}

/// Render ORDER BY twice: as written (for the result proxy) and remapped
/// for the merge statement, where aggregate expressions become their merge
/// forms and aliased expressions are referenced by alias.
fn render_order_by(
    query: &sqlparser::ast::Query,
    agg: &AggregateRewrite,
    aliases: &AliasManager,
) -> (Option<String>, Option<String>) {
    let order_by = match &query.order_by {
        Some(ob) if !ob.exprs.is_empty() => ob,
        _ => return (None, None),
    };
    let mut original = Vec::with_capacity(order_by.exprs.len());
    let mut remapped = Vec::with_capacity(order_by.exprs.len());
    for obe in &order_by.exprs {
        let expr_text = obe.expr.to_string();
        let mut suffix = String::new();
        match obe.asc {
            Some(true) => suffix.push_str(" ASC"),
            Some(false) => suffix.push_str(" DESC"),
            None => {}
        }
        match obe.nulls_first {
            Some(true) => suffix.push_str(" NULLS FIRST"),
            Some(false) => suffix.push_str(" NULLS LAST"),
            None => {}
        }
        let merged = agg
            .merge_exprs_by_source
            .iter()
            .find(|(source, _)| source == &expr_text)
            .map(|(_, merge)| merge.clone())
            .or_else(|| aliases.alias_for_expr(&expr_text).map(str::to_string))
            .unwrap_or_else(|| expr_text.clone());
        original.push(format!("{expr_text}{suffix}"));
        remapped.push(format!("{merged}{suffix}"));
    }
    (Some(original.join(", ")), Some(remapped.join(", ")))
}

fn render_group_by(select: &sqlparser::ast::Select) -> Result<Option<String>> {
    match &select.group_by {
        GroupByExpr::Expressions(exprs, ..) if exprs.is_empty() => Ok(None),
        GroupByExpr::Expressions(exprs, ..) => Ok(Some(
            exprs
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        )),
        _ => Err(SmqError::Unsupported(
            "GROUP BY ALL is not supported".to_string(),
        )),
    }
}
