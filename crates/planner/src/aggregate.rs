//! Aggregate splitting for two-pass execution.
//!
//! Each top-level aggregate in the select list becomes a partial form
//! executed per chunk (emitting stable `QSn_*` columns) and a merge form
//! combining the concatenated partials:
//! `SUM → SUM`, `COUNT → SUM`, `MIN → MIN`, `MAX → MAX`,
//! `AVG → SUM(QSm_SUM)/SUM(QSn_COUNT)`.

use smq_common::{Result, SmqError};
use sqlparser::ast::{Expr, FunctionArg, FunctionArgExpr, FunctionArguments, Ident, SelectItem};

use crate::frontend::parse_expr;

/// Result of rewriting one select list.
#[derive(Debug, Clone)]
pub struct AggregateRewrite {
    /// Whether any aggregate was split.
    pub has_aggregate: bool,
    /// Select items for the parallel (per-chunk) statement.
    pub parallel_items: Vec<SelectItem>,
    /// Rendered select items for the merge statement, in output order.
    pub merge_items: Vec<String>,
    /// Original aggregate text → merge expression (alias-free), used to
    /// remap ORDER BY references into the merge statement.
    pub merge_exprs_by_source: Vec<(String, String)>,
}

enum AggKind {
    Sum,
    Count,
    Min,
    Max,
    Avg,
}

impl AggKind {
    fn of(name: &str) -> Option<AggKind> {
        match name.to_uppercase().as_str() {
            "SUM" => Some(AggKind::Sum),
            "COUNT" => Some(AggKind::Count),
            "MIN" => Some(AggKind::Min),
            "MAX" => Some(AggKind::Max),
            "AVG" => Some(AggKind::Avg),
            _ => None,
        }
    }
}

/// Split the select list into parallel and merge forms.
///
/// Aggregates are only recognized at the top of a select item; an aggregate
/// buried inside a larger expression cannot be split and is `Unsupported`,
/// as is `DISTINCT` inside an aggregate.
pub fn rewrite_select_list(projection: &[SelectItem]) -> Result<AggregateRewrite> {
    let mut rewrite = AggregateRewrite {
        has_aggregate: false,
        parallel_items: Vec::new(),
        merge_items: Vec::new(),
        merge_exprs_by_source: Vec::new(),
    };
    let mut next_index = 1usize;

    for item in projection {
        match item {
            SelectItem::UnnamedExpr(expr) => {
                rewrite_item(expr, None, &mut rewrite, &mut next_index)?;
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                rewrite_item(expr, Some(alias), &mut rewrite, &mut next_index)?;
            }
            SelectItem::Wildcard(_) => {
                rewrite.parallel_items.push(item.clone());
                rewrite.merge_items.push("*".to_string());
            }
            SelectItem::QualifiedWildcard(_, _) => {
                rewrite.parallel_items.push(item.clone());
                rewrite.merge_items.push("*".to_string());
            }
        }
    }
    Ok(rewrite)
}

fn rewrite_item(
    expr: &Expr,
    alias: Option<&Ident>,
    rewrite: &mut AggregateRewrite,
    next_index: &mut usize,
) -> Result<()> {
    if let Expr::Function(func) = expr {
        if let Some(kind) = AggKind::of(&func.name.to_string()) {
            let arg = aggregate_argument(func)?;
            let merge_core = emit_partials(&kind, &arg, rewrite, next_index)?;
            rewrite.has_aggregate = true;
            rewrite.merge_items.push(match alias {
                Some(a) => format!("{merge_core} AS {}", a.value),
                None => merge_core.clone(),
            });
            rewrite
                .merge_exprs_by_source
                .push((expr.to_string(), merge_core));
            return Ok(());
        }
    }
    if contains_aggregate_call(&expr.to_string()) {
        return Err(SmqError::Unsupported(format!(
            "cannot split aggregate inside expression: {expr}"
        )));
    }
    let rendered = expr.to_string();
    let merge_name = match alias {
        Some(a) => a.value.clone(),
        None => rendered,
    };
    rewrite.parallel_items.push(match alias {
        Some(a) => SelectItem::ExprWithAlias {
            expr: expr.clone(),
            alias: a.clone(),
        },
        None => SelectItem::UnnamedExpr(expr.clone()),
    });
    rewrite.merge_items.push(merge_name);
    Ok(())
}

/// Append the partial select items for one aggregate; returns the merge
/// expression (alias-free) combining them.
fn emit_partials(
    kind: &AggKind,
    arg: &str,
    rewrite: &mut AggregateRewrite,
    next_index: &mut usize,
) -> Result<String> {
    match kind {
        AggKind::Sum | AggKind::Count | AggKind::Min | AggKind::Max => {
            let (func, merge_func, tag) = match kind {
                AggKind::Sum => ("SUM", "SUM", "SUM"),
                AggKind::Count => ("COUNT", "SUM", "COUNT"),
                AggKind::Min => ("MIN", "MIN", "MIN"),
                AggKind::Max => ("MAX", "MAX", "MAX"),
                AggKind::Avg => unreachable!(),
            };
            let partial_name = format!("QS{}_{tag}", *next_index);
            *next_index += 1;
            rewrite
                .parallel_items
                .push(aliased_item(&format!("{func}({arg})"), &partial_name)?);
            Ok(format!("{merge_func}({partial_name})"))
        }
        AggKind::Avg => {
            // AVG splits into COUNT then SUM partials; the merge divides.
            let count_name = format!("QS{}_COUNT", *next_index);
            *next_index += 1;
            let sum_name = format!("QS{}_SUM", *next_index);
            *next_index += 1;
            rewrite
                .parallel_items
                .push(aliased_item(&format!("COUNT({arg})"), &count_name)?);
            rewrite
                .parallel_items
                .push(aliased_item(&format!("SUM({arg})"), &sum_name)?);
            Ok(format!("(SUM({sum_name})/SUM({count_name}))"))
        }
    }
}

fn aliased_item(expr_sql: &str, alias: &str) -> Result<SelectItem> {
    Ok(SelectItem::ExprWithAlias {
        expr: parse_expr(expr_sql)?,
        alias: Ident::new(alias),
    })
}

fn aggregate_argument(func: &sqlparser::ast::Function) -> Result<String> {
    let list = match &func.args {
        FunctionArguments::List(list) => list,
        _ => {
            return Err(SmqError::Unsupported(format!(
                "aggregate without argument list: {func}"
            )))
        }
    };
    if list.duplicate_treatment.is_some() {
        return Err(SmqError::Unsupported(format!(
            "DISTINCT inside an aggregate cannot be merged: {func}"
        )));
    }
    if list.args.len() != 1 {
        return Err(SmqError::Unsupported(format!(
            "aggregates take exactly one argument: {func}"
        )));
    }
    match &list.args[0] {
        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Ok(e.to_string()),
        FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => Ok("*".to_string()),
        other => Err(SmqError::Unsupported(format!(
            "unsupported aggregate argument: {other}"
        ))),
    }
}

/// Textual scan for aggregate calls, used to reject expressions the
/// splitter cannot transform. Word-boundary aware on the left so column
/// names like `checksum_id` never match.
pub(crate) fn contains_aggregate_call(rendered: &str) -> bool {
    let upper = rendered.to_uppercase();
    for name in ["SUM(", "COUNT(", "AVG(", "MIN(", "MAX("] {
        let mut start = 0;
        while let Some(pos) = upper[start..].find(name) {
            let at = start + pos;
            let preceded = at > 0
                && upper
                    .as_bytes()
                    .get(at - 1)
                    .map(|b| b.is_ascii_alphanumeric() || *b == b'_')
                    .unwrap_or(false);
            if !preceded {
                return true;
            }
            start = at + name.len();
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{parse_select, select_of};

    fn rewrite(sql: &str) -> AggregateRewrite {
        let stmt = parse_select(sql).unwrap();
        rewrite_select_list(&select_of(&stmt).unwrap().projection).unwrap()
    }

    fn rendered(items: &[SelectItem]) -> Vec<String> {
        items.iter().map(|i| i.to_string()).collect()
    }

    #[test]
    fn sum_and_avg_split_in_order() {
        let r = rewrite("SELECT SUM(pm_declErr), AVG(pm_declErr), chunkId FROM T GROUP BY chunkId");
        assert!(r.has_aggregate);
        assert_eq!(
            rendered(&r.parallel_items),
            vec![
                "SUM(pm_declErr) AS QS1_SUM",
                "COUNT(pm_declErr) AS QS2_COUNT",
                "SUM(pm_declErr) AS QS3_SUM",
                "chunkId",
            ]
        );
        assert_eq!(
            r.merge_items,
            vec!["SUM(QS1_SUM)", "(SUM(QS3_SUM)/SUM(QS2_COUNT))", "chunkId"]
        );
    }

    #[test]
    fn count_star_and_min_max() {
        let r = rewrite("SELECT COUNT(*), MIN(flux), MAX(flux) FROM T");
        assert_eq!(
            rendered(&r.parallel_items),
            vec![
                "COUNT(*) AS QS1_COUNT",
                "MIN(flux) AS QS2_MIN",
                "MAX(flux) AS QS3_MAX",
            ]
        );
        assert_eq!(
            r.merge_items,
            vec!["SUM(QS1_COUNT)", "MIN(QS2_MIN)", "MAX(QS3_MAX)"]
        );
    }

    #[test]
    fn user_alias_survives_on_merge_item() {
        let r = rewrite("SELECT SUM(flux) AS total FROM T");
        assert_eq!(rendered(&r.parallel_items), vec!["SUM(flux) AS QS1_SUM"]);
        assert_eq!(r.merge_items, vec!["SUM(QS1_SUM) AS total"]);
    }

    #[test]
    fn merge_expr_map_covers_aggregates() {
        let r = rewrite("SELECT SUM(flux), AVG(flux) FROM T");
        assert_eq!(
            r.merge_exprs_by_source,
            vec![
                ("SUM(flux)".to_string(), "SUM(QS1_SUM)".to_string()),
                (
                    "AVG(flux)".to_string(),
                    "(SUM(QS3_SUM)/SUM(QS2_COUNT))".to_string()
                ),
            ]
        );
    }

    #[test]
    fn plain_items_pass_through() {
        let r = rewrite("SELECT ra, decl FROM T");
        assert!(!r.has_aggregate);
        assert_eq!(rendered(&r.parallel_items), vec!["ra", "decl"]);
        assert_eq!(r.merge_items, vec!["ra", "decl"]);
    }

    #[test]
    fn nested_aggregate_is_unsupported() {
        let stmt = parse_select("SELECT SUM(flux) + 1 FROM T").unwrap();
        let err = rewrite_select_list(&select_of(&stmt).unwrap().projection).unwrap_err();
        assert!(matches!(err, SmqError::Unsupported(_)));
    }

    #[test]
    fn distinct_aggregate_is_unsupported() {
        let stmt = parse_select("SELECT COUNT(DISTINCT objectId) FROM T").unwrap();
        let err = rewrite_select_list(&select_of(&stmt).unwrap().projection).unwrap_err();
        assert!(matches!(err, SmqError::Unsupported(_)));
    }

    #[test]
    fn column_names_containing_agg_substrings_are_fine() {
        let r = rewrite("SELECT checksum_id FROM T");
        assert!(!r.has_aggregate);
        assert_eq!(r.merge_items, vec!["checksum_id"]);
    }
}
