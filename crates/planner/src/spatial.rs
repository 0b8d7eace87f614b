//! Spatial restrictor hints and WHERE-clause predicate injection.
//!
//! Hints arrive as semicolon-separated tuples
//! (`box,ra,decl,w,h;circle,ra,decl,r;...`) alongside the query. Each tuple
//! becomes a spherical-geometry UDF predicate bound to the chosen spatial
//! table's partitioning columns, ANDed into the WHERE clause of the parallel
//! statement. The structured restrictors also feed chunk-coverage
//! computation upstream.

use serde::{Deserialize, Serialize};
use smq_common::{Result, SmqError};
use sqlparser::ast::{BinaryOperator, Expr, Select};

use crate::frontend::parse_expr;
use crate::table_namer::ResolvedTable;

/// Restrictor shapes understood by the planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestrictorKind {
    /// `box,lonMin,latMin,lonMax,latMax`
    Box,
    /// `circle,lon,lat,radius`
    Circle,
    /// `ellipse,lon,lat,semiMajor,semiMinor,angle`
    Ellipse,
    /// `poly,lon1,lat1,lon2,lat2,...` (at least three vertices)
    Poly,
}

impl RestrictorKind {
    fn udf(&self) -> &'static str {
        match self {
            RestrictorKind::Box => "sph_pt_in_box",
            RestrictorKind::Circle => "sph_pt_in_circle",
            RestrictorKind::Ellipse => "sph_pt_in_ellipse",
            RestrictorKind::Poly => "sph_pt_in_poly",
        }
    }

    fn check_arity(&self, n: usize) -> bool {
        match self {
            RestrictorKind::Box => n == 4,
            RestrictorKind::Circle => n == 3,
            RestrictorKind::Ellipse => n == 5,
            RestrictorKind::Poly => n >= 6 && n % 2 == 0,
        }
    }
}

/// One parsed spatial restrictor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restrictor {
    pub kind: RestrictorKind,
    /// Literal arguments, kept as text so large integers survive untouched.
    pub args: Vec<String>,
}

impl Restrictor {
    /// Render the WHERE-clause predicate bound to the given partitioning
    /// columns (already qualified by the caller where needed).
    pub fn predicate_sql(&self, lon: &str, lat: &str) -> String {
        format!(
            "{}({lon}, {lat}, {}) = 1",
            self.kind.udf(),
            self.args.join(", ")
        )
    }
}

/// Parse the `query.hints` option value into structured restrictors.
///
/// Empty tuples are skipped; a malformed tuple is an `Analysis` error.
pub fn parse_hints(hints: &str) -> Result<Vec<Restrictor>> {
    let mut out = Vec::new();
    for tuple in hints.split(';') {
        let parts: Vec<&str> = tuple
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if parts.is_empty() {
            continue;
        }
        let kind = match parts[0].to_lowercase().as_str() {
            "box" => RestrictorKind::Box,
            "circle" => RestrictorKind::Circle,
            "ellipse" => RestrictorKind::Ellipse,
            "poly" => RestrictorKind::Poly,
            other => {
                return Err(SmqError::Analysis(format!(
                    "unknown spatial restrictor kind: {other}"
                )))
            }
        };
        let args: Vec<String> = parts[1..].iter().map(|s| s.to_string()).collect();
        if !kind.check_arity(args.len()) {
            return Err(SmqError::Analysis(format!(
                "badly formed restrictor spec: {tuple}"
            )));
        }
        out.push(Restrictor { kind, args });
    }
    Ok(out)
}

/// AND the restrictor predicates into `select`'s WHERE clause, binding to
/// the spatial table's partitioning columns (qualified by its alias when it
/// has one).
pub fn inject(select: &mut Select, restrictors: &[Restrictor], spatial: &ResolvedTable) -> Result<()> {
    if restrictors.is_empty() {
        return Ok(());
    }
    let partition = spatial.partition.as_ref().ok_or_else(|| {
        SmqError::Internal(format!(
            "spatial table {}.{} has no partitioning columns",
            spatial.db, spatial.table
        ))
    })?;
    let (lon, lat) = match &spatial.alias {
        Some(alias) => (
            format!("{alias}.{}", partition.lon),
            format!("{alias}.{}", partition.lat),
        ),
        None => (partition.lon.clone(), partition.lat.clone()),
    };

    let mut predicate: Option<Expr> = None;
    for restrictor in restrictors {
        let expr = parse_expr(&restrictor.predicate_sql(&lon, &lat))?;
        predicate = Some(match predicate {
            None => expr,
            Some(prev) => Expr::BinaryOp {
                left: Box::new(prev),
                op: BinaryOperator::And,
                right: Box::new(expr),
            },
        });
    }
    let predicate = match predicate {
        Some(p) => p,
        None => return Ok(()),
    };
    select.selection = Some(match select.selection.take() {
        Some(existing) => Expr::BinaryOp {
            left: Box::new(predicate),
            op: BinaryOperator::And,
            right: Box::new(Expr::Nested(Box::new(existing))),
        },
        None => predicate,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{parse_select, select_of_mut};
    use crate::table_namer::TableClass;
    use smq_catalog::PartitionCols;

    fn spatial_ref(alias: Option<&str>) -> ResolvedTable {
        ResolvedTable {
            db: "LSST".to_string(),
            table: "Object".to_string(),
            alias: alias.map(str::to_string),
            qualified: true,
            class: TableClass::Chunked,
            partition: Some(PartitionCols {
                lon: "ra".to_string(),
                lat: "decl".to_string(),
                key: "objectId".to_string(),
            }),
        }
    }

    #[test]
    fn parses_multiple_tuples() {
        let r = parse_hints("box,0,0,5,1;circle,1,1,1").unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r[0].kind, RestrictorKind::Box);
        assert_eq!(r[0].args, vec!["0", "0", "5", "1"]);
        assert_eq!(r[1].kind, RestrictorKind::Circle);
    }

    #[test]
    fn arity_is_checked() {
        assert!(parse_hints("box,0,0,5").is_err());
        assert!(parse_hints("orbit,1,2").is_err());
        assert!(parse_hints("; ;").unwrap().is_empty());
    }

    #[test]
    fn injects_into_existing_where() {
        let mut stmt =
            parse_select("SELECT ra FROM LSST.Object WHERE flux > 20 OR flux < 1").unwrap();
        let restrictors = parse_hints("box,0,0,5,1").unwrap();
        inject(select_of_mut(&mut stmt).unwrap(), &restrictors, &spatial_ref(None)).unwrap();
        let sql = stmt.to_string();
        assert!(
            sql.contains("WHERE sph_pt_in_box(ra, decl, 0, 0, 5, 1) = 1 AND (flux > 20 OR flux < 1)"),
            "got: {sql}"
        );
    }

    #[test]
    fn alias_qualifies_partition_columns() {
        let mut stmt = parse_select("SELECT o.ra FROM LSST.Object o").unwrap();
        let restrictors = parse_hints("circle,1,1,0.5").unwrap();
        inject(
            select_of_mut(&mut stmt).unwrap(),
            &restrictors,
            &spatial_ref(Some("o")),
        )
        .unwrap();
        assert!(stmt
            .to_string()
            .contains("WHERE sph_pt_in_circle(o.ra, o.decl, 1, 1, 0.5) = 1"));
    }
}
