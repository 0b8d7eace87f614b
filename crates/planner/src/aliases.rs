//! Table and select-item aliases discovered during analysis.
//!
//! The inverse direction matters for merge synthesis: a merge statement
//! refers to result columns by the user's alias when one exists, not by the
//! rewritten expression.

use sqlparser::ast::{Select, SelectItem, TableFactor};

/// Alias maps for one analyzed statement.
#[derive(Debug, Default, Clone)]
pub struct AliasManager {
    table_aliases: Vec<(String, usize)>,
    select_aliases: Vec<(String, String)>,
}

impl AliasManager {
    /// Collect aliases from the FROM clause and the select list.
    ///
    /// Table aliases map to the lexical reference index (relation first,
    /// then joined relations, clause by clause), matching the order the
    /// table namer resolves references in.
    pub fn from_select(select: &Select) -> Self {
        let mut mgr = AliasManager::default();
        let mut index = 0usize;
        for twj in &select.from {
            mgr.record_table(&twj.relation, index);
            index += 1;
            for join in &twj.joins {
                mgr.record_table(&join.relation, index);
                index += 1;
            }
        }
        for item in &select.projection {
            if let SelectItem::ExprWithAlias { expr, alias } = item {
                mgr.select_aliases
                    .push((alias.value.clone(), expr.to_string()));
            }
        }
        mgr
    }

    fn record_table(&mut self, factor: &TableFactor, index: usize) {
        if let TableFactor::Table {
            alias: Some(alias), ..
        } = factor
        {
            self.table_aliases.push((alias.name.value.clone(), index));
        }
    }

    /// Reference index a table alias points at.
    pub fn table_ref_index(&self, alias: &str) -> Option<usize> {
        self.table_aliases
            .iter()
            .find(|(a, _)| a == alias)
            .map(|(_, i)| *i)
    }

    /// Alias declared for a rendered select expression, if any.
    pub fn alias_for_expr(&self, expr_text: &str) -> Option<&str> {
        self.select_aliases
            .iter()
            .find(|(_, e)| e == expr_text)
            .map(|(a, _)| a.as_str())
    }

    /// Rendered expression a select alias stands for, if any.
    pub fn expr_for_alias(&self, alias: &str) -> Option<&str> {
        self.select_aliases
            .iter()
            .find(|(a, _)| a == alias)
            .map(|(_, e)| e.as_str())
    }

    /// All table aliases in declaration order.
    pub fn table_aliases(&self) -> &[(String, usize)] {
        &self.table_aliases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{parse_select, select_of};

    #[test]
    fn collects_table_and_select_aliases() {
        let stmt = parse_select(
            "SELECT o1.ra AS r, o2.decl FROM Object AS o1, Object o2 WHERE o1.objectId = o2.objectId",
        )
        .unwrap();
        let mgr = AliasManager::from_select(select_of(&stmt).unwrap());
        assert_eq!(mgr.table_ref_index("o1"), Some(0));
        assert_eq!(mgr.table_ref_index("o2"), Some(1));
        assert_eq!(mgr.alias_for_expr("o1.ra"), Some("r"));
        assert_eq!(mgr.expr_for_alias("r"), Some("o1.ra"));
        assert_eq!(mgr.table_ref_index("o3"), None);
    }
}
