//! Structural features from a best-effort SQL parse.
//!
//! Parsing never fails the pipeline: on malformed or vendor-specific syntax
//! every structural feature keeps its zero default and `parse_failed` is set,
//! which downstream rules must treat as "feature absent", not zero.

use core::ops::ControlFlow;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    Expr, GroupByExpr, ObjectName, Query, SetExpr, SetOperator, Visit, Visitor,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use super::lexical;

/// Table reference after a relation keyword, for statements whose targets
/// the AST walk does not surface (DDL mostly).
static TABLE_AFTER_KEYWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:FROM|INTO|JOIN|UPDATE|TABLE|TRUNCATE(?:\s+TABLE)?)\s+`?([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)?)`?",
    )
    .unwrap()
});

/// Keywords a sloppy regex capture could mistake for a table name.
const NOT_A_TABLE: &[&str] = &["select", "set", "where", "values", "table", "if", "exists"];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuralFeatures {
    pub parse_failed: bool,
    pub num_tables: u32,
    pub num_joins: u32,
    pub num_where_conditions: u32,
    pub num_group_by_cols: u32,
    pub num_order_by_cols: u32,
    pub has_limit: bool,
    pub has_order_by: bool,
    pub has_subquery: bool,
    pub subquery_depth: u32,
    pub has_union: bool,
    pub has_where: bool,
    pub is_write_query: bool,
    pub is_ddl_query: bool,
    pub accessed_tables: Vec<String>,
}

struct Collector {
    tables: Vec<String>,
    num_joins: u32,
    num_where_conditions: u32,
    num_group_by_cols: u32,
    num_order_by_cols: u32,
    has_limit: bool,
    has_order_by: bool,
    has_union: bool,
    has_where: bool,
    depth: u32,
    max_depth: u32,
}

impl Collector {
    fn new() -> Self {
        Self {
            tables: Vec::new(),
            num_joins: 0,
            num_where_conditions: 0,
            num_group_by_cols: 0,
            num_order_by_cols: 0,
            has_limit: false,
            has_order_by: false,
            has_union: false,
            has_where: false,
            depth: 0,
            max_depth: 0,
        }
    }

    fn visit_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                for table_with_joins in &select.from {
                    self.num_joins += table_with_joins.joins.len() as u32;
                }
                if let Some(selection) = &select.selection {
                    self.has_where = true;
                    self.num_where_conditions += count_conditions(selection);
                }
                if let GroupByExpr::Expressions(exprs, _) = &select.group_by {
                    self.num_group_by_cols += exprs.len() as u32;
                }
            },
            SetExpr::SetOperation { op, left, right, .. } => {
                if *op == SetOperator::Union {
                    self.has_union = true;
                }
                self.visit_set_expr(left);
                self.visit_set_expr(right);
            },
            _ => {},
        }
    }
}

impl Visitor for Collector {
    type Break = ();

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        let name = relation.to_string().replace('`', "").to_lowercase();
        if !name.is_empty() && !self.tables.contains(&name) {
            self.tables.push(name);
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        self.depth += 1;
        self.max_depth = self.max_depth.max(self.depth);

        self.visit_set_expr(&query.body);
        if let Some(order_by) = &query.order_by {
            self.has_order_by = true;
            self.num_order_by_cols += order_by_len(order_by) as u32;
        }
        if query.limit_clause.is_some() {
            self.has_limit = true;
        }
        ControlFlow::Continue(())
    }

    fn post_visit_query(&mut self, _query: &Query) -> ControlFlow<Self::Break> {
        self.depth = self.depth.saturating_sub(1);
        ControlFlow::Continue(())
    }
}

fn order_by_len(order_by: &sqlparser::ast::OrderBy) -> usize {
    match &order_by.kind {
        sqlparser::ast::OrderByKind::Expressions(exprs) => exprs.len(),
        _ => 0,
    }
}

/// Count WHERE predicates the way an analyst reads them: conjunctions split,
/// everything else counts as one condition.
fn count_conditions(expr: &Expr) -> u32 {
    match expr {
        Expr::BinaryOp { left, op, right } if *op == sqlparser::ast::BinaryOperator::And => {
            count_conditions(left) + count_conditions(right)
        },
        Expr::Nested(inner) => count_conditions(inner),
        _ => 1,
    }
}

/// Analyze one statement. Write/DDL classification is lexical so it survives
/// parse failures, matching how the rest of the pipeline treats these flags.
pub fn analyze(sql: &str) -> StructuralFeatures {
    let sql_lower = sql.to_lowercase();
    let mut features = StructuralFeatures {
        is_write_query: lexical::is_write_prefix(&sql_lower),
        is_ddl_query: lexical::is_ddl_prefix(&sql_lower),
        ..Default::default()
    };

    let statements = match Parser::parse_sql(&MySqlDialect {}, sql) {
        Ok(statements) => statements,
        Err(e) => {
            tracing::debug!("SQL parse failed, structural features degraded: {}", e);
            features.parse_failed = true;
            return features;
        },
    };

    let mut collector = Collector::new();
    for statement in &statements {
        let _: ControlFlow<()> = statement.visit(&mut collector);
    }
    if collector.tables.is_empty() {
        for capture in TABLE_AFTER_KEYWORD.captures_iter(sql) {
            if let Some(name) = capture.get(1) {
                let name = name.as_str().to_lowercase();
                if !NOT_A_TABLE.contains(&name.as_str()) && !collector.tables.contains(&name) {
                    collector.tables.push(name);
                }
            }
        }
    }

    features.num_tables = collector.tables.len() as u32;
    features.num_joins = collector.num_joins;
    features.num_where_conditions = collector.num_where_conditions;
    features.num_group_by_cols = collector.num_group_by_cols;
    features.num_order_by_cols = collector.num_order_by_cols;
    features.has_limit = collector.has_limit;
    features.has_order_by = collector.has_order_by;
    features.has_union = collector.has_union;
    features.has_where = collector.has_where;
    features.has_subquery = collector.max_depth > 1;
    features.subquery_depth = collector.max_depth.saturating_sub(1);
    features.accessed_tables = collector.tables;
    features
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_select() {
        let f = analyze("SELECT id, name FROM customers WHERE id = 1 AND name = 'x' ORDER BY id LIMIT 5");
        assert!(!f.parse_failed);
        assert_eq!(f.accessed_tables, vec!["customers"]);
        assert_eq!(f.num_tables, 1);
        assert_eq!(f.num_where_conditions, 2);
        assert!(f.has_where);
        assert!(f.has_limit);
        assert!(f.has_order_by);
        assert_eq!(f.num_order_by_cols, 1);
        assert!(!f.has_subquery);
        assert!(!f.is_write_query);
    }

    #[test]
    fn join_counts_tables_and_joins() {
        let f = analyze(
            "SELECT * FROM orders o JOIN customers c ON o.customer_id = c.id \
             LEFT JOIN payments p ON p.order_id = o.id",
        );
        assert_eq!(f.num_joins, 2);
        assert_eq!(f.num_tables, 3);
        assert!(f.accessed_tables.contains(&"customers".to_string()));
    }

    #[test]
    fn qualified_names_are_kept() {
        let f = analyze("SELECT * FROM hr.salaries");
        assert_eq!(f.accessed_tables, vec!["hr.salaries"]);
    }

    #[test]
    fn subquery_depth() {
        let f = analyze("SELECT * FROM t WHERE id IN (SELECT id FROM u WHERE x > 1)");
        assert!(f.has_subquery);
        assert_eq!(f.subquery_depth, 1);

        let f = analyze(
            "SELECT * FROM t WHERE id IN (SELECT id FROM u WHERE y IN (SELECT y FROM v))",
        );
        assert_eq!(f.subquery_depth, 2);
    }

    #[test]
    fn union_and_group_by() {
        let f = analyze("SELECT a FROM t GROUP BY a, b UNION SELECT a FROM u");
        assert!(f.has_union);
        assert_eq!(f.num_group_by_cols, 2);
        assert_eq!(f.num_tables, 2);
    }

    #[test]
    fn malformed_sql_degrades_without_raising() {
        let f = analyze("SELEC * FRM customerz WHER");
        assert!(f.parse_failed);
        assert_eq!(f.num_tables, 0);
        assert!(f.accessed_tables.is_empty());
    }

    #[test]
    fn write_and_ddl_survive_parse_failure() {
        let f = analyze("DELETE FROM orders WHERE created_at < '2020-01-01'");
        assert!(f.is_write_query);
        assert!(!f.is_ddl_query);

        // vendor-specific noise the parser may reject
        let f = analyze("DROP TABLE orders /*!40000 NONSENSE */ CASCADE CASCADE CASCADE");
        assert!(f.is_ddl_query);
    }

    #[test]
    fn ddl_targets_are_extracted() {
        let f = analyze("DROP TABLE scratch.tmp_load");
        assert!(f.is_ddl_query);
        assert_eq!(f.accessed_tables, vec!["scratch.tmp_load"]);

        let f = analyze("TRUNCATE TABLE orders");
        assert_eq!(f.accessed_tables, vec!["orders"]);
    }

    #[test]
    fn duplicate_tables_are_deduplicated_in_order() {
        let f = analyze("SELECT * FROM a JOIN b ON a.id = b.id JOIN a a2 ON a2.id = b.id");
        assert_eq!(f.accessed_tables, vec!["a", "b"]);
    }
}
