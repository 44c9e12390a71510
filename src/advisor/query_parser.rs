//! Column-usage extraction for the index advisor.
//!
//! Parses one SQL statement and reports, per referenced table, which
//! columns appear in equality predicates, range predicates, join keys,
//! and ORDER BY. Alias resolution is best-effort: unqualified columns are
//! only attributed when a single table is in scope.

use sqlparser::ast::{
    BinaryOperator, Expr, Join, JoinConstraint, JoinOperator, OrderByExpr, Query, Select,
    SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::{Parser, ParserError};
use std::collections::HashMap;

use crate::models::TableRef;

#[derive(Debug, Clone, Default)]
pub struct TableUsage {
    pub equalities: Vec<String>,
    pub ranges: Vec<String>,
    pub joins: Vec<String>,
    pub orders: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryUsage {
    pub tables: Vec<TableRef>,
    pub by_table: HashMap<String, TableUsage>,
}

#[derive(Debug)]
struct PendingColumn {
    relation: Option<String>,
    name: String,
    kind: ColumnKind,
}

#[derive(Debug, Clone, Copy)]
enum ColumnKind {
    Equality,
    Range,
    Join,
    Order,
}

pub fn parse_column_usage(query: &str) -> Result<QueryUsage, ParserError> {
    let dialect = PostgreSqlDialect {};
    let mut statements = Parser::parse_sql(&dialect, query)?;

    let statement = statements
        .pop()
        .ok_or_else(|| ParserError::ParserError("empty query".into()))?;

    let mut collector = UsageCollector::default();
    match statement {
        Statement::Query(query) => collector.collect_query(&query),
        _ => {
            return Err(ParserError::ParserError(
                "only plain queries are analyzed".into(),
            ))
        }
    }

    Ok(collector.into_usage())
}

#[derive(Default)]
struct UsageCollector {
    tables: Vec<TableRef>,
    alias_map: HashMap<String, String>,
    pending: Vec<PendingColumn>,
}

impl UsageCollector {
    fn collect_query(&mut self, query: &Query) {
        self.collect_set_expr(&query.body);

        for order in &query.order_by {
            self.collect_order_by(order);
        }
    }

    fn collect_set_expr(&mut self, set_expr: &SetExpr) {
        match set_expr {
            SetExpr::Select(select) => self.collect_select(select),
            SetExpr::Query(query) => self.collect_query(query.as_ref()),
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_set_expr(left.as_ref());
                self.collect_set_expr(right.as_ref());
            }
            _ => {}
        }
    }

    fn collect_select(&mut self, select: &Select) {
        for table in &select.from {
            self.collect_table_with_joins(table);
        }

        if let Some(selection) = &select.selection {
            self.collect_filter_expr(selection);
        }

        for item in &select.projection {
            if let SelectItem::UnnamedExpr(Expr::Nested(expr)) = item {
                self.collect_filter_expr(expr);
            }
        }
    }

    fn collect_table_with_joins(&mut self, table: &TableWithJoins) {
        let mut left_tables = Vec::new();
        if let Some(table_name) = self.collect_table_factor(&table.relation) {
            left_tables.push(table_name);
        }

        for join in &table.joins {
            if let Some(table_name) = self.collect_join(join, &left_tables) {
                left_tables.push(table_name);
            }
        }
    }

    fn collect_table_factor(&mut self, table_factor: &TableFactor) -> Option<String> {
        match table_factor {
            TableFactor::Table { name, alias, .. } => {
                let (schema, table) = split_object_name(name);
                let table_ref = TableRef::new(schema.clone(), table.clone());
                let full_name = table_ref.full_name();
                self.tables.push(table_ref);
                self.alias_map.insert(table.clone(), full_name.clone());
                if let Some(schema_name) = schema {
                    self.alias_map
                        .insert(format!("{schema_name}.{table}"), full_name.clone());
                }
                if let Some(alias) = alias {
                    self.alias_map
                        .insert(alias.name.value.clone(), full_name.clone());
                }
                Some(full_name)
            }
            TableFactor::Derived { subquery, .. } => {
                self.collect_query(subquery.as_ref());
                None
            }
            TableFactor::NestedJoin {
                table_with_joins, ..
            } => {
                self.collect_table_with_joins(table_with_joins.as_ref());
                None
            }
            _ => None,
        }
    }

    fn collect_join(&mut self, join: &Join, left_tables: &[String]) -> Option<String> {
        let right_table = self.collect_table_factor(&join.relation);

        match &join.join_operator {
            JoinOperator::Inner(constraint)
            | JoinOperator::LeftOuter(constraint)
            | JoinOperator::RightOuter(constraint)
            | JoinOperator::FullOuter(constraint) => match constraint {
                JoinConstraint::On(expr) => self.collect_join_expr(expr),
                JoinConstraint::Using(columns) => {
                    for column in columns {
                        for table in left_tables {
                            self.pending.push(PendingColumn {
                                relation: Some(table.clone()),
                                name: column.value.clone(),
                                kind: ColumnKind::Join,
                            });
                        }
                        if let Some(table) = &right_table {
                            self.pending.push(PendingColumn {
                                relation: Some(table.clone()),
                                name: column.value.clone(),
                                kind: ColumnKind::Join,
                            });
                        }
                    }
                }
                _ => {}
            },
            _ => {}
        }

        right_table
    }

    fn collect_filter_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOperator::And | BinaryOperator::Or => {
                    self.collect_filter_expr(left);
                    self.collect_filter_expr(right);
                }
                BinaryOperator::Eq => {
                    self.push_column(left, ColumnKind::Equality);
                    self.push_column(right, ColumnKind::Equality);
                }
                BinaryOperator::Lt
                | BinaryOperator::LtEq
                | BinaryOperator::Gt
                | BinaryOperator::GtEq => {
                    self.push_column(left, ColumnKind::Range);
                    self.push_column(right, ColumnKind::Range);
                }
                _ => {}
            },
            Expr::InList { expr, .. } => self.push_column(expr, ColumnKind::Equality),
            Expr::Between { expr, .. } => self.push_column(expr, ColumnKind::Range),
            Expr::IsNull(expr) | Expr::IsNotNull(expr) => {
                self.push_column(expr, ColumnKind::Equality)
            }
            Expr::Nested(expr) => self.collect_filter_expr(expr),
            _ => {}
        }
    }

    fn collect_join_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOperator::And | BinaryOperator::Or => {
                    self.collect_join_expr(left);
                    self.collect_join_expr(right);
                }
                BinaryOperator::Eq => {
                    self.push_column(left, ColumnKind::Join);
                    self.push_column(right, ColumnKind::Join);
                }
                _ => {}
            },
            Expr::Nested(expr) => self.collect_join_expr(expr),
            _ => {}
        }
    }

    fn collect_order_by(&mut self, order: &OrderByExpr) {
        self.push_column(&order.expr, ColumnKind::Order);
    }

    fn push_column(&mut self, expr: &Expr, kind: ColumnKind) {
        if let Some(column) = column_ref_from_expr(expr) {
            self.pending.push(PendingColumn {
                relation: column.relation,
                name: column.name,
                kind,
            });
        }
    }

    fn into_usage(self) -> QueryUsage {
        let mut usage = QueryUsage {
            tables: self.tables.clone(),
            ..Default::default()
        };

        let default_table = if self.tables.len() == 1 {
            Some(self.tables[0].full_name())
        } else {
            None
        };

        for pending in self.pending {
            let table =
                resolve_table_name(pending.relation.as_deref(), &self.alias_map, &default_table);
            let Some(table_name) = table else { continue };
            let entry = usage.by_table.entry(table_name).or_default();
            match pending.kind {
                ColumnKind::Equality => push_unique(&mut entry.equalities, &pending.name),
                ColumnKind::Range => push_unique(&mut entry.ranges, &pending.name),
                ColumnKind::Join => push_unique(&mut entry.joins, &pending.name),
                ColumnKind::Order => push_unique(&mut entry.orders, &pending.name),
            }
        }

        usage
    }
}

#[derive(Debug)]
struct ColumnRef {
    relation: Option<String>,
    name: String,
}

fn column_ref_from_expr(expr: &Expr) -> Option<ColumnRef> {
    match expr {
        Expr::Identifier(ident) => Some(ColumnRef {
            relation: None,
            name: ident.value.clone(),
        }),
        Expr::CompoundIdentifier(idents) => {
            if idents.len() == 2 {
                Some(ColumnRef {
                    relation: Some(idents[0].value.clone()),
                    name: idents[1].value.clone(),
                })
            } else if idents.len() >= 3 {
                let schema = idents[idents.len() - 3].value.clone();
                let table = idents[idents.len() - 2].value.clone();
                Some(ColumnRef {
                    relation: Some(format!("{schema}.{table}")),
                    name: idents[idents.len() - 1].value.clone(),
                })
            } else {
                None
            }
        }
        _ => None,
    }
}

fn resolve_table_name(
    relation: Option<&str>,
    alias_map: &HashMap<String, String>,
    default_table: &Option<String>,
) -> Option<String> {
    match relation {
        Some(rel) => alias_map.get(rel).cloned(),
        None => default_table.clone(),
    }
}

fn split_object_name(name: &sqlparser::ast::ObjectName) -> (Option<String>, String) {
    let parts: Vec<String> = name.0.iter().map(|ident| ident.value.clone()).collect();
    match parts.len() {
        1 => (None, parts[0].clone()),
        2 => (Some(parts[0].clone()), parts[1].clone()),
        _ => {
            let schema = parts[parts.len() - 2].clone();
            let table = parts[parts.len() - 1].clone();
            (Some(schema), table)
        }
    }
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if !values
        .iter()
        .any(|existing| existing.eq_ignore_ascii_case(value))
    {
        values.push(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separates_equality_and_range_predicates() {
        let query =
            "SELECT * FROM orders WHERE customer_id = $1 AND created_at > $2 ORDER BY total";
        let usage = parse_column_usage(query).expect("parse");
        let table = usage.tables[0].full_name();
        let table_usage = usage.by_table.get(&table).expect("table usage");
        assert_eq!(table_usage.equalities, vec!["customer_id"]);
        assert_eq!(table_usage.ranges, vec!["created_at"]);
        assert_eq!(table_usage.orders, vec!["total"]);
    }

    #[test]
    fn between_counts_as_a_range_predicate() {
        let query = "SELECT * FROM events WHERE ts BETWEEN $1 AND $2";
        let usage = parse_column_usage(query).expect("parse");
        let table_usage = usage.by_table.get("public.events").expect("usage");
        assert_eq!(table_usage.ranges, vec!["ts"]);
    }

    #[test]
    fn extracts_join_columns_through_aliases() {
        let query =
            "SELECT * FROM orders o JOIN customers c ON o.customer_id = c.id WHERE o.status = 'open'";
        let usage = parse_column_usage(query).expect("parse");
        assert_eq!(usage.tables.len(), 2);
        let orders = usage.by_table.get("public.orders").expect("orders");
        assert_eq!(orders.joins, vec!["customer_id"]);
        assert_eq!(orders.equalities, vec!["status"]);
        let customers = usage.by_table.get("public.customers").expect("customers");
        assert_eq!(customers.joins, vec!["id"]);
    }

    #[test]
    fn skips_unqualified_columns_when_ambiguous() {
        let query =
            "SELECT * FROM orders o JOIN customers c ON o.customer_id = c.id WHERE status = 'open'";
        let usage = parse_column_usage(query).expect("parse");
        let orders = usage.by_table.get("public.orders").expect("orders");
        assert!(orders.equalities.is_empty());
    }

    #[test]
    fn using_joins_attribute_both_sides() {
        let query = "SELECT * FROM orders JOIN customers USING (customer_id)";
        let usage = parse_column_usage(query).expect("parse");
        assert!(usage.by_table["public.orders"]
            .joins
            .contains(&"customer_id".to_string()));
        assert!(usage.by_table["public.customers"]
            .joins
            .contains(&"customer_id".to_string()));
    }

    #[test]
    fn rejects_non_query_statements() {
        assert!(parse_column_usage("DELETE FROM t").is_err());
    }
}
