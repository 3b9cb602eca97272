//! SQL text generation for both dialects.
//!
//! Statements are built with `?` placeholders; PostgreSQL output is then
//! renumbered to `$1, $2, ...`.

use super::{Aggregate, Dialect, Filter, OrderBy, OrderExpr, Row, StoreQuery};
use crate::query::WhereOperator;
use serde_json::Value;

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Compiled {
    fn finish(sql: String, params: Vec<Value>, dialect: Dialect) -> Self {
        let sql = match dialect {
            Dialect::Sqlite => sql,
            Dialect::Postgres => number_placeholders(&sql),
        };
        Compiled { sql, params }
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn compile_select(dialect: Dialect, query: &StoreQuery) -> Compiled {
    let mut params = Vec::new();
    let columns = if query.columns.is_empty() {
        "*".to_string()
    } else {
        query
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut sql = format!("SELECT {columns} FROM {}", quote_ident(&query.table));
    push_where(&mut sql, dialect, query.filter.as_ref(), &mut params);

    if !query.group.is_empty() {
        let group = query.group.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
        sql.push_str(&format!(" GROUP BY {group}"));
    }

    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|o| compile_order(dialect, o, &mut params))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" ORDER BY {order}"));
    }

    match (query.limit, query.offset) {
        (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
        (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
        // SQLite needs a LIMIT before OFFSET
        (None, Some(offset)) if dialect == Dialect::Sqlite => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
        (None, Some(offset)) => sql.push_str(&format!(" OFFSET {offset}")),
        (None, None) => {}
    }

    Compiled::finish(sql, params, dialect)
}

pub fn compile_insert(dialect: Dialect, table: &str, values: &Row) -> Compiled {
    if values.is_empty() {
        return Compiled::finish(format!("INSERT INTO {} DEFAULT VALUES", quote_ident(table)), Vec::new(), dialect);
    }
    let columns = values.keys().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    let placeholders = vec!["?"; values.len()].join(", ");
    let sql = format!("INSERT INTO {} ({columns}) VALUES ({placeholders})", quote_ident(table));
    Compiled::finish(sql, values.values().cloned().collect(), dialect)
}

pub fn compile_update(dialect: Dialect, table: &str, values: &Row, filter: Option<&Filter>) -> Compiled {
    let mut params: Vec<Value> = values.values().cloned().collect();
    let assignments = values
        .keys()
        .map(|c| format!("{} = ?", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("UPDATE {} SET {assignments}", quote_ident(table));
    push_where(&mut sql, dialect, filter, &mut params);
    Compiled::finish(sql, params, dialect)
}

pub fn compile_delete(dialect: Dialect, table: &str, filter: Option<&Filter>) -> Compiled {
    let mut params = Vec::new();
    let mut sql = format!("DELETE FROM {}", quote_ident(table));
    push_where(&mut sql, dialect, filter, &mut params);
    Compiled::finish(sql, params, dialect)
}

pub fn compile_count(dialect: Dialect, table: &str, filter: Option<&Filter>) -> Compiled {
    let mut params = Vec::new();
    let mut sql = format!("SELECT COUNT(*) AS \"count\" FROM {}", quote_ident(table));
    push_where(&mut sql, dialect, filter, &mut params);
    Compiled::finish(sql, params, dialect)
}

pub fn compile_aggregate(
    dialect: Dialect,
    table: &str,
    function: Aggregate,
    column: &str,
    filter: Option<&Filter>,
) -> Compiled {
    let mut params = Vec::new();
    let mut sql = format!(
        "SELECT {}({}) AS \"value\" FROM {}",
        function.sql_function(),
        quote_ident(column),
        quote_ident(table)
    );
    push_where(&mut sql, dialect, filter, &mut params);
    Compiled::finish(sql, params, dialect)
}

// ── Filters ────────────────────────────────────────────────────────

fn push_where(sql: &mut String, dialect: Dialect, filter: Option<&Filter>, params: &mut Vec<Value>) {
    if let Some(filter) = filter {
        let condition = compile_filter(dialect, filter, params);
        sql.push_str(" WHERE ");
        sql.push_str(&condition);
    }
}

pub fn compile_filter(dialect: Dialect, filter: &Filter, params: &mut Vec<Value>) -> String {
    match filter {
        Filter::And(filters) => join_filters(dialect, filters, " AND ", "1 = 1", params),
        Filter::Or(filters) => join_filters(dialect, filters, " OR ", "1 = 0", params),
        Filter::Contains { column, needle } => {
            params.push(Value::String(needle.clone()));
            format!("{} > 0", position(dialect, column))
        }
        Filter::Condition { column, operator, value } => compile_condition(dialect, column, *operator, value, params),
    }
}

fn join_filters(dialect: Dialect, filters: &[Filter], separator: &str, empty: &str, params: &mut Vec<Value>) -> String {
    if filters.is_empty() {
        return empty.to_string();
    }
    let parts: Vec<String> = filters
        .iter()
        .map(|f| compile_filter(dialect, f, params))
        .collect();
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", parts.join(separator))
    }
}

fn compile_condition(dialect: Dialect, column: &str, operator: WhereOperator, value: &Value, params: &mut Vec<Value>) -> String {
    let col = quote_ident(column);
    match operator {
        WhereOperator::Eq if value.is_null() => format!("{col} IS NULL"),
        WhereOperator::Ne if value.is_null() => format!("{col} IS NOT NULL"),
        WhereOperator::Eq => binary(&col, "=", value, params),
        WhereOperator::Ne => {
            params.push(value.clone());
            format!("({col} != ? OR {col} IS NULL)")
        }
        WhereOperator::Gt => binary(&col, ">", value, params),
        WhereOperator::Gte => binary(&col, ">=", value, params),
        WhereOperator::Lt => binary(&col, "<", value, params),
        WhereOperator::Lte => binary(&col, "<=", value, params),
        WhereOperator::Between | WhereOperator::NotBetween => {
            let bounds = value.as_array().cloned().unwrap_or_default();
            params.push(bounds.first().cloned().unwrap_or(Value::Null));
            params.push(bounds.get(1).cloned().unwrap_or(Value::Null));
            let not = if operator == WhereOperator::NotBetween { "NOT " } else { "" };
            format!("{col} {not}BETWEEN ? AND ?")
        }
        WhereOperator::In | WhereOperator::NotIn => {
            let items = value.as_array().cloned().unwrap_or_default();
            let negated = operator == WhereOperator::NotIn;
            if items.is_empty() {
                return if negated { "1 = 1".into() } else { "1 = 0".into() };
            }
            let placeholders = vec!["?"; items.len()].join(", ");
            params.extend(items);
            if negated {
                format!("{col} NOT IN ({placeholders})")
            } else {
                format!("{col} IN ({placeholders})")
            }
        }
        WhereOperator::Like => binary(&col, "LIKE", value, params),
        WhereOperator::NotLike => binary(&col, "NOT LIKE", value, params),
        WhereOperator::ILike | WhereOperator::NotILike => {
            params.push(value.clone());
            let not = if operator == WhereOperator::NotILike { "NOT " } else { "" };
            match dialect {
                Dialect::Sqlite => format!("LOWER({col}) {not}LIKE LOWER(?)"),
                Dialect::Postgres => format!("{col} {not}ILIKE ?"),
            }
        }
    }
}

fn binary(col: &str, op: &str, value: &Value, params: &mut Vec<Value>) -> String {
    params.push(value.clone());
    format!("{col} {op} ?")
}

/// 1-based position of a `?` needle inside a column, 0 when absent.
fn position(dialect: Dialect, column: &str) -> String {
    match dialect {
        Dialect::Sqlite => format!("INSTR({}, ?)", quote_ident(column)),
        Dialect::Postgres => format!("POSITION(? IN {})", quote_ident(column)),
    }
}

fn compile_order(dialect: Dialect, order: &OrderBy, params: &mut Vec<Value>) -> String {
    let direction = order.direction.as_str().to_uppercase();
    match &order.expr {
        OrderExpr::Column(column) => format!("{} {direction}", quote_ident(column)),
        OrderExpr::SearchRelevance { column, keywords } => {
            if keywords.is_empty() {
                return format!("{} {direction}", quote_ident(column));
            }
            let sum = keywords
                .iter()
                .map(|k| {
                    params.push(Value::String(k.clone()));
                    position(dialect, column)
                })
                .collect::<Vec<_>>()
                .join(" + ");
            format!("({sum}) {direction}")
        }
    }
}

/// Rewrite `?` placeholders outside of quoted strings as `$1, $2, ...`.
pub fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    let mut in_single = false;
    let mut in_double = false;
    for c in sql.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                out.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                out.push(c);
            }
            '?' if !in_single && !in_double => {
                n += 1;
                out.push_str(&format!("${n}"));
            }
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SortDirection;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn products_query() -> StoreQuery {
        StoreQuery {
            table: "products".into(),
            columns: vec!["id".into(), "name".into()],
            filter: Some(Filter::And(vec![
                Filter::Condition {
                    column: "price".into(),
                    operator: WhereOperator::Gt,
                    value: json!(100),
                },
                Filter::Contains {
                    column: "_search_default".into(),
                    needle: "mouse".into(),
                },
            ])),
            order: vec![OrderBy {
                expr: OrderExpr::SearchRelevance {
                    column: "_search_default".into(),
                    keywords: vec!["mouse".into()],
                },
                direction: SortDirection::Asc,
            }],
            group: Vec::new(),
            offset: Some(10),
            limit: Some(5),
        }
    }

    #[test]
    fn test_select_sqlite() {
        let compiled = compile_select(Dialect::Sqlite, &products_query());
        assert_eq!(
            compiled.sql,
            "SELECT \"id\", \"name\" FROM \"products\" WHERE (\"price\" > ? AND INSTR(\"_search_default\", ?) > 0) ORDER BY (INSTR(\"_search_default\", ?)) ASC LIMIT 5 OFFSET 10"
        );
        assert_eq!(compiled.params, vec![json!(100), json!("mouse"), json!("mouse")]);
    }

    #[test]
    fn test_select_postgres() {
        let compiled = compile_select(Dialect::Postgres, &products_query());
        assert_eq!(
            compiled.sql,
            "SELECT \"id\", \"name\" FROM \"products\" WHERE (\"price\" > $1 AND POSITION($2 IN \"_search_default\") > 0) ORDER BY (POSITION($3 IN \"_search_default\")) ASC LIMIT 5 OFFSET 10"
        );
    }

    #[test]
    fn test_null_and_empty_lists() {
        let mut params = Vec::new();
        let filter = Filter::Or(vec![
            Filter::eq("category", Value::Null),
            Filter::id_in(&[]),
            Filter::Condition {
                column: "tags".into(),
                operator: WhereOperator::NotIn,
                value: json!([]),
            },
        ]);
        assert_eq!(
            compile_filter(Dialect::Sqlite, &filter, &mut params),
            "(\"category\" IS NULL OR 1 = 0 OR 1 = 1)"
        );
        assert!(params.is_empty());
    }

    #[test]
    fn test_between_and_ilike() {
        let mut params = Vec::new();
        let filter = Filter::And(vec![
            Filter::Condition {
                column: "price".into(),
                operator: WhereOperator::NotBetween,
                value: json!([1, 5]),
            },
            Filter::Condition {
                column: "name".into(),
                operator: WhereOperator::ILike,
                value: json!("%mouse%"),
            },
        ]);
        assert_eq!(
            compile_filter(Dialect::Sqlite, &filter, &mut params),
            "(\"price\" NOT BETWEEN ? AND ? AND LOWER(\"name\") LIKE LOWER(?))"
        );
        assert_eq!(params, vec![json!(1), json!(5), json!("%mouse%")]);
    }

    #[test]
    fn test_placeholders_skip_quoted() {
        assert_eq!(
            number_placeholders("SELECT '?' FROM \"a?\" WHERE x = ? AND y = ?"),
            "SELECT '?' FROM \"a?\" WHERE x = $1 AND y = $2"
        );
    }

    #[test]
    fn test_update_and_delete() {
        let mut values = Row::new();
        values.insert("price".into(), json!(5));
        let compiled = compile_update(Dialect::Sqlite, "products", &values, Some(&Filter::id_in(&[1, 2])));
        assert_eq!(compiled.sql, "UPDATE \"products\" SET \"price\" = ? WHERE \"id\" IN (?, ?)");
        assert_eq!(compiled.params, vec![json!(5), json!(1), json!(2)]);

        let compiled = compile_delete(Dialect::Postgres, "products", None);
        assert_eq!(compiled.sql, "DELETE FROM \"products\"");
    }
}
