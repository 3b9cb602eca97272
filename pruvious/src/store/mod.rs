//! The record store contract and its SQL implementations.
//!
//! The engine talks to storage only through [`RecordStore`]. Column names are
//! snake_case and values are already in their storage form; translating
//! field names and casting values is the query layer's job.

pub mod sql;
pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::{PruviousError, Result};
use crate::query::WhereOperator;
use crate::schema::SortDirection;
use serde_json::{Map, Value};
use sqlparser::ast::{SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

/// A raw row: column name → stored value.
pub type Row = Map<String, Value>;

/// Table holding the data of every single-entry collection.
pub const SINGLE_COLLECTIONS_TABLE: &str = "single_collections";

/// The SQL flavor a store speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

/// A filter over columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Condition {
        column: String,
        operator: WhereOperator,
        value: Value,
    },
    /// Substring test, `INSTR(column, needle) > 0` or `POSITION(needle IN column) > 0`
    Contains { column: String, needle: String },
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Condition {
            column: column.to_string(),
            operator: WhereOperator::Eq,
            value: value.into(),
        }
    }

    pub fn id_in(ids: &[i64]) -> Self {
        Filter::Condition {
            column: "id".into(),
            operator: WhereOperator::In,
            value: Value::Array(ids.iter().map(|id| Value::from(*id)).collect()),
        }
    }
}

/// What to sort by.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderExpr {
    Column(String),
    /// Sum of the earliest match positions of `keywords` in a search column
    SearchRelevance { column: String, keywords: Vec<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: OrderExpr,
    pub direction: SortDirection,
}

/// A compiled read request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreQuery {
    pub table: String,
    /// Empty selects every column
    pub columns: Vec<String>,
    pub filter: Option<Filter>,
    pub order: Vec<OrderBy>,
    pub group: Vec<String>,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl StoreQuery {
    pub fn table(table: &str) -> Self {
        StoreQuery {
            table: table.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Min,
    Max,
    Sum,
}

impl Aggregate {
    pub fn sql_function(&self) -> &'static str {
        match self {
            Aggregate::Min => "MIN",
            Aggregate::Max => "MAX",
            Aggregate::Sum => "SUM",
        }
    }
}

/// Minimal storage contract consumed by the query builders.
pub trait RecordStore: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn find_all(&self, query: &StoreQuery) -> Result<Vec<Row>>;

    fn find_one(&self, query: &StoreQuery) -> Result<Option<Row>> {
        let mut query = query.clone();
        query.limit = Some(1);
        Ok(self.find_all(&query)?.into_iter().next())
    }

    /// Insert one row and return it as stored (including its id).
    fn create(&self, table: &str, values: &Row) -> Result<Row>;

    /// Insert rows atomically. Either every row is written or none is.
    fn bulk_create(&self, table: &str, values: &[Row]) -> Result<Vec<Row>>;

    /// Returns the number of updated rows.
    fn update(&self, table: &str, values: &Row, filter: Option<&Filter>) -> Result<usize>;

    /// Returns the number of deleted rows.
    fn destroy(&self, table: &str, filter: Option<&Filter>) -> Result<usize>;

    fn count(&self, table: &str, filter: Option<&Filter>) -> Result<u64>;

    fn aggregate(&self, table: &str, function: Aggregate, column: &str, filter: Option<&Filter>) -> Result<Value>;

    /// Run raw SQL with positional parameters.
    fn raw(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;
}

// ── Raw SQL classification ─────────────────────────────────────────

/// What a raw SQL statement does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStatementInfo {
    pub mutating: bool,
    pub tables: Vec<String>,
}

/// Parse raw SQL and report whether any statement writes, and which tables
/// the statements name.
pub fn classify_raw_sql(sql: &str) -> Result<RawStatementInfo> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| PruviousError::SqlParse(e.to_string()))?;
    if statements.is_empty() {
        return Err(PruviousError::SqlParse("no SQL statements found".into()));
    }

    let mut info = RawStatementInfo {
        mutating: false,
        tables: Vec::new(),
    };

    for statement in &statements {
        match statement {
            Statement::Query(query) => {
                if let SetExpr::Select(select) = query.body.as_ref() {
                    for table in &select.from {
                        collect_tables(table, &mut info.tables);
                    }
                }
            }
            Statement::Insert { table_name, .. } => {
                info.mutating = true;
                push_table(&mut info.tables, table_name.0.last().map(|i| i.value.clone()));
            }
            Statement::Update { table, .. } => {
                info.mutating = true;
                collect_tables(table, &mut info.tables);
            }
            _ => info.mutating = true,
        }
    }

    Ok(info)
}

fn collect_tables(table: &TableWithJoins, tables: &mut Vec<String>) {
    table_name(&table.relation, tables);
    for join in &table.joins {
        table_name(&join.relation, tables);
    }
}

fn table_name(factor: &TableFactor, tables: &mut Vec<String>) {
    if let TableFactor::Table { name, .. } = factor {
        push_table(tables, name.0.last().map(|i| i.value.clone()));
    }
}

fn push_table(tables: &mut Vec<String>, name: Option<String>) {
    if let Some(name) = name.filter(|n| !n.is_empty()) {
        if !tables.contains(&name) {
            tables.push(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_select() {
        let info = classify_raw_sql("SELECT p.name FROM products p JOIN categories c ON c.id = p.category").unwrap();
        assert!(!info.mutating);
        assert_eq!(info.tables, vec!["products", "categories"]);
    }

    #[test]
    fn test_classify_mutations() {
        let info = classify_raw_sql("UPDATE products SET price = 1 WHERE id = 2").unwrap();
        assert!(info.mutating);
        assert_eq!(info.tables, vec!["products"]);

        let info = classify_raw_sql("INSERT INTO products (name) VALUES ('x')").unwrap();
        assert!(info.mutating);
        assert_eq!(info.tables, vec!["products"]);

        assert!(classify_raw_sql("DELETE FROM products").unwrap().mutating);
    }

    #[test]
    fn test_classify_invalid() {
        assert!(classify_raw_sql("SELEC nothing").is_err());
    }
}
