use super::sql::{self, quote_ident, Compiled};
use super::{Aggregate, Dialect, Filter, RecordStore, Row, StoreQuery, SINGLE_COLLECTIONS_TABLE};
use crate::error::{PruviousError, Result};
use crate::schema::{ResolvedCollection, Schema};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A [`RecordStore`] backed by a SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(&format!(
            "
            CREATE TABLE IF NOT EXISTS {SINGLE_COLLECTIONS_TABLE} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                language TEXT NOT NULL,
                data TEXT NOT NULL DEFAULT '{{}}',
                UNIQUE (name, language)
            );
            "
        ))?;
        Ok(SqliteStore {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| PruviousError::Store("SQLite connection lock poisoned".into()))
    }

    // ── Schema sync ──────────────────────────────────────────────────

    /// Create tables, missing columns and indexes for every multi-entry collection.
    pub fn sync_schema(&self, schema: &Schema) -> Result<()> {
        for collection in schema.collections().filter(|c| c.is_multi()) {
            self.sync_collection(collection)?;
        }
        Ok(())
    }

    /// Create or extend the table of one collection.
    pub fn sync_collection(&self, collection: &ResolvedCollection) -> Result<()> {
        let conn = self.lock()?;
        let table = quote_ident(&collection.table);

        let mut columns: Vec<(String, &'static str)> = collection
            .fields
            .iter()
            .filter(|f| f.name != "id")
            .map(|f| (f.column.clone(), f.behavior().storage().sql_type()))
            .collect();
        for structure in &collection.search {
            columns.push((structure.column.clone(), "TEXT"));
        }

        let definitions = columns
            .iter()
            .map(|(name, ty)| format!("{} {ty}", quote_ident(name)))
            .collect::<Vec<_>>();
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT{}{});",
            if definitions.is_empty() { "" } else { ", " },
            definitions.join(", ")
        ))?;

        let existing: Vec<String> = {
            let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        for (name, ty) in &columns {
            if !existing.contains(name) {
                log::debug!("Adding column '{name}' to '{}'", collection.table);
                conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {} {ty};", quote_ident(name)))?;
            }
        }

        for index in &collection.indexes {
            let columns: Vec<String> = index
                .fields
                .iter()
                .filter_map(|f| collection.field(f).map(|f| f.column.clone()))
                .collect();
            let name = format!("idx_{}_{}", collection.table, columns.join("_"));
            conn.execute_batch(&format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {table} ({});",
                if index.unique { "UNIQUE " } else { "" },
                quote_ident(&name),
                columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
            ))?;
        }

        Ok(())
    }

    // ── Execution ────────────────────────────────────────────────────

    fn query_rows(conn: &Connection, compiled: &Compiled) -> Result<Vec<Row>> {
        let mut stmt = conn.prepare(&compiled.sql)?;
        let column_names: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let rows = stmt.query_map(params_from_iter(compiled.params.iter().map(to_sql_value)), |row| {
            let mut obj = Map::new();
            for (i, name) in column_names.iter().enumerate() {
                let val: SqlValue = row.get(i)?;
                obj.insert(name.clone(), from_sql_value(val));
            }
            Ok(obj)
        })?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    fn execute(conn: &Connection, compiled: &Compiled) -> Result<usize> {
        log::debug!("{}", compiled.sql);
        Ok(conn.execute(&compiled.sql, params_from_iter(compiled.params.iter().map(to_sql_value)))?)
    }

    fn insert_row(conn: &Connection, table: &str, values: &Row) -> Result<Row> {
        Self::execute(conn, &sql::compile_insert(Dialect::Sqlite, table, values))?;
        let id = conn.last_insert_rowid();
        let mut query = StoreQuery::table(table);
        query.filter = Some(Filter::eq("id", id));
        Self::query_rows(conn, &sql::compile_select(Dialect::Sqlite, &query))?
            .into_iter()
            .next()
            .ok_or_else(|| PruviousError::Store(format!("Inserted row {id} not found in '{table}'")))
    }
}

impl RecordStore for SqliteStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn find_all(&self, query: &StoreQuery) -> Result<Vec<Row>> {
        let conn = self.lock()?;
        let compiled = sql::compile_select(Dialect::Sqlite, query);
        log::debug!("{}", compiled.sql);
        Self::query_rows(&conn, &compiled)
    }

    fn create(&self, table: &str, values: &Row) -> Result<Row> {
        let conn = self.lock()?;
        Self::insert_row(&conn, table, values)
    }

    fn bulk_create(&self, table: &str, values: &[Row]) -> Result<Vec<Row>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut rows = Vec::with_capacity(values.len());
        for row in values {
            rows.push(Self::insert_row(&tx, table, row)?);
        }
        tx.commit()?;
        Ok(rows)
    }

    fn update(&self, table: &str, values: &Row, filter: Option<&Filter>) -> Result<usize> {
        if values.is_empty() {
            return Ok(0);
        }
        let conn = self.lock()?;
        Self::execute(&conn, &sql::compile_update(Dialect::Sqlite, table, values, filter))
    }

    fn destroy(&self, table: &str, filter: Option<&Filter>) -> Result<usize> {
        let conn = self.lock()?;
        Self::execute(&conn, &sql::compile_delete(Dialect::Sqlite, table, filter))
    }

    fn count(&self, table: &str, filter: Option<&Filter>) -> Result<u64> {
        let conn = self.lock()?;
        let rows = Self::query_rows(&conn, &sql::compile_count(Dialect::Sqlite, table, filter))?;
        Ok(rows
            .first()
            .and_then(|r| r.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    fn aggregate(&self, table: &str, function: Aggregate, column: &str, filter: Option<&Filter>) -> Result<Value> {
        let conn = self.lock()?;
        let compiled = sql::compile_aggregate(Dialect::Sqlite, table, function, column, filter);
        let rows = Self::query_rows(&conn, &compiled)?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|mut r| r.remove("value"))
            .unwrap_or(Value::Null))
    }

    fn raw(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let conn = self.lock()?;
        let compiled = Compiled {
            sql: sql.to_string(),
            params: params.to_vec(),
        };
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| PruviousError::SqlParse(format!("Failed to prepare SQL: {e}")))?;
        if stmt.column_count() == 0 {
            drop(stmt);
            Self::execute(&conn, &compiled)?;
            return Ok(Vec::new());
        }
        drop(stmt);
        Self::query_rows(&conn, &compiled)
    }
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn from_sql_value(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(n) => Value::Number(n.into()),
        SqlValue::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        SqlValue::Text(s) => Value::String(s),
        SqlValue::Blob(b) => Value::String(String::from_utf8_lossy(&b).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().unwrap().clone()
    }

    fn store() -> SqliteStore {
        let schema = Schema::from_yaml(
            r#"
collections:
  products:
    search:
      default: [{ field: name }]
    fields:
      name: { type: text }
      price: { type: number }
      sku: { type: text, unique: true }
"#,
            EngineConfig::default(),
        )
        .unwrap();
        let store = SqliteStore::open_in_memory().unwrap();
        store.sync_schema(&schema).unwrap();
        store
    }

    #[test]
    fn test_create_and_find() {
        let store = store();
        let created = store
            .create("products", &row(json!({ "name": "Mouse", "price": 19.5, "sku": "M-1" })))
            .unwrap();
        assert_eq!(created["id"], json!(1));
        assert_eq!(created["price"], json!(19.5));
        assert!(created.contains_key("_search_default"));

        let mut query = StoreQuery::table("products");
        query.filter = Some(Filter::eq("sku", "M-1"));
        let found = store.find_one(&query).unwrap().unwrap();
        assert_eq!(found["name"], json!("Mouse"));
    }

    #[test]
    fn test_bulk_create_is_atomic() {
        let store = store();
        let result = store.bulk_create(
            "products",
            &[
                row(json!({ "name": "A", "sku": "dup" })),
                row(json!({ "name": "B", "sku": "dup" })),
            ],
        );
        assert!(result.is_err());
        assert_eq!(store.count("products", None).unwrap(), 0);
    }

    #[test]
    fn test_update_destroy_aggregate() {
        let store = store();
        store
            .bulk_create(
                "products",
                &[
                    row(json!({ "name": "A", "price": 5, "sku": "a" })),
                    row(json!({ "name": "B", "price": 15, "sku": "b" })),
                ],
            )
            .unwrap();

        let updated = store
            .update("products", &row(json!({ "price": 10 })), Some(&Filter::id_in(&[1])))
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(
            store.aggregate("products", Aggregate::Sum, "price", None).unwrap(),
            json!(25.0)
        );
        assert_eq!(store.destroy("products", Some(&Filter::id_in(&[2]))).unwrap(), 1);
        assert_eq!(store.count("products", None).unwrap(), 1);
    }

    #[test]
    fn test_sync_adds_missing_columns() {
        let store = store();
        let schema = Schema::from_yaml(
            r#"
collections:
  products:
    fields:
      name: { type: text }
      price: { type: number }
      sku: { type: text, unique: true }
      stock: { type: number }
"#,
            EngineConfig::default(),
        )
        .unwrap();
        store.sync_schema(&schema).unwrap();
        let created = store.create("products", &row(json!({ "stock": 3 }))).unwrap();
        assert_eq!(created["stock"], json!(3.0));
    }

    #[test]
    fn test_raw_statements() {
        let store = store();
        store
            .raw("INSERT INTO products (name, sku) VALUES (?, ?)", &[json!("Raw"), json!("r")])
            .unwrap();
        let rows = store.raw("SELECT name FROM products WHERE sku = ?", &[json!("r")]).unwrap();
        assert_eq!(rows, vec![row(json!({ "name": "Raw" }))]);
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .create(SINGLE_COLLECTIONS_TABLE, &row(json!({ "name": "settings", "language": "en", "data": "{}" })))
                .unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count(SINGLE_COLLECTIONS_TABLE, None).unwrap(), 1);
    }
}
