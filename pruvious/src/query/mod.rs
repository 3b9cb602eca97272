//! Query builders and the engine that hands them out.
//!
//! [`Engine`] owns the resolved schema, the record store, the query cache and
//! the search indexer. Builders borrow it, accumulate [`QueryOptions`] and run
//! terminal operations through the field pipeline.

pub mod builder;
pub mod options;
pub mod populate;
pub mod single;

pub use crate::fields::pipeline::FieldErrors;
pub use builder::{Paginated, QueryBuilder, WhereClauses, WhereScope};
pub use options::{OrderTarget, OrderTerm, QueryOptions, WhereNode, WhereOperator};
pub use single::SingleQueryBuilder;

use crate::cache::{cache_key, is_cacheable, should_store, CacheLayer, MemoryCache, QueryCache};
use crate::error::{PruviousError, Result};
use crate::fields::Record;
use crate::schema::{CollectionMode, ResolvedCollection, ResolvedField, Schema};
use crate::search::SearchIndexer;
use crate::store::{classify_raw_sql, Filter, RecordStore, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// How a terminal operation failed. Never carries a raw store error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryFailure {
    #[error("Validation failed for {} field(s)", errors.len())]
    Invalid { errors: FieldErrors },

    /// One error map per input; inputs that passed have an empty map
    #[error("Validation failed for a batch input")]
    InvalidBatch { errors: Vec<FieldErrors> },

    #[error("{0}")]
    Message(String),
}

impl QueryFailure {
    /// `{ success: false, errors }` or `{ success: false, message }`.
    pub fn to_json(&self) -> Value {
        match self {
            QueryFailure::Invalid { errors } => json!({ "success": false, "errors": errors }),
            QueryFailure::InvalidBatch { errors } => json!({ "success": false, "errors": errors }),
            QueryFailure::Message(message) => json!({ "success": false, "message": message }),
        }
    }
}

impl From<PruviousError> for QueryFailure {
    fn from(error: PruviousError) -> Self {
        log::error!("Query failed: {error}");
        QueryFailure::Message(error.to_string())
    }
}

pub type QueryResult<T> = std::result::Result<T, QueryFailure>;

/// Entry point for all record operations.
pub struct Engine {
    schema: Arc<Schema>,
    store: Arc<dyn RecordStore>,
    cache: CacheLayer,
    indexer: SearchIndexer,
}

impl Engine {
    /// An engine with a process-local query cache.
    pub fn new(schema: Arc<Schema>, store: Arc<dyn RecordStore>) -> Self {
        let cache: Arc<dyn QueryCache> = Arc::new(MemoryCache::new());
        Self::with_cache(schema, store, CacheLayer::new(cache))
    }

    pub fn with_cache(schema: Arc<Schema>, store: Arc<dyn RecordStore>, cache: CacheLayer) -> Self {
        let indexer = SearchIndexer::start(
            Arc::clone(&schema),
            Arc::clone(&store),
            cache.clone(),
            schema.config().reindex_in_background,
        );
        Engine {
            schema,
            store,
            cache,
            indexer,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub fn indexer(&self) -> &SearchIndexer {
        &self.indexer
    }

    /// A builder for a multi-entry collection.
    pub fn query(&self, collection: &str) -> Result<QueryBuilder<'_>> {
        let collection = self.schema.collection(collection)?;
        if collection.mode != CollectionMode::Multi {
            return Err(PruviousError::Schema(format!(
                "'{}' is a single-entry collection",
                collection.name
            )));
        }
        Ok(QueryBuilder::new(self, collection))
    }

    /// A builder for a single-entry collection.
    pub fn single(&self, collection: &str) -> Result<SingleQueryBuilder<'_>> {
        let collection = self.schema.collection(collection)?;
        if collection.mode != CollectionMode::Single {
            return Err(PruviousError::Schema(format!(
                "'{}' is a multi-entry collection",
                collection.name
            )));
        }
        Ok(SingleQueryBuilder::new(self, collection))
    }

    /// Run raw SQL. Statements that write flush the query cache.
    pub fn raw(&self, sql: &str, params: &[Value]) -> QueryResult<Vec<Row>> {
        let info = match classify_raw_sql(sql) {
            Ok(info) => Some(info),
            Err(e) => {
                log::debug!("Could not classify raw SQL, treating it as a write: {e}");
                None
            }
        };
        let rows = self.store.raw(sql, params)?;
        match info {
            Some(info) if !info.mutating => {}
            Some(info) => self.cache.invalidate_tables(&self.schema, &info.tables),
            None => self.cache.flush(),
        }
        Ok(rows)
    }
}

/// Serve a read from the cache when possible. On a miss, run it and store the
/// result when it was slow enough and touches only cacheable fields.
pub(crate) fn cached<T>(
    engine: &Engine,
    collection: &ResolvedCollection,
    method: &str,
    options: &QueryOptions,
    run: impl FnOnce() -> Result<T>,
) -> QueryResult<T>
where
    T: Serialize + DeserializeOwned,
{
    let cacheable = is_cacheable(collection, options);
    let key = cache_key(&collection.name, method, options);
    if cacheable {
        if let Some(hit) = engine.cache().get(&key) {
            match serde_json::from_str(&hit) {
                Ok(value) => return Ok(value),
                Err(e) => log::warn!("Discarding unreadable cache entry '{key}': {e}"),
            }
        }
    }

    let started = Instant::now();
    let result = run()?;
    if cacheable && should_store(collection, started.elapsed()) {
        match serde_json::to_string(&result) {
            Ok(json) => engine.cache().set(&key, json),
            Err(e) => log::warn!("Could not cache '{key}': {e}"),
        }
    }
    Ok(result)
}

// ── Row conversion ─────────────────────────────────────────────────

/// Turn a raw row into a record of casted values, in field declaration order.
/// Columns that belong to no field are dropped.
pub fn cast_row(collection: &ResolvedCollection, mut row: Row) -> Record {
    let mut record = Record::new();
    for field in &collection.fields {
        let Some(raw) = row.remove(&field.column) else {
            continue;
        };
        let value = match field.behavior().deserialize(raw) {
            Ok(value) => value,
            Err(e) => {
                log::debug!("Could not cast '{}.{}': {e}", collection.name, field.name);
                Value::Null
            }
        };
        record.insert(field.name.clone(), value);
    }
    record
}

/// Turn a record into a row of storage values keyed by column.
pub fn store_row(collection: &ResolvedCollection, record: &Record) -> Result<Row> {
    let mut row = Row::new();
    for (name, value) in record {
        let field = collection.field(name).ok_or_else(|| PruviousError::UnknownField {
            collection: collection.name.clone(),
            field: name.clone(),
        })?;
        row.insert(field.column.clone(), field.behavior().serialize(value)?);
    }
    Ok(row)
}

/// Storage form of a filter operand. Null stays null and JSON-stored fields
/// compare against the operand as given.
pub(crate) fn filter_operand(field: &ResolvedField, value: &Value) -> Value {
    if value.is_null() || field.behavior().storage() == crate::fields::Storage::Json {
        return value.clone();
    }
    match field.behavior().serialize(value) {
        Ok(stored) => stored,
        Err(e) => {
            log::debug!("Filter operand for '{}' kept as given: {e}", field.name);
            value.clone()
        }
    }
}

/// Convert filter nodes over fields into a store filter over columns.
pub(crate) fn compile_nodes(collection: &ResolvedCollection, nodes: &[WhereNode]) -> Vec<Filter> {
    nodes
        .iter()
        .filter_map(|node| compile_node(collection, node))
        .collect()
}

fn compile_node(collection: &ResolvedCollection, node: &WhereNode) -> Option<Filter> {
    match node {
        WhereNode::Condition { field, operator, value } => {
            let field = collection.field(field)?;
            let value = if operator.is_pattern() {
                value.clone()
            } else if let Value::Array(items) = value {
                Value::Array(items.iter().map(|v| filter_operand(field, v)).collect())
            } else {
                filter_operand(field, value)
            };
            Some(Filter::Condition {
                column: field.column.clone(),
                operator: *operator,
                value,
            })
        }
        WhereNode::Some(children) => Some(Filter::Or(compile_nodes(collection, children))),
        WhereNode::Every(children) => Some(Filter::And(compile_nodes(collection, children))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::store::SqliteStore;
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        Schema::from_yaml(
            r#"
collections:
  products:
    fields:
      name: { type: text }
      active: { type: switch }
      tags: { type: chips }
  settings:
    mode: single
    fields:
      title: { type: text }
"#,
            EngineConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_cast_and_store_rows() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let record = json!({ "name": "Lamp", "active": true, "tags": ["a"] });
        let row = store_row(products, record.as_object().unwrap()).unwrap();
        assert_eq!(row["active"], json!(1));
        assert_eq!(row["tags"], json!("[\"a\"]"));

        let mut row = row;
        row.insert("id".into(), json!(4));
        row.insert("_unrelated".into(), json!("x"));
        let cast = cast_row(products, row);
        assert_eq!(
            Value::Object(cast),
            json!({ "id": 4, "name": "Lamp", "active": true, "tags": ["a"] })
        );
    }

    #[test]
    fn test_compile_nodes_uses_columns_and_storage_values() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let filters = compile_nodes(
            products,
            &[
                WhereNode::condition("active", WhereOperator::Eq, json!(true)),
                WhereNode::condition("missing", WhereOperator::Eq, json!(1)),
                WhereNode::Some(vec![WhereNode::condition("name", WhereOperator::Like, json!("L%"))]),
            ],
        );
        assert_eq!(
            filters,
            vec![
                Filter::eq("active", 1),
                Filter::Or(vec![Filter::Condition {
                    column: "name".into(),
                    operator: WhereOperator::Like,
                    value: json!("L%"),
                }]),
            ]
        );
    }

    #[test]
    fn test_engine_rejects_wrong_mode() {
        let engine = Engine::new(
            Arc::new(schema()),
            Arc::new(SqliteStore::open_in_memory().unwrap()),
        );
        assert!(engine.query("settings").is_err());
        assert!(engine.single("products").is_err());
        assert!(engine.query("missing").is_err());
        assert!(engine.query("products").is_ok());
    }

    #[test]
    fn test_failure_json() {
        let mut errors = FieldErrors::new();
        errors.insert("price".into(), "The value must be a number".into());
        assert_eq!(
            QueryFailure::Invalid { errors }.to_json(),
            json!({ "success": false, "errors": { "price": "The value must be a number" } })
        );
        assert_eq!(
            QueryFailure::Message("boom".into()).to_json(),
            json!({ "success": false, "message": "boom" })
        );
    }
}
