//! Query result cache.
//!
//! Keys are derived from the builder options; values are JSON strings.
//! Invalidation always flushes the whole cache.

use crate::query::QueryOptions;
use crate::schema::{ResolvedCollection, Schema};
use crate::store::SINGLE_COLLECTIONS_TABLE;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Key/value storage for cached query results.
pub trait QueryCache: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    /// Drop every entry.
    fn flush(&self);
}

/// A process-local [`QueryCache`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QueryCache for MemoryCache {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        match self.entries.lock() {
            Ok(mut entries) => {
                entries.insert(key.to_string(), value);
            }
            Err(_) => log::warn!("Query cache lock poisoned; skipping write of '{key}'"),
        }
    }

    fn flush(&self) {
        match self.entries.lock() {
            Ok(mut entries) => entries.clear(),
            Err(_) => log::warn!("Query cache lock poisoned; flush skipped"),
        }
    }
}

/// Which mutation triggered an invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Create,
    Update,
    Delete,
}

/// Canonical cache key of a query.
pub fn cache_key(collection: &str, method: &str, options: &QueryOptions) -> String {
    let offset = options.offset.map(|n| n.to_string()).unwrap_or_else(|| "null".into());
    let limit = options.limit.map(|n| n.to_string()).unwrap_or_else(|| "null".into());
    format!(
        "pruvious:query:{collection}:{method}:select:{}:where:{}:order:{}:group:{}:offset:{offset}:limit:{limit}:populate:{}:fallback:{}",
        options.select.join(","),
        options.where_json(),
        options.order_json(),
        serde_json::Value::from(options.group.clone()),
        options.populate,
        options.fallback,
    )
}

/// Whether a query shape may be cached at all.
pub fn is_cacheable(collection: &ResolvedCollection, options: &QueryOptions) -> bool {
    collection.cache.cache_queries.is_some()
        && options
            .referenced_fields()
            .iter()
            .all(|f| collection.field(f).map_or(true, |f| f.cacheable))
}

/// Whether a query that took `elapsed` should be written to the cache.
pub fn should_store(collection: &ResolvedCollection, elapsed: Duration) -> bool {
    match collection.cache.cache_queries {
        Some(threshold) => elapsed > Duration::from_millis(threshold),
        None => false,
    }
}

/// The query cache plus an optional page-rendering cache flushed alongside it.
#[derive(Clone)]
pub struct CacheLayer {
    query: Arc<dyn QueryCache>,
    pages: Option<Arc<dyn QueryCache>>,
}

impl CacheLayer {
    pub fn new(query: Arc<dyn QueryCache>) -> Self {
        CacheLayer { query, pages: None }
    }

    pub fn with_page_cache(mut self, pages: Arc<dyn QueryCache>) -> Self {
        self.pages = Some(pages);
        self
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let hit = self.query.get(key);
        if hit.is_some() {
            log::debug!("Cache hit: {key}");
        }
        hit
    }

    pub fn set(&self, key: &str, value: String) {
        log::debug!("Cache write: {key}");
        self.query.set(key, value);
    }

    /// Flush both caches.
    pub fn flush(&self) {
        self.query.flush();
        if let Some(pages) = &self.pages {
            pages.flush();
        }
    }

    /// Flush unless the collection's `clearCacheRules` disable this mutation.
    pub fn invalidate(&self, collection: &ResolvedCollection, mutation: Mutation) {
        let rules = collection.cache.clear_cache_rules;
        let enabled = match mutation {
            Mutation::Create => rules.on_create,
            Mutation::Update => rules.on_update,
            Mutation::Delete => rules.on_delete,
        };
        if enabled {
            log::debug!("Flushing query cache after {mutation:?} on '{}'", collection.name);
            self.flush();
        }
    }

    /// Flush when any of `tables` backs a collection of `schema`.
    pub fn invalidate_tables(&self, schema: &Schema, tables: &[String]) {
        let touches_schema = tables.is_empty()
            || tables.iter().any(|t| {
                t.eq_ignore_ascii_case(SINGLE_COLLECTIONS_TABLE)
                    || schema.collections().any(|c| t.eq_ignore_ascii_case(&c.table))
            });
        if touches_schema {
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::query::{WhereNode, WhereOperator};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::from_yaml(
            r#"
collections:
  products:
    clearCacheRules: { onCreate: false }
    fields:
      name: { type: text }
      secret: { type: text, cacheable: false }
"#,
            EngineConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_cache_key_format() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let mut options = QueryOptions::for_collection(products);
        options.select = vec!["id".into(), "name".into()];
        options.filter.push(WhereNode::condition("name", WhereOperator::Eq, json!("a")));
        options.limit = Some(5);
        assert_eq!(
            cache_key("products", "all", &options),
            r#"pruvious:query:products:all:select:id,name:where:[{"name":{"eq":"a"}}]:order:[]:group:[]:offset:null:limit:5:populate:false:fallback:true"#
        );

        options.search.insert("default".into(), vec!["mouse".into()]);
        assert!(cache_key("products", "all", &options).contains(r#"{"$search":{"default":["mouse"]}}"#));
    }

    #[test]
    fn test_non_cacheable_fields() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let mut options = QueryOptions::for_collection(products);
        assert!(!is_cacheable(products, &options));
        options.select = vec!["name".into()];
        assert!(is_cacheable(products, &options));
    }

    #[test]
    fn test_threshold() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        assert!(!should_store(products, Duration::from_millis(10)));
        assert!(should_store(products, Duration::from_millis(11)));
    }

    #[test]
    fn test_invalidate_respects_rules() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let query = Arc::new(MemoryCache::new());
        let pages = Arc::new(MemoryCache::new());
        let layer = CacheLayer::new(query.clone()).with_page_cache(pages.clone());

        layer.set("k", "v".into());
        pages.set("page", "html".into());
        layer.invalidate(products, Mutation::Create);
        assert_eq!(query.len(), 1);

        layer.invalidate(products, Mutation::Update);
        assert!(query.is_empty());
        assert!(pages.is_empty());
    }

    #[test]
    fn test_invalidate_tables() {
        let schema = schema();
        let query = Arc::new(MemoryCache::new());
        let layer = CacheLayer::new(query.clone());

        layer.set("k", "v".into());
        layer.invalidate_tables(&schema, &["audit_log".into()]);
        assert_eq!(query.len(), 1);
        layer.invalidate_tables(&schema, &["SINGLE_COLLECTIONS".into()]);
        assert!(query.is_empty());

        layer.set("k", "v".into());
        layer.invalidate_tables(&schema, &["products".into()]);
        assert!(query.is_empty());
    }
}
