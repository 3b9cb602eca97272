//! Builder for single-entry collections.
//!
//! Every single-entry collection stores one JSON document per language in the
//! shared `single_collections` table. Reads never fail for a missing row: the
//! field defaults are returned instead.

use super::options::{QueryOptions, WhereNode, WhereOperator};
use super::populate::Populator;
use super::{cached, Engine, QueryFailure, QueryResult};
use crate::cache::Mutation;
use crate::error::Result;
use crate::fields::pipeline::Pipeline;
use crate::fields::{Operation, Record};
use crate::schema::ResolvedCollection;
use crate::store::{Filter, Row, StoreQuery, SINGLE_COLLECTIONS_TABLE};
use serde_json::Value;

/// The stored row of one language.
struct StoredEntry {
    id: i64,
    data: Record,
}

#[derive(Clone)]
pub struct SingleQueryBuilder<'e> {
    engine: &'e Engine,
    collection: &'e ResolvedCollection,
    options: QueryOptions,
}

impl<'e> SingleQueryBuilder<'e> {
    pub(crate) fn new(engine: &'e Engine, collection: &'e ResolvedCollection) -> Self {
        SingleQueryBuilder {
            engine,
            collection,
            options: QueryOptions::for_collection(collection),
        }
    }

    pub fn collection(&self) -> &ResolvedCollection {
        self.collection
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn select(&mut self, fields: &[&str]) -> &mut Self {
        let mut selected: Vec<String> = Vec::new();
        for field in fields {
            if !self.collection.has_field(field) {
                log::warn!("{}: the field '{field}' does not exist", self.collection.name);
            } else if !selected.iter().any(|s| s == field) {
                selected.push(field.to_string());
            }
        }
        self.options.select = selected;
        self
    }

    pub fn select_all(&mut self) -> &mut Self {
        self.options.select = self.collection.fields.iter().map(|f| f.name.clone()).collect();
        self
    }

    pub fn deselect(&mut self, fields: &[&str]) -> &mut Self {
        self.options.select.retain(|f| !fields.contains(&f.as_str()));
        self
    }

    pub fn populate(&mut self) -> &mut Self {
        self.options.populate = true;
        self
    }

    pub fn unpopulate(&mut self) -> &mut Self {
        self.options.populate = false;
        self
    }

    pub fn fallback(&mut self) -> &mut Self {
        self.options.fallback = true;
        self
    }

    pub fn no_fallback(&mut self) -> &mut Self {
        self.options.fallback = false;
        self
    }

    pub fn language(&mut self, code: &str) -> &mut Self {
        let code = code.trim().to_ascii_lowercase();
        if self.engine.schema().languages().is_supported(&code) {
            self.options.language = Some(code);
        } else {
            log::warn!("{}: the language '{code}' is not supported", self.collection.name);
        }
        self
    }

    pub fn reset(&mut self) -> &mut Self {
        self.options = QueryOptions::for_collection(self.collection);
        self
    }

    fn context_language(&self) -> &str {
        self.options
            .language
            .as_deref()
            .unwrap_or(&self.engine.schema().languages().primary)
    }

    /// The options used for the cache key. The language becomes a condition
    /// so each language gets its own entry.
    fn keyed_options(&self) -> QueryOptions {
        let mut options = self.options.clone();
        options.filter = vec![WhereNode::condition(
            "language",
            WhereOperator::Eq,
            Value::String(self.context_language().to_string()),
        )];
        options
    }

    fn row_filter(&self) -> Filter {
        Filter::And(vec![
            Filter::eq("name", self.collection.name.as_str()),
            Filter::eq("language", self.context_language()),
        ])
    }

    fn stored(&self) -> Result<Option<StoredEntry>> {
        let mut query = StoreQuery::table(SINGLE_COLLECTIONS_TABLE);
        query.filter = Some(self.row_filter());
        let Some(row) = self.engine.store().find_one(&query)? else {
            return Ok(None);
        };
        let id = row.get("id").and_then(Value::as_i64).unwrap_or_default();
        let data = match row.get("data") {
            Some(Value::String(json)) => match serde_json::from_str::<Value>(json)? {
                Value::Object(data) => data,
                _ => Record::new(),
            },
            _ => Record::new(),
        };
        Ok(Some(StoredEntry { id, data }))
    }

    /// Stored data over the field defaults, without `id` and `language`.
    fn current_data(&self, stored: Option<&StoredEntry>) -> Record {
        let pipeline = Pipeline::new(
            self.engine.schema(),
            self.collection,
            Operation::Create,
            self.context_language(),
        );
        let mut data = pipeline.default_record();
        data.remove("language");
        if let Some(stored) = stored {
            for (key, value) in &stored.data {
                if self.collection.has_field(key) {
                    data.insert(key.clone(), value.clone());
                }
            }
        }
        data
    }

    // ── Terminals ──────────────────────────────────────────────────

    pub fn read(&self) -> QueryResult<Record> {
        let options = self.keyed_options();
        cached(self.engine, self.collection, "read", &options, || self.load())
    }

    fn load(&self) -> Result<Record> {
        let language = self.context_language();
        let stored = self.stored()?;
        let data = self.current_data(stored.as_ref());

        let mut record = Record::new();
        for field in &self.collection.fields {
            let value = match field.name.as_str() {
                "id" => stored.as_ref().map(|s| Value::from(s.id)).unwrap_or(Value::Null),
                "language" => Value::String(language.to_string()),
                name => data.get(name).cloned().unwrap_or(Value::Null),
            };
            record.insert(field.name.clone(), value);
        }

        if self.options.fallback {
            Pipeline::new(self.engine.schema(), self.collection, Operation::Read, language)
                .apply_fallback(&mut record);
        }
        if self.options.populate {
            Populator::new(self.engine, language, self.engine.schema().config().population_depth)
                .populate(self.collection, &mut record)?;
        }
        record.retain(|key, _| self.options.select.iter().any(|s| s == key));
        Ok(record)
    }

    /// Sanitize and validate `input` merged over the current data.
    fn prepare(&self, input: &Record, stored: Option<&StoredEntry>) -> QueryResult<(Record, Record)> {
        let base = self.current_data(stored);
        let mut merged = base.clone();
        for (key, value) in input {
            if key == "language" {
                log::debug!("{}: the language is chosen by the builder, ignoring input", self.collection.name);
                continue;
            }
            merged.insert(key.clone(), value.clone());
        }

        let pipeline = Pipeline::new(
            self.engine.schema(),
            self.collection,
            Operation::Update,
            self.context_language(),
        );
        let processed = pipeline
            .process_write(&merged)
            .map_err(|errors| QueryFailure::Invalid { errors })?;
        Ok((base, processed))
    }

    /// Run the write pipeline without persisting.
    pub fn validate(&self, input: &Record) -> QueryResult<Record> {
        let stored = self.stored()?;
        Ok(self.prepare(input, stored.as_ref())?.1)
    }

    /// Merge `input` into the stored document, creating it when missing.
    pub fn update(&self, input: &Record) -> QueryResult<Record> {
        let stored = self.stored()?;
        let (mut data, processed) = self.prepare(input, stored.as_ref())?;
        data.extend(processed);

        if self.collection.has_timestamps() {
            let now = Value::from(chrono::Utc::now().timestamp_millis());
            if data.get("createdAt").map_or(true, Value::is_null) {
                data.insert("createdAt".into(), now.clone());
            }
            data.insert("updatedAt".into(), now);
        }

        let json = Value::String(serde_json::to_string(&data).map_err(crate::error::PruviousError::from)?);
        let store = self.engine.store();
        match &stored {
            Some(entry) => {
                let mut row = Row::new();
                row.insert("data".into(), json);
                store.update(SINGLE_COLLECTIONS_TABLE, &row, Some(&Filter::eq("id", entry.id)))?;
            }
            None => {
                let mut row = Row::new();
                row.insert("name".into(), Value::String(self.collection.name.clone()));
                row.insert("language".into(), Value::String(self.context_language().to_string()));
                row.insert("data".into(), json);
                store.create(SINGLE_COLLECTIONS_TABLE, &row)?;
            }
        }

        self.engine.cache().invalidate(self.collection, Mutation::Update);
        Ok(self.load()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::schema::Schema;
    use crate::store::SqliteStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    const SCHEMA: &str = r#"
languages:
  primary: en
  supported: [en, de]
collections:
  settings:
    mode: single
    translatable: true
    fields:
      siteName: { type: text, required: true, options: { default: "My site" } }
      perPage: { type: number, options: { min: 1, default: 10 } }
      logo: { type: record, options: { collection: media } }
  media:
    fields:
      url: { type: text }
"#;

    fn engine() -> Engine {
        let schema = Arc::new(Schema::from_yaml(SCHEMA, EngineConfig::default()).unwrap());
        let store = SqliteStore::open_in_memory().unwrap();
        store.sync_schema(&schema).unwrap();
        Engine::new(schema, Arc::new(store))
    }

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_read_returns_defaults_without_row() {
        let engine = engine();
        let settings = engine.single("settings").unwrap().read().unwrap();
        assert_eq!(
            Value::Object(settings),
            json!({
                "id": null,
                "siteName": "My site",
                "perPage": 10,
                "logo": null,
                "language": "en",
                "createdAt": null,
                "updatedAt": null,
            })
        );
    }

    #[test]
    fn test_update_merges_and_keeps_languages_apart() {
        let engine = engine();
        let settings = engine.single("settings").unwrap();
        settings.update(&record(json!({ "perPage": "25" }))).unwrap();
        let updated = settings.update(&record(json!({ "siteName": "Shop" }))).unwrap();
        assert_eq!(updated["siteName"], json!("Shop"));
        assert_eq!(updated["perPage"], json!(25));

        let german = engine.single("settings").unwrap().language("de").read().unwrap();
        assert_eq!(german["siteName"], json!("My site"));
        assert_eq!(german["language"], json!("de"));
        assert_eq!(german["id"], Value::Null);
    }

    #[test]
    fn test_update_stamps_timestamps() {
        let engine = engine();
        let settings = engine.single("settings").unwrap();
        let first = settings.update(&record(json!({ "perPage": 12 }))).unwrap();
        let created = first["createdAt"].as_i64().unwrap();
        assert!(first["updatedAt"].as_i64().unwrap() >= created);

        let second = settings
            .update(&record(json!({ "perPage": 13, "createdAt": 1 })))
            .unwrap();
        assert_eq!(second["createdAt"], json!(created));
        assert!(second["updatedAt"].as_i64().unwrap() >= created);
    }

    #[test]
    fn test_update_rejects_invalid_input() {
        let engine = engine();
        let settings = engine.single("settings").unwrap();
        let failure = settings.update(&record(json!({ "perPage": 0, "siteName": "" }))).unwrap_err();
        match failure {
            QueryFailure::Invalid { errors } => {
                assert_eq!(errors["perPage"], "The value must be greater than or equal to 1");
                assert_eq!(errors["siteName"], "This field is required");
            }
            other => panic!("unexpected failure: {other:?}"),
        }
        assert_eq!(settings.read().unwrap()["perPage"], json!(10));
        assert!(settings.validate(&record(json!({ "perPage": 3 }))).is_ok());
    }

    #[test]
    fn test_read_select_and_populate() {
        let engine = engine();
        engine
            .query("media")
            .unwrap()
            .create(&record(json!({ "url": "/logo.png" })))
            .unwrap();
        engine
            .single("settings")
            .unwrap()
            .update(&record(json!({ "logo": 1 })))
            .unwrap();

        let settings = engine
            .single("settings")
            .unwrap()
            .select(&["logo"])
            .populate()
            .read()
            .unwrap();
        assert_eq!(settings.len(), 1);
        assert_eq!(settings["logo"]["url"], json!("/logo.png"));
    }
}
