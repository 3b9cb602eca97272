//! Record processing stages shared by both query builders.
//!
//! Writes run `prepare_input → fill_defaults → sanitize → gate → validate`;
//! reads run `apply_fallback`, which re-validates stored values and resets
//! anything invalid to the field default. Nested repeater and block entries
//! are walked with typed [`FieldPath`]s such as `content.0.fields.title`.

use super::{FieldContext, Operation, Record};
use crate::schema::path::FieldPath;
use crate::schema::{NestedFields, ResolvedCollection, ResolvedField, Schema};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

/// Field path → first error message for that field.
pub type FieldErrors = BTreeMap<String, String>;

/// Result of evaluating every field's conditional logic against one input.
#[derive(Debug, Default, Clone)]
pub struct GateOutcome {
    /// Rules that could not be evaluated (e.g. a missing dependency)
    pub errors: FieldErrors,
    /// Paths excluded from validation for this input
    pub failed: HashSet<String>,
}

static NULL: Value = Value::Null;

pub struct Pipeline<'a> {
    schema: &'a Schema,
    collection: &'a ResolvedCollection,
    operation: Operation,
    language: &'a str,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        schema: &'a Schema,
        collection: &'a ResolvedCollection,
        operation: Operation,
        language: &'a str,
    ) -> Self {
        Pipeline {
            schema,
            collection,
            operation,
            language,
        }
    }

    fn context<'b>(&'b self, field: &'b ResolvedField, path: &'b FieldPath, input: &'b Value) -> FieldContext<'b> {
        FieldContext {
            schema: self.schema,
            collection: self.collection,
            field,
            path,
            operation: self.operation,
            input,
            language: self.language,
        }
    }

    // ── Input ──────────────────────────────────────────────────────

    /// Keep only known, writable fields. Updates also drop immutable fields.
    pub fn prepare_input(&self, input: &Record) -> Record {
        let mut prepared = Map::new();
        for (key, value) in input {
            match self.collection.field(key) {
                Some(field) if field.name == "id" || field.is_timestamp() => {
                    log::debug!("{}: ignoring read-only field '{key}'", self.collection.name);
                }
                Some(field) if self.operation == Operation::Update && field.immutable => {
                    log::debug!("{}: ignoring immutable field '{key}' on update", self.collection.name);
                }
                Some(_) => {
                    prepared.insert(key.clone(), value.clone());
                }
                None => {
                    log::debug!("{}: ignoring unknown field '{key}'", self.collection.name);
                }
            }
        }
        prepared
    }

    /// Insert the default of every writable field missing from `record`,
    /// then put the keys in declaration order.
    pub fn fill_defaults(&self, record: &mut Record) {
        let snapshot = Value::Object(record.clone());
        let mut filled = Map::new();
        for field in self.collection.writable_fields() {
            let value = match record.get(&field.name) {
                Some(value) => value.clone(),
                None => {
                    let path = FieldPath::field(&field.name);
                    field.behavior().default_value(&self.context(field, &path, &snapshot))
                }
            };
            filled.insert(field.name.clone(), value);
        }
        *record = filled;
    }

    /// A record holding the default of every writable field.
    pub fn default_record(&self) -> Record {
        let mut record = Map::new();
        self.fill_defaults(&mut record);
        record
    }

    // ── Sanitize ───────────────────────────────────────────────────

    /// Run every applicable sanitizer chain. Failures never propagate: a
    /// failing stage keeps the value it was given.
    pub fn sanitize(&self, record: Record) -> Record {
        let snapshot = Value::Object(record.clone());
        let mut sanitized = Map::new();
        for (key, value) in record {
            let value = match self.collection.field(&key) {
                Some(field) => self.sanitize_value(field, &FieldPath::field(&key), value, &snapshot),
                None => value,
            };
            sanitized.insert(key, value);
        }
        sanitized
    }

    fn sanitize_value(&self, field: &ResolvedField, path: &FieldPath, value: Value, input: &Value) -> Value {
        let ctx = self.context(field, path, input);
        let mut value = value;
        for sanitizer in field
            .sanitizer_chain()
            .filter(|s| s.operations.applies_to(self.operation))
        {
            match (sanitizer.run)(&ctx, value.clone()) {
                Ok(next) => value = next,
                Err(message) => {
                    log::debug!("Sanitizer for '{path}' skipped: {message}");
                }
            }
        }

        match (&field.nested, value) {
            (NestedFields::Repeater(subfields), Value::Array(items)) => Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| match item {
                        Value::Object(entry) => {
                            Value::Object(self.sanitize_entry(subfields, &path.index(i), entry, input))
                        }
                        other => other,
                    })
                    .collect(),
            ),
            (NestedFields::Blocks(allowed), Value::Array(items)) => Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| self.sanitize_block(allowed, &path.index(i), item, input))
                    .collect(),
            ),
            (_, value) => value,
        }
    }

    /// Sanitize one object entry against `subfields`, filling missing
    /// subfields with defaults and dropping unknown keys.
    fn sanitize_entry(&self, subfields: &[ResolvedField], path: &FieldPath, mut entry: Record, input: &Value) -> Record {
        let mut sanitized = Map::new();
        for sub in subfields {
            let sub_path = path.key(&sub.name);
            let value = match entry.get_mut(&sub.name) {
                Some(value) => value.take(),
                None => sub.behavior().default_value(&self.context(sub, &sub_path, input)),
            };
            sanitized.insert(sub.name.clone(), self.sanitize_value(sub, &sub_path, value, input));
        }
        sanitized
    }

    fn sanitize_block(&self, allowed: &[String], path: &FieldPath, item: Value, input: &Value) -> Value {
        let mut entry = match item {
            Value::Object(entry) => entry,
            other => return other,
        };
        let Some(block) = block_name(&entry)
            .filter(|name| allowed.iter().any(|a| a == name))
            .and_then(|name| self.schema.block(name))
        else {
            return Value::Object(entry);
        };
        let fields = match entry.get_mut("fields").map(Value::take) {
            Some(Value::Object(fields)) => fields,
            _ => Map::new(),
        };
        let fields_path = path.key("fields");
        let mut sanitized = Map::new();
        sanitized.insert("name".into(), Value::String(block.name.clone()));
        sanitized.insert(
            "fields".into(),
            Value::Object(self.sanitize_entry(&block.fields, &fields_path, fields, input)),
        );
        Value::Object(sanitized)
    }

    // ── Conditional logic ──────────────────────────────────────────

    /// Evaluate the conditional logic of every field present in `record`.
    pub fn gate(&self, record: &Record) -> GateOutcome {
        let input = Value::Object(record.clone());
        let mut outcome = GateOutcome::default();
        for (key, value) in record {
            if let Some(field) = self.collection.field(key) {
                self.gate_value(field, &FieldPath::field(key), value, &input, &mut outcome);
            }
        }
        outcome
    }

    fn gate_value(&self, field: &ResolvedField, path: &FieldPath, value: &Value, input: &Value, outcome: &mut GateOutcome) {
        if let Some(rule) = &field.conditional_logic {
            let ctx = self.context(field, path, input);
            match field.behavior().matches_conditional_logic(&ctx, rule) {
                Ok(true) => {}
                Ok(false) => {
                    outcome.failed.insert(path.to_string());
                    return;
                }
                Err(e) => {
                    outcome.errors.insert(path.to_string(), e.to_string());
                    outcome.failed.insert(path.to_string());
                    return;
                }
            }
        }

        for (sub, sub_path, sub_value) in self.nested_entries(field, path, value) {
            self.gate_value(sub, &sub_path, sub_value, input, outcome);
        }
    }

    // ── Validate ───────────────────────────────────────────────────

    /// Validate every field present in `record`, skipping `failed` paths.
    /// The first error of each field wins.
    pub fn validate(&self, record: &Record, failed: &HashSet<String>) -> FieldErrors {
        let input = Value::Object(record.clone());
        let mut errors = FieldErrors::new();
        for (key, value) in record {
            if let Some(field) = self.collection.field(key) {
                self.validate_value(field, &FieldPath::field(key), value, &input, failed, &mut errors);
            }
        }
        errors
    }

    fn validate_value(
        &self,
        field: &ResolvedField,
        path: &FieldPath,
        value: &Value,
        input: &Value,
        failed: &HashSet<String>,
        errors: &mut FieldErrors,
    ) {
        let key = path.to_string();
        if failed.contains(&key) {
            return;
        }

        if self.operation != Operation::Read && field.required && field.behavior().is_empty(value) {
            errors.insert(key, "This field is required".into());
            return;
        }

        let ctx = self.context(field, path, input);
        for validator in field
            .validator_chain()
            .filter(|v| v.operations.applies_to(self.operation))
        {
            if let Err(message) = (validator.run)(&ctx, value) {
                errors.insert(key, message);
                return;
            }
        }

        for (index, message) in self.invalid_entries(field, value) {
            errors.insert(path.index(index).to_string(), message.into());
        }

        for (sub, sub_path, sub_value) in self.nested_entries(field, path, value) {
            self.validate_value(sub, &sub_path, sub_value, input, failed, errors);
        }
    }

    /// Indices of array entries whose shape does not fit the nested layout.
    fn invalid_entries(&self, field: &ResolvedField, value: &Value) -> Vec<(usize, &'static str)> {
        let Value::Array(items) = value else {
            return Vec::new();
        };
        match &field.nested {
            NestedFields::None => Vec::new(),
            NestedFields::Repeater(_) => items
                .iter()
                .enumerate()
                .filter(|(_, item)| !item.is_object())
                .map(|(i, _)| (i, "The value must be an object"))
                .collect(),
            NestedFields::Blocks(allowed) => items
                .iter()
                .enumerate()
                .filter(|(_, item)| self.resolve_block_entry(allowed, item).is_none())
                .map(|(i, _)| (i, "Invalid block"))
                .collect(),
        }
    }

    /// Subfields of every well-formed nested entry with their paths and values.
    fn nested_entries<'v>(
        &self,
        field: &'v ResolvedField,
        path: &FieldPath,
        value: &'v Value,
    ) -> Vec<(&'v ResolvedField, FieldPath, &'v Value)>
    where
        'a: 'v,
    {
        let Value::Array(items) = value else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        for (i, item) in items.iter().enumerate() {
            match &field.nested {
                NestedFields::None => return entries,
                NestedFields::Repeater(subfields) => {
                    if let Value::Object(entry) = item {
                        for sub in subfields {
                            let value = entry.get(&sub.name).unwrap_or(&NULL);
                            entries.push((sub, path.index(i).key(&sub.name), value));
                        }
                    }
                }
                NestedFields::Blocks(allowed) => {
                    if let Some((block, fields)) = self.resolve_block_entry(allowed, item) {
                        for sub in &block.fields {
                            let value = fields.and_then(|f| f.get(&sub.name)).unwrap_or(&NULL);
                            entries.push((sub, path.index(i).key("fields").key(&sub.name), value));
                        }
                    }
                }
            }
        }
        entries
    }

    fn resolve_block_entry<'v>(
        &self,
        allowed: &[String],
        item: &'v Value,
    ) -> Option<(&'a crate::schema::ResolvedBlock, Option<&'v Map<String, Value>>)> {
        let entry = item.as_object()?;
        let name = block_name(entry)?;
        if !allowed.iter().any(|a| a == name) {
            return None;
        }
        let block = self.schema.block(name)?;
        Some((block, entry.get("fields").and_then(Value::as_object)))
    }

    // ── Write ──────────────────────────────────────────────────────

    /// Run the whole write pipeline for one input.
    pub fn process_write(&self, input: &Record) -> Result<Record, FieldErrors> {
        let mut record = self.prepare_input(input);
        if self.operation == Operation::Create {
            self.fill_defaults(&mut record);
        }
        let record = self.sanitize(record);

        let GateOutcome { mut errors, failed } = self.gate(&record);
        errors.extend(self.validate(&record, &failed));

        if errors.is_empty() {
            Ok(record)
        } else {
            Err(errors)
        }
    }

    // ── Read ───────────────────────────────────────────────────────

    /// Re-validate stored values: invalid fields fall back to their default,
    /// malformed nested entries are pruned while the rest keep their order.
    pub fn apply_fallback(&self, record: &mut Record) {
        let input = Value::Object(record.clone());
        let failed = self.gate(record).failed;
        let keys: Vec<String> = record.keys().cloned().collect();
        for key in keys {
            let Some(field) = self.collection.field(&key) else {
                continue;
            };
            if let Some(value) = record.get_mut(&key) {
                self.fallback_value(field, &FieldPath::field(&key), value, &input, &failed);
            }
        }
    }

    fn fallback_value(&self, field: &ResolvedField, path: &FieldPath, value: &mut Value, input: &Value, failed: &HashSet<String>) {
        if failed.contains(&path.to_string()) {
            return;
        }

        let ctx = self.context(field, path, input);
        let invalid = field
            .validator_chain()
            .filter(|v| v.operations.applies_to(Operation::Read))
            .any(|v| (v.run)(&ctx, value).is_err());
        if invalid {
            log::debug!("Falling back to the default value of '{path}'");
            *value = field.behavior().default_value(&ctx);
            return;
        }

        let Value::Array(items) = value else {
            return;
        };
        match &field.nested {
            NestedFields::None => {}
            NestedFields::Repeater(subfields) => {
                for (i, item) in items.iter_mut().enumerate() {
                    let Value::Object(entry) = item else {
                        *item = Value::Null;
                        continue;
                    };
                    for sub in subfields {
                        let slot = entry.entry(sub.name.clone()).or_insert(Value::Null);
                        self.fallback_value(sub, &path.index(i).key(&sub.name), slot, input, failed);
                    }
                }
                items.retain(|item| !item.is_null());
            }
            NestedFields::Blocks(allowed) => {
                for (i, item) in items.iter_mut().enumerate() {
                    let Some((block, _)) = self.resolve_block_entry(allowed, item) else {
                        *item = Value::Null;
                        continue;
                    };
                    let Some(entry) = item.as_object_mut() else {
                        continue;
                    };
                    let fields = entry
                        .entry("fields".to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !fields.is_object() {
                        *fields = Value::Object(Map::new());
                    }
                    if let Value::Object(fields) = fields {
                        for sub in &block.fields {
                            let slot = fields.entry(sub.name.clone()).or_insert(Value::Null);
                            let sub_path = path.index(i).key("fields").key(&sub.name);
                            self.fallback_value(sub, &sub_path, slot, input, failed);
                        }
                    }
                }
                items.retain(|item| !item.is_null());
            }
        }
    }
}

fn block_name(entry: &Map<String, Value>) -> Option<&str> {
    entry.get("name").and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::fields::Operation;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const SCHEMA: &str = r#"
languages:
  primary: en
  supported: [en, de]
blocks:
  hero:
    fields:
      title: { type: text, required: true }
      subtitle: { type: text, conditionalLogic: { title: { ne: "" } } }
collections:
  products:
    translatable: true
    fields:
      name: { type: text, required: true }
      slug: { type: slug }
      price: { type: number, options: { min: 0 } }
      active: { type: switch }
      featured: { type: checkbox }
      kind: { type: select, options: { choices: [physical, digital] } }
      launched: { type: date }
      publishedAt: { type: date-time }
      tags: { type: chips }
      category: { type: record, options: { collection: categories } }
      related: { type: records, options: { collection: products } }
      sku: { type: text, immutable: true }
      discount: { type: number, conditionalLogic: { price: { gt: 100 } } }
      links:
        type: repeater
        options:
          subfields:
            label: { type: text, required: true }
            url: { type: text, validators: [url] }
      content: { type: blocks }
  categories:
    fields:
      name: { type: text }
"#;

    fn schema() -> Schema {
        Schema::from_yaml(SCHEMA, EngineConfig::default()).unwrap()
    }

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let pipeline = Pipeline::new(&schema, products, Operation::Create, "en");

        let input = record(json!({
            "name": "  Wireless Mouse ",
            "slug": "Wireless Mouse!",
            "price": "19.50",
            "active": "true",
            "featured": 0,
            "kind": "digital",
            "launched": "2024-03-01",
            "publishedAt": "2024-03-01T10:00:00Z",
            "tags": " a, b ,a,",
            "category": "3",
            "related": [1, "2", 1],
            "links": [{ "label": " Docs ", "url": "https://example.com", "extra": 1 }],
            "content": [{ "name": "hero", "fields": { "title": " Hi " } }]
        }));

        let once = pipeline.sanitize(input);
        let twice = pipeline.sanitize(once.clone());
        assert_eq!(once, twice);

        assert_eq!(once["name"], json!("Wireless Mouse"));
        assert_eq!(once["slug"], json!("wireless-mouse"));
        assert_eq!(once["price"], json!(19.5));
        assert_eq!(once["active"], json!(true));
        assert_eq!(once["featured"], json!(false));
        assert_eq!(once["launched"], json!(1_709_251_200_000i64));
        assert_eq!(once["tags"], json!(["a", "b"]));
        assert_eq!(once["category"], json!(3));
        assert_eq!(once["related"], json!([1, 2]));
        assert_eq!(once["links"], json!([{ "label": "Docs", "url": "https://example.com" }]));
        assert_eq!(
            once["content"],
            json!([{ "name": "hero", "fields": { "title": "Hi", "subtitle": "" } }])
        );
    }

    #[test]
    fn test_serialize_round_trip() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let samples = [
            ("price", json!(19.5)),
            ("price", json!(7)),
            ("active", json!(true)),
            ("active", json!(false)),
            ("tags", json!(["a", "b"])),
            ("related", json!([3, 1])),
            ("links", json!([{ "label": "Docs", "url": "/docs" }])),
            ("content", json!([{ "name": "hero", "fields": { "title": "Hi", "subtitle": "" } }])),
            ("launched", json!(1_709_251_200_000i64)),
            ("name", json!("Mouse")),
        ];
        for (name, value) in samples {
            let behavior = products.field(name).unwrap().behavior();
            let stored = behavior.serialize(&value).unwrap();
            assert_eq!(behavior.deserialize(stored).unwrap(), value, "field {name}");
        }
    }

    #[test]
    fn test_create_requires_and_reports_first_error() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let pipeline = Pipeline::new(&schema, products, Operation::Create, "en");

        let errors = pipeline
            .process_write(&record(json!({ "price": "not-a-number" })))
            .unwrap_err();
        assert_eq!(errors["name"], "This field is required");
        assert_eq!(errors["price"], "The value must be a number");

        let errors = pipeline
            .process_write(&record(json!({ "name": "Mouse", "price": -1 })))
            .unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors["price"], "The value must be greater than or equal to 0");
    }

    #[test]
    fn test_create_fills_defaults_and_reserved_fields() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let pipeline = Pipeline::new(&schema, products, Operation::Create, "en");

        let record = pipeline
            .process_write(&record(json!({ "name": "Mouse", "id": 99, "createdAt": 1 })))
            .unwrap();
        assert!(!record.contains_key("id"));
        assert!(!record.contains_key("createdAt"));
        assert_eq!(record["price"], json!(0));
        assert_eq!(record["language"], json!("en"));
        assert!(record["translations"].as_str().is_some_and(|t| !t.is_empty()));
        let keys: Vec<&str> = record.keys().map(String::as_str).take(3).collect();
        assert_eq!(keys, vec!["name", "slug", "price"]);
    }

    #[test]
    fn test_language_rules() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let categories = schema.collection("categories").unwrap();

        let pipeline = Pipeline::new(&schema, products, Operation::Create, "en");
        assert!(pipeline
            .process_write(&record(json!({ "name": "Maus", "language": "DE" })))
            .is_ok());
        let errors = pipeline
            .process_write(&record(json!({ "name": "Souris", "language": "fr" })))
            .unwrap_err();
        assert_eq!(errors["language"], "The language 'fr' is not supported");

        let pipeline = Pipeline::new(&schema, categories, Operation::Create, "en");
        let errors = pipeline
            .process_write(&record(json!({ "language": "de" })))
            .unwrap_err();
        assert_eq!(errors["language"], "The collection is not translatable");
    }

    #[test]
    fn test_update_drops_immutable_fields() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let pipeline = Pipeline::new(&schema, products, Operation::Update, "en");

        let record = pipeline
            .process_write(&record(json!({ "sku": "X-1", "price": 5, "bogus": true })))
            .unwrap();
        assert_eq!(record, Record::from_iter([("price".to_string(), json!(5))]));
    }

    #[test]
    fn test_conditional_logic_excludes_field_from_validation() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let pipeline = Pipeline::new(&schema, products, Operation::Create, "en");

        // price is 10, so the discount rule fails and its value is not validated
        let record = pipeline
            .process_write(&record(json!({ "name": "Mouse", "price": 10, "discount": "oops" })))
            .unwrap();
        assert_eq!(record["discount"], json!("oops"));

        let errors = pipeline
            .process_write(&self::record(json!({ "name": "Mouse", "price": 200, "discount": "oops" })))
            .unwrap_err();
        assert_eq!(errors["discount"], "The value must be a number");
    }

    #[test]
    fn test_conditional_logic_missing_dependency_is_an_error() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let pipeline = Pipeline::new(&schema, products, Operation::Update, "en");

        let errors = pipeline
            .process_write(&record(json!({ "discount": 5 })))
            .unwrap_err();
        assert!(errors["discount"].contains("price"));
    }

    #[test]
    fn test_nested_errors_use_full_paths() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let pipeline = Pipeline::new(&schema, products, Operation::Create, "en");

        let errors = pipeline
            .process_write(&record(json!({
                "name": "Mouse",
                "links": [{ "label": "Docs", "url": "nope" }, { "url": "/ok" }, 5],
                "content": [{ "name": "hero", "fields": {} }, { "name": "gallery" }]
            })))
            .unwrap_err();
        assert_eq!(errors["links.0.url"], "Invalid URL");
        assert_eq!(errors["links.1.label"], "This field is required");
        assert_eq!(errors["links.2"], "The value must be an object");
        assert_eq!(errors["content.0.fields.title"], "This field is required");
        assert_eq!(errors["content.1"], "Invalid block");
        assert!(!errors.contains_key("content.0.fields.subtitle"));
    }

    #[test]
    fn test_fallback_resets_invalid_values_and_prunes_entries() {
        let schema = schema();
        let products = schema.collection("products").unwrap();
        let pipeline = Pipeline::new(&schema, products, Operation::Read, "en");

        let mut stored = record(json!({
            "id": 1,
            "name": "Mouse",
            "price": "corrupt",
            "kind": "gone",
            "links": [5, { "label": "Docs", "url": 7 }, null, { "label": "Blog", "url": "/blog" }],
            "content": [{ "name": "gallery" }, { "name": "hero", "fields": { "title": "Hi" } }]
        }));
        pipeline.apply_fallback(&mut stored);

        assert_eq!(stored["price"], json!(0));
        assert_eq!(stored["kind"], Value::Null);
        assert_eq!(
            stored["links"],
            json!([{ "label": "Docs", "url": "" }, { "label": "Blog", "url": "/blog" }])
        );
        assert_eq!(
            stored["content"],
            json!([{ "name": "hero", "fields": { "title": "Hi", "subtitle": "" } }])
        );
    }
}
