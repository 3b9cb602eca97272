use super::*;
use crate::error::PruviousError;
use chrono::{DateTime, NaiveDate};
use serde_json::json;

/// Register every built-in field type, including the internal types backing
/// the reserved `id`, `language` and `translations` fields.
pub fn register_builtins(registry: &mut FieldRegistry) {
    registry.register(TextField { name: "text", trim: true });
    registry.register(TextField { name: "text-area", trim: false });
    registry.register(SlugField);
    registry.register(NumberField);
    registry.register(BooleanField { name: "switch" });
    registry.register(BooleanField { name: "checkbox" });
    registry.register(SelectField);
    registry.register(DateField);
    registry.register(DateTimeField);
    registry.register(ChipsField);
    registry.register(RecordField);
    registry.register(RecordsField);
    registry.register(RepeaterField);
    registry.register(BlocksField);
    registry.register(IdField);
    registry.register(LanguageField);
    registry.register(TranslationsField);
}

// ── Shared helpers ─────────────────────────────────────────────────

fn declared_default(ctx: &FieldContext<'_>) -> Option<Value> {
    ctx.field.options.get("default").cloned()
}

/// Integral floats become JSON integers so `5.0` and `5` compare equal.
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        json!(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        Value::Object(map) => map.get("id").and_then(as_id),
        _ => None,
    }
}

fn encode_json(value: &Value) -> Result<Value> {
    Ok(Value::String(serde_json::to_string(value)?))
}

fn decode_json(raw: Value, empty: Value) -> Result<Value> {
    match raw {
        Value::Null => Ok(empty),
        Value::String(s) if s.is_empty() => Ok(empty),
        Value::String(s) => Ok(serde_json::from_str(&s)?),
        other => Ok(other),
    }
}

fn expect_string(_ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    if value.is_string() {
        Ok(())
    } else {
        Err("The value must be a string".into())
    }
}

fn expect_array(_ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    if value.is_array() {
        Ok(())
    } else {
        Err("The value must be an array".into())
    }
}

fn expect_integer_or_null(_ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    match value {
        Value::Null => Ok(()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(()),
        _ => Err("The value must be an integer".into()),
    }
}

fn validate_item_count(ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    let Some(items) = value.as_array() else {
        return Ok(());
    };
    if let Some(min) = ctx.option_u64("minItems") {
        if (items.len() as u64) < min {
            return Err(format!("At least {min} items are required"));
        }
    }
    if let Some(max) = ctx.option_u64("maxItems") {
        if (items.len() as u64) > max {
            return Err(format!("No more than {max} items are allowed"));
        }
    }
    Ok(())
}

// ── Text ───────────────────────────────────────────────────────────

/// `text` and `text-area`: strings with optional trimming and length bounds.
pub struct TextField {
    name: &'static str,
    trim: bool,
}

fn sanitize_text(ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    let text = match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => return Ok(other),
    };
    if ctx.option_bool("trim") {
        Ok(Value::String(text.trim().to_string()))
    } else {
        Ok(Value::String(text))
    }
}

fn validate_text_length(ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    let Some(text) = value.as_str() else {
        return Ok(());
    };
    let length = text.chars().count() as u64;
    if let Some(min) = ctx.option_u64("minLength") {
        if length < min && length > 0 {
            return Err(format!("The value must be at least {min} characters long"));
        }
    }
    if let Some(max) = ctx.option_u64("maxLength") {
        if length > max {
            return Err(format!("The value must not exceed {max} characters"));
        }
    }
    Ok(())
}

impl FieldBehavior for TextField {
    fn type_name(&self) -> &'static str {
        self.name
    }

    fn option_defaults(&self) -> ResolvedOptions {
        let mut options = Map::new();
        options.insert("default".into(), json!(""));
        options.insert("trim".into(), json!(self.trim));
        options.insert("minLength".into(), Value::Null);
        options.insert("maxLength".into(), Value::Null);
        options
    }

    fn default_value(&self, ctx: &FieldContext<'_>) -> Value {
        declared_default(ctx).unwrap_or_else(|| json!(""))
    }

    fn sanitizers(&self) -> Vec<Sanitizer> {
        vec![Sanitizer::on(Operations::WRITE, sanitize_text)]
    }

    fn validators(&self) -> Vec<Validator> {
        vec![
            Validator::always(expect_string),
            Validator::always(validate_text_length),
        ]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::String
    }

    fn storage(&self) -> Storage {
        Storage::Text
    }

    fn deserialize(&self, raw: Value) -> Result<Value> {
        Ok(if raw.is_null() { json!("") } else { raw })
    }
}

// ── Slug ───────────────────────────────────────────────────────────

pub struct SlugField;

/// Lowercase alphanumeric segments joined by single dashes.
fn is_slug(s: &str) -> bool {
    s.split('-').all(|part| {
        !part.is_empty() && part.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    })
}

fn sanitize_slug(_ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    match value {
        Value::String(s) => Ok(Value::String(slug::slugify(s))),
        Value::Null => Ok(json!("")),
        other => Ok(other),
    }
}

fn validate_slug(_ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    match value.as_str() {
        Some("") => Ok(()),
        Some(s) if is_slug(s) => Ok(()),
        Some(_) => Err("The value must be a valid slug".into()),
        None => Err("The value must be a string".into()),
    }
}

impl FieldBehavior for SlugField {
    fn type_name(&self) -> &'static str {
        "slug"
    }

    fn default_value(&self, ctx: &FieldContext<'_>) -> Value {
        declared_default(ctx).unwrap_or_else(|| json!(""))
    }

    fn sanitizers(&self) -> Vec<Sanitizer> {
        vec![Sanitizer::on(Operations::WRITE, sanitize_slug)]
    }

    fn validators(&self) -> Vec<Validator> {
        vec![Validator::always(validate_slug)]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::String
    }

    fn storage(&self) -> Storage {
        Storage::Text
    }

    fn deserialize(&self, raw: Value) -> Result<Value> {
        Ok(if raw.is_null() { json!("") } else { raw })
    }
}

// ── Number ─────────────────────────────────────────────────────────

pub struct NumberField;

fn sanitize_number(_ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    match parse_number(&value) {
        Some(n) => Ok(number_value(n)),
        None => Ok(value),
    }
}

fn validate_number(ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    let Some(n) = value.as_f64() else {
        return Err("The value must be a number".into());
    };
    if let Some(min) = ctx.option_f64("min") {
        if n < min {
            return Err(format!("The value must be greater than or equal to {min}"));
        }
    }
    if let Some(max) = ctx.option_f64("max") {
        if n > max {
            return Err(format!("The value must be less than or equal to {max}"));
        }
    }
    if let Some(decimals) = ctx.option_u64("decimals") {
        let factor = 10f64.powi(decimals as i32);
        if ((n * factor).round() - n * factor).abs() > 1e-9 {
            return Err(format!("The value must have at most {decimals} decimal places"));
        }
    }
    Ok(())
}

impl FieldBehavior for NumberField {
    fn type_name(&self) -> &'static str {
        "number"
    }

    fn option_defaults(&self) -> ResolvedOptions {
        let mut options = Map::new();
        options.insert("default".into(), json!(0));
        options.insert("min".into(), Value::Null);
        options.insert("max".into(), Value::Null);
        options.insert("decimals".into(), Value::Null);
        options
    }

    fn default_value(&self, ctx: &FieldContext<'_>) -> Value {
        declared_default(ctx).unwrap_or_else(|| json!(0))
    }

    fn sanitizers(&self) -> Vec<Sanitizer> {
        vec![Sanitizer::on(Operations::WRITE, sanitize_number)]
    }

    fn validators(&self) -> Vec<Validator> {
        vec![Validator::always(validate_number)]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::Number
    }

    fn storage(&self) -> Storage {
        Storage::Real
    }

    fn deserialize(&self, raw: Value) -> Result<Value> {
        Ok(match raw.as_f64() {
            Some(n) => number_value(n),
            None => raw,
        })
    }

    fn is_empty(&self, value: &Value) -> bool {
        value.is_null()
    }
}

// ── Boolean ────────────────────────────────────────────────────────

/// `switch` and `checkbox`.
pub struct BooleanField {
    name: &'static str,
}

fn sanitize_boolean(_ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    Ok(match &value {
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => json!(true),
            "false" | "0" | "no" | "off" => json!(false),
            _ => value,
        },
        Value::Number(n) if n.as_f64() == Some(1.0) => json!(true),
        Value::Number(n) if n.as_f64() == Some(0.0) => json!(false),
        _ => value,
    })
}

fn validate_boolean(_ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    if value.is_boolean() {
        Ok(())
    } else {
        Err("The value must be a boolean".into())
    }
}

impl FieldBehavior for BooleanField {
    fn type_name(&self) -> &'static str {
        self.name
    }

    fn default_value(&self, ctx: &FieldContext<'_>) -> Value {
        declared_default(ctx).unwrap_or(Value::Bool(false))
    }

    fn sanitizers(&self) -> Vec<Sanitizer> {
        vec![Sanitizer::on(Operations::WRITE, sanitize_boolean)]
    }

    fn validators(&self) -> Vec<Validator> {
        vec![Validator::always(validate_boolean)]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::Boolean
    }

    fn storage(&self) -> Storage {
        Storage::Boolean
    }

    fn serialize(&self, value: &Value) -> Result<Value> {
        Ok(match value {
            Value::Bool(b) => json!(i64::from(*b)),
            other => other.clone(),
        })
    }

    fn deserialize(&self, raw: Value) -> Result<Value> {
        Ok(match &raw {
            Value::Number(n) => Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0),
            Value::Null => Value::Bool(false),
            _ => raw,
        })
    }

    fn extract_keywords(&self, _ctx: &FieldContext<'_>, _value: &Value) -> String {
        String::new()
    }

    fn is_empty(&self, value: &Value) -> bool {
        value.is_null()
    }
}

// ── Select ─────────────────────────────────────────────────────────

pub struct SelectField;

/// The allowed values of a select field. Choices may be plain strings or
/// `{ value, label }` objects.
fn choice_values(ctx: &FieldContext<'_>) -> Vec<Value> {
    ctx.option("choices")
        .and_then(Value::as_array)
        .map(|choices| {
            choices
                .iter()
                .map(|c| c.get("value").cloned().unwrap_or_else(|| c.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn validate_choice(ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    if value.is_null() || choice_values(ctx).contains(value) {
        Ok(())
    } else {
        Err("The value is not a valid choice".into())
    }
}

impl FieldBehavior for SelectField {
    fn type_name(&self) -> &'static str {
        "select"
    }

    fn option_defaults(&self) -> ResolvedOptions {
        let mut options = Map::new();
        options.insert("choices".into(), json!([]));
        options
    }

    fn default_value(&self, ctx: &FieldContext<'_>) -> Value {
        declared_default(ctx).unwrap_or(Value::Null)
    }

    fn validators(&self) -> Vec<Validator> {
        vec![Validator::always(validate_choice)]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::String
    }

    fn storage(&self) -> Storage {
        Storage::Text
    }
}

// ── Dates ──────────────────────────────────────────────────────────

const DAY_MS: i64 = 86_400_000;

/// `date`: a UTC midnight timestamp in milliseconds.
pub struct DateField;

fn sanitize_date(_ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    match &value {
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::String(s) => {
            let date = NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map_err(|e| e.to_string())?;
            let midnight = date.and_hms_opt(0, 0, 0).ok_or("Invalid date")?;
            Ok(json!(midnight.and_utc().timestamp_millis()))
        }
        Value::Number(n) => match n.as_f64() {
            Some(ms) => Ok(json!((ms as i64).div_euclid(DAY_MS) * DAY_MS)),
            None => Ok(value),
        },
        _ => Ok(value),
    }
}

/// `date-time`: a UTC timestamp in milliseconds.
pub struct DateTimeField;

fn sanitize_date_time(_ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    match &value {
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::String(s) => {
            if let Ok(ms) = s.trim().parse::<i64>() {
                return Ok(json!(ms));
            }
            let parsed = DateTime::parse_from_rfc3339(s.trim()).map_err(|e| e.to_string())?;
            Ok(json!(parsed.timestamp_millis()))
        }
        Value::Number(n) if !n.is_i64() => Ok(n.as_f64().map(|f| json!(f.round() as i64)).unwrap_or(value)),
        _ => Ok(value),
    }
}

fn validate_timestamp_range(ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    let Some(ms) = value.as_i64() else {
        return Ok(());
    };
    if let Some(min) = ctx.option("min").and_then(Value::as_i64) {
        if ms < min {
            return Err(format!("The date must be on or after {min}"));
        }
    }
    if let Some(max) = ctx.option("max").and_then(Value::as_i64) {
        if ms > max {
            return Err(format!("The date must be on or before {max}"));
        }
    }
    Ok(())
}

impl FieldBehavior for DateField {
    fn type_name(&self) -> &'static str {
        "date"
    }

    fn default_value(&self, ctx: &FieldContext<'_>) -> Value {
        declared_default(ctx).unwrap_or(Value::Null)
    }

    fn sanitizers(&self) -> Vec<Sanitizer> {
        vec![Sanitizer::on(Operations::WRITE, sanitize_date)]
    }

    fn validators(&self) -> Vec<Validator> {
        vec![
            Validator::always(expect_integer_or_null),
            Validator::always(validate_timestamp_range),
        ]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::Number
    }

    fn storage(&self) -> Storage {
        Storage::Integer
    }

    fn extract_keywords(&self, _ctx: &FieldContext<'_>, _value: &Value) -> String {
        String::new()
    }
}

impl FieldBehavior for DateTimeField {
    fn type_name(&self) -> &'static str {
        "date-time"
    }

    fn default_value(&self, ctx: &FieldContext<'_>) -> Value {
        declared_default(ctx).unwrap_or(Value::Null)
    }

    fn sanitizers(&self) -> Vec<Sanitizer> {
        vec![Sanitizer::on(Operations::WRITE, sanitize_date_time)]
    }

    fn validators(&self) -> Vec<Validator> {
        vec![
            Validator::always(expect_integer_or_null),
            Validator::always(validate_timestamp_range),
        ]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::Number
    }

    fn storage(&self) -> Storage {
        Storage::Integer
    }

    fn extract_keywords(&self, _ctx: &FieldContext<'_>, _value: &Value) -> String {
        String::new()
    }
}

// ── Chips ──────────────────────────────────────────────────────────

/// A list of distinct, trimmed strings.
pub struct ChipsField;

fn sanitize_chips(ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    let items: Vec<Value> = match value {
        Value::Null => Vec::new(),
        Value::String(s) => s.split(',').map(|p| json!(p)).collect(),
        Value::Array(items) => items,
        other => return Ok(other),
    };

    let allow_duplicates = ctx.option_bool("allowDuplicates");
    let mut chips: Vec<Value> = Vec::new();
    for item in items {
        let item = match item {
            Value::String(s) => Value::String(s.trim().to_string()),
            Value::Number(n) => Value::String(n.to_string()),
            other => other,
        };
        if item.as_str() == Some("") {
            continue;
        }
        if allow_duplicates || !chips.contains(&item) {
            chips.push(item);
        }
    }
    Ok(Value::Array(chips))
}

fn validate_chips(_ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    match value.as_array() {
        Some(items) if items.iter().all(Value::is_string) => Ok(()),
        Some(_) => Err("Every item must be a string".into()),
        None => Err("The value must be an array".into()),
    }
}

impl FieldBehavior for ChipsField {
    fn type_name(&self) -> &'static str {
        "chips"
    }

    fn option_defaults(&self) -> ResolvedOptions {
        let mut options = Map::new();
        options.insert("allowDuplicates".into(), json!(false));
        options.insert("minItems".into(), Value::Null);
        options.insert("maxItems".into(), Value::Null);
        options
    }

    fn default_value(&self, ctx: &FieldContext<'_>) -> Value {
        declared_default(ctx).unwrap_or_else(|| json!([]))
    }

    fn sanitizers(&self) -> Vec<Sanitizer> {
        vec![Sanitizer::on(Operations::WRITE, sanitize_chips)]
    }

    fn validators(&self) -> Vec<Validator> {
        vec![
            Validator::always(validate_chips),
            Validator::always(validate_item_count),
        ]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::Array
    }

    fn storage(&self) -> Storage {
        Storage::Json
    }

    fn serialize(&self, value: &Value) -> Result<Value> {
        encode_json(value)
    }

    fn deserialize(&self, raw: Value) -> Result<Value> {
        decode_json(raw, json!([]))
    }
}

// ── Relations ──────────────────────────────────────────────────────

/// A reference to one record of another collection, stored as its id.
pub struct RecordField;

fn sanitize_record_id(_ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    match &value {
        Value::String(s) if s.trim().is_empty() => Ok(Value::Null),
        Value::Null => Ok(Value::Null),
        _ => Ok(as_id(&value).map(|id| json!(id)).unwrap_or(value)),
    }
}

fn validate_record_id(_ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    match value {
        Value::Null => Ok(()),
        Value::Number(n) if n.as_i64().is_some_and(|id| id > 0) => Ok(()),
        _ => Err("The value must be a record ID".into()),
    }
}

fn related_collection<'c>(ctx: &'c FieldContext<'_>) -> Result<&'c str> {
    ctx.option_str("collection").ok_or_else(|| {
        PruviousError::Schema(format!(
            "The field '{}' does not declare a related collection",
            ctx.field.name
        ))
    })
}

impl FieldBehavior for RecordField {
    fn type_name(&self) -> &'static str {
        "record"
    }

    fn option_defaults(&self) -> ResolvedOptions {
        let mut options = Map::new();
        options.insert("collection".into(), Value::Null);
        options
    }

    fn default_value(&self, _ctx: &FieldContext<'_>) -> Value {
        Value::Null
    }

    fn sanitizers(&self) -> Vec<Sanitizer> {
        vec![Sanitizer::on(Operations::WRITE, sanitize_record_id)]
    }

    fn validators(&self) -> Vec<Validator> {
        vec![Validator::always(validate_record_id)]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::Number
    }

    fn storage(&self) -> Storage {
        Storage::Integer
    }

    fn population_type(&self) -> Option<&'static str> {
        Some("record")
    }

    fn populate(&self, ctx: &FieldContext<'_>, value: &Value, fetcher: &dyn RelationFetcher) -> Result<Value> {
        let Some(id) = value.as_i64() else {
            return Ok(Value::Null);
        };
        let collection = related_collection(ctx)?;
        let mut records = fetcher.fetch_records(collection, &[id])?;
        Ok(if records.is_empty() {
            Value::Null
        } else {
            Value::Object(records.swap_remove(0))
        })
    }

    fn extract_keywords(&self, _ctx: &FieldContext<'_>, _value: &Value) -> String {
        String::new()
    }
}

/// An ordered list of references to records of another collection.
pub struct RecordsField;

fn sanitize_record_ids(_ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    let Value::Array(items) = value else {
        return Ok(if value.is_null() { json!([]) } else { value });
    };
    let mut ids: Vec<Value> = Vec::new();
    for item in items {
        let id = as_id(&item).map(|id| json!(id)).unwrap_or(item);
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(Value::Array(ids))
}

fn validate_record_ids(_ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    match value.as_array() {
        Some(items) if items.iter().all(|v| v.as_i64().is_some_and(|id| id > 0)) => Ok(()),
        Some(_) => Err("Every item must be a record ID".into()),
        None => Err("The value must be an array".into()),
    }
}

impl FieldBehavior for RecordsField {
    fn type_name(&self) -> &'static str {
        "records"
    }

    fn option_defaults(&self) -> ResolvedOptions {
        let mut options = Map::new();
        options.insert("collection".into(), Value::Null);
        options.insert("minItems".into(), Value::Null);
        options.insert("maxItems".into(), Value::Null);
        options
    }

    fn default_value(&self, _ctx: &FieldContext<'_>) -> Value {
        json!([])
    }

    fn sanitizers(&self) -> Vec<Sanitizer> {
        vec![Sanitizer::on(Operations::WRITE, sanitize_record_ids)]
    }

    fn validators(&self) -> Vec<Validator> {
        vec![
            Validator::always(validate_record_ids),
            Validator::always(validate_item_count),
        ]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::Array
    }

    fn storage(&self) -> Storage {
        Storage::Json
    }

    fn serialize(&self, value: &Value) -> Result<Value> {
        encode_json(value)
    }

    fn deserialize(&self, raw: Value) -> Result<Value> {
        decode_json(raw, json!([]))
    }

    fn population_type(&self) -> Option<&'static str> {
        Some("records")
    }

    fn populate(&self, ctx: &FieldContext<'_>, value: &Value, fetcher: &dyn RelationFetcher) -> Result<Value> {
        let ids: Vec<i64> = value
            .as_array()
            .map(|items| items.iter().filter_map(Value::as_i64).collect())
            .unwrap_or_default();
        if ids.is_empty() {
            return Ok(json!([]));
        }
        let collection = related_collection(ctx)?;
        let fetched = fetcher.fetch_records(collection, &ids)?;

        // Keep the stored order; the fetcher may return rows in any order.
        let populated = ids
            .iter()
            .filter_map(|id| {
                fetched
                    .iter()
                    .find(|r| r.get("id").and_then(Value::as_i64) == Some(*id))
                    .cloned()
                    .map(Value::Object)
            })
            .collect();
        Ok(Value::Array(populated))
    }

    fn extract_keywords(&self, _ctx: &FieldContext<'_>, _value: &Value) -> String {
        String::new()
    }
}

// ── Composite ──────────────────────────────────────────────────────

/// A list of objects sharing one subfield layout (`options.subfields`).
pub struct RepeaterField;

fn composite_keywords(value: &Value) -> String {
    match value {
        Value::Array(items) => items
            .iter()
            .map(composite_keywords)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        Value::Object(map) => map
            .iter()
            .filter(|(k, _)| k.as_str() != "name")
            .map(|(_, v)| composite_keywords(v))
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        other => default_keywords(other),
    }
}

impl FieldBehavior for RepeaterField {
    fn type_name(&self) -> &'static str {
        "repeater"
    }

    fn option_defaults(&self) -> ResolvedOptions {
        let mut options = Map::new();
        options.insert("subfields".into(), json!({}));
        options.insert("minItems".into(), Value::Null);
        options.insert("maxItems".into(), Value::Null);
        options
    }

    fn default_value(&self, _ctx: &FieldContext<'_>) -> Value {
        json!([])
    }

    fn validators(&self) -> Vec<Validator> {
        vec![
            Validator::always(expect_array),
            Validator::always(validate_item_count),
        ]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::Array
    }

    fn storage(&self) -> Storage {
        Storage::Json
    }

    fn serialize(&self, value: &Value) -> Result<Value> {
        encode_json(value)
    }

    fn deserialize(&self, raw: Value) -> Result<Value> {
        decode_json(raw, json!([]))
    }

    fn extract_keywords(&self, _ctx: &FieldContext<'_>, value: &Value) -> String {
        composite_keywords(value)
    }
}

/// A list of `{ name, fields }` entries where `name` is an allowed block.
pub struct BlocksField;

impl FieldBehavior for BlocksField {
    fn type_name(&self) -> &'static str {
        "blocks"
    }

    fn option_defaults(&self) -> ResolvedOptions {
        let mut options = Map::new();
        options.insert("allowedBlocks".into(), Value::Null);
        options.insert("minItems".into(), Value::Null);
        options.insert("maxItems".into(), Value::Null);
        options
    }

    fn default_value(&self, _ctx: &FieldContext<'_>) -> Value {
        json!([])
    }

    fn validators(&self) -> Vec<Validator> {
        vec![
            Validator::always(expect_array),
            Validator::always(validate_item_count),
        ]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::Array
    }

    fn storage(&self) -> Storage {
        Storage::Json
    }

    fn serialize(&self, value: &Value) -> Result<Value> {
        encode_json(value)
    }

    fn deserialize(&self, raw: Value) -> Result<Value> {
        decode_json(raw, json!([]))
    }

    fn extract_keywords(&self, _ctx: &FieldContext<'_>, value: &Value) -> String {
        composite_keywords(value)
    }
}

// ── Reserved ───────────────────────────────────────────────────────

pub struct IdField;

impl FieldBehavior for IdField {
    fn type_name(&self) -> &'static str {
        "id"
    }

    fn default_value(&self, _ctx: &FieldContext<'_>) -> Value {
        Value::Null
    }

    fn validators(&self) -> Vec<Validator> {
        vec![Validator::always(expect_integer_or_null)]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::Number
    }

    fn storage(&self) -> Storage {
        Storage::Integer
    }

    fn extract_keywords(&self, _ctx: &FieldContext<'_>, _value: &Value) -> String {
        String::new()
    }
}

pub struct LanguageField;

fn sanitize_language(_ctx: &FieldContext<'_>, value: Value) -> std::result::Result<Value, String> {
    match value {
        Value::String(s) => Ok(Value::String(s.trim().to_ascii_lowercase())),
        other => Ok(other),
    }
}

fn validate_language(ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    let Some(code) = value.as_str() else {
        return Err("The value must be a string".into());
    };
    let languages = ctx.schema.languages();
    if !languages.is_supported(code) {
        return Err(format!("The language '{code}' is not supported"));
    }
    if code != languages.primary && !ctx.collection.translatable {
        return Err("The collection is not translatable".into());
    }
    Ok(())
}

impl FieldBehavior for LanguageField {
    fn type_name(&self) -> &'static str {
        "language"
    }

    fn default_value(&self, ctx: &FieldContext<'_>) -> Value {
        declared_default(ctx).unwrap_or_else(|| json!(ctx.schema.languages().primary))
    }

    fn sanitizers(&self) -> Vec<Sanitizer> {
        vec![Sanitizer::on(Operations::WRITE, sanitize_language)]
    }

    fn validators(&self) -> Vec<Validator> {
        vec![Validator::always(validate_language)]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::String
    }

    fn storage(&self) -> Storage {
        Storage::Text
    }

    fn extract_keywords(&self, _ctx: &FieldContext<'_>, _value: &Value) -> String {
        String::new()
    }
}

/// Token shared by all translations of one record.
pub struct TranslationsField;

fn validate_translations(_ctx: &FieldContext<'_>, value: &Value) -> std::result::Result<(), String> {
    match value.as_str() {
        Some(s) if !s.is_empty() => Ok(()),
        _ => Err("The value must be a non-empty string".into()),
    }
}

impl FieldBehavior for TranslationsField {
    fn type_name(&self) -> &'static str {
        "translations"
    }

    fn default_value(&self, _ctx: &FieldContext<'_>) -> Value {
        Value::String(nanoid::nanoid!())
    }

    fn validators(&self) -> Vec<Validator> {
        vec![Validator::always(validate_translations)]
    }

    fn value_kind(&self) -> ValueKind {
        ValueKind::String
    }

    fn storage(&self) -> Storage {
        Storage::Text
    }

    fn extract_keywords(&self, _ctx: &FieldContext<'_>, _value: &Value) -> String {
        String::new()
    }
}
