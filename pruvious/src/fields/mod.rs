//! Field type registry.
//!
//! Every field type implements [`FieldBehavior`]. The registry maps type names
//! to implementations and is built once, then shared read-only through the
//! [`Schema`](crate::schema::Schema).

pub mod builtin;
pub mod extras;
pub mod pipeline;

use crate::conditional::ConditionalRule;
use crate::error::Result;
use crate::schema::path::FieldPath;
use crate::schema::{ResolvedCollection, ResolvedField, Schema};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A record: resolved field name → value.
pub type Record = Map<String, Value>;

/// Field options after merging the type's defaults with the declared options.
pub type ResolvedOptions = Map<String, Value>;

/// The operation a field value is flowing through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Create,
    Read,
    Update,
}

/// The set of operations a sanitizer or validator applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operations {
    pub on_create: bool,
    pub on_read: bool,
    pub on_update: bool,
}

impl Operations {
    pub const ALL: Operations = Operations { on_create: true, on_read: true, on_update: true };
    pub const WRITE: Operations = Operations { on_create: true, on_read: false, on_update: true };
    pub const CREATE: Operations = Operations { on_create: true, on_read: false, on_update: false };
    pub const UPDATE: Operations = Operations { on_create: false, on_read: false, on_update: true };
    pub const READ: Operations = Operations { on_create: false, on_read: true, on_update: false };

    pub fn applies_to(&self, operation: Operation) -> bool {
        match operation {
            Operation::Create => self.on_create,
            Operation::Read => self.on_read,
            Operation::Update => self.on_update,
        }
    }
}

pub type SanitizeFn = fn(&FieldContext<'_>, Value) -> std::result::Result<Value, String>;
pub type ValidateFn = fn(&FieldContext<'_>, &Value) -> std::result::Result<(), String>;

/// One stage of a field's sanitizer chain.
#[derive(Clone, Copy)]
pub struct Sanitizer {
    pub operations: Operations,
    pub run: SanitizeFn,
}

impl Sanitizer {
    pub const fn always(run: SanitizeFn) -> Self {
        Sanitizer { operations: Operations::ALL, run }
    }

    pub const fn on(operations: Operations, run: SanitizeFn) -> Self {
        Sanitizer { operations, run }
    }
}

impl fmt::Debug for Sanitizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sanitizer").field("operations", &self.operations).finish()
    }
}

/// One stage of a field's validator chain.
#[derive(Clone, Copy)]
pub struct Validator {
    pub operations: Operations,
    pub run: ValidateFn,
}

impl Validator {
    pub const fn always(run: ValidateFn) -> Self {
        Validator { operations: Operations::ALL, run }
    }

    pub const fn on(operations: Operations, run: ValidateFn) -> Self {
        Validator { operations, run }
    }
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Validator").field("operations", &self.operations).finish()
    }
}

/// The JSON shape a field's casted value takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
}

/// How a field is laid out in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Text,
    Integer,
    Real,
    Boolean,
    /// JSON-encoded text
    Json,
}

impl Storage {
    pub fn sql_type(&self) -> &'static str {
        match self {
            Storage::Text | Storage::Json => "TEXT",
            Storage::Integer | Storage::Boolean => "INTEGER",
            Storage::Real => "REAL",
        }
    }
}

/// Everything a field behavior may look at while processing a value.
pub struct FieldContext<'a> {
    pub schema: &'a Schema,
    pub collection: &'a ResolvedCollection,
    pub field: &'a ResolvedField,
    pub path: &'a FieldPath,
    pub operation: Operation,
    /// The whole candidate record the value belongs to
    pub input: &'a Value,
    pub language: &'a str,
}

impl<'a> FieldContext<'a> {
    pub fn options(&self) -> &ResolvedOptions {
        &self.field.options
    }

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.field.options.get(key).filter(|v| !v.is_null())
    }

    pub fn option_f64(&self, key: &str) -> Option<f64> {
        self.option(key).and_then(Value::as_f64)
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.option(key).and_then(Value::as_u64)
    }

    pub fn option_bool(&self, key: &str) -> bool {
        self.option(key).and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.option(key).and_then(Value::as_str)
    }

    /// A context for a nested field that shares everything but the field and path.
    pub fn nested(&self, field: &'a ResolvedField, path: &'a FieldPath) -> FieldContext<'a> {
        FieldContext {
            schema: self.schema,
            collection: self.collection,
            field,
            path,
            operation: self.operation,
            input: self.input,
            language: self.language,
        }
    }
}

/// Loads related records during population.
pub trait RelationFetcher {
    /// Fetch records of `collection` with the given ids. Missing ids are skipped.
    fn fetch_records(&self, collection: &str, ids: &[i64]) -> Result<Vec<Record>>;
}

/// The behavior attached to a field type name.
pub trait FieldBehavior: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Per-option defaults merged under the declared options.
    fn option_defaults(&self) -> ResolvedOptions {
        Map::new()
    }

    /// Value used when no input is given, and as the read-time fallback.
    fn default_value(&self, ctx: &FieldContext<'_>) -> Value;

    fn sanitizers(&self) -> Vec<Sanitizer> {
        Vec::new()
    }

    fn validators(&self) -> Vec<Validator> {
        Vec::new()
    }

    fn value_kind(&self) -> ValueKind;

    fn storage(&self) -> Storage;

    /// Convert a casted value into its storage form.
    fn serialize(&self, value: &Value) -> Result<Value> {
        Ok(value.clone())
    }

    /// Convert a storage value back into the casted form.
    fn deserialize(&self, raw: Value) -> Result<Value> {
        Ok(raw)
    }

    /// Name of the populated value type, if this field populates.
    fn population_type(&self) -> Option<&'static str> {
        None
    }

    fn populate(
        &self,
        _ctx: &FieldContext<'_>,
        value: &Value,
        _fetcher: &dyn RelationFetcher,
    ) -> Result<Value> {
        Ok(value.clone())
    }

    fn extract_keywords(&self, _ctx: &FieldContext<'_>, value: &Value) -> String {
        default_keywords(value)
    }

    fn matches_conditional_logic(
        &self,
        ctx: &FieldContext<'_>,
        rule: &ConditionalRule,
    ) -> Result<bool> {
        rule.evaluate(ctx.input, ctx.path)
    }

    /// Whether a value counts as "not provided" for `required` checks.
    fn is_empty(&self, value: &Value) -> bool {
        match value {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(items) => items.is_empty(),
            _ => false,
        }
    }
}

/// A registered field type with its sanitizer and validator chains built once.
#[derive(Clone)]
pub struct RegisteredField {
    pub behavior: Arc<dyn FieldBehavior>,
    pub sanitizers: Vec<Sanitizer>,
    pub validators: Vec<Validator>,
}

impl fmt::Debug for RegisteredField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredField")
            .field("type", &self.behavior.type_name())
            .field("sanitizers", &self.sanitizers.len())
            .field("validators", &self.validators.len())
            .finish()
    }
}

/// Map from field type name to its behavior, plus the named extra
/// sanitizers/validators a declaration can opt into.
#[derive(Debug, Clone, Default)]
pub struct FieldRegistry {
    types: HashMap<String, RegisteredField>,
    extra_sanitizers: HashMap<String, Sanitizer>,
    extra_validators: HashMap<String, Validator>,
}

impl FieldRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in field type and extra.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        extras::register_extras(&mut registry);
        registry
    }

    pub fn register(&mut self, behavior: impl FieldBehavior + 'static) {
        let behavior: Arc<dyn FieldBehavior> = Arc::new(behavior);
        let entry = RegisteredField {
            sanitizers: behavior.sanitizers(),
            validators: behavior.validators(),
            behavior,
        };
        self.types.insert(entry.behavior.type_name().to_string(), entry);
    }

    pub fn register_sanitizer(&mut self, name: &str, sanitizer: Sanitizer) {
        self.extra_sanitizers.insert(name.to_string(), sanitizer);
    }

    pub fn register_validator(&mut self, name: &str, validator: Validator) {
        self.extra_validators.insert(name.to_string(), validator);
    }

    pub fn get(&self, type_name: &str) -> Option<&RegisteredField> {
        self.types.get(type_name)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.contains_key(type_name)
    }

    pub fn extra_sanitizer(&self, name: &str) -> Option<Sanitizer> {
        self.extra_sanitizers.get(name).copied()
    }

    pub fn extra_validator(&self, name: &str) -> Option<Validator> {
        self.extra_validators.get(name).copied()
    }

    /// Merge declared options over the type's option defaults.
    ///
    /// Returns `None` when the type is not registered.
    pub fn resolve_options(
        &self,
        type_name: &str,
        field_name: &str,
        raw: &Map<String, Value>,
    ) -> Option<ResolvedOptions> {
        let registered = self.get(type_name)?;
        let mut options = registered.behavior.option_defaults();
        for (key, value) in raw {
            options.insert(key.clone(), value.clone());
        }
        log::debug!("Resolved options for field '{field_name}' ({type_name})");
        Some(options)
    }
}

/// Keywords for plain values: strings as-is, numbers as text, string lists joined.
pub fn default_keywords(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(default_keywords)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
        _ => String::new(),
    }
}
