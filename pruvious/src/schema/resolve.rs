//! Collection definition resolver.
//!
//! Turns the raw YAML definitions into [`ResolvedCollection`]s: reserved and
//! timestamp fields are injected, field options are resolved once, labels,
//! dashboard metadata, routes, cache policy, search structures and indexes
//! get their defaults. Resolution is pure and never touches the store.

use super::types::*;
use super::{
    CachePolicy, ClearCacheRules, DashboardConfig, Labels, Languages, NestedFields,
    ResolvedBlock, ResolvedCollection, ResolvedField, ResolvedIndex, RouteVisibility,
    SearchStructure, RESERVED_FIELDS,
};
use crate::conditional::ConditionalRule;
use crate::config::EngineConfig;
use crate::error::{PruviousError, Result};
use crate::fields::FieldRegistry;
use heck::{ToSnakeCase, ToTitleCase};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Default `cacheQueries` threshold in milliseconds.
pub const DEFAULT_CACHE_THRESHOLD_MS: u64 = 10;

const MULTI_ROUTES: [&str; 8] = [
    "create",
    "createMany",
    "read",
    "readMany",
    "update",
    "updateMany",
    "delete",
    "deleteMany",
];
const SINGLE_ROUTES: [&str; 2] = ["read", "update"];

/// Shared inputs for resolving every collection and block of a schema.
pub struct SchemaContext<'a> {
    pub registry: &'a FieldRegistry,
    pub languages: &'a Languages,
    pub block_names: &'a HashSet<String>,
    pub config: &'a EngineConfig,
}

/// Resolve a raw collection definition.
pub fn resolve_collection(
    name: &str,
    def: &CollectionDefinition,
    ctx: &SchemaContext<'_>,
) -> Result<ResolvedCollection> {
    let multi = def.mode == CollectionMode::Multi;
    let timestamps = def.timestamps.unwrap_or(true);

    for field_name in def.fields.keys() {
        if RESERVED_FIELDS.contains(&field_name.as_str()) {
            return Err(PruviousError::Schema(format!(
                "Collection '{name}': the field name '{field_name}' is reserved"
            )));
        }
        if timestamps && (field_name == "createdAt" || field_name == "updatedAt") {
            return Err(PruviousError::Schema(format!(
                "Collection '{name}': the field name '{field_name}' is used by timestamps"
            )));
        }
    }

    // ── Fields ─────────────────────────────────────────────────────

    let mut fields = vec![reserved_field(ctx, "id", "id", Map::new(), true)?];
    let custom = resolve_fields(name, &def.fields, ctx)?;
    let custom_names: Vec<String> = custom.iter().map(|f| f.name.clone()).collect();
    fields.extend(custom);

    let mut language_options = Map::new();
    language_options.insert("default".into(), json!(ctx.languages.primary));
    fields.push(reserved_field(ctx, "language", "language", language_options, false)?);

    if multi {
        let mut translations = reserved_field(ctx, "translations", "translations", Map::new(), false)?;
        translations.index = true;
        fields.push(translations);
    }

    if timestamps {
        fields.push(reserved_field(ctx, "createdAt", "date-time", Map::new(), true)?);
        fields.push(reserved_field(ctx, "updatedAt", "date-time", Map::new(), false)?);
    }

    let field_index: HashMap<String, usize> = fields
        .iter()
        .enumerate()
        .map(|(i, f)| (f.name.clone(), i))
        .collect();

    let known = |field: &str| field_index.contains_key(field);

    // ── Search structures ──────────────────────────────────────────

    if !multi && !def.search.is_empty() {
        return Err(PruviousError::Schema(format!(
            "Collection '{name}': search structures require a multi-entry collection"
        )));
    }
    let mut search = Vec::new();
    for (structure, entries) in def.search.iter() {
        for entry in entries {
            if !known(&entry.field) {
                return Err(PruviousError::Schema(format!(
                    "Collection '{name}': search structure '{structure}' references unknown field '{}'",
                    entry.field
                )));
            }
        }
        search.push(SearchStructure {
            name: structure.clone(),
            column: format!("_search_{}", structure.to_snake_case()),
            fields: entries.iter().map(|e| e.field.clone()).collect(),
        });
    }

    // ── Indexes ────────────────────────────────────────────────────

    let mut indexes = Vec::new();
    for field in fields.iter().filter(|f| !f.reserved) {
        if field.unique || field.index {
            indexes.push(ResolvedIndex {
                fields: vec![field.name.clone()],
                unique: field.unique,
            });
        }
    }
    for index in &def.indexes {
        if index.fields.is_empty() {
            return Err(PruviousError::Schema(format!(
                "Collection '{name}': an index must list at least one field"
            )));
        }
        if let Some(unknown) = index.fields.iter().find(|f| !known(f)) {
            return Err(PruviousError::Schema(format!(
                "Collection '{name}': index references unknown field '{unknown}'"
            )));
        }
        indexes.push(ResolvedIndex {
            fields: index.fields.clone(),
            unique: index.unique,
        });
    }
    if multi {
        indexes.push(ResolvedIndex {
            fields: vec!["translations".into(), "language".into()],
            unique: true,
        });
    }

    let dashboard = resolve_dashboard(name, def, &custom_names, &fields, timestamps, ctx, &known)?;

    Ok(ResolvedCollection {
        name: name.to_string(),
        table: name.to_snake_case(),
        mode: def.mode,
        labels: resolve_labels(name, def),
        translatable: def.translatable,
        api_routes: resolve_routes(name, def)?,
        cache: resolve_cache_policy(def),
        search,
        indexes,
        duplicate: def.duplicate.unwrap_or(multi),
        mirror_translation: def.mirror_translation && def.translatable,
        dashboard,
        fields,
        field_index,
    })
}

/// Resolve a reusable block definition.
pub fn resolve_block(
    name: &str,
    def: &BlockDefinition,
    ctx: &SchemaContext<'_>,
) -> Result<ResolvedBlock> {
    let owner = format!("block '{name}'");
    Ok(ResolvedBlock {
        name: name.to_string(),
        label: def.label.clone().unwrap_or_else(|| name.to_title_case()),
        fields: resolve_fields(&owner, &def.fields, ctx)?,
    })
}

// ── Fields ─────────────────────────────────────────────────────────

fn resolve_fields(
    owner: &str,
    declarations: &OrderedMap<FieldDeclaration>,
    ctx: &SchemaContext<'_>,
) -> Result<Vec<ResolvedField>> {
    let mut fields = Vec::new();
    for (name, declaration) in declarations.iter() {
        if let Some(field) = resolve_field(owner, name, declaration, ctx)? {
            fields.push(field);
        }
    }
    Ok(fields)
}

fn resolve_field(
    owner: &str,
    name: &str,
    declaration: &FieldDeclaration,
    ctx: &SchemaContext<'_>,
) -> Result<Option<ResolvedField>> {
    let Some(registered) = ctx.registry.get(&declaration.field_type) else {
        log::warn!(
            "{owner}: field '{name}' has unregistered type '{}' and is ignored",
            declaration.field_type
        );
        return Ok(None);
    };

    let options = ctx
        .registry
        .resolve_options(&declaration.field_type, name, &declaration.options)
        .unwrap_or_default();

    let nested = match declaration.field_type.as_str() {
        "repeater" => {
            let subfields: OrderedMap<FieldDeclaration> = match options.get("subfields") {
                Some(raw) if !raw.is_null() => serde_json::from_value(raw.clone())?,
                _ => OrderedMap::new(),
            };
            let nested_owner = format!("{owner} > {name}");
            NestedFields::Repeater(resolve_fields(&nested_owner, &subfields, ctx)?)
        }
        "blocks" => {
            let allowed = match options.get("allowedBlocks").and_then(Value::as_array) {
                Some(list) => list
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>(),
                None => {
                    let mut all: Vec<String> = ctx.block_names.iter().cloned().collect();
                    all.sort();
                    all
                }
            };
            if let Some(unknown) = allowed.iter().find(|b| !ctx.block_names.contains(*b)) {
                return Err(PruviousError::Schema(format!(
                    "{owner}: field '{name}' allows unknown block '{unknown}'"
                )));
            }
            NestedFields::Blocks(allowed)
        }
        _ => NestedFields::None,
    };

    let conditional_logic = declaration
        .conditional_logic
        .as_ref()
        .map(ConditionalRule::parse)
        .transpose()
        .map_err(|e| PruviousError::Schema(format!("{owner}: field '{name}': {e}")))?;

    let mut extra_sanitizers = Vec::new();
    for sanitizer in &declaration.sanitizers {
        extra_sanitizers.push(ctx.registry.extra_sanitizer(sanitizer).ok_or_else(|| {
            PruviousError::Schema(format!("{owner}: field '{name}' uses unknown sanitizer '{sanitizer}'"))
        })?);
    }
    let mut extra_validators = Vec::new();
    for validator in &declaration.validators {
        extra_validators.push(ctx.registry.extra_validator(validator).ok_or_else(|| {
            PruviousError::Schema(format!("{owner}: field '{name}' uses unknown validator '{validator}'"))
        })?);
    }

    Ok(Some(ResolvedField {
        name: name.to_string(),
        column: name.to_snake_case(),
        field_type: declaration.field_type.clone(),
        options: Arc::new(options),
        required: declaration.required,
        immutable: declaration.immutable,
        protected: declaration.protected,
        translatable: declaration.translatable.unwrap_or(true),
        unique: declaration.unique,
        index: declaration.index,
        cacheable: declaration.cacheable.unwrap_or(true),
        population: declaration.population.unwrap_or(true),
        reserved: false,
        conditional_logic,
        extra_sanitizers,
        extra_validators,
        nested,
        registered: registered.clone(),
    }))
}

fn reserved_field(
    ctx: &SchemaContext<'_>,
    name: &str,
    field_type: &str,
    raw_options: Map<String, Value>,
    immutable: bool,
) -> Result<ResolvedField> {
    let registered = ctx.registry.get(field_type).ok_or_else(|| {
        PruviousError::Schema(format!("The field type '{field_type}' required by '{name}' is not registered"))
    })?;
    let options = ctx
        .registry
        .resolve_options(field_type, name, &raw_options)
        .unwrap_or_default();

    Ok(ResolvedField {
        name: name.to_string(),
        column: name.to_snake_case(),
        field_type: field_type.to_string(),
        options: Arc::new(options),
        required: false,
        immutable,
        protected: false,
        translatable: false,
        unique: false,
        index: false,
        cacheable: true,
        population: false,
        reserved: true,
        conditional_logic: None,
        extra_sanitizers: Vec::new(),
        extra_validators: Vec::new(),
        nested: NestedFields::None,
        registered: registered.clone(),
    })
}

// ── Labels ─────────────────────────────────────────────────────────

fn resolve_labels(name: &str, def: &CollectionDefinition) -> Labels {
    let title = name.to_title_case();
    let (singular, plural) = match def.mode {
        CollectionMode::Multi => {
            let singular = singularize(&title);
            let plural = pluralize(&singular);
            (singular, plural)
        }
        CollectionMode::Single => (title.clone(), title),
    };

    let label = def.label.clone().unwrap_or_default();
    Labels {
        singular: label.singular.unwrap_or(singular),
        plural: label.plural.unwrap_or(plural),
    }
}

/// Naive English plural of a word.
pub fn pluralize(word: &str) -> String {
    let lower = word.to_ascii_lowercase();
    if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") && !lower.ends_with("oy") {
        format!("{}ies", &word[..word.len() - 1])
    } else if ["s", "x", "z", "ch", "sh"].iter().any(|s| lower.ends_with(s)) {
        format!("{word}es")
    } else {
        format!("{word}s")
    }
}

/// Naive English singular of a word. Words that do not look plural are kept.
pub fn singularize(word: &str) -> String {
    let lower = word.to_ascii_lowercase();
    if lower.ends_with("ies") && word.len() > 3 {
        format!("{}y", &word[..word.len() - 3])
    } else if ["ses", "xes", "zes", "ches", "shes"].iter().any(|s| lower.ends_with(s)) {
        word[..word.len() - 2].to_string()
    } else if lower.ends_with('s') && !lower.ends_with("ss") && word.len() > 1 {
        word[..word.len() - 1].to_string()
    } else {
        word.to_string()
    }
}

// ── Routes and cache ───────────────────────────────────────────────

fn resolve_routes(name: &str, def: &CollectionDefinition) -> Result<Vec<(String, RouteVisibility)>> {
    let operations: &[&str] = match def.mode {
        CollectionMode::Multi => &MULTI_ROUTES,
        CollectionMode::Single => &SINGLE_ROUTES,
    };

    for operation in def.api_routes.keys() {
        if !operations.contains(&operation.as_str()) {
            return Err(PruviousError::Schema(format!(
                "Collection '{name}': unknown API route '{operation}'"
            )));
        }
    }

    operations
        .iter()
        .map(|operation| {
            let visibility = match def.api_routes.get(operation) {
                None | Some(RouteSetting::Flag(true)) => RouteVisibility::Private,
                Some(RouteSetting::Flag(false)) => RouteVisibility::Disabled,
                Some(RouteSetting::Visibility(v)) => match v.as_str() {
                    "public" => RouteVisibility::Public,
                    "private" => RouteVisibility::Private,
                    other => {
                        return Err(PruviousError::Schema(format!(
                            "Collection '{name}': invalid visibility '{other}' for route '{operation}'"
                        )))
                    }
                },
            };
            Ok((operation.to_string(), visibility))
        })
        .collect()
}

fn resolve_cache_policy(def: &CollectionDefinition) -> CachePolicy {
    let cache_queries = match def.cache_queries {
        None | Some(CacheQueriesSetting::Enabled(true)) => Some(DEFAULT_CACHE_THRESHOLD_MS),
        Some(CacheQueriesSetting::Enabled(false)) => None,
        Some(CacheQueriesSetting::Threshold(ms)) => Some(ms),
    };

    let clear_cache_rules = match def.clear_cache_rules {
        None => ClearCacheRules { on_create: true, on_update: true, on_delete: true },
        Some(ClearCacheRulesSetting::Enabled(all)) => ClearCacheRules {
            on_create: all,
            on_update: all,
            on_delete: all,
        },
        Some(ClearCacheRulesSetting::Rules(rules)) => ClearCacheRules {
            on_create: rules.on_create.unwrap_or(true),
            on_update: rules.on_update.unwrap_or(true),
            on_delete: rules.on_delete.unwrap_or(true),
        },
    };

    CachePolicy { cache_queries, clear_cache_rules }
}

// ── Dashboard ──────────────────────────────────────────────────────

fn resolve_dashboard(
    name: &str,
    def: &CollectionDefinition,
    custom_names: &[String],
    fields: &[ResolvedField],
    timestamps: bool,
    ctx: &SchemaContext<'_>,
    known: &dyn Fn(&str) -> bool,
) -> Result<DashboardConfig> {
    let raw = def.dashboard.clone().unwrap_or_default();

    let check = |list: &[String], what: &str| -> Result<()> {
        match list.iter().find(|f| !known(f)) {
            Some(unknown) => Err(PruviousError::Schema(format!(
                "Collection '{name}': dashboard {what} references unknown field '{unknown}'"
            ))),
            None => Ok(()),
        }
    };

    let field_layout = match raw.field_layout {
        Some(layout) => {
            check(&layout, "field layout")?;
            layout
        }
        None => fields
            .iter()
            .filter(|f| !f.reserved && !f.protected)
            .map(|f| f.name.clone())
            .collect(),
    };

    let overview_columns = match raw.overview_columns {
        Some(columns) => {
            check(&columns, "overview columns")?;
            columns
        }
        None => {
            let mut columns: Vec<String> = custom_names
                .iter()
                .take(ctx.config.overview_columns)
                .cloned()
                .collect();
            if timestamps {
                columns.push("createdAt".into());
                columns.push("updatedAt".into());
            }
            columns
        }
    };

    let default_sort = match raw.default_sort {
        Some(sort) => {
            check(std::slice::from_ref(&sort.field), "default sort")?;
            sort
        }
        None if timestamps => SortDefinition {
            field: "createdAt".into(),
            direction: SortDirection::Desc,
        },
        None => SortDefinition {
            field: custom_names.first().cloned().unwrap_or_else(|| "id".into()),
            direction: SortDirection::Asc,
        },
    };

    Ok(DashboardConfig {
        field_layout,
        overview_columns,
        default_sort,
    })
}
