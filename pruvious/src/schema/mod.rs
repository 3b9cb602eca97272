pub mod parser;
pub mod path;
pub mod resolve;
pub mod types;

pub use parser::{parse_schema, parse_schema_str};
pub use resolve::{pluralize, resolve_block, resolve_collection, singularize, SchemaContext};
pub use types::*;

use crate::conditional::ConditionalRule;
use crate::config::EngineConfig;
use crate::error::{PruviousError, Result};
use crate::fields::{FieldBehavior, FieldRegistry, RegisteredField, ResolvedOptions, Sanitizer, Validator};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// Names that are always injected and can never be declared.
pub const RESERVED_FIELDS: [&str; 3] = ["id", "language", "translations"];

/// A field after resolution: options merged, behavior bound, nested tree built.
#[derive(Debug, Clone)]
pub struct ResolvedField {
    pub name: String,
    pub column: String,
    pub field_type: String,
    pub options: Arc<ResolvedOptions>,
    pub required: bool,
    pub immutable: bool,
    pub protected: bool,
    pub translatable: bool,
    pub unique: bool,
    pub index: bool,
    pub cacheable: bool,
    pub population: bool,
    /// Injected by the resolver (`id`, `language`, `translations`, timestamps)
    pub reserved: bool,
    pub conditional_logic: Option<ConditionalRule>,
    /// Named extras declared on the field, run after the type's own chain
    pub extra_sanitizers: Vec<Sanitizer>,
    pub extra_validators: Vec<Validator>,
    pub nested: NestedFields,
    pub registered: RegisteredField,
}

impl ResolvedField {
    pub fn behavior(&self) -> &dyn FieldBehavior {
        self.registered.behavior.as_ref()
    }

    /// Type sanitizers followed by declared extras.
    pub fn sanitizer_chain(&self) -> impl Iterator<Item = &Sanitizer> {
        self.registered.sanitizers.iter().chain(self.extra_sanitizers.iter())
    }

    /// Type validators followed by declared extras.
    pub fn validator_chain(&self) -> impl Iterator<Item = &Validator> {
        self.registered.validators.iter().chain(self.extra_validators.iter())
    }

    pub fn is_timestamp(&self) -> bool {
        self.reserved && (self.name == "createdAt" || self.name == "updatedAt")
    }
}

/// Subfield tree of a composite field.
#[derive(Debug, Clone, Default)]
pub enum NestedFields {
    #[default]
    None,
    /// Every entry of a repeater is an object with these subfields
    Repeater(Vec<ResolvedField>),
    /// Every entry is `{ name, fields }` where `name` is one of these blocks
    Blocks(Vec<String>),
}

/// A reusable block with its resolved fields.
#[derive(Debug, Clone)]
pub struct ResolvedBlock {
    pub name: String,
    pub label: String,
    pub fields: Vec<ResolvedField>,
}

impl ResolvedBlock {
    pub fn field(&self, name: &str) -> Option<&ResolvedField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pub singular: String,
    pub plural: String,
}

/// Visibility of an API route for a collection operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteVisibility {
    Public,
    Private,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearCacheRules {
    pub on_create: bool,
    pub on_update: bool,
    pub on_delete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    /// Cache a query only when it took longer than this many milliseconds
    pub cache_queries: Option<u64>,
    pub clear_cache_rules: ClearCacheRules,
}

/// A named search structure and its denormalized column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchStructure {
    pub name: String,
    pub column: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIndex {
    pub fields: Vec<String>,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardConfig {
    pub field_layout: Vec<String>,
    pub overview_columns: Vec<String>,
    pub default_sort: SortDefinition,
}

/// The canonical, read-only form of a collection schema.
#[derive(Debug, Clone)]
pub struct ResolvedCollection {
    pub name: String,
    pub table: String,
    pub mode: CollectionMode,
    pub labels: Labels,
    pub translatable: bool,
    pub fields: Vec<ResolvedField>,
    pub api_routes: Vec<(String, RouteVisibility)>,
    pub cache: CachePolicy,
    pub search: Vec<SearchStructure>,
    pub indexes: Vec<ResolvedIndex>,
    pub duplicate: bool,
    pub mirror_translation: bool,
    pub dashboard: DashboardConfig,
    pub(crate) field_index: HashMap<String, usize>,
}

impl ResolvedCollection {
    pub fn field(&self, name: &str) -> Option<&ResolvedField> {
        self.field_index.get(name).map(|&i| &self.fields[i])
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_index.contains_key(name)
    }

    pub fn is_multi(&self) -> bool {
        self.mode == CollectionMode::Multi
    }

    pub fn has_timestamps(&self) -> bool {
        self.has_field("createdAt")
    }

    pub fn search_structure(&self, name: &str) -> Option<&SearchStructure> {
        self.search.iter().find(|s| s.name == name)
    }

    pub fn route(&self, operation: &str) -> RouteVisibility {
        self.api_routes
            .iter()
            .find(|(op, _)| op == operation)
            .map(|(_, v)| *v)
            .unwrap_or(RouteVisibility::Disabled)
    }

    /// Fields that callers may write: everything except reserved ids and timestamps.
    pub fn writable_fields(&self) -> impl Iterator<Item = &ResolvedField> {
        self.fields.iter().filter(|f| f.name != "id" && !f.is_timestamp())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Languages {
    pub primary: String,
    pub supported: Vec<String>,
}

impl Languages {
    pub fn is_supported(&self, code: &str) -> bool {
        self.supported.iter().any(|l| l == code)
    }
}

/// Collections, blocks, and the field registry, resolved once at startup and
/// shared read-only by everything that processes records.
#[derive(Debug)]
pub struct Schema {
    languages: Languages,
    collections: BTreeMap<String, ResolvedCollection>,
    blocks: BTreeMap<String, ResolvedBlock>,
    registry: FieldRegistry,
    config: EngineConfig,
}

impl Schema {
    /// Resolve a parsed schema definition with the given field registry.
    pub fn from_definition(
        definition: &SchemaDefinition,
        registry: FieldRegistry,
        config: EngineConfig,
    ) -> Result<Self> {
        let mut supported = definition.languages.supported.clone();
        if !supported.contains(&definition.languages.primary) {
            supported.insert(0, definition.languages.primary.clone());
        }
        let languages = Languages {
            primary: definition.languages.primary.clone(),
            supported,
        };

        let block_names: HashSet<String> = definition.blocks.keys().cloned().collect();
        let ctx = SchemaContext {
            registry: &registry,
            languages: &languages,
            block_names: &block_names,
            config: &config,
        };

        let mut blocks = BTreeMap::new();
        for (name, block) in definition.blocks.iter() {
            blocks.insert(name.clone(), resolve_block(name, block, &ctx)?);
        }

        let mut collections = BTreeMap::new();
        for (name, collection) in definition.collections.iter() {
            collections.insert(name.clone(), resolve_collection(name, collection, &ctx)?);
        }

        for collection in collections.values() {
            check_relations(&collection.name, &collection.fields, &collections)?;
        }
        for block in blocks.values() {
            check_relations(&block.name, &block.fields, &collections)?;
        }

        Ok(Schema {
            languages,
            collections,
            blocks,
            registry,
            config,
        })
    }

    /// Parse and resolve a YAML schema string with the built-in field types.
    pub fn from_yaml(content: &str, config: EngineConfig) -> Result<Self> {
        let definition = parse_schema_str(content)?;
        Self::from_definition(&definition, FieldRegistry::with_builtins(), config)
    }

    /// Parse and resolve a YAML schema file with the built-in field types.
    pub fn load(path: &Path, config: EngineConfig) -> Result<Self> {
        let definition = parse_schema(path)?;
        Self::from_definition(&definition, FieldRegistry::with_builtins(), config)
    }

    pub fn collection(&self, name: &str) -> Result<&ResolvedCollection> {
        self.collections
            .get(name)
            .ok_or_else(|| PruviousError::UnknownCollection(name.to_string()))
    }

    pub fn collections(&self) -> impl Iterator<Item = &ResolvedCollection> {
        self.collections.values()
    }

    pub fn block(&self, name: &str) -> Option<&ResolvedBlock> {
        self.blocks.get(name)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &ResolvedBlock> {
        self.blocks.values()
    }

    pub fn registry(&self) -> &FieldRegistry {
        &self.registry
    }

    pub fn languages(&self) -> &Languages {
        &self.languages
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Every `record`/`records` field must point at a known collection.
fn check_relations(
    owner: &str,
    fields: &[ResolvedField],
    collections: &BTreeMap<String, ResolvedCollection>,
) -> Result<()> {
    for field in fields {
        if field.registered.behavior.population_type().is_some() {
            match field.options.get("collection").and_then(|v| v.as_str()) {
                Some(target) if collections.contains_key(target) => {}
                Some(target) => {
                    return Err(PruviousError::Schema(format!(
                        "'{owner}': field '{}' relates to unknown collection '{target}'",
                        field.name
                    )))
                }
                None => {
                    return Err(PruviousError::Schema(format!(
                        "'{owner}': field '{}' must declare options.collection",
                        field.name
                    )))
                }
            }
        }
        if let NestedFields::Repeater(subfields) = &field.nested {
            check_relations(owner, subfields, collections)?;
        }
    }
    Ok(())
}
