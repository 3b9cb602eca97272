use serde::de::{Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;

/// Top-level schema definition parsed from a YAML schema file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDefinition {
    #[serde(default)]
    pub languages: LanguagesDefinition,
    #[serde(default)]
    pub collections: OrderedMap<CollectionDefinition>,
    #[serde(default)]
    pub blocks: OrderedMap<BlockDefinition>,
}

/// Languages configured for translatable content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguagesDefinition {
    #[serde(default = "default_primary_language")]
    pub primary: String,
    #[serde(default)]
    pub supported: Vec<String>,
}

impl Default for LanguagesDefinition {
    fn default() -> Self {
        LanguagesDefinition {
            primary: default_primary_language(),
            supported: Vec::new(),
        }
    }
}

fn default_primary_language() -> String {
    "en".to_string()
}

/// Definition of a single collection, as written by the schema author
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionDefinition {
    #[serde(default)]
    pub mode: CollectionMode,
    #[serde(default)]
    pub label: Option<LabelDefinition>,
    #[serde(default)]
    pub translatable: bool,
    #[serde(default)]
    pub timestamps: Option<bool>,
    #[serde(default)]
    pub fields: OrderedMap<FieldDeclaration>,
    #[serde(default)]
    pub search: OrderedMap<Vec<SearchEntryDefinition>>,
    #[serde(default)]
    pub cache_queries: Option<CacheQueriesSetting>,
    #[serde(default)]
    pub clear_cache_rules: Option<ClearCacheRulesSetting>,
    #[serde(default)]
    pub api_routes: OrderedMap<RouteSetting>,
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    #[serde(default)]
    pub duplicate: Option<bool>,
    #[serde(default)]
    pub mirror_translation: bool,
    #[serde(default)]
    pub dashboard: Option<DashboardDefinition>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    #[default]
    Multi,
    Single,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelDefinition {
    #[serde(default)]
    pub singular: Option<String>,
    #[serde(default)]
    pub plural: Option<String>,
}

/// `cacheQueries: 10` or `cacheQueries: false`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CacheQueriesSetting {
    Enabled(bool),
    Threshold(u64),
}

/// `clearCacheRules: false` or `clearCacheRules: { onCreate: true, ... }`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClearCacheRulesSetting {
    Enabled(bool),
    Rules(ClearCacheRulesDefinition),
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearCacheRulesDefinition {
    #[serde(default)]
    pub on_create: Option<bool>,
    #[serde(default)]
    pub on_update: Option<bool>,
    #[serde(default)]
    pub on_delete: Option<bool>,
}

/// `read: public`, `delete: false`, `create: true`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteSetting {
    Flag(bool),
    Visibility(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub fields: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

/// One entry in a search structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchEntryDefinition {
    pub field: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardDefinition {
    #[serde(default)]
    pub field_layout: Option<Vec<String>>,
    #[serde(default)]
    pub overview_columns: Option<Vec<String>>,
    #[serde(default)]
    pub default_sort: Option<SortDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortDefinition {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Some(SortDirection::Asc),
            "desc" => Some(SortDirection::Desc),
            _ => None,
        }
    }
}

/// Definition of a single field in a collection, repeater, or block
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDeclaration {
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub immutable: bool,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub translatable: Option<bool>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub conditional_logic: Option<serde_json::Value>,
    #[serde(default)]
    pub validators: Vec<String>,
    #[serde(default)]
    pub sanitizers: Vec<String>,
    #[serde(default)]
    pub population: Option<bool>,
    #[serde(default)]
    pub index: bool,
    #[serde(default)]
    pub cacheable: Option<bool>,
}

/// A reusable block used by `blocks` fields
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockDefinition {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub fields: OrderedMap<FieldDeclaration>,
}

/// A string-keyed map that keeps the declaration order of the YAML source.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedMap<T>(pub Vec<(String, T)>);

impl<T> Default for OrderedMap<T> {
    fn default() -> Self {
        OrderedMap(Vec::new())
    }
}

impl<T> OrderedMap<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&T> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Insert or replace, keeping the original position of an existing key.
    pub fn insert(&mut self, key: impl Into<String>, value: T) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.0.iter().map(|(k, v)| (k, v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.iter().map(|(k, _)| k)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T: Serialize> Serialize for OrderedMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OrderedMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedMapVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for OrderedMapVisitor<T> {
            type Value = OrderedMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(OrderedMap::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((key, value)) = access.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(OrderedMap(entries))
            }
        }

        deserializer.deserialize_any(OrderedMapVisitor(PhantomData))
    }
}
