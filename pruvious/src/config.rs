use serde::{Deserialize, Serialize};

/// Engine-wide settings that are not part of any collection schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// How many relation hops population follows before returning casted ids
    pub population_depth: usize,
    /// Number of custom fields shown as dashboard overview columns
    pub overview_columns: usize,
    /// Rebuild search keywords on the background worker instead of inline
    pub reindex_in_background: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            population_depth: 2,
            overview_columns: 3,
            reindex_in_background: true,
        }
    }
}

impl EngineConfig {
    /// Parse engine settings from YAML. Missing keys keep their defaults.
    pub fn from_yaml(content: &str) -> crate::Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_yaml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.population_depth, 2);
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_yaml("populationDepth: 5").unwrap();
        assert_eq!(config.population_depth, 5);
        assert_eq!(config.overview_columns, 3);
        assert!(config.reindex_in_background);
    }
}
