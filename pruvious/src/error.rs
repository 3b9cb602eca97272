use thiserror::Error;

#[derive(Error, Debug)]
pub enum PruviousError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Collection '{0}' does not exist")]
    UnknownCollection(String),

    #[error("The field '{field}' does not exist in collection '{collection}'")]
    UnknownField { collection: String, field: String },

    #[error("{0}")]
    ConditionalLogic(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("SQL parse error: {0}")]
    SqlParse(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, PruviousError>;
