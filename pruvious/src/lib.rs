pub mod cache;
pub mod conditional;
pub mod config;
pub mod error;
pub mod fields;
pub mod query;
pub mod query_string;
pub mod schema;
pub mod search;
pub mod store;

pub use cache::{CacheLayer, MemoryCache, QueryCache};
pub use config::EngineConfig;
pub use error::{PruviousError, Result};
pub use fields::{FieldBehavior, FieldRegistry, Operation, Record};
pub use query::{
    Engine, FieldErrors, Paginated, QueryBuilder, QueryFailure, QueryResult, SingleQueryBuilder, WhereClauses,
    WhereOperator,
};
pub use query_string::{parse_query_string, parse_raw_query, stringify_where, ParsedQueryString};
pub use schema::{Schema, SortDirection};
pub use store::{RecordStore, SqliteStore};
