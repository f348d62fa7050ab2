pub mod auth;
pub mod columnar;
pub mod config;
pub mod error;
pub mod models;
pub mod query;
pub mod schema;
pub mod watermark;

pub use auth::{EnvTokenProvider, StaticTokenProvider, TokenProvider};
pub use columnar::{
    read_records, read_string_column, read_table, write_records, BufferedTable, WriteError,
    WriteOptions,
};
pub use config::{ApiConfig, AuthConfig, ExtractConfig, SessionTraceConfig};
pub use error::TraceError;
pub use models::{
    decode_records, Entity, EntityKind, EntityRow, Interaction, Message, Session, Step,
};
pub use query::{QueryError, QueryExecutor, QueryRun, QueryRunStats};
pub use schema::{ColumnType, Record, TableSchema};
pub use watermark::{WatermarkError, WatermarkStore};
