use thiserror::Error;

use crate::columnar::WriteError;
use crate::models::DecodeError;
use crate::query::QueryError;
use crate::watermark::WatermarkError;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Query failed: {0}")]
    Query(#[from] QueryError),

    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Write failed: {0}")]
    Write(#[from] WriteError),

    #[error("Watermark error: {0}")]
    Watermark(#[from] WatermarkError),

    #[error("Other error: {0}")]
    Other(String),
}
