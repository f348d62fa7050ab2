//! Incremental-run cursor.
//!
//! A single JSON file `{"last_extraction": "<RFC3339>"}`. Read once when an
//! incremental run starts, overwritten once when it finishes cleanly.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_LOOKBACK_HOURS: i64 = 24;

#[derive(Error, Debug)]
pub enum WatermarkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed watermark file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkFile {
    last_extraction: String,
}

#[derive(Debug, Clone)]
pub struct WatermarkStore {
    path: PathBuf,
    lookback: Duration,
}

impl WatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lookback: Duration::hours(DEFAULT_LOOKBACK_HOURS),
        }
    }

    /// Window used when no watermark has been saved yet.
    pub fn with_default_lookback(mut self, lookback: Duration) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Saved watermark, or `now - lookback` when none exists.
    pub fn load(&self) -> Result<DateTime<Utc>, WatermarkError> {
        self.load_at(Utc::now())
    }

    pub fn load_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, WatermarkError> {
        match self.read()? {
            Some(ts) => Ok(ts),
            None => {
                let fallback = now - self.lookback;
                tracing::info!(
                    path = %self.path.display(),
                    since = %fallback,
                    "No watermark found, using default lookback"
                );
                Ok(fallback)
            }
        }
    }

    /// The stored value, if any. A present but unreadable file is an error.
    pub fn read(&self) -> Result<Option<DateTime<Utc>>, WatermarkError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: WatermarkFile = serde_json::from_str(&raw)?;
        let ts = DateTime::parse_from_rfc3339(&file.last_extraction).map_err(|e| {
            WatermarkError::Json(serde::de::Error::custom(format!(
                "last_extraction '{}': {}",
                file.last_extraction, e
            )))
        })?;
        Ok(Some(ts.with_timezone(&Utc)))
    }

    /// Overwrite the watermark atomically.
    pub fn save(&self, ts: DateTime<Utc>) -> Result<(), WatermarkError> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let body = serde_json::to_vec_pretty(&WatermarkFile {
            last_extraction: ts.to_rfc3339_opts(SecondsFormat::Millis, true),
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
        tmp.write_all(&body)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| WatermarkError::Io(e.error))?;

        tracing::debug!(path = %self.path.display(), watermark = %ts, "Saved watermark");
        Ok(())
    }
}
