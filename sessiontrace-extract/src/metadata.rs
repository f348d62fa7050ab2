//! Per-run metadata file written next to the extracted tables.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sessiontrace_core::TraceError;

use crate::orchestrator::ExtractionResult;

pub const METADATA_FILE: &str = "extraction_metadata.json";

/// What the run was asked to do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub agent_names: Vec<String>,
    #[serde(default)]
    pub session_ids: Vec<String>,
    pub skip_children: bool,
    pub append: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub parameters: RunParameters,
    pub result: ExtractionResult,
}

pub fn metadata_path(output_dir: &Path) -> PathBuf {
    output_dir.join(METADATA_FILE)
}

/// Replace the metadata file atomically.
pub fn write_metadata(output_dir: &Path, metadata: &RunMetadata) -> Result<PathBuf, TraceError> {
    fs::create_dir_all(output_dir)?;
    let path = metadata_path(output_dir);

    let body = serde_json::to_vec_pretty(metadata)?;
    let mut tmp = tempfile::NamedTempFile::new_in(output_dir)?;
    tmp.write_all(&body)?;
    tmp.persist(&path).map_err(|e| TraceError::Io(e.error))?;

    tracing::debug!(path = %path.display(), "Wrote run metadata");
    Ok(path)
}

pub fn read_metadata(output_dir: &Path) -> Result<RunMetadata, TraceError> {
    let raw = fs::read(metadata_path(output_dir))?;
    Ok(serde_json::from_slice(&raw)?)
}
