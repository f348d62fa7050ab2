//! Extraction orchestrator
//!
//! Drives the entity cascade for one run:
//!
//! ```text
//! Session ─┬─> Interaction ──> Step
//!          └──────────────────> Message
//! ```
//!
//! Each level is queried, decoded, buffered and written before its ids are
//! resolved into the next level's queries. A failure at any level is recorded
//! in the result and stops the cascade; whatever was written before stays on
//! disk. A replacing run leaves an empty table for every level it did not
//! write, so no file from an earlier run survives next to this run's output.
//! Every run ends by persisting `extraction_metadata.json`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sessiontrace_core::columnar::{read_string_column, BufferedTable, WriteError, WriteOptions};
use sessiontrace_core::config::ExtractConfig;
use sessiontrace_core::models::{EntityKind, EntityRow, ID_COLUMN};
use sessiontrace_core::schema::Record;
use sessiontrace_core::query::{QueryExecutor, QueryRunStats};
use sessiontrace_core::watermark::WatermarkStore;
use sessiontrace_core::TraceError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::metadata::{write_metadata, RunMetadata, RunParameters};
use crate::queries;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Stop after the session level.
    pub skip_children: bool,
    /// Merge into existing tables, deduplicating on `id`.
    pub append: bool,
    /// Observed by every query wait; cancelling aborts the current level.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMode {
    Window,
    Tree,
    Incremental,
}

impl std::fmt::Display for ExtractionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ExtractionMode::Window => "window",
            ExtractionMode::Tree => "tree",
            ExtractionMode::Incremental => "incremental",
        })
    }
}

/// Outcome of one orchestrator call. Always produced, even when a level fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub run_id: Uuid,
    pub mode: ExtractionMode,
    pub counts: BTreeMap<EntityKind, usize>,
    pub stats: BTreeMap<EntityKind, QueryRunStats>,
    pub output_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Watermark saved by this run, if any.
    pub watermark: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

impl ExtractionResult {
    fn new(mode: ExtractionMode, output_dir: &Path) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            counts: EntityKind::ALL.iter().map(|k| (*k, 0)).collect(),
            stats: BTreeMap::new(),
            output_dir: output_dir.to_path_buf(),
            started_at: Utc::now(),
            finished_at: None,
            watermark: None,
            errors: Vec::new(),
        }
    }

    pub fn count(&self, kind: EntityKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_rows(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Record a level; returns the ids to cascade from, or `None` if it failed.
    fn absorb(&mut self, outcome: LevelOutcome) -> Option<Vec<String>> {
        self.counts.insert(outcome.kind, outcome.rows);
        self.stats.insert(outcome.kind, outcome.stats);
        match outcome.error {
            Some(error) => {
                self.errors.push(error);
                None
            }
            None => Some(outcome.ids),
        }
    }
}

struct LevelOutcome {
    kind: EntityKind,
    rows: usize,
    stats: QueryRunStats,
    ids: Vec<String>,
    error: Option<String>,
}

/// Every row of a page must decode as `kind`; one bad row rejects the page.
fn validate_page(kind: EntityKind, page: &[Record]) -> Result<(), TraceError> {
    for record in page {
        EntityRow::decode(kind, record)?;
    }
    Ok(())
}

/// First occurrence of each id, in order.
fn unique_ids(ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct ExtractionOrchestrator {
    executor: QueryExecutor,
    config: ExtractConfig,
    /// Resolved once; never re-expanded.
    output_dir: PathBuf,
}

impl ExtractionOrchestrator {
    pub fn new(executor: QueryExecutor, config: ExtractConfig) -> Self {
        let output_dir = config.output_path();
        Self {
            executor,
            config,
            output_dir,
        }
    }

    /// Use `dir` verbatim as the output directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn watermark_store(&self) -> WatermarkStore {
        WatermarkStore::new(self.config.watermark_path_in(&self.output_dir))
            .with_default_lookback(Duration::hours(self.config.lookback_hours))
    }

    /// Sessions starting in `[start, end)`, optionally filtered by agent name.
    pub async fn extract_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        agent_names: &[String],
        options: &ExtractOptions,
    ) -> ExtractionResult {
        tracing::info!(%start, %end, agents = agent_names.len(), "Starting window extraction");
        let mut result = ExtractionResult::new(ExtractionMode::Window, &self.output_dir);
        let root = vec![queries::sessions_in_window(start, end, agent_names)];
        self.cascade(&mut result, root, options).await;

        let parameters = RunParameters {
            start: Some(start),
            end: Some(end),
            agent_names: agent_names.to_vec(),
            skip_children: options.skip_children,
            append: options.append,
            ..Default::default()
        };
        self.finalize(result, parameters)
    }

    /// Explicit session ids, bypassing any time window.
    pub async fn extract_tree(&self, session_ids: &[String], options: &ExtractOptions) -> ExtractionResult {
        let ids = unique_ids(session_ids.to_vec());
        tracing::info!(sessions = ids.len(), "Starting targeted tree extraction");
        let mut result = ExtractionResult::new(ExtractionMode::Tree, &self.output_dir);
        let root = queries::chunked_by_parent_ids(EntityKind::Session, &ids, self.config.id_chunk_size);
        self.cascade(&mut result, root, options).await;

        let parameters = RunParameters {
            session_ids: ids,
            skip_children: options.skip_children,
            append: options.append,
            ..Default::default()
        };
        self.finalize(result, parameters)
    }

    /// Window from the stored watermark to now, appended and deduplicated.
    /// The watermark advances only when the run finishes without errors.
    pub async fn extract_incremental(&self, options: &ExtractOptions) -> ExtractionResult {
        let now = Utc::now();
        let store = self.watermark_store();
        let options = ExtractOptions {
            append: true,
            ..options.clone()
        };
        let mut result = ExtractionResult::new(ExtractionMode::Incremental, &self.output_dir);
        let mut parameters = RunParameters {
            end: Some(now),
            skip_children: options.skip_children,
            append: true,
            ..Default::default()
        };

        let since = match store.load_at(now) {
            Ok(since) => since,
            Err(e) => {
                tracing::error!(path = %store.path().display(), error = %e, "Could not load watermark");
                result.errors.push(format!("watermark load failed: {}", e));
                return self.finalize(result, parameters);
            }
        };
        parameters.start = Some(since);
        tracing::info!(%since, until = %now, "Starting incremental extraction");

        let root = vec![queries::sessions_in_window(since, now, &[])];
        self.cascade(&mut result, root, &options).await;

        if result.errors.is_empty() {
            match store.save(now) {
                Ok(()) => result.watermark = Some(now),
                Err(e) => {
                    tracing::error!(error = %e, "Could not save watermark");
                    result.errors.push(format!("watermark save failed: {}", e));
                }
            }
        } else {
            tracing::warn!(errors = result.errors.len(), "Run had errors, watermark left unchanged");
        }

        self.finalize(result, parameters)
    }

    // ------------------------------------------------------------------------
    // Cascade
    // ------------------------------------------------------------------------

    async fn cascade(&self, result: &mut ExtractionResult, root: Vec<String>, options: &ExtractOptions) {
        let mut written = Vec::new();
        self.run_cascade(result, root, options, &mut written).await;
        if !options.append {
            self.reset_unwritten(result, &written).await;
        }
    }

    async fn run_cascade(
        &self,
        result: &mut ExtractionResult,
        root: Vec<String>,
        options: &ExtractOptions,
        written: &mut Vec<EntityKind>,
    ) {
        let sessions = self.extract_level(EntityKind::Session, root, options, true).await;
        let Some(session_ids) = result.absorb(sessions) else {
            return;
        };
        written.push(EntityKind::Session);
        if session_ids.is_empty() {
            tracing::info!("No sessions matched");
            return;
        }
        if options.skip_children {
            tracing::info!(sessions = session_ids.len(), "Skipping child entities");
            return;
        }

        let chunk = self.config.id_chunk_size;
        let interaction_queries =
            queries::chunked_by_parent_ids(EntityKind::Interaction, &session_ids, chunk);
        let interactions = self
            .extract_level(EntityKind::Interaction, interaction_queries, options, true)
            .await;
        let Some(interaction_ids) = result.absorb(interactions) else {
            return;
        };
        written.push(EntityKind::Interaction);
        if interaction_ids.is_empty() {
            tracing::info!("No interactions matched");
            return;
        }

        let step_queries = queries::chunked_by_parent_ids(EntityKind::Step, &interaction_ids, chunk);
        let message_queries = queries::chunked_by_parent_ids(EntityKind::Message, &session_ids, chunk);

        let (steps, messages) = if self.config.concurrent_leaves {
            tokio::join!(
                self.extract_level(EntityKind::Step, step_queries, options, false),
                self.extract_level(EntityKind::Message, message_queries, options, false),
            )
        } else {
            let steps = self.extract_level(EntityKind::Step, step_queries, options, false).await;
            let messages = self
                .extract_level(EntityKind::Message, message_queries, options, false)
                .await;
            (steps, messages)
        };
        if result.absorb(steps).is_some() {
            written.push(EntityKind::Step);
        }
        if result.absorb(messages).is_some() {
            written.push(EntityKind::Message);
        }
    }

    /// Replace every table this run did not write with an empty one.
    async fn reset_unwritten(&self, result: &mut ExtractionResult, written: &[EntityKind]) {
        for kind in EntityKind::ALL {
            if written.contains(&kind) {
                continue;
            }
            let dest = self.output_dir.join(kind.file_name());
            let reset = tokio::task::spawn_blocking(move || {
                let schema = kind.schema();
                BufferedTable::new(Some(schema.clone())).finish(&dest, &WriteOptions::with_schema(schema))
            })
            .await
            .map_err(|e| TraceError::Other(format!("writer task failed: {}", e)))
            .and_then(|r| r.map_err(TraceError::from));

            match reset {
                Ok(_) => tracing::debug!(entity = %kind, "Reset table not written by this run"),
                // A failed level already carries its own error.
                Err(e) if result.stats.contains_key(&kind) => {
                    tracing::warn!(entity = %kind, error = %e, "Could not reset table after failed level")
                }
                Err(e) => {
                    tracing::error!(entity = %kind, error = %e, "Could not reset table");
                    result.errors.push(format!("{} table reset failed: {}", kind, e));
                }
            }
        }
    }

    async fn extract_level(
        &self,
        kind: EntityKind,
        queries: Vec<String>,
        options: &ExtractOptions,
        collect_ids: bool,
    ) -> LevelOutcome {
        let mut stats = QueryRunStats::default();
        match self.run_level(kind, &queries, options, collect_ids, &mut stats).await {
            Ok((rows, ids)) => {
                tracing::info!(
                    entity = %kind,
                    rows = rows,
                    queries = queries.len(),
                    bytes = stats.bytes_transferred,
                    rate_limit_waits = stats.rate_limit_waits,
                    "Extracted level"
                );
                LevelOutcome {
                    kind,
                    rows,
                    stats,
                    ids: unique_ids(ids),
                    error: None,
                }
            }
            Err(e) => {
                tracing::error!(entity = %kind, error = %e, "Level extraction failed");
                LevelOutcome {
                    kind,
                    rows: 0,
                    stats,
                    ids: Vec::new(),
                    error: Some(format!("{} extraction failed: {}", kind, e)),
                }
            }
        }
    }

    async fn run_level(
        &self,
        kind: EntityKind,
        queries: &[String],
        options: &ExtractOptions,
        collect_ids: bool,
        stats: &mut QueryRunStats,
    ) -> Result<(usize, Vec<String>), TraceError> {
        let mut table = BufferedTable::new(Some(kind.schema()));

        for sql in queries {
            let mut run = self.executor.run_with_cancel(sql, options.cancel.clone());
            let drained: Result<(), TraceError> = loop {
                match run.next_page().await {
                    Ok(Some(page)) => {
                        if let Err(e) = validate_page(kind, &page) {
                            break Err(e);
                        }
                        if let Err(e) = table.push(&page) {
                            break Err(e.into());
                        }
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e.into()),
                }
            };
            stats.merge(run.stats());
            drained?;
        }

        // Appended tables also hold earlier runs, so only this run's ids cascade.
        let append = options.append;
        let fresh_ids = if append && collect_ids {
            table.string_column(ID_COLUMN)?
        } else {
            Vec::new()
        };
        let write_options = WriteOptions {
            append,
            dedupe_key: Some(ID_COLUMN.to_string()),
            ..WriteOptions::with_schema(kind.schema())
        };
        let dest = self.output_dir.join(kind.file_name());

        let written = tokio::task::spawn_blocking(move || -> Result<(usize, Vec<String>), WriteError> {
            let rows = table.finish(&dest, &write_options)?;
            let ids = if !collect_ids || append || rows == 0 {
                fresh_ids
            } else {
                read_string_column(&dest, ID_COLUMN)?
            };
            Ok((rows, ids))
        })
        .await
        .map_err(|e| TraceError::Other(format!("writer task failed: {}", e)))??;

        Ok(written)
    }

    fn finalize(&self, mut result: ExtractionResult, parameters: RunParameters) -> ExtractionResult {
        result.finished_at = Some(Utc::now());

        let metadata = RunMetadata {
            parameters,
            result: result.clone(),
        };
        if let Err(e) = write_metadata(&self.output_dir, &metadata) {
            tracing::error!(error = %e, "Could not write run metadata");
            result.errors.push(format!("metadata write failed: {}", e));
        }

        tracing::info!(
            run_id = %result.run_id,
            mode = %result.mode,
            sessions = result.count(EntityKind::Session),
            interactions = result.count(EntityKind::Interaction),
            steps = result.count(EntityKind::Step),
            messages = result.count(EntityKind::Message),
            errors = result.errors.len(),
            "Extraction finished"
        );
        result
    }
}
