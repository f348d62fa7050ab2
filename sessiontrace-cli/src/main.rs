//! sessiontrace: thin CLI over the extraction orchestrator
//!
//! # Subcommands
//! - `extract [--start TS] [--end TS] [--agent NAME]... [--skip-children] [--json]`
//! - `extract-tree --session-id ID... [--skip-children] [--json]`
//! - `incremental [--skip-children] [--json]`
//! - `watermark [--json]`
//!
//! Exit status is 1 whenever the run reports errors.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use sessiontrace_core::models::EntityKind;
use sessiontrace_core::{EnvTokenProvider, QueryExecutor, SessionTraceConfig};
use sessiontrace_extract::{ExtractOptions, ExtractionOrchestrator, ExtractionResult};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "sessiontrace",
    version,
    about = "Extract agent session traces from the query API into Parquet tables"
)]
struct Cli {
    /// Config file (TOML); SESSIONTRACE__SECTION__KEY env vars override it
    #[arg(short, long, env = "SESSIONTRACE_CONFIG", default_value = "sessiontrace.toml")]
    config: String,

    /// Output directory (overrides extract.output_dir)
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract sessions in a time window and everything under them
    Extract {
        /// Window start (RFC3339 or YYYY-MM-DD); defaults to end - lookback_hours
        #[arg(long, value_parser = parse_timestamp)]
        start: Option<DateTime<Utc>>,

        /// Window end (RFC3339 or YYYY-MM-DD); defaults to now
        #[arg(long, value_parser = parse_timestamp)]
        end: Option<DateTime<Utc>>,

        /// Only sessions handled by this agent (repeatable)
        #[arg(long = "agent")]
        agents: Vec<String>,

        #[command(flatten)]
        run: RunFlags,
    },

    /// Extract specific sessions by id and everything under them
    ExtractTree {
        /// Session id (repeatable)
        #[arg(long = "session-id", required = true)]
        session_ids: Vec<String>,

        #[command(flatten)]
        run: RunFlags,
    },

    /// Extract everything since the last successful incremental run
    Incremental {
        /// Only extract sessions
        #[arg(long)]
        skip_children: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the stored watermark
    Watermark {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, clap::Args)]
struct RunFlags {
    /// Only extract sessions
    #[arg(long)]
    skip_children: bool,

    /// Merge into existing tables, deduplicating on id
    #[arg(long)]
    append: bool,

    /// Print the result as JSON
    #[arg(long)]
    json: bool,
}

/// RFC3339 timestamp, or a bare date meaning midnight UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("'{}' is neither RFC3339 nor YYYY-MM-DD", raw))
}

// ============================================================================
// Output
// ============================================================================

fn render_summary(result: &ExtractionResult) -> String {
    let mut out = String::new();
    out.push_str(&format!("Run:        {} ({})\n", result.run_id, result.mode));
    out.push_str(&format!("Output:     {}\n", result.output_dir.display()));
    for kind in EntityKind::ALL {
        out.push_str(&format!("{:<14}{}\n", format!("{}:", kind.table_name()), result.count(kind)));
    }
    if let Some(finished) = result.finished_at {
        let elapsed = (finished - result.started_at).num_milliseconds() as f64 / 1000.0;
        out.push_str(&format!("Elapsed:    {:.1}s\n", elapsed));
    }
    if let Some(mark) = result.watermark {
        out.push_str(&format!("Watermark:  {}\n", mark.to_rfc3339()));
    }
    if result.errors.is_empty() {
        out.push_str("Status:     ok\n");
    } else {
        out.push_str(&format!("Status:     {} error(s)\n", result.errors.len()));
        for error in &result.errors {
            out.push_str(&format!("  - {}\n", error));
        }
    }
    out
}

fn report(result: &ExtractionResult, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        print!("{}", render_summary(result));
    }
    Ok(())
}

fn init_logging(level: &str) {
    let default = level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
    // stdout carries the report; logs go to stderr.
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default.into()))
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = SessionTraceConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;
    init_logging(&config.service.log_level);

    let provider = Arc::new(EnvTokenProvider::new(
        config.auth.token_env.clone(),
        config.api.instance_url.clone(),
    ));
    let executor = QueryExecutor::new(provider, config.api.clone())?;
    let mut orchestrator = ExtractionOrchestrator::new(executor, config.extract.clone());
    if let Some(dir) = cli.output {
        orchestrator = orchestrator.with_output_dir(dir);
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling extraction");
            signal_cancel.cancel();
        }
    });

    let (result, json) = match cli.command {
        Commands::Extract {
            start,
            end,
            agents,
            run,
        } => {
            let end = end.unwrap_or_else(Utc::now);
            let start = start.unwrap_or(end - Duration::hours(config.extract.lookback_hours));
            anyhow::ensure!(start < end, "window start {} is not before end {}", start, end);
            let options = ExtractOptions {
                skip_children: run.skip_children,
                append: run.append,
                cancel,
            };
            (
                orchestrator.extract_window(start, end, &agents, &options).await,
                run.json,
            )
        }
        Commands::ExtractTree { session_ids, run } => {
            let options = ExtractOptions {
                skip_children: run.skip_children,
                append: run.append,
                cancel,
            };
            (orchestrator.extract_tree(&session_ids, &options).await, run.json)
        }
        Commands::Incremental {
            skip_children,
            json,
        } => {
            let options = ExtractOptions {
                skip_children,
                append: true,
                cancel,
            };
            (orchestrator.extract_incremental(&options).await, json)
        }
        Commands::Watermark { json } => {
            let store = orchestrator.watermark_store();
            let stored = store.read()?;
            if json {
                let body = serde_json::json!({
                    "path": store.path().display().to_string(),
                    "last_extraction": stored.map(|ts| ts.to_rfc3339()),
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                match stored {
                    Some(ts) => println!("{}", ts.to_rfc3339()),
                    None => println!(
                        "No watermark at {}; next incremental run starts at {}",
                        store.path().display(),
                        store.load()?.to_rfc3339()
                    ),
                }
            }
            return Ok(());
        }
    };

    report(&result, json)?;
    if !result.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
