//! Query execution against the analytical query API.
//!
//! A query is submitted once; results arrive in chunks. While the response
//! status is `Running` or `MoreChunksAvailable` the executor keeps fetching
//! `<endpoint>/<queryId>/rows`. Older deployments answer with a
//! `nextRecordsUrl` instead, which is followed verbatim.
//!
//! Every request goes through the same retry policy:
//! - 429: exponential backoff (or the server's `Retry-After`), then `RateLimitExceeded`
//! - 401: force a token refresh, back off, retry; then `Auth`
//! - timeout: exponential backoff; then `Timeout`
//! - any other 4xx/5xx: `Api` immediately

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_util::sync::CancellationToken;

use crate::auth::TokenProvider;
use crate::config::ApiConfig;
use crate::schema::Record;

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Rate limit exceeded after {attempts} attempts")]
    RateLimitExceeded { attempts: usize },

    #[error("Request timed out after {attempts} attempts")]
    Timeout { attempts: usize },

    #[error("Query API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid query response: {0}")]
    InvalidResponse(String),

    #[error("Query cancelled")]
    Cancelled,
}

// ============================================================================
// Run statistics
// ============================================================================

/// Counters for one query invocation. Owned by its `QueryRun`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryRunStats {
    pub rows_fetched: u64,
    pub batches: u64,
    pub bytes_transferred: u64,
    pub rate_limit_waits: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueryRunStats {
    /// Fold another run's counters into this one; the time span widens to cover both.
    pub fn merge(&mut self, other: &QueryRunStats) {
        self.rows_fetched += other.rows_fetched;
        self.batches += other.batches;
        self.bytes_transferred += other.bytes_transferred;
        self.rate_limit_waits += other.rate_limit_waits;
        self.started_at = match (self.started_at, other.started_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.finished_at = match (self.finished_at, other.finished_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

// ============================================================================
// Wire types (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    sql: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    status: Option<QueryStatus>,
    #[serde(default)]
    next_records_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryStatus {
    #[serde(default)]
    completion_status: Option<CompletionStatus>,
    #[serde(default)]
    query_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum CompletionStatus {
    Completed,
    Running,
    MoreChunksAvailable,
    #[serde(other)]
    Unknown,
}

/// Column names from the `metadata` field, in declared order. Accepts the
/// list form `[{"name": ..}]` and the keyed form `{"col": {"placeInOrder": n}}`.
fn column_names(metadata: &Value) -> Result<Vec<String>, QueryError> {
    match metadata {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(obj) => obj
                    .get("name")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        QueryError::InvalidResponse("metadata entry without a name".to_string())
                    }),
                Value::String(s) => Ok(s.clone()),
                other => Err(QueryError::InvalidResponse(format!(
                    "unexpected metadata entry: {}",
                    other
                ))),
            })
            .collect(),
        Value::Object(map) => {
            let mut ordered: Vec<(u64, usize, String)> = map
                .iter()
                .enumerate()
                .map(|(pos, (name, meta))| {
                    let place = meta
                        .get("placeInOrder")
                        .and_then(Value::as_u64)
                        .unwrap_or(pos as u64);
                    (place, pos, name.clone())
                })
                .collect();
            ordered.sort();
            Ok(ordered.into_iter().map(|(_, _, name)| name).collect())
        }
        other => Err(QueryError::InvalidResponse(format!(
            "unexpected metadata shape: {}",
            other
        ))),
    }
}

/// Zip positional rows with column names. Rows that already arrive as
/// objects pass through unchanged.
fn decode_rows(columns: &[String], data: Vec<Value>) -> Result<Vec<Record>, QueryError> {
    data.into_iter()
        .map(|row| match row {
            Value::Array(values) => {
                if values.len() != columns.len() {
                    return Err(QueryError::InvalidResponse(format!(
                        "row has {} values but metadata declares {} columns",
                        values.len(),
                        columns.len()
                    )));
                }
                Ok(columns.iter().cloned().zip(values).collect())
            }
            Value::Object(record) => Ok(record),
            other => Err(QueryError::InvalidResponse(format!(
                "unexpected row shape: {}",
                other
            ))),
        })
        .collect()
}

/// Human-readable message from an error body: a list of error objects, then
/// a single object, then the raw text.
pub(crate) fn extract_error_message(body: &[u8]) -> String {
    fn message_of(value: &Value) -> Option<String> {
        let obj = value.as_object()?;
        let message = ["message", "error_description", "msg"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map(str::to_string)
            .or_else(|| match obj.get("error") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(nested @ Value::Object(_)) => message_of(nested),
                _ => None,
            })?;
        match obj.get("errorCode").and_then(Value::as_str) {
            Some(code) => Some(format!("{}: {}", code, message)),
            None => Some(message),
        }
    }

    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        match &value {
            Value::Array(items) => {
                let messages: Vec<String> = items.iter().filter_map(message_of).collect();
                if !messages.is_empty() {
                    return messages.join("; ");
                }
            }
            Value::Object(_) => {
                if let Some(message) = message_of(&value) {
                    return message;
                }
            }
            _ => {}
        }
    }

    String::from_utf8_lossy(body).trim().to_string()
}

// ============================================================================
// Retry plumbing
// ============================================================================

/// A request the pager wants to make.
#[derive(Debug, Clone)]
enum PageRequest {
    Submit { url: String, sql: String },
    Fetch { url: String, params: Vec<(&'static str, String)> },
}

/// Why a single attempt did not produce a body.
#[derive(Debug)]
enum AttemptFailure {
    RateLimited { retry_after: Option<Duration> },
    Unauthorized,
    TimedOut,
    Fatal(QueryError),
}

impl AttemptFailure {
    fn exhausted(self, attempts: usize) -> QueryError {
        match self {
            AttemptFailure::RateLimited { .. } => QueryError::RateLimitExceeded { attempts },
            AttemptFailure::Unauthorized => {
                QueryError::Auth(format!("still unauthorized after {} attempts", attempts))
            }
            AttemptFailure::TimedOut => QueryError::Timeout { attempts },
            AttemptFailure::Fatal(e) => e,
        }
    }
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let secs: f64 = value?.to_str().ok()?.trim().parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(Duration::from_secs_f64(secs))
    } else {
        None
    }
}

async fn sleep_or_cancel(wait: Duration, cancel: &CancellationToken) -> Result<(), QueryError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(QueryError::Cancelled),
        _ = tokio::time::sleep(wait) => Ok(()),
    }
}

// ============================================================================
// QueryExecutor
// ============================================================================

/// Issues queries and drives their pagination and retry protocol.
#[derive(Clone)]
pub struct QueryExecutor {
    client: Client,
    provider: Arc<dyn TokenProvider>,
    config: ApiConfig,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("base_url", &self.provider.base_instance_url())
            .field("config", &self.config)
            .finish()
    }
}

impl QueryExecutor {
    pub fn new(provider: Arc<dyn TokenProvider>, config: ApiConfig) -> Result<Self, QueryError> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self {
            client,
            provider,
            config,
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    /// `<instance>/<query_path>`.
    pub fn query_endpoint(&self) -> String {
        let base = self.provider.base_instance_url();
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            self.config.query_path.trim_start_matches('/')
        )
    }

    /// Start a query. Nothing is sent until the first page is requested.
    /// Each call re-issues the query from scratch.
    pub fn run(&self, sql: &str) -> QueryRun<'_> {
        self.run_with_cancel(sql, CancellationToken::new())
    }

    /// Like `run`, observing `cancel` during every retry sleep and poll wait.
    pub fn run_with_cancel(&self, sql: &str, cancel: CancellationToken) -> QueryRun<'_> {
        QueryRun {
            executor: self,
            sql: sql.to_string(),
            cancel,
            state: RunState::NotStarted,
            columns: None,
            query_id: None,
            stats: QueryRunStats::default(),
        }
    }

    /// Cancel a server-side query. Single attempt, no retry.
    pub async fn cancel_query(&self, query_id: &str) -> Result<(), QueryError> {
        let url = format!("{}/{}", self.query_endpoint(), query_id);
        let headers = self.provider.headers().await?;
        let response = self
            .client
            .request(Method::DELETE, &url)
            .headers(headers)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            return Err(QueryError::Api {
                status: status.as_u16(),
                message: extract_error_message(&body),
            });
        }
        tracing::debug!(query_id = %query_id, "Cancelled server-side query");
        Ok(())
    }

    /// Retry delays: `initial_backoff_ms`, then doubling, capped at `max_backoff_ms`.
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        // Base 2 yields 2x, 4x, 8x the factor; halving starts the sequence at 1x.
        ExponentialBackoff::from_millis(2)
            .factor(self.config.initial_backoff_ms.max(1))
            .max_delay(Duration::from_millis(self.config.max_backoff_ms.saturating_mul(2)))
            .map(|delay| delay / 2)
    }

    /// Send one logical request, retrying per policy. Returns the raw body.
    async fn send(
        &self,
        request: &PageRequest,
        stats: &mut QueryRunStats,
        cancel: &CancellationToken,
    ) -> Result<Bytes, QueryError> {
        let max_attempts = self.config.max_retries.max(1);
        let max_delay = Duration::from_millis(self.config.max_backoff_ms);
        let mut delays = self.backoff();
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }
            attempt += 1;

            let failure = match self.send_once(request).await {
                Ok(body) => {
                    stats.bytes_transferred += body.len() as u64;
                    return Ok(body);
                }
                Err(AttemptFailure::Fatal(e)) => return Err(e),
                Err(failure) => failure,
            };

            if attempt >= max_attempts {
                tracing::error!(attempts = attempt, failure = ?failure, "Query request retries exhausted");
                return Err(failure.exhausted(attempt));
            }

            let computed = delays.next().unwrap_or(max_delay);
            let wait = match &failure {
                AttemptFailure::RateLimited { retry_after } => {
                    stats.rate_limit_waits += 1;
                    retry_after.map(|d| d.min(max_delay)).unwrap_or(computed)
                }
                AttemptFailure::Unauthorized => {
                    self.provider.force_refresh().await?;
                    computed
                }
                _ => computed,
            };

            tracing::warn!(
                failure = ?failure,
                attempt = attempt,
                max_attempts = max_attempts,
                backoff_ms = wait.as_millis() as u64,
                "Retrying query request"
            );

            sleep_or_cancel(wait, cancel).await?;
        }
    }

    async fn send_once(&self, request: &PageRequest) -> Result<Bytes, AttemptFailure> {
        let headers = self
            .provider
            .headers()
            .await
            .map_err(AttemptFailure::Fatal)?;

        let builder = match request {
            PageRequest::Submit { url, sql } => {
                self.client.post(url).json(&SubmitRequest { sql: sql.as_str() })
            }
            PageRequest::Fetch { url, params } => self.client.get(url).query(params),
        };

        let response = match builder.headers(headers).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(AttemptFailure::TimedOut),
            Err(e) => return Err(AttemptFailure::Fatal(QueryError::Http(e))),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            return Err(AttemptFailure::RateLimited { retry_after });
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(AttemptFailure::Unauthorized);
        }

        let body = match response.bytes().await {
            Ok(b) => b,
            Err(e) if e.is_timeout() => return Err(AttemptFailure::TimedOut),
            Err(e) => return Err(AttemptFailure::Fatal(QueryError::Http(e))),
        };

        if !status.is_success() {
            let message = extract_error_message(&body);
            tracing::error!(code = status.as_u16(), message = %message, "Query API error");
            return Err(AttemptFailure::Fatal(QueryError::Api {
                status: status.as_u16(),
                message,
            }));
        }

        Ok(body)
    }

    /// Resolve a `nextRecordsUrl`: absolute URLs as-is, paths against the instance.
    fn resolve_next_url(&self, next: &str) -> String {
        if next.starts_with("http://") || next.starts_with("https://") {
            next.to_string()
        } else {
            format!(
                "{}/{}",
                self.provider.base_instance_url().trim_end_matches('/'),
                next.trim_start_matches('/')
            )
        }
    }
}

// ============================================================================
// QueryRun
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum RunState {
    NotStarted,
    FetchRows { query_id: String },
    FollowUrl { url: String },
    Done,
}

/// One in-progress query. Finite and not restartable; pages come back in
/// the order the API returns them.
pub struct QueryRun<'a> {
    executor: &'a QueryExecutor,
    sql: String,
    cancel: CancellationToken,
    state: RunState,
    columns: Option<Vec<String>>,
    query_id: Option<String>,
    stats: QueryRunStats,
}

impl<'a> QueryRun<'a> {
    pub fn stats(&self) -> &QueryRunStats {
        &self.stats
    }

    pub fn into_stats(self) -> QueryRunStats {
        self.stats
    }

    pub fn is_done(&self) -> bool {
        self.state == RunState::Done
    }

    /// Next non-empty page of rows, or `None` once the query is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Record>>, QueryError> {
        match self.advance().await {
            Ok(page) => Ok(page),
            Err(e) => {
                self.state = RunState::Done;
                self.stats.finished_at = Some(Utc::now());
                if matches!(e, QueryError::Cancelled) {
                    if let Some(query_id) = self.query_id.clone() {
                        if let Err(cancel_err) = self.executor.cancel_query(&query_id).await {
                            tracing::warn!(query_id = %query_id, error = %cancel_err, "Failed to cancel server-side query");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    async fn advance(&mut self) -> Result<Option<Vec<Record>>, QueryError> {
        loop {
            let request = match &self.state {
                RunState::Done => return Ok(None),
                RunState::NotStarted => {
                    self.stats.started_at = Some(Utc::now());
                    tracing::debug!(sql = %self.sql, "Submitting query");
                    PageRequest::Submit {
                        url: self.executor.query_endpoint(),
                        sql: self.sql.clone(),
                    }
                }
                RunState::FetchRows { query_id } => {
                    let mut params = vec![("offset", self.stats.rows_fetched.to_string())];
                    if let Some(limit) = self.executor.config.row_limit {
                        params.push(("rowLimit", limit.to_string()));
                    }
                    PageRequest::Fetch {
                        url: format!("{}/{}/rows", self.executor.query_endpoint(), query_id),
                        params,
                    }
                }
                RunState::FollowUrl { url } => PageRequest::Fetch {
                    url: self.executor.resolve_next_url(url),
                    params: Vec::new(),
                },
            };

            let body = self
                .executor
                .send(&request, &mut self.stats, &self.cancel)
                .await?;
            let response: QueryResponse = serde_json::from_slice(&body)
                .map_err(|e| QueryError::InvalidResponse(e.to_string()))?;
            self.stats.batches += 1;

            if let Some(metadata) = &response.metadata {
                let names = column_names(metadata)?;
                if let Some(existing) = &self.columns {
                    if !names.is_empty() && *existing != names {
                        return Err(QueryError::InvalidResponse(
                            "column metadata changed between pages".to_string(),
                        ));
                    }
                } else {
                    self.columns = Some(names);
                }
            }

            let columns = self.columns.as_deref().unwrap_or(&[]);
            let rows = decode_rows(columns, response.data)?;
            self.stats.rows_fetched += rows.len() as u64;

            let completion = response.status.as_ref().and_then(|s| s.completion_status);
            if let Some(id) = response.status.and_then(|s| s.query_id) {
                self.query_id = Some(id);
            }
            let pending = matches!(
                completion,
                Some(CompletionStatus::Running) | Some(CompletionStatus::MoreChunksAvailable)
            );

            self.state = match (pending, &self.query_id, response.next_records_url) {
                (true, Some(id), _) => RunState::FetchRows {
                    query_id: id.clone(),
                },
                (_, _, Some(url)) => RunState::FollowUrl { url },
                _ => RunState::Done,
            };

            tracing::debug!(
                rows = rows.len(),
                total_rows = self.stats.rows_fetched,
                status = ?completion,
                "Received query page"
            );

            if self.state == RunState::Done {
                self.stats.finished_at = Some(Utc::now());
            }

            if !rows.is_empty() {
                return Ok(Some(rows));
            }
            if self.state == RunState::Done {
                return Ok(None);
            }
            // Empty page on a pending query: wait before asking again.
            let poll = Duration::from_millis(self.executor.config.poll_interval_ms);
            sleep_or_cancel(poll, &self.cancel).await?;
        }
    }

    /// Pages as a stream. Counters are not reachable once converted.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<Record>, QueryError>> + 'a {
        futures::stream::try_unfold(self, |mut run| async move {
            let page = run.next_page().await?;
            Ok::<_, QueryError>(page.map(|rows| (rows, run)))
        })
    }

    /// Rows one at a time.
    pub fn into_row_stream(self) -> impl Stream<Item = Result<Record, QueryError>> + 'a {
        self.into_stream()
            .map_ok(|rows| futures::stream::iter(rows.into_iter().map(Ok::<Record, QueryError>)))
            .try_flatten()
    }

    /// Drain every page into memory.
    pub async fn collect_rows(mut self) -> Result<(Vec<Record>, QueryRunStats), QueryError> {
        let mut rows = Vec::new();
        while let Some(page) = self.next_page().await? {
            rows.extend(page);
        }
        Ok((rows, self.stats))
    }
}

// ============================================================================
// TESTS
// ============================================================================
