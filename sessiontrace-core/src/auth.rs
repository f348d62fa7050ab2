//! Bearer-token providers for the query API.
//!
//! Token issuance lives outside this crate. The executor only needs request
//! headers, a way to force a refresh after a 401, and the instance base URL.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::RwLock;

use crate::query::QueryError;

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// `Authorization: Bearer <token>` and `Content-Type: application/json`.
    async fn headers(&self) -> Result<HeaderMap, QueryError>;

    /// Discard the current token and obtain a fresh one.
    async fn force_refresh(&self) -> Result<(), QueryError>;

    /// Instance base URL, without a trailing slash.
    fn base_instance_url(&self) -> String;
}

fn bearer_headers(token: &str) -> Result<HeaderMap, QueryError> {
    let mut headers = HeaderMap::new();
    let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| QueryError::Auth("token contains invalid header characters".to_string()))?;
    headers.insert(AUTHORIZATION, value);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

// ============================================================================
// StaticTokenProvider
// ============================================================================

/// Fixed token; refreshing is a no-op.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
    instance_url: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>, instance_url: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            instance_url: instance_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn headers(&self) -> Result<HeaderMap, QueryError> {
        bearer_headers(&self.token)
    }

    async fn force_refresh(&self) -> Result<(), QueryError> {
        Ok(())
    }

    fn base_instance_url(&self) -> String {
        self.instance_url.clone()
    }
}

// ============================================================================
// EnvTokenProvider
// ============================================================================

/// Reads the token from an environment variable. A refresh re-reads the
/// variable, so an external process can rotate it between runs or retries.
#[derive(Debug)]
pub struct EnvTokenProvider {
    var: String,
    instance_url: String,
    token: RwLock<Option<String>>,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>, instance_url: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            instance_url: instance_url.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
        }
    }

    fn read_var(&self) -> Result<String, QueryError> {
        match std::env::var(&self.var) {
            Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
            _ => Err(QueryError::Auth(format!(
                "environment variable {} is not set",
                self.var
            ))),
        }
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn headers(&self) -> Result<HeaderMap, QueryError> {
        if let Some(token) = self.token.read().await.as_deref() {
            return bearer_headers(token);
        }
        let token = self.read_var()?;
        let headers = bearer_headers(&token)?;
        *self.token.write().await = Some(token);
        Ok(headers)
    }

    async fn force_refresh(&self) -> Result<(), QueryError> {
        let token = self.read_var()?;
        tracing::debug!(var = %self.var, "Refreshed bearer token from environment");
        *self.token.write().await = Some(token);
        Ok(())
    }

    fn base_instance_url(&self) -> String {
        self.instance_url.clone()
    }
}
