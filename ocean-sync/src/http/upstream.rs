//! Generic REST upstream client.
//!
//! Covers the common convention of paged JSON listings:
//! `GET {base_url}/{path}?limit=N&cursor=C&<filters>` answering
//! `{"<items_field>": [...], "<next_cursor_field>": "..."}` (or a bare array),
//! and `GET {base_url}/{path}/{id}` for a single object. Vendors that differ
//! implement [`UpstreamClient`] themselves.

use super::{default_timeout_secs, endpoint, retry_after};
use crate::error::{UpstreamError, UpstreamResult};
use crate::upstream::{Page, PageRequest, UpstreamClient};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Connection settings of a REST upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpUpstreamConfig {
    pub base_url: String,
    /// Field of the listing response holding the objects.
    #[serde(default = "default_items_field")]
    pub items_field: String,
    /// Field of the listing response holding the next cursor.
    #[serde(default = "default_next_cursor_field")]
    pub next_cursor_field: String,
    /// Kind to path overrides. Unlisted kinds use the kind name as path.
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    /// Bearer token. Usually supplied through the environment.
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_items_field() -> String {
    "items".to_string()
}

fn default_next_cursor_field() -> String {
    "next_cursor".to_string()
}

impl HttpUpstreamConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            items_field: default_items_field(),
            next_cursor_field: default_next_cursor_field(),
            paths: BTreeMap::new(),
            token: None,
            timeout_secs: default_timeout_secs(),
        }
    }

    fn path_for<'a>(&'a self, kind: &'a str) -> &'a str {
        self.paths.get(kind).map_or(kind, String::as_str)
    }
}

/// [`UpstreamClient`] over a REST API.
pub struct HttpUpstreamClient {
    config: HttpUpstreamConfig,
    client: Client,
}

impl HttpUpstreamClient {
    pub fn new(config: HttpUpstreamConfig) -> UpstreamResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| UpstreamError::fatal(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn url(&self, kind: &str, id: Option<&str>) -> UpstreamResult<reqwest::Url> {
        let path = self.config.path_for(kind);
        let segments = path.split('/').filter(|s| !s.is_empty()).chain(id);
        endpoint(&self.config.base_url, segments).map_err(UpstreamError::fatal)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> UpstreamResult<reqwest::Response> {
        let request = match &self.config.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        request.send().await.map_err(transport_error)
    }

    fn parse_listing(&self, body: Value) -> UpstreamResult<Page> {
        let mut body = match body {
            Value::Array(items) => return Ok(Page::last(items)),
            Value::Object(map) => map,
            other => {
                return Err(UpstreamError::fatal(format!(
                    "listing must be an object or an array, got {other}"
                )));
            }
        };

        let items = match body.remove(&self.config.items_field) {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(UpstreamError::fatal(format!(
                    "'{}' must be an array, got {other}",
                    self.config.items_field
                )));
            }
        };

        let next_cursor = match body.remove(&self.config.next_cursor_field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };

        Ok(Page::new(items, next_cursor))
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn list_page(&self, request: PageRequest<'_>) -> UpstreamResult<Page> {
        let url = self.url(request.kind, None)?;

        let mut query: Vec<(String, String)> = vec![("limit".into(), request.page_size.to_string())];
        if let Some(cursor) = request.cursor {
            query.push(("cursor".into(), cursor.to_string()));
        }
        for (name, value) in request.params {
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            query.push((name.clone(), value));
        }

        debug!(kind = request.kind, cursor = ?request.cursor, %url, "listing upstream page");
        let response = self.send(self.client.get(url).query(&query)).await?;
        let body: Value = check(response).await?.json().await.map_err(decode_error)?;
        self.parse_listing(body)
    }

    async fn get_object(&self, kind: &str, id: &str) -> UpstreamResult<Option<Value>> {
        let url = self.url(kind, Some(id))?;
        debug!(kind, id, %url, "fetching upstream object");

        let response = self.send(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body: Value = check(response).await?.json().await.map_err(decode_error)?;
        Ok(Some(body))
    }
}

async fn check(response: reqwest::Response) -> UpstreamResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let wait = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::from_status(
        status.as_u16(),
        format!("upstream answered {status}: {body}"),
        wait,
    ))
}

/// Network-level failures (timeouts, refused connections, resets) may go
/// away on retry.
fn transport_error(e: reqwest::Error) -> UpstreamError {
    if e.is_builder() {
        UpstreamError::fatal(format!("invalid upstream request: {e}"))
    } else {
        UpstreamError::retryable(format!("upstream request failed: {e}"))
    }
}

fn decode_error(e: reqwest::Error) -> UpstreamError {
    UpstreamError::fatal(format!("failed to decode upstream response: {e}"))
}
