//! Resource Fetcher: pages of raw objects for one kind.
//!
//! Every upstream call is bounded by the request timeout, retried with
//! backoff while the error is retryable, and raced against the run's
//! cancellation token, including the backoff sleeps.

use crate::config::{ResyncSettings, RetryPolicy};
use crate::error::{FetchError, FetchResult, UpstreamError, UpstreamResult};
use crate::upstream::{Page, PageRequest, UpstreamClient};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Timeout and retry behavior shared by every call a fetcher makes.
#[derive(Debug, Clone)]
struct CallPolicy {
    retry: RetryPolicy,
    timeout: Duration,
}

impl CallPolicy {
    async fn call<T, F, Fut>(
        &self,
        kind: &str,
        page: usize,
        cancel: &CancellationToken,
        mut op: F,
    ) -> FetchResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = UpstreamResult<T>>,
    {
        let cancelled = || FetchError::Cancelled {
            kind: kind.to_string(),
            page,
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled()),
                outcome = tokio::time::timeout(self.timeout, op()) => outcome,
            };

            let error = match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(error)) => error,
                Err(_) => UpstreamError::retryable(format!(
                    "request timed out after {}ms",
                    self.timeout.as_millis()
                )),
            };

            if !error.is_retryable() || attempt >= self.retry.max_attempts {
                return Err(FetchError::Upstream {
                    kind: kind.to_string(),
                    page,
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.retry.delay(attempt - 1, error.retry_after());
            warn!(
                kind,
                page,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "upstream call failed, retrying"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled()),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Streams pages of raw objects from the upstream.
#[derive(Clone)]
pub struct ResourceFetcher {
    upstream: Arc<dyn UpstreamClient>,
    page_size: usize,
    policy: CallPolicy,
}

impl ResourceFetcher {
    pub fn new(upstream: Arc<dyn UpstreamClient>, settings: &ResyncSettings, retry: RetryPolicy) -> Self {
        Self {
            upstream,
            page_size: settings.page_size.max(1),
            policy: CallPolicy {
                retry,
                timeout: settings.request_timeout(),
            },
        }
    }

    /// Lazily pages through every object of `kind`.
    ///
    /// The stream ends after the page with no next cursor, or after a page
    /// shorter than the page size. An error is the last item. Each call
    /// starts from the first page.
    pub fn fetch(
        &self,
        kind: &str,
        params: Map<String, Value>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, FetchResult<Page>> {
        let state = PageState {
            fetcher: self.clone(),
            kind: kind.to_string(),
            params,
            cancel,
            cursor: None,
            page: 0,
            done: false,
        };

        stream::unfold(state, |mut state| async move {
            if state.done {
                return None;
            }
            match state.next_page().await {
                Ok(page) => {
                    let short = page.items.len() < state.fetcher.page_size;
                    state.cursor = page.next_cursor.clone();
                    state.done = short || state.cursor.is_none();
                    state.page += 1;
                    Some((Ok(page), state))
                }
                Err(error) => {
                    state.done = true;
                    Some((Err(error), state))
                }
            }
        })
        .boxed()
    }

    /// Fetches the current version of one object, with the same timeout and
    /// retry treatment as listing.
    pub async fn get_object(
        &self,
        kind: &str,
        id: &str,
        cancel: &CancellationToken,
    ) -> FetchResult<Option<Value>> {
        let upstream = &self.upstream;
        self.policy
            .call(kind, 0, cancel, || upstream.get_object(kind, id))
            .await
    }
}

struct PageState {
    fetcher: ResourceFetcher,
    kind: String,
    params: Map<String, Value>,
    cancel: CancellationToken,
    cursor: Option<String>,
    page: usize,
    done: bool,
}

impl PageState {
    async fn next_page(&self) -> FetchResult<Page> {
        let request = PageRequest {
            kind: &self.kind,
            cursor: self.cursor.as_deref(),
            page_size: self.fetcher.page_size,
            params: &self.params,
        };
        let upstream = &self.fetcher.upstream;

        let page = self
            .fetcher
            .policy
            .call(&self.kind, self.page, &self.cancel, || upstream.list_page(request))
            .await?;

        debug!(
            kind = %self.kind,
            page = self.page,
            items = page.items.len(),
            has_next = page.next_cursor.is_some(),
            "fetched page"
        );
        Ok(page)
    }
}
