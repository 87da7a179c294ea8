//! Upstream API client abstraction.
//!
//! Each integration wraps its vendor API behind [`UpstreamClient`]. The
//! engine only needs two calls: list a page of objects of a kind, and fetch
//! one object by id.

use crate::error::UpstreamResult;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// One page of raw objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<Value>,
    /// Cursor for the next page; `None` on the last page.
    pub next_cursor: Option<String>,
}

impl Page {
    pub fn new(items: Vec<Value>, next_cursor: Option<String>) -> Self {
        Self { items, next_cursor }
    }

    pub fn last(items: Vec<Value>) -> Self {
        Self::new(items, None)
    }
}

/// A page request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageRequest<'a> {
    pub kind: &'a str,
    pub cursor: Option<&'a str>,
    pub page_size: usize,
    /// Kind-specific filters from the mapping selector.
    pub params: &'a Map<String, Value>,
}

/// Vendor API client.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Lists one page of objects of `request.kind`.
    async fn list_page(&self, request: PageRequest<'_>) -> UpstreamResult<Page>;

    /// Fetches the current representation of one object. `Ok(None)` when the
    /// object no longer exists.
    async fn get_object(&self, kind: &str, id: &str) -> UpstreamResult<Option<Value>>;
}

/// Scripted upstream for tests.
pub mod mock {
    use super::*;
    use crate::error::UpstreamError;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct KindScript {
        objects: Vec<Value>,
        failures: VecDeque<UpstreamError>,
        permanent_failure: Option<UpstreamError>,
    }

    /// An in-memory upstream. Objects are served in pages by offset cursor;
    /// failures can be queued per kind.
    #[derive(Debug, Default)]
    pub struct MockUpstream {
        kinds: Mutex<HashMap<String, KindScript>>,
        calls: Mutex<Vec<String>>,
        delay: Mutex<Option<Duration>>,
    }

    impl MockUpstream {
        pub fn new() -> Self {
            Self::default()
        }

        /// Replaces the objects of a kind.
        pub fn set_objects(&self, kind: &str, objects: Vec<Value>) {
            self.with_kind(kind, |script| script.objects = objects);
        }

        /// The next call for `kind` fails with `error`; queue several for
        /// several failing calls.
        pub fn fail_next(&self, kind: &str, error: UpstreamError) {
            self.with_kind(kind, |script| script.failures.push_back(error));
        }

        /// Every call for `kind` fails with `error` until cleared.
        pub fn fail_always(&self, kind: &str, error: UpstreamError) {
            self.with_kind(kind, |script| script.permanent_failure = Some(error));
        }

        pub fn clear_failures(&self, kind: &str) {
            self.with_kind(kind, |script| {
                script.failures.clear();
                script.permanent_failure = None;
            });
        }

        /// Slows down every call, to keep a run in flight.
        pub fn set_delay(&self, delay: Option<Duration>) {
            *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
        }

        /// Calls made so far, as `list:<kind>:<cursor>` or `get:<kind>:<id>`.
        pub fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        fn with_kind<R>(&self, kind: &str, f: impl FnOnce(&mut KindScript) -> R) -> R {
            let mut kinds = self.kinds.lock().unwrap_or_else(PoisonError::into_inner);
            f(kinds.entry(kind.to_string()).or_default())
        }

        fn record(&self, call: String) {
            self.calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(call);
        }

        fn take_failure(&self, kind: &str) -> Option<UpstreamError> {
            self.with_kind(kind, |script| {
                script
                    .failures
                    .pop_front()
                    .or_else(|| script.permanent_failure.clone())
            })
        }

        async fn pause(&self) {
            let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }
    }

    #[async_trait]
    impl UpstreamClient for MockUpstream {
        async fn list_page(&self, request: PageRequest<'_>) -> UpstreamResult<Page> {
            self.record(format!(
                "list:{}:{}",
                request.kind,
                request.cursor.unwrap_or("-")
            ));
            self.pause().await;
            if let Some(error) = self.take_failure(request.kind) {
                return Err(error);
            }

            let offset: usize = request
                .cursor
                .map(|c| c.parse::<usize>().map_err(|_| UpstreamError::fatal(format!("bad cursor {c}"))))
                .transpose()?
                .unwrap_or(0);
            let page_size = request.page_size.max(1);

            self.with_kind(request.kind, |script| {
                let end = (offset + page_size).min(script.objects.len());
                let items = script.objects.get(offset..end).unwrap_or_default().to_vec();
                let next_cursor = (end < script.objects.len()).then(|| end.to_string());
                Ok(Page::new(items, next_cursor))
            })
        }

        async fn get_object(&self, kind: &str, id: &str) -> UpstreamResult<Option<Value>> {
            self.record(format!("get:{kind}:{id}"));
            self.pause().await;
            if let Some(error) = self.take_failure(kind) {
                return Err(error);
            }
            self.with_kind(kind, |script| {
                Ok(script
                    .objects
                    .iter()
                    .find(|o| object_id(o).as_deref() == Some(id))
                    .cloned())
            })
        }
    }

    fn object_id(object: &Value) -> Option<String> {
        match object.get("id")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}
