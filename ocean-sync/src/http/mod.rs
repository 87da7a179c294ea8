//! reqwest implementations of the upstream and catalog seams.

mod catalog;
mod upstream;

pub use catalog::{HttpCatalogClient, HttpCatalogConfig};
pub use upstream::{HttpUpstreamClient, HttpUpstreamConfig};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Url;
use std::time::Duration;

/// Appends path segments to `base`, percent-encoding each one. A `/` inside
/// a segment is encoded, not treated as a separator.
fn endpoint<'a>(base: &str, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, String> {
    let mut url = Url::parse(base).map_err(|e| format!("invalid base URL {base}: {e}"))?;
    url.path_segments_mut()
        .map_err(|()| format!("base URL {base} cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// `Retry-After` in its delta-seconds form. HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn default_timeout_secs() -> u64 {
    30
}
