//! Size and range-support discovery before a download starts.

use reqwest::Client;
use tracing::{debug, warn};

use crate::errors::{RuntimeError, RuntimeResult};

/// What the remote told us about the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub total_size: u64,
    pub accepts_ranges: bool,
}

/// Discover the body size and whether byte ranges are honoured.
///
/// A HEAD request is tried first; servers that reject HEAD or omit
/// `Content-Length` get a 1 KiB ranged GET whose `Content-Range` carries the
/// total. When neither yields a size the download cannot be planned.
pub async fn probe(client: &Client, url: &str) -> RuntimeResult<ProbeResult> {
    match probe_head(client, url).await {
        Ok(Some(result)) => return Ok(result),
        Ok(None) => debug!(%url, "HEAD gave no usable size, falling back to ranged GET"),
        Err(e) => warn!(%url, "HEAD probe failed: {e}, falling back to ranged GET"),
    }

    probe_range(client, url).await
}

async fn probe_head(client: &Client, url: &str) -> RuntimeResult<Option<ProbeResult>> {
    let response = client
        .head(url)
        .send()
        .await
        .map_err(|e| RuntimeError::Network(format!("HEAD {url}: {e}")))?;

    if !response.status().is_success() {
        return Err(RuntimeError::Network(format!(
            "HEAD {url}: status {}",
            response.status()
        )));
    }

    let accepts_ranges = response
        .headers()
        .get(reqwest::header::ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    let total_size = response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    Ok(total_size.map(|total_size| ProbeResult {
        total_size,
        accepts_ranges,
    }))
}

async fn probe_range(client: &Client, url: &str) -> RuntimeResult<ProbeResult> {
    let response = client
        .get(url)
        .header(reqwest::header::RANGE, "bytes=0-1023")
        .send()
        .await
        .map_err(|e| RuntimeError::Network(format!("GET {url}: {e}")))?;

    let status = response.status();
    if status == reqwest::StatusCode::PARTIAL_CONTENT {
        if let Some(total) = response
            .headers()
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
        {
            return Ok(ProbeResult {
                total_size: total,
                accepts_ranges: true,
            });
        }
        return Err(RuntimeError::UnknownSize(url.to_string()));
    }

    if status.is_success() {
        // Server ignored the range; a Content-Length still gives the size
        // but forces single-chunk mode.
        if let Some(total) = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            return Ok(ProbeResult {
                total_size: total,
                accepts_ranges: false,
            });
        }
        return Err(RuntimeError::UnknownSize(url.to_string()));
    }

    Err(RuntimeError::Network(format!("GET {url}: status {status}")))
}

/// Total from a `Content-Range: bytes a-b/N` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim();
    let (_, total) = rest.rsplit_once('/')?;
    total.trim().parse().ok()
}
