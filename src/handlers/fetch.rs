//! `fetch` action: relay an HTTP request through the host session.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::{debug, instrument};

use super::Reply;
use crate::host::{FetchRequest, FetchResponse, Fetcher};
use crate::transport::protocol::{FetchParams, Response};

/// Run a fetch request and build its reply.
///
/// The response body becomes the frame payload. Failures (network error,
/// timeout, bad options) are reported in `error` with no payload and are
/// never retried here.
#[instrument(skip_all, fields(event_id = %event_id, url = %params.url))]
pub async fn handle(
    fetcher: &dyn Fetcher,
    event_id: Value,
    params: FetchParams,
    body: Option<Vec<u8>>,
) -> Reply {
    match run(fetcher, params, body).await {
        Ok(resp) => {
            debug!(status = resp.status, "Fetch succeeded");
            Reply {
                response: Response::Fetched {
                    event_id,
                    headers: flatten_headers(resp.headers),
                    ok: resp.ok,
                    redirected: resp.redirected,
                    status: resp.status,
                    status_text: resp.status_text,
                    kind: resp.kind,
                    url: resp.url,
                },
                payload: Some(resp.body),
            }
        }
        Err(e) => {
            debug!(error = %format!("{e:#}"), "Fetch failed");
            Reply::control(Response::error(event_id, format!("{e:#}")))
        }
    }
}

async fn run(fetcher: &dyn Fetcher, params: FetchParams, body: Option<Vec<u8>>) -> Result<FetchResponse> {
    let FetchParams {
        url,
        options,
        timeout,
    } = params;
    let request = FetchRequest {
        url,
        options: options.unwrap_or_default(),
        body,
    };

    let Some(seconds) = timeout else {
        return fetcher.fetch(request).await;
    };
    let limit = Duration::try_from_secs_f64(seconds)
        .map_err(|_| anyhow!("TypeError: invalid timeout {seconds}"))?;

    // Dropping the fetch future on expiry aborts the request.
    tokio::time::timeout(limit, fetcher.fetch(request))
        .await
        .map_err(|_| anyhow!("TimeoutError: request aborted after {seconds}s"))?
}

/// Collapse header entries into one value per name; the last entry wins.
fn flatten_headers(headers: Vec<(String, String)>) -> BTreeMap<String, String> {
    headers.into_iter().collect()
}
