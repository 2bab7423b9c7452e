//! Request dispatch: pick a backend, admit, then proxy or redirect.
//!
//! Every request gets a bounded number of attempts. One attempt is
//! consumed whether the chosen backend was out of tokens, unreachable, or
//! already purged; this caps the worst-case work per request no matter how
//! unhealthy the fleet is.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::http::request::Parts;
use hyper::header::{HeaderMap, LOCATION};
use hyper::{Request, Response, StatusCode};
use futures_util::TryStreamExt;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::{ResponseBody, SharedState, full, text_response};
use crate::balance::Node;
use crate::config::BalancerMode;

/// Upper bound on backends tried for one request.
pub const MAX_ATTEMPTS: usize = 5;

#[derive(Debug, Error)]
enum DispatchError {
    /// The ring is empty: nothing is active.
    #[error("no active RPC backends available")]
    NoCapacity,
    /// Every attempt was eaten by rate limiting or transport failures.
    #[error("all RPC backends are busy")]
    AllBusy,
}

/// Entry point for the catch-all route.
pub(crate) async fn dispatch(
    state: &Arc<SharedState>,
    req: Request<Incoming>,
    forward_query: Option<String>,
) -> Response<ResponseBody> {
    state.metrics.inc_total_requests();

    let (parts, body) = req.into_parts();

    // Buffered once so a failed attempt can resend it.
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, "failed to read request body");
            return text_response(StatusCode::BAD_REQUEST, "Failed to read request body");
        }
    };

    match try_dispatch(state, &parts, body, forward_query.as_deref()).await {
        Ok(response) => response,
        Err(DispatchError::NoCapacity) => {
            text_response(StatusCode::SERVICE_UNAVAILABLE, "No active RPC nodes available")
        }
        Err(DispatchError::AllBusy) => {
            state.metrics.inc_total_rate_limit_hits();
            text_response(
                StatusCode::TOO_MANY_REQUESTS,
                "All RPC nodes are busy at the moment",
            )
        }
    }
}

async fn try_dispatch(
    state: &Arc<SharedState>,
    parts: &Parts,
    body: Bytes,
    forward_query: Option<&str>,
) -> Result<Response<ResponseBody>, DispatchError> {
    for _ in 0..MAX_ATTEMPTS {
        let Some(node) = state.cache.next_active() else {
            return Err(DispatchError::NoCapacity);
        };

        if !node.admit() {
            state.metrics.inc_node_rate_limit_hits(node.url());
            continue;
        }
        state.metrics.inc_node_requests(node.url());

        let target = match compose_target(node.url(), parts.uri.path(), forward_query) {
            Ok(url) => url,
            Err(e) => {
                state.metrics.inc_node_errors(node.url());
                warn!(backend = %node.url(), error = %e, "unusable backend URL");
                continue;
            }
        };

        match state.mode {
            BalancerMode::Redirect => return Ok(redirect(state, &node, &target)),
            BalancerMode::Proxy => match forward(state, &node, parts, body.clone(), &target).await
            {
                Ok(response) => return Ok(response),
                Err(e) => {
                    state.metrics.inc_node_errors(node.url());
                    warn!(backend = %node.url(), error = %e, "upstream request failed");
                    continue;
                }
            },
        }
    }
    Err(DispatchError::AllBusy)
}

/// Target URL: origin from the backend, path joined under the backend's
/// base path, query passed through verbatim (the auth gate already
/// removed the `key` parameter).
fn compose_target(base: &str, path: &str, query: Option<&str>) -> anyhow::Result<Url> {
    let mut url = Url::parse(base)?;
    let joined = join_paths(url.path(), path);
    url.set_path(&joined);
    url.set_query(query);
    Ok(url)
}

fn join_paths(base: &str, request: &str) -> String {
    let base = base.trim_end_matches('/');
    let request = request.trim_start_matches('/');
    match (base.is_empty(), request.is_empty()) {
        (_, true) if base.is_empty() => "/".to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base}/{request}"),
    }
}

fn redirect(state: &SharedState, node: &Node, target: &Url) -> Response<ResponseBody> {
    let start = Instant::now();
    let response = Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, target.as_str())
        .body(full(Bytes::new()))
        .unwrap();
    state.metrics.observe_latency(node.url(), start.elapsed());
    response
}

async fn forward(
    state: &Arc<SharedState>,
    node: &Arc<Node>,
    parts: &Parts,
    body: Bytes,
    target: &Url,
) -> anyhow::Result<Response<ResponseBody>> {
    let start = Instant::now();

    let upstream = state
        .client
        .request(parts.method.clone(), target.as_str())
        .headers(forwardable_headers(&parts.headers))
        .body(body)
        .send()
        .await?;

    state.metrics.observe_latency(node.url(), start.elapsed());

    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop_header(name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    // The backend revoked us: take it out of rotation without delaying
    // this response. The probe loop brings it back if it recovers.
    if status == StatusCode::FORBIDDEN {
        let state = Arc::clone(state);
        let node = Arc::clone(node);
        tokio::spawn(async move {
            state.deactivate_node(&node).await;
        });
    }

    Ok(builder.body(stream_body(upstream))?)
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| {
            let name = name.as_str();
            name != "host" && !is_hop_by_hop_header(name)
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Stream the upstream body through without buffering it.
fn stream_body(upstream: reqwest::Response) -> ResponseBody {
    let stream = upstream
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(std::io::Error::other);
    StreamBody::new(stream).boxed_unsync()
}

fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
