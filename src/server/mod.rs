//! HTTP surface of the balancer.
//!
//! One hyper listener serves four routes: `/stats` and `/metrics` behind
//! the admin key, `/inactive-server` behind the user key, and everything
//! else is dispatched to a backend (also behind the user key). Handler
//! panics are caught per request and answered with a 500 so the
//! connection stays usable.

pub mod admin;
pub mod dispatch;

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use futures_util::FutureExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::auth::{self, UserAuth};
use crate::balance::{BackendCache, Node};
use crate::catalog::Catalog;
use crate::config::{BalancerMode, Settings};
use crate::metrics::Metrics;

pub(crate) type ResponseBody = UnsyncBoxBody<Bytes, io::Error>;

/// Everything a request handler needs, shared across connections.
pub struct SharedState {
    pub cache: Arc<BackendCache>,
    pub catalog: Arc<dyn Catalog>,
    pub metrics: Arc<Metrics>,
    pub mode: BalancerMode,
    pub(crate) api_key: String,
    pub(crate) admin_api_key: String,
    pub(crate) client: reqwest::Client,
}

impl SharedState {
    pub fn new(settings: &Settings, cache: Arc<BackendCache>, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            cache,
            catalog,
            metrics: Arc::new(Metrics::new()),
            mode: settings.mode,
            api_key: settings.api_key.clone(),
            admin_api_key: settings.admin_api_key.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Flip a backend inactive in the cache, then persist the flip. The
    /// in-memory state wins: a failed catalog write is logged and the
    /// reconciler converges the stores later.
    pub(crate) async fn deactivate_node(&self, node: &Node) {
        self.cache.deactivate(node);
        if let Err(e) = self.catalog.set_active(node.id(), false).await {
            warn!(
                backend = %node.url(),
                error = %e,
                "failed to persist backend deactivation"
            );
        }
    }
}

/// Accept loop. Runs until the shutdown signal flips.
pub async fn serve(
    listener: TcpListener,
    state: Arc<SharedState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => return Ok(()),
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { handle(state, req, remote_addr).await }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(remote = %remote_addr, error = %e, "connection closed with error");
            }
        });
    }
}

/// Route one request, converting a panicking handler into a 500.
async fn handle(
    state: Arc<SharedState>,
    req: Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<Response<ResponseBody>, Infallible> {
    let routed = std::panic::AssertUnwindSafe(route(state, req, remote_addr))
        .catch_unwind()
        .await;

    Ok(routed.unwrap_or_else(|_| {
        warn!(remote = %remote_addr, "request handler panicked");
        text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }))
}

async fn route(
    state: Arc<SharedState>,
    req: Request<Incoming>,
    remote_addr: SocketAddr,
) -> Response<ResponseBody> {
    let path = req.uri().path().to_string();
    debug!(method = %req.method(), path = %path, remote = %remote_addr, "received request");

    match path.as_str() {
        "/stats" => {
            if !auth::authorize_admin(req.headers(), &state.admin_api_key) {
                return auth_failure(remote_addr);
            }
            admin::handle_stats(&state).await
        }
        "/metrics" => {
            if !auth::authorize_admin(req.headers(), &state.admin_api_key) {
                return auth_failure(remote_addr);
            }
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full(state.metrics.render()))
                .unwrap()
        }
        "/inactive-server" => match user_gate(&state, &req, remote_addr) {
            Ok(forward_query) => admin::handle_mark_inactive(&state, forward_query.as_deref()).await,
            Err(response) => response,
        },
        _ => match user_gate(&state, &req, remote_addr) {
            Ok(forward_query) => dispatch::dispatch(&state, req, forward_query).await,
            Err(response) => response,
        },
    }
}

/// Apply the user API-key gate. On success, returns the query string to
/// forward (with the `key` parameter stripped).
fn user_gate(
    state: &SharedState,
    req: &Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<Option<String>, Response<ResponseBody>> {
    match auth::authorize_user(req.uri().query(), req.headers(), &state.api_key) {
        UserAuth::Allowed { forward_query } => Ok(forward_query),
        UserAuth::Denied => Err(auth_failure(remote_addr)),
        UserAuth::BadRequest => Err(text_response(
            StatusCode::BAD_REQUEST,
            "Invalid query parameters",
        )),
    }
}

fn auth_failure(remote_addr: SocketAddr) -> Response<ResponseBody> {
    warn!(
        target: "audit",
        event_type = "auth_failure",
        remote = %remote_addr,
        "request rejected"
    );
    text_response(StatusCode::UNAUTHORIZED, "Invalid API key")
}

pub(crate) fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into())
        .map_err(io::Error::other)
        .boxed_unsync()
}

pub(crate) fn text_response(status: StatusCode, message: &str) -> Response<ResponseBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(full(message.to_string()))
        .unwrap()
}
