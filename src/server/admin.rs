//! Operational endpoints: fleet stats and out-of-band deactivation.
//!
//! `/inactive-server` exists for clients of redirect mode: a client that
//! followed a 301 and got a 403 from the backend has no proxy in the path
//! to notice it, so it reports the dead backend here instead.

use hyper::{Response, StatusCode};
use tracing::{error, info};
use url::form_urlencoded;

use super::{ResponseBody, SharedState, full, text_response};

/// `GET /stats` - active-backend count and records, straight from the
/// catalog.
pub(crate) async fn handle_stats(state: &SharedState) -> Response<ResponseBody> {
    match state.catalog.list_active().await {
        Ok(servers) => {
            let body = serde_json::json!({
                "active_servers": servers.len(),
                "servers": servers,
            });
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(full(body.to_string()))
                .unwrap()
        }
        Err(e) => {
            error!(error = %e, "failed to list servers for stats");
            text_response(StatusCode::BAD_GATEWAY, "Failed to query the backend catalog")
        }
    }
}

/// `/inactive-server?node_id=<id>` - mark one backend inactive.
pub(crate) async fn handle_mark_inactive(
    state: &SharedState,
    query: Option<&str>,
) -> Response<ResponseBody> {
    let node_id = query.and_then(|q| {
        form_urlencoded::parse(q.as_bytes())
            .find(|(name, _)| name == "node_id")
            .map(|(_, value)| value.into_owned())
    });

    let Some(raw) = node_id else {
        return text_response(StatusCode::BAD_REQUEST, "Missing node_id query parameter");
    };
    let Ok(id) = raw.parse::<i32>() else {
        return text_response(StatusCode::BAD_REQUEST, "Invalid node_id query parameter");
    };

    let Some(node) = state.cache.find(id) else {
        return text_response(StatusCode::NOT_FOUND, "Node not found");
    };

    info!(backend = %node.url(), node_id = id, "backend reported inactive");
    state.deactivate_node(&node).await;
    text_response(StatusCode::OK, "")
}
