//! Router assembly: control plane on the edge's own hostname, public
//! proxy for everything else.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;

use crate::api;
use crate::domains::normalize_host;
use crate::ingress_http;
use crate::state::EdgeState;

pub fn build_router(state: EdgeState) -> Router {
    api::control_router()
        .fallback(control_fallback)
        .layer(middleware::from_fn_with_state(state.clone(), host_gate))
        .with_state(state)
}

/// Requests for the edge's own hostname reach the control plane; every
/// other Host is public traffic for a tunnel.
async fn host_gate(State(state): State<EdgeState>, req: Request, next: Next) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(normalize_host)
        .unwrap_or_default();

    if is_control_host(&state, &host) {
        return next.run(req).await;
    }

    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    ingress_http::handle_public_request(state, remote, req).await
}

/// The base domain itself, plus direct access (IP or localhost) so health
/// probes and local development work without DNS.
fn is_control_host(state: &EdgeState, host: &str) -> bool {
    host.is_empty()
        || host == state.config.base_domain
        || host == "localhost"
        || host.parse::<std::net::IpAddr>().is_ok()
}

async fn control_fallback() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}
