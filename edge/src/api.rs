//! Control-plane surface on the base domain: the `/tunnel` upgrade, health
//! and metrics, and the bearer-scoped REST API the CLI talks to.

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::info;
use uniroute_shared::{Error, Protocol, Result};

use crate::channel;
use crate::identity::Identity;
use crate::ingress_http::{replay_exchange, status_for};
use crate::recorder::{CapturedExchange, ExchangeFilter};
use crate::state::EdgeState;

pub fn control_router() -> Router<EdgeState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/tunnel", get(tunnel_upgrade))
        .route("/api/tunnels", get(list_tunnels))
        .route("/api/tunnels/:id", delete(close_tunnel))
        .route("/api/tunnels/:id/requests", get(list_requests))
        .route("/api/tunnels/:id/requests/:rid", get(get_request))
        .route("/api/tunnels/:id/requests/:rid/replay", post(replay_request))
        .route("/api/domains", post(add_domain).get(list_domains))
        .route("/api/domains/:id", get(get_domain).delete(remove_domain))
        .route("/api/domains/:id/verify", post(verify_domain))
        .route("/api/domains/:id/assign", post(assign_domain))
}

async fn healthz(State(state): State<EdgeState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "active_tunnels": state.registry.active_count(),
        "website": state.config.website_url,
    }))
}

async fn metrics(State(state): State<EdgeState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
}

// ── Control-channel upgrade ──

#[derive(Debug, Deserialize)]
struct TunnelParams {
    protocol: Option<String>,
    subdomain: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    resume: Option<String>,
}

/// `GET /tunnel`: authenticate, allocate (or resume), then switch
/// protocols. Failures surface as HTTP status codes before the upgrade.
async fn tunnel_upgrade(
    State(state): State<EdgeState>,
    Query(params): Query<TunnelParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => return api_error(&e),
    };
    if let Err(e) = state.identity.admit(&identity) {
        return api_error(&e);
    }

    let grant = if let Some(tunnel_id) = &params.resume {
        state.registry.resume(&identity.user_id, tunnel_id).await
    } else {
        let protocol = match params
            .protocol
            .as_deref()
            .unwrap_or("http")
            .parse::<Protocol>()
        {
            Ok(protocol) => protocol,
            Err(e) => return api_error(&e),
        };
        state
            .registry
            .open(
                &identity.user_id,
                protocol,
                params.subdomain.as_deref(),
                params.host.as_deref(),
                params.port,
            )
            .await
    };

    match grant {
        Ok(grant) => {
            info!(
                "control channel for {} ({}) upgrading",
                grant.tunnel_id, identity.user_id
            );
            let tunnel_id = grant.tunnel_id.clone();
            let mut response = ws.on_upgrade(move |socket| channel::serve(socket, state, grant));
            // The client needs the issued id to build its OPEN frame.
            if let Ok(value) = tunnel_id.parse() {
                response.headers_mut().insert("x-uniroute-tunnel-id", value);
            }
            response
        }
        Err(e) => api_error(&e),
    }
}

// ── Tunnels ──

async fn list_tunnels(State(state): State<EdgeState>, headers: HeaderMap) -> Response {
    let identity = match authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => return api_error(&e),
    };
    let live = state.registry.list_for_user(&identity.user_id).await;
    let live_ids: Vec<&str> = live.iter().map(|t| t.id.as_str()).collect();

    // Claims without a live record are resumable names.
    let claimed: Vec<serde_json::Value> = state
        .allocator
        .claims_for_user(&identity.user_id)
        .await
        .into_iter()
        .filter(|(_, claim)| !live_ids.contains(&claim.tunnel_id.as_str()))
        .map(|(subdomain, claim)| {
            json!({
                "id": claim.tunnel_id,
                "subdomain": subdomain,
                "protocol": claim.protocol,
                "state": "claimed",
                "last_used": claim.last_used,
            })
        })
        .collect();

    Json(json!({ "tunnels": live, "claims": claimed })).into_response()
}

async fn close_tunnel(
    State(state): State<EdgeState>,
    Path(tunnel_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => return api_error(&e),
    };
    match state.registry.close(&identity.user_id, &tunnel_id).await {
        Ok(()) => {
            state.recorder.forget(&tunnel_id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => api_error(&e),
    }
}

// ── Webhook recorder ──

#[derive(Debug, Deserialize)]
struct RequestFilterParams {
    method: Option<String>,
    status_class: Option<u16>,
    path_prefix: Option<String>,
    limit: Option<usize>,
}

async fn list_requests(
    State(state): State<EdgeState>,
    Path(tunnel_id): Path<String>,
    Query(params): Query<RequestFilterParams>,
    headers: HeaderMap,
) -> Response {
    let identity = match authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => return api_error(&e),
    };
    if let Err(e) = owned_tunnel(&state, &identity, &tunnel_id) {
        return api_error(&e);
    }
    let filter = ExchangeFilter {
        method: params.method,
        status_class: params.status_class,
        path_prefix: params.path_prefix,
        limit: params.limit,
    };
    let entries: Vec<serde_json::Value> = state
        .recorder
        .list(&tunnel_id, &filter)
        .iter()
        .map(|e| exchange_summary(e))
        .collect();
    Json(json!({ "requests": entries })).into_response()
}

async fn get_request(
    State(state): State<EdgeState>,
    Path((tunnel_id, request_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let identity = match authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => return api_error(&e),
    };
    if let Err(e) = owned_tunnel(&state, &identity, &tunnel_id) {
        return api_error(&e);
    }
    match state.recorder.get(&tunnel_id, &request_id) {
        Some(exchange) => Json(exchange_detail(&exchange)).into_response(),
        None => api_error(&Error::TunnelNotFound),
    }
}

async fn replay_request(
    State(state): State<EdgeState>,
    Path((tunnel_id, request_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let identity = match authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => return api_error(&e),
    };
    if let Err(e) = owned_tunnel(&state, &identity, &tunnel_id) {
        return api_error(&e);
    }
    match replay_exchange(&state, &tunnel_id, &request_id).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => api_error(&e),
    }
}

// ── Custom domains ──

#[derive(Debug, Deserialize)]
struct AddDomainBody {
    hostname: String,
}

async fn add_domain(
    State(state): State<EdgeState>,
    headers: HeaderMap,
    Json(body): Json<AddDomainBody>,
) -> Response {
    let identity = match authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => return api_error(&e),
    };
    match state.domains.add(&identity.user_id, &body.hostname).await {
        Ok(domain) => (StatusCode::CREATED, Json(domain_json(&domain))).into_response(),
        Err(e) => api_error(&e),
    }
}

async fn list_domains(State(state): State<EdgeState>, headers: HeaderMap) -> Response {
    let identity = match authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => return api_error(&e),
    };
    let domains: Vec<serde_json::Value> = state
        .domains
        .list_for_user(&identity.user_id)
        .await
        .iter()
        .map(domain_json)
        .collect();
    Json(json!({ "domains": domains })).into_response()
}

async fn get_domain(
    State(state): State<EdgeState>,
    Path(domain_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => return api_error(&e),
    };
    match state.domains.get(&identity.user_id, &domain_id).await {
        Ok(domain) => Json(domain_json(&domain)).into_response(),
        Err(e) => api_error(&e),
    }
}

async fn verify_domain(
    State(state): State<EdgeState>,
    Path(domain_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => return api_error(&e),
    };
    match state.domains.verify(&identity.user_id, &domain_id).await {
        Ok(domain) => Json(domain_json(&domain)).into_response(),
        Err(e) => api_error(&e),
    }
}

#[derive(Debug, Deserialize)]
struct AssignDomainBody {
    tunnel_id: String,
}

async fn assign_domain(
    State(state): State<EdgeState>,
    Path(domain_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<AssignDomainBody>,
) -> Response {
    let identity = match authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => return api_error(&e),
    };
    // Custom domains bind to the caller's own HTTP tunnels only.
    let Some(entry) = state.registry.get(&body.tunnel_id) else {
        return api_error(&Error::TunnelNotFound);
    };
    if entry.user_id != identity.user_id {
        return api_error(&Error::TunnelNotFound);
    }
    if entry.protocol != Protocol::Http {
        return api_error(&Error::invalid("custom domains require an http tunnel"));
    }
    match state
        .domains
        .assign(&identity.user_id, &domain_id, &body.tunnel_id)
        .await
    {
        Ok(domain) => Json(domain_json(&domain)).into_response(),
        Err(e) => api_error(&e),
    }
}

async fn remove_domain(
    State(state): State<EdgeState>,
    Path(domain_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let identity = match authenticate(&state, &headers).await {
        Ok(identity) => identity,
        Err(e) => return api_error(&e),
    };
    match state.domains.remove(&identity.user_id, &domain_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => api_error(&e),
    }
}

// ── Helpers ──

async fn authenticate(state: &EdgeState, headers: &HeaderMap) -> Result<Identity> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(Error::AuthFailed)?;
    state.identity.authenticate(bearer).await
}

fn owned_tunnel(state: &EdgeState, identity: &Identity, tunnel_id: &str) -> Result<()> {
    let entry = state.registry.get(tunnel_id).ok_or(Error::TunnelNotFound)?;
    if entry.user_id != identity.user_id {
        return Err(Error::TunnelNotFound);
    }
    Ok(())
}

fn api_error(error: &Error) -> Response {
    let status = status_for(error);
    let body = if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("internal error on control plane: {error}");
        json!({ "error": "internal error" })
    } else {
        json!({ "error": error.to_string() })
    };
    (status, Json(body)).into_response()
}

fn domain_json(domain: &crate::domains::CustomDomain) -> serde_json::Value {
    json!({
        "id": domain.id,
        "hostname": domain.hostname,
        "dns_configured": domain.dns_configured,
        "verified_at": domain.verified_at,
        "tunnel_id": domain.tunnel_id,
    })
}

fn exchange_summary(exchange: &CapturedExchange) -> serde_json::Value {
    json!({
        "request_id": exchange.request_id,
        "method": exchange.method,
        "path": exchange.path,
        "query": exchange.query,
        "status": exchange.status,
        "latency_ms": exchange.latency_ms,
        "request_size": exchange.request_size,
        "response_size": exchange.response_size,
        "remote_addr": exchange.remote_addr,
        "created_at": exchange.created_at,
    })
}

fn exchange_detail(exchange: &CapturedExchange) -> serde_json::Value {
    let mut detail = exchange_summary(exchange);
    detail["req_headers"] = json!(exchange.req_headers);
    detail["resp_headers"] = json!(exchange.resp_headers);
    detail["req_body"] = json!(String::from_utf8_lossy(&exchange.req_body));
    detail["req_body_truncated"] = json!(exchange.req_body_truncated);
    detail["resp_body"] = json!(String::from_utf8_lossy(&exchange.resp_body));
    detail["resp_body_truncated"] = json!(exchange.resp_body_truncated);
    detail
}
