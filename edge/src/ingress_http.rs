//! Public HTTP ingress.
//!
//! Resolves the Host header to a tunnel, converts the request into a REQ
//! envelope, awaits the response head, and streams body chunks back without
//! buffering. Websocket upgrades switch to stream mode on a fresh session.

use axum::body::Body;
use axum::http::{header, request::Parts, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};
use uniroute_shared::frame::{Frame, Headers, Req, StreamOpen};
use uniroute_shared::{Error, Result};
use uuid::Uuid;

use crate::domains::normalize_host;
use crate::headers::{prepare_request_headers, prepare_response_headers};
use crate::ingress_stream::bridge_io;
use crate::recorder::CapturedExchange;
use crate::registry::ActiveRoute;
use crate::state::EdgeState;
use crate::tracker::BodyStream;

const WS_ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Entry point for every public request whose Host is not the edge's own.
pub async fn handle_public_request(
    state: EdgeState,
    remote_addr: Option<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(normalize_host)
        .unwrap_or_default();

    let route = match resolve_route(&state, &host) {
        Ok(route) => route,
        Err(e) => return error_response(&e),
    };
    let subdomain = state
        .registry
        .get(&route.tunnel_id)
        .map(|t| t.subdomain.clone())
        .unwrap_or_default();

    if is_websocket_upgrade(req.headers()) {
        return websocket_passthrough(state, route, req, remote_addr).await;
    }

    proxy_http(state, route, subdomain, host, req, remote_addr).await
}

/// Hostname → active tunnel route: subdomains of the base domain first,
/// then bound custom hostnames.
fn resolve_route(state: &EdgeState, host: &str) -> Result<ActiveRoute> {
    let suffix = format!(".{}", state.config.base_domain);
    if let Some(label) = host.strip_suffix(&suffix) {
        if label.is_empty() || label.contains('.') {
            return Err(Error::TunnelNotFound);
        }
        return state.registry.route_by_subdomain(label);
    }
    state.registry.route_by_hostname(host)
}

fn is_websocket_upgrade(headers: &axum::http::HeaderMap) -> bool {
    let upgrade_ws = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let connection_upgrade = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("upgrade"))
        .unwrap_or(false);
    upgrade_ws && connection_upgrade
}

async fn proxy_http(
    state: EdgeState,
    route: ActiveRoute,
    subdomain: String,
    host: String,
    req: Request<Body>,
    remote_addr: Option<SocketAddr>,
) -> Response {
    let start = Instant::now();
    let (parts, body) = req.into_parts();

    let method = parts.method.to_string();
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());
    let remote = remote_addr.map(|a| a.to_string()).unwrap_or_default();
    let client_ip = remote_addr.map(|a| a.ip().to_string());

    let mut headers: Headers = parts
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    prepare_request_headers(&mut headers, client_ip.as_deref(), &host, false);

    let body_bytes = match axum::body::to_bytes(body, state.config.max_body_bytes).await {
        Ok(b) => Bytes::from(b),
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
        }
    };
    let request_size = body_bytes.len() as u64;

    // Fair-queue share: one slot per in-flight request.
    let permit = match route.channel.acquire_slot() {
        Ok(permit) => permit,
        Err(e) => return error_response(&e),
    };

    let request_id = Uuid::new_v4().simple().to_string();
    let pending = match route
        .channel
        .tracker()
        .register(&request_id, state.config.request_timeout)
    {
        Ok(pending) => pending,
        Err(e) => return error_response(&e),
    };

    let (req_capture, req_truncated) = state.recorder.clamp_body(&body_bytes);
    let mut capture = CaptureContext {
        state: state.clone(),
        route: route.clone(),
        subdomain,
        request_id: request_id.clone(),
        method: method.clone(),
        path: path.clone(),
        remote,
        req_headers: headers.clone(),
        req_capture,
        req_truncated,
        request_size,
        status: 0,
        resp_headers: Vec::new(),
        resp_accum: BytesMut::new(),
        resp_truncated: false,
        response_size: 0,
        start,
        finished: false,
        _permit: Some(permit),
    };

    if let Err(e) = route.channel.try_send(Frame::Req(Req {
        request_id: request_id.clone(),
        method,
        path,
        headers,
        body: body_bytes,
    })) {
        route.channel.tracker().cancel(&request_id);
        capture.status = status_for(&e).as_u16();
        capture.finish();
        return error_response(&e);
    }
    state.registry.note_request(&route.tunnel_id);

    match pending.wait(state.config.request_timeout).await {
        Ok((head, body_rx)) => {
            capture.status = head.status;
            let mut resp_headers = head.headers;
            prepare_response_headers(&mut resp_headers);
            capture.resp_headers = resp_headers.clone();

            let mut builder = axum::http::Response::builder().status(
                StatusCode::from_u16(head.status).unwrap_or(StatusCode::BAD_GATEWAY),
            );
            if let Some(map) = builder.headers_mut() {
                for (k, v) in &resp_headers {
                    if let (Ok(name), Ok(value)) = (
                        HeaderName::from_bytes(k.as_bytes()),
                        HeaderValue::from_str(v),
                    ) {
                        map.append(name, value);
                    }
                }
            }

            let stream = ResponseCapture {
                rx: body_rx,
                capture: Some(capture),
            };
            builder
                .body(Body::from_stream(stream))
                .map(IntoResponse::into_response)
                .unwrap_or_else(|_| {
                    (StatusCode::INTERNAL_SERVER_ERROR, "response build error").into_response()
                })
        }
        Err(e) => {
            // One outcome only: drop the entry so late frames are ignored,
            // and tell the client to abort its upstream call.
            route.channel.tracker().cancel(&request_id);
            let _ = route.channel.try_send(Frame::error(&request_id, &e));
            capture.status = status_for(&e).as_u16();
            capture.finish();
            error_response(&e)
        }
    }
}

/// Everything needed to record the exchange once, however it ends.
struct CaptureContext {
    state: EdgeState,
    route: ActiveRoute,
    subdomain: String,
    request_id: String,
    method: String,
    path: String,
    remote: String,
    req_headers: Headers,
    req_capture: Bytes,
    req_truncated: bool,
    request_size: u64,
    status: u16,
    resp_headers: Headers,
    resp_accum: BytesMut,
    resp_truncated: bool,
    response_size: u64,
    start: Instant,
    finished: bool,
    _permit: Option<OwnedSemaphorePermit>,
}

impl CaptureContext {
    fn push_chunk(&mut self, chunk: &Bytes) {
        self.response_size += chunk.len() as u64;
        let cap = self.state.recorder.capture_max();
        if self.resp_accum.len() < cap {
            let room = cap - self.resp_accum.len();
            if chunk.len() > room {
                self.resp_accum.extend_from_slice(&chunk[..room]);
                self.resp_truncated = true;
            } else {
                self.resp_accum.extend_from_slice(chunk);
            }
        } else if !chunk.is_empty() {
            self.resp_truncated = true;
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let latency = self.start.elapsed();
        let (path, query) = match self.path.split_once('?') {
            Some((p, q)) => (p.to_string(), q.to_string()),
            None => (self.path.clone(), String::new()),
        };
        self.state.recorder.record(
            &self.route.tunnel_id,
            CapturedExchange {
                request_id: self.request_id.clone(),
                method: self.method.clone(),
                path,
                query,
                status: self.status,
                latency_ms: latency.as_millis() as u64,
                request_size: self.request_size,
                response_size: self.response_size,
                remote_addr: self.remote.clone(),
                req_headers: std::mem::take(&mut self.req_headers),
                resp_headers: std::mem::take(&mut self.resp_headers),
                req_body: self.req_capture.clone(),
                req_body_truncated: self.req_truncated,
                resp_body: self.resp_accum.clone().freeze(),
                resp_body_truncated: self.resp_truncated,
                created_at: chrono::Utc::now(),
            },
        );
        self.state.metrics.record_request(
            &self.subdomain,
            self.status,
            latency.as_micros() as u64,
            self.request_size,
            self.response_size,
        );
        self._permit.take();
    }
}

impl Drop for CaptureContext {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // The public caller went away before an outcome: drop the tracker
        // entry so late frames are discarded, and tell the client to abort
        // its upstream call.
        self.route.channel.tracker().cancel(&self.request_id);
        let _ = self
            .route
            .channel
            .try_send(Frame::error(&self.request_id, &Error::Cancelled));
        if self.status == 0 {
            self.status = 499;
        }
        self.finish();
    }
}

/// Streams RESP_BODY chunks to the caller while teeing a bounded copy into
/// the recorder. Dropping it mid-stream means the caller went away: the
/// client gets ERR(cancelled) and the tracker entry is dropped.
struct ResponseCapture {
    rx: BodyStream,
    capture: Option<CaptureContext>,
}

impl Stream for ResponseCapture {
    type Item = std::result::Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(capture) = self.capture.as_mut() {
                    capture.push_chunk(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Tunnel-side failure mid-stream; abort the connection.
                if let Some(mut capture) = self.capture.take() {
                    capture.finish();
                }
                Poll::Ready(Some(Err(std::io::Error::other(e.to_string()))))
            }
            Poll::Ready(None) => {
                if let Some(mut capture) = self.capture.take() {
                    capture.finish();
                }
                Poll::Ready(None)
            }
        }
    }
}


/// Switch a recognised websocket upgrade into stream mode: the original
/// request head travels as the first STREAM_DATA and raw bytes are bridged
/// after the 101.
async fn websocket_passthrough(
    state: EdgeState,
    route: ActiveRoute,
    mut req: Request<Body>,
    remote_addr: Option<SocketAddr>,
) -> Response {
    let Some(ws_key) = req
        .headers()
        .get("sec-websocket-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        return (StatusCode::BAD_REQUEST, "missing websocket key").into_response();
    };
    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        return (StatusCode::BAD_REQUEST, "connection is not upgradable").into_response();
    };

    let (parts, _body) = req.into_parts();
    let session_id = Uuid::new_v4().simple().to_string();
    let mailbox = match route.channel.register_session(&session_id) {
        Ok(mailbox) => mailbox,
        Err(e) => return error_response(&e),
    };
    let peer = remote_addr.map(|a| a.to_string()).unwrap_or_default();

    if let Err(e) = route.channel.try_send(Frame::StreamOpen(StreamOpen {
        session_id: session_id.clone(),
        tunnel_id: route.tunnel_id.clone(),
        peer_addr: peer.clone(),
    })) {
        route.channel.close_session(&session_id, None);
        return error_response(&e);
    }

    // The client replays this head against its local server and strips
    // that server's 101 before piping raw bytes.
    let head = serialize_request_head(&parts, remote_addr);
    if route
        .channel
        .send(Frame::StreamData(uniroute_shared::frame::StreamData {
            session_id: session_id.clone(),
            data: head,
        }))
        .await
        .is_err()
    {
        route.channel.close_session(&session_id, None);
        return error_response(&Error::TunnelDisconnected);
    }
    state.registry.note_request(&route.tunnel_id);

    let accept = ws_accept_key(&ws_key);
    let metrics = state.metrics.clone();
    let channel = route.channel.clone();
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                metrics.stream_opened();
                bridge_io(TokioIo::new(upgraded), session_id, channel, mailbox).await;
                metrics.stream_closed();
            }
            Err(e) => {
                debug!("public upgrade failed: {e}");
                channel.close_session(&session_id, Some(Error::Cancelled));
            }
        }
    });

    axum::http::Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header("sec-websocket-accept", accept)
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn serialize_request_head(parts: &Parts, remote_addr: Option<SocketAddr>) -> Bytes {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.to_string())
        .unwrap_or_else(|| "/".to_string());
    let mut headers: Headers = parts
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    prepare_request_headers(
        &mut headers,
        remote_addr.map(|a| a.ip().to_string()).as_deref(),
        &host,
        true,
    );

    let mut head = format!("{} {} HTTP/1.1\r\n", parts.method, path);
    for (k, v) in &headers {
        head.push_str(&format!("{k}: {v}\r\n"));
    }
    head.push_str("\r\n");
    Bytes::from(head)
}

/// Outcome of a webhook replay.
#[derive(Debug, serde::Serialize)]
pub struct ReplaySummary {
    pub request_id: String,
    pub replayed_from: String,
    pub status: u16,
    pub response_size: u64,
}

/// Re-issue a captured request through the normal envelope path with a
/// fresh request id. The new exchange is captured like any other.
pub async fn replay_exchange(
    state: &EdgeState,
    tunnel_id: &str,
    request_id: &str,
) -> Result<ReplaySummary> {
    let exchange = state
        .recorder
        .get(tunnel_id, request_id)
        .ok_or(Error::TunnelNotFound)?;
    let route = state.registry.route_by_tunnel(tunnel_id)?;
    let entry = state.registry.get(tunnel_id).ok_or(Error::TunnelNotFound)?;

    let permit = route.channel.acquire_slot()?;
    let new_id = Uuid::new_v4().simple().to_string();
    let pending = route
        .channel
        .tracker()
        .register(&new_id, state.config.request_timeout)?;

    let path = if exchange.query.is_empty() {
        exchange.path.clone()
    } else {
        format!("{}?{}", exchange.path, exchange.query)
    };
    let (req_capture, req_truncated) = state.recorder.clamp_body(&exchange.req_body);
    let mut capture = CaptureContext {
        state: state.clone(),
        route: route.clone(),
        subdomain: entry.subdomain.clone(),
        request_id: new_id.clone(),
        method: exchange.method.clone(),
        path: path.clone(),
        remote: "replay".to_string(),
        req_headers: exchange.req_headers.clone(),
        req_capture,
        req_truncated,
        request_size: exchange.req_body.len() as u64,
        status: 0,
        resp_headers: Vec::new(),
        resp_accum: BytesMut::new(),
        resp_truncated: false,
        response_size: 0,
        start: Instant::now(),
        finished: false,
        _permit: Some(permit),
    };

    if let Err(e) = route.channel.try_send(Frame::Req(Req {
        request_id: new_id.clone(),
        method: exchange.method.clone(),
        path,
        headers: exchange.req_headers.clone(),
        body: exchange.req_body.clone(),
    })) {
        route.channel.tracker().cancel(&new_id);
        capture.status = status_for(&e).as_u16();
        capture.finish();
        return Err(e);
    }
    state.registry.note_request(tunnel_id);

    match pending.wait(state.config.request_timeout).await {
        Ok((head, body_rx)) => {
            capture.status = head.status;
            let mut resp_headers = head.headers;
            prepare_response_headers(&mut resp_headers);
            capture.resp_headers = resp_headers;

            let status = head.status;
            let mut stream = ResponseCapture {
                rx: body_rx,
                capture: Some(capture),
            };
            let mut response_size = 0u64;
            use futures_util::StreamExt;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(chunk) => response_size += chunk.len() as u64,
                    Err(_) => break,
                }
            }
            Ok(ReplaySummary {
                request_id: new_id,
                replayed_from: request_id.to_string(),
                status,
                response_size,
            })
        }
        Err(e) => {
            route.channel.tracker().cancel(&new_id);
            let _ = route.channel.try_send(Frame::error(&new_id, &e));
            capture.status = status_for(&e).as_u16();
            capture.finish();
            Err(e)
        }
    }
}

fn ws_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_ACCEPT_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

pub fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::AuthFailed => StatusCode::UNAUTHORIZED,
        Error::InvalidArgument(_) | Error::Protocol(_) => StatusCode::BAD_REQUEST,
        Error::SubdomainTaken(_) | Error::CustomDomainConflict(_) | Error::Duplicate(_) => {
            StatusCode::CONFLICT
        }
        Error::TunnelNotFound => StatusCode::NOT_FOUND,
        Error::TunnelInactive | Error::TunnelDisconnected | Error::Refused => {
            StatusCode::BAD_GATEWAY
        }
        Error::Timeout => StatusCode::GATEWAY_TIMEOUT,
        // A cancelled caller never sees the response anyway.
        Error::Cancelled => StatusCode::BAD_GATEWAY,
        Error::Capacity => StatusCode::SERVICE_UNAVAILABLE,
        Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(error: &Error) -> Response {
    let status = status_for(error);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!("internal error surfaced to caller: {error}");
        return (status, "internal error").into_response();
    }
    let body = match error {
        Error::TunnelNotFound => "not found",
        Error::TunnelInactive | Error::TunnelDisconnected => "tunnel unavailable",
        Error::Timeout => "upstream timeout",
        Error::Capacity => "service busy",
        _ => "request rejected",
    };
    (status, body).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_accept_key_rfc_example() {
        // RFC 6455 §1.3 handshake example.
        assert_eq!(
            ws_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&Error::Timeout), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            status_for(&Error::TunnelDisconnected),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(status_for(&Error::Capacity), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(&Error::TunnelNotFound), StatusCode::NOT_FOUND);
    }
}
