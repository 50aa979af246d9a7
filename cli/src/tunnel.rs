//! Client-side tunnel runtime.
//!
//! Connects the control channel, answers REQ envelopes against the local
//! target, bridges stream sessions, and reconnects with backoff when the
//! channel drops.

use anyhow::{anyhow, Context};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use uniroute_shared::codec::{encode, FrameAssembler};
use uniroute_shared::frame::{
    ErrFrame, Frame, Open, OpenAck, Req, RespBody, RespHead, StreamClose, StreamData, StreamOpen,
    PROTOCOL_VERSION,
};
use uniroute_shared::{ErrorKind, Protocol};

use crate::config::{self, Auth, TunnelRecord};
use crate::error::{CliError, CliResult};

/// Header the edge sets on the 101 with the issued tunnel id.
const TUNNEL_ID_HEADER: &str = "x-uniroute-tunnel-id";

const OUTBOUND_QUEUE: usize = 256;
const MAX_RECONNECT_FAILURES: u32 = 10;
const UDP_IDLE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub protocol: Protocol,
    pub local_target: String,
    pub desired_subdomain: Option<String>,
    pub desired_host: Option<String>,
    pub desired_port: Option<u16>,
    pub resume: Option<String>,
}

enum SessionEnd {
    /// Channel dropped; try to resume.
    Reconnect,
    /// Clean exit (ctrl-c, superseded, or closed by the edge).
    Quit,
}

/// Run a tunnel until the user stops it, reconnecting on channel loss.
pub async fn run_tunnel(auth: &Auth, mut opts: TunnelOptions) -> CliResult<()> {
    let mut failures: u32 = 0;
    let mut first = true;

    loop {
        match connect_and_serve(auth, &opts, first).await {
            Ok((SessionEnd::Quit, _)) => return Ok(()),
            Ok((SessionEnd::Reconnect, tunnel_id)) => {
                failures = 0;
                first = false;
                if let Some(id) = tunnel_id {
                    // Resume keeps the subdomain and port inside the grace
                    // window.
                    opts.resume = Some(id);
                }
            }
            Err(e) if first => return Err(e),
            Err(e) => {
                failures += 1;
                if failures > MAX_RECONNECT_FAILURES {
                    return Err(CliError::Other(anyhow!(
                        "giving up after {MAX_RECONNECT_FAILURES} reconnect attempts: {e}"
                    )));
                }
                warn!("reconnect failed: {e}");
            }
        }

        let delay = backoff_delay(failures);
        info!("reconnecting in {:.1}s", delay.as_secs_f64());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

/// Exponential backoff with jitter, bounded at one minute.
fn backoff_delay(failures: u32) -> Duration {
    let base = Duration::from_secs(1 << failures.min(6));
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    base.mul_f64(jitter).min(Duration::from_secs(60))
}

async fn connect_and_serve(
    auth: &Auth,
    opts: &TunnelOptions,
    announce: bool,
) -> CliResult<(SessionEnd, Option<String>)> {
    let url = upgrade_url(&auth.server, opts)?;
    let mut request = url
        .clone()
        .into_client_request()
        .context("invalid server URL")?;
    request.headers_mut().insert(
        AUTHORIZATION,
        format!("Bearer {}", auth.token)
            .parse()
            .context("token contains invalid characters")?,
    );

    debug!("connecting control channel: {url}");
    let (ws, response) = match tokio_tungstenite::connect_async(request).await {
        Ok(ok) => ok,
        Err(WsError::Http(response)) => {
            let status = response.status().as_u16();
            let context = response
                .body()
                .as_deref()
                .map(|b| String::from_utf8_lossy(b).to_string())
                .unwrap_or_default();
            return Err(CliError::from_status(status, context.trim()));
        }
        Err(e) => return Err(CliError::Other(anyhow!("connection failed: {e}"))),
    };

    let tunnel_id = response
        .headers()
        .get(TUNNEL_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("edge did not issue a tunnel id"))?;

    let (mut ws_tx, mut ws_rx) = ws.split();

    // OPEN confirms the grant and advertises the local target.
    send_frame(&mut ws_tx, &Frame::Open(Open {
        version: PROTOCOL_VERSION,
        tunnel_id: tunnel_id.clone(),
        local_target: opts.local_target.clone(),
    }))
    .await
    .map_err(|e| anyhow!("failed to send OPEN: {e}"))?;

    let mut assembler = FrameAssembler::new();
    let ack = wait_open_ack(&mut ws_rx, &mut assembler).await?;

    config::remember_tunnel(TunnelRecord {
        tunnel_id: ack.tunnel_id.clone(),
        subdomain: ack.subdomain.clone(),
        protocol: opts.protocol,
        local_target: opts.local_target.clone(),
    })
    .map_err(CliError::Other)?;

    if announce {
        println!();
        println!("  Tunnel active ({})", opts.protocol);
        println!("  Public URL:  {}", ack.public_url);
        if let Some(port) = ack.port {
            println!("  Public port: {port}");
        }
        println!("  Forwarding:  {}", opts.local_target);
        println!();
        println!("Press Ctrl+C to stop the tunnel");
        println!();
    } else {
        info!("tunnel {} resumed as '{}'", ack.tunnel_id, ack.subdomain);
    }

    let end = serve_channel(ws_tx, ws_rx, assembler, opts).await?;
    Ok((end, Some(tunnel_id)))
}

fn upgrade_url(server: &str, opts: &TunnelOptions) -> CliResult<String> {
    let base = server.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(CliError::Other(anyhow!(
            "server URL must start with http:// or https://"
        )));
    };

    let mut params = vec![format!("protocol={}", opts.protocol)];
    if let Some(resume) = &opts.resume {
        params.push(format!("resume={resume}"));
    } else {
        if let Some(subdomain) = &opts.desired_subdomain {
            params.push(format!("subdomain={subdomain}"));
        }
        if let Some(host) = &opts.desired_host {
            params.push(format!("host={host}"));
        }
        if let Some(port) = opts.desired_port {
            params.push(format!("port={port}"));
        }
    }
    Ok(format!("{ws_base}/tunnel?{}", params.join("&")))
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    Message,
>;
type WsSource = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
>;

async fn send_frame(ws_tx: &mut WsSink, frame: &Frame) -> Result<(), WsError> {
    for wire in encode(frame) {
        ws_tx.send(Message::Binary(wire.to_vec())).await?;
    }
    Ok(())
}

async fn wait_open_ack(
    ws_rx: &mut WsSource,
    assembler: &mut FrameAssembler,
) -> CliResult<OpenAck> {
    let deadline = Duration::from_secs(10);
    let fut = async {
        while let Some(msg) = ws_rx.next().await {
            let msg = msg.map_err(|e| anyhow!("transport error: {e}"))?;
            if let Message::Binary(data) = msg {
                match assembler.push(&data).map_err(|e| anyhow!("{e}"))? {
                    Some(Frame::OpenAck(ack)) => return Ok(ack),
                    Some(Frame::Err(err)) => {
                        return Err(match err.kind {
                            ErrorKind::AuthFailed => CliError::Auth,
                            ErrorKind::SubdomainTaken => {
                                CliError::Conflict(err.message.unwrap_or_default())
                            }
                            ErrorKind::Capacity => {
                                CliError::Capacity(err.message.unwrap_or_default())
                            }
                            _ => CliError::Other(anyhow!(
                                "open rejected: {}",
                                err.message.unwrap_or_default()
                            )),
                        })
                    }
                    Some(other) => {
                        debug!("ignoring {:?} before OPEN_ACK", other.frame_type());
                    }
                    None => {}
                }
            }
        }
        Err(CliError::Other(anyhow!("connection closed during open")))
    };
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| CliError::Other(anyhow!("timed out waiting for OPEN_ACK")))?
}

async fn serve_channel(
    mut ws_tx: WsSink,
    mut ws_rx: WsSource,
    mut assembler: FrameAssembler,
    opts: &TunnelOptions,
) -> CliResult<SessionEnd> {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    let inflight: Arc<DashMap<String, tokio::task::AbortHandle>> = Arc::new(DashMap::new());
    let sessions: Arc<DashMap<String, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());
    let http = reqwest::Client::builder()
        .build()
        .context("failed to build local http client")?;

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { return Ok(SessionEnd::Reconnect) };
                if send_frame(&mut ws_tx, &frame).await.is_err() {
                    return Ok(SessionEnd::Reconnect);
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let frame = match assembler.push(&data) {
                            Ok(Some(frame)) => frame,
                            Ok(None) => continue,
                            Err(e) => {
                                warn!("bad frame from edge: {e}");
                                return Ok(SessionEnd::Reconnect);
                            }
                        };
                        if let Some(end) = handle_frame(
                            frame, opts, &http, &outbound_tx, &inflight, &sessions,
                        ) {
                            return Ok(end);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("edge closed the control channel");
                        return Ok(SessionEnd::Reconnect);
                    }
                    Some(Err(e)) => {
                        debug!("websocket error: {e}");
                        return Ok(SessionEnd::Reconnect);
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                let _ = ws_tx.send(Message::Close(None)).await;
                return Ok(SessionEnd::Quit);
            }
        }
    }
}

/// Returns Some(end) when the channel should stop.
fn handle_frame(
    frame: Frame,
    opts: &TunnelOptions,
    http: &reqwest::Client,
    outbound: &mpsc::Sender<Frame>,
    inflight: &Arc<DashMap<String, tokio::task::AbortHandle>>,
    sessions: &Arc<DashMap<String, mpsc::Sender<Bytes>>>,
) -> Option<SessionEnd> {
    match frame {
        Frame::Ping(seq) => {
            let _ = outbound.try_send(Frame::Pong(seq));
        }
        Frame::Shutdown(shutdown) => {
            println!("Edge closed the tunnel: {}", shutdown.reason);
            return Some(SessionEnd::Quit);
        }
        Frame::Req(req) => {
            let request_id = req.request_id.clone();
            let task = tokio::spawn(forward_request(
                http.clone(),
                opts.local_target.clone(),
                req,
                outbound.clone(),
                Arc::clone(inflight),
            ));
            inflight.insert(request_id, task.abort_handle());
        }
        Frame::Err(err) => {
            // Public caller cancelled or the edge gave up on this id.
            if let Some((_, handle)) = inflight.remove(&err.correlation_id) {
                handle.abort();
            }
            sessions.remove(&err.correlation_id);
        }
        Frame::StreamOpen(open) => {
            spawn_stream_session(open, opts, outbound.clone(), sessions);
        }
        Frame::StreamData(data) => {
            if let Some(tx) = sessions.get(&data.session_id).map(|e| e.value().clone()) {
                if tx.try_send(data.data).is_err() {
                    debug!("session {} backlogged, dropping chunk", data.session_id);
                }
            }
        }
        Frame::StreamClose(close) => {
            sessions.remove(&close.session_id);
        }
        _ => {}
    }
    None
}

/// Proxy one REQ envelope to the local service and stream the answer back.
async fn forward_request(
    http: reqwest::Client,
    local_target: String,
    req: Req,
    outbound: mpsc::Sender<Frame>,
    inflight: Arc<DashMap<String, tokio::task::AbortHandle>>,
) {
    let request_id = req.request_id.clone();
    let result = proxy_to_local(&http, &local_target, req, &outbound).await;
    if let Err(e) = result {
        debug!("local request {request_id} failed: {e}");
        let _ = outbound
            .send(Frame::Err(ErrFrame {
                correlation_id: request_id.clone(),
                kind: ErrorKind::Refused,
                message: Some(e.to_string()),
            }))
            .await;
    }
    inflight.remove(&request_id);
}

async fn proxy_to_local(
    http: &reqwest::Client,
    local_target: &str,
    req: Req,
    outbound: &mpsc::Sender<Frame>,
) -> anyhow::Result<()> {
    let method: reqwest::Method = req.method.parse().context("invalid method")?;
    let url = format!("http://{}{}", local_target, req.path);

    let mut builder = http.request(method, &url);
    for (name, value) in &req.headers {
        let lowered = name.to_ascii_lowercase();
        // reqwest derives these from the URL and body.
        if lowered == "host" || lowered == "content-length" {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if !req.body.is_empty() {
        builder = builder.body(req.body.to_vec());
    }

    let response = builder.send().await.context("local service unreachable")?;
    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    outbound
        .send(Frame::RespHead(RespHead {
            request_id: req.request_id.clone(),
            status,
            headers,
        }))
        .await
        .map_err(|_| anyhow!("channel closed"))?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("local body read failed")?;
        outbound
            .send(Frame::RespBody(RespBody {
                request_id: req.request_id.clone(),
                chunk,
                last: false,
            }))
            .await
            .map_err(|_| anyhow!("channel closed"))?;
    }
    outbound
        .send(Frame::RespBody(RespBody {
            request_id: req.request_id,
            chunk: Bytes::new(),
            last: true,
        }))
        .await
        .map_err(|_| anyhow!("channel closed"))?;
    Ok(())
}

fn spawn_stream_session(
    open: StreamOpen,
    opts: &TunnelOptions,
    outbound: mpsc::Sender<Frame>,
    sessions: &Arc<DashMap<String, mpsc::Sender<Bytes>>>,
) {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    sessions.insert(open.session_id.clone(), tx);

    let local_target = opts.local_target.clone();
    let protocol = opts.protocol;
    let sessions = Arc::clone(sessions);
    tokio::spawn(async move {
        let session_id = open.session_id.clone();
        let result = match protocol {
            Protocol::Udp => udp_session(&local_target, &session_id, rx, &outbound).await,
            // For HTTP tunnels a stream session is a public websocket: the
            // first payload is the request head, and the local server's own
            // 101 must be consumed before raw piping starts.
            Protocol::Http => tcp_session(&local_target, &session_id, rx, &outbound, true).await,
            Protocol::Tcp | Protocol::Tls => {
                tcp_session(&local_target, &session_id, rx, &outbound, false).await
            }
        };
        if let Err(e) = result {
            debug!("stream session {session_id} ended with error: {e}");
            let _ = outbound
                .send(Frame::StreamClose(StreamClose {
                    session_id: session_id.clone(),
                    error: Some(ErrorKind::Refused),
                }))
                .await;
        }
        sessions.remove(&session_id);
    });
}

async fn tcp_session(
    local_target: &str,
    session_id: &str,
    mut rx: mpsc::Receiver<Bytes>,
    outbound: &mpsc::Sender<Frame>,
    websocket_handoff: bool,
) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect(local_target)
        .await
        .context("local service unreachable")?;

    if websocket_handoff {
        // Replay the request head, then swallow the local server's
        // response head; the edge already answered the public 101.
        let head = rx.recv().await.ok_or_else(|| anyhow!("session closed"))?;
        stream.write_all(&head).await?;

        let mut buf = Vec::with_capacity(1024);
        let mut byte = [0u8; 1024];
        let leftover = loop {
            let n = stream.read(&mut byte).await?;
            if n == 0 {
                return Err(anyhow!("local server closed during upgrade"));
            }
            buf.extend_from_slice(&byte[..n]);
            if let Some(end) = find_head_end(&buf) {
                let status = parse_status(&buf[..end]);
                if status != Some(101) {
                    return Err(anyhow!(
                        "local server refused the upgrade (status {status:?})"
                    ));
                }
                break buf.split_off(end + 4);
            }
            if buf.len() > 64 * 1024 {
                return Err(anyhow!("oversized upgrade response from local server"));
            }
        };
        if !leftover.is_empty() {
            outbound
                .send(Frame::StreamData(StreamData {
                    session_id: session_id.to_string(),
                    data: Bytes::from(leftover),
                }))
                .await
                .map_err(|_| anyhow!("channel closed"))?;
        }
    }

    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            incoming = rx.recv() => {
                match incoming {
                    Some(data) => writer.write_all(&data).await?,
                    None => break, // edge closed the session
                }
            }
            read = reader.read(&mut buf) => {
                let n = read?;
                if n == 0 {
                    let _ = outbound
                        .send(Frame::StreamClose(StreamClose {
                            session_id: session_id.to_string(),
                            error: None,
                        }))
                        .await;
                    break;
                }
                outbound
                    .send(Frame::StreamData(StreamData {
                        session_id: session_id.to_string(),
                        data: Bytes::copy_from_slice(&buf[..n]),
                    }))
                    .await
                    .map_err(|_| anyhow!("channel closed"))?;
            }
        }
    }
    Ok(())
}

async fn udp_session(
    local_target: &str,
    session_id: &str,
    mut rx: mpsc::Receiver<Bytes>,
    outbound: &mpsc::Sender<Frame>,
) -> anyhow::Result<()> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind udp socket")?;
    socket
        .connect(local_target)
        .await
        .context("local service unreachable")?;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let step = tokio::time::timeout(UDP_IDLE, async {
            tokio::select! {
                incoming = rx.recv() => UdpStep::FromEdge(incoming),
                read = socket.recv(&mut buf) => UdpStep::FromLocal(read.map(|n| Bytes::copy_from_slice(&buf[..n]))),
            }
        })
        .await;

        match step {
            Err(_) => break, // idle expiry, mirror the edge's soft state
            Ok(UdpStep::FromEdge(Some(datagram))) => {
                socket.send(&datagram).await?;
            }
            Ok(UdpStep::FromEdge(None)) => break,
            Ok(UdpStep::FromLocal(Ok(data))) => {
                outbound
                    .send(Frame::StreamData(StreamData {
                        session_id: session_id.to_string(),
                        data,
                    }))
                    .await
                    .map_err(|_| anyhow!("channel closed"))?;
            }
            Ok(UdpStep::FromLocal(Err(e))) => return Err(e.into()),
        }
    }

    let _ = outbound
        .send(Frame::StreamClose(StreamClose {
            session_id: session_id.to_string(),
            error: None,
        }))
        .await;
    Ok(())
}

enum UdpStep {
    FromEdge(Option<Bytes>),
    FromLocal(std::io::Result<Bytes>),
}

pub(crate) fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

pub(crate) fn parse_status(head: &[u8]) -> Option<u16> {
    let line = head.split(|b| *b == b'\r').next()?;
    let text = std::str::from_utf8(line).ok()?;
    text.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upgrade_url_building() {
        let opts = TunnelOptions {
            protocol: Protocol::Http,
            local_target: "127.0.0.1:3000".into(),
            desired_subdomain: Some("myapp".into()),
            desired_host: None,
            desired_port: None,
            resume: None,
        };
        let url = upgrade_url("https://example.com/", &opts).unwrap();
        assert_eq!(url, "wss://example.com/tunnel?protocol=http&subdomain=myapp");

        let resume = TunnelOptions {
            resume: Some("t-1".into()),
            ..opts
        };
        let url = upgrade_url("http://localhost:8080", &resume).unwrap();
        assert_eq!(url, "ws://localhost:8080/tunnel?protocol=http&resume=t-1");
    }

    #[test]
    fn test_upgrade_url_rejects_bad_scheme() {
        let opts = TunnelOptions {
            protocol: Protocol::Tcp,
            local_target: "127.0.0.1:5432".into(),
            desired_subdomain: None,
            desired_host: None,
            desired_port: None,
            resume: None,
        };
        assert!(upgrade_url("ftp://example.com", &opts).is_err());
    }

    #[test]
    fn test_parse_upgrade_head() {
        let head = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\nrest";
        let end = find_head_end(head).unwrap();
        assert_eq!(parse_status(&head[..end]), Some(101));
        assert_eq!(&head[end + 4..], b"rest");

        let refused = b"HTTP/1.1 404 Not Found\r\n\r\n";
        let end = find_head_end(refused).unwrap();
        assert_eq!(parse_status(&refused[..end]), Some(404));
    }

    #[test]
    fn test_backoff_is_bounded() {
        for failures in 0..20 {
            let delay = backoff_delay(failures);
            assert!(delay <= Duration::from_secs(60));
        }
    }
}
