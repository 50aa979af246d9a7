//! Stream ingress: TCP/TLS/UDP listeners over the leased port pool.
//!
//! Every port in the configured range is bound at boot (TCP and UDP); the
//! per-connection handler routes by port at accept time, so listeners need
//! no lifecycle of their own when tunnels come and go.

use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};
use uniroute_shared::frame::{Frame, StreamClose, StreamData, StreamOpen};
use uniroute_shared::{ErrorKind, Protocol};
use uuid::Uuid;

use crate::channel::{ChannelHandle, StreamEvent};
use crate::registry::ActiveRoute;
use crate::state::EdgeState;

const READ_BUF: usize = 16 * 1024;
const UDP_BUF: usize = 64 * 1024;

/// Bind the whole pool and spawn accept loops.
pub async fn spawn_stream_listeners(state: EdgeState) -> anyhow::Result<()> {
    let tls = load_tls_acceptor(&state)?;
    for port in state.config.port_range.clone() {
        let tcp = TcpListener::bind(("0.0.0.0", port)).await?;
        tokio::spawn(tcp_accept_loop(state.clone(), tcp, port, tls.clone()));

        let udp = UdpSocket::bind(("0.0.0.0", port)).await?;
        tokio::spawn(udp_recv_loop(state.clone(), Arc::new(udp), port));
    }
    info!(
        "stream ingress listening on ports {}-{}",
        state.config.port_range.start(),
        state.config.port_range.end()
    );
    Ok(())
}

fn load_tls_acceptor(state: &EdgeState) -> anyhow::Result<Option<TlsAcceptor>> {
    let (Some(cert_path), Some(key_path)) =
        (&state.config.tls_cert_path, &state.config.tls_key_path)
    else {
        return Ok(None);
    };
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
        cert_path,
    )?))
    .collect::<std::result::Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
        key_path,
    )?))?
    .ok_or_else(|| anyhow::anyhow!("no private key in {}", key_path.display()))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

async fn tcp_accept_loop(
    state: EdgeState,
    listener: TcpListener,
    port: u16,
    tls: Option<TlsAcceptor>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed on port {port}: {e}");
                continue;
            }
        };
        let state = state.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            handle_stream_conn(state, socket, peer, port, tls).await;
        });
    }
}

async fn handle_stream_conn(
    state: EdgeState,
    socket: TcpStream,
    peer: SocketAddr,
    port: u16,
    tls: Option<TlsAcceptor>,
) {
    let route = match state.registry.route_by_port(port) {
        Ok(route) => route,
        Err(e) => {
            debug!("connection to port {port} refused: {e}");
            return;
        }
    };
    let Some(entry) = state.registry.get(&route.tunnel_id) else {
        return;
    };

    match entry.protocol {
        Protocol::Tcp => {
            open_and_bridge(state, route, socket, peer).await;
        }
        Protocol::Tls => {
            let Some(acceptor) = tls else {
                warn!("tls tunnel on port {port} but no certificate configured");
                return;
            };
            match acceptor.accept(socket).await {
                Ok(tls_stream) => open_and_bridge(state, route, tls_stream, peer).await,
                Err(e) => debug!("tls handshake failed on port {port}: {e}"),
            }
        }
        _ => {
            debug!("tcp connection to non-stream tunnel on port {port}");
        }
    }
}

/// Open a session over the control channel and bridge raw bytes.
async fn open_and_bridge<IO>(state: EdgeState, route: ActiveRoute, io: IO, peer: SocketAddr)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session_id = Uuid::new_v4().simple().to_string();
    let mailbox = match route.channel.register_session(&session_id) {
        Ok(mailbox) => mailbox,
        Err(e) => {
            debug!("session register failed: {e}");
            return;
        }
    };

    if let Err(e) = route.channel.try_send(Frame::StreamOpen(StreamOpen {
        session_id: session_id.clone(),
        tunnel_id: route.tunnel_id.clone(),
        peer_addr: peer.to_string(),
    })) {
        // Queue full or channel gone: refuse the session.
        route.channel.close_session(&session_id, None);
        let _ = route.channel.try_send(Frame::StreamClose(StreamClose {
            session_id,
            error: Some(ErrorKind::Refused),
        }));
        debug!("stream session refused: {e}");
        return;
    }

    state.registry.note_request(&route.tunnel_id);
    state.metrics.stream_opened();
    bridge_io(io, session_id, route.channel, mailbox).await;
    state.metrics.stream_closed();
}

/// Pump bytes between a public socket and the control channel until either
/// side closes. STREAM_DATA toward the client uses a blocking send so the
/// public socket's own backpressure applies.
pub async fn bridge_io<IO>(
    io: IO,
    session_id: String,
    channel: ChannelHandle,
    mut mailbox: mpsc::Receiver<StreamEvent>,
) where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(io);
    let mut buf = vec![0u8; READ_BUF];
    // Whether this side (the edge) is the one announcing the close.
    let mut announce_close = true;

    loop {
        tokio::select! {
            read = reader.read(&mut buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let frame = Frame::StreamData(StreamData {
                            session_id: session_id.clone(),
                            data: Bytes::copy_from_slice(&buf[..n]),
                        });
                        if channel.send(frame).await.is_err() {
                            announce_close = false;
                            break;
                        }
                    }
                }
            }
            event = mailbox.recv() => {
                match event {
                    Some(StreamEvent::Data(data)) => {
                        if writer.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(StreamEvent::Close(_)) | None => {
                        // Client closed first; nothing left to announce.
                        announce_close = false;
                        break;
                    }
                }
            }
        }
    }

    let _ = writer.shutdown().await;
    channel.close_session(&session_id, None);
    if announce_close {
        let _ = channel.try_send(Frame::StreamClose(StreamClose {
            session_id,
            error: None,
        }));
    }
}

/// UDP: one logical session per source address, with soft idle expiry.
async fn udp_recv_loop(state: EdgeState, socket: Arc<UdpSocket>, port: u16) {
    let sessions: Arc<DashMap<SocketAddr, mpsc::Sender<Bytes>>> = Arc::new(DashMap::new());
    let mut buf = vec![0u8; UDP_BUF];

    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(recv) => recv,
            Err(e) => {
                warn!("udp recv failed on port {port}: {e}");
                continue;
            }
        };
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        if let Some(tx) = sessions.get(&src).map(|e| e.value().clone()) {
            if tx.try_send(datagram).is_ok() {
                continue;
            }
            // Session task ended or is saturated; a closed one restarts.
            if tx.is_closed() {
                sessions.remove(&src);
            } else {
                continue;
            }
        }

        let route = match state.registry.route_by_port(port) {
            Ok(route) => route,
            Err(e) => {
                debug!("udp datagram to port {port} refused: {e}");
                continue;
            }
        };
        let Some(entry) = state.registry.get(&route.tunnel_id) else {
            continue;
        };
        if entry.protocol != Protocol::Udp {
            continue;
        }

        // Deterministic per-source id, stable across the session lifetime.
        let session_id = format!("udp-{}-{}", src.ip(), src.port());
        let mailbox = match route.channel.register_session(&session_id) {
            Ok(mailbox) => mailbox,
            Err(_) => continue,
        };
        if route
            .channel
            .try_send(Frame::StreamOpen(StreamOpen {
                session_id: session_id.clone(),
                tunnel_id: route.tunnel_id.clone(),
                peer_addr: src.to_string(),
            }))
            .is_err()
        {
            route.channel.close_session(&session_id, None);
            continue;
        }
        state.registry.note_request(&route.tunnel_id);

        let (datagram_tx, datagram_rx) = mpsc::channel::<Bytes>(64);
        let _ = datagram_tx.try_send(Bytes::copy_from_slice(&buf[..n]));
        sessions.insert(src, datagram_tx);

        let task_state = state.clone();
        let task_socket = Arc::clone(&socket);
        let task_sessions = Arc::clone(&sessions);
        tokio::spawn(async move {
            task_state.metrics.stream_opened();
            udp_session(
                task_state.clone(),
                task_socket,
                src,
                session_id,
                route.channel,
                mailbox,
                datagram_rx,
            )
            .await;
            task_state.metrics.stream_closed();
            task_sessions.remove(&src);
        });
    }
}

async fn udp_session(
    state: EdgeState,
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    session_id: String,
    channel: ChannelHandle,
    mut mailbox: mpsc::Receiver<StreamEvent>,
    mut datagrams: mpsc::Receiver<Bytes>,
) {
    let idle = state.config.udp_idle_timeout;
    let mut announce_close = true;

    loop {
        let event = tokio::time::timeout(idle, async {
            tokio::select! {
                datagram = datagrams.recv() => UdpEvent::Inbound(datagram),
                event = mailbox.recv() => UdpEvent::FromClient(event),
            }
        })
        .await;

        match event {
            Err(_) => break, // idle expiry
            Ok(UdpEvent::Inbound(Some(datagram))) => {
                let frame = Frame::StreamData(StreamData {
                    session_id: session_id.clone(),
                    data: datagram,
                });
                if channel.send(frame).await.is_err() {
                    announce_close = false;
                    break;
                }
            }
            Ok(UdpEvent::Inbound(None)) => break,
            Ok(UdpEvent::FromClient(Some(StreamEvent::Data(data)))) => {
                if socket.send_to(&data, src).await.is_err() {
                    break;
                }
            }
            Ok(UdpEvent::FromClient(Some(StreamEvent::Close(_)))) | Ok(UdpEvent::FromClient(None)) => {
                announce_close = false;
                break;
            }
        }
    }

    channel.close_session(&session_id, None);
    if announce_close {
        let _ = channel.try_send(Frame::StreamClose(StreamClose {
            session_id,
            error: None,
        }));
    }
}

enum UdpEvent {
    Inbound(Option<Bytes>),
    FromClient(Option<StreamEvent>),
}
