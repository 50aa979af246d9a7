//! End-to-end tunnel flows against an in-process edge: a real websocket
//! control channel on one side, real public sockets on the other.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use uniroute_edge::identity::IdentityGate;
use uniroute_edge::store::{Store, TokenRow};
use uniroute_edge::{ingress_stream, server, EdgeConfig, EdgeState};
use uniroute_shared::codec::{encode, FrameAssembler};
use uniroute_shared::frame::{
    Frame, Open, OpenAck, RespBody, RespHead, StreamData, PROTOCOL_VERSION,
};

const SECRET: &str = "test-secret";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config(port_range: std::ops::RangeInclusive<u16>) -> EdgeConfig {
    EdgeConfig {
        base_domain: "example.com".into(),
        public_port: 0,
        port_range,
        jwt_secret: SECRET.into(),
        database_url: String::new(),
        website_url: "https://example.com".into(),
        grace_window: Duration::from_secs(60),
        request_timeout: Duration::from_secs(5),
        heartbeat_interval: Duration::from_secs(5),
        udp_idle_timeout: Duration::from_secs(5),
        capture_max_bytes: 64 * 1024,
        max_body_bytes: 16 * 1024 * 1024,
        per_tunnel_inflight: 64,
        outbound_queue: 64,
        capture_ring_size: 100,
        tls_cert_path: None,
        tls_key_path: None,
    }
}

async fn start_edge(config: EdgeConfig) -> (EdgeState, SocketAddr) {
    let store = Store::connect_in_memory().await.unwrap();
    for user in ["u1", "u2"] {
        store
            .insert_token(&TokenRow {
                token_hash: IdentityGate::token_hash(SECRET, &format!("token-{user}")),
                user_id: user.to_string(),
                per_minute_limit: 1000,
                per_day_limit: 100_000,
                revoked: false,
                expires_at: None,
            })
            .await
            .unwrap();
    }

    let state = EdgeState::build(config, store).await.unwrap();
    ingress_stream::spawn_stream_listeners(state.clone())
        .await
        .unwrap();

    let app = server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (state, addr)
}

async fn send_frame(ws: &mut Ws, frame: &Frame) {
    for wire in encode(frame) {
        ws.send(Message::Binary(wire.to_vec())).await.unwrap();
    }
}

/// Connect a control channel and complete the OPEN/OPEN_ACK exchange.
async fn open_tunnel(
    addr: SocketAddr,
    token: &str,
    query: &str,
) -> Result<(Ws, OpenAck), WsError> {
    let url = format!("ws://{addr}/tunnel?{query}");
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        AUTHORIZATION,
        format!("Bearer {token}").parse().unwrap(),
    );
    let (mut ws, response) = connect_async(request).await?;
    let tunnel_id = response
        .headers()
        .get("x-uniroute-tunnel-id")
        .expect("tunnel id header")
        .to_str()
        .unwrap()
        .to_string();

    send_frame(
        &mut ws,
        &Frame::Open(Open {
            version: PROTOCOL_VERSION,
            tunnel_id,
            local_target: "127.0.0.1:0".into(),
        }),
    )
    .await;

    let mut assembler = FrameAssembler::new();
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                if let Some(frame) = assembler.push(&data).unwrap() {
                    match frame {
                        Frame::OpenAck(ack) => return Ok((ws, ack)),
                        Frame::Ping(seq) => send_frame(&mut ws, &Frame::Pong(seq)).await,
                        Frame::Err(err) => panic!("open rejected: {err:?}"),
                        _ => {}
                    }
                }
            }
            Some(Ok(_)) => {}
            other => panic!("channel ended before OPEN_ACK: {other:?}"),
        }
    }
}

/// Client loop answering every REQ with `200 hello`.
async fn run_hello_client(mut ws: Ws) {
    let mut assembler = FrameAssembler::new();
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Binary(data) = msg else { continue };
        let Some(frame) = assembler.push(&data).unwrap() else {
            continue;
        };
        match frame {
            Frame::Ping(seq) => send_frame(&mut ws, &Frame::Pong(seq)).await,
            Frame::Req(req) => {
                send_frame(
                    &mut ws,
                    &Frame::RespHead(RespHead {
                        request_id: req.request_id.clone(),
                        status: 200,
                        headers: vec![("content-type".into(), "text/plain".into())],
                    }),
                )
                .await;
                send_frame(
                    &mut ws,
                    &Frame::RespBody(RespBody {
                        request_id: req.request_id,
                        chunk: bytes::Bytes::from_static(b"hello"),
                        last: true,
                    }),
                )
                .await;
            }
            _ => {}
        }
    }
}

fn public_client(host: &str, addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .resolve(host, SocketAddr::from(([127, 0, 0, 1], addr.port())))
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_round_trip_through_tunnel() {
    let (_state, addr) = start_edge(test_config(21100..=21101)).await;

    let (ws, ack) = open_tunnel(addr, "token-u1", "protocol=http&subdomain=myapp")
        .await
        .unwrap();
    assert_eq!(ack.subdomain, "myapp");
    assert_eq!(ack.public_url, "https://myapp.example.com");
    tokio::spawn(run_hello_client(ws));

    let client = public_client("myapp.example.com", addr);
    let response = client
        .get(format!("http://myapp.example.com:{}/", addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subdomain_conflict_between_users() {
    let (_state, addr) = start_edge(test_config(21110..=21111)).await;

    let (ws, _ack) = open_tunnel(addr, "token-u1", "protocol=http&subdomain=shared")
        .await
        .unwrap();
    tokio::spawn(run_hello_client(ws));

    let err = open_tunnel(addr, "token-u2", "protocol=http&subdomain=shared")
        .await
        .unwrap_err();
    match err {
        WsError::Http(response) => assert_eq!(response.status(), 409),
        other => panic!("expected HTTP 409, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_host_is_404_and_inactive_tunnel_502() {
    let (state, addr) = start_edge(test_config(21120..=21121)).await;

    let client = public_client("ghost.example.com", addr);
    let response = client
        .get(format!("http://ghost.example.com:{}/", addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // A known subdomain whose channel is gone answers 502.
    state
        .registry
        .open("u1", uniroute_shared::Protocol::Http, Some("idle"), None, None)
        .await
        .unwrap();
    let client = public_client("idle.example.com", addr);
    let response = client
        .get(format!("http://idle.example.com:{}/", addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_tcp_stream_bridges_bytes_both_ways() {
    let (_state, addr) = start_edge(test_config(21130..=21131)).await;

    let (mut ws, ack) = open_tunnel(addr, "token-u1", "protocol=tcp").await.unwrap();
    let public_port = ack.port.expect("tcp tunnels lease a port");
    assert_eq!(public_port, 21130);

    let to_client = vec![0xa5u8; 1024];
    let from_client = vec![0x5au8; 2048];

    // Client side: expect STREAM_OPEN, then echo back 2 KiB once the full
    // 1 KiB arrived.
    let expect_in = to_client.clone();
    let reply = from_client.clone();
    let client_task = tokio::spawn(async move {
        let mut assembler = FrameAssembler::new();
        let mut session = None;
        let mut received = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Binary(data) = msg else { continue };
            let Some(frame) = assembler.push(&data).unwrap() else {
                continue;
            };
            match frame {
                Frame::Ping(seq) => send_frame(&mut ws, &Frame::Pong(seq)).await,
                Frame::StreamOpen(open) => session = Some(open.session_id),
                Frame::StreamData(data) => {
                    received.extend_from_slice(&data.data);
                    if received.len() >= expect_in.len() {
                        let session_id = session.clone().expect("open before data");
                        send_frame(
                            &mut ws,
                            &Frame::StreamData(StreamData {
                                session_id,
                                data: bytes::Bytes::from(reply.clone()),
                            }),
                        )
                        .await;
                        break;
                    }
                }
                _ => {}
            }
        }
        received
    });

    let mut socket = TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
    socket.write_all(&to_client).await.unwrap();

    let mut got = vec![0u8; from_client.len()];
    tokio::time::timeout(Duration::from_secs(5), socket.read_exact(&mut got))
        .await
        .expect("timed out reading from tunnel")
        .unwrap();
    assert_eq!(got, from_client);

    let received = tokio::time::timeout(Duration::from_secs(5), client_task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, to_client);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resume_keeps_subdomain_and_port() {
    let (_state, addr) = start_edge(test_config(21140..=21141)).await;

    let (ws, ack) = open_tunnel(addr, "token-u1", "protocol=tcp").await.unwrap();
    let first_port = ack.port.unwrap();
    drop(ws); // simulate a dropped control channel

    // Give the edge a moment to notice the detach.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let (_ws2, ack2) = open_tunnel(
        addr,
        "token-u1",
        &format!("protocol=tcp&resume={}", ack.tunnel_id),
    )
    .await
    .unwrap();
    assert_eq!(ack2.subdomain, ack.subdomain);
    assert_eq!(ack2.port, Some(first_port));
    assert_eq!(ack2.tunnel_id, ack.tunnel_id);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_client_times_out_with_504() {
    let mut config = test_config(21150..=21151);
    config.request_timeout = Duration::from_millis(300);
    let (_state, addr) = start_edge(config).await;

    let (mut ws, _ack) = open_tunnel(addr, "token-u1", "protocol=http&subdomain=slowpoke")
        .await
        .unwrap();
    // Keep the channel alive but never answer requests.
    tokio::spawn(async move {
        let mut assembler = FrameAssembler::new();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Binary(data) = msg {
                if let Ok(Some(Frame::Ping(seq))) = assembler.push(&data) {
                    send_frame(&mut ws, &Frame::Pong(seq)).await;
                }
            }
        }
    });

    let client = public_client("slowpoke.example.com", addr);
    let response = client
        .get(format!("http://slowpoke.example.com:{}/", addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 504);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_udp_session_reuses_source_derived_id() {
    let (_state, addr) = start_edge(test_config(21170..=21171)).await;

    let (mut ws, ack) = open_tunnel(addr, "token-u1", "protocol=udp").await.unwrap();
    let public_port = ack.port.expect("udp tunnels lease a port");

    let client_task = tokio::spawn(async move {
        let mut assembler = FrameAssembler::new();
        let mut opened = Vec::new();
        let mut datagrams = 0;
        while let Some(Ok(msg)) = ws.next().await {
            let Message::Binary(data) = msg else { continue };
            let Some(frame) = assembler.push(&data).unwrap() else {
                continue;
            };
            match frame {
                Frame::Ping(seq) => send_frame(&mut ws, &Frame::Pong(seq)).await,
                Frame::StreamOpen(open) => opened.push(open.session_id),
                Frame::StreamData(data) => {
                    datagrams += 1;
                    // Echo the datagram back on the same session.
                    send_frame(
                        &mut ws,
                        &Frame::StreamData(StreamData {
                            session_id: data.session_id,
                            data: data.data,
                        }),
                    )
                    .await;
                    if datagrams == 2 {
                        break;
                    }
                }
                _ => {}
            }
        }
        opened
    });

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket
        .connect(("127.0.0.1", public_port))
        .await
        .unwrap();
    socket.send(b"ping-1").await.unwrap();

    let mut buf = [0u8; 64];
    let n = tokio::time::timeout(Duration::from_secs(5), socket.recv(&mut buf))
        .await
        .expect("timed out waiting for udp echo")
        .unwrap();
    assert_eq!(&buf[..n], b"ping-1");

    // Same source tuple: the session is reused, not reopened.
    socket.send(b"ping-2").await.unwrap();
    let n = tokio::time::timeout(Duration::from_secs(5), socket.recv(&mut buf))
        .await
        .expect("timed out waiting for second echo")
        .unwrap();
    assert_eq!(&buf[..n], b"ping-2");

    let opened = tokio::time::timeout(Duration::from_secs(5), client_task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(opened.len(), 1, "one session per source tuple");
    assert!(opened[0].starts_with("udp-127.0.0.1-"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_recorder_captures_and_lists_exchanges() {
    let (_state, addr) = start_edge(test_config(21160..=21161)).await;

    let (ws, ack) = open_tunnel(addr, "token-u1", "protocol=http&subdomain=logged")
        .await
        .unwrap();
    tokio::spawn(run_hello_client(ws));

    let client = public_client("logged.example.com", addr);
    let response = client
        .get(format!("http://logged.example.com:{}/api/widgets?id=7", addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello");

    // The capture is visible through the owner-scoped API.
    let api = reqwest::Client::new();
    let listing: serde_json::Value = api
        .get(format!(
            "http://127.0.0.1:{}/api/tunnels/{}/requests",
            addr.port(),
            ack.tunnel_id
        ))
        .bearer_auth("token-u1")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let requests = listing["requests"].as_array().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0]["method"], "GET");
    assert_eq!(requests[0]["path"], "/api/widgets");
    assert_eq!(requests[0]["query"], "id=7");
    assert_eq!(requests[0]["status"], 200);

    // Another user cannot see the ring.
    let forbidden = api
        .get(format!(
            "http://127.0.0.1:{}/api/tunnels/{}/requests",
            addr.port(),
            ack.tunnel_id
        ))
        .bearer_auth("token-u2")
        .send()
        .await
        .unwrap();
    assert_eq!(forbidden.status(), 404);
}
