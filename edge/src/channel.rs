//! Control-channel serve loop and the handle other components hold.
//!
//! Each attached channel runs one serve task that multiplexes the outbound
//! frame queue, inbound frame dispatch, and the heartbeat. The handle is the
//! only thing stored outside this module; it carries the tunnel's request
//! tracker and stream-session mailboxes, never a socket reference.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uniroute_shared::codec::{encode, FrameAssembler};
use uniroute_shared::frame::{Frame, OpenAck, PROTOCOL_VERSION};
use uniroute_shared::{Error, Result};

use crate::registry::OpenGrant;
use crate::state::EdgeState;
use crate::tracker::RequestTracker;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Event delivered to a stream session's bridge task.
#[derive(Debug)]
pub enum StreamEvent {
    Data(Bytes),
    Close(Option<Error>),
}

/// Cloneable handle to a live control channel.
#[derive(Clone)]
pub struct ChannelHandle {
    id: u64,
    outbound: mpsc::Sender<Frame>,
    cancel: CancellationToken,
    tracker: Arc<RequestTracker>,
    sessions: Arc<DashMap<String, mpsc::Sender<StreamEvent>>>,
    inflight: Arc<Semaphore>,
}

impl ChannelHandle {
    pub fn new(outbound_queue: usize, inflight_cap: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (outbound, rx) = mpsc::channel(outbound_queue);
        let handle = Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            outbound,
            cancel: CancellationToken::new(),
            tracker: Arc::new(RequestTracker::new()),
            sessions: Arc::new(DashMap::new()),
            inflight: Arc::new(Semaphore::new(inflight_cap)),
        };
        (handle, rx)
    }

    pub fn channel_id(&self) -> u64 {
        self.id
    }

    pub fn tracker(&self) -> &Arc<RequestTracker> {
        &self.tracker
    }

    /// Non-blocking enqueue; `Capacity` when the queue is full so ingress
    /// can answer 503 instead of stalling.
    pub fn try_send(&self, frame: Frame) -> Result<()> {
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Capacity,
            mpsc::error::TrySendError::Closed(_) => Error::TunnelDisconnected,
        })
    }

    /// Blocking enqueue for stream data; the sender's own socket provides
    /// backpressure while this waits.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::TunnelDisconnected)
    }

    /// Reserve an in-flight request slot; `Capacity` when the tunnel has
    /// exhausted its fair share.
    pub fn acquire_slot(&self) -> Result<OwnedSemaphorePermit> {
        self.inflight
            .clone()
            .try_acquire_owned()
            .map_err(|_| Error::Capacity)
    }

    /// Register a stream session mailbox keyed by session id.
    pub fn register_session(&self, session_id: &str) -> Result<mpsc::Receiver<StreamEvent>> {
        let (tx, rx) = mpsc::channel(32);
        match self.sessions.entry(session_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::Duplicate(session_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    pub fn close_session(&self, session_id: &str, error: Option<Error>) {
        if let Some((_, tx)) = self.sessions.remove(session_id) {
            let _ = tx.try_send(StreamEvent::Close(error));
        }
    }

    async fn deliver_session_data(&self, session_id: &str, data: Bytes) {
        let tx = match self.sessions.get(session_id) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!("data for unknown session {session_id} dropped");
                return;
            }
        };
        if tx.send(StreamEvent::Data(data)).await.is_err() {
            self.sessions.remove(session_id);
        }
    }

    /// Tear the channel down: fail all pending work, close all sessions,
    /// and cancel the serve task.
    pub fn abort(&self, error: &Error) {
        self.tracker.fail_all(error);
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.close_session(&id, Some(error.clone()));
        }
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the channel has been torn down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

/// Drive an upgraded control channel until either side goes away.
///
/// The OPEN/OPEN_ACK exchange happens first; the tunnel only turns active
/// once the client has confirmed the grant it was issued.
pub async fn serve(socket: WebSocket, state: EdgeState, grant: OpenGrant) {
    let registry = Arc::clone(&state.registry);
    let config = Arc::clone(&state.config);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut assembler = FrameAssembler::new();

    let open = match read_open_frame(
        &mut ws_rx,
        &mut assembler,
        config.heartbeat_interval * 2,
    )
    .await
    {
        Ok(open) => open,
        Err(e) => {
            warn!("control channel rejected before OPEN: {e}");
            send_frame(&mut ws_tx, &Frame::error("", &e)).await.ok();
            return;
        }
    };
    if open.tunnel_id != grant.tunnel_id {
        let err = Error::invalid("OPEN tunnel id does not match the issued grant");
        send_frame(&mut ws_tx, &Frame::error(&open.tunnel_id, &err))
            .await
            .ok();
        return;
    }

    let (handle, mut outbound_rx) =
        ChannelHandle::new(config.outbound_queue, config.per_tunnel_inflight);

    // OPEN_ACK goes into the queue before attach so it is the first frame
    // out, ahead of any request ingress routes once the tunnel is active.
    handle
        .try_send(Frame::OpenAck(OpenAck {
            tunnel_id: grant.tunnel_id.clone(),
            subdomain: grant.subdomain.clone(),
            public_url: grant.public_url.clone(),
            port: grant.port,
        }))
        .expect("fresh outbound queue cannot be full");

    if let Err(e) = registry
        .attach(&grant.tunnel_id, handle.clone(), open.local_target.clone())
        .await
    {
        warn!("attach failed for {}: {e}", grant.tunnel_id);
        send_frame(&mut ws_tx, &Frame::error(&grant.tunnel_id, &e))
            .await
            .ok();
        return;
    }

    state.metrics.tunnel_opened();

    // Three tasks per tunnel: this reader, a writer draining the outbound
    // queue, and a heartbeat. Body backpressure can stall the reader
    // without stopping pings or the deadline sweeper.
    let mut writer = {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if send_frame(&mut ws_tx, &frame).await.is_err() {
                    handle.abort(&Error::TunnelDisconnected);
                    return;
                }
            }
        })
    };

    let started = Instant::now();
    let last_pong = Arc::new(AtomicU64::new(0));
    let heartbeat = {
        let handle = handle.clone();
        let last_pong = Arc::clone(&last_pong);
        let interval = config.heartbeat_interval;
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // first tick fires immediately
            let mut seq: u64 = 0;
            loop {
                timer.tick().await;
                let elapsed = started.elapsed().as_millis() as u64;
                let seen = last_pong.load(Ordering::Relaxed);
                if elapsed.saturating_sub(seen) > 2 * interval.as_millis() as u64 {
                    handle.abort(&Error::TunnelDisconnected);
                    return;
                }
                seq += 1;
                let _ = handle.try_send(Frame::Ping(seq));
                handle.tracker().sweep();
            }
        })
    };

    let mut reason = "connection closed";
    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        match assembler.push(&data) {
                            Ok(Some(frame)) => {
                                if let Frame::Pong(_) = frame {
                                    last_pong.store(
                                        started.elapsed().as_millis() as u64,
                                        Ordering::Relaxed,
                                    );
                                    continue;
                                }
                                dispatch_inbound(&handle, frame).await;
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!("bad frame on tunnel {}: {e}", grant.tunnel_id);
                                reason = "protocol error";
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        reason = "client disconnected";
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("websocket error on {}: {e}", grant.tunnel_id);
                        reason = "transport error";
                        break;
                    }
                    // WS-level ping/pong is answered by the transport.
                    _ => {}
                }
            }
            _ = handle.closed() => {
                reason = "superseded or closed";
                break;
            }
        }
    }

    info!("tunnel {} channel ended: {reason}", grant.tunnel_id);
    handle.abort(&Error::TunnelDisconnected);
    heartbeat.abort();
    // Give the writer a short window to flush a pending SHUTDOWN frame.
    let _ = tokio::time::timeout(Duration::from_millis(200), &mut writer).await;
    writer.abort();
    state.metrics.tunnel_closed();
    registry
        .detach(&grant.tunnel_id, handle.channel_id(), reason)
        .await;
}

async fn read_open_frame(
    ws_rx: &mut (impl futures_util::Stream<Item = std::result::Result<Message, axum::Error>> + Unpin),
    assembler: &mut FrameAssembler,
    deadline: Duration,
) -> Result<uniroute_shared::frame::Open> {
    let fut = async {
        while let Some(msg) = ws_rx.next().await {
            let msg = msg.map_err(|e| Error::protocol(format!("transport error: {e}")))?;
            if let Message::Binary(data) = msg {
                if let Some(frame) = assembler.push(&data)? {
                    return match frame {
                        Frame::Open(open) if open.version == PROTOCOL_VERSION => Ok(open),
                        Frame::Open(open) => Err(Error::protocol(format!(
                            "unsupported protocol version {}",
                            open.version
                        ))),
                        other => Err(Error::protocol(format!(
                            "expected OPEN, got {:?}",
                            other.frame_type()
                        ))),
                    };
                }
            }
        }
        Err(Error::TunnelDisconnected)
    };
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| Error::Timeout)?
}

async fn dispatch_inbound(handle: &ChannelHandle, frame: Frame) {
    match frame {
        Frame::RespHead(head) => {
            if let Err(e) = handle
                .tracker()
                .complete_head(&head.request_id, head.status, head.headers)
            {
                // Late frames after timeout or cancel are discarded.
                debug!("RESP_HEAD for {} discarded: {e}", head.request_id);
            }
        }
        Frame::RespBody(body) => {
            if let Err(e) = handle
                .tracker()
                .complete_body(&body.request_id, body.chunk, body.last)
                .await
            {
                debug!("RESP_BODY for {} discarded: {e}", body.request_id);
            }
        }
        Frame::StreamData(data) => {
            handle.deliver_session_data(&data.session_id, data.data).await;
        }
        Frame::StreamClose(close) => {
            handle.close_session(
                &close.session_id,
                close.error.map(|kind| Error::from_wire(kind, None)),
            );
        }
        Frame::Err(err) => {
            let error = Error::from_wire(err.kind, err.message);
            if handle.sessions.contains_key(&err.correlation_id) {
                handle.close_session(&err.correlation_id, Some(error));
            } else if let Err(e) = handle.tracker().fail(&err.correlation_id, error) {
                debug!("ERR for {} discarded: {e}", err.correlation_id);
            }
        }
        Frame::Ping(seq) => {
            let _ = handle.try_send(Frame::Pong(seq));
        }
        // Pong is handled in the serve loop; the rest are not valid from
        // the client after attach.
        other => {
            debug!("unexpected {:?} frame from client", other.frame_type());
        }
    }
}

async fn send_frame(
    ws_tx: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    frame: &Frame,
) -> std::result::Result<(), axum::Error> {
    for wire in encode(frame) {
        ws_tx.send(Message::Binary(wire.to_vec())).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_try_send_reports_capacity() {
        let (handle, _rx) = ChannelHandle::new(1, 4);
        handle.try_send(Frame::Ping(1)).unwrap();
        assert!(matches!(
            handle.try_send(Frame::Ping(2)),
            Err(Error::Capacity)
        ));
    }

    #[tokio::test]
    async fn test_send_fails_after_receiver_drop() {
        let (handle, rx) = ChannelHandle::new(1, 4);
        drop(rx);
        assert!(matches!(
            handle.send(Frame::Ping(1)).await,
            Err(Error::TunnelDisconnected)
        ));
    }

    #[tokio::test]
    async fn test_inflight_cap() {
        let (handle, _rx) = ChannelHandle::new(8, 2);
        let a = handle.acquire_slot().unwrap();
        let _b = handle.acquire_slot().unwrap();
        assert!(matches!(handle.acquire_slot(), Err(Error::Capacity)));
        drop(a);
        assert!(handle.acquire_slot().is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let (handle, _rx) = ChannelHandle::new(8, 4);
        let _rx1 = handle.register_session("s1").unwrap();
        assert!(matches!(
            handle.register_session("s1"),
            Err(Error::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_fails_pending_and_sessions() {
        let (handle, _rx) = ChannelHandle::new(8, 4);
        let pending = handle
            .tracker()
            .register("r1", Duration::from_secs(5))
            .unwrap();
        let mut session_rx = handle.register_session("s1").unwrap();

        handle.abort(&Error::TunnelDisconnected);

        assert!(matches!(
            pending.wait(Duration::from_secs(1)).await,
            Err(Error::TunnelDisconnected)
        ));
        assert!(matches!(
            session_rx.recv().await,
            Some(StreamEvent::Close(Some(_)))
        ));
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn test_inbound_err_frame_fails_request() {
        let (handle, _rx) = ChannelHandle::new(8, 4);
        let pending = handle
            .tracker()
            .register("r1", Duration::from_secs(5))
            .unwrap();
        dispatch_inbound(
            &handle,
            Frame::Err(uniroute_shared::frame::ErrFrame {
                correlation_id: "r1".into(),
                kind: uniroute_shared::ErrorKind::Refused,
                message: None,
            }),
        )
        .await;
        assert!(matches!(
            pending.wait(Duration::from_secs(1)).await,
            Err(Error::Refused)
        ));
    }
}
