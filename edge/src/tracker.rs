//! Per-tunnel table of in-flight requests.
//!
//! Each registered request id observes exactly one outcome: response head
//! delivered, failure, timeout, or caller cancellation. The head travels
//! through a oneshot; body chunks stream through a bounded channel created
//! when the head arrives.

use bytes::Bytes;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uniroute_shared::frame::Headers;
use uniroute_shared::{Error, Result};

const BODY_CHANNEL_DEPTH: usize = 32;

/// Response head as delivered to the waiting ingress task.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

/// Body chunk stream; an `Err` item aborts the response mid-stream.
pub type BodyStream = mpsc::Receiver<Result<Bytes>>;

type HeadOutcome = Result<(ResponseHead, BodyStream)>;

struct Pending {
    head_tx: Option<oneshot::Sender<HeadOutcome>>,
    body_tx: Option<mpsc::Sender<Result<Bytes>>>,
    deadline: Instant,
}

/// Handle held by the ingress task that issued the request.
pub struct ResponseHandle {
    pub request_id: String,
    head_rx: oneshot::Receiver<HeadOutcome>,
}

impl ResponseHandle {
    /// Block until the head arrives, the request fails, or the deadline
    /// passes. The caller must [`RequestTracker::cancel`] on timeout or
    /// disconnect so late frames are discarded.
    pub async fn wait(self, deadline: Duration) -> HeadOutcome {
        match tokio::time::timeout(deadline, self.head_rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an outcome: the tunnel went away.
            Ok(Err(_)) => Err(Error::TunnelDisconnected),
            Err(_) => Err(Error::Timeout),
        }
    }
}

#[derive(Default)]
pub struct RequestTracker {
    pending: DashMap<String, Pending>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Register a request id with a deadline.
    pub fn register(&self, request_id: &str, timeout: Duration) -> Result<ResponseHandle> {
        let (head_tx, head_rx) = oneshot::channel();
        let entry = Pending {
            head_tx: Some(head_tx),
            body_tx: None,
            deadline: Instant::now() + timeout,
        };
        match self.pending.entry(request_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(Error::Duplicate(request_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                Ok(ResponseHandle {
                    request_id: request_id.to_string(),
                    head_rx,
                })
            }
        }
    }

    /// Deliver the response head; opens the body stream.
    pub fn complete_head(&self, request_id: &str, status: u16, headers: Headers) -> Result<()> {
        let mut entry = self
            .pending
            .get_mut(request_id)
            .ok_or(Error::TunnelNotFound)?;
        let head_tx = entry
            .head_tx
            .take()
            .ok_or_else(|| Error::Duplicate(request_id.to_string()))?;
        let (body_tx, body_rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
        entry.body_tx = Some(body_tx);
        drop(entry);

        if head_tx
            .send(Ok((ResponseHead { status, headers }, body_rx)))
            .is_err()
        {
            // Waiter is gone; drop the entry so body frames get discarded.
            self.pending.remove(request_id);
        }
        Ok(())
    }

    /// Deliver one body chunk; `last` completes the request. Blocks when
    /// the waiter is slow, which backpressures the channel reader.
    pub async fn complete_body(&self, request_id: &str, chunk: Bytes, last: bool) -> Result<()> {
        let body_tx = {
            let entry = self
                .pending
                .get(request_id)
                .ok_or(Error::TunnelNotFound)?;
            entry.body_tx.clone().ok_or_else(|| {
                Error::protocol(format!("RESP_BODY before RESP_HEAD for {request_id}"))
            })?
        };
        let delivered = body_tx.send(Ok(chunk)).await.is_ok();
        if last || !delivered {
            self.pending.remove(request_id);
        }
        Ok(())
    }

    /// Fail a pending request; exactly-one-outcome safe at any stage.
    pub fn fail(&self, request_id: &str, error: Error) -> Result<()> {
        let (_, entry) = self
            .pending
            .remove(request_id)
            .ok_or(Error::TunnelNotFound)?;
        deliver_failure(entry, error);
        Ok(())
    }

    /// Drop the entry after a caller disconnect or wait timeout; later
    /// frames for the id are discarded with `TunnelNotFound`.
    pub fn cancel(&self, request_id: &str) {
        self.pending.remove(request_id);
    }

    /// Fail every pending request (control-channel tear-down).
    pub fn fail_all(&self, error: &Error) {
        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                deliver_failure(entry, error.clone());
            }
        }
    }

    /// Reap entries past their deadline with `Timeout`.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|e| e.deadline <= now)
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for id in expired {
            if let Some((_, entry)) = self.pending.remove(&id) {
                debug!("request {id} expired");
                deliver_failure(entry, Error::Timeout);
            }
        }
        count
    }
}

fn deliver_failure(mut entry: Pending, error: Error) {
    if let Some(head_tx) = entry.head_tx.take() {
        let _ = head_tx.send(Err(error));
    } else if let Some(body_tx) = entry.body_tx.take() {
        // Head already delivered: abort the stream.
        let _ = body_tx.try_send(Err(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let tracker = RequestTracker::new();
        let _handle = tracker.register("r1", Duration::from_secs(5)).unwrap();
        assert!(matches!(
            tracker.register("r1", Duration::from_secs(5)),
            Err(Error::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_head_then_body_then_done() {
        let tracker = RequestTracker::new();
        let handle = tracker.register("r1", Duration::from_secs(5)).unwrap();

        tracker
            .complete_head("r1", 200, vec![("content-type".into(), "text/plain".into())])
            .unwrap();
        tracker
            .complete_body("r1", Bytes::from_static(b"hel"), false)
            .await
            .unwrap();
        tracker
            .complete_body("r1", Bytes::from_static(b"lo"), true)
            .await
            .unwrap();

        let (head, mut body) = handle.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(body.recv().await.unwrap().unwrap(), Bytes::from_static(b"hel"));
        assert_eq!(body.recv().await.unwrap().unwrap(), Bytes::from_static(b"lo"));
        assert!(body.recv().await.is_none());
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_body_before_head_is_protocol_error() {
        let tracker = RequestTracker::new();
        let _handle = tracker.register("r1", Duration::from_secs(5)).unwrap();
        let err = tracker
            .complete_body("r1", Bytes::new(), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_fail_delivers_once() {
        let tracker = RequestTracker::new();
        let handle = tracker.register("r1", Duration::from_secs(5)).unwrap();
        tracker.fail("r1", Error::TunnelDisconnected).unwrap();
        assert!(matches!(
            handle.wait(Duration::from_secs(1)).await,
            Err(Error::TunnelDisconnected)
        ));
        // Second outcome for the same id is NotFound.
        assert!(matches!(
            tracker.fail("r1", Error::Timeout),
            Err(Error::TunnelNotFound)
        ));
        assert!(matches!(
            tracker.complete_head("r1", 200, vec![]),
            Err(Error::TunnelNotFound)
        ));
    }

    #[tokio::test]
    async fn test_cancel_discards_late_frames() {
        let tracker = RequestTracker::new();
        let _handle = tracker.register("r1", Duration::from_secs(5)).unwrap();
        tracker.cancel("r1");
        assert!(matches!(
            tracker.complete_head("r1", 200, vec![]),
            Err(Error::TunnelNotFound)
        ));
    }

    #[tokio::test]
    async fn test_sweep_times_out_expired() {
        let tracker = RequestTracker::new();
        let handle = tracker.register("r1", Duration::from_millis(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(tracker.sweep(), 1);
        assert!(matches!(
            handle.wait(Duration::from_secs(1)).await,
            Err(Error::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_fail_all_on_teardown() {
        let tracker = RequestTracker::new();
        let h1 = tracker.register("r1", Duration::from_secs(5)).unwrap();
        let h2 = tracker.register("r2", Duration::from_secs(5)).unwrap();
        tracker.fail_all(&Error::TunnelDisconnected);
        assert!(matches!(
            h1.wait(Duration::from_secs(1)).await,
            Err(Error::TunnelDisconnected)
        ));
        assert!(matches!(
            h2.wait(Duration::from_secs(1)).await,
            Err(Error::TunnelDisconnected)
        ));
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn test_mid_stream_failure_aborts_body() {
        let tracker = RequestTracker::new();
        let handle = tracker.register("r1", Duration::from_secs(5)).unwrap();
        tracker.complete_head("r1", 200, vec![]).unwrap();
        tracker
            .complete_body("r1", Bytes::from_static(b"part"), false)
            .await
            .unwrap();
        tracker.fail("r1", Error::TunnelDisconnected).unwrap();

        let (_, mut body) = handle.wait(Duration::from_secs(1)).await.unwrap();
        assert!(body.recv().await.unwrap().is_ok());
        assert!(body.recv().await.unwrap().is_err());
    }
}
