//! Per-transaction tunnels.
//!
//! A [`Tunnel`] carries exactly one HTTP transaction (or a keep-alive run of
//! them for one unchanged host) between a client connection on the broker and
//! a TCP origin behind an agent. Request bytes leave as framed chunks on the
//! owning agent's outbound queue; response bytes arrive through a
//! [`BlockedBuffer`] the broker loop fills as frames come back.
//!
//! Tunnels are registered in two maps keyed by stable ids: the broker loop
//! holds `(agent id, tid) → buffers`, the agent holds `tid → local session`.
//! Neither side holds pointers into the other, so teardown is always a local
//! map removal plus a close frame in flight.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use n0_error::{Result, anyerr};
use tokio::sync::mpsc;

use crate::pipe::{BlockedBuffer, PipeReader};
use crate::proto::{Frame, MAX_CHUNK, Tid};

/// Close state shared between a [`Tunnel`] and the broker loop's registry
/// entry, so whichever side tears down first wins and the other becomes a
/// no-op.
#[derive(Debug, Default)]
pub struct TunnelState {
    closed: AtomicBool,
}

impl TunnelState {
    /// Marks the tunnel closed; returns whether it already was.
    pub fn mark_closed(&self) -> bool {
        self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Notification that a tunnel's handle went away; the loop drops the
/// registry entry.
#[derive(Debug)]
pub struct ClosedTunnel {
    pub agent_id: String,
    pub tid: Tid,
}

/// Handle held by the HTTP worker serving one client connection.
#[derive(Debug)]
pub struct Tunnel {
    tid: Tid,
    agent_id: String,
    origin: String,
    request: Arc<BlockedBuffer>,
    response: Arc<BlockedBuffer>,
    state: Arc<TunnelState>,
    outbound: mpsc::Sender<Frame>,
    closed_tx: mpsc::UnboundedSender<ClosedTunnel>,
    sent_host: bool,
}

impl Tunnel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tid: Tid,
        agent_id: String,
        origin: String,
        request: Arc<BlockedBuffer>,
        response: Arc<BlockedBuffer>,
        state: Arc<TunnelState>,
        outbound: mpsc::Sender<Frame>,
        closed_tx: mpsc::UnboundedSender<ClosedTunnel>,
    ) -> Self {
        Self {
            tid,
            agent_id,
            origin,
            request,
            response,
            state,
            outbound,
            closed_tx,
            sent_host: false,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// The `host:port` the agent dials for this tunnel.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Frames `buf` into data chunks on the owning agent's outbound queue.
    ///
    /// The first chunk of a tunnel names the origin so the agent can dial;
    /// every later chunk leaves the host field empty. Awaiting queue capacity
    /// here is what slows a fast client down to the agent's pace.
    pub async fn write_request(&mut self, buf: &[u8]) -> Result<()> {
        for chunk in buf.chunks(MAX_CHUNK) {
            if self.state.is_closed() {
                return Err(anyerr!("tunnel {} is closed", self.tid));
            }
            let host = if self.sent_host {
                String::new()
            } else {
                self.origin.clone()
            };
            let frame = Frame::Data {
                tid: self.tid,
                host,
                data: Bytes::copy_from_slice(chunk),
            };
            self.outbound
                .send(frame)
                .await
                .map_err(|_| anyerr!("agent {} is gone", self.agent_id))?;
            self.sent_host = true;
        }
        Ok(())
    }

    /// Byte stream of the response as relayed back by the agent.
    pub fn response_reader(&self) -> PipeReader {
        PipeReader::new(&self.response)
    }

    /// Tears the tunnel down: both pipes end, the agent gets a close frame,
    /// the loop drops its entry. Idempotent against every other teardown
    /// path (close frames from the agent, agent loss, drop).
    pub async fn close(&self, reason: &str) {
        if self.state.mark_closed() {
            return;
        }
        self.request.close();
        self.response.close();
        let _ = self
            .outbound
            .send(Frame::Close {
                tid: self.tid,
                reason: reason.to_string(),
            })
            .await;
        let _ = self.closed_tx.send(ClosedTunnel {
            agent_id: self.agent_id.clone(),
            tid: self.tid,
        });
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        // Fallback for workers that die without closing; the close frame is
        // best-effort here since drop cannot wait for queue capacity.
        if self.state.mark_closed() {
            return;
        }
        self.request.close();
        self.response.close();
        let _ = self.outbound.try_send(Frame::Close {
            tid: self.tid,
            reason: "EOF".to_string(),
        });
        let _ = self.closed_tx.send(ClosedTunnel {
            agent_id: self.agent_id.clone(),
            tid: self.tid,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Parts {
        out_rx: mpsc::Receiver<Frame>,
        closed_rx: mpsc::UnboundedReceiver<ClosedTunnel>,
        request: Arc<BlockedBuffer>,
        response: Arc<BlockedBuffer>,
        state: Arc<TunnelState>,
    }

    fn tunnel_parts() -> (Tunnel, Parts) {
        let (out_tx, out_rx) = mpsc::channel(8);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let request = BlockedBuffer::new();
        let response = BlockedBuffer::new();
        let state = Arc::new(TunnelState::default());
        let tunnel = Tunnel::new(
            7,
            "edge-1".into(),
            "127.0.0.1:9001".into(),
            request.clone(),
            response.clone(),
            state.clone(),
            out_tx,
            closed_tx,
        );
        let parts = Parts {
            out_rx,
            closed_rx,
            request,
            response,
            state,
        };
        (tunnel, parts)
    }

    #[tokio::test]
    async fn first_chunk_names_the_origin_then_host_goes_empty() {
        let (mut tunnel, mut parts) = tunnel_parts();
        tunnel.write_request(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        tunnel.write_request(b"more").await.unwrap();

        match parts.out_rx.recv().await.unwrap() {
            Frame::Data { tid, host, data } => {
                assert_eq!(tid, 7);
                assert_eq!(host, "127.0.0.1:9001");
                assert_eq!(&data[..], b"GET / HTTP/1.1\r\n\r\n");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        match parts.out_rx.recv().await.unwrap() {
            Frame::Data { host, data, .. } => {
                assert!(host.is_empty());
                assert_eq!(&data[..], b"more");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn large_writes_split_at_the_chunk_size() {
        let (mut tunnel, mut parts) = tunnel_parts();
        let body = vec![0xAB; MAX_CHUNK + 100];
        tunnel.write_request(&body).await.unwrap();

        let Frame::Data { data: first, .. } = parts.out_rx.recv().await.unwrap() else {
            panic!("expected data frame");
        };
        let Frame::Data { data: second, .. } = parts.out_rx.recv().await.unwrap() else {
            panic!("expected data frame");
        };
        assert_eq!(first.len(), MAX_CHUNK);
        assert_eq!(second.len(), 100);
    }

    #[tokio::test]
    async fn close_ends_both_pipes_once() {
        let (tunnel, mut parts) = tunnel_parts();
        tunnel.close("EOF").await;
        tunnel.close("EOF").await;

        assert!(parts.state.is_closed());
        let mut buf = [0u8; 4];
        assert_eq!(parts.request.read(&mut buf).await.unwrap(), 0);
        assert_eq!(parts.response.read(&mut buf).await.unwrap(), 0);

        match parts.out_rx.recv().await.unwrap() {
            Frame::Close { tid, reason } => {
                assert_eq!(tid, 7);
                assert_eq!(reason, "EOF");
            }
            other => panic!("unexpected frame {other:?}"),
        }
        let closed = parts.closed_rx.recv().await.unwrap();
        assert_eq!(closed.tid, 7);
        assert_eq!(closed.agent_id, "edge-1");
        // The second close produced nothing further.
        assert!(parts.out_rx.try_recv().is_err());
        assert!(parts.closed_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn writes_fail_after_close() {
        let (mut tunnel, _parts) = tunnel_parts();
        tunnel.close("EOF").await;
        assert!(tunnel.write_request(b"late").await.is_err());
    }

    #[tokio::test]
    async fn drop_still_notifies_the_loop() {
        let (tunnel, mut parts) = tunnel_parts();
        drop(tunnel);
        assert!(matches!(
            parts.out_rx.recv().await.unwrap(),
            Frame::Close { tid: 7, .. }
        ));
        assert_eq!(parts.closed_rx.recv().await.unwrap().tid, 7);
    }
}
