//! The private-network half: one outbound connection, many local sessions.
//!
//! An agent dials the broker, authenticates, and then mirrors the broker's
//! structure in miniature: a single event loop owns the session table, a
//! reader task feeds it decoded frames, and a dedicated writer task drains
//! the one outbound queue that every producer shares. Each tunnel the broker
//! opens becomes a local TCP connection to the origin named by the first
//! data chunk.
//!
//! Losing the broker connection is fatal for [`Agent::connect`]; whoever
//! called it decides whether to reconnect.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use n0_error::{e, stack_error};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info, instrument, warn};

use crate::pipe::{BlockedBuffer, PipeReader};
use crate::proto::{DecodeError, Frame, FrameReader, MAX_CHUNK, Tid, write_frames};

/// How long to wait for the broker's handshake reply.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
/// Outbound frames queued toward the broker before producers wait.
const OUTBOUND_QUEUE: usize = 64;
/// Decoded frames queued into the loop before the reader waits.
const FRAME_QUEUE: usize = 16;

/// Why the agent's connection to the broker ended.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConnectError {
    #[error("failed to dial broker at {addr}")]
    Dial {
        addr: String,
        #[error(source, std_err)]
        source: io::Error,
    },
    #[error("no handshake reply within the deadline")]
    HandshakeTimeout,
    #[error("broker rejected the handshake: {reason}")]
    Rejected { reason: String },
    #[error("unexpected handshake reply")]
    UnexpectedReply,
    #[error("broker connection i/o failed")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
    #[error("broker connection ended")]
    Lost {
        #[error(source)]
        source: DecodeError,
    },
}

/// A local session: the inbound pipe the loop fills and the token that ends
/// the session's tasks.
#[derive(Debug)]
struct Session {
    inbound: Arc<BlockedBuffer>,
    cancel: CancellationToken,
}

impl Session {
    fn finish(&self) {
        self.inbound.close();
        self.cancel.cancel();
    }
}

/// An agent identity; [`Agent::connect`] runs it against a broker.
#[derive(Debug, Clone)]
pub struct Agent {
    id: String,
    token: String,
}

impl Agent {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Dials `addr`, authenticates, and serves tunnels until the connection
    /// ends. Always returns an error: a vanished broker is not a success.
    #[instrument("agent", skip_all, fields(id = %self.id))]
    pub async fn connect(&self, addr: &str) -> Result<(), ConnectError> {
        let stream = TcpStream::connect(addr).await.map_err(|source| {
            e!(ConnectError::Dial {
                addr: addr.to_string(),
                source,
            })
        })?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = FrameReader::new(read_half);

        let auth = Frame::Auth {
            id: self.id.clone(),
            token: self.token.clone(),
        };
        write_half
            .write_all(&auth.encode())
            .await
            .map_err(|source| e!(ConnectError::Io { source }))?;
        let reply = timeout(AUTH_TIMEOUT, reader.read_frame())
            .await
            .map_err(|_| e!(ConnectError::HandshakeTimeout))?
            .map_err(|source| e!(ConnectError::Lost { source }))?;
        match reply {
            Frame::Text { content } if content == "OK" => {}
            Frame::Text { content } | Frame::Error { content } => {
                return Err(e!(ConnectError::Rejected { reason: content }));
            }
            _ => return Err(e!(ConnectError::UnexpectedReply)),
        }
        info!(%addr, "connected to broker");

        self.run(reader, write_half).await
    }

    /// The agent event loop; sole owner of the session table.
    async fn run(
        &self,
        mut reader: FrameReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    ) -> Result<(), ConnectError> {
        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();
        let (outbound, outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
        let (frames_tx, mut frames_rx) = mpsc::channel(FRAME_QUEUE);
        let (finished_tx, mut finished_rx) = mpsc::unbounded_channel::<Tid>();

        tokio::spawn(
            {
                let cancel = cancel.clone();
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        res = write_frames(outbound_rx, writer) => {
                            if let Err(err) = res {
                                debug!("broker socket write failed: {err:#}");
                            }
                        }
                    }
                }
            }
            .instrument(error_span!("writer")),
        );
        tokio::spawn(
            {
                let cancel = cancel.clone();
                async move {
                    loop {
                        let frame = tokio::select! {
                            _ = cancel.cancelled() => return,
                            frame = reader.read_frame() => frame,
                        };
                        let failed = frame.is_err();
                        if frames_tx.send(frame).await.is_err() || failed {
                            return;
                        }
                    }
                }
            }
            .instrument(error_span!("reader")),
        );

        let mut sessions: HashMap<Tid, Session> = HashMap::new();
        let result = loop {
            tokio::select! {
                Some(tid) = finished_rx.recv() => {
                    if let Some(session) = sessions.remove(&tid) {
                        session.finish();
                        debug!(tid, "local session finished");
                    }
                }
                frame = frames_rx.recv() => match frame {
                    Some(Ok(frame)) => {
                        self.on_frame(frame, &mut sessions, &outbound, &finished_tx, &cancel)
                            .await;
                    }
                    Some(Err(err)) => break Err(e!(ConnectError::Lost { source: err })),
                    None => {
                        break Err(e!(ConnectError::Io {
                            source: io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed",
                            ),
                        }));
                    }
                }
            }
        };
        for session in sessions.values() {
            session.finish();
        }
        result
    }

    async fn on_frame(
        &self,
        frame: Frame,
        sessions: &mut HashMap<Tid, Session>,
        outbound: &mpsc::Sender<Frame>,
        finished: &mpsc::UnboundedSender<Tid>,
        cancel: &CancellationToken,
    ) {
        match frame {
            Frame::Data { tid, host, data } => {
                if let Some(session) = sessions.get(&tid) {
                    // One chunk in flight: this wait is what keeps a slow
                    // origin from buffering the broker's whole request.
                    if let Err(err) = session.inbound.write(&data).await {
                        debug!(tid, "request chunk dropped: {err}");
                    }
                } else if !host.is_empty() {
                    // First chunk of a new tunnel: register the session
                    // before dialing so later chunks stay ordered behind
                    // this one in the pipe.
                    debug!(tid, %host, "opening local session");
                    let inbound = BlockedBuffer::new();
                    if !data.is_empty() {
                        let _ = inbound.write(&data).await;
                    }
                    let session_cancel = cancel.child_token();
                    sessions.insert(
                        tid,
                        Session {
                            inbound: inbound.clone(),
                            cancel: session_cancel.clone(),
                        },
                    );
                    tokio::spawn(
                        run_session(
                            tid,
                            host.clone(),
                            inbound,
                            outbound.clone(),
                            finished.clone(),
                            session_cancel,
                        )
                        .instrument(error_span!("session", tid, %host)),
                    );
                } else {
                    // The broker is ahead of our view; tell it to stop.
                    debug!(tid, "data frame for unknown session");
                    let _ = outbound
                        .send(Frame::Close {
                            tid,
                            reason: "EOF".to_string(),
                        })
                        .await;
                }
            }
            Frame::Close { tid, reason } => {
                if let Some(session) = sessions.remove(&tid) {
                    debug!(tid, %reason, "session closed by broker");
                    session.finish();
                }
            }
            Frame::Text { content } => info!("message from broker: {content}"),
            Frame::Error { content } => warn!("error from broker: {content}"),
            Frame::Auth { .. } => warn!("unexpected auth frame from broker"),
        }
    }
}

/// Dials the origin and relays both directions until either side ends.
async fn run_session(
    tid: Tid,
    host: String,
    inbound: Arc<BlockedBuffer>,
    outbound: mpsc::Sender<Frame>,
    finished: mpsc::UnboundedSender<Tid>,
    cancel: CancellationToken,
) {
    if cancel
        .run_until_cancelled(session_io(tid, &host, &inbound, &outbound))
        .await
        .is_none()
    {
        debug!("session cancelled");
    }
    // Release the loop if it is parked on a write for this session.
    inbound.close();
    let _ = finished.send(tid);
}

async fn session_io(
    tid: Tid,
    host: &str,
    inbound: &Arc<BlockedBuffer>,
    outbound: &mpsc::Sender<Frame>,
) {
    let stream = match TcpStream::connect(host).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!("failed to dial local origin: {err}");
            let _ = outbound
                .send(Frame::Close {
                    tid,
                    reason: close_reason(&err),
                })
                .await;
            return;
        }
    };
    debug!("local origin connected");
    let (mut origin_read, mut origin_write) = stream.into_split();

    let request_to_origin = async {
        let mut pipe = PipeReader::new(inbound);
        match tokio::io::copy(&mut pipe, &mut origin_write).await {
            Ok(_) => {
                origin_write.shutdown().await.ok();
            }
            Err(err) => {
                debug!("local origin write failed: {err}");
                // Unpark the loop; nothing will drain this pipe anymore.
                inbound.abort("local connection failed");
            }
        }
    };
    let origin_to_broker = async {
        let mut buf = vec![0u8; MAX_CHUNK];
        loop {
            match origin_read.read(&mut buf).await {
                Ok(0) => {
                    let _ = outbound
                        .send(Frame::Close {
                            tid,
                            reason: "EOF".to_string(),
                        })
                        .await;
                    return;
                }
                Ok(n) => {
                    let chunk = Frame::Data {
                        tid,
                        host: String::new(),
                        data: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if outbound.send(chunk).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    debug!("local origin read failed: {err}");
                    let _ = outbound
                        .send(Frame::Close {
                            tid,
                            reason: close_reason(&err),
                        })
                        .await;
                    return;
                }
            }
        }
    };
    tokio::join!(request_to_origin, origin_to_broker);
}

/// A close reason fit for the wire: single line, never empty.
fn close_reason(err: &io::Error) -> String {
    let reason = err.to_string().replace(['\r', '\n'], " ");
    if reason.is_empty() {
        "EOF".to_string()
    } else {
        reason
    }
}
