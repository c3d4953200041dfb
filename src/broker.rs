//! The public-facing half: agent registry, event loop, and both listeners.
//!
//! All broker state lives in one task. Socket readers, the auth step, and
//! HTTP workers run as separate tasks and talk to the loop exclusively
//! through its event queue, so no lock ever guards an agent or a tunnel.
//! The loop is also the only place tunnel ids are minted, which keeps them
//! strictly increasing per agent.
//!
//! The loop never writes a socket. Each agent connection gets a dedicated
//! writer task fed by a bounded queue; everything outbound, including the
//! `OK` handshake acknowledgement and close notifications, goes through it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use n0_error::{Result, StdResultExt};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info, warn};

use self::http::HttpError;
use crate::pipe::BlockedBuffer;
use crate::proto::{Frame, FrameReader, Tid, write_frames};
use crate::route::RouteTable;
use crate::tunnel::{ClosedTunnel, Tunnel, TunnelState};

pub mod http;

/// Read deadline for the auth frame; reads are unbounded afterwards.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
/// Outbound frames queued per agent before producers wait.
const OUTBOUND_QUEUE: usize = 64;
/// Events queued into the loop before producers wait.
const EVENT_QUEUE: usize = 128;

/// Configuration the broker is constructed from.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Shared secret every agent must present.
    pub token: String,
    /// Immutable host routing table.
    pub routes: RouteTable,
}

/// The broker: owns every agent connection and every live tunnel.
#[derive(Debug)]
pub struct Broker {
    token: Arc<str>,
    routes: Arc<RouteTable>,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    closed_tx: mpsc::UnboundedSender<ClosedTunnel>,
    closed_rx: mpsc::UnboundedReceiver<ClosedTunnel>,
    agents: HashMap<String, AgentEntry>,
    next_conn: u64,
    cancel: CancellationToken,
}

/// One authenticated agent as the loop sees it.
#[derive(Debug)]
struct AgentEntry {
    /// Connection serial; guards against events from a replaced connection.
    conn: u64,
    outbound: mpsc::Sender<Frame>,
    tunnels: HashMap<Tid, TunnelEntry>,
    next_tid: Tid,
    cancel: CancellationToken,
}

/// Loop-side view of a tunnel: the buffers to fill and the shared state.
#[derive(Debug)]
struct TunnelEntry {
    request: Arc<BlockedBuffer>,
    response: Arc<BlockedBuffer>,
    state: Arc<TunnelState>,
}

impl TunnelEntry {
    fn close(&self) {
        self.state.mark_closed();
        self.request.close();
        self.response.close();
    }

    fn abort(&self, reason: &str) {
        self.state.mark_closed();
        self.request.abort(reason);
        self.response.abort(reason);
    }
}

#[derive(Debug)]
pub(crate) enum Event {
    /// An agent cleared authentication; the socket halves come along.
    AgentOnline {
        id: String,
        addr: SocketAddr,
        reader: FrameReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    },
    /// An agent's control socket ended.
    AgentOffline { id: String, conn: u64 },
    /// The reader task decoded a frame on an agent connection.
    Frame { id: String, conn: u64, frame: Frame },
    /// The HTTP listener accepted a client connection.
    HttpConn { stream: TcpStream, addr: SocketAddr },
    /// An HTTP worker asks for a routed tunnel.
    OpenTunnel {
        host: String,
        reply: oneshot::Sender<Result<Tunnel, HttpError>>,
    },
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            token: config.token.into(),
            routes: Arc::new(config.routes),
            events_tx,
            events_rx,
            closed_tx,
            closed_rx,
            agents: HashMap::new(),
            next_conn: 0,
            cancel: CancellationToken::new(),
        }
    }

    /// Runs the broker on the given listeners until the future is dropped.
    pub async fn serve(mut self, control: TcpListener, http: TcpListener) -> Result<()> {
        let _cancel_guard = self.cancel.clone().drop_guard();
        let control_addr = control.local_addr().std_context("control listener address")?;
        let http_addr = http.local_addr().std_context("http listener address")?;
        info!(
            control = %control_addr,
            http = %http_addr,
            routes = self.routes.len(),
            "broker listening"
        );
        tokio::spawn(
            accept_agents(
                control,
                self.events_tx.clone(),
                self.token.clone(),
                self.cancel.clone(),
            )
            .instrument(error_span!("agent-acceptor")),
        );
        tokio::spawn(
            accept_clients(http, self.events_tx.clone(), self.cancel.clone())
                .instrument(error_span!("http-acceptor")),
        );
        self.event_loop().await;
        Ok(())
    }

    async fn event_loop(&mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Some(closed) = self.closed_rx.recv() => self.on_tunnel_closed(closed),
                Some(event) = self.events_rx.recv() => self.on_event(event).await,
            }
        }
        for (_, entry) in self.agents.drain() {
            entry.cancel.cancel();
            for tunnel in entry.tunnels.values() {
                tunnel.abort("broker shutting down");
            }
        }
    }

    async fn on_event(&mut self, event: Event) {
        match event {
            Event::AgentOnline {
                id,
                addr,
                reader,
                writer,
            } => self.on_agent_online(id, addr, reader, writer),
            Event::AgentOffline { id, conn } => self.on_agent_offline(&id, conn),
            Event::Frame { id, conn, frame } => self.on_frame(&id, conn, frame).await,
            Event::HttpConn { stream, addr } => {
                let events = self.events_tx.clone();
                let cancel = self.cancel.child_token();
                tokio::spawn(
                    cancel
                        .run_until_cancelled_owned(http::serve_client(stream, events))
                        .instrument(error_span!("client", %addr)),
                );
            }
            Event::OpenTunnel { host, reply } => {
                let _ = reply.send(self.open_tunnel(&host));
            }
        }
    }

    fn on_agent_online(
        &mut self,
        id: String,
        addr: SocketAddr,
        reader: FrameReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
    ) {
        if self.agents.contains_key(&id) {
            warn!(%id, %addr, "agent id already exists");
            tokio::spawn(async move {
                let rejection = Frame::Error {
                    content: "agent id already exists".to_string(),
                };
                let _ = writer.write_all(&rejection.encode()).await;
                drop(reader);
            });
            return;
        }

        self.next_conn += 1;
        let conn = self.next_conn;
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = self.cancel.child_token();

        tokio::spawn(
            {
                let cancel = cancel.clone();
                async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        res = write_frames(outbound_rx, writer) => {
                            if let Err(err) = res {
                                debug!("agent socket write failed: {err:#}");
                            }
                        }
                    }
                }
            }
            .instrument(error_span!("agent-writer", %id)),
        );
        tokio::spawn(
            read_agent_frames(
                id.clone(),
                conn,
                reader,
                self.events_tx.clone(),
                cancel.clone(),
            )
            .instrument(error_span!("agent-reader", %id)),
        );

        // The queue is freshly created, this cannot fail.
        let _ = outbound.try_send(Frame::Text {
            content: "OK".to_string(),
        });
        info!(%id, %addr, "agent online");
        self.agents.insert(
            id,
            AgentEntry {
                conn,
                outbound,
                tunnels: HashMap::new(),
                next_tid: 0,
                cancel,
            },
        );
    }

    fn on_agent_offline(&mut self, id: &str, conn: u64) {
        if self.agents.get(id).is_none_or(|entry| entry.conn != conn) {
            return;
        }
        if let Some(entry) = self.agents.remove(id) {
            entry.cancel.cancel();
            for tunnel in entry.tunnels.values() {
                tunnel.abort("agent disconnected");
            }
            info!(%id, "agent offline");
        }
    }

    async fn on_frame(&mut self, id: &str, conn: u64, frame: Frame) {
        let Some(entry) = self.agents.get_mut(id) else {
            return;
        };
        if entry.conn != conn {
            return;
        }
        match frame {
            Frame::Data { tid, data, .. } => match entry.tunnels.get(&tid) {
                Some(tunnel) if !tunnel.state.is_closed() => {
                    // The one-chunk pipe is the inbound backpressure: the
                    // loop waits here until the worker drains or goes away.
                    if let Err(err) = tunnel.response.write(&data).await {
                        debug!(%id, tid, "response chunk dropped: {err}");
                    }
                }
                _ => {
                    // The agent is ahead of our view; tell it to stop.
                    debug!(%id, tid, "data frame for unknown tunnel");
                    let _ = entry.outbound.try_send(Frame::Close {
                        tid,
                        reason: "EOF".to_string(),
                    });
                }
            },
            Frame::Close { tid, reason } => {
                if let Some(tunnel) = entry.tunnels.remove(&tid) {
                    tunnel.close();
                    debug!(%id, tid, %reason, "tunnel closed by agent");
                }
            }
            Frame::Text { content } => info!(%id, "agent says: {content}"),
            Frame::Error { content } => warn!(%id, "agent error: {content}"),
            Frame::Auth { .. } => {
                warn!(%id, "unexpected auth frame, dropping agent");
                self.on_agent_offline(id, conn);
            }
        }
    }

    fn on_tunnel_closed(&mut self, closed: ClosedTunnel) {
        if let Some(entry) = self.agents.get_mut(&closed.agent_id)
            && let Some(tunnel) = entry.tunnels.remove(&closed.tid)
        {
            tunnel.close();
            debug!(agent = %closed.agent_id, tid = closed.tid, "tunnel entry dropped");
        }
    }

    fn open_tunnel(&mut self, host: &str) -> Result<Tunnel, HttpError> {
        let Some(route) = self.routes.lookup(host).cloned() else {
            debug!(%host, "no route record");
            return Err(HttpError::NO_ROUTE);
        };
        let Some(entry) = self.agents.get_mut(&route.agent_id) else {
            debug!(%host, agent = %route.agent_id, "route resolves to an offline agent");
            return Err(HttpError::AGENT_OFFLINE);
        };
        entry.next_tid += 1;
        let tid = entry.next_tid;
        let request = BlockedBuffer::new();
        let response = BlockedBuffer::new();
        let state = Arc::new(TunnelState::default());
        entry.tunnels.insert(
            tid,
            TunnelEntry {
                request: request.clone(),
                response: response.clone(),
                state: state.clone(),
            },
        );
        debug!(agent = %route.agent_id, tid, %host, "tunnel opened");
        Ok(Tunnel::new(
            tid,
            route.agent_id,
            route.origin,
            request,
            response,
            state,
            entry.outbound.clone(),
            self.closed_tx.clone(),
        ))
    }
}

/// Accepts agent connections and runs the auth step for each.
async fn accept_agents(
    listener: TcpListener,
    events: mpsc::Sender<Event>,
    token: Arc<str>,
    cancel: CancellationToken,
) {
    let mut id = 0u64;
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("accept agent connection: {err:#}");
                break;
            }
        };
        let events = events.clone();
        let token = token.clone();
        tokio::spawn(
            cancel
                .child_token()
                .run_until_cancelled_owned(authenticate(stream, addr, token, events))
                .instrument(error_span!("agent-auth", id)),
        );
        id += 1;
    }
}

/// Validates the first frame of a new agent connection.
///
/// Rejections are written straight to the socket; the connection only ever
/// reaches the loop once the token is right and the id non-empty. The `OK`
/// acknowledgement is not sent here: the loop still has to rule on duplicate
/// ids first.
async fn authenticate(
    stream: TcpStream,
    addr: SocketAddr,
    token: Arc<str>,
    events: mpsc::Sender<Event>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = FrameReader::new(read_half);
    let frame = match timeout(AUTH_TIMEOUT, reader.read_frame()).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(err)) => {
            debug!(%addr, "connection failed before auth: {err:#}");
            return;
        }
        Err(_) => {
            debug!(%addr, "no auth frame within the deadline");
            return;
        }
    };
    let (id, presented) = match frame {
        Frame::Auth { id, token } => (id, token),
        other => {
            debug!(%addr, kind = other.kind(), "first frame is not auth");
            reject(&mut write_half, "first message must be auth").await;
            return;
        }
    };
    if presented != token.as_ref() {
        warn!(%addr, "invalid token");
        reject(&mut write_half, "token is not correct").await;
        return;
    }
    if id.is_empty() {
        warn!(%addr, "empty agent id");
        reject(&mut write_half, "empty agent id").await;
        return;
    }
    let _ = events
        .send(Event::AgentOnline {
            id,
            addr,
            reader,
            writer: write_half,
        })
        .await;
}

async fn reject(writer: &mut OwnedWriteHalf, reason: &str) {
    let frame = Frame::Error {
        content: reason.to_string(),
    };
    let _ = writer.write_all(&frame.encode()).await;
}

/// Reads frames off one agent connection and feeds them to the loop.
async fn read_agent_frames(
    id: String,
    conn: u64,
    mut reader: FrameReader<OwnedReadHalf>,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = reader.read_frame() => frame,
        };
        match frame {
            Ok(frame) => {
                let event = Event::Frame {
                    id: id.clone(),
                    conn,
                    frame,
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                if err.is_closed() {
                    debug!("agent connection closed");
                } else {
                    warn!("agent connection failed: {err:#}");
                }
                let _ = events.send(Event::AgentOffline { id, conn }).await;
                return;
            }
        }
    }
}

/// Accepts HTTP client connections and hands them to the loop.
async fn accept_clients(
    listener: TcpListener,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, addr)) => {
                debug!(%addr, "accepted client connection");
                if events.send(Event::HttpConn { stream, addr }).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!("accept client connection: {err:#}");
                break;
            }
        }
    }
}
