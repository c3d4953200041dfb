//! The HTTP side of the broker: one worker task per client connection.
//!
//! A worker parses request heads, opens a routed tunnel through the event
//! loop, and relays bytes in both directions. Heads are rewritten only to
//! point `Host` at the route's origin; bodies pass through untouched, framed
//! by `Content-Length`. A keep-alive connection keeps its tunnel for as long
//! as the client keeps asking for the same host.

use std::io;

use http::StatusCode;
use n0_error::{AnyError, Result, anyerr, stack_error};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::Event;
use crate::HEADER_SECTION_MAX_LENGTH;
use crate::parse::{BodyFraming, RequestHead, ResponseHead};
use crate::pipe::PipeReader;
use crate::proto::MAX_CHUNK;
use crate::tunnel::Tunnel;
use crate::util::Peeked;

/// A broker-generated HTTP error, written as a minimal HTTP/1.1 response
/// with an `hrt error:` body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[display("{status}: {message}")]
pub struct HttpError {
    pub status: StatusCode,
    pub reason: &'static str,
    pub message: &'static str,
}

impl HttpError {
    /// The requested host has no route record.
    pub const NO_ROUTE: Self = Self {
        status: StatusCode::NOT_FOUND,
        reason: "Not Found",
        message: "no such route record",
    };
    /// The route exists but its agent is not connected.
    pub const AGENT_OFFLINE: Self = Self {
        status: StatusCode::SERVICE_UNAVAILABLE,
        reason: "Agent Offline",
        message: "agent not online",
    };
    /// The request carries no `Host` header to route on.
    pub const MISSING_HOST: Self = Self {
        status: StatusCode::BAD_REQUEST,
        reason: "Bad Request",
        message: "missing Host header",
    };
    /// The request head could not be parsed at all.
    pub const INVALID_REQUEST: Self = Self {
        status: StatusCode::BAD_REQUEST,
        reason: "Bad Request",
        message: "invalid http request",
    };

    /// Writes the complete error response.
    pub async fn write(&self, writer: &mut (impl AsyncWrite + Unpin)) -> io::Result<()> {
        let body = format!("hrt error: {}", self.message);
        let head = format!(
            "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\r\n",
            self.status.as_u16(),
            self.reason,
            body.len(),
        );
        writer.write_all(head.as_bytes()).await?;
        writer.write_all(body.as_bytes()).await
    }
}

/// Why a client connection ended, and whether the client should hear about
/// it as an HTTP response before the socket closes.
#[stack_error(add_meta, derive)]
pub(crate) struct ClientError {
    response: Option<HttpError>,
    #[error(source)]
    source: AnyError,
}

impl ClientError {
    fn http(err: HttpError) -> Self {
        Self::new(Some(err), anyerr!("{err}"))
    }

    fn with_response(err: HttpError, source: AnyError) -> Self {
        Self::new(Some(err), source)
    }

    fn io(source: impl Into<AnyError>) -> Self {
        Self::new(None, source.into())
    }

    fn response(&self) -> Option<HttpError> {
        self.response
    }
}

impl From<io::Error> for ClientError {
    fn from(source: io::Error) -> Self {
        Self::io(source)
    }
}

/// Serves one client connection to completion, then tears its tunnel down.
pub(crate) async fn serve_client(mut stream: TcpStream, events: mpsc::Sender<Event>) {
    let mut tunnel = None;
    let result = handle_client(&mut stream, &events, &mut tunnel).await;
    if let Err(err) = result {
        match err.response() {
            Some(response) => {
                debug!("request failed: {err:#}");
                if let Err(write_err) = response.write(&mut stream).await {
                    debug!("write error response: {write_err:#}");
                }
            }
            None => debug!("client connection ended: {err:#}"),
        }
    }
    if let Some(tunnel) = tunnel {
        tunnel.close("EOF").await;
    }
    // Dropping the stream closes the client connection.
}

async fn handle_client(
    stream: &mut TcpStream,
    events: &mpsc::Sender<Event>,
    tunnel_slot: &mut Option<Tunnel>,
) -> Result<(), ClientError> {
    let (read_half, mut write_half) = stream.split();
    let mut client = Peeked::new(read_half, HEADER_SECTION_MAX_LENGTH);
    let mut response: Option<Peeked<PipeReader>> = None;
    let mut current_host: Option<String> = None;

    loop {
        let Some((head_len, head)) = RequestHead::peek(&mut client)
            .await
            .map_err(|err| ClientError::with_response(HttpError::INVALID_REQUEST, err))?
        else {
            // The client finished cleanly between requests.
            break;
        };
        let host = head
            .host()
            .ok_or_else(|| ClientError::http(HttpError::MISSING_HOST))?
            .to_string();
        if current_host.as_deref().is_some_and(|open| open != host) {
            // Keep-alive connections stick to one tunnel; a new host means
            // a new connection.
            debug!(%host, "host changed on a kept-alive connection");
            break;
        }
        if tunnel_slot.is_none() {
            let tunnel = open_tunnel(events, &host).await?;
            debug!(tid = tunnel.tid(), agent = %tunnel.agent_id(), %host, "tunnel ready");
            *tunnel_slot = Some(tunnel);
            current_host = Some(host);
        }
        let Some(tunnel) = tunnel_slot.as_mut() else {
            break;
        };

        tunnel
            .write_request(&head.encode_with_host(tunnel.origin()))
            .await
            .map_err(ClientError::io)?;
        client.consume(head_len);

        let mut reuse = !head.wants_close();
        match head
            .body_framing()
            .map_err(|err| ClientError::with_response(HttpError::INVALID_REQUEST, err))?
        {
            BodyFraming::None => {}
            BodyFraming::Length(len) => relay_request_body(&mut client, tunnel, len).await?,
            BodyFraming::UntilClose => {
                relay_request_until_eof(&mut client, tunnel).await?;
                reuse = false;
            }
        }

        let response = response.get_or_insert_with(|| {
            Peeked::new(tunnel.response_reader(), HEADER_SECTION_MAX_LENGTH)
        });
        let (resp_len, resp_head) = ResponseHead::peek(response).await.map_err(ClientError::io)?;
        // The head goes to the client exactly as the origin produced it.
        write_half.write_all(&response.window()[..resp_len]).await?;
        response.consume(resp_len);

        match resp_head
            .body_framing(&head.method)
            .map_err(ClientError::io)?
        {
            BodyFraming::None => {}
            BodyFraming::Length(len) => {
                let mut limited = (&mut *response).take(len);
                let copied = tokio::io::copy(&mut limited, &mut write_half).await?;
                if copied < len {
                    return Err(ClientError::io(anyerr!(
                        "response body ended {} bytes early",
                        len - copied
                    )));
                }
            }
            BodyFraming::UntilClose => {
                tokio::io::copy(&mut *response, &mut write_half).await?;
                reuse = false;
            }
        }
        if resp_head.wants_close() {
            reuse = false;
        }
        if !reuse {
            break;
        }
    }
    Ok(())
}

/// Asks the event loop for a tunnel routed by `host`.
async fn open_tunnel(events: &mpsc::Sender<Event>, host: &str) -> Result<Tunnel, ClientError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    events
        .send(Event::OpenTunnel {
            host: host.to_string(),
            reply: reply_tx,
        })
        .await
        .map_err(|_| ClientError::io(anyerr!("broker is shutting down")))?;
    match reply_rx.await {
        Ok(Ok(tunnel)) => Ok(tunnel),
        Ok(Err(err)) => Err(ClientError::http(err)),
        Err(_) => Err(ClientError::io(anyerr!("broker is shutting down"))),
    }
}

/// Relays exactly `remaining` request body bytes into the tunnel.
async fn relay_request_body(
    client: &mut Peeked<impl AsyncRead + Unpin>,
    tunnel: &mut Tunnel,
    mut remaining: u64,
) -> Result<(), ClientError> {
    let mut buf = [0u8; MAX_CHUNK];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = client.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(ClientError::io(anyerr!(
                "client closed inside a request body"
            )));
        }
        tunnel.write_request(&buf[..n]).await.map_err(ClientError::io)?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Relays request bytes until the client half-closes; used when the body has
/// no declared length.
async fn relay_request_until_eof(
    client: &mut Peeked<impl AsyncRead + Unpin>,
    tunnel: &mut Tunnel,
) -> Result<(), ClientError> {
    let mut buf = [0u8; MAX_CHUNK];
    loop {
        let n = client.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        tunnel.write_request(&buf[..n]).await.map_err(ClientError::io)?;
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    async fn rendered(err: HttpError) -> Vec<u8> {
        let (mut client, mut server) = tokio::io::duplex(1024);
        err.write(&mut server).await.unwrap();
        drop(server);
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn error_responses_have_the_documented_shape() {
        let body = rendered(HttpError::NO_ROUTE).await;
        assert_eq!(
            body,
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 31\r\n\r\nhrt error: no such route record"
        );

        let body = rendered(HttpError::AGENT_OFFLINE).await;
        assert_eq!(
            body,
            b"HTTP/1.1 503 Agent Offline\r\nContent-Length: 27\r\n\r\nhrt error: agent not online"
        );

        let body = rendered(HttpError::MISSING_HOST).await;
        assert!(body.starts_with(b"HTTP/1.1 400 Bad Request\r\n"));
    }
}
