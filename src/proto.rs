//! Framing for the broker↔agent control connection.
//!
//! Every message starts with one ASCII discriminator byte followed by a
//! LF-terminated header line; only [`Frame::Data`] carries a payload after the
//! header. Control frames stay tiny while data frames move bulk bytes, and
//! both kinds interleave freely on the same socket without any connection
//! level sequencing.
//!
//! ```text
//! @id SP token LF            auth, first frame agent→broker
//! +content LF                informational text
//! -content LF                protocol-level error
//! =tid SP len SP host LF     one data chunk, `len` raw bytes follow
//! ~tid SP reason LF          terminates the tunnel `tid`
//! ```
//!
//! `host` is only set on the first chunk of a tunnel and empty afterwards.

use std::io;

use bytes::Bytes;
use n0_error::{e, stack_error};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

/// Tunnel identifier, unique within one agent's lifetime.
pub type Tid = u64;

/// Largest payload a producer puts into a single [`Frame::Data`].
pub const MAX_CHUNK: usize = 16 * 1024;

/// Sanity cap on the declared payload length of an incoming data frame.
pub const MAX_DATA_LEN: usize = 4 * 1024 * 1024;

/// One message on the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Credentials presented by the agent; must be the first frame it sends.
    Auth { id: String, token: String },
    /// Informational content, e.g. the `OK` handshake acknowledgement.
    Text { content: String },
    /// A protocol-level error surfaced to the peer.
    Error { content: String },
    /// One chunk of tunnel `tid`. `host` names the origin on the first chunk
    /// of a tunnel and is empty on every later chunk.
    Data { tid: Tid, host: String, data: Bytes },
    /// Terminates tunnel `tid`.
    Close { tid: Tid, reason: String },
}

impl Frame {
    /// Returns the exact wire bytes for this frame.
    ///
    /// Text, error, host and reason fields must not contain LF; the decoder
    /// treats LF strictly as the header terminator.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Auth { id, token } => format!("@{id} {token}\n").into_bytes(),
            Frame::Text { content } => format!("+{content}\n").into_bytes(),
            Frame::Error { content } => format!("-{content}\n").into_bytes(),
            Frame::Data { tid, host, data } => {
                let mut buf = Vec::with_capacity(32 + host.len() + data.len());
                buf.extend_from_slice(format!("={tid} {} {host}\n", data.len()).as_bytes());
                buf.extend_from_slice(data);
                buf
            }
            Frame::Close { tid, reason } => format!("~{tid} {reason}\n").into_bytes(),
        }
    }

    /// Short name of the variant, for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Auth { .. } => "auth",
            Frame::Text { .. } => "text",
            Frame::Error { .. } => "error",
            Frame::Data { .. } => "data",
            Frame::Close { .. } => "close",
        }
    }
}

/// Failure while decoding a frame from the connection.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum DecodeError {
    /// The header line does not follow the framing rules.
    #[error("invalid frame: {reason}")]
    Invalid { reason: &'static str },
    /// The connection failed or ended; a clean close surfaces as
    /// [`io::ErrorKind::UnexpectedEof`].
    #[error("control connection i/o failed")]
    Io {
        #[error(source, std_err)]
        source: io::Error,
    },
}

impl DecodeError {
    fn invalid(reason: &'static str) -> Self {
        e!(DecodeError::Invalid { reason })
    }

    fn closed() -> Self {
        e!(DecodeError::Io {
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"),
        })
    }

    /// True when the peer closed the connection at a frame boundary.
    pub fn is_closed(&self) -> bool {
        matches!(self, DecodeError::Io { source, .. }
            if source.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Buffered frame decoder; one per socket.
#[derive(Debug)]
pub struct FrameReader<R> {
    rd: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            rd: BufReader::new(inner),
        }
    }

    /// Reads the next frame, consuming exactly its header and payload bytes.
    pub async fn read_frame(&mut self) -> Result<Frame, DecodeError> {
        let mut line = Vec::new();
        let n = self
            .rd
            .read_until(b'\n', &mut line)
            .await
            .map_err(|source| e!(DecodeError::Io { source }))?;
        if n == 0 {
            return Err(DecodeError::closed());
        }
        if line.pop() != Some(b'\n') {
            // The connection ended in the middle of a header line.
            return Err(DecodeError::closed());
        }
        let (tag, rest) = line
            .split_first()
            .ok_or_else(|| DecodeError::invalid("empty header line"))?;
        let rest = std::str::from_utf8(rest)
            .map_err(|_| DecodeError::invalid("header is not utf-8"))?;

        match tag {
            b'@' => {
                let (id, token) = rest
                    .split_once(' ')
                    .ok_or_else(|| DecodeError::invalid("auth frame without token"))?;
                Ok(Frame::Auth {
                    id: id.to_string(),
                    token: token.to_string(),
                })
            }
            b'+' => Ok(Frame::Text {
                content: rest.to_string(),
            }),
            b'-' => Ok(Frame::Error {
                content: rest.to_string(),
            }),
            b'=' => {
                let mut parts = rest.splitn(3, ' ');
                let tid = parse_number(parts.next())?;
                let len = parse_number(parts.next())? as usize;
                let host = parts
                    .next()
                    .ok_or_else(|| DecodeError::invalid("data frame without host field"))?;
                if len > MAX_DATA_LEN {
                    return Err(DecodeError::invalid("data frame exceeds length cap"));
                }
                let mut data = vec![0u8; len];
                self.rd
                    .read_exact(&mut data)
                    .await
                    .map_err(|source| e!(DecodeError::Io { source }))?;
                Ok(Frame::Data {
                    tid,
                    host: host.to_string(),
                    data: Bytes::from(data),
                })
            }
            b'~' => {
                let (tid, reason) = rest
                    .split_once(' ')
                    .ok_or_else(|| DecodeError::invalid("close frame without reason"))?;
                Ok(Frame::Close {
                    tid: parse_number(Some(tid))?,
                    reason: reason.to_string(),
                })
            }
            _ => Err(DecodeError::invalid("unknown frame tag")),
        }
    }
}

fn parse_number(field: Option<&str>) -> Result<u64, DecodeError> {
    field
        .ok_or_else(|| DecodeError::invalid("missing numeric field"))?
        .parse()
        .map_err(|_| DecodeError::invalid("malformed numeric field"))
}

/// Drains `frames` onto `writer` until the channel closes or a write fails.
///
/// Spawned once per control connection so the event loops never touch the
/// socket themselves; the queue in front of it is the only ordering domain
/// for outbound frames.
pub(crate) async fn write_frames(
    mut frames: mpsc::Receiver<Frame>,
    mut writer: impl AsyncWrite + Unpin,
) -> io::Result<()> {
    while let Some(frame) = frames.recv().await {
        writer.write_all(&frame.encode()).await?;
    }
    writer.shutdown().await.ok();
    Ok(())
}
