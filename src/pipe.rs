//! A bounded byte pipe with one chunk in flight.
//!
//! [`BlockedBuffer`] bridges an event loop producing discrete chunks to a
//! consumer that expects a plain byte stream (an HTTP head parser, a socket
//! copy loop). The write side parks while the store still holds unread bytes,
//! so a producer can never run more than one chunk ahead of its consumer.
//! That is the entire backpressure story of a tunnel: the chunk size bounds
//! the memory, the parking bounds the rate.
//!
//! A pipe ends through [`BlockedBuffer::close`] (clean end of stream) or
//! [`BlockedBuffer::abort`] (an error carried to the consumer). The first
//! status set wins; reads drain residual bytes before reporting it, writes
//! fail immediately.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Shared state of a one-chunk byte pipe.
///
/// At most one task may read and one task may write at a time; the two
/// endpoints hand their wakers to each other through the shared state.
#[derive(Debug, Default)]
pub struct BlockedBuffer {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    data: BytesMut,
    status: Option<Status>,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

#[derive(Debug, Clone)]
enum Status {
    Eof,
    Aborted(String),
}

impl Status {
    fn to_read_error(&self) -> Option<io::Error> {
        match self {
            Status::Eof => None,
            Status::Aborted(reason) => {
                Some(io::Error::new(io::ErrorKind::ConnectionAborted, reason.clone()))
            }
        }
    }

    fn to_write_error(&self) -> io::Error {
        match self {
            Status::Eof => io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed"),
            Status::Aborted(reason) => {
                io::Error::new(io::ErrorKind::ConnectionAborted, reason.clone())
            }
        }
    }
}

impl BlockedBuffer {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    /// Marks a clean end of stream. Idempotent; loses to an earlier status.
    pub fn close(&self) {
        self.finish(Status::Eof);
    }

    /// Poisons the pipe: the consumer gets `reason` once the residue drains,
    /// the producer immediately. Idempotent; loses to an earlier status.
    pub fn abort(&self, reason: impl Into<String>) {
        self.finish(Status::Aborted(reason.into()));
    }

    fn finish(&self, status: Status) {
        let mut inner = self.inner.lock().expect("pipe lock poisoned");
        if inner.status.is_none() {
            inner.status = Some(status);
            if let Some(waker) = inner.read_waker.take() {
                waker.wake();
            }
            if let Some(waker) = inner.write_waker.take() {
                waker.wake();
            }
        }
    }

    /// Appends `buf` once the store is empty. Returns the full length written
    /// or the pipe status as an error.
    pub async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        poll_fn(|cx| self.poll_write(cx, buf)).await
    }

    /// Drains up to `buf.len()` bytes, waiting while the pipe is empty.
    /// Returns 0 only at a clean end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        poll_fn(|cx| {
            let mut rb = ReadBuf::new(buf);
            self.poll_read(cx, &mut rb).map_ok(|()| rb.filled().len())
        })
        .await
    }

    fn poll_write(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut inner = self.inner.lock().expect("pipe lock poisoned");
        if let Some(status) = &inner.status {
            return Poll::Ready(Err(status.to_write_error()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if !inner.data.is_empty() {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        inner.data.extend_from_slice(buf);
        if let Some(waker) = inner.read_waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_read(&self, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut inner = self.inner.lock().expect("pipe lock poisoned");
        if !inner.data.is_empty() {
            let n = inner.data.len().min(out.remaining());
            let chunk = inner.data.split_to(n);
            out.put_slice(&chunk);
            if inner.data.is_empty() {
                if let Some(waker) = inner.write_waker.take() {
                    waker.wake();
                }
            }
            return Poll::Ready(Ok(()));
        }
        match &inner.status {
            Some(status) => match status.to_read_error() {
                // Clean close: 0 bytes filled signals end of stream.
                None => Poll::Ready(Ok(())),
                Some(err) => Poll::Ready(Err(err)),
            },
            None => {
                inner.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Read endpoint of a [`BlockedBuffer`], usable anywhere an [`AsyncRead`] is.
#[derive(Debug, Clone)]
pub struct PipeReader(Arc<BlockedBuffer>);

impl PipeReader {
    pub fn new(pipe: &Arc<BlockedBuffer>) -> Self {
        Self(pipe.clone())
    }
}

/// Write endpoint of a [`BlockedBuffer`]; shutdown closes the pipe.
#[derive(Debug, Clone)]
pub struct PipeWriter(Arc<BlockedBuffer>);

impl PipeWriter {
    pub fn new(pipe: &Arc<BlockedBuffer>) -> Self {
        Self(pipe.clone())
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.0.poll_read(cx, buf)
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.0.close();
        Poll::Ready(Ok(()))
    }
}
