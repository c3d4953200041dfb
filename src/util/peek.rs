//! Peeking reader for parsing HTTP header sections off a byte stream.
//!
//! HTTP heads have no length prefix, so the parser must accumulate bytes,
//! retry the parse, and leave everything it did not consume for whoever
//! streams the body afterwards. [`Peeked`] holds that accumulation window and
//! falls through to the inner reader once the window is drained.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// An `AsyncRead` with an explicit, bounded peek window at the front.
#[derive(Debug)]
pub(crate) struct Peeked<R> {
    inner: R,
    window: BytesMut,
    limit: usize,
}

impl<R: AsyncRead + Unpin> Peeked<R> {
    /// Wraps `inner`, never buffering more than `limit` unconsumed bytes.
    pub(crate) fn new(inner: R, limit: usize) -> Self {
        Self {
            inner,
            window: BytesMut::new(),
            limit,
        }
    }

    /// The bytes read ahead but not yet consumed.
    pub(crate) fn window(&self) -> &[u8] {
        &self.window
    }

    /// True when the window cannot grow any further.
    pub(crate) fn at_limit(&self) -> bool {
        self.window.len() >= self.limit
    }

    /// Drops the first `n` window bytes; they will not be re-read.
    pub(crate) fn consume(&mut self, n: usize) {
        let n = n.min(self.window.len());
        let _ = self.window.split_to(n);
    }

    /// Reads more bytes into the window. Returns how many arrived; 0 means
    /// either end of stream or a full window.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        let room = self.limit.saturating_sub(self.window.len());
        if room == 0 {
            return Ok(0);
        }
        (&mut self.inner).take(room as u64).read_buf(&mut self.window).await
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Peeked<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.window.is_empty() {
            return Pin::new(&mut self.inner).poll_read(cx, out);
        }
        let n = self.window.len().min(out.remaining());
        let chunk = self.window.split_to(n);
        out.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncReadExt;

    use super::*;

    #[tokio::test]
    async fn fill_consume_then_stream_the_rest() {
        let mut peeked = Peeked::new(Cursor::new(b"HEAD rest of stream".to_vec()), 4);
        assert_eq!(peeked.fill().await.unwrap(), 4);
        assert_eq!(peeked.window(), b"HEAD");
        assert!(peeked.at_limit());
        assert_eq!(peeked.fill().await.unwrap(), 0);

        peeked.consume(4);
        let mut rest = String::new();
        peeked.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, " rest of stream");
    }

    #[tokio::test]
    async fn window_bytes_come_back_before_inner_bytes() {
        let mut peeked = Peeked::new(Cursor::new(b"abcdef".to_vec()), 3);
        peeked.fill().await.unwrap();
        peeked.consume(1);
        assert_eq!(peeked.window(), b"bc");

        let mut buf = [0u8; 2];
        peeked.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bc");
        let mut rest = Vec::new();
        peeked.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"def");
    }

    #[tokio::test]
    async fn fill_after_consume_reuses_the_limit() {
        let mut peeked = Peeked::new(Cursor::new(b"0123456789".to_vec()), 4);
        peeked.fill().await.unwrap();
        assert_eq!(peeked.window(), b"0123");
        peeked.consume(3);
        peeked.fill().await.unwrap();
        assert_eq!(peeked.window(), b"3456");
    }

    #[tokio::test]
    async fn fill_at_eof_returns_zero_with_empty_window() {
        let mut peeked = Peeked::new(Cursor::new(Vec::new()), 8);
        assert_eq!(peeked.fill().await.unwrap(), 0);
        assert!(peeked.window().is_empty());
    }
}
