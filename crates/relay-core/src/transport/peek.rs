//! A stream wrapper that can look ahead without consuming.
//!
//! Protocol sniffing needs the first bytes of a TCP connection before it
//! knows who should read the stream. [`PeekStream`] buffers whatever was
//! peeked and replays it on subsequent reads, so no byte is ever lost to
//! the sniffer. Wrapping a TLS stream in a fresh `PeekStream` restarts the
//! lookahead on the decrypted bytes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// Stream with a replayable lookahead buffer.
pub struct PeekStream<S> {
    inner: S,
    buffer: Vec<u8>,
    pos: usize,
}

impl<S: AsyncRead + Unpin> PeekStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            pos: 0,
        }
    }

    /// Unconsumed buffered bytes.
    fn pending(&self) -> usize {
        self.buffer.len() - self.pos
    }

    /// Look at the next `n` bytes without consuming them. Reads from the
    /// underlying stream as needed; a stream that ends first is an
    /// [`io::ErrorKind::UnexpectedEof`] error.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.pending() < n {
            let mut chunk = [0u8; 512];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended during protocol sniffing",
                ));
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(&self.buffer[self.pos..self.pos + n])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.pending() > 0 {
            let available = &this.buffer[this.pos..];
            let n = available.len().min(buf.remaining());
            buf.put_slice(&available[..n]);
            this.pos += n;
            if this.pending() == 0 {
                this.buffer.clear();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for PeekStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn peeked_bytes_are_replayed_on_read() {
        let data: &[u8] = b"GET /webrtc/status HTTP/1.1\r\n";
        let mut stream = PeekStream::new(data);

        assert_eq!(stream.peek(3).await.unwrap(), b"GET");
        // A wider peek extends the lookahead.
        assert_eq!(stream.peek(8).await.unwrap(), b"GET /web");

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn reads_straddle_the_buffer_boundary() {
        let data: &[u8] = b"0123456789";
        let mut stream = PeekStream::new(data);
        stream.peek(4).await.unwrap();

        let mut first = [0u8; 6];
        stream.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"012345");

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"6789");
    }

    #[tokio::test]
    async fn short_stream_fails_the_peek() {
        let data: &[u8] = b"ab";
        let mut stream = PeekStream::new(data);
        let err = stream.peek(3).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn peek_of_buffered_data_does_not_touch_the_stream() {
        let data: &[u8] = b"xyz-rest";
        let mut stream = PeekStream::new(data);
        stream.peek(3).await.unwrap();
        assert_eq!(stream.peek(2).await.unwrap(), b"xy");
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }
}
