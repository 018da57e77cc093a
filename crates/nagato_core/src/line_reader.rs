//! Incremental line and bounded-byte reads over an async byte source.
//!
//! Mirrors the pull-one-line-at-a-time discipline the session relies on:
//! nothing here buffers a whole message, only as much as is needed to find
//! the next `\n` or satisfy the next fixed-size read.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{SessionError, SessionResult};

const FILL_CHUNK: usize = 64 * 1024;

pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn fill(&mut self) -> SessionResult<usize> {
        let mut tmp = [0u8; FILL_CHUNK];
        let n = self.inner.read(&mut tmp).await?;
        if n == 0 {
            return Err(SessionError::EndOfStream);
        }
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(n)
    }

    /// Returns the bytes up to and including the next `\n`.
    pub async fn readline(&mut self) -> SessionResult<Vec<u8>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                return Ok(line.to_vec());
            }
            self.fill().await?;
        }
    }

    /// Reads up to `n` bytes in a single attempt; short reads are allowed.
    /// Fails with `EndOfStream` only if zero bytes are available and the
    /// peer has closed.
    pub async fn read_exact(&mut self, n: usize) -> SessionResult<Vec<u8>> {
        if self.buf.is_empty() {
            self.fill().await?;
        }
        let take = n.min(self.buf.len());
        Ok(self.buf.split_to(take).to_vec())
    }

    /// Forwards exactly `n` bytes from this reader to `sink`, buffering no
    /// more than necessary. Used to relay Content-Length-framed bodies.
    pub async fn read_n<W: AsyncWrite + Unpin>(
        &mut self,
        mut n: usize,
        sink: &mut W,
    ) -> SessionResult<()> {
        while n > 0 {
            if self.buf.is_empty() {
                self.fill().await?;
            }
            let take = n.min(self.buf.len());
            let chunk = self.buf.split_to(take);
            sink.write_all(&chunk).await?;
            n -= take;
        }
        Ok(())
    }

    pub fn drain_buffered(&mut self) -> Vec<u8> {
        let len = self.buf.len();
        self.buf.split_to(len).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn readline_returns_up_to_and_including_newline() {
        let mut r = LineReader::new(Cursor::new(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec()));
        let line = r.readline().await.unwrap();
        assert_eq!(line, b"GET / HTTP/1.1\r\n");
        let line = r.readline().await.unwrap();
        assert_eq!(line, b"Host: x\r\n");
    }

    #[tokio::test]
    async fn readline_on_empty_stream_is_end_of_stream() {
        let mut r = LineReader::new(Cursor::new(Vec::new()));
        match r.readline().await {
            Err(SessionError::EndOfStream) => {}
            other => panic!("expected EndOfStream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn read_n_relays_exact_byte_count() {
        let mut r = LineReader::new(Cursor::new(b"hello world".to_vec()));
        let mut sink = Vec::new();
        r.read_n(5, &mut sink).await.unwrap();
        assert_eq!(sink, b"hello");
        let rest = r.readline().await;
        assert!(rest.is_err() || rest.unwrap().starts_with(b" world"));
    }

    #[tokio::test]
    async fn read_n_fails_on_premature_close() {
        let mut r = LineReader::new(Cursor::new(b"short".to_vec()));
        let mut sink = Vec::new();
        let err = r.read_n(100, &mut sink).await.unwrap_err();
        assert!(matches!(err, SessionError::EndOfStream));
    }
}
