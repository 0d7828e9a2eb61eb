//! Streaming message body reader.
//!
//! Pulls chunk frames off the stream only when the caller asks for more
//! bytes and stops at the zero-length terminator. One internal buffer is
//! reused across chunks. A reader covers exactly one message: once it reports
//! the end of the body it must be discarded.

use crate::frame::read_chunk_len;
use crate::WireError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Lazy reader over the chunk frames of a single message
#[derive(Debug)]
pub struct BodyReader<R> {
    inner: R,
    max_chunk: usize,
    done: bool,
    pending: Vec<u8>,
    offset: usize,
}

impl<R: AsyncRead + Unpin> BodyReader<R> {
    /// Create a reader positioned right after a message header
    pub fn new(inner: R, max_chunk: usize) -> Self {
        Self {
            inner,
            max_chunk,
            done: false,
            pending: Vec::new(),
            offset: 0,
        }
    }

    /// True once the terminator has been consumed
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Mutable access to the underlying stream
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Give back the underlying stream
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn buffered(&self) -> &[u8] {
        &self.pending[self.offset..]
    }

    /// Make sure some unread payload is buffered. Returns false at the
    /// end of the body.
    async fn fill(&mut self) -> Result<bool, WireError> {
        if self.done {
            return Ok(false);
        }
        if self.offset < self.pending.len() {
            return Ok(true);
        }
        let len = read_chunk_len(&mut self.inner, self.max_chunk).await?;
        if len == 0 {
            self.done = true;
            self.pending.clear();
            self.offset = 0;
            return Ok(false);
        }
        // resize keeps the allocation when shrinking
        self.pending.resize(len, 0);
        self.offset = 0;
        self.inner.read_exact(&mut self.pending).await?;
        Ok(true)
    }

    /// Copy body bytes into `buf`. Returns 0 at the end of the body, or when
    /// `buf` is empty.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.is_empty() || !self.fill().await? {
            return Ok(0);
        }
        let available = self.buffered();
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.offset += n;
        Ok(n)
    }

    /// Append the rest of the body to `out`
    pub async fn read_to_end(&mut self, out: &mut Vec<u8>) -> Result<usize, WireError> {
        let mut total = 0;
        while self.fill().await? {
            out.extend_from_slice(self.buffered());
            total += self.pending.len() - self.offset;
            self.offset = self.pending.len();
        }
        Ok(total)
    }

    /// Write the rest of the body to `writer`. The writer is not flushed.
    /// Failures of `writer` are reported as [`WireError::Sink`].
    pub async fn copy_to<W: AsyncWrite + Unpin + ?Sized>(&mut self, writer: &mut W) -> Result<u64, WireError> {
        let mut total = 0u64;
        while self.fill().await? {
            let chunk = &self.pending[self.offset..];
            writer.write_all(chunk).await.map_err(WireError::Sink)?;
            total += chunk.len() as u64;
            self.offset = self.pending.len();
        }
        Ok(total)
    }

    /// Discard the rest of the body up to and including the terminator
    pub async fn drain(&mut self) -> Result<u64, WireError> {
        self.copy_to(&mut tokio::io::sink()).await
    }
}
