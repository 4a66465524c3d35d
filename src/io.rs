//! Buffered, timeout-aware I/O over an async byte stream.
//!
//! Every blocking operation is bounded by an explicit timeout so a
//! connection worker can cooperatively observe a stop request between
//! attempts, instead of relying on task cancellation.

use crate::error::{Result, VncError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the internal read/write buffers.
const BUFSIZ: usize = 2048;

/// Outcome of a single [`BufferedIo`] call.
///
/// Timeout is a normal result, not an error: callers loop around it and
/// recheck whatever stop condition applies to them.
#[derive(Debug, PartialEq, Eq)]
pub enum IoOutcome {
    /// Bytes were transferred (read: into the caller's buffer; write: out of
    /// it; flush: bytes still buffered after the attempt).
    Data(usize),
    /// No data moved before the timeout elapsed.
    Timeout,
}

/// A buffered reader/writer over `T`, with explicit millisecond timeouts.
///
/// `timeout == 0` means "block indefinitely" on that call.
pub struct BufferedIo<T> {
    stream: T,
    rbuf: Vec<u8>,
    rpos: usize,
    rlen: usize,
    wbuf: Vec<u8>,
    wlen: usize,
}

impl<T: AsyncRead + AsyncWrite + Unpin> BufferedIo<T> {
    /// Wraps `stream` with empty read/write buffers of [`BUFSIZ`] bytes.
    pub fn new(stream: T) -> Self {
        BufferedIo {
            stream,
            rbuf: vec![0u8; BUFSIZ],
            rpos: 0,
            rlen: 0,
            wbuf: vec![0u8; BUFSIZ],
            wlen: 0,
        }
    }

    async fn bounded<F, R>(timeout_ms: u64, fut: F) -> std::result::Result<R, ()>
    where
        F: std::future::Future<Output = R>,
    {
        if timeout_ms == 0 {
            Ok(fut.await)
        } else {
            tokio::time::timeout(Duration::from_millis(timeout_ms), fut)
                .await
                .map_err(|_| ())
        }
    }

    /// Reads up to `buf.len()` bytes, refilling from the transport at most
    /// once per call. Returns [`IoOutcome::Timeout`] if no transport read
    /// completes within `timeout_ms`; an empty transport read (EOF) is a
    /// [`VncError::Transport`] error, matching `recv() == 0` meaning the peer
    /// hung up.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<IoOutcome> {
        self.read_timeout(buf, 1000).await
    }

    /// Same as [`Self::read`] with an explicit timeout.
    pub async fn read_timeout(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<IoOutcome> {
        if self.rpos >= self.rlen {
            match Self::bounded(timeout_ms, self.stream.read(&mut self.rbuf)).await {
                Err(()) => return Ok(IoOutcome::Timeout),
                Ok(Ok(0)) => return Err(VncError::transport("connection closed")),
                Ok(Ok(n)) => {
                    self.rpos = 0;
                    self.rlen = n;
                }
                Ok(Err(e)) => return Err(VncError::Io(e)),
            }
        }

        let available = self.rlen - self.rpos;
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.rbuf[self.rpos..self.rpos + n]);
        self.rpos += n;
        if self.rpos == self.rlen {
            self.rpos = 0;
            self.rlen = 0;
        }
        Ok(IoOutcome::Data(n))
    }

    /// Reads exactly `buf.len()` bytes, retrying across timeouts while
    /// `should_continue` returns true; used by the handshake and message
    /// decoders, which need a whole fixed-size record at once.
    pub async fn read_exact_cooperative(
        &mut self,
        buf: &mut [u8],
        timeout_ms: u64,
        mut should_continue: impl FnMut() -> bool,
    ) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            if !should_continue() {
                return Err(VncError::transport("stop requested"));
            }
            match self.read_timeout(&mut buf[filled..], timeout_ms).await? {
                IoOutcome::Data(n) => filled += n,
                IoOutcome::Timeout => continue,
            }
        }
        Ok(())
    }

    /// Buffers `buf` for later transport, flushing first if the internal
    /// write buffer would overflow.
    pub async fn write(&mut self, buf: &[u8], timeout_ms: u64) -> Result<IoOutcome> {
        let mut pos = 0;
        if self.wlen < self.wbuf.len() {
            let space = self.wbuf.len() - self.wlen;
            let n = space.min(buf.len());
            self.wbuf[self.wlen..self.wlen + n].copy_from_slice(&buf[..n]);
            self.wlen += n;
            pos = n;
            if pos == buf.len() {
                return Ok(IoOutcome::Data(buf.len()));
            }
        }

        if let IoOutcome::Timeout = self.flush(timeout_ms).await? {
            return Ok(IoOutcome::Timeout);
        }

        if self.wlen < self.wbuf.len() {
            let space = self.wbuf.len() - self.wlen;
            let n = space.min(buf.len() - pos);
            self.wbuf[self.wlen..self.wlen + n].copy_from_slice(&buf[pos..pos + n]);
            self.wlen += n;
            pos += n;
        }
        Ok(IoOutcome::Data(pos))
    }

    /// Convenience wrapper that loops [`Self::write`] until the whole buffer
    /// has been accepted, then flushes to the transport.
    pub async fn write_all(&mut self, mut buf: &[u8], timeout_ms: u64) -> Result<()> {
        while !buf.is_empty() {
            match self.write(buf, timeout_ms).await? {
                IoOutcome::Data(n) => buf = &buf[n..],
                IoOutcome::Timeout => continue,
            }
        }
        loop {
            match self.flush(timeout_ms).await? {
                IoOutcome::Data(0) => return Ok(()),
                IoOutcome::Data(_) | IoOutcome::Timeout => continue,
            }
        }
    }

    /// Drains the write buffer to the transport. Returns the number of bytes
    /// still buffered (0 once fully flushed).
    pub async fn flush(&mut self, timeout_ms: u64) -> Result<IoOutcome> {
        if self.wlen == 0 {
            return Ok(IoOutcome::Data(0));
        }

        match Self::bounded(timeout_ms, self.stream.write(&self.wbuf[..self.wlen])).await {
            Err(()) => Ok(IoOutcome::Timeout),
            Ok(Ok(0)) => Err(VncError::transport("connection closed")),
            Ok(Ok(n)) => {
                if n < self.wlen {
                    self.wbuf.copy_within(n..self.wlen, 0);
                    self.wlen -= n;
                } else {
                    self.wlen = 0;
                }
                Ok(IoOutcome::Data(self.wlen))
            }
            Ok(Err(e)) => Err(VncError::Io(e)),
        }
    }

    /// Consumes `self`, returning the wrapped transport (any buffered but
    /// unflushed write bytes are discarded, matching the source's `free`
    /// which never flushes on teardown).
    pub fn into_inner(self) -> T {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (client, server) = duplex(4096);
        let mut client_io = BufferedIo::new(client);
        let mut server_io = BufferedIo::new(server);

        client_io.write_all(b"hello world", 1000).await.unwrap();

        let mut buf = [0u8; 11];
        server_io
            .read_exact_cooperative(&mut buf, 1000, || true)
            .await
            .unwrap();
        assert_eq!(&buf, b"hello world");
    }

    #[tokio::test]
    async fn read_times_out_with_no_data() {
        let (_client, server) = duplex(4096);
        let mut server_io = BufferedIo::new(server);
        let mut buf = [0u8; 4];
        let outcome = server_io.read_timeout(&mut buf, 50).await.unwrap();
        assert_eq!(outcome, IoOutcome::Timeout);
    }

    #[tokio::test]
    async fn read_reports_closed_connection() {
        let (client, server) = duplex(4096);
        drop(client);
        let mut server_io = BufferedIo::new(server);
        let mut buf = [0u8; 4];
        let err = server_io.read_timeout(&mut buf, 1000).await.unwrap_err();
        assert!(matches!(err, VncError::Transport(_)));
    }
}
