//! Buffered transport wrapper shared by the head parser, the body decoder
//! and the WebSocket handshake.

use std::io;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The initial buffer size allocated before trying to read from IO.
pub(crate) const INIT_BUFFER_SIZE: usize = 8192;

pub(crate) struct BufferedIo<T> {
    io: T,
    read_buf: BytesMut,
}

impl<T> BufferedIo<T> {
    pub(crate) fn from_parts(io: T, read_buf: BytesMut) -> BufferedIo<T> {
        BufferedIo { io, read_buf }
    }

    pub(crate) fn io_ref(&self) -> &T {
        &self.io
    }

    pub(crate) fn io_mut(&mut self) -> &mut T {
        &mut self.io
    }

    /// Unconsumed bytes already read from the transport.
    pub(crate) fn data(&self) -> &[u8] {
        &self.read_buf
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.read_buf.advance(n);
    }

    /// Splits off up to `n` buffered bytes without copying.
    pub(crate) fn take(&mut self, n: usize) -> BytesMut {
        let n = n.min(self.read_buf.len());
        self.read_buf.split_to(n)
    }

    /// True if any unread input is buffered; a reused connection with
    /// buffered input received bytes we never asked for.
    pub(crate) fn has_buffered_input(&self) -> bool {
        !self.read_buf.is_empty()
    }

    /// Unwraps the transport along with any unconsumed buffered bytes.
    pub(crate) fn into_parts(self) -> (T, BytesMut) {
        (self.io, self.read_buf)
    }
}

impl<T> BufferedIo<T>
where
    T: AsyncRead + Unpin,
{
    pub(crate) fn new(io: T) -> BufferedIo<T> {
        BufferedIo {
            io,
            read_buf: BytesMut::with_capacity(INIT_BUFFER_SIZE),
        }
    }

    /// Reads more bytes from the transport. Returns the number read; zero
    /// means clean EOF.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        if self.read_buf.capacity() - self.read_buf.len() < 1024 {
            self.read_buf.reserve(INIT_BUFFER_SIZE);
        }
        self.io.read_buf(&mut self.read_buf).await
    }

    /// Ensures at least `n` unconsumed bytes are buffered.
    pub(crate) async fn fill_to(&mut self, n: usize) -> io::Result<()> {
        while self.read_buf.len() < n {
            if self.fill().await? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
        }
        Ok(())
    }
}

impl<T> BufferedIo<T>
where
    T: AsyncWrite + Unpin,
{
    pub(crate) async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.io.write_all(buf).await
    }

    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        self.io.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fill_to_reads_exactly_enough() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut buffered = BufferedIo::new(client);
        tokio::spawn(async move {
            server.write_all(b"hello world").await.unwrap();
        });
        buffered.fill_to(5).await.unwrap();
        assert!(buffered.data().len() >= 5);
        let taken = buffered.take(5);
        assert_eq!(&taken[..], b"hello");
    }

    #[tokio::test]
    async fn eof_is_reported() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut buffered = BufferedIo::new(client);
        assert_eq!(buffered.fill().await.unwrap(), 0);
    }
}
