//! zlib stream compression (XEP-0138).
//!
//! Wraps the socket in a deflate/inflate pair once `<compressed/>` is
//! received. Every write is flushed with a zlib sync flush so that small
//! negotiation elements and keepalive pings reach the server immediately
//! instead of sitting in the compressor's window.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const CHUNK: usize = 8 * 1024;

/// A duplex stream that deflates writes and inflates reads.
pub struct ZlibStream<S> {
    inner: S,
    deflate: Compress,
    inflate: Decompress,
    /// Compressed bytes read from the socket, not yet inflated.
    read_pending: Vec<u8>,
    /// Deflated bytes not yet written to the socket.
    write_pending: Vec<u8>,
    write_offset: usize,
}

impl<S> ZlibStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            deflate: Compress::new(Compression::default(), true),
            inflate: Decompress::new(true),
            read_pending: Vec::new(),
            write_pending: Vec::new(),
            write_offset: 0,
        }
    }

    /// Inflate buffered compressed bytes into `buf`. Returns the number of
    /// plaintext bytes produced.
    fn inflate_pending(&mut self, buf: &mut ReadBuf<'_>) -> io::Result<usize> {
        if self.read_pending.is_empty() {
            return Ok(0);
        }
        let before_in = self.inflate.total_in();
        let before_out = self.inflate.total_out();
        let status = self
            .inflate
            .decompress(&self.read_pending, buf.initialize_unfilled(), FlushDecompress::None)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if status == Status::StreamEnd {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "zlib stream ended",
            ));
        }
        let consumed = (self.inflate.total_in() - before_in) as usize;
        let produced = (self.inflate.total_out() - before_out) as usize;
        self.read_pending.drain(..consumed);
        buf.advance(produced);
        Ok(produced)
    }

    /// Deflate `data` with a sync flush into the pending write buffer.
    fn deflate_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut consumed_total = 0;
        loop {
            let before_in = self.deflate.total_in();
            let before_out = self.deflate.total_out();
            let mut chunk = vec![0u8; CHUNK];
            self.deflate
                .compress(&data[consumed_total..], &mut chunk, FlushCompress::Sync)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let consumed = (self.deflate.total_in() - before_in) as usize;
            let produced = (self.deflate.total_out() - before_out) as usize;
            consumed_total += consumed;
            self.write_pending.extend_from_slice(&chunk[..produced]);
            // A sync flush is complete once the compressor neither consumes
            // input nor fills the whole output chunk.
            if consumed_total == data.len() && produced < CHUNK {
                return Ok(());
            }
            if consumed == 0 && produced == 0 {
                return Ok(());
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> ZlibStream<S> {
    /// Push pending deflated bytes to the socket. Ready(Ok) once drained.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_offset < self.write_pending.len() {
            let n = std::task::ready!(Pin::new(&mut self.inner)
                .poll_write(cx, &self.write_pending[self.write_offset..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket closed while flushing compressed data",
                )));
            }
            self.write_offset += n;
        }
        self.write_pending.clear();
        self.write_offset = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ZlibStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.inflate_pending(buf)? > 0 {
                return Poll::Ready(Ok(()));
            }
            let mut chunk = [0u8; CHUNK];
            let mut chunk_buf = ReadBuf::new(&mut chunk);
            std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk_buf))?;
            if chunk_buf.filled().is_empty() {
                // Socket EOF. Anything left in read_pending is a truncated
                // deflate block; surface EOF and let framing report it.
                return Poll::Ready(Ok(()));
            }
            this.read_pending.extend_from_slice(chunk_buf.filled());
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ZlibStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_drain(cx))?;
        this.deflate_all(data)?;
        // Bytes are owned by write_pending now; report them accepted and
        // push opportunistically.
        let _ = this.poll_drain(cx)?;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn round_trips_over_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut client = ZlibStream::new(client);
        let mut server = ZlibStream::new(server);

        let payload = b"<message to='a@b'><body>compressed hello</body></message>";
        client.write_all(payload).await.unwrap();
        client.flush().await.unwrap();

        let mut received = vec![0u8; payload.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, payload);
    }

    #[tokio::test]
    async fn sync_flush_delivers_each_write_immediately() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let mut client = ZlibStream::new(client);
        let mut server = ZlibStream::new(server);

        // Without a sync flush the second side would block waiting for more
        // compressed input. Each write must be independently readable.
        for stanza in ["<presence/>", "<iq type='get' id='ping-1'/>", "<a/>"] {
            client.write_all(stanza.as_bytes()).await.unwrap();
            client.flush().await.unwrap();
            let mut buf = vec![0u8; stanza.len()];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, stanza.as_bytes());
        }
    }

    #[tokio::test]
    async fn large_payload_crosses_chunk_boundaries() {
        let (client, server) = tokio::io::duplex(1024 * 1024);
        let mut client = ZlibStream::new(client);
        let mut server = ZlibStream::new(server);

        // Poorly compressible payload well past the internal chunk size.
        let payload: Vec<u8> =
            (0..100_000u32).map(|i| (i.wrapping_mul(2654435761) % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.flush().await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }
}
