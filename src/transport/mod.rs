//! Byte transport under the XMPP stream.
//!
//! A [`Transport`] owns the socket (plain TCP, TLS, or zlib-compressed, in
//! any combination the negotiation produced), an inbound byte buffer and
//! the framing logic that slices it into [`Frame`]s. STARTTLS and
//! compression swap the underlying stream wholesale; both consume the
//! transport and hand back a new one over the wrapped socket.

pub mod compress;
pub mod tls;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::codec::{self, Frame};
use crate::dns::Endpoint;
use crate::error::{Result, XmppError};

/// Object-safe duplex byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed stream, so TLS and compression wrappers compose.
pub type BoxStream = Box<dyn AsyncStream>;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Timestamp of the last inbound bytes, shared with the scheduler's idle
/// checks. Updated on every successful socket read.
#[derive(Debug, Clone)]
pub struct LastReceive(Arc<AtomicU64>);

impl LastReceive {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(now_ms())))
    }

    pub fn touch(&self) {
        self.0.store(now_ms(), Ordering::Relaxed);
    }

    pub fn millis(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Seconds elapsed since the last inbound bytes, relative to `now`.
    pub fn idle_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.millis()) / 1000
    }
}

impl Default for LastReceive {
    fn default() -> Self {
        Self::new()
    }
}

/// The socket plus inbound framing buffer.
pub struct Transport {
    stream: BoxStream,
    buffer: Vec<u8>,
    last_receive: LastReceive,
    /// Hostname for TLS verification if STARTTLS is negotiated.
    tls_name: String,
}

impl Transport {
    /// Walk the endpoint candidates in order and return a transport over
    /// the first one that accepts a TCP connection within `timeout`.
    pub async fn connect(endpoints: &[Endpoint], timeout: Duration) -> Result<Transport> {
        let mut last_error: Option<XmppError> = None;
        for endpoint in endpoints {
            let address = format!("{}:{}", endpoint.host, endpoint.port);
            debug!(%address, "connecting");
            match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(true).ok();
                    info!(%address, "connected");
                    return Ok(Transport::new(Box::new(stream), endpoint.tls_name()));
                }
                Ok(Err(e)) => {
                    warn!(%address, error = %e, "connect failed");
                    last_error = Some(XmppError::with_source(
                        crate::error::ErrorKind::Transport,
                        format!("connect to {address} failed"),
                        e,
                    ));
                }
                Err(_) => {
                    warn!(%address, timeout_secs = timeout.as_secs(), "connect timed out");
                    last_error = Some(XmppError::transport(format!(
                        "connect to {address} timed out"
                    )));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| XmppError::transport("no endpoints to connect to")))
    }

    pub fn new(stream: BoxStream, tls_name: impl Into<String>) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(8 * 1024),
            last_receive: LastReceive::new(),
            tls_name: tls_name.into(),
        }
    }

    pub fn tls_name(&self) -> &str {
        &self.tls_name
    }

    pub fn last_receive(&self) -> LastReceive {
        self.last_receive.clone()
    }

    /// Write raw bytes and flush. Stream headers and negotiation elements
    /// go through here; stanzas are serialized by the caller first.
    pub async fn send_raw(&mut self, xml: &str) -> Result<()> {
        self.stream.write_all(xml.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read the next complete frame, buffering partial stanzas across
    /// socket reads. EOF from the peer is a transport error.
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some((frame, consumed)) = codec::next_frame(&self.buffer)? {
                self.buffer.drain(..consumed);
                return Ok(frame);
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(XmppError::transport("connection closed by peer"));
            }
            self.last_receive.touch();
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read the next frame with a deadline, for negotiation steps that
    /// must not hang on a mute server.
    pub async fn read_frame_timeout(&mut self, timeout: Duration) -> Result<Frame> {
        tokio::time::timeout(timeout, self.read_frame())
            .await
            .map_err(|_| XmppError::transport("negotiation read timed out"))?
    }

    /// Upgrade to TLS after `<proceed/>`. The framing buffer must be empty:
    /// any pre-TLS bytes past the proceed element are a protocol violation.
    pub async fn upgrade_tls(self, policy: tls::TlsPolicy) -> Result<Transport> {
        if !self.buffer.is_empty() {
            return Err(XmppError::malformed("plaintext bytes after <proceed/>"));
        }
        let Transport {
            stream,
            last_receive,
            tls_name,
            ..
        } = self;
        let stream = tls::upgrade(stream, &tls_name, policy).await?;
        info!(server = %tls_name, "TLS established");
        Ok(Transport {
            stream,
            buffer: Vec::with_capacity(8 * 1024),
            last_receive,
            tls_name,
        })
    }

    /// Wrap the stream in zlib compression after `<compressed/>`.
    pub fn enable_compression(self) -> Result<Transport> {
        if !self.buffer.is_empty() {
            return Err(XmppError::malformed("uncompressed bytes after <compressed/>"));
        }
        let Transport {
            stream,
            last_receive,
            tls_name,
            ..
        } = self;
        info!(server = %tls_name, "zlib compression enabled");
        Ok(Transport {
            stream: Box::new(compress::ZlibStream::new(stream)),
            buffer: Vec::with_capacity(8 * 1024),
            last_receive,
            tls_name,
        })
    }

    /// Split into raw halves for the post-negotiation pump. The inbound
    /// buffer carries over any bytes read past the last negotiation frame.
    pub fn into_parts(self) -> (TransportReader, TransportWriter) {
        let (read, write) = tokio::io::split(self.stream);
        (
            TransportReader {
                read,
                buffer: self.buffer,
                last_receive: self.last_receive.clone(),
            },
            TransportWriter { write },
        )
    }
}

// The boxed stream has no useful representation of its own.
impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("tls_name", &self.tls_name)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

/// Read half after negotiation, used by the inbound pump task.
pub struct TransportReader {
    read: tokio::io::ReadHalf<BoxStream>,
    buffer: Vec<u8>,
    last_receive: LastReceive,
}

impl TransportReader {
    pub async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some((frame, consumed)) = codec::next_frame(&self.buffer)? {
                self.buffer.drain(..consumed);
                return Ok(frame);
            }
            let mut chunk = [0u8; 4096];
            let n = self.read.read(&mut chunk).await?;
            if n == 0 {
                return Err(XmppError::transport("connection closed by peer"));
            }
            self.last_receive.touch();
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Write half after negotiation, shared behind a mutex by senders.
pub struct TransportWriter {
    write: tokio::io::WriteHalf<BoxStream>,
}

impl TransportWriter {
    pub async fn send_raw(&mut self, xml: &str) -> Result<()> {
        self.write.write_all(xml.as_bytes()).await?;
        self.write.flush().await?;
        Ok(())
    }

    /// Best-effort `</stream:stream>` then socket shutdown.
    pub async fn close(&mut self) {
        let _ = self.write.write_all(b"</stream:stream>").await;
        let _ = self.write.flush().await;
        let _ = self.write.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connect_walks_candidates_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoints = vec![
            // A port nothing listens on; connect must fall through.
            Endpoint {
                host: "127.0.0.1".into(),
                port: 1,
                domain: None,
            },
            Endpoint {
                host: "127.0.0.1".into(),
                port,
                domain: Some("example.com".into()),
            },
        ];
        let transport = Transport::connect(&endpoints, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(transport.tls_name(), "example.com");
    }

    #[tokio::test]
    async fn connect_reports_failure_when_all_candidates_fail() {
        let endpoints = vec![Endpoint {
            host: "127.0.0.1".into(),
            port: 1,
            domain: None,
        }];
        let err = Transport::connect(&endpoints, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn read_frame_reassembles_fragments() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // One stanza split across three writes.
            for part in [&b"<message to='a"[..], b"@b'><body>hi</b", b"ody></message><presence/>"] {
                socket.write_all(part).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            socket
        });

        let stream = TcpStream::connect(address).await.unwrap();
        let mut transport = Transport::new(Box::new(stream), "example.com");
        let frame = transport.read_frame().await.unwrap();
        let Frame::Stanza(xml) = frame else { panic!() };
        assert!(xml.ends_with("</message>"));
        let frame = transport.read_frame().await.unwrap();
        assert_eq!(frame, Frame::Stanza("<presence/>".to_string()));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn garbage_bytes_are_a_malformed_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // Ill-formed markup that no amount of further bytes can fix.
            socket.write_all(b"<!DOCTYPE>").await.unwrap();
            socket.flush().await.unwrap();
            socket
        });

        let stream = TcpStream::connect(address).await.unwrap();
        let mut transport = Transport::new(Box::new(stream), "example.com");
        let err = transport.read_frame().await.unwrap_err();
        assert!(err.is_malformed());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn read_frame_timeout_fires_on_mute_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let stream = TcpStream::connect(address).await.unwrap();
        let mut transport = Transport::new(Box::new(stream), "example.com");
        let err = transport
            .read_frame_timeout(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        server.abort();
    }

    #[tokio::test]
    async fn eof_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let stream = TcpStream::connect(address).await.unwrap();
        let mut transport = Transport::new(Box::new(stream), "example.com");
        let err = transport.read_frame().await.unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn idle_seconds_from_last_receive() {
        let last = LastReceive::new();
        let now = last.millis();
        assert_eq!(last.idle_secs(now + 61_000), 61);
        assert_eq!(last.idle_secs(now), 0);
        // Clock going backwards must not underflow.
        assert_eq!(last.idle_secs(now.saturating_sub(5_000)), 0);
    }
}
