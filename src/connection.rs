//! A live, fully negotiated XMPP connection.
//!
//! [`Connection::open`] resolves, connects and negotiates, then spawns the
//! inbound pump task: frames are parsed into [`Stanza`]s, tagged with the
//! connection's full JID as `via`, and pushed into the caller's channel.
//! Sending never reports an error value: a failed write closes the
//! connection and returns `false`, and the owner decides what to do about
//! the dead connection on its next tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::account::{Account, ConnectConfig};
use crate::codec::{self, Frame};
use crate::dns;
use crate::error::Result;
use crate::negotiate;
use crate::stanza::Stanza;
use crate::transport::{LastReceive, Transport, TransportWriter};

/// XEP-0199 ping namespace, answered directly by the pump.
pub const PING_NS: &str = "urn:xmpp:ping";

struct Inner {
    full_jid: String,
    writer: Mutex<TransportWriter>,
    last_receive: LastReceive,
    closed: AtomicBool,
    cancel: CancellationToken,
}

/// Cheap-to-clone handle on one negotiated stream.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Resolve the account's connection spec, connect, negotiate, and
    /// start pumping inbound stanzas into `inbound`.
    pub async fn open(
        account: &Account,
        config: &ConnectConfig,
        inbound: mpsc::Sender<Stanza>,
    ) -> Result<Connection> {
        let endpoints = dns::resolve_endpoints(&account.connection).await?;
        let transport = Transport::connect(
            &endpoints,
            Duration::from_secs(config.connect_timeout_secs),
        )
        .await?;
        Self::over_transport(transport, account, config, inbound).await
    }

    /// Negotiate over an already connected transport. Separated from
    /// [`Connection::open`] so tests can drive a loopback stream.
    pub async fn over_transport(
        transport: Transport,
        account: &Account,
        config: &ConnectConfig,
        inbound: mpsc::Sender<Stanza>,
    ) -> Result<Connection> {
        let session = negotiate::negotiate(transport, account, config).await?;
        let negotiate::Session {
            transport,
            full_jid,
            stream_id: _,
            rosterver: _,
        } = session;
        let last_receive = transport.last_receive();
        let (reader, writer) = transport.into_parts();

        let inner = Arc::new(Inner {
            full_jid,
            writer: Mutex::new(writer),
            last_receive,
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        let connection = Connection { inner };
        connection.spawn_pump(reader, inbound);
        Ok(connection)
    }

    fn spawn_pump(&self, mut reader: crate::transport::TransportReader, inbound: mpsc::Sender<Stanza>) {
        let connection = self.clone();
        tokio::spawn(async move {
            let jid = connection.inner.full_jid.clone();
            loop {
                let frame = tokio::select! {
                    _ = connection.inner.cancel.cancelled() => break,
                    frame = reader.read_frame() => frame,
                };
                match frame {
                    Ok(Frame::Stanza(xml)) => {
                        let mut stanza = match codec::read_stanza(&xml) {
                            Ok(stanza) => stanza,
                            Err(e) => {
                                warn!(jid = %jid, error = %e, "malformed stanza, closing stream");
                                break;
                            }
                        };
                        stanza.set_via(&jid);
                        if connection.answer_ping(&stanza).await {
                            continue;
                        }
                        if inbound.send(stanza).await.is_err() {
                            debug!(jid = %jid, "stanza receiver dropped, stopping pump");
                            break;
                        }
                    }
                    Ok(Frame::StreamClose) => {
                        info!(jid = %jid, "server closed the stream");
                        break;
                    }
                    Ok(Frame::StreamOpen(_)) => {
                        warn!(jid = %jid, "unexpected stream restart, closing");
                        break;
                    }
                    Err(e) => {
                        debug!(jid = %jid, error = %e, "read failed, closing");
                        break;
                    }
                }
            }
            connection.shutdown().await;
        });
    }

    /// Reply to an XEP-0199 ping addressed at this session. Returns true
    /// when the stanza was consumed.
    async fn answer_ping(&self, stanza: &Stanza) -> bool {
        if stanza.name() != "iq" || stanza.attribute_value("type") != Some("get") {
            return false;
        }
        if !stanza.xml().contains(PING_NS) {
            return false;
        }
        let Ok(element) = codec::parse_tree(stanza.xml()) else {
            return false;
        };
        if !element.has_child(Some(PING_NS), Some("ping")) {
            return false;
        }
        let id = stanza.attribute_value("id").unwrap_or("");
        let to = stanza.attribute_value("from").map(str::to_string);
        let mut reply = format!("<iq type='result' id='{}'", codec::escape_text(id));
        if let Some(to) = to {
            reply.push_str(&format!(" to='{}'", codec::escape_text(&to)));
        }
        reply.push_str("/>");
        debug!(jid = %self.inner.full_jid, "answering ping");
        self.send_raw(&reply).await;
        true
    }

    /// Full JID confirmed by resource binding.
    pub fn full_jid(&self) -> &str {
        &self.inner.full_jid
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Shared last-receive timestamp for idle accounting.
    pub fn last_receive(&self) -> LastReceive {
        self.inner.last_receive.clone()
    }

    /// Serialize and send one stanza. Returns `false` on any failure, in
    /// which case the connection is closed as a side effect: a stream that
    /// lost bytes mid-stanza cannot be resynchronized.
    pub async fn send(&self, stanza: &Stanza) -> bool {
        if self.is_closed() {
            return false;
        }
        let xml = match codec::write_stanza(stanza) {
            Ok(xml) => xml,
            Err(e) => {
                warn!(jid = %self.inner.full_jid, error = %e, "stanza serialization failed");
                return false;
            }
        };
        self.send_raw(&xml).await
    }

    async fn send_raw(&self, xml: &str) -> bool {
        let mut writer = self.inner.writer.lock().await;
        match writer.send_raw(xml).await {
            Ok(()) => true,
            Err(e) => {
                warn!(jid = %self.inner.full_jid, error = %e, "write failed, closing connection");
                drop(writer);
                self.shutdown().await;
                false
            }
        }
    }

    /// Close the stream and stop the pump. Idempotent.
    pub async fn close(&self) {
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        let mut writer = self.inner.writer.lock().await;
        writer.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("full_jid", &self.inner.full_jid)
            .field("closed", &self.is_closed())
            .finish()
    }
}
