//! Stream feature negotiation (RFC 6120 §4.3).
//!
//! Drives the restart loop from the first `<stream:stream>` to a bound,
//! authenticated session: STARTTLS first, then zlib compression, then
//! SASL, each followed by a stream restart, and finally resource binding
//! plus the legacy session IQ. Progress flags accumulate across restarts
//! so an already-secured layer is never negotiated twice.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::account::{Account, ConnectConfig};
use crate::codec::{parse_tree, Element, Frame, STREAMS_NS};
use crate::error::{Result, XmppError};
use crate::jid;
use crate::sasl;
use crate::transport::Transport;

pub const TLS_NS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const BIND_NS: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const SESSION_NS: &str = "urn:ietf:params:xml:ns:xmpp-session";
/// Roster versioning stream feature (RFC 6121 §2.6).
pub const ROSTERVER_NS: &str = "urn:xmpp:features:rosterver";
/// Feature announcement namespace for stream compression (XEP-0138).
pub const COMPRESS_FEATURE_NS: &str = "http://jabber.org/features/compress";
/// Protocol namespace the client uses to request compression.
pub const COMPRESS_PROTOCOL_NS: &str = "http://jabber.org/protocol/compress";

/// Restart ceiling; a conforming negotiation needs at most four streams
/// (initial, post-TLS, post-compression, post-SASL).
const MAX_STREAM_RESTARTS: u32 = 8;

/// A fully negotiated stream, ready for the stanza pump.
#[derive(Debug)]
pub struct Session {
    pub transport: Transport,
    /// Full JID confirmed by resource binding. The server may have
    /// rewritten the requested resource.
    pub full_jid: String,
    /// The `id` attribute of the server's final stream header.
    pub stream_id: Option<String>,
    /// Whether the server advertised roster versioning. Hosts that fetch
    /// the roster can pass a cached version when this is set.
    pub rosterver: bool,
}

#[derive(Debug, Default)]
struct Features {
    starttls: bool,
    compression_zlib: bool,
    mechanisms: Vec<String>,
    bind: bool,
    session: bool,
    rosterver: bool,
}

fn parse_features(element: &Element) -> Features {
    let mut features = Features::default();
    features.starttls = element.has_child(Some(TLS_NS), Some("starttls"));
    features.bind = element.has_child(Some(BIND_NS), Some("bind"));
    features.session = element.has_child(Some(SESSION_NS), Some("session"));
    features.rosterver = element.has_child(Some(ROSTERVER_NS), Some("ver"));
    if let Some(compression) = element.first_child(Some(COMPRESS_FEATURE_NS), Some("compression")) {
        features.compression_zlib = compression
            .children_named(None, Some("method"))
            .any(|m| m.text().trim() == "zlib");
    }
    if let Some(mechanisms) = element.first_child(Some(sasl::SASL_NS), Some("mechanisms")) {
        features.mechanisms = mechanisms
            .children_named(None, Some("mechanism"))
            .map(|m| m.text().trim().to_string())
            .collect();
    }
    features
}

fn stream_open(domain: &str) -> String {
    format!(
        "<?xml version='1.0'?><stream:stream to='{domain}' xmlns='jabber:client' \
         xmlns:stream='{STREAMS_NS}' version='1.0'>"
    )
}

/// Negotiate all stream features over a freshly connected transport.
pub async fn negotiate(
    mut transport: Transport,
    account: &Account,
    config: &ConnectConfig,
) -> Result<Session> {
    let domain = account.domain().to_string();
    let username = jid::local_part(&account.jid)
        .ok_or_else(|| XmppError::sasl(format!("jid '{}' has no local part", account.jid)))?;
    let credentials = sasl::AccountCredentials::new(username, &account.password, &domain);
    let timeout = Duration::from_secs(config.negotiation_timeout_secs);

    let mut tls_done = false;
    let mut compressed = false;
    let mut authenticated = false;
    let mut stream_id = None;

    for _restart in 0..MAX_STREAM_RESTARTS {
        transport.send_raw(&stream_open(&domain)).await?;
        let features = read_features(&mut transport, timeout, &mut stream_id).await?;

        if features.starttls && !tls_done {
            transport
                .send_raw(&format!("<starttls xmlns='{TLS_NS}'/>"))
                .await?;
            expect_proceed(&mut transport, timeout).await?;
            transport = transport.upgrade_tls(config.tls).await?;
            tls_done = true;
            continue;
        }

        if features.compression_zlib && config.compression && !compressed {
            transport
                .send_raw(&format!(
                    "<compress xmlns='{COMPRESS_PROTOCOL_NS}'><method>zlib</method></compress>"
                ))
                .await?;
            if expect_compressed(&mut transport, timeout).await? {
                transport = transport.enable_compression()?;
                compressed = true;
                continue;
            }
            // The server refused; carry on uncompressed. The flag stops us
            // from asking again on the same stream generation.
            compressed = true;
        }

        if !features.mechanisms.is_empty() && !authenticated {
            sasl::authenticate(&mut transport, &credentials, &features.mechanisms, timeout)
                .await?;
            authenticated = true;
            continue;
        }

        if authenticated {
            if !features.bind {
                return Err(XmppError::transport(
                    "server offers no resource binding after authentication",
                ));
            }
            let full_jid = bind_resource(&mut transport, &account.resource, timeout).await?;
            if features.session {
                establish_session(&mut transport, timeout).await?;
            }
            info!(jid = %full_jid, stream_id = ?stream_id, "stream negotiated");
            return Ok(Session {
                transport,
                full_jid,
                stream_id,
                rosterver: features.rosterver,
            });
        }

        return Err(XmppError::transport(
            "server offers no authentication mechanisms",
        ));
    }
    Err(XmppError::malformed("stream restart loop did not converge"))
}

/// Read past the stream header to the `<stream:features>` element. Other
/// stanzas arriving first are discarded with a warning.
async fn read_features(
    transport: &mut Transport,
    timeout: Duration,
    stream_id: &mut Option<String>,
) -> Result<Features> {
    loop {
        match transport.read_frame_timeout(timeout).await? {
            Frame::StreamOpen(header) => {
                if let Some(element) = parse_stream_header(&header) {
                    *stream_id = element.attribute_value("id").map(str::to_string);
                }
                debug!(header = %header, "stream header received");
            }
            Frame::StreamClose => {
                return Err(XmppError::transport("stream closed during negotiation"))
            }
            Frame::Stanza(xml) => {
                let element = parse_tree(&xml)?;
                if element.namespace == STREAMS_NS && element.name == "features" {
                    return Ok(parse_features(&element));
                }
                if element.namespace == STREAMS_NS && element.name == "error" {
                    return Err(XmppError::transport(format!("stream error: {xml}")));
                }
                warn!(stanza = %xml, "discarding stanza received before stream features");
            }
        }
    }
}

/// Parse the stream header's attributes (id, from, version, xml:lang). The
/// opening tag arrives unclosed; complete it so the tree parser accepts it.
fn parse_stream_header(header: &str) -> Option<Element> {
    parse_tree(&format!("{header}</stream:stream>")).ok()
}

async fn expect_proceed(transport: &mut Transport, timeout: Duration) -> Result<()> {
    let frame = transport.read_frame_timeout(timeout).await?;
    let Frame::Stanza(xml) = frame else {
        return Err(XmppError::malformed("expected <proceed/>, stream ended"));
    };
    let element = parse_tree(&xml)?;
    match (element.namespace.as_str(), element.name.as_str()) {
        (TLS_NS, "proceed") => Ok(()),
        (TLS_NS, "failure") => Err(XmppError::transport("server refused STARTTLS")),
        _ => Err(XmppError::malformed(format!(
            "expected <proceed/>, got <{}>",
            element.name
        ))),
    }
}

/// `Ok(true)` when the server accepted compression, `Ok(false)` when it
/// sent a compression failure element.
async fn expect_compressed(transport: &mut Transport, timeout: Duration) -> Result<bool> {
    let frame = transport.read_frame_timeout(timeout).await?;
    let Frame::Stanza(xml) = frame else {
        return Err(XmppError::malformed("expected <compressed/>, stream ended"));
    };
    let element = parse_tree(&xml)?;
    match (element.namespace.as_str(), element.name.as_str()) {
        (COMPRESS_PROTOCOL_NS, "compressed") => Ok(true),
        (COMPRESS_PROTOCOL_NS, "failure") => {
            warn!("server refused zlib compression, continuing uncompressed");
            Ok(false)
        }
        _ => Err(XmppError::malformed(format!(
            "expected <compressed/>, got <{}>",
            element.name
        ))),
    }
}

/// Bind the resource, returning the server-confirmed full JID.
async fn bind_resource(
    transport: &mut Transport,
    resource: &str,
    timeout: Duration,
) -> Result<String> {
    let id = format!("bind-{:08x}", rand::random::<u32>());
    let iq = if resource.is_empty() {
        format!("<iq type='set' id='{id}'><bind xmlns='{BIND_NS}'/></iq>")
    } else {
        format!(
            "<iq type='set' id='{id}'><bind xmlns='{BIND_NS}'><resource>{}</resource></bind></iq>",
            crate::codec::escape_text(resource)
        )
    };
    transport.send_raw(&iq).await?;

    let reply = read_iq_reply(transport, &id, timeout).await?;
    if reply.attribute_value("type") != Some("result") {
        return Err(XmppError::transport(format!(
            "resource binding failed: {:?}",
            reply.attribute_value("type")
        )));
    }
    let jid = reply
        .first_child(Some(BIND_NS), Some("bind"))
        .and_then(|bind| bind.first_child(None, Some("jid")))
        .map(|jid| jid.text().trim().to_string())
        .ok_or_else(|| XmppError::malformed("bind result carries no jid"))?;
    if jid.is_empty() {
        return Err(XmppError::malformed("bind result carries an empty jid"));
    }
    Ok(jid)
}

/// Legacy session establishment (RFC 3921 §3). Errors are tolerated:
/// modern servers advertise the feature only for compatibility.
async fn establish_session(transport: &mut Transport, timeout: Duration) -> Result<()> {
    let id = format!("sess-{:08x}", rand::random::<u32>());
    transport
        .send_raw(&format!(
            "<iq type='set' id='{id}'><session xmlns='{SESSION_NS}'/></iq>"
        ))
        .await?;
    let reply = read_iq_reply(transport, &id, timeout).await?;
    if reply.attribute_value("type") != Some("result") {
        warn!("session establishment refused, continuing without it");
    }
    Ok(())
}

/// Read until the IQ reply matching `id` arrives, discarding interleaved
/// stanzas (the server may already push presence or roster data).
async fn read_iq_reply(transport: &mut Transport, id: &str, timeout: Duration) -> Result<Element> {
    loop {
        match transport.read_frame_timeout(timeout).await? {
            Frame::StreamOpen(_) => {
                return Err(XmppError::malformed("unexpected stream restart"))
            }
            Frame::StreamClose => {
                return Err(XmppError::transport("stream closed awaiting IQ reply"))
            }
            Frame::Stanza(xml) => {
                let element = parse_tree(&xml)?;
                if element.name == "iq" && element.attribute_value("id") == Some(id) {
                    return Ok(element);
                }
                debug!(stanza = %xml, "discarding stanza received while awaiting IQ reply");
            }
        }
    }
}
